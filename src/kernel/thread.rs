//! Thread lifecycle
//!
//! Threads are the execution contexts of a process. Each one is identified
//! by its thread block (`Ptcb`), which carries the entry routine and its
//! argument payload, the exit value, and the join/detach state machine:
//!
//! ```text
//!   Live ──┬──> Exited    (thread_exit; value retrievable by joiners)
//!          └──> Detached  (thread_detach; joiners fail, value discarded)
//! ```
//!
//! Exited and Detached are terminal with respect to further detach/exit,
//! though a detached thread still flips `exited` when it eventually
//! retires. The block itself outlives the thread while joiners hold
//! references; it is unlinked and freed exactly once, when `exited` is set
//! and the waiter count is back to zero.
//!
//! When the last thread of a process exits, the exit cascade reparents the
//! process's children to init, hands its zombie children over, notifies
//! the parent, and releases every open object before the thread retires.

use super::process::{Pid, ProcessState};
use super::socket;
use super::sync::{Condv, SchedClass};
use super::{Kernel, KernelState, Sys};
use std::panic::{self, AssertUnwindSafe};

/// Thread identifier - the handle callers use to join or detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub usize);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// Entry routine of a thread.
pub type TaskFn = Box<dyn FnOnce(&Sys, Vec<u8>) -> i32 + Send + 'static>;

/// An entry routine plus its opaque argument payload. Stored in the
/// thread block at creation and taken back out by the spawned context.
pub struct TaskEntry {
    pub(crate) call: TaskFn,
    pub(crate) args: Vec<u8>,
}

impl TaskEntry {
    pub fn new(call: impl FnOnce(&Sys, Vec<u8>) -> i32 + Send + 'static) -> Self {
        Self {
            call: Box::new(call),
            args: Vec::new(),
        }
    }

    pub fn with_args(call: impl FnOnce(&Sys, Vec<u8>) -> i32 + Send + 'static, args: Vec<u8>) -> Self {
        Self {
            call: Box::new(call),
            args,
        }
    }
}

/// Error types for thread operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadError {
    /// Id does not resolve to a thread block
    NoSuchThread,
    /// Thread belongs to another process
    ForeignThread,
    /// A thread may not join itself
    SelfJoin,
    /// Target is detached; no exit value will ever be produced
    Detached,
    /// Detach after exit; the exit value must stay retrievable
    AlreadyExited,
}

impl std::fmt::Display for ThreadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadError::NoSuchThread => write!(f, "no such thread"),
            ThreadError::ForeignThread => write!(f, "thread belongs to another process"),
            ThreadError::SelfJoin => write!(f, "thread cannot join itself"),
            ThreadError::Detached => write!(f, "thread is detached"),
            ThreadError::AlreadyExited => write!(f, "thread already exited"),
        }
    }
}

impl std::error::Error for ThreadError {}

/// Result type for thread operations
pub type ThreadResult<T> = Result<T, ThreadError>;

/// Panic payload used by `thread_exit` to unwind back to the trampoline.
/// The kernel's panic hook keeps it out of stderr.
pub(crate) struct ThreadRetire;

/// Per-thread control block.
pub struct Ptcb {
    /// Owning process
    pub owner: Pid,
    /// Entry routine and argument payload; taken once by the trampoline
    task: Option<TaskEntry>,
    /// Exit value, meaningful once `exited` is set
    pub exitval: i32,
    /// Thread has retired; exit value is final
    pub exited: bool,
    /// Joiners fail; exit value is discarded
    pub detached: bool,
    /// Number of joiners currently referencing this block
    pub refcount: u32,
    /// Broadcast on exit and on detach
    pub exit_cv: Condv,
}

impl Ptcb {
    pub(crate) fn new(owner: Pid, task: TaskEntry) -> Self {
        Self {
            owner,
            task: Some(task),
            exitval: 0,
            exited: false,
            detached: false,
            refcount: 0,
            exit_cv: Condv::new(),
        }
    }
}

impl Sys {
    /// Create a new thread in the calling process.
    ///
    /// The thread block is fully linked into the process before the new
    /// context can observe it, so the spawned thread always finds its
    /// entry routine in place.
    pub fn create_thread(&self, entry: TaskEntry) -> ThreadId {
        let mut st = self.kernel.lock();
        let tid = ThreadId(st.threads.insert(Ptcb::new(self.pid, entry)));
        let proc = st
            .processes
            .get_mut(&self.pid)
            .expect("calling process vanished");
        proc.threads.push(tid);
        proc.thread_count += 1;
        log::trace!("{}: created {tid}", self.pid);
        spawn_kernel_thread(&mut st, &self.kernel, self.pid, tid);
        tid
    }

    /// The calling thread's own identifier.
    pub fn thread_self(&self) -> ThreadId {
        self.tid
    }

    /// Wait for a thread of the calling process to exit and collect its
    /// exit value.
    ///
    /// Concurrent joiners are each admitted; every one of them receives
    /// the exit value, and the block is freed by whichever reference
    /// leaves last. A joiner woken by detach fails without a value.
    pub fn thread_join(&self, tid: ThreadId, exitval: Option<&mut i32>) -> ThreadResult<()> {
        let mut st = self.kernel.lock();
        let t = st.threads.get(tid.0).ok_or(ThreadError::NoSuchThread)?;
        if t.owner != self.pid {
            return Err(ThreadError::ForeignThread);
        }
        if tid == self.tid {
            return Err(ThreadError::SelfJoin);
        }
        if t.detached {
            return Err(ThreadError::Detached);
        }

        let cv = t.exit_cv.clone();
        st.threads
            .get_mut(tid.0)
            .expect("checked above")
            .refcount += 1;

        loop {
            let t = st
                .threads
                .get(tid.0)
                .expect("joined block freed with waiters outstanding");
            if t.exited || t.detached {
                break;
            }
            st = cv.wait(st, SchedClass::User);
        }

        let t = st.threads.get_mut(tid.0).expect("checked in loop");
        assert!(t.refcount > 0, "join refcount underflow");
        t.refcount -= 1;

        // Detach wins over a racing exit: every joiner that was blocked
        // when the detach happened fails without touching the value.
        let result = if t.detached {
            Err(ThreadError::Detached)
        } else {
            if let Some(slot) = exitval {
                *slot = t.exitval;
            }
            Ok(())
        };

        if t.exited && t.refcount == 0 {
            release_ptcb(&mut st, tid);
        }
        result
    }

    /// Detach a thread of the calling process.
    ///
    /// Every blocked joiner wakes, observes the detach, and fails. An
    /// exited thread cannot be detached - its exit value must remain
    /// retrievable by joiners already on their way.
    pub fn thread_detach(&self, tid: ThreadId) -> ThreadResult<()> {
        let mut st = self.kernel.lock();
        let t = st.threads.get_mut(tid.0).ok_or(ThreadError::NoSuchThread)?;
        if t.owner != self.pid {
            return Err(ThreadError::ForeignThread);
        }
        if t.exited {
            return Err(ThreadError::AlreadyExited);
        }
        t.detached = true;
        t.exit_cv.broadcast();
        log::trace!("{tid} detached");
        Ok(())
    }

    /// Terminate the calling thread. Never returns.
    ///
    /// Records the exit value, wakes joiners, and - when this was the last
    /// thread of the process - runs the exit cascade before the context
    /// retires for good.
    pub fn thread_exit(&self, exitval: i32) -> ! {
        finish_thread(&self.kernel, self.tid, exitval);
        panic::panic_any(ThreadRetire);
    }
}

/// Spawn the execution context for an already-linked thread block.
pub(crate) fn spawn_kernel_thread(st: &mut KernelState, kernel: &Kernel, pid: Pid, tid: ThreadId) {
    let sys = Sys {
        kernel: kernel.clone(),
        pid,
        tid,
    };
    let handle = std::thread::Builder::new()
        .name(format!("{pid}/{tid}"))
        .spawn(move || trampoline(sys))
        .expect("failed to spawn kernel thread");
    st.joiners.push(handle);
}

/// Top-level routine of every kernel thread: take the entry out of the
/// thread block, run it, and retire with its return value. `thread_exit`
/// lands here too, by unwinding with a `ThreadRetire` payload.
fn trampoline(sys: Sys) {
    let entry = {
        let mut st = sys.kernel.lock();
        st.threads
            .get_mut(sys.tid.0)
            .expect("thread spawned without a block")
            .task
            .take()
            .expect("entry routine taken twice")
    };
    let TaskEntry { call, args } = entry;

    match panic::catch_unwind(AssertUnwindSafe(|| call(&sys, args))) {
        Ok(exitval) => finish_thread(&sys.kernel, sys.tid, exitval),
        Err(payload) => {
            if payload.downcast_ref::<ThreadRetire>().is_none() {
                // A stray panic in the entry routine kills the thread;
                // joiners and the process cascade still have to run.
                log::error!("{}: entry routine panicked, retiring thread", sys.tid);
                finish_thread(&sys.kernel, sys.tid, -1);
            }
        }
    }
}

/// Exit bookkeeping shared by normal return and `thread_exit`.
pub(crate) fn finish_thread(kernel: &Kernel, tid: ThreadId, exitval: i32) {
    let mut st = kernel.lock();
    let t = st.threads.get_mut(tid.0).expect("exit of unknown thread");
    assert!(!t.exited, "thread exited twice");
    t.exitval = exitval;
    t.exited = true;
    t.exit_cv.broadcast();
    let pid = t.owner;
    if t.refcount == 0 {
        release_ptcb(&mut st, tid);
    }

    let proc = st.processes.get_mut(&pid).expect("thread without owner");
    assert!(proc.thread_count > 0, "thread count underflow");
    proc.thread_count -= 1;
    log::trace!("{tid} exited with {exitval}, {} has {} threads left", pid, proc.thread_count);
    if proc.thread_count == 0 {
        exit_cascade(&mut st, pid, exitval);
    }
}

/// Unlink a thread block from its process and free it. Called exactly
/// once per block, when `exited` is set and no waiter references remain.
fn release_ptcb(st: &mut KernelState, tid: ThreadId) {
    let t = st.threads.remove(tid.0);
    if let Some(proc) = st.processes.get_mut(&t.owner) {
        proc.threads.retain(|&other| other != tid);
    }
    log::trace!("{tid} released");
}

/// The process exit cascade, run when the last thread of a process exits
/// and before that thread retires.
fn exit_cascade(st: &mut KernelState, pid: Pid, exitval: i32) {
    if pid == Pid::INIT {
        // Init has no parent to notify and adopts nobody's orphans.
        let proc = st.processes.get_mut(&pid).expect("init process missing");
        proc.state = ProcessState::Zombie(exitval);
        log::info!("init exited; system is idle");
        return;
    }
    log::debug!("{pid}: last thread exited, running exit cascade");

    let (children, exited_children, parent) = {
        let proc = st.processes.get_mut(&pid).expect("exiting process missing");
        (
            std::mem::take(&mut proc.children),
            std::mem::take(&mut proc.exited_children),
            proc.parent.expect("non-init process without parent"),
        )
    };

    // Orphans move to init: both the live children and the zombies
    // nobody reaped. Init's reaper is woken either way.
    for child in &children {
        if let Some(c) = st.processes.get_mut(child) {
            c.parent = Some(Pid::INIT);
        }
    }
    let init = st.processes.get_mut(&Pid::INIT).expect("init process missing");
    init.children.extend(children.iter().copied());
    init.exited_children.extend(exited_children.iter().copied());
    init.child_exit.broadcast();

    // Hand ourselves to the parent as an exited child.
    let parent_proc = st
        .processes
        .get_mut(&parent)
        .expect("parent process missing");
    parent_proc.exited_children.push(pid);
    parent_proc.child_exit.broadcast();

    // Release every open object. Socket teardown happens here, which
    // also wakes any accept blocked on a listener this process owned.
    let fds = {
        let proc = st.processes.get_mut(&pid).expect("exiting process missing");
        proc.files.drain()
    };
    for (fd, handle) in fds {
        log::trace!("{pid}: releasing {fd} on exit");
        socket::release_handle(st, handle);
    }

    let proc = st.processes.get_mut(&pid).expect("exiting process missing");
    proc.args = None;
    proc.main_thread = None;
    proc.state = ProcessState::Zombie(exitval);
    assert!(
        proc.children.is_empty() && proc.exited_children.is_empty(),
        "exit cascade left children behind"
    );
}
