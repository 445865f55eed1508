//! The kernel - thread lifecycle and port-rendezvous IPC
//!
//! All kernel state sits in one `KernelState` behind one mutex, so every
//! operation runs as if single-threaded; blocking operations release the
//! lock through a condition variable and revalidate their predicate on
//! every wake. Threads are real preemptible contexts: each kernel thread
//! is an OS thread whose trampoline carries a `Sys` capability - the
//! syscall surface for that thread.
//!
//! Lifecycle: `Kernel::boot` builds the state (including the port map and
//! the init process), `spawn_process` starts work, `shutdown` joins every
//! context that was ever spawned and tears the port map down.

pub mod object;
pub mod pipe;
pub mod process;
pub mod socket;
pub mod sync;
pub mod thread;


pub use process::{Fd, Pid, ProcessError, ProcessState};
pub use socket::{Port, ShutdownMode, SocketError};
pub use sync::SchedClass;
pub use thread::{TaskEntry, ThreadError, ThreadId};

use object::ObjectTable;
use process::{Process, ProcessResult};
use slab::Slab;
use socket::{ConnRequest, PortMap, SocketCb};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Once};
use thread::{Ptcb, ThreadRetire};

/// Configuration for a kernel instance
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Highest valid port number; the port map holds `max_port + 1` slots
    pub max_port: u16,
    /// Capacity of each one-way pipe channel
    pub pipe_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_port: 1023,
            pipe_capacity: pipe::PIPE_CAPACITY,
        }
    }
}

impl KernelConfig {
    pub fn max_port(mut self, n: u16) -> Self {
        self.max_port = n;
        self
    }

    pub fn pipe_capacity(mut self, n: usize) -> Self {
        self.pipe_capacity = n.max(1);
        self
    }
}

/// Everything the kernel owns, guarded by the kernel lock.
pub(crate) struct KernelState {
    pub(crate) config: KernelConfig,
    pub(crate) processes: HashMap<Pid, Process>,
    pub(crate) next_pid: u32,
    pub(crate) threads: Slab<Ptcb>,
    pub(crate) objects: ObjectTable,
    pub(crate) sockets: Slab<SocketCb>,
    pub(crate) requests: Slab<ConnRequest>,
    pub(crate) port_map: PortMap,
    /// OS handles of every context ever spawned, drained at shutdown
    pub(crate) joiners: Vec<std::thread::JoinHandle<()>>,
}

struct KernelInner {
    state: Mutex<KernelState>,
}

/// Handle to a running kernel. Cloning shares the instance.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

static RETIRE_HOOK: Once = Once::new();

/// `thread_exit` unwinds with a `ThreadRetire` payload; the hook keeps
/// that retirement out of stderr while leaving real panics alone.
fn install_retire_hook() {
    RETIRE_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<ThreadRetire>().is_none() {
                previous(info);
            }
        }));
    });
}

impl Kernel {
    /// Build a kernel: the port map, the object tables, and the init
    /// process (pid 1, threadless until something is spawned).
    pub fn boot(config: KernelConfig) -> Self {
        install_retire_hook();
        let port_map = PortMap::new(config.max_port);
        let mut processes = HashMap::new();
        processes.insert(Pid::INIT, Process::new(Pid::INIT, "init".to_string(), None));
        log::info!("kernel booted (ports 0..={})", config.max_port);
        Self {
            inner: Arc::new(KernelInner {
                state: Mutex::new(KernelState {
                    config,
                    processes,
                    next_pid: Pid::INIT.0 + 1,
                    threads: Slab::new(),
                    objects: ObjectTable::new(),
                    sockets: Slab::new(),
                    requests: Slab::new(),
                    port_map,
                    joiners: Vec::new(),
                }),
            }),
        }
    }

    /// Enter the kernel's exclusion domain.
    pub(crate) fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.inner.state.lock().expect("kernel lock poisoned")
    }

    /// Start a new process parented to init, with `entry` as its main
    /// thread.
    pub fn spawn_process(&self, name: &str, entry: TaskEntry) -> Pid {
        let mut st = self.lock();
        spawn_process_locked(&mut st, self, Pid::INIT, name, entry)
    }

    /// Reap the oldest exited child of `parent`, blocking until one
    /// exists. Fails when `parent` has no children at all.
    pub fn wait_child(&self, parent: Pid) -> ProcessResult<(Pid, i32)> {
        let st = self.lock();
        let (_st, result) = wait_child_locked(st, parent);
        result
    }

    /// Wait for every context ever spawned to retire, then tear down the
    /// port map. Blocks until running threads exit on their own.
    pub fn shutdown(&self) {
        loop {
            let handle = self.lock().joiners.pop();
            match handle {
                Some(handle) => {
                    let _ = handle.join();
                }
                None => break,
            }
        }
        self.lock().port_map.clear();
        log::info!("kernel shut down");
    }

    // ---- introspection (used by tests and diagnostics) ----

    pub fn process_state(&self, pid: Pid) -> Option<ProcessState> {
        self.lock().processes.get(&pid).map(|p| p.state)
    }

    pub fn parent_of(&self, pid: Pid) -> Option<Pid> {
        self.lock().processes.get(&pid).and_then(|p| p.parent)
    }

    pub fn children(&self, pid: Pid) -> Vec<Pid> {
        self.lock()
            .processes
            .get(&pid)
            .map(|p| p.children.clone())
            .unwrap_or_default()
    }

    pub fn exited_children(&self, pid: Pid) -> Vec<Pid> {
        self.lock()
            .processes
            .get(&pid)
            .map(|p| p.exited_children.clone())
            .unwrap_or_default()
    }

    pub fn thread_count(&self, pid: Pid) -> Option<u32> {
        self.lock().processes.get(&pid).map(|p| p.thread_count)
    }

    /// Number of thread blocks currently allocated.
    pub fn live_threads(&self) -> usize {
        self.lock().threads.len()
    }

    /// Number of socket control blocks currently allocated.
    pub fn live_sockets(&self) -> usize {
        self.lock().sockets.len()
    }

    /// Number of connection requests currently allocated.
    pub fn live_requests(&self) -> usize {
        self.lock().requests.len()
    }

    /// Queue length of the listener published at `port`, if any.
    pub fn pending_requests(&self, port: Port) -> usize {
        let st = self.lock();
        let Some(lsid) = st.port_map.get(port) else {
            return 0;
        };
        match st.sockets.get(lsid.0).map(|scb| &scb.kind) {
            Some(socket::SocketKind::Listener { queue, .. }) => queue.len(),
            _ => 0,
        }
    }
}

/// The syscall surface of one kernel thread.
///
/// Every entry routine receives a `Sys` naming the calling thread and its
/// process; all thread and socket operations go through it.
pub struct Sys {
    pub(crate) kernel: Kernel,
    pub(crate) pid: Pid,
    pub(crate) tid: ThreadId,
}

impl Sys {
    /// The calling thread's process.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The kernel this thread runs under.
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Start a child process of the calling process.
    pub fn spawn_process(&self, name: &str, entry: TaskEntry) -> Pid {
        let mut st = self.kernel.lock();
        spawn_process_locked(&mut st, &self.kernel, self.pid, name, entry)
    }

    /// Reap the oldest exited child of the calling process, blocking
    /// until one exists.
    pub fn wait_child(&self) -> ProcessResult<(Pid, i32)> {
        let st = self.kernel.lock();
        let (_st, result) = wait_child_locked(st, self.pid);
        result
    }
}

fn spawn_process_locked(
    st: &mut KernelState,
    kernel: &Kernel,
    parent: Pid,
    name: &str,
    entry: TaskEntry,
) -> Pid {
    let pid = Pid(st.next_pid);
    st.next_pid += 1;

    let mut proc = Process::new(pid, name.to_string(), Some(parent));
    if !entry.args.is_empty() {
        proc.args = Some(entry.args.clone());
    }
    let tid = ThreadId(st.threads.insert(Ptcb::new(pid, entry)));
    proc.threads.push(tid);
    proc.thread_count = 1;
    proc.main_thread = Some(tid);
    st.processes.insert(pid, proc);
    st.processes
        .get_mut(&parent)
        .expect("parent process missing")
        .children
        .push(pid);

    log::debug!("spawned {pid} ({name}), main thread {tid}");
    thread::spawn_kernel_thread(st, kernel, pid, tid);
    pid
}

/// The blocking body of wait_child; the guard travels through each wait.
fn wait_child_locked(
    mut st: MutexGuard<'_, KernelState>,
    parent: Pid,
) -> (MutexGuard<'_, KernelState>, ProcessResult<(Pid, i32)>) {
    loop {
        let Some(proc) = st.processes.get(&parent) else {
            return (st, Err(ProcessError::NoSuchProcess));
        };
        if let Some(&child) = proc.exited_children.first() {
            let proc = st.processes.get_mut(&parent).expect("checked above");
            proc.exited_children.remove(0);
            proc.children.retain(|&c| c != child);
            let zombie = st
                .processes
                .remove(&child)
                .expect("exited child without a process entry");
            let ProcessState::Zombie(status) = zombie.state else {
                unreachable!("exited child still running");
            };
            log::debug!("{parent} reaped {child} (status {status})");
            return (st, Ok((child, status)));
        }
        if proc.children.is_empty() {
            return (st, Err(ProcessError::NoChildren));
        }
        let cv = proc.child_exit.clone();
        st = cv.wait(st, SchedClass::User);
    }
}
