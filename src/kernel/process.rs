//! Process abstraction
//!
//! A process is the unit of resource ownership: it owns its thread list,
//! its child processes, and its file descriptor table. Processes follow
//! the classic parent/child model - an exiting process becomes a zombie
//! until its parent reaps it, and orphans are reparented to init.
//!
//! A process has no execution context of its own; its threads do the
//! running. The thread count reaches zero exactly once, at which point the
//! exit cascade fires and the process turns zombie.

use super::sync::Condv;
use super::thread::ThreadId;
use std::collections::HashMap;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl Pid {
    /// The root/init process. First to exist, adopts every orphan.
    pub const INIT: Pid = Pid(1);
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// At least one thread is live
    Running,
    /// Last thread exited; holds the exit status until reaped
    Zombie(i32),
}

/// Error types for process operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// Pid does not resolve to a process
    NoSuchProcess,
    /// wait_child with nothing to wait for
    NoChildren,
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::NoSuchProcess => write!(f, "no such process"),
            ProcessError::NoChildren => write!(f, "no children to wait for"),
        }
    }
}

impl std::error::Error for ProcessError {}

/// Result type for process operations
pub type ProcessResult<T> = Result<T, ProcessError>;

/// A process in the system
pub struct Process {
    /// Unique process identifier
    pub pid: Pid,

    /// Process name (for logging/display)
    pub name: String,

    /// Parent process (None only for init)
    pub parent: Option<Pid>,

    /// Current state
    pub state: ProcessState,

    /// Number of live threads. Reaches zero exactly once.
    pub thread_count: u32,

    /// Thread blocks owned by this process
    pub threads: Vec<ThreadId>,

    /// Child processes, live and zombie (zombies stay listed until reaped)
    pub children: Vec<Pid>,

    /// Children that have exited and await reaping, oldest first
    pub exited_children: Vec<Pid>,

    /// Signaled whenever a child of this process exits
    pub child_exit: Condv,

    /// The main thread, cleared by the exit cascade
    pub main_thread: Option<ThreadId>,

    /// Process argument buffer, released by the exit cascade
    pub args: Option<Vec<u8>>,

    /// File descriptor table
    pub files: FileTable,
}

impl Process {
    pub fn new(pid: Pid, name: String, parent: Option<Pid>) -> Self {
        Self {
            pid,
            name,
            parent,
            state: ProcessState::Running,
            thread_count: 0,
            threads: Vec::new(),
            children: Vec::new(),
            exited_children: Vec::new(),
            child_exit: Condv::new(),
            main_thread: None,
            args: None,
            files: FileTable::new(),
        }
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state, ProcessState::Zombie(_))
    }
}

/// Maximum file descriptors per process
pub const MAX_FDS_PER_PROCESS: usize = 16;

/// File descriptor - an index into a process's file table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(pub u32);

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Handle to an entry in the kernel object table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub usize);

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle:{}", self.0)
    }
}

/// A process's file descriptor table
pub struct FileTable {
    /// Next fd to allocate
    next_fd: u32,
    /// Map from fd to kernel object handle
    table: HashMap<Fd, Handle>,
    /// Maximum number of open file descriptors
    max_fds: usize,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            next_fd: 0,
            table: HashMap::new(),
            max_fds: MAX_FDS_PER_PROCESS,
        }
    }

    /// Create a file table with a custom fd limit
    pub fn with_limit(max_fds: usize) -> Self {
        Self {
            next_fd: 0,
            table: HashMap::new(),
            max_fds,
        }
    }

    /// Reserve a new file descriptor for a handle.
    /// Returns None when the fd limit has been reached.
    pub fn alloc(&mut self, handle: Handle) -> Option<Fd> {
        if self.table.len() >= self.max_fds {
            return None;
        }
        let fd = Fd(self.next_fd);
        self.next_fd += 1;
        self.table.insert(fd, handle);
        Some(fd)
    }

    pub fn get(&self, fd: Fd) -> Option<Handle> {
        self.table.get(&fd).copied()
    }

    pub fn remove(&mut self, fd: Fd) -> Option<Handle> {
        self.table.remove(&fd)
    }

    pub fn contains(&self, fd: Fd) -> bool {
        self.table.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Take every entry out of the table, for release on process exit.
    pub fn drain(&mut self) -> Vec<(Fd, Handle)> {
        self.table.drain().collect()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_creation() {
        let proc = Process::new(Pid(1), "init".to_string(), None);
        assert_eq!(proc.pid, Pid(1));
        assert!(proc.parent.is_none());
        assert!(proc.is_alive());
        assert_eq!(proc.thread_count, 0);
        assert!(proc.children.is_empty());
    }

    #[test]
    fn test_process_zombie() {
        let mut proc = Process::new(Pid(2), "worker".to_string(), Some(Pid::INIT));
        assert!(proc.is_alive());
        proc.state = ProcessState::Zombie(3);
        assert!(!proc.is_alive());
    }

    #[test]
    fn test_file_table_alloc() {
        let mut ft = FileTable::new();
        let h1 = Handle(100);
        let h2 = Handle(200);

        let fd1 = ft.alloc(h1).expect("should allocate fd");
        let fd2 = ft.alloc(h2).expect("should allocate fd");

        assert_eq!(fd1, Fd(0));
        assert_eq!(fd2, Fd(1));
        assert_eq!(ft.get(fd1), Some(h1));
        assert_eq!(ft.get(fd2), Some(h2));
    }

    #[test]
    fn test_file_table_remove() {
        let mut ft = FileTable::new();
        let h = Handle(7);
        let fd = ft.alloc(h).expect("should allocate fd");

        assert!(ft.contains(fd));
        assert_eq!(ft.remove(fd), Some(h));
        assert!(!ft.contains(fd));
        assert_eq!(ft.remove(fd), None);
    }

    #[test]
    fn test_file_table_fd_limit() {
        let mut ft = FileTable::with_limit(3);
        for _ in 0..3 {
            assert!(ft.alloc(Handle(1)).is_some());
        }
        assert!(ft.alloc(Handle(1)).is_none());
        assert_eq!(ft.len(), 3);
    }

    #[test]
    fn test_file_table_drain() {
        let mut ft = FileTable::new();
        ft.alloc(Handle(1)).unwrap();
        ft.alloc(Handle(2)).unwrap();

        let drained = ft.drain();
        assert_eq!(drained.len(), 2);
        assert!(ft.is_empty());
    }
}
