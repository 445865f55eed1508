//! Kernel objects
//!
//! Every stream resource is a kernel object. Processes reach objects
//! through handles stored in their file descriptor tables, and objects are
//! reference counted: a close decrements the count, and the object is torn
//! down exactly once, when the count reaches zero.

use super::process::Handle;
use super::socket::SocketId;
use slab::Slab;

/// A kernel object - a stream resource reachable via a handle.
///
/// The concurrency core's only stream object is the socket; the variant
/// carries the id of its control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelObject {
    /// A connection endpoint
    Socket(SocketId),
}

/// An object table entry: the object plus its outstanding references.
#[derive(Debug)]
pub struct ObjectEntry {
    /// Outstanding handle references
    pub refcount: u32,
    /// The object itself
    pub object: KernelObject,
}

/// The kernel object table.
///
/// Handles are slab keys; an entry lives from `reserve` until the
/// reference count returns to zero.
pub struct ObjectTable {
    entries: Slab<ObjectEntry>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            entries: Slab::new(),
        }
    }

    /// Reserve an entry for a new object with one reference.
    pub fn reserve(&mut self, object: KernelObject) -> Handle {
        let key = self.entries.insert(ObjectEntry {
            refcount: 1,
            object,
        });
        Handle(key)
    }

    pub fn get(&self, handle: Handle) -> Option<&ObjectEntry> {
        self.entries.get(handle.0)
    }

    /// Add a reference to an existing entry.
    pub fn incref(&mut self, handle: Handle) {
        let entry = self.entries.get_mut(handle.0).expect("incref on dead handle");
        entry.refcount += 1;
    }

    /// Drop a reference. Returns the object when the count reached zero,
    /// in which case the entry is gone and the caller must tear the object
    /// down.
    pub fn decref(&mut self, handle: Handle) -> Option<KernelObject> {
        let entry = self.entries.get_mut(handle.0).expect("decref on dead handle");
        assert!(entry.refcount > 0, "object refcount underflow");
        entry.refcount -= 1;
        if entry.refcount == 0 {
            Some(self.entries.remove(handle.0).object)
        } else {
            None
        }
    }

    /// Remove an entry outright, regardless of references.
    /// Used only when rolling back a half-built object.
    pub fn discard(&mut self, handle: Handle) -> KernelObject {
        self.entries.remove(handle.0).object
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}
