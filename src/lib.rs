//! kernos - the concurrency core of a teaching operating-system kernel
//!
//! Two subsystems built on the same kernel-wide exclusion domain:
//! - Thread lifecycle: create, join, detach, exit, and the exit cascade
//!   that reparents orphans and turns a process into a zombie when its
//!   last thread goes.
//! - Socket rendezvous: port-based listen/accept/connect pairing that
//!   wires two one-way pipe channels crosswise into a full-duplex link
//!   between unrelated processes.
//!
//! Design principles:
//! - One kernel lock: every operation is atomic with respect to the rest
//! - Broadcast wakes only: every waiter revalidates its predicate
//! - Reference-counted blocks: nothing is freed while somebody holds it

pub mod kernel;

pub use kernel::{Kernel, KernelConfig, Sys};
