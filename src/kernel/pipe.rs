//! One-way byte channel
//!
//! The pipe channel is the byte-transfer primitive underneath peer
//! sockets. It is a bounded FIFO with a read end and a write end that can
//! be closed independently: a reader sees EOF once the buffer drains after
//! the writer closes, and a writer gets a broken pipe once the reader is
//! gone.
//!
//! The channel is self-contained: it carries its own lock and condition
//! variables and never touches kernel state, so peers block on byte
//! transfer without holding the kernel lock.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Default buffer capacity (8KB)
pub const PIPE_CAPACITY: usize = 8192;

/// Pipe error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeError {
    /// Write with no reader left
    BrokenPipe,
    /// Read on a closed read end
    Closed,
}

impl std::fmt::Display for PipeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipeError::BrokenPipe => write!(f, "broken pipe"),
            PipeError::Closed => write!(f, "read end closed"),
        }
    }
}

impl std::error::Error for PipeError {}

/// Result type for pipe operations
pub type PipeResult<T> = Result<T, PipeError>;

#[derive(Debug)]
struct PipeBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    reader_open: bool,
    writer_open: bool,
}

/// A one-way blocking byte channel.
#[derive(Debug)]
pub struct PipeChannel {
    buffer: Mutex<PipeBuffer>,
    has_data: Condvar,
    has_space: Condvar,
}

impl PipeChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(PipeBuffer {
                data: VecDeque::with_capacity(capacity),
                capacity,
                reader_open: true,
                writer_open: true,
            }),
            has_data: Condvar::new(),
            has_space: Condvar::new(),
        }
    }

    /// Read up to `buf.len()` bytes, blocking while the channel is empty
    /// and the writer is still open. Returns 0 at EOF.
    pub fn read(&self, buf: &mut [u8]) -> PipeResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.buffer.lock().expect("pipe lock poisoned");
        loop {
            if !state.reader_open {
                return Err(PipeError::Closed);
            }
            if !state.data.is_empty() {
                let n = buf.len().min(state.data.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.data.pop_front().expect("sized by len check");
                }
                self.has_space.notify_all();
                return Ok(n);
            }
            if !state.writer_open {
                return Ok(0); // EOF
            }
            state = self.has_data.wait(state).expect("pipe lock poisoned");
        }
    }

    /// Write up to `buf.len()` bytes, blocking while the buffer is full.
    /// A partial write happens when only part of `buf` fits.
    pub fn write(&self, buf: &[u8]) -> PipeResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.buffer.lock().expect("pipe lock poisoned");
        loop {
            if !state.reader_open {
                return Err(PipeError::BrokenPipe);
            }
            let space = state.capacity - state.data.len();
            if space > 0 {
                let n = buf.len().min(space);
                state.data.extend(&buf[..n]);
                self.has_data.notify_all();
                return Ok(n);
            }
            state = self.has_space.wait(state).expect("pipe lock poisoned");
        }
    }

    /// Close the read end. Pending and future writes fail with BrokenPipe.
    pub fn close_reader(&self) {
        let mut state = self.buffer.lock().expect("pipe lock poisoned");
        state.reader_open = false;
        state.data.clear();
        self.has_space.notify_all();
        self.has_data.notify_all();
    }

    /// Close the write end. Readers drain the buffer, then see EOF.
    pub fn close_writer(&self) {
        let mut state = self.buffer.lock().expect("pipe lock poisoned");
        state.writer_open = false;
        self.has_data.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_pipe_write_then_read() {
        let pipe = PipeChannel::new(64);
        let data = b"hello pipe";
        assert_eq!(pipe.write(data).unwrap(), data.len());

        let mut buf = [0u8; 64];
        let n = pipe.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], data);
    }

    #[test]
    fn test_pipe_eof_after_writer_close() {
        let pipe = PipeChannel::new(64);
        pipe.write(b"tail").unwrap();
        pipe.close_writer();

        let mut buf = [0u8; 64];
        assert_eq!(pipe.read(&mut buf).unwrap(), 4);
        // Buffer drained, writer gone: EOF.
        assert_eq!(pipe.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_pipe_broken_after_reader_close() {
        let pipe = PipeChannel::new(64);
        pipe.close_reader();
        assert_eq!(pipe.write(b"data"), Err(PipeError::BrokenPipe));
    }

    #[test]
    fn test_pipe_partial_write_when_full() {
        let pipe = PipeChannel::new(4);
        assert_eq!(pipe.write(b"abcdef").unwrap(), 4);
    }

    #[test]
    fn test_pipe_read_blocks_until_write() {
        let pipe = Arc::new(PipeChannel::new(64));

        let reader = {
            let pipe = Arc::clone(&pipe);
            std::thread::spawn(move || {
                let mut buf = [0u8; 8];
                let n = pipe.read(&mut buf).unwrap();
                buf[..n].to_vec()
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        pipe.write(b"wake").unwrap();
        assert_eq!(reader.join().unwrap(), b"wake");
    }

    #[test]
    fn test_pipe_write_blocks_until_space() {
        let pipe = Arc::new(PipeChannel::new(4));
        pipe.write(b"full").unwrap();

        let writer = {
            let pipe = Arc::clone(&pipe);
            std::thread::spawn(move || pipe.write(b"more").unwrap())
        };

        std::thread::sleep(Duration::from_millis(50));
        let mut buf = [0u8; 4];
        pipe.read(&mut buf).unwrap();
        assert_eq!(writer.join().unwrap(), 4);
    }

    #[test]
    fn test_pipe_reader_close_wakes_blocked_writer() {
        let pipe = Arc::new(PipeChannel::new(4));
        pipe.write(b"full").unwrap();

        let writer = {
            let pipe = Arc::clone(&pipe);
            std::thread::spawn(move || pipe.write(b"more"))
        };

        std::thread::sleep(Duration::from_millis(50));
        pipe.close_reader();
        assert_eq!(writer.join().unwrap(), Err(PipeError::BrokenPipe));
    }
}
