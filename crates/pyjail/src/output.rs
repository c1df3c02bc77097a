//! Output capture for guest `sys.stdout` / `sys.stderr`.
//!
//! One [`OutputBuffer`] lives as long as its sandbox. The writer objects
//! installed into the guest `sys` module hold clones of it; the sandbox drains
//! it with [`take`](OutputBuffer::take) after every `execute` call and after
//! teardown, which also resets the byte budget.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::GuestError;

struct OutputBufferInner {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    max_bytes: usize,
    limit_exceeded: bool,
}

impl OutputBufferInner {
    fn total_len(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

/// A shared, limit-enforcing stdout/stderr buffer.
///
/// Cheap to clone; all clones share the same data.
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<OutputBufferInner>>,
}

impl OutputBuffer {
    /// Creates a buffer accepting up to `max_bytes` across both streams.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OutputBufferInner {
                stdout: Vec::new(),
                stderr: Vec::new(),
                max_bytes,
                limit_exceeded: false,
            })),
        }
    }

    // A writer that panicked mid-append leaves the byte vectors consistent, so
    // a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, OutputBufferInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends `data` to `stream`. A write that would push the combined total
    /// over the limit is rejected whole and marks the buffer as exceeded.
    pub(crate) fn write(&self, stream: Stream, data: &[u8]) -> Result<(), GuestError> {
        let mut inner = self.lock();
        if inner.total_len() + data.len() > inner.max_bytes {
            inner.limit_exceeded = true;
            return Err(GuestError::OutputLimitExceeded {
                limit_bytes: inner.max_bytes,
            });
        }
        match stream {
            Stream::Stdout => inner.stdout.extend_from_slice(data),
            Stream::Stderr => inner.stderr.extend_from_slice(data),
        }
        Ok(())
    }

    /// True if a write has been rejected since the last [`take`](Self::take).
    pub fn is_limit_exceeded(&self) -> bool {
        self.lock().limit_exceeded
    }

    pub fn max_bytes(&self) -> usize {
        self.lock().max_bytes
    }

    /// Drains both streams as lossy UTF-8 and clears the exceeded flag.
    pub fn take(&self) -> (String, String) {
        let mut inner = self.lock();
        inner.limit_exceeded = false;
        let stdout = std::mem::take(&mut inner.stdout);
        let stderr = std::mem::take(&mut inner.stderr);
        (
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        )
    }
}
