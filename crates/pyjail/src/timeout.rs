use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// Why [`run_with_timeout`] returned without a value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// The deadline passed. The worker thread is abandoned, not joined; it
    /// ends on its own when its work finishes or the process exits.
    #[error("worker exceeded {limit_ns} ns")]
    TimedOut { limit_ns: u64 },

    /// The worker panicked before producing a value.
    #[error("worker panicked")]
    Panicked,

    #[error("could not spawn worker thread: {message}")]
    Spawn { message: String },
}

/// Runs `f` on a fresh thread and waits at most `timeout_ns` for its result.
///
/// A guest stuck in a tight loop never yields back to the VM, so abandoning
/// the thread is the only portable way to stop waiting for it. Everything
/// the worker touches must therefore be owned by it (`Send + 'static`).
pub fn run_with_timeout<F, T>(f: F, timeout_ns: u64) -> Result<T, WorkerError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel::<T>();

    thread::Builder::new()
        .name("pyjail-sandbox".to_string())
        .spawn(move || {
            // The receiver is gone after a timeout.
            let _ = tx.send(f());
        })
        .map_err(|e| WorkerError::Spawn {
            message: e.to_string(),
        })?;

    match rx.recv_timeout(Duration::from_nanos(timeout_ns)) {
        Ok(value) => Ok(value),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(WorkerError::TimedOut {
            limit_ns: timeout_ns,
        }),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(WorkerError::Panicked),
    }
}
