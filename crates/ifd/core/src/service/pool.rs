use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, bounded};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::CancellationToken;
use crate::{IfdError, Result};

#[derive(Debug, Default)]
struct PoolState {
    shutdown: AtomicBool,
    next_id: AtomicU64,
    running: Mutex<HashMap<u64, CancellationToken>>,
}

/// Runs blocking wait tasks on their own threads. Every task gets a fresh
/// [`CancellationToken`]; shutting the pool down cancels all of them.
#[derive(Debug)]
pub(crate) struct WaitPool {
    thread_name: String,
    state: Arc<PoolState>,
}

/// Handle to a spawned task
#[derive(Debug)]
pub(crate) struct WaitTask<T> {
    pub(crate) id: u64,
    pub(crate) token: CancellationToken,
    pub(crate) result: Receiver<T>,
}

impl WaitPool {
    pub(crate) fn new<S: Into<String>>(thread_name: S) -> Self {
        Self {
            thread_name: thread_name.into(),
            state: Arc::default(),
        }
    }

    /// Run `task` on a new thread. The result is delivered through the
    /// returned receiver.
    pub(crate) fn spawn<T, F>(&self, task: F) -> Result<WaitTask<T>>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> T + Send + 'static,
    {
        if self.state.shutdown.load(Ordering::SeqCst) {
            return Err(IfdError::unknown("Wait pool is shut down."));
        }

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let (tx, rx) = bounded(1);
        self.state.running.lock().insert(id, token.clone());

        let state = Arc::clone(&self.state);
        let task_token = token.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{id}", self.thread_name))
            .spawn(move || {
                trace!(task = id, "wait task started");
                let result = task(task_token);
                state.running.lock().remove(&id);
                // the caller may have given up on the result
                let _ = tx.send(result);
                trace!(task = id, "wait task finished");
            });
        if let Err(e) = spawned {
            self.state.running.lock().remove(&id);
            return Err(IfdError::unknown(format!("Failed to start wait task: {e}")));
        }

        Ok(WaitTask {
            id,
            token,
            result: rx,
        })
    }

    /// Number of tasks still running
    #[cfg(test)]
    pub(crate) fn running(&self) -> usize {
        self.state.running.lock().len()
    }

    /// Reject new work and cancel every running task. Threads are not
    /// joined.
    pub(crate) fn shutdown(&self) {
        if self.state.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let running: Vec<_> = self.state.running.lock().drain().collect();
        debug!(tasks = running.len(), "shutting down wait pool");
        for (_, token) in running {
            token.cancel();
        }
    }
}

impl Drop for WaitPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_result_is_delivered() {
        let pool = WaitPool::new("test-wait");
        let task = pool.spawn(|_| 42).unwrap();
        assert_eq!(task.result.recv_timeout(Duration::from_secs(5)), Ok(42));
    }

    #[test]
    fn test_shutdown_cancels_and_rejects() {
        let pool = WaitPool::new("test-wait");
        let task = pool
            .spawn(|token| {
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(1));
                }
                "stopped"
            })
            .unwrap();
        assert_eq!(pool.running(), 1);

        pool.shutdown();
        assert!(task.token.is_cancelled());
        assert_eq!(
            task.result.recv_timeout(Duration::from_secs(5)),
            Ok("stopped")
        );
        assert!(pool.spawn(|_| ()).is_err());
    }
}
