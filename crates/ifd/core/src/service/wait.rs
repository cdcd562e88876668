use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use rand::RngCore;
use tracing::{debug, instrument, warn};

use super::IfdService;
use crate::channel::ContextHandle;
use crate::scio::{ScioError, ScioErrorCode};
use crate::status::{IfdStatus, SlotStatus};
use crate::watcher::EventWatcher;
use crate::{CancellationToken, IfdError, Result};

/// Input of `wait`
#[derive(Debug, Clone, Default)]
pub struct WaitRequest {
    /// State the caller knows about. Empty means the state at the time of
    /// the call.
    pub expected: Vec<IfdStatus>,
    /// Maximum wait, unbounded if `None`
    pub timeout: Option<Duration>,
    /// Deliver the result asynchronously through this channel
    pub callback: Option<Sender<WaitNotification>>,
}

impl WaitRequest {
    /// Wait for any change, without a timeout
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the expected state
    pub fn with_expected(mut self, expected: Vec<IfdStatus>) -> Self {
        self.expected = expected;
        self
    }

    /// Set the timeout
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run asynchronously and report through `callback`
    pub fn with_callback(mut self, callback: Sender<WaitNotification>) -> Self {
        self.callback = Some(callback);
        self
    }
}

/// Output of `wait`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResponse {
    /// Terminals whose state differs from the expected one, empty on timeout
    Changed(Vec<IfdStatus>),
    /// Session id of an asynchronous wait
    Session(String),
}

/// Result of an asynchronous wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitNotification {
    /// Session id returned by `wait`
    pub session: String,
    /// Changed terminals or the failure
    pub result: Result<Vec<IfdStatus>>,
}

fn session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn wait_error(error: ScioError) -> IfdError {
    match error.code {
        ScioErrorCode::Cancelled | ScioErrorCode::CancelledByUser => {
            debug!(error = %error, "wait interrupted");
            IfdError::CancellationByUser("Wait interrupted by another thread.".into())
        }
        ScioErrorCode::InvalidHandle => {
            warn!(error = %error, "wait failed");
            IfdError::slot("Unknown SCIO error occurred during wait call.")
        }
        _ => {
            warn!(error = %error, "wait failed");
            IfdError::device("Unknown SCIO error occurred during wait call.")
        }
    }
}

/// The outstanding synchronous wait and the terminals it watches
#[derive(Debug)]
pub(super) struct SyncWait {
    id: u64,
    token: CancellationToken,
    terminals: Vec<String>,
}

impl SyncWait {
    fn concerns(&self, name: &str) -> bool {
        self.terminals.iter().any(|t| t == name)
    }
}

// every expected terminal needs a name and at least one slot to compare
fn normalize(expected: Vec<IfdStatus>) -> Result<Vec<IfdStatus>> {
    expected
        .into_iter()
        .map(|mut status| {
            if status.name.is_empty() {
                return Err(IfdError::UnknownIfd(
                    "IFD in a request IFDStatus not known.".into(),
                ));
            }
            if status.slots.is_empty() {
                status.slots.push(SlotStatus::empty(0));
            }
            Ok(status)
        })
        .collect()
}

impl IfdService {
    /// Wait until the terminal state differs from the expected state.
    ///
    /// Without a callback the call blocks and returns the changes. With a
    /// callback it returns a session id at once and the changes are sent
    /// through the callback later.
    #[instrument(skip_all, fields(expected = request.expected.len(), asynchronous = request.callback.is_some()))]
    pub fn wait(&self, handle: &ContextHandle, request: WaitRequest) -> Result<WaitResponse> {
        let context = self.context(handle)?;
        let timeout = match request.timeout {
            None => Duration::from_millis(u64::MAX),
            Some(timeout) if timeout.is_zero() => {
                return Err(IfdError::parameter(
                    "Invalid timeout value given, must be strictly positive.",
                ));
            }
            Some(timeout) => timeout,
        };

        // the snapshot is taken before returning so no change is missed
        let mut watcher = EventWatcher::start(Arc::clone(&context.manager)).map_err(wait_error)?;
        let expected = if request.expected.is_empty() {
            watcher.current_state()
        } else {
            normalize(request.expected)?
        };

        if let Some(callback) = request.callback {
            let session = session_id();
            let sessions = Arc::clone(&context.sessions);
            let task_session = session.clone();

            // held until the session is recorded, the task removes it when done
            let mut running = context.sessions.lock();
            let task = context.pool.spawn(move |token| {
                let result = watcher
                    .wait_and_update(&expected, timeout, &token)
                    .map_err(wait_error);
                sessions.lock().remove(&task_session);
                let notification = WaitNotification {
                    session: task_session,
                    result,
                };
                if callback.send(notification).is_err() {
                    debug!("wait callback receiver dropped");
                }
            })?;
            running.insert(session.clone(), task.token);
            debug!(session = %session, "asynchronous wait started");
            return Ok(WaitResponse::Session(session));
        }

        // unlisted attached terminals count as changed, so they are watched too
        let mut terminals: Vec<String> = watcher
            .current_state()
            .into_iter()
            .chain(expected.iter().cloned())
            .map(|s| s.name)
            .collect();
        terminals.sort_unstable();
        terminals.dedup();
        let task = {
            let mut sync_wait = context.sync_wait.lock();
            let task = context
                .pool
                .spawn(move |token| watcher.wait_and_update(&expected, timeout, &token))?;
            *sync_wait = Some(SyncWait {
                id: task.id,
                token: task.token.clone(),
                terminals,
            });
            task
        };
        let result = task.result.recv();

        let mut sync_wait = context.sync_wait.lock();
        if sync_wait.as_ref().is_some_and(|wait| wait.id == task.id) {
            *sync_wait = None;
        }
        drop(sync_wait);

        match result {
            Ok(changes) => changes.map(WaitResponse::Changed).map_err(wait_error),
            // the worker went away without answering
            Err(_) => Err(IfdError::CancellationByUser(
                "Wait interrupted by another thread.".into(),
            )),
        }
    }

    /// Cancel an asynchronous wait by session id, or the synchronous wait
    /// watching the named terminal when only a name is given
    #[instrument(skip_all, fields(session = session, terminal = ifd_name))]
    pub fn cancel(
        &self,
        handle: &ContextHandle,
        session: Option<&str>,
        ifd_name: Option<&str>,
    ) -> Result<()> {
        let context = self.context(handle)?;
        match (session, ifd_name) {
            (Some(session), _) => {
                let token = context.sessions.lock().remove(session);
                match token {
                    Some(token) => {
                        token.cancel();
                        Ok(())
                    }
                    None => Err(IfdError::CancelNotPossible(
                        "No matching Wait call exists for the given session.".into(),
                    )),
                }
            }
            (None, Some(name)) => {
                let mut sync_wait = context.sync_wait.lock();
                match sync_wait.take_if(|wait| wait.concerns(name)) {
                    Some(wait) => {
                        wait.token.cancel();
                        Ok(())
                    }
                    None => Err(IfdError::CancelNotPossible(
                        "No synchronous Wait for this IFD to cancel.".into(),
                    )),
                }
            }
            (None, None) => Err(IfdError::unknown("Invalid parameters given.")),
        }
    }
}
