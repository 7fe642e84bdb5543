//! Session controller - the turn state machine
//!
//! Capture, submission and playback each run as a spawned task that reports
//! exactly one [`Completion`] tagged with the handle it was issued under.
//! Completions are applied one at a time; a completion whose handle is no
//! longer the active one is dropped without touching the session.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    EMPTY_REPLY, FALLBACK_REPLY, InputOrigin, OperationHandle, Role, SessionContext,
    SessionSnapshot, SessionState, Turn,
};
use crate::db::{ConversationRecord, ConversationStore};
use crate::transport::TurnTransport;
use crate::voice::{CaptureDevice, PlaybackDevice};
use crate::{ControlError, ConversationError, TransportFailureKind};

/// Timing knobs for the controller
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    /// Upper bound on one transport round-trip
    pub turn_timeout: Duration,

    /// How long a cancelled operation may take to wind down before it is aborted
    pub cancel_grace: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            turn_timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(2),
        }
    }
}

/// What an operation produced
#[derive(Debug)]
enum Outcome {
    Captured(Result<String, ConversationError>),
    Replied(Result<String, ConversationError>),
    Spoken(Result<(), ConversationError>),
}

/// Completion event of one operation
#[derive(Debug)]
struct Completion {
    handle: OperationHandle,
    outcome: Outcome,
}

/// Operation-specific data kept while an operation is in flight
#[derive(Debug)]
enum OperationKind {
    Capture,
    Submission { message: String, origin: InputOrigin },
    Playback,
}

/// The single in-flight operation
struct ActiveOperation {
    handle: OperationHandle,
    kind: OperationKind,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns one conversation session and mediates every device engagement
///
/// All public operations take `&mut self`, so commands and completions are
/// serialized by construction. Use [`SessionClient`](super::SessionClient)
/// to drive a controller from several places at once.
pub struct SessionController {
    context: SessionContext,
    capture: Arc<dyn CaptureDevice>,
    playback: Arc<dyn PlaybackDevice>,
    transport: Arc<dyn TurnTransport>,
    store: Option<Arc<dyn ConversationStore>>,
    settings: ControllerSettings,

    state: SessionState,
    transcript: Vec<Turn>,
    active: Option<ActiveOperation>,
    notice: Option<ConversationError>,
    next_handle: u64,

    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl SessionController {
    /// Create a controller for a fresh session
    #[must_use]
    pub fn new(
        context: SessionContext,
        capture: Arc<dyn CaptureDevice>,
        playback: Arc<dyn PlaybackDevice>,
        transport: Arc<dyn TurnTransport>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(SessionSnapshot {
            conversation_id: context.conversation_id().to_string(),
            state: SessionState::Idle,
            active: None,
            transcript: Vec::new(),
            notice: None,
        });

        tracing::info!(conversation_id = context.conversation_id(), "session started");

        Self {
            context,
            capture,
            playback,
            transport,
            store: None,
            settings: ControllerSettings::default(),
            state: SessionState::Idle,
            transcript: Vec::new(),
            active: None,
            notice: None,
            next_handle: 1,
            completions_tx,
            completions_rx,
            snapshot_tx,
        }
    }

    /// Persist completed turns to `store`
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override timing settings
    #[must_use]
    pub const fn with_settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Session context
    #[must_use]
    pub const fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Transcript in chronological order
    #[must_use]
    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    /// Handle of the in-flight operation, if any
    #[must_use]
    pub fn active_handle(&self) -> Option<OperationHandle> {
        self.active.as_ref().map(|op| op.handle)
    }

    /// Most recent recoverable failure
    #[must_use]
    pub const fn notice(&self) -> Option<&ConversationError> {
        self.notice.as_ref()
    }

    /// Current view of the session
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            conversation_id: self.context.conversation_id().to_string(),
            state: self.state,
            active: self.active_handle(),
            transcript: self.transcript.clone(),
            notice: self.notice.clone(),
        }
    }

    /// Observe every published state change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Start listening for one utterance
    ///
    /// Preempts a pending submission or an ongoing playback (barge-in): the
    /// old operation is cancelled and its device released before the
    /// microphone is engaged. The handoff is published as a single change.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Busy` if a capture is already in progress
    pub async fn activate_capture(&mut self) -> Result<OperationHandle, ControlError> {
        if self.state == SessionState::Listening {
            tracing::debug!("capture already active, rejecting activation");
            return Err(ControlError::Busy {
                state: self.state,
            });
        }

        self.supersede().await;
        self.notice = None;

        let device = Arc::clone(&self.capture);
        let handle = self.launch(
            SessionState::Listening,
            OperationKind::Capture,
            move |cancel| async move { Some(Outcome::Captured(device.capture(cancel).await)) },
        );

        tracing::info!(%handle, "listening");
        self.publish();
        Ok(handle)
    }

    /// Stop an in-progress capture
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NothingToCancel` if the session is not listening
    pub async fn cancel_capture(&mut self) -> Result<OperationHandle, ControlError> {
        self.cancel_if(SessionState::Listening).await
    }

    /// Submit typed text as a user turn
    ///
    /// A capture in progress or a reply being spoken is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::EmptyMessage` for blank input and
    /// `ControlError::Busy` while another submission is outstanding
    pub async fn submit_text(&mut self, text: &str) -> Result<OperationHandle, ControlError> {
        let message = text.trim();
        if message.is_empty() {
            return Err(ControlError::EmptyMessage);
        }

        if self.state == SessionState::Submitting {
            tracing::debug!("submission already in flight, rejecting text");
            return Err(ControlError::Busy {
                state: self.state,
            });
        }

        self.supersede().await;
        self.notice = None;

        let handle = self.begin_submission(message.to_string(), InputOrigin::Text);
        self.publish();
        Ok(handle)
    }

    /// Stop the reply being spoken
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NothingToCancel` if the session is not speaking
    pub async fn cancel_playback(&mut self) -> Result<OperationHandle, ControlError> {
        self.cancel_if(SessionState::Speaking).await
    }

    /// Cancel whatever operation is active and return to idle
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NothingToCancel` if the session is already idle
    pub async fn cancel(&mut self) -> Result<OperationHandle, ControlError> {
        let state = self.state;
        let handle = self
            .supersede()
            .await
            .ok_or(ControlError::NothingToCancel { state })?;

        tracing::info!(%handle, from = %state, "operation cancelled by user");
        self.publish();
        Ok(handle)
    }

    /// Wait for the next operation to complete and apply it
    ///
    /// Returns `true` if the completion changed the session, `false` if it
    /// was stale and discarded. Cancel-safe: nothing is lost if the future
    /// is dropped before it resolves.
    pub async fn process_next(&mut self) -> bool {
        // The controller keeps a sender, so the channel never closes
        let Some(completion) = self.completions_rx.recv().await else {
            return false;
        };
        self.apply(completion)
    }

    /// Tear the session down, releasing any engaged device
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.supersede().await {
            tracing::debug!(%handle, "cancelled active operation at teardown");
        }
        self.publish();
        tracing::info!(
            conversation_id = self.context.conversation_id(),
            turns = self.transcript.len(),
            "session ended"
        );
    }

    async fn cancel_if(&mut self, expected: SessionState) -> Result<OperationHandle, ControlError> {
        if self.state != expected {
            return Err(ControlError::NothingToCancel { state: self.state });
        }
        self.cancel().await
    }

    /// Apply one completion
    fn apply(&mut self, completion: Completion) -> bool {
        let Completion { handle, outcome } = completion;

        if self.active_handle() != Some(handle) {
            tracing::debug!(
                %handle,
                active = ?self.active_handle(),
                "discarding stale completion"
            );
            return false;
        }

        let Some(finished) = self.active.take() else {
            return false;
        };
        // The task has already reported, dropping the join handle just detaches it

        match (finished.kind, outcome) {
            (OperationKind::Capture, Outcome::Captured(result)) => {
                self.on_captured(handle, result);
            }
            (OperationKind::Submission { message, origin }, Outcome::Replied(result)) => {
                self.on_replied(handle, message, origin, result);
            }
            (OperationKind::Playback, Outcome::Spoken(result)) => {
                self.on_spoken(handle, result);
            }
            (kind, outcome) => {
                tracing::error!(%handle, ?kind, ?outcome, "completion does not match operation");
                self.state = SessionState::Idle;
            }
        }

        self.publish();
        true
    }

    fn on_captured(&mut self, handle: OperationHandle, result: Result<String, ConversationError>) {
        let transcript = result.and_then(|text| {
            let text = text.trim();
            if text.is_empty() {
                Err(ConversationError::CaptureEmpty)
            } else {
                Ok(text.to_string())
            }
        });

        match transcript {
            Ok(text) => {
                tracing::info!(%handle, transcript = %text, "utterance captured");
                self.begin_submission(text, InputOrigin::Voice);
            }
            Err(e) => {
                tracing::warn!(%handle, error = %e, "capture failed");
                self.notice = Some(e);
                self.state = SessionState::Idle;
            }
        }
    }

    fn on_replied(
        &mut self,
        handle: OperationHandle,
        message: String,
        origin: InputOrigin,
        result: Result<String, ConversationError>,
    ) {
        let reply = match result {
            Ok(reply) => {
                let reply = if reply.trim().is_empty() {
                    EMPTY_REPLY.to_string()
                } else {
                    reply
                };
                tracing::info!(%handle, reply_len = reply.len(), "reply received");
                self.persist(ConversationRecord::new(&self.context, message, reply.clone(), origin));
                reply
            }
            Err(e) => {
                tracing::warn!(%handle, error = %e, "turn delivery failed, speaking fallback");
                self.notice = Some(e);
                FALLBACK_REPLY.to_string()
            }
        };

        self.transcript.push(Turn::new(Role::Assistant, reply.clone()));

        let device = Arc::clone(&self.playback);
        let handle = self.launch(
            SessionState::Speaking,
            OperationKind::Playback,
            move |cancel| async move { Some(Outcome::Spoken(device.speak(&reply, cancel).await)) },
        );
        tracing::debug!(%handle, "speaking reply");
    }

    fn on_spoken(&mut self, handle: OperationHandle, result: Result<(), ConversationError>) {
        match result {
            Ok(()) => tracing::debug!(%handle, "playback complete"),
            Err(e) => {
                tracing::warn!(%handle, error = %e, "playback failed");
                self.notice = Some(e);
            }
        }
        self.state = SessionState::Idle;
    }

    /// Append the user turn and send it to the backend
    fn begin_submission(&mut self, message: String, origin: InputOrigin) -> OperationHandle {
        self.transcript.push(Turn::new(Role::User, message.clone()));

        let transport = Arc::clone(&self.transport);
        let conversation_id = self.context.conversation_id().to_string();
        let timeout = self.settings.turn_timeout;
        let body = message.clone();

        let handle = self.launch(
            SessionState::Submitting,
            OperationKind::Submission { message, origin },
            move |cancel| async move {
                let submit = tokio::time::timeout(timeout, transport.submit(&conversation_id, &body));
                tokio::select! {
                    () = cancel.cancelled() => None,
                    result = submit => Some(Outcome::Replied(result.unwrap_or(Err(
                        ConversationError::TransportFailure(TransportFailureKind::Timeout),
                    )))),
                }
            },
        );

        tracing::info!(%handle, ?origin, "submitting turn");
        handle
    }

    /// Spawn an operation and make it the active one
    fn launch<F, Fut>(&mut self, state: SessionState, kind: OperationKind, op: F) -> OperationHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Option<Outcome>> + Send + 'static,
    {
        debug_assert!(self.active.is_none(), "launch with an operation outstanding");

        let handle = OperationHandle::new(self.next_handle);
        self.next_handle += 1;

        let cancel = CancellationToken::new();
        let work = op(cancel.clone());
        let tx = self.completions_tx.clone();

        let task = tokio::spawn(async move {
            if let Some(outcome) = work.await {
                // Receiver only goes away with the controller
                let _ = tx.send(Completion { handle, outcome });
            }
        });

        self.active = Some(ActiveOperation {
            handle,
            kind,
            cancel,
            task,
        });
        self.state = state;
        handle
    }

    /// Cancel the active operation and wait for it to release its device
    ///
    /// Leaves the session idle. Returns the cancelled handle.
    async fn supersede(&mut self) -> Option<OperationHandle> {
        let ActiveOperation {
            handle,
            cancel,
            mut task,
            ..
        } = self.active.take()?;

        cancel.cancel();
        if tokio::time::timeout(self.settings.cancel_grace, &mut task).await.is_err() {
            tracing::warn!(%handle, "operation ignored cancellation, aborting");
            task.abort();
            // Resolves once the aborted future, and any device it holds, is dropped
            let _ = task.await;
        } else {
            tracing::debug!(%handle, "operation released");
        }

        self.state = SessionState::Idle;
        Some(handle)
    }

    /// Hand a completed turn to the store without waiting on it
    fn persist(&self, record: ConversationRecord) {
        let Some(store) = self.store.as_ref().map(Arc::clone) else {
            return;
        };

        tokio::spawn(async move {
            if let Err(e) = store.save(record).await {
                tracing::warn!(error = %e, "failed to persist conversation turn");
            }
        });
    }

    fn publish(&self) {
        debug_assert_eq!(self.state == SessionState::Idle, self.active.is_none());
        self.snapshot_tx.send_replace(self.snapshot());
    }
}
