//! Shared test utilities
//!
//! Scripted device and transport fakes. Every fake records device
//! engagements in a shared [`DeviceLog`] so tests can assert that devices
//! are released exactly once and never overlap.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use apx_assistant::{
    CaptureDevice, ControllerSettings, ConversationError, ConversationRecord, ConversationStore,
    Error, PlaybackDevice, SessionContext, SessionController, SessionSnapshot, SessionState,
    TransportFailureKind, TurnTransport,
};

/// Counts engagements of the microphone and speaker together
#[derive(Debug, Default)]
pub struct DeviceLog {
    engaged: AtomicUsize,
    released: AtomicUsize,
    active: AtomicUsize,
    overlaps: AtomicUsize,
}

impl DeviceLog {
    pub fn engage(self: &Arc<Self>) -> Engagement {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.engaged.fetch_add(1, Ordering::SeqCst);
        Engagement(Arc::clone(self))
    }

    pub fn engaged(&self) -> usize {
        self.engaged.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

/// A device held by a fake; released on drop, including when its task is aborted
pub struct Engagement(Arc<DeviceLog>);

impl Drop for Engagement {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Capture that yields whatever the test sends, one result per activation
pub struct ScriptedCapture {
    log: Arc<DeviceLog>,
    results: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<String, ConversationError>>>,
    late_transcript: Option<String>,
}

impl ScriptedCapture {
    pub fn new(log: Arc<DeviceLog>) -> (Self, mpsc::UnboundedSender<Result<String, ConversationError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let capture = Self {
            log,
            results: tokio::sync::Mutex::new(rx),
            late_transcript: None,
        };
        (capture, tx)
    }

    /// Still report `text` after being cancelled, like a recognizer that was already finishing
    pub fn with_late_transcript(mut self, text: &str) -> Self {
        self.late_transcript = Some(text.to_string());
        self
    }
}

#[async_trait]
impl CaptureDevice for ScriptedCapture {
    async fn capture(&self, cancel: CancellationToken) -> Result<String, ConversationError> {
        let _mic = self.log.engage();
        let mut results = self.results.lock().await;

        tokio::select! {
            biased;
            () = cancel.cancelled() => self
                .late_transcript
                .clone()
                .ok_or(ConversationError::CaptureEmpty),
            result = results.recv() => result.unwrap_or_else(|| {
                Err(ConversationError::CaptureUnavailable("script exhausted".into()))
            }),
        }
    }
}

/// Playback that runs until the test finishes it or it is cancelled
pub struct ScriptedPlayback {
    log: Arc<DeviceLog>,
    outcomes: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<(), ConversationError>>>,
    spoken: Mutex<Vec<String>>,
    interrupted: AtomicUsize,
}

impl ScriptedPlayback {
    pub fn new(log: Arc<DeviceLog>) -> (Self, mpsc::UnboundedSender<Result<(), ConversationError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let playback = Self {
            log,
            outcomes: tokio::sync::Mutex::new(rx),
            spoken: Mutex::new(Vec::new()),
            interrupted: AtomicUsize::new(0),
        };
        (playback, tx)
    }

    /// Texts passed to `speak`, in call order
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    /// How many playbacks were stopped by cancellation
    pub fn interrupted(&self) -> usize {
        self.interrupted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybackDevice for ScriptedPlayback {
    async fn speak(&self, text: &str, cancel: CancellationToken) -> Result<(), ConversationError> {
        let _speaker = self.log.engage();
        self.spoken.lock().unwrap().push(text.to_string());
        let mut outcomes = self.outcomes.lock().await;

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.interrupted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            outcome = outcomes.recv() => outcome.unwrap_or(Ok(())),
        }
    }
}

/// Device that holds the microphone or speaker and never honors cancellation
pub struct StubbornDevice {
    log: Arc<DeviceLog>,
}

impl StubbornDevice {
    pub fn new(log: Arc<DeviceLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl CaptureDevice for StubbornDevice {
    async fn capture(&self, _cancel: CancellationToken) -> Result<String, ConversationError> {
        let _mic = self.log.engage();
        std::future::pending().await
    }
}

#[async_trait]
impl PlaybackDevice for StubbornDevice {
    async fn speak(&self, _text: &str, _cancel: CancellationToken) -> Result<(), ConversationError> {
        let _speaker = self.log.engage();
        std::future::pending().await
    }
}

/// Transport that answers with whatever the test sends, or never
pub struct ScriptedTransport {
    calls: Mutex<Vec<(String, String)>>,
    replies: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<String, ConversationError>>>,
}

impl ScriptedTransport {
    pub fn new() -> (Self, mpsc::UnboundedSender<Result<String, ConversationError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            calls: Mutex::new(Vec::new()),
            replies: tokio::sync::Mutex::new(rx),
        };
        (transport, tx)
    }

    /// `(conversation_id, message)` of every submission, in call order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TurnTransport for ScriptedTransport {
    async fn submit(&self, conversation_id: &str, message: &str) -> Result<String, ConversationError> {
        self.calls
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), message.to_string()));

        let mut replies = self.replies.lock().await;
        replies
            .recv()
            .await
            .unwrap_or(Err(ConversationError::TransportFailure(TransportFailureKind::Network)))
    }
}

/// Store that keeps records in memory, optionally failing every save
#[derive(Default)]
pub struct RecordingStore {
    records: Mutex<Vec<ConversationRecord>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<ConversationRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait until `n` saves were attempted
    pub async fn wait_for_attempts(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.attempts() < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("store was not called");
    }
}

#[async_trait]
impl ConversationStore for RecordingStore {
    async fn save(&self, record: ConversationRecord) -> apx_assistant::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Database("disk full".into()));
        }
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

/// A controller wired to scripted fakes
pub struct Harness {
    pub controller: SessionController,
    pub log: Arc<DeviceLog>,
    pub capture: mpsc::UnboundedSender<Result<String, ConversationError>>,
    pub playback: Arc<ScriptedPlayback>,
    pub finish_playback: mpsc::UnboundedSender<Result<(), ConversationError>>,
    pub transport: Arc<ScriptedTransport>,
    pub reply: mpsc::UnboundedSender<Result<String, ConversationError>>,
    pub store: Arc<RecordingStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(None, RecordingStore::default(), ControllerSettings::default())
    }

    pub fn with_late_transcript(text: &str) -> Self {
        Self::build(Some(text), RecordingStore::default(), ControllerSettings::default())
    }

    pub fn with_store(store: RecordingStore) -> Self {
        Self::build(None, store, ControllerSettings::default())
    }

    pub fn with_turn_timeout(timeout: Duration) -> Self {
        let settings = ControllerSettings {
            turn_timeout: timeout,
            ..ControllerSettings::default()
        };
        Self::build(None, RecordingStore::default(), settings)
    }

    fn build(late_transcript: Option<&str>, store: RecordingStore, settings: ControllerSettings) -> Self {
        let log = Arc::new(DeviceLog::default());

        let (capture, capture_tx) = ScriptedCapture::new(Arc::clone(&log));
        let capture = match late_transcript {
            Some(text) => capture.with_late_transcript(text),
            None => capture,
        };
        let (playback, finish_playback) = ScriptedPlayback::new(Arc::clone(&log));
        let playback = Arc::new(playback);
        let (transport, reply) = ScriptedTransport::new();
        let transport = Arc::new(transport);
        let store = Arc::new(store);

        let context = SessionContext::with_conversation_id("conv-test", Some("user-test".into()));
        let controller = SessionController::new(
            context,
            Arc::new(capture),
            Arc::clone(&playback) as Arc<dyn PlaybackDevice>,
            Arc::clone(&transport) as Arc<dyn TurnTransport>,
        )
        .with_store(Arc::clone(&store) as Arc<dyn ConversationStore>)
        .with_settings(settings);

        Self {
            controller,
            log,
            capture: capture_tx,
            playback,
            finish_playback,
            transport,
            reply,
            store,
        }
    }

    /// Let spawned operation tasks run up to their next await point
    pub async fn settle(&self) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }
}

/// Assert the idle/handle invariant and single device ownership
pub fn assert_consistent(snapshot: &SessionSnapshot, log: &DeviceLog) {
    assert_eq!(
        snapshot.state == SessionState::Idle,
        snapshot.active.is_none(),
        "state {} with active {:?}",
        snapshot.state,
        snapshot.active
    );
    assert!(log.active() <= 1, "{} devices engaged at once", log.active());
    assert_eq!(log.overlaps(), 0, "device engagements overlapped");
}
