//! Session controller integration tests
//!
//! Drives the controller through scripted devices and transport, covering
//! turn flow, cancellation, stale results and device ownership.

use std::sync::Arc;
use std::time::Duration;

use apx_assistant::session::{EMPTY_REPLY, FALLBACK_REPLY};
use apx_assistant::{
    ControlError, ControllerSettings, ConversationError, InputOrigin, Role, SessionContext,
    SessionController, SessionState, TransportFailureKind,
};

mod common;

use common::{
    DeviceLog, Harness, RecordingStore, ScriptedTransport, StubbornDevice, assert_consistent,
};

const CHEST_PAIN_REPLY: &str = "Call emergency services and keep the person seated.";

#[tokio::test]
async fn test_typed_turn_flows_to_speaking() {
    let mut h = Harness::new();

    let handle = h.controller.submit_text("chest pain").await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Submitting);
    assert_eq!(h.controller.active_handle(), Some(handle));

    h.reply.send(Ok(CHEST_PAIN_REPLY.into())).unwrap();
    assert!(h.controller.process_next().await);

    assert_eq!(h.controller.state(), SessionState::Speaking);
    let transcript = h.controller.transcript();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role(), Role::User);
    assert_eq!(transcript[0].content(), "chest pain");
    assert_eq!(transcript[1].role(), Role::Assistant);
    assert_eq!(transcript[1].content(), CHEST_PAIN_REPLY);

    h.finish_playback.send(Ok(())).unwrap();
    assert!(h.controller.process_next().await);

    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.controller.active_handle(), None);
    assert_eq!(h.playback.spoken(), vec![CHEST_PAIN_REPLY.to_string()]);
    assert_eq!(
        h.transport.calls(),
        vec![("conv-test".to_string(), "chest pain".to_string())]
    );
    assert_eq!(h.log.engaged(), 1);
    assert_eq!(h.log.released(), 1);
}

#[tokio::test]
async fn test_voice_turn_is_trimmed_and_submitted() {
    let mut h = Harness::new();

    h.controller.activate_capture().await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Listening);

    h.capture.send(Ok("  I cut my hand  ".into())).unwrap();
    assert!(h.controller.process_next().await);

    assert_eq!(h.controller.state(), SessionState::Submitting);
    assert_eq!(h.controller.transcript()[0].content(), "I cut my hand");

    h.reply.send(Ok("Apply pressure.".into())).unwrap();
    assert!(h.controller.process_next().await);
    h.store.wait_for_attempts(1).await;

    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].conversation_id, "conv-test");
    assert_eq!(records[0].user_id.as_deref(), Some("user-test"));
    assert_eq!(records[0].message, "I cut my hand");
    assert_eq!(records[0].response, "Apply pressure.");
    assert_eq!(records[0].origin, InputOrigin::Voice);
}

#[tokio::test]
async fn test_cancel_capture_discards_late_transcript() {
    let mut h = Harness::with_late_transcript("late words");

    let handle = h.controller.activate_capture().await.unwrap();
    h.settle().await;
    assert_eq!(h.log.active(), 1);

    let cancelled = h.controller.cancel_capture().await.unwrap();
    assert_eq!(cancelled, handle);
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.controller.active_handle(), None);

    // The cancelled capture still reported its transcript; it must be dropped
    assert!(!h.controller.process_next().await);

    assert!(h.controller.transcript().is_empty());
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert!(h.transport.calls().is_empty());
    assert_eq!(h.log.engaged(), 1);
    assert_eq!(h.log.released(), 1);
}

#[tokio::test]
async fn test_queued_reply_is_discarded_after_cancel() {
    let mut h = Harness::new();

    h.controller.submit_text("chest pain").await.unwrap();
    h.reply.send(Ok(CHEST_PAIN_REPLY.into())).unwrap();

    // The reply is already waiting in the completion queue
    h.settle().await;
    assert_eq!(h.transport.calls().len(), 1);

    h.controller.cancel().await.unwrap();
    assert!(!h.controller.process_next().await);

    assert_eq!(h.controller.transcript().len(), 1);
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert!(h.playback.spoken().is_empty());
    h.settle().await;
    assert_eq!(h.store.attempts(), 0);
}

#[tokio::test]
async fn test_queued_playback_end_is_discarded_after_barge_in() {
    let mut h = Harness::new();

    h.controller.submit_text("chest pain").await.unwrap();
    h.reply.send(Ok(CHEST_PAIN_REPLY.into())).unwrap();
    assert!(h.controller.process_next().await);
    assert_eq!(h.controller.state(), SessionState::Speaking);

    // Playback finishes, but the user speaks before it is applied
    h.finish_playback.send(Ok(())).unwrap();
    h.settle().await;

    let handle = h.controller.activate_capture().await.unwrap();
    assert!(!h.controller.process_next().await);

    assert_eq!(h.controller.state(), SessionState::Listening);
    assert_eq!(h.controller.active_handle(), Some(handle));
    assert_eq!(h.controller.transcript().len(), 2);
    assert_eq!(h.playback.interrupted(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transport_timeout_speaks_fallback_then_idles() {
    let mut h = Harness::with_turn_timeout(Duration::from_secs(5));

    h.controller.submit_text("help").await.unwrap();

    // No reply is ever sent; the paused clock jumps to the timeout
    assert!(h.controller.process_next().await);

    assert_eq!(h.controller.state(), SessionState::Speaking);
    assert_eq!(
        h.controller.notice(),
        Some(&ConversationError::TransportFailure(TransportFailureKind::Timeout))
    );
    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.last_reply().map(|t| t.content()), Some(FALLBACK_REPLY));

    h.finish_playback.send(Ok(())).unwrap();
    assert!(h.controller.process_next().await);

    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.playback.spoken(), vec![FALLBACK_REPLY.to_string()]);

    // Fallback turns are not persisted
    h.settle().await;
    assert_eq!(h.store.attempts(), 0);
}

#[tokio::test]
async fn test_transport_failure_speaks_fallback() {
    let mut h = Harness::new();

    h.controller.submit_text("help").await.unwrap();
    h.reply
        .send(Err(ConversationError::TransportFailure(TransportFailureKind::Status(502))))
        .unwrap();
    assert!(h.controller.process_next().await);

    assert_eq!(h.controller.state(), SessionState::Speaking);
    assert_eq!(h.controller.transcript().len(), 2);
    assert_eq!(h.controller.transcript()[1].content(), FALLBACK_REPLY);
}

#[tokio::test]
async fn test_empty_reply_is_defaulted() {
    let mut h = Harness::new();

    h.controller.submit_text("hello?").await.unwrap();
    h.reply.send(Ok("   ".into())).unwrap();
    assert!(h.controller.process_next().await);

    assert_eq!(h.controller.transcript()[1].content(), EMPTY_REPLY);
    assert_eq!(h.controller.notice(), None);
}

#[tokio::test]
async fn test_barge_in_hands_off_without_idle_gap() {
    let mut h = Harness::new();
    let mut observer = h.controller.subscribe();

    h.controller.submit_text("chest pain").await.unwrap();
    h.reply.send(Ok(CHEST_PAIN_REPLY.into())).unwrap();
    assert!(h.controller.process_next().await);
    assert_eq!(h.controller.state(), SessionState::Speaking);
    h.settle().await;
    assert_eq!(h.log.active(), 1);

    observer.borrow_and_update();
    let watcher = tokio::spawn(async move {
        let mut seen = Vec::new();
        while observer.changed().await.is_ok() {
            let snapshot = observer.borrow_and_update().clone();
            seen.push((snapshot.state, snapshot.active));
            if snapshot.state == SessionState::Listening {
                break;
            }
        }
        seen
    });

    let handle = h.controller.activate_capture().await.unwrap();
    let seen = watcher.await.unwrap();

    assert_eq!(seen, vec![(SessionState::Listening, Some(handle))]);
    assert_eq!(h.playback.interrupted(), 1);
    assert_eq!(h.log.released(), 1);

    h.settle().await;
    assert_eq!(h.log.active(), 1);
    assert_eq!(h.log.overlaps(), 0);
}

#[tokio::test]
async fn test_submit_while_submitting_is_rejected() {
    let mut h = Harness::new();

    h.controller.submit_text("first").await.unwrap();
    h.settle().await;

    let second = h.controller.submit_text("second").await;
    assert_eq!(
        second,
        Err(ControlError::Busy {
            state: SessionState::Submitting
        })
    );

    h.settle().await;
    assert_eq!(h.transport.calls().len(), 1);
    assert_eq!(h.controller.transcript().len(), 1);
}

#[tokio::test]
async fn test_blank_text_is_rejected() {
    let mut h = Harness::new();

    assert_eq!(h.controller.submit_text("   ").await, Err(ControlError::EmptyMessage));
    assert_eq!(h.controller.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_double_activation_is_rejected() {
    let mut h = Harness::new();

    let first = h.controller.activate_capture().await.unwrap();
    let second = h.controller.activate_capture().await;

    assert_eq!(
        second,
        Err(ControlError::Busy {
            state: SessionState::Listening
        })
    );
    assert_eq!(h.controller.active_handle(), Some(first));
}

#[tokio::test]
async fn test_text_preempts_listening() {
    let mut h = Harness::new();

    h.controller.activate_capture().await.unwrap();
    h.settle().await;

    h.controller.submit_text("typed instead").await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Submitting);
    assert_eq!(h.log.released(), 1);

    // The cancelled capture's completion is stale and skipped
    h.reply.send(Ok("ok".into())).unwrap();
    while h.controller.state() == SessionState::Submitting {
        h.controller.process_next().await;
    }
    assert_eq!(h.controller.state(), SessionState::Speaking);
    assert_eq!(h.controller.transcript()[0].content(), "typed instead");
}

#[tokio::test]
async fn test_cancel_releases_each_device_once() {
    let mut h = Harness::new();

    // Listening
    h.controller.activate_capture().await.unwrap();
    h.settle().await;
    h.controller.cancel().await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!((h.log.engaged(), h.log.released()), (1, 1));

    // Submitting: no device is engaged
    h.controller.submit_text("hello").await.unwrap();
    h.settle().await;
    h.controller.cancel().await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!((h.log.engaged(), h.log.released()), (1, 1));

    // Speaking
    h.controller.submit_text("hello again").await.unwrap();
    h.reply.send(Ok("hi".into())).unwrap();
    while h.controller.state() != SessionState::Speaking {
        h.controller.process_next().await;
    }
    h.settle().await;
    h.controller.cancel_playback().await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!((h.log.engaged(), h.log.released()), (2, 2));
    assert_eq!(h.log.active(), 0);

    // Nothing left to cancel
    assert_eq!(
        h.controller.cancel().await,
        Err(ControlError::NothingToCancel {
            state: SessionState::Idle
        })
    );
    assert_eq!(h.log.released(), 2);
}

#[tokio::test]
async fn test_targeted_cancel_requires_matching_state() {
    let mut h = Harness::new();

    h.controller.activate_capture().await.unwrap();
    assert_eq!(
        h.controller.cancel_playback().await,
        Err(ControlError::NothingToCancel {
            state: SessionState::Listening
        })
    );
    assert_eq!(h.controller.state(), SessionState::Listening);
}

#[tokio::test]
async fn test_capture_errors_return_to_idle_with_notice() {
    let mut h = Harness::new();

    h.controller.activate_capture().await.unwrap();
    h.capture.send(Err(ConversationError::CapturePermissionDenied)).unwrap();
    assert!(h.controller.process_next().await);

    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.controller.notice(), Some(&ConversationError::CapturePermissionDenied));
    assert!(h.controller.transcript().is_empty());

    // A blank transcript counts as no speech
    h.controller.activate_capture().await.unwrap();
    assert_eq!(h.controller.notice(), None);
    h.capture.send(Ok("   ".into())).unwrap();
    assert!(h.controller.process_next().await);

    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.controller.notice(), Some(&ConversationError::CaptureEmpty));
    assert_eq!(h.log.engaged(), h.log.released());
}

#[tokio::test]
async fn test_playback_failure_returns_to_idle() {
    let mut h = Harness::new();

    h.controller.submit_text("hello").await.unwrap();
    h.reply.send(Ok("hi".into())).unwrap();
    assert!(h.controller.process_next().await);

    h.finish_playback
        .send(Err(ConversationError::PlaybackUnavailable("no output device".into())))
        .unwrap();
    assert!(h.controller.process_next().await);

    assert_eq!(h.controller.state(), SessionState::Idle);
    assert!(matches!(
        h.controller.notice(),
        Some(ConversationError::PlaybackUnavailable(_))
    ));
    assert_eq!(h.controller.transcript().len(), 2);
}

#[tokio::test]
async fn test_persistence_failure_is_swallowed() {
    let mut h = Harness::with_store(RecordingStore::failing());

    h.controller.submit_text("chest pain").await.unwrap();
    h.reply.send(Ok(CHEST_PAIN_REPLY.into())).unwrap();
    assert!(h.controller.process_next().await);
    h.store.wait_for_attempts(1).await;

    assert_eq!(h.controller.state(), SessionState::Speaking);
    assert_eq!(h.controller.notice(), None);

    h.finish_playback.send(Ok(())).unwrap();
    assert!(h.controller.process_next().await);
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.controller.notice(), None);
}

#[tokio::test]
async fn test_invariants_hold_across_trigger_sequence() {
    let mut h = Harness::new();

    macro_rules! check {
        () => {
            h.settle().await;
            assert_consistent(&h.controller.snapshot(), &h.log);
        };
    }

    h.controller.activate_capture().await.unwrap();
    check!();
    h.controller.submit_text("typed").await.unwrap();
    check!();
    let _ = h.controller.submit_text("again").await;
    check!();
    let _ = h.controller.cancel_capture().await;
    check!();
    h.controller.activate_capture().await.unwrap();
    check!();
    h.capture.send(Ok("spoken".into())).unwrap();
    while h.controller.state() == SessionState::Listening {
        h.controller.process_next().await;
        check!();
    }
    h.reply.send(Ok("reply".into())).unwrap();
    while h.controller.state() == SessionState::Submitting {
        h.controller.process_next().await;
        check!();
    }
    assert_eq!(h.controller.state(), SessionState::Speaking);
    h.controller.activate_capture().await.unwrap();
    check!();
    h.controller.cancel().await.unwrap();
    check!();
    let _ = h.controller.cancel().await;
    check!();

    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.log.engaged(), h.log.released());

    let roles: Vec<Role> = h.controller.transcript().iter().map(|t| t.role()).collect();
    assert_eq!(roles, vec![Role::User, Role::User, Role::Assistant]);
}

#[tokio::test]
async fn test_shutdown_releases_active_device() {
    let h = Harness::new();
    let log = std::sync::Arc::clone(&h.log);
    let mut controller = h.controller;

    controller.activate_capture().await.unwrap();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(log.active(), 1);

    let observer = controller.subscribe();
    controller.shutdown().await;

    assert_eq!(log.active(), 0);
    assert_eq!(log.released(), 1);
    assert_eq!(observer.borrow().state, SessionState::Idle);
}

/// Controller whose devices ignore cancellation
fn stubborn_controller(
    log: &Arc<DeviceLog>,
) -> (
    SessionController,
    tokio::sync::mpsc::UnboundedSender<Result<String, ConversationError>>,
) {
    let device = Arc::new(StubbornDevice::new(Arc::clone(log)));
    let (transport, reply) = ScriptedTransport::new();
    let context = SessionContext::with_conversation_id("conv-test", None);

    let controller = SessionController::new(
        context,
        Arc::clone(&device) as Arc<dyn apx_assistant::CaptureDevice>,
        device as Arc<dyn apx_assistant::PlaybackDevice>,
        Arc::new(transport),
    )
    .with_settings(ControllerSettings {
        cancel_grace: Duration::from_millis(20),
        ..ControllerSettings::default()
    });

    (controller, reply)
}

async fn wait_until<F: Fn() -> bool>(pred: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn test_cancel_waits_for_aborted_capture_to_release() {
    let log = Arc::new(DeviceLog::default());
    let (mut controller, _reply) = stubborn_controller(&log);

    controller.activate_capture().await.unwrap();
    wait_until(|| log.active() == 1).await;

    controller.cancel().await.unwrap();

    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(log.active(), 0);
    assert_eq!(log.released(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_barge_in_never_overlaps_stubborn_playback() {
    let log = Arc::new(DeviceLog::default());
    let (mut controller, reply) = stubborn_controller(&log);

    controller.submit_text("chest pain").await.unwrap();
    reply.send(Ok(CHEST_PAIN_REPLY.into())).unwrap();
    assert!(controller.process_next().await);
    assert_eq!(controller.state(), SessionState::Speaking);
    wait_until(|| log.active() == 1).await;

    controller.activate_capture().await.unwrap();
    assert_eq!(log.released(), 1);

    wait_until(|| log.engaged() == 2).await;
    assert_eq!(log.active(), 1);
    assert_eq!(log.overlaps(), 0);

    controller.shutdown().await;
    assert_eq!(log.active(), 0);
}
