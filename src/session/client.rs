//! Cloneable handle to a controller running on its own task
//!
//! Commands from presentation code and operation completions are
//! dispatched from one loop, so the controller sees them strictly one at a
//! time in the order they were accepted.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::{OperationHandle, SessionController, SessionSnapshot};
use crate::ControlError;

/// Command queue depth
const COMMAND_BUFFER: usize = 32;

type Reply = oneshot::Sender<Result<OperationHandle, ControlError>>;

enum Command {
    ActivateCapture(Reply),
    CancelCapture(Reply),
    SubmitText(String, Reply),
    CancelPlayback(Reply),
    Cancel(Reply),
    Shutdown(oneshot::Sender<()>),
}

/// User-facing controls for a running session
#[derive(Clone)]
pub struct SessionClient {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionClient {
    /// Move `controller` onto its own task and return a client for it
    ///
    /// The task ends after [`shutdown`](Self::shutdown) or once every
    /// client has been dropped; either way the active operation is cancelled.
    #[must_use]
    pub fn spawn(controller: SessionController) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let snapshots = controller.subscribe();
        let task = tokio::spawn(run(controller, rx));
        (Self { commands, snapshots }, task)
    }

    /// Start listening for one utterance
    ///
    /// # Errors
    ///
    /// See [`SessionController::activate_capture`]
    pub async fn activate_capture(&self) -> Result<OperationHandle, ControlError> {
        self.request(Command::ActivateCapture).await
    }

    /// Stop an in-progress capture
    ///
    /// # Errors
    ///
    /// See [`SessionController::cancel_capture`]
    pub async fn cancel_capture(&self) -> Result<OperationHandle, ControlError> {
        self.request(Command::CancelCapture).await
    }

    /// Submit typed text as a user turn
    ///
    /// # Errors
    ///
    /// See [`SessionController::submit_text`]
    pub async fn submit_text(&self, text: impl Into<String>) -> Result<OperationHandle, ControlError> {
        let text = text.into();
        self.request(|reply| Command::SubmitText(text, reply)).await
    }

    /// Stop the reply being spoken
    ///
    /// # Errors
    ///
    /// See [`SessionController::cancel_playback`]
    pub async fn cancel_playback(&self) -> Result<OperationHandle, ControlError> {
        self.request(Command::CancelPlayback).await
    }

    /// Cancel whatever is active
    ///
    /// # Errors
    ///
    /// See [`SessionController::cancel`]
    pub async fn cancel(&self) -> Result<OperationHandle, ControlError> {
        self.request(Command::Cancel).await
    }

    /// Latest published snapshot
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Observe state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Tear the session down and wait until its devices are released
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn request<F>(&self, make: F) -> Result<OperationHandle, ControlError>
    where
        F: FnOnce(Reply) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ControlError::SessionClosed)?;
        rx.await.map_err(|_| ControlError::SessionClosed)?
    }
}

async fn run(mut controller: SessionController, mut commands: mpsc::Receiver<Command>) {
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    tracing::debug!("all session clients dropped");
                    break;
                };
                match command {
                    Command::ActivateCapture(reply) => {
                        let _ = reply.send(controller.activate_capture().await);
                    }
                    Command::CancelCapture(reply) => {
                        let _ = reply.send(controller.cancel_capture().await);
                    }
                    Command::SubmitText(text, reply) => {
                        let _ = reply.send(controller.submit_text(&text).await);
                    }
                    Command::CancelPlayback(reply) => {
                        let _ = reply.send(controller.cancel_playback().await);
                    }
                    Command::Cancel(reply) => {
                        let _ = reply.send(controller.cancel().await);
                    }
                    Command::Shutdown(done) => {
                        controller.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                }
            }
            _ = controller.process_next() => {}
        }
    }

    controller.shutdown().await;
}
