//! The push transport: a live change subscription per session.

use crate::backend::{PushSignal, SessionBackend, Subscription};
use crate::error::EngineError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tabletalk_model::{decode_row, Delta, EntityKind, SessionId, SourceTransport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What happened on the push channel.
#[derive(Debug, Clone)]
pub enum PushEventKind {
    /// The subscription was acknowledged and is live.
    Connected,
    /// Typed deltas arrived on the live subscription.
    Deltas(Vec<Delta>),
    /// The subscribe/acknowledge step failed.
    ConnectFailed(String),
    /// The live subscription reported an error.
    ChannelError(String),
    /// The live subscription closed unexpectedly.
    Closed,
}

/// A push channel event, tagged with the channel epoch that produced it.
///
/// The epoch advances on every open, so events still queued from a
/// torn-down subscription can be recognized and dropped. A closed
/// channel must never feed deltas into the store.
#[derive(Debug, Clone)]
pub struct PushEvent {
    /// Epoch of the subscription that produced this event.
    pub epoch: u64,
    /// The event itself.
    pub kind: PushEventKind,
}

/// Opens and monitors the live change subscription for one session.
///
/// At most one logical subscription exists at a time: opening closes any
/// previous subscription first, and `close` is idempotent. Errors never
/// propagate to the caller as panics; they surface as events for the
/// supervisor to count.
pub struct PushChannel<B> {
    backend: Arc<B>,
    ack_timeout: Duration,
    task: Option<JoinHandle<()>>,
    /// Shared with the listener task so `close` can release the remote
    /// subscription synchronously instead of waiting for the abort to
    /// land.
    active: Option<Arc<Mutex<Option<Subscription>>>>,
    epoch: u64,
}

impl<B: SessionBackend> PushChannel<B> {
    /// Creates a closed push channel.
    pub fn new(backend: Arc<B>, ack_timeout: Duration) -> Self {
        Self {
            backend,
            ack_timeout,
            task: None,
            active: None,
            epoch: 0,
        }
    }

    /// Returns the epoch of the most recently opened subscription.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns true if a subscription task is running.
    pub fn is_open(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Opens a subscription for `session`, closing any previous one first.
    ///
    /// The subscribe/acknowledge step runs in a background task so the
    /// caller's event loop never stalls on it; the outcome arrives as a
    /// `Connected` or `ConnectFailed` event. Returns the new epoch.
    pub fn open(
        &mut self,
        session: &SessionId,
        events: mpsc::UnboundedSender<PushEvent>,
    ) -> u64 {
        self.close();
        self.epoch += 1;
        let epoch = self.epoch;

        let backend = Arc::clone(&self.backend);
        let session = session.clone();
        let ack_timeout = self.ack_timeout;
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        self.active = Some(Arc::clone(&slot));

        self.task = Some(tokio::spawn(async move {
            let (sink, signals) = mpsc::unbounded_channel();
            let ack = tokio::time::timeout(
                ack_timeout,
                backend.subscribe_changes(&session, &EntityKind::ALL, sink),
            )
            .await;

            let subscription = match ack {
                Err(_) => {
                    let reason =
                        EngineError::AckTimeout(ack_timeout.as_millis() as u64).to_string();
                    let _ = events.send(PushEvent {
                        epoch,
                        kind: PushEventKind::ConnectFailed(reason),
                    });
                    return;
                }
                Ok(Err(err)) => {
                    let _ = events.send(PushEvent {
                        epoch,
                        kind: PushEventKind::ConnectFailed(err.to_string()),
                    });
                    return;
                }
                Ok(Ok(subscription)) => subscription,
            };

            // Parked in the shared slot before the acknowledgment is
            // reported, so `close` always finds it there.
            *slot.lock() = Some(subscription);

            let _ = events.send(PushEvent {
                epoch,
                kind: PushEventKind::Connected,
            });

            forward(signals, events, epoch).await;
            slot.lock().take();
        }));

        epoch
    }

    /// Tears down the subscription. Idempotent.
    ///
    /// The remote subscription is released before this returns; only the
    /// listener task's final abort is asynchronous.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(slot) = self.active.take() {
            slot.lock().take();
        }
    }
}

impl<B> Drop for PushChannel<B> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(slot) = self.active.take() {
            slot.lock().take();
        }
    }
}

async fn forward(
    mut signals: mpsc::UnboundedReceiver<PushSignal>,
    events: mpsc::UnboundedSender<PushEvent>,
    epoch: u64,
) {
    while let Some(signal) = signals.recv().await {
        let kind = match signal {
            PushSignal::Rows(rows) => {
                let mut deltas = Vec::with_capacity(rows.len());
                for row in &rows {
                    match decode_row(row, SourceTransport::Push) {
                        Ok(delta) => deltas.push(delta),
                        Err(err) => {
                            tracing::warn!(error = %err, "discarding malformed push row");
                        }
                    }
                }
                if deltas.is_empty() {
                    continue;
                }
                PushEventKind::Deltas(deltas)
            }
            PushSignal::Error(message) => PushEventKind::ChannelError(message),
            PushSignal::Closed => {
                let _ = events.send(PushEvent {
                    epoch,
                    kind: PushEventKind::Closed,
                });
                return;
            }
        };
        if events.send(PushEvent { epoch, kind }).is_err() {
            return;
        }
    }
}
