//! Listener channels and the per-listener delivery loop.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use mirror_protocol::Envelope;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::session::SessionId;
use super::transport::EnvelopeSink;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one listener channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Hub-side end of a listener channel.
///
/// The session owns the only handle for a registered listener, so dropping it
/// closes the channel and ends that listener's delivery loop.
#[derive(Debug)]
pub struct ListenerHandle {
    id: ListenerId,
    tx: mpsc::Sender<Envelope>,
}

impl ListenerHandle {
    /// Allocate a bounded listener channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                id: ListenerId::next(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Second handle for the same channel, to exercise duplicate registration.
    #[cfg(test)]
    pub(crate) fn duplicate(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }

    /// Wait for a free slot and enqueue `envelope`.
    ///
    /// Fails only when the listener has dropped or closed its receiver.
    pub async fn push(&self, envelope: Envelope) -> Result<(), mpsc::error::SendError<Envelope>> {
        self.tx.send(envelope).await
    }
}

/// Message on a session's registration conduit.
#[derive(Debug)]
pub enum Registration {
    /// Add a listener and ask the host for a full resend.
    Register(ListenerHandle),
    /// Remove a listener and close its channel.
    Unregister(ListenerId),
}

/// How a delivery loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The channel was closed by session teardown or removal.
    ChannelClosed,
    /// A write to the listener failed; the listener unregistered itself.
    WriteFailed,
}

/// A registered listener waiting for its transport.
///
/// Returned by a successful join. Call [`deliver`](Self::deliver) once the
/// connection is upgraded. Dropping it without delivering unregisters the
/// listener.
pub struct ListenerSubscription {
    session_id: SessionId,
    id: ListenerId,
    rx: mpsc::Receiver<Envelope>,
    registrations: mpsc::Sender<Registration>,
    finished: bool,
}

impl ListenerSubscription {
    pub(crate) fn new(
        session_id: SessionId,
        id: ListenerId,
        rx: mpsc::Receiver<Envelope>,
        registrations: mpsc::Sender<Registration>,
    ) -> Self {
        Self {
            session_id,
            id,
            rx,
            registrations,
            finished: false,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Drain the listener channel into `sink` until the channel closes or a
    /// write fails.
    pub async fn deliver<S: EnvelopeSink>(mut self, mut sink: S) -> DeliveryOutcome {
        let outcome = loop {
            let Some(envelope) = self.rx.recv().await else {
                break DeliveryOutcome::ChannelClosed;
            };

            if let Err(e) = sink.send_envelope(&envelope).await {
                warn!("[{}] Write to {} failed: {}", self.session_id, self.id, e);
                // Close first so a broadcast waiting on this slot fails fast
                // instead of holding the listener lock against our removal.
                self.rx.close();
                self.unregister().await;
                break DeliveryOutcome::WriteFailed;
            }
        };

        self.finished = true;
        sink.close().await;
        debug!(
            "[{}] Delivery loop for {} ended: {:?}",
            self.session_id, self.id, outcome
        );
        outcome
    }

    async fn unregister(&mut self) {
        if self
            .registrations
            .send(Registration::Unregister(self.id))
            .await
            .is_err()
        {
            debug!(
                "[{}] Session already closed while removing {}",
                self.session_id, self.id
            );
        }
    }
}

impl Drop for ListenerSubscription {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        info!("[{}] {} dropped before delivery started", self.session_id, self.id);
        self.rx.close();

        let message = match self.registrations.try_send(Registration::Unregister(self.id)) {
            Ok(()) => return,
            Err(TrySendError::Closed(_)) => {
                debug!(
                    "[{}] Session already closed while removing {}",
                    self.session_id, self.id
                );
                return;
            }
            Err(TrySendError::Full(message)) => message,
        };

        // The conduit is full while a broadcast is stalled; finish the removal
        // once it drains.
        let Ok(runtime) = Handle::try_current() else {
            warn!(
                "[{}] No runtime to remove {}; it stays registered until the session closes",
                self.session_id, self.id
            );
            return;
        };
        debug!("[{}] Registration queue full, deferring removal of {}", self.session_id, self.id);
        let registrations = self.registrations.clone();
        let session_id = self.session_id.clone();
        let id = self.id;
        runtime.spawn(async move {
            if registrations.send(message).await.is_err() {
                debug!("[{}] Session already closed while removing {}", session_id, id);
            }
        });
    }
}
