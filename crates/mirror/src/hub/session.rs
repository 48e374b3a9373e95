//! One host, its listeners, and the two loops that serve them.

use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use mirror_protocol::Envelope;
use tokio::sync::{Mutex, mpsc, watch};

use super::error::HubError;
use super::listener::{ListenerHandle, ListenerId, ListenerSubscription, Registration};
use super::registry::SessionRegistry;
use super::transport::{EnvelopeSink, EnvelopeSource, Inbound};

/// Opaque session identifier (a UUID string).
pub type SessionId = String;

/// Lifecycle of a session. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        self == SessionState::Active
    }
}

/// A live relay session.
///
/// `listeners` doubles as the session lock: state transitions, registration
/// changes and broadcasts all happen while it is held. The current state is
/// published on a watch channel so loops and lookups can read it without
/// taking the lock.
pub struct Session {
    id: SessionId,
    registrations: mpsc::Sender<Registration>,
    listeners: Mutex<Vec<ListenerHandle>>,
    state: watch::Sender<SessionState>,
    registry: Weak<SessionRegistry>,
    listener_buffer: usize,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        registrations: mpsc::Sender<Registration>,
        registry: Weak<SessionRegistry>,
        listener_buffer: usize,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Active);
        Arc::new(Self {
            id,
            registrations,
            listeners: Mutex::new(Vec::new()),
            state,
            registry,
            listener_buffer,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.state().is_active()
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }

    /// Register a new listener channel.
    ///
    /// The listener is added (and the host asked to resend) asynchronously by
    /// the registration loop, in the order joins arrive. Fails if the session
    /// has left `Active` by the time the registration is queued.
    pub async fn subscribe(&self) -> Result<ListenerSubscription, HubError> {
        let (handle, rx) = ListenerHandle::channel(self.listener_buffer);
        let listener_id = handle.id();
        self.registrations
            .send(Registration::Register(handle))
            .await
            .map_err(|_| HubError::SessionNotFound(self.id.clone()))?;

        // Teardown may have started while the send was in flight. The queued
        // handle is dropped with the conduit.
        if !self.is_alive() {
            return Err(HubError::SessionNotFound(self.id.clone()));
        }

        Ok(ListenerSubscription::new(
            self.id.clone(),
            listener_id,
            rx,
            self.registrations.clone(),
        ))
    }

    /// Apply registrations until the session stops being active.
    ///
    /// Owns the host's write half: every added listener triggers a `RESEND`,
    /// and a failed `RESEND` tears the session down.
    pub(crate) async fn run_registrations<S: EnvelopeSink>(
        self: Arc<Self>,
        mut registrations: mpsc::Receiver<Registration>,
        mut host: S,
    ) {
        let mut state = self.state.subscribe();

        loop {
            let registration = tokio::select! {
                biased;
                _ = stopped(&mut state) => break,
                registration = registrations.recv() => match registration {
                    Some(registration) => registration,
                    None => break,
                },
            };

            match registration {
                Registration::Register(handle) => {
                    match self.add_listener(handle).await {
                        Added::New => {}
                        Added::Duplicate => continue,
                        Added::SessionClosed => break,
                    }

                    if let Err(e) = host.send_envelope(&Envelope::resend()).await {
                        warn!("[{}] Failed to request resend from host: {}", self.id, e);
                        self.close().await;
                        break;
                    }
                }
                Registration::Unregister(listener_id) => {
                    self.remove_listener(listener_id).await;
                }
            }
        }

        registrations.close();
        host.close().await;
        debug!("[{}] Registration loop ended", self.id);
    }

    async fn add_listener(&self, handle: ListenerHandle) -> Added {
        let mut listeners = self.listeners.lock().await;
        if !self.is_alive() {
            return Added::SessionClosed;
        }

        let listener_id = handle.id();
        if listeners.iter().any(|l| l.id() == listener_id) {
            warn!("[{}] {} is already registered", self.id, listener_id);
            return Added::Duplicate;
        }

        listeners.push(handle);
        info!(
            "[{}] Setup new listener {} ({} total)",
            self.id,
            listener_id,
            listeners.len()
        );
        Added::New
    }

    async fn remove_listener(&self, listener_id: ListenerId) {
        let mut listeners = self.listeners.lock().await;
        let Some(idx) = listeners.iter().position(|l| l.id() == listener_id) else {
            debug!("[{}] {} was not registered", self.id, listener_id);
            return;
        };

        // Dropping the handle closes the listener's channel.
        drop(listeners.swap_remove(idx));
        info!(
            "[{}] Listener {} left ({} remaining)",
            self.id,
            listener_id,
            listeners.len()
        );
    }

    /// Read envelopes from the host and broadcast them until the host closes or
    /// the session stops being active.
    pub(crate) async fn run_forwarder<S: EnvelopeSource>(self: Arc<Self>, mut host: S) {
        let mut state = self.state.subscribe();

        loop {
            let inbound = tokio::select! {
                biased;
                _ = stopped(&mut state) => break,
                inbound = host.next_inbound() => inbound,
            };

            match inbound {
                Inbound::Envelope(envelope) => {
                    debug!("[{}] Received: {}", self.id, envelope.kind);
                    if !self.broadcast(envelope).await {
                        break;
                    }
                }
                Inbound::Malformed(e) => {
                    if !self.is_alive() {
                        break;
                    }
                    warn!("[{}] Decode err: {}", self.id, e);
                }
                Inbound::Interrupted(e) => {
                    if !self.is_alive() {
                        break;
                    }
                    debug!("[{}] Host read interrupted: {}", self.id, e);
                }
                Inbound::Ignored => {}
                Inbound::Closed => {
                    info!("[{}] Host closed the connection", self.id);
                    self.close().await;
                    break;
                }
            }
        }

        debug!("[{}] Forwarder loop ended", self.id);
    }

    /// Push `envelope` to every registered listener, in registration order.
    ///
    /// Each push waits for room in that listener's channel while the lock is
    /// held. A listener that stops draining therefore stalls delivery to every
    /// other listener, and the host forwarder with it, until it drains or its
    /// delivery loop gives up and closes the channel.
    ///
    /// Returns false if the session is no longer active.
    pub(crate) async fn broadcast(&self, envelope: Envelope) -> bool {
        let listeners = self.listeners.lock().await;
        if !self.is_alive() {
            return false;
        }

        for listener in listeners.iter() {
            if listener.push(envelope.clone()).await.is_err() {
                debug!(
                    "[{}] {} stopped receiving, awaiting its removal",
                    self.id,
                    listener.id()
                );
            }
        }
        true
    }

    /// Tear the session down. Runs at most once; later calls return early.
    ///
    /// Holds the listener lock for the whole sequence so no broadcast can see
    /// a half-closed listener set.
    pub async fn close(&self) {
        let mut listeners = self.listeners.lock().await;
        if !self.is_alive() {
            return;
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }

        // Leaving Active stops the registration loop and fails new joins.
        self.state.send_replace(SessionState::Closing);

        let released = listeners.len();
        listeners.clear();

        self.state.send_replace(SessionState::Closed);
        drop(listeners);

        info!("[{}] Closed ({} listeners released)", self.id, released);
    }
}

/// Result of applying a `Register`.
enum Added {
    New,
    /// Already present; nothing changed and no resend is due.
    Duplicate,
    SessionClosed,
}

/// Resolves once the session has left `Active`.
async fn stopped(state: &mut watch::Receiver<SessionState>) {
    let _ = state.wait_for(|s| !s.is_active()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::listener::DeliveryOutcome;
    use crate::hub::transport::{channel_sink, channel_source};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    /// Session wired to in-memory host halves, both loops running.
    struct Harness {
        session: Arc<Session>,
        registry: Arc<SessionRegistry>,
        host_out: mpsc::UnboundedReceiver<Envelope>,
        host_in: mpsc::UnboundedSender<Inbound>,
    }

    fn start() -> Harness {
        let registry = Arc::new(SessionRegistry::new());
        let (reg_tx, reg_rx) = mpsc::channel(3);
        let weak = Arc::downgrade(&registry);
        let session = registry.insert_with(|id| Session::new(id, reg_tx, weak, 1));

        let (sink, host_out) = channel_sink();
        let (host_in, source) = channel_source();
        tokio::spawn(session.clone().run_registrations(reg_rx, sink));
        tokio::spawn(session.clone().run_forwarder(source));

        Harness {
            session,
            registry,
            host_out,
            host_in,
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Option<Envelope> {
        timeout(WAIT, rx.recv()).await.expect("timed out")
    }

    async fn wait_for_listeners(session: &Session, n: usize) {
        timeout(WAIT, async {
            while session.listener_count().await != n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("listener count never reached");
    }

    #[tokio::test]
    async fn test_join_requests_resend() {
        let mut h = start();
        let _sub = h.session.subscribe().await.unwrap();

        assert_eq!(next(&mut h.host_out).await, Some(Envelope::resend()));
        wait_for_listeners(&h.session, 1).await;
    }

    #[tokio::test]
    async fn test_register_unregister_register() {
        let mut h = start();

        let (handle, mut rx) = ListenerHandle::channel(1);
        let listener_id = handle.id();
        h.session
            .registrations
            .send(Registration::Register(handle))
            .await
            .unwrap();
        assert_eq!(next(&mut h.host_out).await, Some(Envelope::resend()));
        wait_for_listeners(&h.session, 1).await;

        h.session
            .registrations
            .send(Registration::Unregister(listener_id))
            .await
            .unwrap();
        wait_for_listeners(&h.session, 0).await;
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), None);

        let (again, _rx2) = ListenerHandle::channel(1);
        h.session
            .registrations
            .send(Registration::Register(again))
            .await
            .unwrap();
        assert_eq!(next(&mut h.host_out).await, Some(Envelope::resend()));
        wait_for_listeners(&h.session, 1).await;
    }

    #[tokio::test]
    async fn test_unregister_unknown_listener_is_noop() {
        let h = start();
        let (handle, _rx) = ListenerHandle::channel(1);
        h.session
            .registrations
            .send(Registration::Unregister(handle.id()))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(h.session.listener_count().await, 0);
        assert!(h.session.is_alive());
    }

    #[tokio::test]
    async fn test_broadcast_order_to_every_listener() {
        let mut h = start();

        let mut outputs = Vec::new();
        for _ in 0..3 {
            let sub = h.session.subscribe().await.unwrap();
            let (sink, out) = channel_sink();
            tokio::spawn(sub.deliver(sink));
            outputs.push(out);
            assert_eq!(next(&mut h.host_out).await, Some(Envelope::resend()));
        }
        wait_for_listeners(&h.session, 3).await;

        for i in 0..10 {
            h.host_in
                .send(Inbound::Envelope(Envelope::data(format!("e{i}"))))
                .unwrap();
        }

        for out in outputs.iter_mut() {
            for i in 0..10 {
                assert_eq!(next(out).await, Some(Envelope::data(format!("e{i}"))));
            }
        }
    }

    #[tokio::test]
    async fn test_late_listener_misses_earlier_broadcast() {
        let mut h = start();

        let first = h.session.subscribe().await.unwrap();
        let (sink, mut first_out) = channel_sink();
        tokio::spawn(first.deliver(sink));
        assert_eq!(next(&mut h.host_out).await, Some(Envelope::resend()));
        wait_for_listeners(&h.session, 1).await;

        h.host_in
            .send(Inbound::Envelope(Envelope::data("early")))
            .unwrap();
        assert_eq!(next(&mut first_out).await, Some(Envelope::data("early")));

        let late = h.session.subscribe().await.unwrap();
        let (sink, mut late_out) = channel_sink();
        tokio::spawn(late.deliver(sink));

        // The late join asks the host to replay; the replay reaches both.
        assert_eq!(next(&mut h.host_out).await, Some(Envelope::resend()));
        wait_for_listeners(&h.session, 2).await;
        h.host_in
            .send(Inbound::Envelope(Envelope::data("replay")))
            .unwrap();

        assert_eq!(next(&mut late_out).await, Some(Envelope::data("replay")));
        assert_eq!(next(&mut first_out).await, Some(Envelope::data("replay")));
    }

    #[tokio::test]
    async fn test_malformed_and_interrupted_frames_are_skipped() {
        let mut h = start();
        let sub = h.session.subscribe().await.unwrap();
        let (sink, mut out) = channel_sink();
        tokio::spawn(sub.deliver(sink));
        assert_eq!(next(&mut h.host_out).await, Some(Envelope::resend()));
        wait_for_listeners(&h.session, 1).await;

        h.host_in
            .send(Inbound::Malformed("bad json".to_string()))
            .unwrap();
        h.host_in
            .send(Inbound::Interrupted("no data".to_string()))
            .unwrap();
        h.host_in.send(Inbound::Ignored).unwrap();
        h.host_in
            .send(Inbound::Envelope(Envelope::selection("3 7")))
            .unwrap();

        assert_eq!(next(&mut out).await, Some(Envelope::selection("3 7")));
        assert!(h.session.is_alive());
    }

    #[tokio::test]
    async fn test_host_close_tears_down() {
        let mut h = start();
        let id = h.session.id().clone();

        let sub = h.session.subscribe().await.unwrap();
        let (sink, mut out) = channel_sink();
        let delivery = tokio::spawn(sub.deliver(sink));
        assert_eq!(next(&mut h.host_out).await, Some(Envelope::resend()));
        wait_for_listeners(&h.session, 1).await;

        h.host_in
            .send(Inbound::Envelope(Envelope::data("x")))
            .unwrap();
        h.host_in.send(Inbound::Closed).unwrap();

        assert_eq!(next(&mut out).await, Some(Envelope::data("x")));
        assert_eq!(next(&mut out).await, None);
        assert_eq!(
            timeout(WAIT, delivery).await.unwrap().unwrap(),
            DeliveryOutcome::ChannelClosed
        );

        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(h.registry.get(&id).is_none());
        // Registration loop exits and closes the host sink.
        assert_eq!(next(&mut h.host_out).await, None);
        assert!(matches!(
            h.session.subscribe().await,
            Err(HubError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_resend_tears_down() {
        let h = start();
        let id = h.session.id().clone();
        drop(h.host_out);

        let sub = h.session.subscribe().await.unwrap();
        let (sink, _out) = channel_sink();
        let delivery = tokio::spawn(sub.deliver(sink));

        assert_eq!(
            timeout(WAIT, delivery).await.unwrap().unwrap(),
            DeliveryOutcome::ChannelClosed
        );
        assert!(!h.session.is_alive());
        assert!(h.registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_close_runs_once() {
        let h = start();
        tokio::join!(h.session.close(), h.session.close());
        h.session.close().await;
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.registry.len(), 0);
    }

    #[tokio::test]
    async fn test_failed_listener_is_removed_without_affecting_others() {
        let mut h = start();

        let healthy = h.session.subscribe().await.unwrap();
        let (sink, mut healthy_out) = channel_sink();
        tokio::spawn(healthy.deliver(sink));
        assert_eq!(next(&mut h.host_out).await, Some(Envelope::resend()));

        let broken = h.session.subscribe().await.unwrap();
        let (sink, broken_out) = channel_sink();
        drop(broken_out);
        let broken_delivery = tokio::spawn(broken.deliver(sink));
        assert_eq!(next(&mut h.host_out).await, Some(Envelope::resend()));
        wait_for_listeners(&h.session, 2).await;

        h.host_in
            .send(Inbound::Envelope(Envelope::data("one")))
            .unwrap();
        assert_eq!(
            timeout(WAIT, broken_delivery).await.unwrap().unwrap(),
            DeliveryOutcome::WriteFailed
        );
        wait_for_listeners(&h.session, 1).await;

        h.host_in
            .send(Inbound::Envelope(Envelope::data("two")))
            .unwrap();
        assert_eq!(next(&mut healthy_out).await, Some(Envelope::data("one")));
        assert_eq!(next(&mut healthy_out).await, Some(Envelope::data("two")));
        assert!(h.session.is_alive());
    }

    #[tokio::test]
    async fn test_duplicate_register_skips_resend() {
        let mut h = start();

        let (handle, _rx) = ListenerHandle::channel(1);
        let duplicate = handle.duplicate();
        h.session
            .registrations
            .send(Registration::Register(handle))
            .await
            .unwrap();
        assert_eq!(next(&mut h.host_out).await, Some(Envelope::resend()));
        wait_for_listeners(&h.session, 1).await;

        h.session
            .registrations
            .send(Registration::Register(duplicate))
            .await
            .unwrap();
        assert!(
            timeout(Duration::from_millis(100), h.host_out.recv())
                .await
                .is_err(),
            "no RESEND for an already registered listener"
        );
        assert_eq!(h.session.listener_count().await, 1);
        assert!(h.session.is_alive());
    }

    #[tokio::test]
    async fn test_join_queued_during_teardown_is_refused() {
        let h = start();
        // The registration loop has not observed the close yet, so the
        // conduit still accepts the handle.
        h.session.close().await;

        assert!(matches!(
            h.session.subscribe().await,
            Err(HubError::SessionNotFound(_))
        ));
        assert_eq!(h.session.listener_count().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_subscriptions_leave_while_broadcast_stalled() {
        use std::collections::HashSet;

        let mut h = start();

        let a = h.session.subscribe().await.unwrap();
        assert_eq!(next(&mut h.host_out).await, Some(Envelope::resend()));
        let b = h.session.subscribe().await.unwrap();
        assert_eq!(next(&mut h.host_out).await, Some(Envelope::resend()));
        wait_for_listeners(&h.session, 2).await;

        // Neither listener drains: the first envelope fills both slots and
        // the second blocks the forwarder on `a` with the lock held.
        h.host_in
            .send(Inbound::Envelope(Envelope::data("1")))
            .unwrap();
        h.host_in
            .send(Inbound::Envelope(Envelope::data("2")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One join parks in the registration loop, three fill the conduit.
        let mut live = Vec::new();
        for _ in 0..4 {
            live.push(h.session.subscribe().await.unwrap());
        }

        drop(b);
        drop(a);

        let expected: HashSet<ListenerId> = live.iter().map(|sub| sub.id()).collect();
        timeout(WAIT, async {
            loop {
                let ids: HashSet<ListenerId> = h
                    .session
                    .listeners
                    .lock()
                    .await
                    .iter()
                    .map(|l| l.id())
                    .collect();
                if ids == expected {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("dropped listeners were never removed");
        assert!(h.session.is_alive());
    }
}
