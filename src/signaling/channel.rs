use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, RwLock as SyncRwLock, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::events::{ChannelEvent, ClientEvent, EventKind, Identity, ServerEvent};
use crate::config::SignalingConfig;
use crate::error::{ProctorError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub type EventHandler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Token returned by [`SignalingChannel::on`]; pass it to `off` to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

/// Persistent event connection to the room service.
///
/// The channel only relays: it announces presence on `connect`, pushes
/// typed client events out, and fans inbound events out to subscribers.
/// It never retries on its own; consumers watch `disconnect` and
/// `connect_error` and decide what to do.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    config: SignalingConfig,
    transport: Transport,
    handlers: SyncRwLock<HashMap<EventKind, Vec<(u64, EventHandler)>>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    socket_id: SyncRwLock<Option<String>>,
    link: SyncMutex<Option<Link>>,
    connecting: Mutex<()>,
}

struct Link {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    writer: JoinHandle<()>,
    reader: Option<JoinHandle<()>>,
    /// Releases the reader once the link is installed, so a transport loss
    /// it observes always finds a link to tear down.
    arm: Option<oneshot::Sender<()>>,
}

enum Transport {
    WebSocket,
    Memory(MemoryTransport),
}

struct MemoryTransport {
    socket_id: String,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    refusals: AtomicU32,
}

/// Test-side end of an in-memory channel.
pub struct MemoryRemote {
    channel: SignalingChannel,
    outbound: mpsc::UnboundedReceiver<ClientEvent>,
}

impl SignalingChannel {
    pub fn new(config: SignalingConfig) -> Self {
        Self::with_transport(config, Transport::WebSocket)
    }

    /// Channel backed by an in-process transport instead of a WebSocket.
    pub fn in_memory(socket_id: impl Into<String>) -> (Self, MemoryRemote) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SignalingConfig {
            url: "memory://".to_string(),
            auth_token: None,
        };
        let channel = Self::with_transport(
            config,
            Transport::Memory(MemoryTransport {
                socket_id: socket_id.into(),
                outbound: tx,
                refusals: AtomicU32::new(0),
            }),
        );
        let remote = MemoryRemote {
            channel: channel.clone(),
            outbound: rx,
        };
        (channel, remote)
    }

    fn with_transport(config: SignalingConfig, transport: Transport) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                config,
                transport,
                handlers: SyncRwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                connected: AtomicBool::new(false),
                socket_id: SyncRwLock::new(None),
                link: SyncMutex::new(None),
                connecting: Mutex::new(()),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Connection id assigned by the room service, once connected.
    pub fn socket_id(&self) -> Option<String> {
        self.inner
            .socket_id
            .read()
            .ok()
            .and_then(|id| id.clone())
    }

    /// Opens the transport and announces presence in `room_id`.
    /// Calling it while already connected does nothing.
    pub async fn connect(&self, room_id: &str, identity: &Identity) -> Result<()> {
        let _connecting = self.inner.connecting.lock().await;
        if self.is_connected() {
            tracing::debug!(room_id = %room_id, "Signaling channel already connected");
            return Ok(());
        }

        let opened = match &self.inner.transport {
            Transport::WebSocket => self.open_websocket().await,
            Transport::Memory(memory) => open_memory(memory),
        };

        let (mut new_link, socket_id) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!(error = %e, room_id = %room_id, "Signaling connection failed");
                self.inner.dispatch(&ChannelEvent::ConnectError {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        if let Ok(mut id) = self.inner.socket_id.write() {
            *id = Some(socket_id.clone());
        }
        self.inner.connected.store(true, Ordering::SeqCst);

        let _ = new_link.outbound.send(ClientEvent::JoinRoom {
            user: identity.clone(),
            examid: room_id.to_string(),
        });
        let _ = new_link.outbound.send(ClientEvent::NewJoin);
        let arm = new_link.arm.take();
        if let Ok(mut link) = self.inner.link.lock() {
            if let Some(stale) = link.replace(new_link) {
                stale.close();
            }
        }

        tracing::info!(
            room_id = %room_id,
            socket_id = %socket_id,
            role = %identity.role,
            "Joined exam room"
        );
        self.inner.dispatch(&ChannelEvent::Connected);
        if let Some(arm) = arm {
            let _ = arm.send(());
        }
        Ok(())
    }

    /// Fire-and-forget send. Events sent while disconnected are dropped.
    pub fn send(&self, event: ClientEvent) {
        let link = match self.inner.link.lock() {
            Ok(link) => link,
            Err(_) => return,
        };

        match link.as_ref() {
            Some(link) if self.is_connected() => {
                if link.outbound.send(event).is_err() {
                    tracing::debug!("Signaling writer gone, event dropped");
                }
            }
            _ => {
                tracing::debug!(event = event.name(), "Signaling channel not connected, event dropped");
            }
        }
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.entry(kind).or_default().push((id, Arc::new(handler)));
        }
        Subscription { kind, id }
    }

    pub fn off(&self, subscription: Subscription) {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            if let Some(list) = handlers.get_mut(&subscription.kind) {
                list.retain(|(id, _)| *id != subscription.id);
            }
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .read()
            .map(|h| h.get(&kind).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Releases the transport. Safe to call on every exit path, repeatedly.
    /// A deliberate disconnect does not raise `disconnect` to subscribers.
    pub async fn disconnect(&self) {
        let _connecting = self.inner.connecting.lock().await;
        let link = self.inner.link.lock().ok().and_then(|mut link| link.take());
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Ok(mut id) = self.inner.socket_id.write() {
            *id = None;
        }

        if let Some(link) = link {
            link.close();
            tracing::info!("Signaling channel disconnected");
        }
    }

    fn connection_url(&self) -> String {
        match &self.inner.config.auth_token {
            Some(token) => {
                let separator = if self.inner.config.url.contains('?') { '&' } else { '?' };
                format!(
                    "{}{}token={}",
                    self.inner.config.url,
                    separator,
                    urlencoding::encode(token)
                )
            }
            None => self.inner.config.url.clone(),
        }
    }

    async fn open_websocket(&self) -> Result<(Link, String)> {
        let url = self.connection_url();
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| ProctorError::transport("timed out opening signaling connection"))??;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let socket_id = tokio::time::timeout(CONNECT_TIMEOUT, async {
            while let Some(message) = ws_receiver.next().await {
                if let Message::Text(text) = message? {
                    if let Some(sid) = parse_handshake(&text) {
                        return Ok(sid);
                    }
                    tracing::debug!(frame = %text, "Ignoring frame before handshake");
                }
            }
            Err(ProctorError::transport("connection closed before handshake"))
        })
        .await
        .map_err(|_| ProctorError::transport("timed out waiting for handshake"))??;

        let (tx, mut rx) = mpsc::unbounded_channel::<ClientEvent>();

        let writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(event = event.name(), error = %e, "Failed to serialize client event");
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(Message::Text(text)).await {
                    tracing::warn!(error = %e, "Failed to send signaling frame");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let (arm, armed) = oneshot::channel::<()>();
        let weak = Arc::downgrade(&self.inner);
        let reader = tokio::spawn(async move {
            // Frames arriving meanwhile stay buffered in the socket.
            if armed.await.is_err() {
                return;
            }
            let mut reason = "transport closed".to_string();
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(inner) = weak.upgrade() {
                            inner.dispatch_frame(&text);
                        } else {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            reason = format!("closed by server: {}", frame.reason);
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        reason = e.to_string();
                        break;
                    }
                }
            }
            ChannelInner::transport_lost(&weak, reason);
        });

        Ok((
            Link {
                outbound: tx,
                writer,
                reader: Some(reader),
                arm: Some(arm),
            },
            socket_id,
        ))
    }
}

impl Link {
    /// Stops reading immediately. The writer flushes what is already queued
    /// and then closes the socket.
    fn close(self) {
        drop(self.outbound);
        if let Some(reader) = self.reader {
            reader.abort();
        }
    }

    /// Drops the writer without aborting tasks; used from inside the reader.
    fn detach(self) {
        drop(self.outbound);
    }

    fn abort(self) {
        self.writer.abort();
        if let Some(reader) = self.reader {
            reader.abort();
        }
    }
}

fn open_memory(memory: &MemoryTransport) -> Result<(Link, String)> {
    let refused = memory
        .refusals
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if refused {
        return Err(ProctorError::transport("connection refused"));
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<ClientEvent>();
    let outbound = memory.outbound.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if outbound.send(event).is_err() {
                break;
            }
        }
    });

    Ok((
        Link {
            outbound: tx,
            writer: forwarder,
            reader: None,
            arm: None,
        },
        memory.socket_id.clone(),
    ))
}

/// The room service opens every connection with `{"event":"connect","data":{"sid":..}}`.
fn parse_handshake(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("event")?.as_str()? != "connect" {
        return None;
    }
    value
        .get("data")?
        .get("sid")?
        .as_str()
        .map(str::to_string)
}

impl ChannelInner {
    fn dispatch(&self, event: &ChannelEvent) {
        let handlers: Vec<EventHandler> = match self.handlers.read() {
            Ok(handlers) => handlers
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };

        if handlers.is_empty() {
            tracing::trace!(event = event.kind().as_str(), "No subscribers for event");
        }
        for handler in handlers {
            handler(event);
        }
    }

    fn dispatch_frame(&self, text: &str) {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => self.dispatch(&ChannelEvent::Server(event)),
            Err(e) => {
                tracing::warn!(error = %e, raw_message = %text, "Failed to parse signaling frame");
            }
        }
    }

    fn transport_lost(weak: &Weak<ChannelInner>, reason: String) {
        let Some(inner) = weak.upgrade() else {
            return;
        };

        // A deliberate disconnect already took the link.
        let link = inner.link.lock().ok().and_then(|mut link| link.take());
        let Some(link) = link else {
            return;
        };
        link.detach();

        inner.connected.store(false, Ordering::SeqCst);
        if let Ok(mut id) = inner.socket_id.write() {
            *id = None;
        }
        tracing::warn!(reason = %reason, "Signaling transport lost");
        inner.dispatch(&ChannelEvent::Disconnected { reason });
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Ok(link) = self.link.get_mut() {
            if let Some(link) = link.take() {
                link.abort();
            }
        }
    }
}

impl MemoryRemote {
    /// Delivers an inbound event to the channel's subscribers.
    pub fn deliver(&self, event: ServerEvent) {
        self.channel.inner.dispatch(&ChannelEvent::Server(event));
    }

    /// Delivers a raw text frame, exercising the boundary parser.
    pub fn deliver_frame(&self, text: &str) {
        self.channel.inner.dispatch_frame(text);
    }

    /// Simulates transport loss.
    pub async fn drop_connection(&self, reason: &str) {
        let weak = Arc::downgrade(&self.channel.inner);
        ChannelInner::transport_lost(&weak, reason.to_string());
    }

    /// Makes the next `count` connection attempts fail.
    pub fn refuse_connections(&self, count: u32) {
        if let Transport::Memory(memory) = &self.channel.inner.transport {
            memory.refusals.store(count, Ordering::SeqCst);
        }
    }

    pub async fn next_sent(&mut self) -> Option<ClientEvent> {
        self.outbound.recv().await
    }

    pub fn try_next_sent(&mut self) -> Option<ClientEvent> {
        self.outbound.try_recv().ok()
    }

    /// Everything sent so far, in order.
    pub fn drain_sent(&mut self) -> Vec<ClientEvent> {
        let mut sent = Vec::new();
        while let Ok(event) = self.outbound.try_recv() {
            sent.push(event);
        }
        sent
    }
}

/// Unsubscribes every held subscription when dropped.
pub struct SubscriptionGuard {
    channel: SignalingChannel,
    subscriptions: Vec<Subscription>,
}

impl SubscriptionGuard {
    pub fn new(channel: &SignalingChannel) -> Self {
        Self {
            channel: channel.clone(),
            subscriptions: Vec::new(),
        }
    }

    pub fn on<F>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.subscriptions.push(self.channel.on(kind, handler));
    }

    pub fn release(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            self.channel.off(subscription);
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::events::{Departure, Role};
    use std::sync::Mutex as StdMutex;

    fn identity() -> Identity {
        Identity {
            user_id: "user-1".into(),
            role: Role::Candidate,
            name: Some("Test".into()),
            email: None,
        }
    }

    #[tokio::test]
    async fn test_connect_announces_presence() {
        let (channel, mut remote) = SignalingChannel::in_memory("sock-1");
        channel.connect("exam-1", &identity()).await.unwrap();

        assert!(channel.is_connected());
        assert_eq!(channel.socket_id().as_deref(), Some("sock-1"));

        match remote.next_sent().await.unwrap() {
            ClientEvent::JoinRoom { user, examid } => {
                assert_eq!(user.user_id, "user-1");
                assert_eq!(examid, "exam-1");
            }
            other => panic!("expected join_room, got {:?}", other),
        }
        assert_eq!(remote.next_sent().await.unwrap(), ClientEvent::NewJoin);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (channel, mut remote) = SignalingChannel::in_memory("sock-1");
        channel.connect("exam-1", &identity()).await.unwrap();
        channel.connect("exam-1", &identity()).await.unwrap();

        remote.next_sent().await.unwrap();
        remote.next_sent().await.unwrap();
        tokio::task::yield_now().await;
        assert!(remote.try_next_sent().is_none());
    }

    #[tokio::test]
    async fn test_on_off() {
        let (channel, remote) = SignalingChannel::in_memory("sock-1");
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let sink = seen.clone();
        let subscription = channel.on(EventKind::UserLeft, move |event| {
            if let ChannelEvent::Server(ServerEvent::UserLeft(d)) = event {
                sink.lock().unwrap().push(d.id().to_string());
            }
        });
        assert_eq!(channel.handler_count(EventKind::UserLeft), 1);

        remote.deliver(ServerEvent::UserLeft(Departure::SocketId("a".into())));
        channel.off(subscription);
        channel.off(subscription);
        remote.deliver(ServerEvent::UserLeft(Departure::SocketId("b".into())));

        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);
        assert_eq!(channel.handler_count(EventKind::UserLeft), 0);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let (channel, remote) = SignalingChannel::in_memory("sock-1");
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        channel.on(EventKind::UserJoined, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        remote.deliver_frame("{not json");
        remote.deliver_frame(r#"{"event":"user_joined","data":{"socketid":"s"}}"#);
        remote.deliver_frame(
            r#"{"event":"user_joined","data":{"socketid":"s","_id":"u","type":"candidate"}}"#,
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_loss_raises_disconnect_once() {
        let (channel, remote) = SignalingChannel::in_memory("sock-1");
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        channel.on(EventKind::Disconnect, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        channel.connect("exam-1", &identity()).await.unwrap();
        remote.drop_connection("network down").await;
        remote.drop_connection("network down").await;

        assert!(!channel.is_connected());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deliberate_disconnect_is_silent() {
        let (channel, remote) = SignalingChannel::in_memory("sock-1");
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        channel.on(EventKind::Disconnect, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        channel.connect("exam-1", &identity()).await.unwrap();
        channel.disconnect().await;
        channel.disconnect().await;
        remote.drop_connection("late").await;

        assert!(!channel.is_connected());
        assert_eq!(channel.socket_id(), None);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refused_connection_raises_connect_error() {
        let (channel, remote) = SignalingChannel::in_memory("sock-1");
        let errors = Arc::new(AtomicU32::new(0));
        let counter = errors.clone();
        channel.on(EventKind::ConnectError, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        remote.refuse_connections(1);
        assert!(channel.connect("exam-1", &identity()).await.is_err());
        assert!(channel.connect("exam-1", &identity()).await.is_ok());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let (channel, mut remote) = SignalingChannel::in_memory("sock-1");
        channel.send(ClientEvent::NewJoin);
        tokio::task::yield_now().await;
        assert!(remote.try_next_sent().is_none());
    }

    #[tokio::test]
    async fn test_subscription_guard_releases_on_drop() {
        let (channel, _remote) = SignalingChannel::in_memory("sock-1");
        {
            let mut guard = SubscriptionGuard::new(&channel);
            guard.on(EventKind::FrameAnalysisResult, |_| {});
            guard.on(EventKind::AutomatedWarningIssued, |_| {});
            assert_eq!(channel.handler_count(EventKind::FrameAnalysisResult), 1);
        }
        assert_eq!(channel.handler_count(EventKind::FrameAnalysisResult), 0);
        assert_eq!(channel.handler_count(EventKind::AutomatedWarningIssued), 0);
    }

    #[test]
    fn test_parse_handshake() {
        assert_eq!(
            parse_handshake(r#"{"event":"connect","data":{"sid":"abc"}}"#).as_deref(),
            Some("abc")
        );
        assert_eq!(parse_handshake(r#"{"event":"user_list","data":[]}"#), None);
        assert_eq!(parse_handshake("garbage"), None);
    }

    #[test]
    fn test_connection_url_encodes_token() {
        let channel = SignalingChannel::new(SignalingConfig {
            url: "ws://localhost:5000/socket".into(),
            auth_token: Some("a b&c".into()),
        });
        assert_eq!(
            channel.connection_url(),
            "ws://localhost:5000/socket?token=a%20b%26c"
        );
    }
}
