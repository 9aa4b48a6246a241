//! Realtime channel connection management.
//!
//! A spawned worker owns the link: it dials through the injected factory,
//! subscribes the configured rooms, heartbeats while connected, and feeds
//! every inbound frame to the event bus. Unintentional disconnects re-dial
//! a bounded number of times with a fixed delay; an explicit `disconnect()`
//! never does.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::proto::{ClientFrame, Room, ServerFrame};
use crate::channel::transport::{ChannelError, ChannelFactory, ChannelLink};
use crate::events::{
    BotDetection, BusEvent, ConnectionCount, DashboardUpdate, EventBus, HeartbeatAck, LogEntry,
    SocketChange, SystemAlert,
};
use crate::session::SessionStore;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Tuning knobs for the channel state machine.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Liveness ping cadence while connected.
    pub heartbeat_interval: Duration,
    /// Fixed delay between reconnect dials.
    pub reconnect_delay: Duration,
    /// Reconnect budget per connect() call; resets on every successful open.
    pub max_reconnect_attempts: u32,
    /// Rooms subscribed on every successful open.
    pub rooms: Vec<Room>,
}

impl ChannelConfig {
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
    pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: Self::DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: Self::DEFAULT_MAX_RECONNECT_ATTEMPTS,
            rooms: vec![Room::Dashboard, Room::Logs],
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: ChannelState,
    reconnect_attempts: u32,
    intentional: bool,
    worker_live: bool,
}

enum LinkEnd {
    Intentional,
    Lost,
}

/// Persistent bidirectional event channel.
pub struct RealtimeChannel {
    factory: Arc<dyn ChannelFactory>,
    session: Arc<SessionStore>,
    bus: Arc<EventBus>,
    config: ChannelConfig,
    shared: Arc<Mutex<Shared>>,
    shutdown: Arc<Notify>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeChannel {
    pub fn new(
        factory: Arc<dyn ChannelFactory>,
        session: Arc<SessionStore>,
        bus: Arc<EventBus>,
        config: ChannelConfig,
    ) -> Self {
        Self {
            factory,
            session,
            bus,
            config,
            shared: Arc::new(Mutex::new(Shared {
                state: ChannelState::Disconnected,
                reconnect_attempts: 0,
                intentional: false,
                worker_live: false,
            })),
            shutdown: Arc::new(Notify::new()),
            outbound: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.shared).state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.shared).reconnect_attempts
    }

    /// Starts the connection worker.
    ///
    /// A no-op while a worker is live: connecting, connected, or waiting
    /// out a reconnect delay. There is never a second underlying link.
    pub fn connect(&self) {
        {
            let mut shared = lock(&self.shared);
            if shared.worker_live {
                debug!(event = "connect_ignored", state = ?shared.state);
                return;
            }
            shared.worker_live = true;
            shared.intentional = false;
            shared.reconnect_attempts = 0;
            shared.state = ChannelState::Connecting;
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = Some(outbound_tx);
        }

        let worker = ChannelWorker {
            factory: Arc::clone(&self.factory),
            session: Arc::clone(&self.session),
            bus: Arc::clone(&self.bus),
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            shutdown: Arc::clone(&self.shutdown),
        };
        let handle = tokio::spawn(worker.run(outbound_rx));
        if let Ok(mut slot) = self.worker.lock() {
            if let Some(previous) = slot.replace(handle) {
                // Previous worker already observed worker_live = false.
                previous.abort();
            }
        }
    }

    /// Explicit close: stops heartbeat and reconnect timers, never re-dials.
    pub fn disconnect(&self) {
        let worker_live = {
            let mut shared = lock(&self.shared);
            shared.intentional = true;
            if !shared.worker_live {
                shared.state = ChannelState::Disconnected;
            }
            shared.worker_live
        };
        if worker_live {
            self.shutdown.notify_one();
        }
    }

    /// Queues a frame for the live link.
    ///
    /// Frames queued while a reconnect is pending are sent after the next
    /// successful open; fails once the worker is gone.
    pub fn send(&self, frame: ClientFrame) -> Result<(), ChannelError> {
        let sender = self
            .outbound
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or(ChannelError::Closed)?;
        sender.send(frame).map_err(|_| ChannelError::Closed)
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        // Scheduled heartbeats and reconnects must not outlive the channel.
        if let Ok(mut slot) = self.worker.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

struct ChannelWorker {
    factory: Arc<dyn ChannelFactory>,
    session: Arc<SessionStore>,
    bus: Arc<EventBus>,
    config: ChannelConfig,
    shared: Arc<Mutex<Shared>>,
    shutdown: Arc<Notify>,
}

impl ChannelWorker {
    async fn run(self, mut outbound_rx: mpsc::UnboundedReceiver<ClientFrame>) {
        loop {
            // State is Connecting on entry: set by connect() or below.
            let token = self.session.access_token();
            let dialed = tokio::select! {
                _ = shutdown_requested(&self.shared, &self.shutdown) => None,
                result = self.factory.open(token) => Some(result),
            };

            let end = match dialed {
                Some(Ok(mut link)) => {
                    {
                        let mut shared = lock(&self.shared);
                        shared.state = ChannelState::Connected;
                        shared.reconnect_attempts = 0;
                    }
                    self.bus
                        .publish(BusEvent::SocketChange(SocketChange { connected: true }));
                    debug!(event = "channel_connected");

                    let end = match self.subscribe_rooms(link.as_mut()).await {
                        Ok(()) => self.run_link(link.as_mut(), &mut outbound_rx).await,
                        Err(_) => LinkEnd::Lost,
                    };
                    if matches!(end, LinkEnd::Intentional) {
                        link.close().await;
                    }
                    end
                }
                Some(Err(err)) => {
                    warn!(event = "channel_dial_failed", error = %err);
                    LinkEnd::Lost
                }
                None => LinkEnd::Intentional,
            };

            let retry = {
                let mut shared = lock(&self.shared);
                shared.state = ChannelState::Disconnected;
                let retry = !shared.intentional
                    && !matches!(end, LinkEnd::Intentional)
                    && shared.reconnect_attempts < self.config.max_reconnect_attempts;
                if retry {
                    shared.reconnect_attempts += 1;
                } else {
                    shared.worker_live = false;
                }
                retry
            };
            self.bus
                .publish(BusEvent::SocketChange(SocketChange { connected: false }));

            if !retry {
                debug!(event = "channel_worker_stopped");
                return;
            }

            debug!(
                event = "reconnect_scheduled",
                attempt = lock(&self.shared).reconnect_attempts,
                delay_ms = self.config.reconnect_delay.as_millis() as u64
            );
            if !self.sleep_unless_shutdown(self.config.reconnect_delay).await {
                let mut shared = lock(&self.shared);
                shared.worker_live = false;
                debug!(event = "reconnect_cancelled");
                return;
            }

            lock(&self.shared).state = ChannelState::Connecting;
        }
    }

    async fn subscribe_rooms(&self, link: &mut dyn ChannelLink) -> Result<(), ChannelError> {
        for room in &self.config.rooms {
            link.send(ClientFrame::Subscribe { room: *room }).await?;
            debug!(event = "room_subscribed", room = ?room);
        }
        Ok(())
    }

    async fn run_link(
        &self,
        link: &mut dyn ChannelLink,
        outbound_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    ) -> LinkEnd {
        let start = tokio::time::Instant::now() + self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(start, self.config.heartbeat_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    if lock(&self.shared).intentional {
                        return LinkEnd::Intentional;
                    }
                }
                _ = heartbeat.tick() => {
                    let frame = ClientFrame::Heartbeat { timestamp: unix_millis() };
                    if link.send(frame).await.is_err() {
                        return LinkEnd::Lost;
                    }
                }
                queued = outbound_rx.recv() => {
                    match queued {
                        Some(frame) => {
                            if link.send(frame).await.is_err() {
                                return LinkEnd::Lost;
                            }
                        }
                        None => return LinkEnd::Intentional,
                    }
                }
                inbound = link.recv() => {
                    match inbound {
                        Some(Ok(frame)) => self.dispatch(frame),
                        Some(Err(err)) => {
                            // Decode failures skip the frame, not the link.
                            warn!(event = "inbound_frame_rejected", error = %err);
                        }
                        None => return LinkEnd::Lost,
                    }
                }
            }
        }
    }

    fn dispatch(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::BotDetection(data) => {
                self.bus
                    .publish(BusEvent::BotDetection(BotDetection { data }));
            }
            ServerFrame::DashboardUpdate(data) => {
                self.bus
                    .publish(BusEvent::DashboardUpdate(DashboardUpdate { data }));
            }
            ServerFrame::SystemAlert(data) => {
                self.bus.publish(BusEvent::SystemAlert(SystemAlert { data }));
            }
            ServerFrame::LogEntry(data) => {
                self.bus.publish(BusEvent::LogEntry(LogEntry { data }));
            }
            ServerFrame::HeartbeatAck { timestamp } => {
                self.bus
                    .publish(BusEvent::HeartbeatAck(HeartbeatAck { timestamp }));
            }
            ServerFrame::ConnectionCount {
                connected_clients,
                timestamp,
            } => {
                self.bus.publish(BusEvent::ConnectionCount(ConnectionCount {
                    connected_clients,
                    timestamp,
                }));
            }
            ServerFrame::Connected { client_id, .. } => {
                debug!(event = "channel_hello", client_id = %client_id);
            }
            ServerFrame::Subscribed { room } | ServerFrame::Unsubscribed { room } => {
                debug!(event = "room_ack", room = ?room);
            }
            ServerFrame::Unknown => {
                debug!(event = "unknown_event_dropped");
            }
        }
    }

    /// Returns false when an intentional shutdown interrupted the sleep.
    async fn sleep_unless_shutdown(&self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.shutdown.notified() => {
                    if lock(&self.shared).intentional {
                        return false;
                    }
                }
            }
        }
    }
}

async fn shutdown_requested(shared: &Mutex<Shared>, shutdown: &Notify) {
    loop {
        shutdown.notified().await;
        if lock(shared).intentional {
            return;
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> std::sync::MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use secrecy::SecretString;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    use super::{ChannelConfig, ChannelState, RealtimeChannel};
    use crate::channel::proto::{ClientFrame, Room, ServerFrame};
    use crate::channel::transport::{ChannelError, ChannelFactory, ChannelLink};
    use crate::events::{BusEvent, EventBus, EventKind};
    use crate::session::{MemoryStore, NoRefresh, SessionStore};

    struct MockLink {
        sent: mpsc::UnboundedSender<ClientFrame>,
        inbound: mpsc::UnboundedReceiver<ServerFrame>,
    }

    #[async_trait]
    impl ChannelLink for MockLink {
        async fn send(&mut self, frame: ClientFrame) -> Result<(), ChannelError> {
            self.sent.send(frame).map_err(|_| ChannelError::Closed)
        }

        async fn recv(&mut self) -> Option<Result<ServerFrame, ChannelError>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.inbound.close();
        }
    }

    /// Test-side handle for one accepted dial.
    struct DialHandle {
        sent: mpsc::UnboundedReceiver<ClientFrame>,
        inbound: mpsc::UnboundedSender<ServerFrame>,
    }

    struct MockFactory {
        dials: AtomicUsize,
        dial_delay: Duration,
        /// One entry per dial to accept; exhausted entries refuse the dial.
        accepts: Mutex<VecDeque<()>>,
        handles: mpsc::UnboundedSender<DialHandle>,
    }

    impl MockFactory {
        fn new(
            accept_count: usize,
            dial_delay: Duration,
        ) -> (Arc<Self>, mpsc::UnboundedReceiver<DialHandle>) {
            let (handles_tx, handles_rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    dials: AtomicUsize::new(0),
                    dial_delay,
                    accepts: Mutex::new(std::iter::repeat(()).take(accept_count).collect()),
                    handles: handles_tx,
                }),
                handles_rx,
            )
        }

        fn dial_count(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChannelFactory for MockFactory {
        async fn open(
            &self,
            _token: Option<SecretString>,
        ) -> Result<Box<dyn ChannelLink>, ChannelError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if !self.dial_delay.is_zero() {
                sleep(self.dial_delay).await;
            }

            if self.accepts.lock().expect("accepts lock").pop_front().is_none() {
                return Err(ChannelError::Closed);
            }

            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let _ = self.handles.send(DialHandle {
                sent: sent_rx,
                inbound: inbound_tx,
            });
            Ok(Box::new(MockLink {
                sent: sent_tx,
                inbound: inbound_rx,
            }))
        }
    }

    fn test_config() -> ChannelConfig {
        ChannelConfig {
            heartbeat_interval: Duration::from_secs(600),
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_attempts: 3,
            rooms: vec![Room::Dashboard, Room::Logs],
        }
    }

    fn channel_with(
        factory: Arc<MockFactory>,
        config: ChannelConfig,
    ) -> (RealtimeChannel, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let session = Arc::new(SessionStore::new(
            Box::new(MemoryStore::new()),
            Box::new(NoRefresh),
        ));
        (
            RealtimeChannel::new(factory, session, Arc::clone(&bus), config),
            bus,
        )
    }

    async fn expect_dial(handles: &mut mpsc::UnboundedReceiver<DialHandle>) -> DialHandle {
        timeout(Duration::from_secs(2), handles.recv())
            .await
            .expect("timed out waiting for dial")
            .expect("factory dropped")
    }

    #[tokio::test]
    async fn connect_while_connecting_dials_once() {
        let (factory, _handles) =
            MockFactory::new(1, Duration::from_millis(50));
        let (channel, _bus) = channel_with(Arc::clone(&factory), test_config());

        channel.connect();
        channel.connect();
        assert_eq!(channel.state(), ChannelState::Connecting);

        sleep(Duration::from_millis(120)).await;
        assert_eq!(factory.dial_count(), 1);
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn connected_link_subscribes_configured_rooms() {
        let (factory, mut handles) =
            MockFactory::new(1, Duration::ZERO);
        let (channel, _bus) = channel_with(factory, test_config());

        channel.connect();
        let mut handle = expect_dial(&mut handles).await;

        let first = timeout(Duration::from_secs(1), handle.sent.recv())
            .await
            .expect("timed out")
            .expect("frame");
        let second = timeout(Duration::from_secs(1), handle.sent.recv())
            .await
            .expect("timed out")
            .expect("frame");
        assert_eq!(
            first,
            ClientFrame::Subscribe {
                room: Room::Dashboard
            }
        );
        assert_eq!(second, ClientFrame::Subscribe { room: Room::Logs });
    }

    #[tokio::test]
    async fn inbound_frames_reach_bus_subscribers() {
        let (factory, mut handles) =
            MockFactory::new(1, Duration::ZERO);
        let (channel, bus) = channel_with(factory, test_config());

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        bus.subscribe(EventKind::LogEntry, move |event| {
            if let BusEvent::LogEntry(entry) = event {
                let _ = seen_tx.send(entry.data.clone());
            }
        });

        channel.connect();
        let handle = expect_dial(&mut handles).await;
        handle
            .inbound
            .send(ServerFrame::LogEntry(
                json!({"level":"ERROR","message":"x"}),
            ))
            .expect("feed frame");

        let data = timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .expect("timed out")
            .expect("delivery");
        assert_eq!(data, json!({"level":"ERROR","message":"x"}));
    }

    #[tokio::test]
    async fn heartbeat_flows_while_connected() {
        let mut config = test_config();
        config.heartbeat_interval = Duration::from_millis(20);
        let (factory, mut handles) =
            MockFactory::new(1, Duration::ZERO);
        let (channel, _bus) = channel_with(factory, config);

        channel.connect();
        let mut handle = expect_dial(&mut handles).await;

        let heartbeat = timeout(Duration::from_secs(2), async {
            loop {
                match handle.sent.recv().await {
                    Some(ClientFrame::Heartbeat { timestamp }) => return timestamp,
                    Some(_) => {}
                    None => panic!("link closed before heartbeat"),
                }
            }
        })
        .await
        .expect("timed out waiting for heartbeat");
        assert!(heartbeat > 0);
    }

    #[tokio::test]
    async fn lost_link_reconnects_and_resets_attempts() {
        let (factory, mut handles) = MockFactory::new(2, Duration::ZERO);
        let (channel, _bus) = channel_with(Arc::clone(&factory), test_config());

        channel.connect();
        let first = expect_dial(&mut handles).await;
        // Peer closes: dropping the inbound sender ends recv with None.
        drop(first);

        let _second = expect_dial(&mut handles).await;
        sleep(Duration::from_millis(20)).await;
        assert_eq!(factory.dial_count(), 2);
        assert_eq!(channel.state(), ChannelState::Connected);
        assert_eq!(channel.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn reconnects_stop_after_budget_until_explicit_connect() {
        let (factory, _handles) = MockFactory::new(0, Duration::ZERO);
        let (channel, _bus) = channel_with(Arc::clone(&factory), test_config());

        channel.connect();
        sleep(Duration::from_millis(200)).await;

        // Initial dial plus max_reconnect_attempts re-dials, nothing more.
        assert_eq!(factory.dial_count(), 4);
        assert_eq!(channel.state(), ChannelState::Disconnected);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(factory.dial_count(), 4);

        channel.connect();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(factory.dial_count(), 8);
    }

    #[tokio::test]
    async fn explicit_disconnect_suppresses_reconnection() {
        let (factory, mut handles) =
            MockFactory::new(1, Duration::ZERO);
        let (channel, bus) = channel_with(Arc::clone(&factory), test_config());

        let (changes_tx, mut changes_rx) = mpsc::unbounded_channel();
        bus.subscribe(EventKind::SocketChange, move |event| {
            if let BusEvent::SocketChange(change) = event {
                let _ = changes_tx.send(change.connected);
            }
        });

        channel.connect();
        let _handle = expect_dial(&mut handles).await;
        let connected = timeout(Duration::from_secs(1), changes_rx.recv())
            .await
            .expect("timed out")
            .expect("event");
        assert!(connected);

        channel.disconnect();
        let disconnected = timeout(Duration::from_secs(1), changes_rx.recv())
            .await
            .expect("timed out")
            .expect("event");
        assert!(!disconnected);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(factory.dial_count(), 1);
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_while_disconnected_is_a_no_op() {
        let (factory, _handles) = MockFactory::new(0, Duration::ZERO);
        let (channel, _bus) = channel_with(factory, test_config());

        channel.disconnect();
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn queued_frames_flow_to_the_link() {
        let (factory, mut handles) =
            MockFactory::new(1, Duration::ZERO);
        let (channel, _bus) = channel_with(factory, test_config());

        channel.connect();
        let mut handle = expect_dial(&mut handles).await;
        channel
            .send(ClientFrame::RequestUpdate {
                room: Room::Dashboard,
            })
            .expect("queue frame");

        let frame = timeout(Duration::from_secs(1), async {
            loop {
                match handle.sent.recv().await {
                    Some(ClientFrame::RequestUpdate { room }) => return room,
                    Some(_) => {}
                    None => panic!("link closed"),
                }
            }
        })
        .await
        .expect("timed out");
        assert_eq!(frame, Room::Dashboard);
    }
}
