use super::{mqtt_options, MqttQoS, PublishError, Role, TransportError};
use crate::{alert::AlertPublisher, config::ConfigMqtt, shutdown::Shutdown};
use futures::future::BoxFuture;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

/// Bound on how long a graceful close may wait for the DISCONNECT to leave
pub const CLOSE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone)]
pub enum ConnectionState {
    Disconnected { reason: Option<String> },
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Single writer of the connection state. Observers get a `watch` receiver and never mutate it.
#[derive(Debug)]
pub struct ConnectionTracker {
    tx: watch::Sender<ConnectionState>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected { reason: None });
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    pub fn begin_connect(&self) {
        self.transition(ConnectionState::Connecting);
    }

    pub fn acknowledged(&self) {
        self.transition(ConnectionState::Connected);
    }

    pub fn lost(&self, reason: impl Into<String>) {
        self.transition(ConnectionState::Disconnected {
            reason: Some(reason.into()),
        });
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.tx.send_replace(next.clone());
        debug!(from = ?previous, to = ?next, "MQTT connection state changed");
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// A broker session that can be (re)established and polled for events. Implemented over the
/// rumqttc event loop, and by fakes in tests so reconnect behaviour runs without a network.
pub trait Session: Send {
    /// Connect and wait for the broker's acknowledgement, then restore subscriptions
    fn establish(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;
    /// Next network event. An error means the connection is gone.
    fn poll(&mut self) -> BoxFuture<'_, Result<Event, TransportError>>;
    /// Send DISCONNECT and wait, at most `within`, for it to be written
    fn disconnect(&mut self, within: Duration) -> BoxFuture<'_, ()>;
}

pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    subscriptions: Vec<(String, QoS)>,
    connect_timeout: Duration,
}

impl MqttSession {
    pub fn new(options: MqttOptions, connect_timeout: Duration) -> Self {
        let (client, eventloop) = AsyncClient::new(options, 10);
        Self {
            client,
            eventloop,
            subscriptions: Vec::new(),
            connect_timeout,
        }
    }

    pub fn for_role(config: &ConfigMqtt, role: Role) -> Self {
        Self::new(
            mqtt_options(config, role),
            Duration::from_secs(config.connect_timeout_secs),
        )
    }

    /// Topics to (re)subscribe to every time the broker acknowledges a connection. Clean sessions
    /// don't keep subscriptions across reconnects.
    pub fn subscribe_on_connect(&mut self, topic: impl Into<String>, qos: MqttQoS) {
        self.subscriptions.push((topic.into(), qos.into()));
    }

    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    async fn await_connack(&mut self) -> Result<(), TransportError> {
        loop {
            if let Event::Incoming(Incoming::ConnAck(_)) = self.eventloop.poll().await? {
                return Ok(());
            }
        }
    }
}

impl Session for MqttSession {
    fn establish(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let timeout = self.connect_timeout;
            tokio::time::timeout(timeout, self.await_connack())
                .await
                .map_err(|_| TransportError::Timeout(timeout.as_secs()))??;
            for (topic, qos) in &self.subscriptions {
                self.client
                    .try_subscribe(topic.clone(), *qos)
                    .map_err(|e| TransportError::Subscribe(topic.clone(), e.to_string()))?;
                debug!(%topic, "Subscription requested");
            }
            Ok(())
        })
    }

    fn poll(&mut self) -> BoxFuture<'_, Result<Event, TransportError>> {
        Box::pin(async move { Ok(self.eventloop.poll().await?) })
    }

    fn disconnect(&mut self, within: Duration) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.client.try_disconnect() {
                debug!("Unable to queue MQTT disconnect: {}", e);
                return;
            }
            let eventloop = &mut self.eventloop;
            let flushed = tokio::time::timeout(within, async move {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            })
            .await;
            if flushed.is_err() {
                debug!("MQTT disconnect was not flushed in time");
            }
        })
    }
}

/// One connection attempt, reflected in the tracker
pub async fn reconnect_once<S: Session + ?Sized>(
    session: &mut S,
    tracker: &ConnectionTracker,
) -> Result<(), TransportError> {
    tracker.begin_connect();
    match session.establish().await {
        Ok(()) => {
            tracker.acknowledged();
            Ok(())
        }
        Err(e) => {
            tracker.lost(e.to_string());
            Err(e)
        }
    }
}

/// Retries with a fixed delay until connected. Returns `false` if a stop was requested first.
pub async fn reconnect_until_connected<S: Session + ?Sized>(
    session: &mut S,
    tracker: &ConnectionTracker,
    delay: Duration,
    shutdown: &mut Shutdown,
) -> bool {
    loop {
        if shutdown.is_requested() {
            return false;
        }
        let attempt = tokio::select! {
            attempt = reconnect_once(session, tracker) => attempt,
            _ = shutdown.requested() => return false,
        };
        match attempt {
            Ok(()) => return true,
            Err(e) => {
                warn!(
                    "MQTT reconnection failed: {}. Retrying in {}s",
                    e,
                    delay.as_secs_f32()
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.requested() => return false,
                }
            }
        }
    }
}

/// Publisher side transport. The event loop lives on its own task; publishing only hands the
/// message to that task and never waits on the network.
pub struct EdgeTransport {
    client: AsyncClient,
    state: watch::Receiver<ConnectionState>,
    reconnect: Arc<Notify>,
    qos: QoS,
    stop: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

/// Connects the edge client. Failing to reach the broker here is fatal for the caller; later
/// disconnects are handled in the background.
pub async fn connect_edge(config: &ConfigMqtt) -> Result<EdgeTransport, TransportError> {
    let mut session = MqttSession::for_role(config, Role::Edge);
    let tracker = ConnectionTracker::new();
    reconnect_once(&mut session, &tracker).await?;
    info!(host = %config.host, port = config.port, "Connected to MQTT broker");

    let client = session.client();
    let state = tracker.subscribe();
    let reconnect = Arc::new(Notify::new());
    let (stop, stop_rx) = Shutdown::channel();
    let driver = tokio::spawn(drive_edge(session, tracker, reconnect.clone(), stop_rx));

    Ok(EdgeTransport {
        client,
        state,
        reconnect,
        qos: config.qos.into(),
        stop,
        driver: Some(driver),
    })
}

/// Background loop for the edge session. A disconnect gets exactly one immediate reconnect
/// attempt. After a failed attempt the next one waits until a publish finds the link down, so a
/// dead broker never keeps the task spinning.
async fn drive_edge<S: Session>(
    mut session: S,
    tracker: ConnectionTracker,
    reconnect: Arc<Notify>,
    mut stop: Shutdown,
) {
    loop {
        let event = tokio::select! {
            _ = stop.requested() => break,
            event = session.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => tracker.acknowledged(),
            Ok(Event::Incoming(Incoming::PubAck(ack))) => {
                trace!(pkid = ack.pkid, "Broker acknowledged alert")
            }
            Ok(_) => {}
            Err(e) => {
                tracker.lost(e.to_string());
                warn!("Unexpected disconnect from MQTT broker: {}. Attempting reconnect...", e);
                loop {
                    let attempt = tokio::select! {
                        _ = stop.requested() => return,
                        attempt = reconnect_once(&mut session, &tracker) => attempt,
                    };
                    match attempt {
                        Ok(()) => {
                            info!("Reconnected to MQTT broker");
                            break;
                        }
                        Err(e) => {
                            error!("MQTT reconnect failed: {}", e);
                            tokio::select! {
                                _ = stop.requested() => return,
                                _ = reconnect.notified() => {
                                    debug!("Alert pending while disconnected, retrying connection")
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    session.disconnect(CLOSE_WINDOW).await;
}

impl EdgeTransport {
    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Graceful shutdown: lets the event loop send DISCONNECT before it stops
    pub async fn close(mut self) {
        let _ = self.stop.send(true);
        if let Some(driver) = self.driver.take() {
            match tokio::time::timeout(CLOSE_WINDOW * 2, driver).await {
                Ok(Ok(())) => debug!("MQTT event loop stopped"),
                Ok(Err(e)) => error!("MQTT event loop task failed: {}", e),
                Err(_) => warn!("MQTT event loop did not stop in time"),
            }
        }
    }
}

impl AlertPublisher for EdgeTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if !self.state.borrow().is_connected() {
            self.reconnect.notify_one();
            return Err(PublishError::NotConnected);
        }
        self.client.try_publish(topic, self.qos, false, payload)?;
        Ok(())
    }
}

impl Drop for EdgeTransport {
    fn drop(&mut self) {
        // Only reached without `close`. Best effort, the task is torn down right away.
        if let Some(driver) = self.driver.take() {
            let _ = self.client.try_disconnect();
            driver.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use futures::future::BoxFuture;
    use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
    use tokio::sync::Notify;

    use super::{
        drive_edge, reconnect_once, reconnect_until_connected, ConnectionState,
        ConnectionTracker, EdgeTransport, Session,
    };
    use crate::{
        alert::AlertPublisher,
        mqtt::{PublishError, TransportError},
        shutdown::Shutdown,
    };

    /// Scripted session. Runs out of poll events by idling forever, like a quiet broker.
    #[derive(Default)]
    pub struct FakeSession {
        pub connects: VecDeque<Result<(), TransportError>>,
        pub polls: VecDeque<Result<Event, TransportError>>,
        pub attempts: Arc<AtomicUsize>,
        pub disconnected: Arc<AtomicBool>,
    }

    impl FakeSession {
        pub fn new(
            connects: Vec<Result<(), TransportError>>,
            polls: Vec<Result<Event, TransportError>>,
        ) -> Self {
            Self {
                connects: connects.into(),
                polls: polls.into(),
                ..Default::default()
            }
        }
    }

    impl Session for FakeSession {
        fn establish(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let result = self.connects.pop_front().unwrap_or(Ok(()));
            Box::pin(async move { result })
        }

        fn poll(&mut self) -> BoxFuture<'_, Result<Event, TransportError>> {
            let next = self.polls.pop_front();
            Box::pin(async move {
                match next {
                    Some(event) => event,
                    None => futures::future::pending().await,
                }
            })
        }

        fn disconnect(&mut self, _within: Duration) -> BoxFuture<'_, ()> {
            self.disconnected.store(true, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    pub fn refused() -> TransportError {
        TransportError::Connection("connection refused".into())
    }

    pub fn reset() -> TransportError {
        TransportError::Connection("connection reset by peer".into())
    }

    #[test]
    fn test_tracker_transitions() {
        let tracker = ConnectionTracker::new();
        let observer = tracker.subscribe();
        assert_eq!(
            *observer.borrow(),
            ConnectionState::Disconnected { reason: None }
        );

        tracker.begin_connect();
        assert_eq!(*observer.borrow(), ConnectionState::Connecting);
        tracker.acknowledged();
        assert!(observer.borrow().is_connected());
        tracker.lost("keep alive timeout");
        assert_eq!(
            tracker.state(),
            ConnectionState::Disconnected {
                reason: Some("keep alive timeout".into())
            }
        );
    }

    #[tokio::test]
    async fn test_reconnect_once() {
        let tracker = ConnectionTracker::new();
        let mut session = FakeSession::new(vec![Err(refused()), Ok(())], vec![]);

        assert!(reconnect_once(&mut session, &tracker).await.is_err());
        assert!(matches!(
            tracker.state(),
            ConnectionState::Disconnected { reason: Some(_) }
        ));
        assert!(reconnect_once(&mut session, &tracker).await.is_ok());
        assert_eq!(tracker.state(), ConnectionState::Connected);
        assert_eq!(session.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_until_connected() {
        let tracker = ConnectionTracker::new();
        let mut session = FakeSession::new(vec![Err(refused()), Err(refused()), Ok(())], vec![]);
        let (_tx, mut shutdown) = Shutdown::channel();

        let started = tokio::time::Instant::now();
        let connected = reconnect_until_connected(
            &mut session,
            &tracker,
            Duration::from_secs(5),
            &mut shutdown,
        )
        .await;

        assert!(connected);
        assert_eq!(session.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(tracker.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_stops_on_shutdown() {
        let tracker = ConnectionTracker::new();
        let mut session = FakeSession::new((0..100).map(|_| Err(refused())).collect(), vec![]);
        let (tx, mut shutdown) = Shutdown::channel();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            let _ = tx.send(true);
        });
        let connected = reconnect_until_connected(
            &mut session,
            &tracker,
            Duration::from_secs(5),
            &mut shutdown,
        )
        .await;

        assert!(!connected);
        // Attempts at 0s, 5s and 10s, then the stop at 12s interrupts the wait
        assert_eq!(session.attempts.load(Ordering::SeqCst), 3);
        assert!(!tracker.state().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_edge_single_attempt_per_disconnect() {
        let session = FakeSession::new(
            vec![Err(refused()), Ok(())],
            vec![Ok(Event::Incoming(Incoming::PingResp)), Err(reset())],
        );
        let attempts = session.attempts.clone();
        let disconnected = session.disconnected.clone();
        let tracker = ConnectionTracker::new();
        tracker.acknowledged();
        let state = tracker.subscribe();
        let reconnect = Arc::new(Notify::new());
        let (stop_tx, stop) = Shutdown::channel();

        let driver = tokio::spawn(drive_edge(session, tracker, reconnect.clone(), stop));

        // Plenty of time for a retry loop to show up if there was one
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(
            *state.borrow(),
            ConnectionState::Disconnected { reason: Some(_) }
        ));

        // A publish finding the link down asks for another attempt
        reconnect.notify_one();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        stop_tx.send(true).unwrap();
        driver.await.unwrap();
        assert!(disconnected.load(Ordering::SeqCst));
    }

    fn edge_transport(state: ConnectionState) -> (EdgeTransport, rumqttc::EventLoop, Arc<Notify>) {
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);
        let tracker = ConnectionTracker::new();
        let reconnect = Arc::new(Notify::new());
        let (stop, _) = Shutdown::channel();
        let transport = EdgeTransport {
            client,
            state: tracker.subscribe(),
            reconnect: reconnect.clone(),
            qos: QoS::AtMostOnce,
            stop,
            driver: None,
        };
        match state {
            ConnectionState::Connected => tracker.acknowledged(),
            ConnectionState::Connecting => tracker.begin_connect(),
            ConnectionState::Disconnected { reason: Some(r) } => tracker.lost(r),
            ConnectionState::Disconnected { reason: None } => {}
        }
        // The receiver keeps the last value after the tracker is gone
        (transport, eventloop, reconnect)
    }

    #[tokio::test]
    async fn test_publish_while_disconnected() {
        let (transport, _eventloop, reconnect) = edge_transport(ConnectionState::Disconnected {
            reason: Some("connection reset".into()),
        });

        assert_eq!(
            transport.publish("home/security/alert", b"{}".to_vec()),
            Err(PublishError::NotConnected)
        );
        // The failed publish left a reconnect request behind
        tokio::time::timeout(Duration::from_millis(100), reconnect.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_while_connecting_is_refused() {
        let (transport, _eventloop, _) = edge_transport(ConnectionState::Connecting);
        assert_eq!(
            transport.publish("home/security/alert", b"{}".to_vec()),
            Err(PublishError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_publish_while_connected_is_queued() {
        let (transport, _eventloop, _) = edge_transport(ConnectionState::Connected);
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert_eq!(
            transport.publish("home/security/alert", b"{}".to_vec()),
            Ok(())
        );
    }
}
