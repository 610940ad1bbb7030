use std::time::Duration;

use rumqttc::{Event, Incoming};
use tracing::{info, info_span, trace, warn, Instrument};

use crate::{
    alert::{Listener, NotificationSink, TerminalSink},
    config::Config,
    mqtt::{
        reconnect_once, reconnect_until_connected, ConnectionTracker, MqttSession, Role, Session,
        TransportError, CLOSE_WINDOW,
    },
    shutdown::Shutdown,
};

/// Subscriber process: connects, subscribes and presents intrusion alerts on the terminal until
/// a stop is requested. Only a failed first connection is returned as an error.
pub async fn run(cfg: Config, shutdown: Shutdown) -> Result<(), MonitorError> {
    let logging_span = info_span!("Monitor", topic = %cfg.mqtt.topic);
    async move {
        let mut session = MqttSession::for_role(&cfg.mqtt, Role::Monitor);
        session.subscribe_on_connect(cfg.mqtt.topic.clone(), cfg.mqtt.qos);
        let tracker = ConnectionTracker::new();

        info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, "Connecting to broker");
        reconnect_once(&mut session, &tracker).await?;
        info!("Connected, waiting for alerts");

        receive_loop(
            &mut session,
            &tracker,
            Listener::new(TerminalSink::stdout()),
            Duration::from_secs(cfg.mqtt.reconnect_delay_secs),
            shutdown,
        )
        .await;
        info!("Monitor stopped");
        Ok(())
    }
    .instrument(logging_span)
    .await
}

/// Hands every received message to the listener. A lost connection is retried with a fixed
/// delay for as long as it takes; only a stop request ends the loop.
pub async fn receive_loop<S, N>(
    session: &mut S,
    tracker: &ConnectionTracker,
    mut listener: Listener<N>,
    reconnect_delay: Duration,
    mut shutdown: Shutdown,
) -> Listener<N>
where
    S: Session + ?Sized,
    N: NotificationSink,
{
    loop {
        let polled = tokio::select! {
            polled = session.poll() => polled,
            _ = shutdown.requested() => break,
        };
        match polled {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                trace!(topic = %publish.topic, bytes = publish.payload.len(), "Message received");
                listener.on_message(&publish.payload);
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                info!(codes = ?ack.return_codes, "Subscription acknowledged");
            }
            Ok(event) => trace!(?event, "MQTT event"),
            Err(e) => {
                warn!("Lost connection to broker: {}", e);
                tracker.lost(e.to_string());
                if !reconnect_until_connected(session, tracker, reconnect_delay, &mut shutdown).await
                {
                    break;
                }
                info!("Reconnected to broker");
            }
        }
    }
    session.disconnect(CLOSE_WINDOW).await;
    listener
}

quick_error! {
    #[derive(Debug)]
    pub enum MonitorError {
        Broker(error: TransportError) {
            display("{}", error)
            from()
            source(error)
        }
    }
}
