mod connection;

pub use connection::{
    connect_edge, reconnect_once, reconnect_until_connected, ConnectionTracker, MqttSession,
    Session, CLOSE_WINDOW,
};
#[cfg(test)]
pub(crate) use connection::test as fakes;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigMqtt;

/// Which process a client belongs to. Picks the reconnect policy and the client id suffix.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
pub enum Role {
    Edge,
    Monitor,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Edge => "edge",
            Role::Monitor => "monitor",
        }
    }
}

/// Client options for a given role. Every client gets a random suffix: public brokers drop the
/// older session when two clients share an id.
pub fn mqtt_options(config: &ConfigMqtt, role: Role) -> rumqttc::MqttOptions {
    let suffix = uuid::Uuid::new_v4().to_string();
    let client_id = format!("{}-{}-{}", config.client_id_prefix, role.name(), &suffix[..8]);
    let mut options = rumqttc::MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(u64::from(config.keepalive_secs)));
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username.clone(), password.clone());
    }
    options
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Copy)]
#[allow(clippy::enum_variant_names)]
pub enum MqttQoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}
impl From<MqttQoS> for rumqttc::QoS {
    fn from(q: MqttQoS) -> Self {
        use rumqttc::QoS;
        match q {
            MqttQoS::AtMostOnce => QoS::AtMostOnce,
            MqttQoS::AtLeastOnce => QoS::AtLeastOnce,
            MqttQoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

quick_error! {
    #[derive(Debug)]
    pub enum TransportError {
        Connection(error: String) {
            display("Unable to connect to MQTT broker: {}", error)
            from(e: rumqttc::ConnectionError) -> (e.to_string())
        }
        Timeout(secs: u64) {
            display("MQTT broker did not acknowledge the connection within {}s", secs)
        }
        Subscribe(topic: String, error: String) {
            display("Unable to subscribe to {}: {}", topic, error)
        }
    }
}

quick_error! {
    #[derive(Debug, PartialEq, Eq)]
    pub enum PublishError {
        NotConnected {
            display("Not connected to the MQTT broker")
        }
        Rejected(error: String) {
            display("MQTT client rejected the message: {}", error)
            from(e: rumqttc::ClientError) -> (e.to_string())
        }
    }
}

#[cfg(test)]
mod test {
    use super::{mqtt_options, MqttQoS, Role};
    use crate::config::Config;

    #[test]
    fn test_client_ids_unique_per_role() {
        let config = Config::default();
        let edge = mqtt_options(&config.mqtt, Role::Edge);
        let edge_again = mqtt_options(&config.mqtt, Role::Edge);
        let monitor = mqtt_options(&config.mqtt, Role::Monitor);

        assert!(edge.client_id().starts_with("sentinel-edge-"));
        assert!(monitor.client_id().starts_with("sentinel-monitor-"));
        assert_eq!(edge.client_id().len(), "sentinel-edge-".len() + 8);
        assert_ne!(edge.client_id(), edge_again.client_id());
        assert_eq!(
            edge.broker_address(),
            ("test.mosquitto.org".to_string(), 1883)
        );
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(rumqttc::QoS::from(MqttQoS::AtMostOnce), rumqttc::QoS::AtMostOnce);
        assert_eq!(rumqttc::QoS::from(MqttQoS::ExactlyOnce), rumqttc::QoS::ExactlyOnce);
    }
}
