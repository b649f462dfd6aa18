extern crate paho_mqtt as mqtt;

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Parameters for the mqtt connection.
pub struct MqttParams
{
    /// The address of the mqtt broker.
    pub address: String,
    /// The port of the mqtt broker.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enable tls encryption.
    #[serde(default)]
    pub tls_enable: bool,
    /// Optional TLS parameters for the mqtt connection.
    #[serde(default)]
    pub tls_params: Option<MqttTlsParams>,
    /// Optional username for the broker.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional password for the broker.
    #[serde(default)]
    pub password: Option<String>,
    /// Topic filter to subscribe to for sensor data.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// The QoS to use for the subscription.
    #[serde(default)]
    pub qos: i32,
    /// Client id, generated from the current time if not set.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Delay before the first reconnect, doubled on every further attempt.
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_secs: u64,
    /// Upper bound for the reconnect delay.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// TLS parametes required for MQTT with TLS.
pub struct MqttTlsParams {
    /// The path to the CA certificate for TLS encryption.
    pub ca_path: String,
    /// The path to the client certificate to use for TLS encryption.
    #[serde(default)]
    pub cert_path: Option<String>,
    /// The path to the client key to use for TLS encryption.
    #[serde(default)]
    pub key_path: Option<String>,
    /// The password for the ssl private key.
    #[serde(default)]
    pub key_pass: Option<String>,
}

fn default_port() -> u16 {
    1883
}

fn default_topic() -> String {
    String::from("esp32/sensors/#")
}

fn default_keep_alive() -> u64 {
    20
}

fn default_connect_timeout() -> u64 {
    4
}

fn default_reconnect_base() -> u64 {
    5
}

fn default_reconnect_max() -> u64 {
    60
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("TLS enabled but no TLS parameters specified")]
    MissingTlsParameters,
    #[error("mqtt error: {0}")]
    Mqtt(#[from] mqtt::Error),
    #[error("unable to subscribe to \'{topic}\': {source}")]
    Subscribe { topic: String, source: mqtt::Error },
    #[error("connection to the broker was lost")]
    ConnectionLost,
    #[error("not connected to the broker")]
    NotConnected,
}

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Connection to a message bus delivering sensor messages.
pub trait Transport {
    /// Connects to the broker and subscribes to the sensor topics.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Waits up to `timeout` for the next message. `Ok(None)` means no message arrived in time.
    ///
    /// Any error means the connection is gone and has to be reestablished.
    fn next_message(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError>;

    /// Closes the connection if there is one.
    fn disconnect(&mut self);
}

fn server_uri(params: &MqttParams) -> String {
    match params.tls_enable {
        true => format!("ssl://{}:{}", params.address, params.port),
        false => format!("tcp://{}:{}", params.address, params.port),
    }
}

fn client_id(params: &MqttParams) -> String {
    match &params.client_id {
        Some(client_id) => client_id.clone(),
        None => format!("sensord-{}", chrono::Utc::now().timestamp()),
    }
}

fn ssl_options(tls_params: &MqttTlsParams) -> Result<mqtt::SslOptions, TransportError> {
    let mut builder = mqtt::SslOptionsBuilder::new();
    builder.trust_store(&tls_params.ca_path)?;
    if let Some(cert_path) = &tls_params.cert_path {
        builder.key_store(cert_path)?;
    }
    if let Some(key_path) = &tls_params.key_path {
        builder.private_key(key_path)?;
    }
    if let Some(key_pass) = &tls_params.key_pass {
        builder.private_key_password(key_pass.as_str());
    }
    Ok(builder.finalize())
}

/// Transport backed by the synchronous paho mqtt client.
pub struct PahoTransport {
    params: MqttParams,
    client: Option<mqtt::Client>,
    receiver: Option<Receiver<Option<mqtt::Message>>>,
}

impl PahoTransport {
    pub fn new(params: MqttParams) -> Self {
        PahoTransport { params, client: None, receiver: None }
    }

    fn connect_options(&self) -> Result<mqtt::ConnectOptions, TransportError> {
        let mut builder = mqtt::ConnectOptionsBuilder::new();
        builder
            .keep_alive_interval(Duration::from_secs(self.params.keep_alive_secs))
            .connect_timeout(Duration::from_secs(self.params.connect_timeout_secs))
            .clean_session(true);

        if let (Some(username), Some(password)) = (&self.params.username, &self.params.password) {
            builder.user_name(username.as_str()).password(password.as_str());
        }

        if self.params.tls_enable {
            let tls_params = self.params.tls_params.as_ref().ok_or(TransportError::MissingTlsParameters)?;
            builder.ssl_options(ssl_options(tls_params)?);
        }
        Ok(builder.finalize())
    }
}

impl Transport for PahoTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.disconnect();

        let create_opts = mqtt::CreateOptionsBuilder::new()
            .server_uri(server_uri(&self.params))
            .client_id(client_id(&self.params))
            .finalize();

        let mut mqtt_client = mqtt::Client::new(create_opts)?;
        mqtt_client.set_timeout(Duration::from_secs(self.params.connect_timeout_secs));

        let receiver = mqtt_client.start_consuming();
        mqtt_client.connect(self.connect_options()?)?;
        log::info!(target: "sensord::mqtt", "Connected to mqtt broker \'{}\'", server_uri(&self.params));

        if let Err(err) = mqtt_client.subscribe(&self.params.topic, self.params.qos) {
            if let Err(err) = mqtt_client.disconnect(None) {
                log::error!(target: "sensord::mqtt", "Could not disconnect from mqtt broker: {}", err);
            }
            return Err(TransportError::Subscribe { topic: self.params.topic.clone(), source: err });
        }
        log::info!(target: "sensord::mqtt", "Subscribed to topic \'{}\' with qos {}", self.params.topic, self.params.qos);

        self.client = Some(mqtt_client);
        self.receiver = Some(receiver);
        Ok(())
    }

    fn next_message(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        let receiver = self.receiver.as_ref().ok_or(TransportError::NotConnected)?;
        match receiver.recv_timeout(timeout) {
            Ok(Some(message)) => {
                log::trace!(target: "sensord::mqtt", "Received message on \'{}\'", message.topic());
                Ok(Some(Message { topic: message.topic().to_string(), payload: message.payload().to_vec() }))
            }
            Ok(None) | Err(RecvTimeoutError::Disconnected) => Err(TransportError::ConnectionLost),
            Err(RecvTimeoutError::Timeout) => Ok(None),
        }
    }

    fn disconnect(&mut self) {
        self.receiver = None;
        if let Some(mqtt_client) = self.client.take() {
            if !mqtt_client.is_connected() {
                return;
            }
            match mqtt_client.disconnect(None) {
                Ok(_) => log::info!(target: "sensord::mqtt", "Disconnected from mqtt broker!"),
                Err(err) => log::error!(target: "sensord::mqtt", "Could not disconnect from mqtt broker: {}", err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parameters(yaml: &str) -> MqttParams {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn defaults_match_the_sensor_setup() {
        let params = parameters("address: broker.hivemq.com\n");
        assert_eq!(params.port, 1883);
        assert_eq!(params.topic, "esp32/sensors/#");
        assert_eq!(params.qos, 0);
        assert_eq!(params.reconnect_base_secs, 5);
        assert_eq!(params.reconnect_max_secs, 60);
        assert_eq!(server_uri(&params), "tcp://broker.hivemq.com:1883");
    }

    #[test]
    fn tls_uses_ssl_scheme() {
        let params = parameters("address: broker.local\nport: 8883\ntls_enable: true\ntls_params:\n  ca_path: /etc/ssl/ca.pem\n");
        assert_eq!(server_uri(&params), "ssl://broker.local:8883");
    }

    #[test]
    fn configured_client_id_is_kept() {
        let params = parameters("address: broker.local\nclient_id: garage\n");
        assert_eq!(client_id(&params), "garage");
        let generated = client_id(&parameters("address: broker.local\n"));
        assert!(generated.starts_with("sensord-"));
    }

    #[test]
    fn tls_without_parameters_is_rejected() {
        let transport = PahoTransport::new(parameters("address: broker.local\ntls_enable: true\n"));
        assert!(matches!(transport.connect_options(), Err(TransportError::MissingTlsParameters)));
    }

    #[test]
    fn receiving_without_connection_fails() {
        let mut transport = PahoTransport::new(parameters("address: broker.local\n"));
        let result = transport.next_message(Duration::from_millis(1));
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }
}
