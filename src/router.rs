//! Routing of a single mqtt message into a stored reading and an optional alert mail.
use serde_json::Value;

use crate::alert::ThresholdRules;
use crate::database::{ReadingStore, StoreError};
use crate::mailer::Notifier;
use crate::record::Reading;

/// Literal expected as the second topic segment, e.g. `esp32/sensors/motion`.
pub const SENSOR_TOPIC_SEGMENT: &str = "sensors";
const VALUE_FIELD: &str = "value";

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("payload cannot be decoded: {0}")]
    Decode(String),
    #[error("topic format not recognized: \'{0}\'")]
    TopicFormat(String),
    #[error("payload is missing the \'{0}\' field")]
    MissingField(&'static str),
    #[error("reading could not be stored: {0}")]
    Storage(#[from] StoreError),
}

/// What happened to the alert of a stored reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDelivery {
    NotTriggered,
    Sent,
    Failed,
}

/// Outcome of a successfully routed message.
#[derive(Debug, Clone)]
pub struct Routed {
    pub reading: Reading,
    pub alert: AlertDelivery,
}

/// Extracts the sensor type from a topic shaped like `<device>/sensors/.../<sensor_type>`.
pub fn sensor_type(topic: &str) -> Result<&str, RouteError> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() < 3 || segments[1] != SENSOR_TOPIC_SEGMENT {
        return Err(RouteError::TopicFormat(topic.to_string()));
    }
    match segments.last() {
        Some(&sensor_type) if !sensor_type.is_empty() => Ok(sensor_type),
        _ => Err(RouteError::TopicFormat(topic.to_string())),
    }
}

fn decode(payload: &[u8]) -> Result<serde_json::Map<String, Value>, RouteError> {
    let text = std::str::from_utf8(payload)
        .map_err(|err| RouteError::Decode(format!("payload is not UTF-8: {}", err)))?;
    match serde_json::from_str::<Value>(text.trim_end()) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(other) => Err(RouteError::Decode(format!("expected a JSON object, got \'{}\'", other))),
        Err(err) => Err(RouteError::Decode(err.to_string())),
    }
}

/// Decodes, validates and stores inbound messages and sends alert mails for readings that
/// cross a threshold.
///
/// Persistence comes first: a failing alert never undoes or retries the stored reading.
pub struct MessageRouter<S, N> {
    store: S,
    notifier: N,
    rules: ThresholdRules,
    recipient: String,
}

impl<S: ReadingStore, N: Notifier> MessageRouter<S, N> {
    pub fn new(store: S, notifier: N, rules: ThresholdRules, recipient: String) -> Self {
        MessageRouter { store, notifier, rules, recipient }
    }

    pub fn route(&mut self, topic: &str, payload: &[u8]) -> Result<Routed, RouteError> {
        let object = decode(payload)?;
        let sensor_type = sensor_type(topic)?;
        let value = match object.get(VALUE_FIELD) {
            None => return Err(RouteError::MissingField(VALUE_FIELD)),
            Some(value) => value.as_f64()
                .ok_or_else(|| RouteError::Decode(format!("\'{}\' is not a number: {}", VALUE_FIELD, value)))?,
        };

        let reading = self.store.insert_reading(sensor_type, value)?;
        log::info!(target: "sensord::router", "Stored reading {}: {} = {}", reading.id, reading.sensor_type, reading.value);

        let alert = match self.rules.evaluate(&reading) {
            None => AlertDelivery::NotTriggered,
            Some(alert) => match self.notifier.notify(&self.recipient, &alert) {
                Ok(_) => {
                    log::warn!(target: "sensord::router", "Alert \'{}\' sent to \'{}\'", alert.subject, self.recipient);
                    AlertDelivery::Sent
                }
                Err(err) => {
                    log::error!(target: "sensord::router", "Could not send alert for reading {}: \'{}\'", reading.id, err);
                    AlertDelivery::Failed
                }
            },
        };

        Ok(Routed { reading, alert })
    }
}

/// Receiver of the messages delivered by the subscription loop.
///
/// Handlers must not fail: every per message error is dealt with inside the handler.
pub trait MessageHandler {
    fn handle(&mut self, topic: &str, payload: &[u8]);
}

impl<S: ReadingStore, N: Notifier> MessageHandler for MessageRouter<S, N> {
    fn handle(&mut self, topic: &str, payload: &[u8]) {
        match self.route(topic, payload) {
            Ok(routed) => {
                log::debug!(target: "sensord::router", "Routed reading {} from \'{}\', alert: {:?}", routed.reading.id, topic, routed.alert);
            }
            Err(RouteError::Storage(err)) => {
                log::error!(target: "sensord::router", "Dropping message on topic \'{}\': \'{}\'", topic, err);
            }
            Err(err) => {
                log::warn!(target: "sensord::router", "Dropping message on topic \'{}\': \'{}\'", topic, err);
            }
        }
    }
}

impl<F: FnMut(&str, &[u8])> MessageHandler for F {
    fn handle(&mut self, topic: &str, payload: &[u8]) {
        self(topic, payload)
    }
}
