//! Daemon configuration, loaded once from a yaml file at startup.
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use lettre::message::Mailbox;
use serde::{Deserialize, Serialize};

use crate::alert::AlertParameters;
use crate::api::HttpParameters;
use crate::database::DatabaseParameters;
use crate::logging::LoggingParameters;
use crate::mailer::MailParameters;
use crate::mqtt::MqttParams;

pub const DEFAULT_CONFIGURATION_PATH: &str = "/etc/sensord/sensord.yml";

/// Upper bound for the reconnect delay, one day.
const MAX_RECONNECT_SECS: u64 = 86_400;
/// Upper bound for the shutdown timeout, one hour.
const MAX_SHUTDOWN_TIMEOUT_SECS: u64 = 3_600;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Configuration {
    pub mqtt_connection_parameters: MqttParams,
    pub database_connection_parameters: DatabaseParameters,
    pub mail_parameters: MailParameters,
    #[serde(default)]
    pub http_parameters: HttpParameters,
    #[serde(default)]
    pub alert_parameters: AlertParameters,
    #[serde(default)]
    pub logging: LoggingParameters,
    /// Seconds to wait for the worker threads once the termination signal was received.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_shutdown_timeout() -> u64 {
    10
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read the configuration file \'{path}\': {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("cannot deserialize the configuration: {0}")]
    Format(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Configuration {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let io_error = |source| ConfigError::Io { path: path.to_path_buf(), source };

        let mut configuration_string = String::new();
        File::open(path)
            .and_then(|mut file| file.read_to_string(&mut configuration_string))
            .map_err(io_error)?;

        Configuration::from_yaml(&configuration_string)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let configuration = serde_yaml::from_str::<Configuration>(yaml)?;
        configuration.validate()?;
        Ok(configuration)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mqtt = &self.mqtt_connection_parameters;
        if !(0..=2).contains(&mqtt.qos) {
            return Err(ConfigError::Invalid(format!("mqtt qos must be 0, 1 or 2, got {}", mqtt.qos)));
        }
        if mqtt.reconnect_base_secs == 0 || mqtt.reconnect_max_secs < mqtt.reconnect_base_secs {
            return Err(ConfigError::Invalid(String::from("reconnect delays must satisfy 0 < base <= max")));
        }
        if mqtt.reconnect_max_secs > MAX_RECONNECT_SECS {
            return Err(ConfigError::Invalid(format!("reconnect delay must not exceed {}s", MAX_RECONNECT_SECS)));
        }
        if self.shutdown_timeout_secs > MAX_SHUTDOWN_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!("shutdown timeout must not exceed {}s", MAX_SHUTDOWN_TIMEOUT_SECS)));
        }
        if !self.alert_parameters.sound_threshold.is_finite() {
            return Err(ConfigError::Invalid(String::from("sound threshold must be a finite number")));
        }
        if let Err(err) = self.mail_parameters.recipient.parse::<Mailbox>() {
            return Err(ConfigError::Invalid(format!(
                "alert mail recipient \'{}\' is not a valid address: {}", self.mail_parameters.recipient, err)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const MINIMAL: &str = "
mqtt_connection_parameters:
  address: broker.hivemq.com
database_connection_parameters:
  hostname: localhost
  username: sensord
  database: sensord
mail_parameters:
  hostname: smtp.gmail.com
  username: alerts@example.com
  password: secret
  recipient: owner@example.com
";

    #[test]
    fn minimal_configuration_uses_defaults() {
        let configuration = Configuration::from_yaml(MINIMAL).unwrap();
        assert_eq!(configuration.alert_parameters.sound_threshold, 70.0);
        assert_eq!(configuration.mqtt_connection_parameters.topic, "esp32/sensors/#");
        assert_eq!(configuration.http_parameters.port, 8000);
        assert_eq!(configuration.logging.level, "info");
        assert_eq!(configuration.shutdown_timeout_secs, 10);
    }

    #[test]
    fn threshold_can_be_overridden() {
        let yaml = format!("{}alert_parameters:\n  sound_threshold: 55.5\n", MINIMAL);
        let configuration = Configuration::from_yaml(&yaml).unwrap();
        assert_eq!(configuration.alert_parameters.sound_threshold, 55.5);
    }

    #[test]
    fn missing_section_is_a_format_error() {
        let result = Configuration::from_yaml("mqtt_connection_parameters:\n  address: localhost\n");
        assert!(matches!(result, Err(ConfigError::Format(_))));
    }

    #[test]
    fn invalid_qos_is_rejected() {
        let yaml = MINIMAL.replace("address: broker.hivemq.com", "address: broker.hivemq.com\n  qos: 3");
        assert!(matches!(Configuration::from_yaml(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn oversized_delays_are_rejected() {
        let yaml = MINIMAL.replace("address: broker.hivemq.com", "address: broker.hivemq.com\n  reconnect_max_secs: 18446744073709551615");
        assert!(matches!(Configuration::from_yaml(&yaml), Err(ConfigError::Invalid(_))));

        let yaml = format!("{}shutdown_timeout_secs: 18446744073709551615\n", MINIMAL);
        assert!(matches!(Configuration::from_yaml(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_recipient_is_rejected() {
        let yaml = MINIMAL.replace("recipient: owner@example.com", "recipient: not an address");
        assert!(matches!(Configuration::from_yaml(&yaml), Err(ConfigError::Invalid(_))));

        let yaml = MINIMAL.replace("recipient: owner@example.com", "recipient: \"\"");
        assert!(matches!(Configuration::from_yaml(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn reads_configuration_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let configuration = Configuration::from_file(file.path()).unwrap();
        assert_eq!(configuration.mail_parameters.recipient, "owner@example.com");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Configuration::from_file(&dir.path().join("absent.yml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn bundled_configuration_is_valid() {
        let yaml = include_str!("../resources/sensord.yml");
        assert!(Configuration::from_yaml(yaml).is_ok());
    }
}
