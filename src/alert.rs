//! Threshold rules deciding whether a stored reading raises an alert.
use serde::{Deserialize, Serialize};

use crate::record::Reading;

pub const MOTION_SENSOR: &str = "motion";
pub const SOUND_SENSOR: &str = "sound";

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Parameters for the alert rules.
pub struct AlertParameters {
    /// Sound readings above this level raise an alert.
    #[serde(default = "default_sound_threshold")]
    pub sound_threshold: f64,
}

impl Default for AlertParameters {
    fn default() -> Self {
        AlertParameters { sound_threshold: default_sound_threshold() }
    }
}

fn default_sound_threshold() -> f64 {
    70.0
}

/// A triggered alert, ready to be mailed.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub subject: String,
    pub body: String,
}

/// Static mapping from sensor type to alert predicate.
///
/// * `motion` alerts when the value equals `1`.
/// * `sound` alerts when the value is strictly above the configured threshold.
///
/// Every other sensor type never alerts.
#[derive(Debug, Clone)]
pub struct ThresholdRules {
    sound_threshold: f64,
}

impl ThresholdRules {
    pub fn new(params: &AlertParameters) -> Self {
        ThresholdRules { sound_threshold: params.sound_threshold }
    }

    pub fn is_triggered(&self, sensor_type: &str, value: f64) -> bool {
        match sensor_type {
            MOTION_SENSOR => value == 1.0,
            SOUND_SENSOR => value > self.sound_threshold,
            _ => false,
        }
    }

    /// Evaluates the rule for a stored reading and composes the alert if it is triggered.
    pub fn evaluate(&self, reading: &Reading) -> Option<Alert> {
        if !self.is_triggered(&reading.sensor_type, reading.value) {
            return None;
        }

        let timestamp = reading.timestamp.format("%Y-%m-%d %H:%M:%S %Z");
        let alert = match reading.sensor_type.as_str() {
            MOTION_SENSOR => Alert {
                subject: String::from("Motion detected!"),
                body: format!("Motion detected by the ESP32 at {}.", timestamp),
            },
            SOUND_SENSOR => Alert {
                subject: String::from("High sound level detected!"),
                body: format!("High sound level ({}) detected by the ESP32 at {}.", reading.value, timestamp),
            },
            _ => return None,
        };
        Some(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn reading(sensor_type: &str, value: f64) -> Reading {
        Reading {
            id: 7,
            sensor_type: sensor_type.to_string(),
            value,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        }
    }

    fn rules() -> ThresholdRules {
        ThresholdRules::new(&AlertParameters::default())
    }

    #[test]
    fn motion_alerts_only_on_one() {
        let rules = rules();
        assert!(rules.is_triggered("motion", 1.0));
        assert!(!rules.is_triggered("motion", 0.0));
        assert!(!rules.is_triggered("motion", 2.0));
        assert!(!rules.is_triggered("motion", 0.999));
    }

    #[test]
    fn sound_threshold_is_exclusive() {
        let rules = rules();
        assert!(rules.is_triggered("sound", 71.0));
        assert!(rules.is_triggered("sound", 70.01));
        assert!(!rules.is_triggered("sound", 70.0));
        assert!(!rules.is_triggered("sound", 12.5));
    }

    #[test]
    fn configured_threshold_is_used() {
        let rules = ThresholdRules::new(&AlertParameters { sound_threshold: 40.0 });
        assert!(rules.is_triggered("sound", 41.0));
        assert!(!rules.is_triggered("sound", 40.0));
    }

    #[test]
    fn unknown_sensor_types_never_alert() {
        let rules = rules();
        assert!(!rules.is_triggered("temperature", 1.0));
        assert!(!rules.is_triggered("temperature", 1000.0));
        assert_eq!(rules.evaluate(&reading("temperature", 1.0)), None);
    }

    #[test]
    fn sound_alert_mentions_value_and_timestamp() {
        let alert = rules().evaluate(&reading("sound", 82.5)).unwrap();
        assert_eq!(alert.subject, "High sound level detected!");
        assert!(alert.body.contains("82.5"));
        assert!(alert.body.contains("2024-05-01 12:30:00"));
    }

    #[test]
    fn motion_alert_mentions_timestamp() {
        let alert = rules().evaluate(&reading("motion", 1.0)).unwrap();
        assert_eq!(alert.subject, "Motion detected!");
        assert!(alert.body.contains("2024-05-01 12:30:00"));
        assert_eq!(rules().evaluate(&reading("motion", 0.0)), None);
    }
}
