//! Module that contains the record type stored by this application.
use chrono::{DateTime, Utc};
use postgres::Row;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Struct representing a single sensor reading as stored in the database.
///
/// Readings are never updated once stored, the `id` and `timestamp` are assigned by the database.
pub struct Reading
{
    /// Database assigned identifier.
    pub id: i64,
    /// The kind of sensor, taken from the last segment of the mqtt topic. e.g. `motion` or `sound`.
    pub sensor_type: String,
    /// The measured value.
    pub value: f64,
    /// Timestamp the reading was stored.
    pub timestamp: DateTime<Utc>,
}

impl TryFrom<&Row> for Reading {
    type Error = postgres::Error;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Reading {
            id: row.try_get("id")?,
            sensor_type: row.try_get("sensor_type")?,
            value: row.try_get("value")?,
            timestamp: row.try_get("timestamp")?,
        })
    }
}
