use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// One temperature sensor sample.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TemperatureReading {
    pub device_id: String,
    pub temperature: f64,
    #[serde(default = "now")]
    pub time: DateTime<Utc>,
}

/// One PZEM-004T electrical sample (voltage/current/power/energy).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PowerReading {
    pub device_id: String,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy: f64,
    #[serde(default = "now")]
    pub time: DateTime<Utc>,
}

/// A fully-populated reading in one of the two canonical shapes.
#[derive(Debug, Clone)]
pub enum Reading {
    Temperature(TemperatureReading),
    Power(PowerReading),
}

impl Reading {
    pub fn device_id(&self) -> &str {
        match self {
            Reading::Temperature(r) => &r.device_id,
            Reading::Power(r) => &r.device_id,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Reading::Temperature(r) => r.time,
            Reading::Power(r) => r.time,
        }
    }
}

/// A threshold crossing produced by the evaluator. Immutable once created;
/// acknowledgment happens elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Alert {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i32>,
    pub device_id: String,
    pub alert_type: String,
    pub message: String,
    pub threshold: f64,
    pub actual_value: f64,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TemperatureStats {
    pub device_id: String,
    pub avg_temperature: f64,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub reading_count: i64,
    pub last_reading_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PowerStats {
    pub device_id: String,
    pub avg_voltage: f64,
    pub avg_current: f64,
    pub avg_power: f64,
    pub total_energy: f64,
    pub reading_count: i64,
    pub last_reading_time: DateTime<Utc>,
}

/// One time bucket of averaged temperature samples.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TemperatureAggregate {
    pub bucket: DateTime<Utc>,
    pub device_id: String,
    pub avg_temperature: f64,
    pub reading_count: i64,
}

/// One time bucket of averaged electrical samples.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PowerAggregate {
    pub bucket: DateTime<Utc>,
    pub device_id: String,
    pub avg_voltage: f64,
    pub avg_current: f64,
    pub avg_power: f64,
    pub total_energy: f64,
    pub reading_count: i64,
}
