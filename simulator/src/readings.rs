use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperaturePayload {
    pub device_id: String,
    pub temperature: f64,
    pub time: DateTime<Utc>,
}

impl TemperaturePayload {
    pub fn random(rng: &mut impl Rng, device_id: String) -> Self {
        let temperature = if rng.gen_bool(0.05) {
            rng.gen_range(-10.0..70.0)
        } else {
            rng.gen_range(20.0..35.0)
        };
        Self {
            device_id,
            temperature,
            time: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PzemPayload {
    pub device_id: String,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy: f64,
    pub time: DateTime<Utc>,
}

impl PzemPayload {
    pub fn random(rng: &mut impl Rng, device_id: String) -> Self {
        let voltage = if rng.gen_bool(0.05) {
            rng.gen_range(150.0..290.0)
        } else {
            rng.gen_range(215.0..240.0)
        };
        let current = rng.gen_range(0.5..15.0);
        Self {
            device_id,
            voltage,
            current,
            power: voltage * current,
            energy: rng.gen_range(0.0..2.0),
            time: Utc::now(),
        }
    }
}
