use crate::model::{PowerReading, Reading, TemperatureReading};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{error, warn};

/// Which canonical shape a topic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingKind {
    Temperature,
    Power,
}

/// Static mapping from MQTT topic to reading shape.
#[derive(Debug, Clone)]
pub struct TopicTable {
    temperature: String,
    pzem: String,
}

impl TopicTable {
    pub fn new(temperature: String, pzem: String) -> Self {
        Self { temperature, pzem }
    }

    pub fn kind(&self, topic: &str) -> Option<ReadingKind> {
        if topic == self.temperature {
            Some(ReadingKind::Temperature)
        } else if topic == self.pzem {
            Some(ReadingKind::Power)
        } else {
            None
        }
    }
}

/// A decoded reading plus the normalized JSON object it came from. The
/// object keeps any extra keys the sensor sent and is what gets broadcast
/// to live subscribers.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub reading: Reading,
    pub payload: Value,
}

/// Turn a raw MQTT payload into a fully-populated canonical reading.
///
/// Missing or unusable fields are backfilled (0.0 for numerics, the last
/// topic segment for the device id, "now" for the timestamp) rather than
/// rejected. Only a message on an unrecognized topic is dropped.
pub fn normalize(table: &TopicTable, topic: &str, raw: &[u8]) -> Option<NormalizedMessage> {
    let kind = match table.kind(topic) {
        Some(kind) => kind,
        None => {
            warn!(topic, "message on unrecognized topic, dropping");
            return None;
        }
    };

    let mut map = match (kind, decode_payload(raw)) {
        (ReadingKind::Temperature, Value::Number(n)) => {
            // Bare numeric temperature, e.g. a sensor publishing "27.5".
            let mut map = Map::new();
            map.insert("temperature".to_string(), Value::Number(n));
            map
        }
        (_, Value::Object(map)) => map,
        (_, other) => {
            error!(topic, payload = %other, "payload is not a usable shape, substituting zeroed record");
            Map::new()
        }
    };

    let device_id = backfill_device_id(&mut map, topic);
    let time = backfill_time(&mut map);

    let reading = match kind {
        ReadingKind::Temperature => Reading::Temperature(TemperatureReading {
            device_id,
            temperature: numeric_field(&mut map, "temperature"),
            time,
        }),
        ReadingKind::Power => Reading::Power(PowerReading {
            device_id,
            voltage: numeric_field(&mut map, "voltage"),
            current: numeric_field(&mut map, "current"),
            power: numeric_field(&mut map, "power"),
            energy: numeric_field(&mut map, "energy"),
            time,
        }),
    };

    Some(NormalizedMessage {
        reading,
        payload: Value::Object(map),
    })
}

fn decode_payload(raw: &[u8]) -> Value {
    // A bare number is valid JSON, so this covers both objects and scalars.
    if let Ok(value) = serde_json::from_slice::<Value>(raw) {
        return value;
    }
    let text = String::from_utf8_lossy(raw);
    match text.trim().parse::<f64>() {
        Ok(n) => Value::from(n),
        Err(_) => {
            error!(payload = %text, "unable to decode payload");
            Value::Null
        }
    }
}

fn device_from_topic(topic: &str) -> &str {
    topic.rsplit('/').next().unwrap_or(topic)
}

fn backfill_device_id(map: &mut Map<String, Value>, topic: &str) -> String {
    let device_id = match map.get("device_id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => device_from_topic(topic).to_string(),
    };
    map.insert("device_id".to_string(), Value::String(device_id.clone()));
    device_id
}

fn backfill_time(map: &mut Map<String, Value>) -> DateTime<Utc> {
    let time = map
        .get("time")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    if !map.contains_key("time") {
        map.insert("time".to_string(), Value::String(time.to_rfc3339()));
    }
    time
}

fn numeric_field(map: &mut Map<String, Value>, key: &str) -> f64 {
    match map.get(key).and_then(Value::as_f64) {
        Some(v) => v,
        None => {
            map.insert(key.to_string(), Value::from(0.0));
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> TopicTable {
        TopicTable::new("plts/temperature".to_string(), "plts/pzem".to_string())
    }

    #[test]
    fn test_bare_number_wraps_as_temperature() {
        let msg = normalize(&table(), "plts/temperature", b"27.5").unwrap();
        match msg.reading {
            Reading::Temperature(r) => {
                assert_eq!(r.device_id, "temperature");
                assert_eq!(r.temperature, 27.5);
            }
            _ => panic!("expected temperature reading"),
        }
        assert_eq!(msg.payload["device_id"], "temperature");
        assert_eq!(msg.payload["temperature"], 27.5);
        assert!(msg.payload.get("time").is_some());
    }

    #[test]
    fn test_garbage_payload_becomes_zeroed_record() {
        let msg = normalize(&table(), "plts/pzem", b"not json at all").unwrap();
        match msg.reading {
            Reading::Power(r) => {
                assert_eq!(r.device_id, "pzem");
                assert_eq!(r.voltage, 0.0);
                assert_eq!(r.current, 0.0);
                assert_eq!(r.power, 0.0);
                assert_eq!(r.energy, 0.0);
            }
            _ => panic!("expected power reading"),
        }
    }

    #[test]
    fn test_missing_fields_are_backfilled() {
        let raw = serde_json::to_vec(&json!({
            "device_id": "sensor-pzem004t-001",
            "voltage": 230.0,
            "extra": "kept"
        }))
        .unwrap();
        let msg = normalize(&table(), "plts/pzem", &raw).unwrap();
        match &msg.reading {
            Reading::Power(r) => {
                assert_eq!(r.voltage, 230.0);
                assert_eq!(r.power, 0.0);
            }
            _ => panic!("expected power reading"),
        }
        // Extra keys survive into the broadcast payload.
        assert_eq!(msg.payload["extra"], "kept");
        assert_eq!(msg.payload["current"], 0.0);
    }

    #[test]
    fn test_empty_device_id_derived_from_topic() {
        let raw = serde_json::to_vec(&json!({"device_id": "", "temperature": 1.0})).unwrap();
        let msg = normalize(&table(), "plts/temperature", &raw).unwrap();
        assert_eq!(msg.reading.device_id(), "temperature");
    }

    #[test]
    fn test_unknown_topic_dropped() {
        assert!(normalize(&table(), "plts/other", b"{}").is_none());
    }

    #[test]
    fn test_bare_number_on_pzem_topic_is_zeroed() {
        let msg = normalize(&table(), "plts/pzem", b"42").unwrap();
        match msg.reading {
            Reading::Power(r) => assert_eq!(r.voltage, 0.0),
            _ => panic!("expected power reading"),
        }
    }

    #[test]
    fn test_supplied_time_is_parsed() {
        let raw = serde_json::to_vec(&json!({
            "device_id": "d1",
            "temperature": 20.0,
            "time": "2024-05-01T10:00:00+00:00"
        }))
        .unwrap();
        let msg = normalize(&table(), "plts/temperature", &raw).unwrap();
        assert_eq!(
            msg.reading.time(),
            DateTime::parse_from_rfc3339("2024-05-01T10:00:00+00:00").unwrap()
        );
    }
}
