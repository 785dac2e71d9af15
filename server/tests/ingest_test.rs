//! End-to-end tests against a running broker + database + server.
//!
//! Requires: an MQTT broker on localhost:1883, the server subscribed to the
//! default topics and serving HTTP on localhost:8080, and Postgres behind
//! it. Run with `cargo test -- --ignored`.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;

const API_BASE: &str = "http://localhost:8080/api/v1";

async fn mqtt_client(client_id: &str) -> AsyncClient {
    let mut mqtt_options = MqttOptions::new(client_id, "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("MQTT error: {}", e);
                break;
            }
        }
    });

    sleep(Duration::from_millis(500)).await;
    client
}

#[tokio::test]
#[ignore]
async fn test_ingest_both_shapes_end_to_end() {
    let client = mqtt_client("ingest-test").await;

    let temperature = json!({
        "device_id": "ingest-test-temp",
        "temperature": 26.4,
        "time": Utc::now().to_rfc3339(),
    });
    client
        .publish(
            "plts/temperature",
            QoS::AtLeastOnce,
            false,
            temperature.to_string(),
        )
        .await
        .expect("publish temperature");

    let pzem = json!({
        "device_id": "ingest-test-pzem",
        "voltage": 231.2,
        "current": 4.2,
        "power": 971.0,
        "energy": 0.3,
    });
    client
        .publish("plts/pzem", QoS::AtLeastOnce, false, pzem.to_string())
        .await
        .expect("publish pzem");

    // Bare-number and garbage payloads must be absorbed, not crash anything.
    client
        .publish("plts/temperature", QoS::AtLeastOnce, false, "24.8")
        .await
        .expect("publish bare number");
    client
        .publish("plts/pzem", QoS::AtLeastOnce, false, "not json")
        .await
        .expect("publish garbage");

    sleep(Duration::from_secs(2)).await;
}

#[tokio::test]
#[ignore]
async fn test_stats_for_unseen_device_report_empty_window() {
    let device_id = format!("stats-test-none-{}", Utc::now().timestamp_millis());
    let start = Utc::now() - TimeDelta::hours(1);
    let end = Utc::now();

    let stats: Value = reqwest::Client::new()
        .get(format!("{}/stats/temperature/{}", API_BASE, device_id))
        .query(&[
            ("start_time", start.to_rfc3339()),
            ("end_time", end.to_rfc3339()),
        ])
        .send()
        .await
        .expect("stats request")
        .error_for_status()
        .expect("stats status")
        .json()
        .await
        .expect("stats body");

    assert_eq!(stats["device_id"], device_id.as_str());
    assert_eq!(stats["reading_count"], 0);
    let last: DateTime<Utc> = stats["last_reading_time"]
        .as_str()
        .expect("last_reading_time string")
        .parse()
        .expect("last_reading_time timestamp");
    assert_eq!(last, start);
}

#[tokio::test]
#[ignore]
async fn test_hourly_aggregate_buckets_readings_an_hour_apart() {
    let device_id = format!("agg-test-{}", Utc::now().timestamp_millis());
    // Align the window on an hour boundary so the two readings land in
    // distinct hourly buckets.
    let start = (Utc::now() - TimeDelta::hours(2))
        .duration_trunc(TimeDelta::hours(1))
        .expect("truncate to hour");
    let end = start + TimeDelta::hours(2);

    let client = mqtt_client("agg-test").await;
    for minutes in [5, 65] {
        let reading = json!({
            "device_id": device_id,
            "temperature": 25.0,
            "time": (start + TimeDelta::minutes(minutes)).to_rfc3339(),
        });
        client
            .publish(
                "plts/temperature",
                QoS::AtLeastOnce,
                false,
                reading.to_string(),
            )
            .await
            .expect("publish reading");
    }

    sleep(Duration::from_secs(2)).await;

    let buckets: Vec<Value> = reqwest::Client::new()
        .get(format!("{}/aggregated/temperature/{}", API_BASE, device_id))
        .query(&[
            ("interval", "1 hour".to_string()),
            ("start_time", start.to_rfc3339()),
            ("end_time", end.to_rfc3339()),
        ])
        .send()
        .await
        .expect("aggregate request")
        .error_for_status()
        .expect("aggregate status")
        .json()
        .await
        .expect("aggregate body");

    assert_eq!(buckets.len(), 2, "expected one bucket per hour: {:?}", buckets);
    for bucket in &buckets {
        assert_eq!(bucket["device_id"], device_id.as_str());
        assert_eq!(bucket["reading_count"], 1);
        assert_eq!(bucket["avg_temperature"], 25.0);
    }
}
