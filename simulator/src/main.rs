mod readings;

use rand::Rng;
use readings::{PzemPayload, TemperaturePayload};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::env;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let mqtt_broker = env::var("MQTT_BROKER").unwrap_or_else(|_| "localhost".to_string());
    let mqtt_port: u16 = env::var("MQTT_PORT")
        .unwrap_or_else(|_| "1883".to_string())
        .parse()
        .unwrap_or(1883);
    let topic_temperature =
        env::var("MQTT_TOPIC_TEMPERATURE").unwrap_or_else(|_| "plts/temperature".to_string());
    let topic_pzem = env::var("MQTT_TOPIC_PZEM").unwrap_or_else(|_| "plts/pzem".to_string());
    let interval_ms: u64 = env::var("INTERVAL_MS")
        .unwrap_or_else(|_| "2000".to_string())
        .parse()
        .unwrap_or(2000);
    let temp_devices: usize = env::var("TEMP_DEVICES")
        .unwrap_or_else(|_| "2".to_string())
        .parse()
        .unwrap_or(2);
    let pzem_devices: usize = env::var("PZEM_DEVICES")
        .unwrap_or_else(|_| "1".to_string())
        .parse()
        .unwrap_or(1);

    tracing_subscriber::fmt::init();

    info!("Starting PLTS sensor simulator");
    info!(
        "Broker: {}:{}, interval: {}ms, devices: {} temperature / {} pzem",
        mqtt_broker, mqtt_port, interval_ms, temp_devices, pzem_devices
    );

    let client_id = format!("plts-sim-{}", rand::thread_rng().gen::<u32>());

    let mut mqtt_options = MqttOptions::new(&client_id, &mqtt_broker, mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("Connected to MQTT broker, publishing readings");

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    let mut rng = rand::thread_rng();

    loop {
        ticker.tick().await;

        for n in 0..temp_devices {
            let device_id = format!("sensor-temp-{:03}", n + 1);
            // Occasionally publish the bare-number form some firmware uses.
            let payload = if rng.gen_bool(0.1) {
                format!("{:.1}", random_temperature(&mut rng))
            } else {
                let reading = TemperaturePayload::random(&mut rng, device_id);
                match serde_json::to_string(&reading) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("Failed to serialize reading: {}", e);
                        continue;
                    }
                }
            };
            if let Err(e) = client
                .publish(&topic_temperature, QoS::AtLeastOnce, false, payload)
                .await
            {
                warn!("Failed to publish: {}", e);
            }
        }

        for n in 0..pzem_devices {
            let device_id = format!("sensor-pzem004t-{:03}", n + 1);
            let reading = PzemPayload::random(&mut rng, device_id);
            let payload = match serde_json::to_string(&reading) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize reading: {}", e);
                    continue;
                }
            };
            if let Err(e) = client
                .publish(&topic_pzem, QoS::AtLeastOnce, false, payload)
                .await
            {
                warn!("Failed to publish: {}", e);
            }
        }
    }
}

fn random_temperature(rng: &mut impl Rng) -> f64 {
    if rng.gen_bool(0.05) {
        rng.gen_range(-10.0..70.0) // 5% outliers outside the default thresholds
    } else {
        rng.gen_range(20.0..35.0)
    }
}
