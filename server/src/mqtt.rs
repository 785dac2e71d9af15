use crate::config::Config;
use crate::errors::{Error, Result};
use crate::metrics::{MESSAGES_DROPPED_TOTAL, MESSAGES_TOTAL};
use crate::normalize::{normalize, TopicTable};
use crate::pipeline::{dispatch, JobSender};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tracing::{debug, error, info};

/// Subscribe to the two telemetry topics and feed every publish through
/// normalize → dispatch. Per-message failures are logged and never
/// terminate the loop; rumqttc reconnects on its own.
pub async fn run_mqtt(config: Config, jobs: JobSender) -> Result<()> {
    info!(
        "Connecting to MQTT broker at {}:{}",
        config.mqtt_broker, config.mqtt_port
    );

    let client_id = format!("plts-server-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(client_id, &config.mqtt_broker, config.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);
    if !config.mqtt_user.is_empty() {
        mqtt_options.set_credentials(&config.mqtt_user, &config.mqtt_password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    client
        .subscribe(&config.topic_temperature, QoS::AtLeastOnce)
        .await
        .map_err(Error::Mqtt)?;
    client
        .subscribe(&config.topic_pzem, QoS::AtLeastOnce)
        .await
        .map_err(Error::Mqtt)?;

    info!(
        "Subscribed to {} and {} with QoS 1",
        config.topic_temperature, config.topic_pzem
    );

    let table = TopicTable::new(
        config.topic_temperature.clone(),
        config.topic_pzem.clone(),
    );
    let wait = Duration::from_secs(config.pipeline_wait_secs);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MESSAGES_TOTAL.inc();
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                let Some(msg) = normalize(&table, &publish.topic, &publish.payload) else {
                    MESSAGES_DROPPED_TOTAL.inc();
                    continue;
                };

                if let Err(e) = dispatch(&jobs, msg, wait).await {
                    MESSAGES_DROPPED_TOTAL.inc();
                    error!("Dropping message from {}: {}", publish.topic, e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc automatically reconnects, so we just log and continue
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
