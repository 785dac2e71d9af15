use crate::alerts;
use crate::db;
use crate::errors::{Error, Result};
use crate::metrics::{
    PERSIST_FAILURES_TOTAL, PIPELINE_LATENCY_SECONDS, PIPELINE_TIMEOUTS_TOTAL,
    READINGS_PERSISTED_TOTAL,
};
use crate::model::Alert;
use crate::normalize::NormalizedMessage;
use crate::ws::Broadcaster;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info};

/// One unit of pipeline work plus the signal the dispatcher waits on.
pub struct Job {
    msg: NormalizedMessage,
    done: oneshot::Sender<()>,
}

pub type JobSender = mpsc::Sender<Job>;

/// Hand a normalized message to the worker task and wait for it to finish,
/// bounded by `wait`. The MQTT event loop calls this; on enqueue failure or
/// timeout the message is simply dropped, never blocking the loop forever.
pub async fn dispatch(tx: &JobSender, msg: NormalizedMessage, wait: Duration) -> Result<()> {
    // One deadline covers both the enqueue and the completion wait: a full
    // channel behind a stalled worker must not hold the caller either.
    let deadline = Instant::now() + wait;
    let (done_tx, done_rx) = oneshot::channel();
    let job = Job {
        msg,
        done: done_tx,
    };

    match tokio::time::timeout_at(deadline, tx.send(job)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => return Err(Error::ChannelSend),
        Err(_) => {
            PIPELINE_TIMEOUTS_TOTAL.inc();
            return Err(Error::PipelineTimeout(wait));
        }
    }

    match tokio::time::timeout_at(deadline, done_rx).await {
        Ok(Ok(())) => Ok(()),
        // Worker dropped the job without completing it.
        Ok(Err(_)) => Err(Error::ChannelSend),
        Err(_) => {
            PIPELINE_TIMEOUTS_TOTAL.inc();
            Err(Error::PipelineTimeout(wait))
        }
    }
}

/// The single task that owns Store, Evaluator and Registry calls. Runs
/// until the job channel closes, draining in-flight work on shutdown.
pub async fn run_worker(mut rx: mpsc::Receiver<Job>, pool: PgPool, broadcaster: Arc<Broadcaster>) {
    info!("Pipeline worker started");

    while let Some(job) = rx.recv().await {
        let start = Instant::now();
        process(&pool, &broadcaster, job.msg).await;
        PIPELINE_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
        // The dispatcher may have timed out and gone away; that is fine.
        let _ = job.done.send(());
    }

    info!("Pipeline worker stopped");
}

/// Persist, evaluate, broadcast. Persistence and evaluation failures are
/// logged and independent; the flow always reaches broadcast.
async fn process(pool: &PgPool, broadcaster: &Broadcaster, msg: NormalizedMessage) {
    let device_id = msg.reading.device_id().to_string();

    match db::save_reading(pool, &msg.reading).await {
        Ok(()) => {
            READINGS_PERSISTED_TOTAL.inc();
            debug!(%device_id, "Reading saved");
        }
        Err(e) => {
            PERSIST_FAILURES_TOTAL.inc();
            error!(%device_id, "Failed to save reading: {}", e);
        }
    }

    let alerts = alerts::check_alerts(pool, &msg.reading).await;

    broadcaster
        .broadcast_text(&broadcast_frame(msg.payload, &alerts))
        .await;
}

/// The normalized payload verbatim, with an `alerts` array appended when
/// any fired.
fn broadcast_frame(mut payload: Value, alerts: &[Alert]) -> String {
    if !alerts.is_empty() {
        if let Value::Object(map) = &mut payload {
            map.insert(
                "alerts".to_string(),
                serde_json::to_value(alerts).unwrap_or_default(),
            );
        }
    }
    payload.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Reading, TemperatureReading};
    use chrono::Utc;
    use serde_json::json;

    fn message() -> NormalizedMessage {
        NormalizedMessage {
            reading: Reading::Temperature(TemperatureReading {
                device_id: "d1".to_string(),
                temperature: 21.0,
                time: Utc::now(),
            }),
            payload: json!({"device_id": "d1", "temperature": 21.0}),
        }
    }

    #[test]
    fn test_dispatch_completes_when_worker_signals() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel::<Job>(8);
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    let _ = job.done.send(());
                }
            });

            assert!(dispatch(&tx, message(), Duration::from_secs(1)).await.is_ok());
        });
    }

    #[test]
    fn test_dispatch_into_closed_channel_is_scheduling_error() {
        tokio_test::block_on(async {
            let (tx, rx) = mpsc::channel::<Job>(8);
            drop(rx);

            match dispatch(&tx, message(), Duration::from_secs(1)).await {
                Err(Error::ChannelSend) => {}
                other => panic!("expected ChannelSend, got {:?}", other.map(|_| ())),
            }
        });
    }

    #[test]
    fn test_dispatch_times_out_on_slow_worker() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel::<Job>(8);
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    let _ = job.done.send(());
                }
            });

            match dispatch(&tx, message(), Duration::from_millis(20)).await {
                Err(Error::PipelineTimeout(_)) => {}
                other => panic!("expected PipelineTimeout, got {:?}", other.map(|_| ())),
            }
        });
    }

    #[test]
    fn test_dispatch_bounded_when_channel_full_and_worker_stalled() {
        tokio_test::block_on(async {
            // Capacity 1, no consumer: the first dispatch fills the slot and
            // times out waiting for completion; the second must time out on
            // the enqueue itself instead of blocking until a slot frees up.
            let (tx, _rx) = mpsc::channel::<Job>(1);

            match dispatch(&tx, message(), Duration::from_millis(20)).await {
                Err(Error::PipelineTimeout(_)) => {}
                other => panic!("expected PipelineTimeout, got {:?}", other.map(|_| ())),
            }

            let bounded =
                tokio::time::timeout(Duration::from_secs(2), dispatch(&tx, message(), Duration::from_millis(20)))
                    .await
                    .expect("dispatch must return within its own bound");
            match bounded {
                Err(Error::PipelineTimeout(_)) => {}
                other => panic!("expected PipelineTimeout, got {:?}", other.map(|_| ())),
            }
        });
    }

    #[test]
    fn test_dropped_job_is_scheduling_error() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel::<Job>(8);
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    drop(job.done);
                }
            });

            match dispatch(&tx, message(), Duration::from_secs(1)).await {
                Err(Error::ChannelSend) => {}
                other => panic!("expected ChannelSend, got {:?}", other.map(|_| ())),
            }
        });
    }

    #[test]
    fn test_frame_without_alerts_is_payload_verbatim() {
        let payload = json!({"device_id": "d1", "temperature": 21.0, "extra": 1});
        let frame = broadcast_frame(payload.clone(), &[]);
        assert_eq!(
            serde_json::from_str::<Value>(&frame).unwrap(),
            payload
        );
    }

    #[test]
    fn test_frame_with_alerts_appends_array() {
        let alert = Alert {
            id: None,
            device_id: "d1".to_string(),
            alert_type: "high_temperature".to_string(),
            message: "Temperature too high: 35°C".to_string(),
            threshold: 30.0,
            actual_value: 35.0,
            created_at: Utc::now(),
            acknowledged: false,
        };
        let frame = broadcast_frame(json!({"device_id": "d1"}), &[alert]);
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["alerts"][0]["alert_type"], "high_temperature");
        assert_eq!(value["alerts"][0]["threshold"], 30.0);
    }
}
