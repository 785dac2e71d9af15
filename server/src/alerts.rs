use crate::db;
use crate::errors::Result;
use crate::metrics::ALERTS_FIRED_TOTAL;
use crate::model::{Alert, Reading};
use chrono::Utc;
use sqlx::PgPool;
use tracing::{error, warn};

/// Inclusive-exclusive bounds for one metric. Values strictly above `max`
/// or strictly below `min` fire an alert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

/// The effective per-device threshold table, defaults merged with any
/// stored overrides. Built fresh for every evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub temperature: Bounds,
    pub voltage: Bounds,
    pub current: Bounds,
    pub power: Bounds,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            temperature: Bounds { min: 0.0, max: 50.0 },
            voltage: Bounds { min: 180.0, max: 260.0 },
            current: Bounds { min: 0.0, max: 20.0 },
            power: Bounds { min: 0.0, max: 5000.0 },
        }
    }
}

/// Apply `device_configs` override rows on top of the defaults. Keys look
/// like `high_temperature_threshold` / `low_voltage_threshold`; anything
/// else is ignored.
pub fn apply_overrides(mut thresholds: Thresholds, rows: &[(String, f64)]) -> Thresholds {
    for (key, value) in rows {
        let Some(stripped) = key.strip_suffix("_threshold") else {
            continue;
        };
        let (metric, is_high) = if let Some(metric) = stripped.strip_prefix("high_") {
            (metric, true)
        } else if let Some(metric) = stripped.strip_prefix("low_") {
            (metric, false)
        } else {
            continue;
        };

        let bounds = match metric {
            "temperature" => &mut thresholds.temperature,
            "voltage" => &mut thresholds.voltage,
            "current" => &mut thresholds.current,
            "power" => &mut thresholds.power,
            _ => {
                warn!(key, "ignoring threshold override for unknown metric");
                continue;
            }
        };
        if is_high {
            bounds.max = *value;
        } else {
            bounds.min = *value;
        }
    }
    thresholds
}

/// Fetch the effective thresholds for a device. A lookup failure falls back
/// to the defaults so evaluation can always proceed.
pub async fn device_thresholds(pool: &PgPool, device_id: &str) -> Thresholds {
    match fetch_overrides(pool, device_id).await {
        Ok(rows) => apply_overrides(Thresholds::default(), &rows),
        Err(e) => {
            warn!(
                device_id,
                "Failed to load threshold overrides, using defaults: {}", e
            );
            Thresholds::default()
        }
    }
}

async fn fetch_overrides(pool: &PgPool, device_id: &str) -> Result<Vec<(String, f64)>> {
    let mut conn = db::acquire(pool).await?;
    let rows = sqlx::query_as::<_, (String, f64)>(
        r#"
        SELECT config_key, config_value::float8
        FROM device_configs
        WHERE device_id = $1 AND config_key LIKE '%\_threshold'
        "#,
    )
    .bind(device_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Compare a reading against a threshold table. Both bounds of every metric
/// are checked independently; with min > max configured, a value can fire
/// high and low at once.
pub fn evaluate(reading: &Reading, thresholds: &Thresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();
    match reading {
        Reading::Temperature(r) => {
            check_metric(
                &mut alerts,
                &r.device_id,
                "temperature",
                r.temperature,
                thresholds.temperature,
                "°C",
            );
        }
        Reading::Power(r) => {
            check_metric(
                &mut alerts,
                &r.device_id,
                "voltage",
                r.voltage,
                thresholds.voltage,
                "V",
            );
            check_metric(
                &mut alerts,
                &r.device_id,
                "current",
                r.current,
                thresholds.current,
                "A",
            );
            check_metric(
                &mut alerts,
                &r.device_id,
                "power",
                r.power,
                thresholds.power,
                "W",
            );
        }
    }
    alerts
}

fn check_metric(
    alerts: &mut Vec<Alert>,
    device_id: &str,
    metric: &str,
    value: f64,
    bounds: Bounds,
    unit: &str,
) {
    if value > bounds.max {
        alerts.push(Alert {
            id: None,
            device_id: device_id.to_string(),
            alert_type: format!("high_{}", metric),
            message: format!("{} too high: {}{}", title(metric), value, unit),
            threshold: bounds.max,
            actual_value: value,
            created_at: Utc::now(),
            acknowledged: false,
        });
    }
    if value < bounds.min {
        alerts.push(Alert {
            id: None,
            device_id: device_id.to_string(),
            alert_type: format!("low_{}", metric),
            message: format!("{} too low: {}{}", title(metric), value, unit),
            threshold: bounds.min,
            actual_value: value,
            created_at: Utc::now(),
            acknowledged: false,
        });
    }
}

fn title(metric: &str) -> String {
    let mut chars = metric.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Evaluate one reading against its device's thresholds and persist any
/// alerts that fired. Persistence is fire-and-forget: callers still get
/// (and broadcast) the alerts when the durable write fails.
pub async fn check_alerts(pool: &PgPool, reading: &Reading) -> Vec<Alert> {
    let thresholds = device_thresholds(pool, reading.device_id()).await;
    let alerts = evaluate(reading, &thresholds);
    if alerts.is_empty() {
        return alerts;
    }

    ALERTS_FIRED_TOTAL.inc_by(alerts.len() as f64);
    if let Err(e) = save_alerts(pool, &alerts).await {
        error!(
            device_id = reading.device_id(),
            "Failed to persist alerts: {}", e
        );
    }
    alerts
}

async fn save_alerts(pool: &PgPool, alerts: &[Alert]) -> Result<()> {
    let mut conn = db::acquire(pool).await?;
    for alert in alerts {
        sqlx::query(
            r#"
            INSERT INTO alerts (device_id, alert_type, message, threshold, actual_value, created_at, acknowledged)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&alert.device_id)
        .bind(&alert.alert_type)
        .bind(&alert.message)
        .bind(alert.threshold)
        .bind(alert.actual_value)
        .bind(alert.created_at)
        .bind(alert.acknowledged)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn recent_alerts(
    pool: &PgPool,
    device_id: Option<&str>,
    acknowledged: Option<bool>,
    limit: i64,
) -> Result<Vec<Alert>> {
    let mut conditions = Vec::new();
    if device_id.is_some() {
        conditions.push(format!("device_id = ${}", conditions.len() + 1));
    }
    if acknowledged.is_some() {
        conditions.push(format!("acknowledged = ${}", conditions.len() + 1));
    }
    let bind_count = conditions.len();
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let query = format!(
        "SELECT id, device_id, alert_type, message, threshold, actual_value, created_at, acknowledged \
         FROM alerts {} ORDER BY created_at DESC LIMIT ${}",
        where_clause,
        bind_count + 1
    );

    let mut query_builder = sqlx::query_as::<_, Alert>(&query);
    if let Some(device_id) = device_id {
        query_builder = query_builder.bind(device_id);
    }
    if let Some(acknowledged) = acknowledged {
        query_builder = query_builder.bind(acknowledged);
    }

    let mut conn = db::acquire(pool).await?;
    Ok(query_builder.bind(limit).fetch_all(&mut *conn).await?)
}
