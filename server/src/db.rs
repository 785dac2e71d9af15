use crate::errors::{Error, Result};
use crate::model::{
    PowerAggregate, PowerReading, PowerStats, Reading, TemperatureAggregate, TemperatureReading,
    TemperatureStats,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, Postgres};
use std::time::Duration;
use tracing::{error, info, warn};

const ACQUIRE_ATTEMPTS: u32 = 3;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .min_connections(3)
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Check out a connection, retrying up to three times before giving up.
pub async fn acquire(pool: &PgPool) -> Result<PoolConnection<Postgres>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match pool.acquire().await {
            Ok(conn) => return Ok(conn),
            Err(e) if attempt < ACQUIRE_ATTEMPTS => {
                warn!(
                    "Failed to acquire database connection (attempt {}/{}): {}. Retrying...",
                    attempt, ACQUIRE_ATTEMPTS, e
                );
            }
            Err(e) => {
                error!(
                    "Failed to acquire database connection after {} attempts: {}",
                    ACQUIRE_ATTEMPTS, e
                );
                return Err(e.into());
            }
        }
    }
}

/// Persist one reading, keyed (device_id, time). Redelivery of the same
/// sample is a no-op. The devices.last_active touch afterwards is best
/// effort and never fails the write.
pub async fn save_reading(pool: &PgPool, reading: &Reading) -> Result<()> {
    let mut conn = acquire(pool).await?;

    match reading {
        Reading::Temperature(r) => {
            sqlx::query(
                r#"
                INSERT INTO temperature_sensor_readings (time, device_id, temperature)
                VALUES ($1, $2, $3)
                ON CONFLICT (device_id, time) DO NOTHING
                "#,
            )
            .bind(r.time)
            .bind(&r.device_id)
            .bind(r.temperature)
            .execute(&mut *conn)
            .await?;
        }
        Reading::Power(r) => {
            sqlx::query(
                r#"
                INSERT INTO pzem004t_sensor_readings (time, device_id, voltage, current, power, energy)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (device_id, time) DO NOTHING
                "#,
            )
            .bind(r.time)
            .bind(&r.device_id)
            .bind(r.voltage)
            .bind(r.current)
            .bind(r.power)
            .bind(r.energy)
            .execute(&mut *conn)
            .await?;
        }
    }

    touch_device(&mut conn, reading.device_id(), reading.time()).await;
    Ok(())
}

async fn touch_device(conn: &mut PgConnection, device_id: &str, time: DateTime<Utc>) {
    let result = sqlx::query("UPDATE devices SET last_active = $1 WHERE device_id = $2")
        .bind(time)
        .bind(device_id)
        .execute(conn)
        .await;
    if let Err(e) = result {
        warn!(device_id, "Failed to update device last_active: {}", e);
    }
}

pub async fn temperature_readings(
    pool: &PgPool,
    device_id: Option<&str>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: i64,
) -> Result<Vec<TemperatureReading>> {
    let (where_clause, bind_count) = reading_filters(device_id, start, end);
    let query = format!(
        "SELECT time, device_id, temperature FROM temperature_sensor_readings \
         {} ORDER BY time DESC LIMIT ${}",
        where_clause,
        bind_count + 1
    );

    let mut query_builder = sqlx::query_as::<_, TemperatureReading>(&query);
    if let Some(device_id) = device_id {
        query_builder = query_builder.bind(device_id);
    }
    if let Some(start) = start {
        query_builder = query_builder.bind(start);
    }
    if let Some(end) = end {
        query_builder = query_builder.bind(end);
    }

    let mut conn = acquire(pool).await?;
    Ok(query_builder.bind(limit).fetch_all(&mut *conn).await?)
}

pub async fn power_readings(
    pool: &PgPool,
    device_id: Option<&str>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: i64,
) -> Result<Vec<PowerReading>> {
    let (where_clause, bind_count) = reading_filters(device_id, start, end);
    let query = format!(
        "SELECT time, device_id, voltage, current, power, energy FROM pzem004t_sensor_readings \
         {} ORDER BY time DESC LIMIT ${}",
        where_clause,
        bind_count + 1
    );

    let mut query_builder = sqlx::query_as::<_, PowerReading>(&query);
    if let Some(device_id) = device_id {
        query_builder = query_builder.bind(device_id);
    }
    if let Some(start) = start {
        query_builder = query_builder.bind(start);
    }
    if let Some(end) = end {
        query_builder = query_builder.bind(end);
    }

    let mut conn = acquire(pool).await?;
    Ok(query_builder.bind(limit).fetch_all(&mut *conn).await?)
}

fn reading_filters(
    device_id: Option<&str>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> (String, usize) {
    let mut conditions = Vec::new();
    if device_id.is_some() {
        conditions.push(format!("device_id = ${}", conditions.len() + 1));
    }
    if start.is_some() {
        conditions.push(format!("time >= ${}", conditions.len() + 1));
    }
    if end.is_some() {
        conditions.push(format!("time <= ${}", conditions.len() + 1));
    }

    let count = conditions.len();
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    (where_clause, count)
}

pub async fn temperature_stats(
    pool: &PgPool,
    device_id: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<TemperatureStats> {
    let start = start.unwrap_or_else(|| Utc::now() - ChronoDuration::days(1));
    let end = end.unwrap_or_else(Utc::now);

    let mut conn = acquire(pool).await?;
    let stats = sqlx::query_as::<_, TemperatureStats>(
        r#"
        SELECT
            device_id,
            AVG(temperature) AS avg_temperature,
            MIN(temperature) AS min_temperature,
            MAX(temperature) AS max_temperature,
            COUNT(*) AS reading_count,
            MAX(time) AS last_reading_time
        FROM temperature_sensor_readings
        WHERE device_id = $1 AND time BETWEEN $2 AND $3
        GROUP BY device_id
        "#,
    )
    .bind(device_id)
    .bind(start)
    .bind(end)
    .fetch_optional(&mut *conn)
    .await?;

    // No rows in the window is a valid answer, not an error.
    Ok(stats.unwrap_or_else(|| TemperatureStats {
        device_id: device_id.to_string(),
        avg_temperature: 0.0,
        min_temperature: 0.0,
        max_temperature: 0.0,
        reading_count: 0,
        last_reading_time: start,
    }))
}

pub async fn power_stats(
    pool: &PgPool,
    device_id: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<PowerStats> {
    let start = start.unwrap_or_else(|| Utc::now() - ChronoDuration::days(1));
    let end = end.unwrap_or_else(Utc::now);

    let mut conn = acquire(pool).await?;
    let stats = sqlx::query_as::<_, PowerStats>(
        r#"
        SELECT
            device_id,
            AVG(voltage) AS avg_voltage,
            AVG(current) AS avg_current,
            AVG(power) AS avg_power,
            SUM(energy) AS total_energy,
            COUNT(*) AS reading_count,
            MAX(time) AS last_reading_time
        FROM pzem004t_sensor_readings
        WHERE device_id = $1 AND time BETWEEN $2 AND $3
        GROUP BY device_id
        "#,
    )
    .bind(device_id)
    .bind(start)
    .bind(end)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(stats.unwrap_or_else(|| PowerStats {
        device_id: device_id.to_string(),
        avg_voltage: 0.0,
        avg_current: 0.0,
        avg_power: 0.0,
        total_energy: 0.0,
        reading_count: 0,
        last_reading_time: start,
    }))
}

const INTERVAL_UNITS: &[&str] = &[
    "second", "seconds", "minute", "minutes", "hour", "hours", "day", "days", "week", "weeks",
];

/// Validate an aggregation interval like "1 hour" or "15 minutes". The
/// interval ends up inlined into the bucket query, so only a count plus a
/// unit from the allow-list is accepted.
pub fn validate_interval(interval: &str) -> Result<String> {
    let mut parts = interval.split_whitespace();
    let (Some(count), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::InvalidInterval(interval.to_string()));
    };
    let Ok(count) = count.parse::<u32>() else {
        return Err(Error::InvalidInterval(interval.to_string()));
    };
    let unit = unit.to_lowercase();
    if count == 0 || !INTERVAL_UNITS.contains(&unit.as_str()) {
        return Err(Error::InvalidInterval(interval.to_string()));
    }
    Ok(format!("{} {}", count, unit))
}

pub async fn temperature_aggregate(
    pool: &PgPool,
    device_id: &str,
    interval: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<Vec<TemperatureAggregate>> {
    let interval = validate_interval(interval)?;
    let start = start.unwrap_or_else(|| Utc::now() - ChronoDuration::days(7));
    let end = end.unwrap_or_else(Utc::now);

    let query = format!(
        r#"
        SELECT
            time_bucket('{}'::interval, time) AS bucket,
            device_id,
            AVG(temperature) AS avg_temperature,
            COUNT(*) AS reading_count
        FROM temperature_sensor_readings
        WHERE device_id = $1 AND time BETWEEN $2 AND $3
        GROUP BY bucket, device_id
        ORDER BY bucket ASC
        "#,
        interval
    );

    let mut conn = acquire(pool).await?;
    Ok(sqlx::query_as::<_, TemperatureAggregate>(&query)
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&mut *conn)
        .await?)
}

pub async fn power_aggregate(
    pool: &PgPool,
    device_id: &str,
    interval: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<Vec<PowerAggregate>> {
    let interval = validate_interval(interval)?;
    let start = start.unwrap_or_else(|| Utc::now() - ChronoDuration::days(7));
    let end = end.unwrap_or_else(Utc::now);

    let query = format!(
        r#"
        SELECT
            time_bucket('{}'::interval, time) AS bucket,
            device_id,
            AVG(voltage) AS avg_voltage,
            AVG(current) AS avg_current,
            AVG(power) AS avg_power,
            SUM(energy) AS total_energy,
            COUNT(*) AS reading_count
        FROM pzem004t_sensor_readings
        WHERE device_id = $1 AND time BETWEEN $2 AND $3
        GROUP BY bucket, device_id
        ORDER BY bucket ASC
        "#,
        interval
    );

    let mut conn = acquire(pool).await?;
    Ok(sqlx::query_as::<_, PowerAggregate>(&query)
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&mut *conn)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_accepts_allowed_units() {
        assert_eq!(validate_interval("1 hour").unwrap(), "1 hour");
        assert_eq!(validate_interval("15 minutes").unwrap(), "15 minutes");
        assert_eq!(validate_interval("2 DAYS").unwrap(), "2 days");
    }

    #[test]
    fn test_interval_rejects_injection() {
        assert!(validate_interval("1 hour; DROP TABLE alerts").is_err());
        assert!(validate_interval("1 hour'::interval, time) --").is_err());
    }

    #[test]
    fn test_interval_rejects_malformed() {
        assert!(validate_interval("").is_err());
        assert!(validate_interval("hour").is_err());
        assert!(validate_interval("0 hours").is_err());
        assert!(validate_interval("-1 hours").is_err());
        assert!(validate_interval("1 fortnight").is_err());
    }

    #[test]
    fn test_reading_filters_numbering() {
        let (clause, count) = reading_filters(Some("d1"), None, Some(Utc::now()));
        assert_eq!(clause, "WHERE device_id = $1 AND time <= $2");
        assert_eq!(count, 2);

        let (clause, count) = reading_filters(None, None, None);
        assert_eq!(clause, "");
        assert_eq!(count, 0);
    }
}
