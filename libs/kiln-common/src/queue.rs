//! Redis queue semantics - defines the exchange mapping, not runtime logic
//! Keeps the CLI and the worker on the same keys:
//! - jobs exchange: a FIFO list of `JobEnvelope`s
//! - in-flight lists: envelopes claimed but not yet acked, one per worker
//! - dead-letter list: envelopes that exhausted their deliveries
//! - results exchange: one list per request id

use crate::config::BrokerConfig;
use crate::types::{JobEnvelope, ResultEnvelope};
use chrono::Utc;
use redis::{AsyncCommands, RedisResult};
use uuid::Uuid;

/// Fresh request id; never contains the `.` word separator
pub fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Routing key for a job, `<binding_prefix>.<request_id>`
pub fn routing_key(config: &BrokerConfig, request_id: &str) -> String {
    format!("{}.{}", config.binding_prefix, request_id)
}

/// Extract the request id from a routing key bound as `<binding_prefix>.*`
///
/// The request id is everything after the first `.`; keys that do not match
/// the binding (wrong prefix, missing or multi-word remainder) yield `None`.
pub fn request_id<'a>(routing_key: &'a str, binding_prefix: &str) -> Option<&'a str> {
    let (prefix, rest) = routing_key.split_once('.')?;
    if prefix != binding_prefix || rest.is_empty() || rest.contains('.') {
        return None;
    }
    Some(rest)
}

/// List holding the envelopes `worker_id` claimed but has not settled
pub fn processing_queue(config: &BrokerConfig, worker_id: &str) -> String {
    format!("{}:processing:{}", config.jobs_queue, worker_id)
}

/// SCAN pattern matching every worker's in-flight list
pub fn processing_pattern(config: &BrokerConfig) -> String {
    format!("{}:processing:*", config.jobs_queue)
}

/// List holding dead-lettered envelopes
pub fn dead_letter_queue(config: &BrokerConfig) -> String {
    format!("{}:dead", config.jobs_queue)
}

/// Result list for a request
pub fn result_key(config: &BrokerConfig, request_id: &str) -> String {
    format!("{}:{}", config.results_prefix, request_id)
}

/// One claimed message. `raw` is the exact list element, needed to ack it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub raw: String,
    /// `None` when the element is not a valid envelope
    pub envelope: Option<JobEnvelope>,
}

impl Delivery {
    pub fn from_raw(raw: String) -> Self {
        let envelope = serde_json::from_str(&raw).ok();
        Self { raw, envelope }
    }
}

/// Where a negatively acknowledged message goes next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redelivery {
    Requeue(JobEnvelope),
    DeadLetter,
}

/// Decide the fate of a nacked message
///
/// Unparseable envelopes can never succeed and are dead-lettered directly.
/// `max_deliveries == 0` disables dead-lettering for requeued messages.
pub fn redelivery(delivery: &Delivery, requeue: bool, max_deliveries: u32) -> Redelivery {
    let Some(envelope) = delivery.envelope.as_ref() else {
        return Redelivery::DeadLetter;
    };
    if !requeue {
        return Redelivery::DeadLetter;
    }
    let deliveries = envelope.deliveries.saturating_add(1);
    if max_deliveries > 0 && deliveries >= max_deliveries {
        return Redelivery::DeadLetter;
    }
    Redelivery::Requeue(JobEnvelope {
        deliveries,
        ..envelope.clone()
    })
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

/// Publish an envelope on the jobs exchange
/// Uses RPUSH for FIFO semantics
pub async fn push_job(
    conn: &mut redis::aio::ConnectionManager,
    config: &BrokerConfig,
    envelope: &JobEnvelope,
) -> RedisResult<()> {
    let payload = serde_json::to_string(envelope).map_err(serialization_error)?;
    conn.rpush(&config.jobs_queue, payload).await
}

/// Claim the next envelope, moving it atomically onto the `in_flight` list
/// Uses BLMOVE with the configured poll timeout so callers can observe shutdown
pub async fn claim_job(
    conn: &mut redis::aio::ConnectionManager,
    config: &BrokerConfig,
    in_flight: &str,
) -> RedisResult<Option<Delivery>> {
    let raw: Option<String> = redis::cmd("BLMOVE")
        .arg(&config.jobs_queue)
        .arg(in_flight)
        .arg("LEFT")
        .arg("RIGHT")
        .arg(config.poll_timeout_secs)
        .query_async(conn)
        .await?;
    Ok(raw.map(Delivery::from_raw))
}

/// Positive acknowledgment: drop the envelope from the in-flight list
pub async fn ack_job(
    conn: &mut redis::aio::ConnectionManager,
    in_flight: &str,
    delivery: &Delivery,
) -> RedisResult<()> {
    let _: i64 = conn.lrem(in_flight, 1, &delivery.raw).await?;
    Ok(())
}

/// Negative acknowledgment: requeue at the tail or dead-letter, atomically
pub async fn nack_job(
    conn: &mut redis::aio::ConnectionManager,
    config: &BrokerConfig,
    in_flight: &str,
    delivery: &Delivery,
    requeue: bool,
) -> RedisResult<Redelivery> {
    let decision = redelivery(delivery, requeue, config.max_deliveries);
    let mut pipe = redis::pipe();
    pipe.atomic()
        .lrem(in_flight, 1, &delivery.raw)
        .ignore();
    match &decision {
        Redelivery::Requeue(envelope) => {
            let payload = serde_json::to_string(envelope).map_err(serialization_error)?;
            pipe.rpush(&config.jobs_queue, payload).ignore();
        }
        Redelivery::DeadLetter => {
            pipe.rpush(dead_letter_queue(config), &delivery.raw).ignore();
        }
    }
    pipe.query_async::<_, ()>(conn).await?;
    Ok(decision)
}

/// Hand everything left on an `in_flight` list back to the jobs exchange
///
/// Each envelope counts as one failed delivery, so a job that keeps killing
/// its worker ends up dead-lettered. Returns how many envelopes were moved.
pub async fn recover_in_flight(
    conn: &mut redis::aio::ConnectionManager,
    config: &BrokerConfig,
    in_flight: &str,
) -> RedisResult<usize> {
    let stranded: Vec<String> = conn.lrange(in_flight, 0, -1).await?;
    let count = stranded.len();
    for raw in stranded {
        nack_job(conn, config, in_flight, &Delivery::from_raw(raw), true).await?;
    }
    Ok(count)
}

/// Every non-empty in-flight list with its length
pub async fn in_flight_queues(
    conn: &mut redis::aio::ConnectionManager,
    config: &BrokerConfig,
) -> RedisResult<Vec<(String, usize)>> {
    let mut keys = Vec::new();
    {
        let mut iter = conn.scan_match::<_, String>(processing_pattern(config)).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
    }
    keys.sort();
    keys.dedup();

    let mut queues = Vec::with_capacity(keys.len());
    for key in keys {
        let len: usize = conn.llen(&key).await?;
        if len > 0 {
            queues.push((key, len));
        }
    }
    Ok(queues)
}

/// Publish a result on the results exchange, keyed by request id
pub async fn publish_result(
    conn: &mut redis::aio::ConnectionManager,
    config: &BrokerConfig,
    request_id: &str,
    payload: &str,
) -> RedisResult<()> {
    let envelope = ResultEnvelope {
        request_id: request_id.to_string(),
        payload: payload.to_string(),
        published_at: Utc::now(),
    };
    let body = serde_json::to_string(&envelope).map_err(serialization_error)?;
    let key = result_key(config, request_id);

    redis::pipe()
        .atomic()
        .rpush(&key, body)
        .ignore()
        .cmd("EXPIRE")
        .arg(&key)
        .arg(config.result_ttl_secs)
        .ignore()
        .query_async::<_, ()>(conn)
        .await
}

/// Block until a result for `request_id` arrives, consuming it
pub async fn wait_result(
    conn: &mut redis::aio::ConnectionManager,
    config: &BrokerConfig,
    request_id: &str,
    timeout_seconds: f64,
) -> RedisResult<Option<ResultEnvelope>> {
    let key = result_key(config, request_id);
    let result: Option<(String, String)> = conn.blpop(&key, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let envelope = serde_json::from_str(&payload).map_err(serialization_error)?;
            Ok(Some(envelope))
        }
        None => Ok(None),
    }
}

/// Read published results without consuming them
pub async fn peek_results(
    conn: &mut redis::aio::ConnectionManager,
    config: &BrokerConfig,
    request_id: &str,
) -> RedisResult<Vec<ResultEnvelope>> {
    let raw: Vec<String> = conn.lrange(result_key(config, request_id), 0, -1).await?;
    raw.iter()
        .map(|payload| serde_json::from_str(payload).map_err(serialization_error))
        .collect()
}

/// List dead-lettered messages as stored
pub async fn dead_letters(
    conn: &mut redis::aio::ConnectionManager,
    config: &BrokerConfig,
) -> RedisResult<Vec<Delivery>> {
    let raw: Vec<String> = conn.lrange(dead_letter_queue(config), 0, -1).await?;
    Ok(raw.into_iter().map(Delivery::from_raw).collect())
}

/// Move every parseable dead letter back onto the jobs exchange with a fresh
/// delivery counter. Returns how many were requeued.
pub async fn requeue_dead_letters(
    conn: &mut redis::aio::ConnectionManager,
    config: &BrokerConfig,
) -> RedisResult<usize> {
    let dead = dead_letter_queue(config);
    let mut requeued = 0;
    let mut unparseable = Vec::new();

    loop {
        let raw: Option<String> = conn.lpop(&dead, None).await?;
        let Some(raw) = raw else { break };
        let delivery = Delivery::from_raw(raw);
        match delivery.envelope {
            Some(envelope) => {
                push_job(conn, config, &JobEnvelope { deliveries: 0, ..envelope }).await?;
                requeued += 1;
            }
            None => unparseable.push(delivery.raw),
        }
    }

    // Garbage stays dead-lettered
    for raw in unparseable {
        let _: () = conn.rpush(&dead, raw).await?;
    }
    Ok(requeued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobEnvelope;

    fn config() -> BrokerConfig {
        BrokerConfig::default()
    }

    fn delivery(deliveries: u32) -> Delivery {
        let envelope = JobEnvelope {
            deliveries,
            ..JobEnvelope::new("jobs.abc", r#"{"projectPath":"/p","action":"run"}"#)
        };
        Delivery::from_raw(serde_json::to_string(&envelope).unwrap())
    }

    #[test]
    fn test_request_id_is_remainder_after_first_dot() {
        assert_eq!(request_id("jobs.abc-123", "jobs"), Some("abc-123"));
        assert_eq!(request_id("jobs.", "jobs"), None);
        assert_eq!(request_id("jobs", "jobs"), None);
        assert_eq!(request_id("other.abc", "jobs"), None);
        assert_eq!(request_id("jobs.a.b", "jobs"), None);
    }

    #[test]
    fn test_routing_key_round_trips_through_request_id() {
        let cfg = config();
        let key = routing_key(&cfg, "42");
        assert_eq!(key, "jobs.42");
        assert_eq!(request_id(&key, &cfg.binding_prefix), Some("42"));

        let fresh = new_request_id();
        let key = routing_key(&cfg, &fresh);
        assert_eq!(request_id(&key, &cfg.binding_prefix), Some(fresh.as_str()));
    }

    #[test]
    fn test_key_naming() {
        let cfg = config();
        assert_eq!(processing_queue(&cfg, "w1"), "kiln:queue:jobs:processing:w1");
        assert_eq!(processing_pattern(&cfg), "kiln:queue:jobs:processing:*");
        assert_eq!(dead_letter_queue(&cfg), "kiln:queue:jobs:dead");
        assert_eq!(result_key(&cfg, "abc"), "kiln:results:abc");
    }

    #[test]
    fn test_delivery_keeps_raw_when_envelope_is_garbage() {
        let d = Delivery::from_raw("not json".to_string());
        assert_eq!(d.raw, "not json");
        assert!(d.envelope.is_none());
    }

    #[test]
    fn test_redelivery_requeues_with_incremented_counter() {
        match redelivery(&delivery(1), true, 5) {
            Redelivery::Requeue(envelope) => assert_eq!(envelope.deliveries, 2),
            other => panic!("expected requeue, got {:?}", other),
        }
    }

    #[test]
    fn test_redelivery_dead_letters_at_limit() {
        assert_eq!(redelivery(&delivery(4), true, 5), Redelivery::DeadLetter);
        assert_eq!(redelivery(&delivery(0), false, 5), Redelivery::DeadLetter);
    }

    #[test]
    fn test_redelivery_unlimited_when_max_is_zero() {
        assert!(matches!(redelivery(&delivery(1000), true, 0), Redelivery::Requeue(_)));
    }

    #[test]
    fn test_redelivery_dead_letters_garbage() {
        let d = Delivery::from_raw("{".to_string());
        assert_eq!(redelivery(&d, true, 0), Redelivery::DeadLetter);
    }
}
