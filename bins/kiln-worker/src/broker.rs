// Redis-backed Broker: claims, acknowledgments and results over kiln_common::queue
use crate::dispatcher::Broker;
use async_trait::async_trait;
use kiln_common::config::BrokerConfig;
use kiln_common::queue::{self, Delivery, Redelivery};
use redis::aio::ConnectionManager;
use tracing::{debug, info, warn};

pub struct RedisBroker {
    conn: ConnectionManager,
    config: BrokerConfig,
    /// This worker's in-flight list
    in_flight: String,
}

impl RedisBroker {
    pub async fn connect(config: BrokerConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        let worker_id = resolve_worker_id(&config);
        let in_flight = queue::processing_queue(&config, &worker_id);
        info!(worker_id = %worker_id, in_flight = %in_flight, "Worker identity resolved");
        Ok(Self { conn, config, in_flight })
    }
}

/// Configured id, else the host name, else a one-off id. Only a stable id lets
/// a restarted worker pick up what it claimed before dying.
fn resolve_worker_id(config: &BrokerConfig) -> String {
    if let Some(id) = config.worker_id.as_deref().filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    match std::env::var("HOSTNAME") {
        Ok(host) if !host.is_empty() => host,
        _ => {
            warn!("No worker id or HOSTNAME set; stranded claims need `kiln-cli in-flight --recover`");
            queue::new_request_id()
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn next_delivery(&mut self) -> anyhow::Result<Option<Delivery>> {
        Ok(queue::claim_job(&mut self.conn, &self.config, &self.in_flight).await?)
    }

    async fn ack(&mut self, delivery: &Delivery) -> anyhow::Result<()> {
        queue::ack_job(&mut self.conn, &self.in_flight, delivery).await?;
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> anyhow::Result<()> {
        match queue::nack_job(&mut self.conn, &self.config, &self.in_flight, delivery, requeue).await? {
            Redelivery::Requeue(envelope) => {
                debug!(deliveries = envelope.deliveries, "Delivery requeued");
            }
            Redelivery::DeadLetter => {
                warn!(
                    queue = %queue::dead_letter_queue(&self.config),
                    max_deliveries = self.config.max_deliveries,
                    "Delivery dead-lettered"
                );
            }
        }
        Ok(())
    }

    async fn publish(&mut self, request_id: &str, payload: &str) -> anyhow::Result<()> {
        queue::publish_result(&mut self.conn, &self.config, request_id, payload).await?;
        Ok(())
    }

    async fn recover(&mut self) -> anyhow::Result<usize> {
        let recovered = queue::recover_in_flight(&mut self.conn, &self.config, &self.in_flight).await?;
        if recovered > 0 {
            warn!(recovered, in_flight = %self.in_flight, "Recovered unsettled deliveries");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_common::types::JobEnvelope;
    use redis::AsyncCommands;

    async fn broker(jobs_queue: &str) -> RedisBroker {
        let config = BrokerConfig {
            jobs_queue: jobs_queue.to_string(),
            results_prefix: format!("{}:results", jobs_queue),
            poll_timeout_secs: 0.5,
            max_deliveries: 2,
            ..BrokerConfig::default()
        }
        .with_env_overrides();
        RedisBroker::connect(BrokerConfig {
            worker_id: Some("w1".to_string()),
            ..config
        })
        .await
        .expect("Failed to connect to Redis")
    }

    #[test]
    fn test_configured_worker_id_wins() {
        let config = BrokerConfig {
            worker_id: Some("builder-7".to_string()),
            ..BrokerConfig::default()
        };
        assert_eq!(resolve_worker_id(&config), "builder-7");
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_claim_ack_and_publish_round_trip() {
        let name = format!("kiln:test:{}", queue::new_request_id());
        let mut broker = broker(&name).await;
        let envelope = JobEnvelope::new("jobs.r1", r#"{"projectPath":"/p","action":"run"}"#);
        queue::push_job(&mut broker.conn, &broker.config, &envelope).await.unwrap();

        let delivery = broker.next_delivery().await.unwrap().expect("delivery");
        assert_eq!(delivery.envelope.as_ref(), Some(&envelope));
        broker.publish("r1", "payload").await.unwrap();
        broker.ack(&delivery).await.unwrap();

        let in_flight: i64 = broker.conn.llen(&broker.in_flight).await.unwrap();
        assert_eq!(in_flight, 0);
        let results = queue::peek_results(&mut broker.conn, &broker.config, "r1").await.unwrap();
        assert_eq!(results[0].payload, "payload");

        let _: () = broker.conn.del(queue::result_key(&broker.config, "r1")).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_repeated_nack_dead_letters() {
        let name = format!("kiln:test:{}", queue::new_request_id());
        let mut broker = broker(&name).await;
        let envelope = JobEnvelope::new("jobs.r2", "{bad");
        queue::push_job(&mut broker.conn, &broker.config, &envelope).await.unwrap();

        let first = broker.next_delivery().await.unwrap().expect("first delivery");
        broker.nack(&first, true).await.unwrap();
        let second = broker.next_delivery().await.unwrap().expect("requeued delivery");
        assert_eq!(second.envelope.as_ref().map(|e| e.deliveries), Some(1));
        broker.nack(&second, true).await.unwrap();

        assert!(broker.next_delivery().await.unwrap().is_none());
        let dead = queue::dead_letters(&mut broker.conn, &broker.config).await.unwrap();
        assert_eq!(dead.len(), 1);

        let _: () = broker.conn.del(queue::dead_letter_queue(&broker.config)).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_restarted_worker_recovers_unacked_claim() {
        let name = format!("kiln:test:{}", queue::new_request_id());
        let mut crashed = broker(&name).await;
        let envelope = JobEnvelope::new("jobs.r3", r#"{"projectPath":"/p","action":"run"}"#);
        queue::push_job(&mut crashed.conn, &crashed.config, &envelope).await.unwrap();

        // Claimed, then the worker dies before settling it
        crashed.next_delivery().await.unwrap().expect("delivery");
        assert!(crashed.next_delivery().await.unwrap().is_none());
        drop(crashed);

        let mut restarted = broker(&name).await;
        let listed = queue::in_flight_queues(&mut restarted.conn, &restarted.config).await.unwrap();
        assert_eq!(listed, vec![(restarted.in_flight.clone(), 1)]);

        assert_eq!(restarted.recover().await.unwrap(), 1);
        let redelivered = restarted.next_delivery().await.unwrap().expect("redelivery");
        assert_eq!(redelivered.envelope.as_ref().map(|e| e.deliveries), Some(1));
        restarted.ack(&redelivered).await.unwrap();

        assert_eq!(restarted.recover().await.unwrap(), 0);
        let in_flight: i64 = restarted.conn.llen(&restarted.in_flight).await.unwrap();
        assert_eq!(in_flight, 0);
    }
}
