use serde::{Deserialize, Serialize};

/// Broker settings shared by the worker and the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub redis_url: String,
    /// List backing the jobs exchange
    pub jobs_queue: String,
    /// First routing-key segment accepted by the worker (`jobs.*`)
    pub binding_prefix: String,
    /// Key prefix of the results exchange
    pub results_prefix: String,
    pub result_ttl_secs: u64,
    pub poll_timeout_secs: f64,
    /// Dead-letter a message after this many deliveries, 0 = never
    pub max_deliveries: u32,
    /// Names this worker's in-flight list; must be stable across restarts
    /// for a crashed worker's claims to be recovered on its next start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            jobs_queue: "kiln:queue:jobs".to_string(),
            binding_prefix: "jobs".to_string(),
            results_prefix: "kiln:results".to_string(),
            result_ttl_secs: 86400,
            poll_timeout_secs: 5.0,
            max_deliveries: 5,
            worker_id: None,
        }
    }
}

impl BrokerConfig {
    /// Apply `REDIS_URL` and `KILN_WORKER_ID` from the environment if present
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.redis_url = url;
        }
        if let Ok(id) = std::env::var("KILN_WORKER_ID") {
            if !id.is_empty() {
                self.worker_id = Some(id);
            }
        }
        self
    }
}
