// CLI commands for driving kiln workers over Redis
use anyhow::{bail, Context, Result};
use kiln_common::config::BrokerConfig;
use kiln_common::queue;
use kiln_common::types::{Action, JobEnvelope, JobRequest, ResultEnvelope};
use serde::Deserialize;
use std::fs;
use std::path::Path;

const DEFAULT_WORKER_CONFIG: &str = include_str!("../../../config/worker.json");

/// Only the broker section of the worker config matters to the CLI
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    broker: BrokerConfig,
}

/// Broker settings from the worker config file, defaults when it is absent.
/// `REDIS_URL` wins over both.
pub fn load_broker_config(path: &str) -> Result<BrokerConfig> {
    let config_path = Path::new(path);
    let file = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", path))?;
        serde_json::from_str::<ConfigFile>(&content)
            .with_context(|| format!("Failed to parse {}", path))?
    } else {
        ConfigFile::default()
    };
    Ok(file.broker.with_env_overrides())
}

async fn connect(config: &BrokerConfig) -> Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(config.redis_url.as_str())?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;
    Ok(conn)
}

/// Envelope for a job; the request id must be a single routing-key word
fn build_envelope(config: &BrokerConfig, request_id: &str, project: &str, action: Action) -> Result<JobEnvelope> {
    if request_id.is_empty() || request_id.contains('.') {
        bail!("Request id '{}' must be non-empty and must not contain '.'", request_id);
    }
    let body = serde_json::to_string(&JobRequest::new(project, action))?;
    Ok(JobEnvelope::new(queue::routing_key(config, request_id), body))
}

fn print_result(result: &ResultEnvelope) {
    println!("📦 Result for {} (published {}):", result.request_id, result.published_at);
    println!("{}", result.payload);
}

pub async fn submit(
    config: &BrokerConfig,
    project: &str,
    action: Action,
    request_id: Option<String>,
    wait: Option<f64>,
) -> Result<()> {
    let request_id = request_id.unwrap_or_else(queue::new_request_id);
    // Resolve relative paths locally; the worker may run elsewhere, so a path
    // that does not exist here is sent unchanged
    let project = fs::canonicalize(project)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| project.to_string());

    let envelope = build_envelope(config, &request_id, &project, action)?;
    let mut conn = connect(config).await?;
    queue::push_job(&mut conn, config, &envelope)
        .await
        .context("Failed to publish job")?;

    println!("🚀 Submitted {} job for {}", action, project);
    println!("  Request id:  {}", request_id);
    println!("  Routing key: {}", envelope.routing_key);

    if let Some(seconds) = wait {
        println!("⏳ Waiting up to {}s for the result...", seconds);
        match queue::wait_result(&mut conn, config, &request_id, seconds).await? {
            Some(result) => print_result(&result),
            None => println!("⚠️  No result yet; fetch it later with: kiln-cli result {}", request_id),
        }
    }

    Ok(())
}

pub async fn fetch_result(config: &BrokerConfig, request_id: &str, wait: Option<f64>) -> Result<()> {
    let mut conn = connect(config).await?;

    if let Some(seconds) = wait {
        match queue::wait_result(&mut conn, config, request_id, seconds).await? {
            Some(result) => print_result(&result),
            None => println!("⚠️  No result for {} within {}s", request_id, seconds),
        }
        return Ok(());
    }

    let results = queue::peek_results(&mut conn, config, request_id).await?;
    if results.is_empty() {
        println!("⚠️  No result published for {}", request_id);
    }
    for result in &results {
        print_result(result);
    }
    Ok(())
}

pub async fn dead_letters(config: &BrokerConfig, requeue: bool) -> Result<()> {
    let mut conn = connect(config).await?;

    if requeue {
        let count = queue::requeue_dead_letters(&mut conn, config).await?;
        println!("♻️  Requeued {} dead-lettered job(s)", count);
        return Ok(());
    }

    let dead = queue::dead_letters(&mut conn, config).await?;
    if dead.is_empty() {
        println!("✅ No dead-lettered jobs");
        return Ok(());
    }

    println!("☠️  {} dead-lettered job(s):", dead.len());
    for delivery in &dead {
        match &delivery.envelope {
            Some(envelope) => println!(
                "  {}  deliveries={}  enqueued={}  body={}",
                envelope.routing_key, envelope.deliveries, envelope.enqueued_at, envelope.body
            ),
            None => println!("  <unparseable> {}", delivery.raw),
        }
    }
    Ok(())
}

/// List per-worker in-flight lists, or hand one worker's claims back to the
/// jobs exchange. Only safe for a worker that is no longer running.
pub async fn in_flight(config: &BrokerConfig, recover: Option<String>) -> Result<()> {
    let mut conn = connect(config).await?;

    if let Some(worker_id) = recover {
        let key = queue::processing_queue(config, &worker_id);
        let count = queue::recover_in_flight(&mut conn, config, &key).await?;
        println!("♻️  Recovered {} in-flight job(s) from worker {}", count, worker_id);
        return Ok(());
    }

    let queues = queue::in_flight_queues(&mut conn, config).await?;
    if queues.is_empty() {
        println!("✅ No in-flight jobs");
        return Ok(());
    }

    println!("⏳ In-flight jobs by worker:");
    for (key, len) in &queues {
        let worker = worker_of(config, key).unwrap_or(key.as_str());
        println!("  {}  {} job(s)", worker, len);
    }
    Ok(())
}

/// Worker id from an in-flight list key
fn worker_of<'a>(config: &BrokerConfig, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(&config.jobs_queue)?.strip_prefix(":processing:")
}

pub async fn init_project(path: &str) -> Result<()> {
    println!("🚀 Initializing kiln worker config at: {}", path);

    let config_dir = Path::new(path).join("config");
    fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create directory: {}", config_dir.display()))?;

    let config_path = config_dir.join("worker.json");
    if config_path.exists() {
        println!("  ⏭️  Exists: {}", config_path.display());
    } else {
        fs::write(&config_path, DEFAULT_WORKER_CONFIG)?;
        println!("  ✅ Created: {}", config_path.display());
    }

    println!("\n📋 Next steps:");
    println!("  1. Point toolchain.test_runner at your JUnit console launcher");
    println!("  2. Start a worker: REDIS_URL=redis://... kiln-worker");
    println!("  3. Submit a job: kiln-cli submit --project /path/to/project --action test");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_envelope() {
        let config = BrokerConfig::default();
        let envelope = build_envelope(&config, "req1", "/p", Action::Test).unwrap();

        assert_eq!(envelope.routing_key, "jobs.req1");
        assert_eq!(envelope.deliveries, 0);
        let job = JobRequest::from_body(envelope.body.as_bytes()).unwrap();
        assert_eq!(job, JobRequest::new("/p", Action::Test));
    }

    #[test]
    fn test_build_envelope_rejects_multi_word_request_id() {
        let config = BrokerConfig::default();
        assert!(build_envelope(&config, "a.b", "/p", Action::Run).is_err());
        assert!(build_envelope(&config, "", "/p", Action::Run).is_err());
    }

    #[test]
    fn test_worker_of_in_flight_key() {
        let config = BrokerConfig::default();
        let key = queue::processing_queue(&config, "builder-1");
        assert_eq!(worker_of(&config, &key), Some("builder-1"));
        assert_eq!(worker_of(&config, "kiln:queue:jobs:dead"), None);
    }

    #[test]
    fn test_bundled_config_parses() {
        let file: ConfigFile = serde_json::from_str(DEFAULT_WORKER_CONFIG).unwrap();
        assert_eq!(file.broker, BrokerConfig::default());
    }

    #[test]
    fn test_load_broker_config_missing_file_uses_defaults() {
        let config = load_broker_config("/definitely/not/here.json").unwrap();
        assert_eq!(config.jobs_queue, "kiln:queue:jobs");
    }

    #[tokio::test]
    async fn test_init_writes_config_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();

        init_project(path).await.unwrap();
        let config_path = dir.path().join("config/worker.json");
        assert_eq!(fs::read_to_string(&config_path).unwrap(), DEFAULT_WORKER_CONFIG);

        fs::write(&config_path, "{}").unwrap();
        init_project(path).await.unwrap();
        assert_eq!(fs::read_to_string(&config_path).unwrap(), "{}");
    }
}
