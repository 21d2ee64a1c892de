mod broker;
mod classpath;
mod compiler;
mod config;
mod dispatcher;
mod error;
mod execution;
mod executor;
mod layout;
mod packager;
mod report;
mod runner;
mod shutdown;
mod tester;


use broker::RedisBroker;
use config::WorkerConfig;
use dispatcher::{Broker, Disposition, QueueDispatcher};
use executor::JobExecutor;
use runner::ProcessRunner;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

pub const LOG_FORMAT_ENV: &str = "KILN_LOG_FORMAT";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Kiln worker booting...");

    let config = WorkerConfig::load_default().map_err(|e| {
        error!("Failed to load worker configuration: {:#}", e);
        e
    })?;

    info!(
        compiler = %config.toolchain.compiler,
        runtime = %config.toolchain.runtime,
        test_runner = %config.toolchain.test_runner.join(" "),
        timeout_secs = config.toolchain.timeout_secs,
        "Toolchain configured"
    );
    info!(
        queue = %config.broker.jobs_queue,
        binding = %format!("{}.*", config.broker.binding_prefix),
        max_deliveries = config.broker.max_deliveries,
        "Queue configured"
    );

    let mut broker = RedisBroker::connect(config.broker.clone()).await?;
    info!("Connected to Redis: {}", config.broker.redis_url);

    let executor = JobExecutor::new(Arc::new(ProcessRunner), &config);
    let dispatcher = QueueDispatcher::new(Arc::new(executor), config.broker.binding_prefix.clone());

    let shutdown = shutdown::install_shutdown_handler()?;
    worker_loop(&mut broker, &dispatcher, &shutdown).await;

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Claim deliveries one at a time until shutdown is requested.
/// Each delivery gets its terminal decision before shutdown is checked again.
/// The worker's own in-flight list is emptied before every claim, so claims
/// left behind by a crash or a failed ack/nack go back to the queue.
#[instrument(skip_all)]
async fn worker_loop<B: Broker>(broker: &mut B, dispatcher: &QueueDispatcher, shutdown: &CancellationToken) {
    let mut processed: u64 = 0;

    // The claim itself is never cancelled: a dropped BLMOVE reply would strand
    // the message on the in-flight list. The poll timeout bounds shutdown latency.
    while !shutdown.is_cancelled() {
        if let Err(e) = broker.recover().await {
            error!(error = %e, "Failed to recover in-flight deliveries");
            tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            continue;
        }

        match broker.next_delivery().await {
            Ok(Some(delivery)) => {
                let start = std::time::Instant::now();
                let disposition = dispatcher.handle(broker, delivery).await;
                processed += 1;
                info!(
                    disposition = ?disposition,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    processed,
                    "Delivery settled"
                );
                if disposition == Disposition::Requeued {
                    // Avoid hot-looping on a message that keeps failing
                    tokio::time::sleep(tokio::time::Duration::from_millis(250)).await;
                }
            }
            Ok(None) => {
                // Poll window elapsed - check for shutdown
                continue;
            }
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }

    info!(processed, "Worker loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::JobHandler;
    use crate::error::JobError;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use kiln_common::queue::Delivery;
    use kiln_common::types::{JobRequest, JobResult};

    /// Records the order of broker calls and stops the loop after one claim
    struct LoopBroker {
        calls: Vec<&'static str>,
        fail_recover_once: bool,
        shutdown: CancellationToken,
    }

    #[async_trait]
    impl Broker for LoopBroker {
        async fn next_delivery(&mut self) -> anyhow::Result<Option<Delivery>> {
            self.calls.push("claim");
            self.shutdown.cancel();
            Ok(None)
        }

        async fn ack(&mut self, _delivery: &Delivery) -> anyhow::Result<()> {
            Ok(())
        }

        async fn nack(&mut self, _delivery: &Delivery, _requeue: bool) -> anyhow::Result<()> {
            Ok(())
        }

        async fn publish(&mut self, _request_id: &str, _payload: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn recover(&mut self) -> anyhow::Result<usize> {
            self.calls.push("recover");
            if std::mem::take(&mut self.fail_recover_once) {
                return Err(anyhow!("connection reset"));
            }
            Ok(1)
        }
    }

    struct Idle;

    #[async_trait]
    impl JobHandler for Idle {
        async fn execute(&self, _job: &JobRequest) -> Result<JobResult, JobError> {
            Err(JobError::MissingTestRunner)
        }
    }

    fn loop_broker(fail_recover_once: bool) -> LoopBroker {
        LoopBroker {
            calls: Vec::new(),
            fail_recover_once,
            shutdown: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_recovery_runs_before_every_claim() {
        let mut broker = loop_broker(false);
        let shutdown = broker.shutdown.clone();
        let dispatcher = QueueDispatcher::new(Arc::new(Idle), "jobs");

        worker_loop(&mut broker, &dispatcher, &shutdown).await;

        assert_eq!(broker.calls, vec!["recover", "claim"]);
    }

    #[tokio::test]
    async fn test_failed_recovery_skips_the_claim() {
        let mut broker = loop_broker(true);
        let shutdown = broker.shutdown.clone();
        let dispatcher = QueueDispatcher::new(Arc::new(Idle), "jobs");

        worker_loop(&mut broker, &dispatcher, &shutdown).await;

        assert_eq!(broker.calls, vec!["recover", "recover", "claim"]);
    }
}
