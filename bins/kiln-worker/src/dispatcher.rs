/// Queue Dispatcher - Acknowledgment Discipline
///
/// **Core Responsibility:**
/// Turn one claimed delivery into exactly one terminal decision:
/// - success → publish the result keyed by request id, then ack
/// - anything else → nack with requeue, nothing published
///
/// "Anything else" covers a garbage envelope, a routing key outside the
/// binding, an unparseable body, an orchestration error and a failed publish.
/// Poison messages are bounded by the broker's delivery limit, not here.
///
/// A failing ack is logged only. The delivery stays on the worker's in-flight
/// list and is redelivered by the next recovery, so results are at-least-once.

use crate::error::JobError;
use crate::executor::JobExecutor;
use async_trait::async_trait;
use kiln_common::queue::{self, Delivery};
use kiln_common::types::{JobRequest, JobResult};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, field, info, instrument, warn, Span};

/// Message source and result sink
#[async_trait]
pub trait Broker: Send {
    /// Next delivery, or `None` when the poll window elapsed empty
    async fn next_delivery(&mut self) -> anyhow::Result<Option<Delivery>>;
    async fn ack(&mut self, delivery: &Delivery) -> anyhow::Result<()>;
    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> anyhow::Result<()>;
    async fn publish(&mut self, request_id: &str, payload: &str) -> anyhow::Result<()>;
    /// Return this worker's unsettled deliveries to the queue; how many moved
    async fn recover(&mut self) -> anyhow::Result<usize>;
}

/// Executes a parsed job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &JobRequest) -> Result<JobResult, JobError>;
}

#[async_trait]
impl JobHandler for JobExecutor {
    async fn execute(&self, job: &JobRequest) -> Result<JobResult, JobError> {
        JobExecutor::execute(self, job).await
    }
}

#[derive(Debug, Error)]
enum DispatchError {
    #[error("delivery is not a valid envelope")]
    MalformedEnvelope,
    #[error("routing key `{0}` does not match the binding")]
    RoutingKey(String),
    #[error("invalid job body: {0}")]
    Body(#[source] serde_json::Error),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("failed to encode result: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to publish result: {0:#}")]
    Publish(anyhow::Error),
}

/// Terminal decision taken for a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Requeued,
}

#[derive(Clone)]
pub struct QueueDispatcher {
    handler: Arc<dyn JobHandler>,
    binding_prefix: String,
}

impl QueueDispatcher {
    pub fn new(handler: Arc<dyn JobHandler>, binding_prefix: impl Into<String>) -> Self {
        Self {
            handler,
            binding_prefix: binding_prefix.into(),
        }
    }

    #[instrument(skip_all, fields(request_id = field::Empty, action = field::Empty))]
    pub async fn handle<B: Broker + ?Sized>(&self, broker: &mut B, delivery: Delivery) -> Disposition {
        match self.process(broker, &delivery).await {
            Ok(()) => {
                if let Err(e) = broker.ack(&delivery).await {
                    error!(error = %e, "Failed to ack delivery");
                }
                Disposition::Acked
            }
            Err(err) => {
                warn!(error = %err, "Job not completed, requeueing");
                if let Err(e) = broker.nack(&delivery, true).await {
                    error!(error = %e, "Failed to nack delivery");
                }
                Disposition::Requeued
            }
        }
    }

    async fn process<B: Broker + ?Sized>(&self, broker: &mut B, delivery: &Delivery) -> Result<(), DispatchError> {
        let envelope = delivery.envelope.as_ref().ok_or(DispatchError::MalformedEnvelope)?;
        let request_id = queue::request_id(&envelope.routing_key, &self.binding_prefix)
            .ok_or_else(|| DispatchError::RoutingKey(envelope.routing_key.clone()))?;
        Span::current().record("request_id", request_id);

        let job = JobRequest::from_body(envelope.body.as_bytes()).map_err(DispatchError::Body)?;
        Span::current().record("action", field::display(job.action));
        info!(
            project = %job.project_path,
            deliveries = envelope.deliveries,
            "Received job"
        );

        let result = self.handler.execute(&job).await?;
        let payload = result.payload().map_err(DispatchError::Encode)?;

        broker
            .publish(request_id, &payload)
            .await
            .map_err(DispatchError::Publish)?;
        info!(payload_bytes = payload.len(), "Result published");
        Ok(())
    }
}
