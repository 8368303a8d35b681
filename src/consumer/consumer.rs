//! Consume loop: bounded dispatch, per-connection fan-out, and requeue to the
//! retry or dead-letter topic

use crate::consumer::{
    backpressure::BackpressureController,
    config::ConsumerConfig,
    processor::{
        MessagePublisher, MessageSource, RotorMessage, HEADER_CONNECTION_IDS, HEADER_ERROR,
        HEADER_FUNCTION_ID, HEADER_ORIGINAL_TOPIC, HEADER_RETRIES, HEADER_RETRY_TIME,
    },
    shutdown::ShutdownState,
};
use crate::dispatch::{DispatchRequest, MessageDispatcher};
use crate::error::{RotorError, RotorResult};
use crate::event::replace_payload;
use crate::metrics::prom::MESSAGES;
use crate::poll::PollState;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Where a failed message went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Published to the retry topic
    Retry,
    /// Published to the dead-letter topic
    DeadLetter,
    /// Publishing failed, the message is lost
    Failed,
}

/// Consumer orchestrator
pub struct ConsumerOrchestrator {
    config: ConsumerConfig,
    dispatcher: Arc<MessageDispatcher>,
    publisher: Arc<dyn MessagePublisher>,
    backpressure: BackpressureController,
    shutdown_state: Arc<ShutdownState>,
    tasks: TaskTracker,
}

impl ConsumerOrchestrator {
    /// Orchestrator dispatching through `dispatcher` and requeueing through
    /// `publisher`
    pub fn new(
        config: ConsumerConfig,
        dispatcher: Arc<MessageDispatcher>,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        let backpressure = BackpressureController::new(config.concurrency);
        Self {
            config,
            dispatcher,
            publisher,
            backpressure,
            shutdown_state: Arc::new(ShutdownState::new()),
            tasks: TaskTracker::new(),
        }
    }

    /// Shutdown progress
    pub fn shutdown_state(&self) -> Arc<ShutdownState> {
        self.shutdown_state.clone()
    }

    /// Messages currently being dispatched
    pub fn inflight(&self) -> usize {
        self.backpressure.inflight()
    }

    /// Consume `source` until it is exhausted or `cancel` fires, then drain
    /// and disconnect
    pub async fn run<S: MessageSource>(
        self: Arc<Self>,
        mut source: S,
        cancel: CancellationToken,
    ) -> RotorResult<()> {
        info!(
            "Starting consumer on {:?} with concurrency {}",
            self.config.topics, self.config.concurrency
        );
        let shutdown = self.shutdown_state.token();

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
                permit = self.backpressure.acquire() => permit?,
            };
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
                message = source.next() => message,
            };
            match message {
                Some(Ok(message)) => {
                    let this = self.clone();
                    self.tasks.spawn(async move {
                        this.handle(message).await;
                        drop(permit);
                    });
                }
                Some(Err(e)) => {
                    error!("Consumer error: {}", e);
                }
                None => {
                    info!("Message source exhausted");
                    break;
                }
            }
        }

        self.shutdown_state.begin_shutdown();
        self.tasks.close();
        loop {
            match self.backpressure.on_idle(self.config.drain_timeout).await {
                PollState::Succeeded => break,
                other => warn!(
                    "Drain still waiting ({:?}), {} messages in flight",
                    other,
                    self.backpressure.inflight()
                ),
            }
        }
        self.tasks.wait().await;
        info!("All inflight messages completed");
        self.backpressure.close();

        source.close().await;
        self.publisher.close().await;
        self.shutdown_state.complete_shutdown();
        info!("Consumer shutdown complete");
        Ok(())
    }

    /// Dispatch one consumed message to every connection it is routed to
    pub async fn handle(&self, message: RotorMessage) {
        if let Some(retry_time) = message
            .header(HEADER_RETRY_TIME)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        {
            let wait = retry_time.with_timezone(&Utc) - Utc::now();
            if let Ok(wait) = wait.to_std() {
                debug!("Delaying message for {:?} until retry time", wait);
                tokio::time::sleep(wait).await;
            }
        }

        let retries = message.retries();
        let function_id = message.header(HEADER_FUNCTION_ID).map(str::to_string);
        let request = match DispatchRequest::parse(&message.payload) {
            Ok(request) => request
                .with_retries(retries)
                .with_function_id(function_id),
            Err(e) => {
                self.requeue(&message, None, &e).await;
                return;
            }
        };

        let connection_ids = message.connection_ids();
        if connection_ids.is_empty() {
            self.dispatch_one(&message, request, None).await;
            return;
        }
        join_all(connection_ids.iter().map(|id| {
            let request = request.clone().with_connection_id(id.clone());
            self.dispatch_one(&message, request, Some(id.as_str()))
        }))
        .await;
    }

    async fn dispatch_one(
        &self,
        message: &RotorMessage,
        request: DispatchRequest,
        connection_id: Option<&str>,
    ) {
        match self.dispatcher.dispatch(request).await {
            Ok(result) => {
                MESSAGES.with_label_values(&["processed"]).inc();
                debug!(
                    connection_id = connection_id.unwrap_or_default(),
                    events = result.events.len(),
                    "Message processed"
                );
            }
            Err(e) => {
                warn!(
                    connection_id = connection_id.unwrap_or_default(),
                    error = %e,
                    "Message processing failed"
                );
                self.requeue(message, connection_id, &e).await;
            }
        }
    }

    /// Publish a failed message to the retry topic while attempts remain,
    /// else to the dead-letter topic
    pub async fn requeue(
        &self,
        message: &RotorMessage,
        connection_id: Option<&str>,
        error: &RotorError,
    ) -> Requeue {
        let retries = message.retries();
        let policy = self.config.retry.policy_for(error.retry_policy());
        let retry_time = if error.is_retryable() && policy.should_retry(retries) {
            policy.next_retry_time(retries, Utc::now())
        } else {
            None
        };
        let (topic, outcome) = match retry_time {
            Some(_) => (self.config.retry_topic.clone(), Requeue::Retry),
            None => (self.config.dead_letter_topic.clone(), Requeue::DeadLetter),
        };

        let snapshot = match error {
            RotorError::Function(e) => e.event.as_ref(),
            _ => None,
        };
        let payload = match snapshot {
            Some(event) => match replace_payload(&message.payload, event) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Cannot replace payload with the failed event: {}", e);
                    message.payload.clone()
                }
            },
            None => message.payload.clone(),
        };

        let key = match (retries, connection_id) {
            (0, Some(id)) => Some(format!("{}_{}", message.key.as_deref().unwrap_or_default(), id)),
            _ => message.key.clone(),
        };
        let function_id = match error {
            RotorError::Function(e) => e.function_id.clone().unwrap_or_default(),
            _ => String::new(),
        };
        let connection_ids = connection_id
            .map(str::to_string)
            .or_else(|| message.header(HEADER_CONNECTION_IDS).map(str::to_string))
            .unwrap_or_default();
        let original_topic = message
            .header(HEADER_ORIGINAL_TOPIC)
            .unwrap_or(&message.topic)
            .to_string();

        let mut requeued = RotorMessage::new(topic.clone(), payload)
            .with_header(HEADER_ERROR, error.to_string())
            .with_header(HEADER_RETRIES, (retries + 1).to_string())
            .with_header(HEADER_ORIGINAL_TOPIC, original_topic)
            .with_header(
                HEADER_RETRY_TIME,
                retry_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
            )
            .with_header(HEADER_CONNECTION_IDS, connection_ids)
            .with_header(HEADER_FUNCTION_ID, function_id);
        requeued.key = key;

        match self.publisher.publish(requeued).await {
            Ok(()) => {
                let label = match outcome {
                    Requeue::Retry => "requeued",
                    _ => "dead_lettered",
                };
                MESSAGES.with_label_values(&[label]).inc();
                info!(
                    topic = %topic,
                    retries = retries + 1,
                    connection_id = connection_id.unwrap_or_default(),
                    "Message requeued"
                );
                outcome
            }
            Err(e) => {
                MESSAGES.with_label_values(&["publish_failed"]).inc();
                error!(topic = %topic, error = %e, "Failed to requeue message");
                Requeue::Failed
            }
        }
    }
}
