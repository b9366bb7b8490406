//! Worker pool that drains the queue into the dispatcher.

use super::Dispatcher;
use crate::config::QueueConfig;
use crate::errors::EngineError;
use crate::queue::Delivery;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Polls the queue on a fixed interval and handles each delivery on its own
/// tokio task, bounded by a semaphore.
#[derive(Debug)]
pub struct QueueProcessor {
    dispatcher: Arc<Dispatcher>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    batch_size: usize,
    poll_interval: Duration,
}

impl QueueProcessor {
    /// Creates a processor.
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, config: &QueueConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            dispatcher,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval(),
        }
    }

    /// Handles one batch inline, returning how many deliveries were handled.
    ///
    /// Redelivers expired in-flight messages first.
    pub async fn process_once(&self) -> Result<usize, EngineError> {
        let queue = self.dispatcher.queue();
        queue.retry_unacked().await?;

        let deliveries = queue.poll(self.batch_size).await?;
        let handled = deliveries.len();
        for delivery in deliveries {
            deliver(&self.dispatcher, delivery).await;
        }
        Ok(handled)
    }

    /// Starts the polling loop on the current runtime.
    pub fn start(self: Arc<Self>) -> ProcessorHandle {
        let (shutdown, mut signal) = watch::channel(false);
        let processor = Arc::clone(&self);

        let join = tokio::spawn(async move {
            let mut interval = time::interval(processor.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                concurrency = processor.concurrency,
                batch_size = processor.batch_size,
                "Queue processor started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = processor.tick().await {
                            error!(error = %err, "Queue poll failed");
                        }
                    }
                    changed = signal.changed() => {
                        if changed.is_err() || *signal.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Queue processor stopped");
        });

        ProcessorHandle {
            shutdown,
            join,
            semaphore: Arc::clone(&self.semaphore),
            concurrency: self.concurrency,
        }
    }

    async fn tick(&self) -> Result<(), EngineError> {
        let queue = self.dispatcher.queue();
        queue.retry_unacked().await?;

        let available = self.semaphore.available_permits();
        if available == 0 {
            debug!("All workers busy, skipping poll");
            return Ok(());
        }

        for delivery in queue.poll(available.min(self.batch_size)).await? {
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|err| EngineError::Internal(err.to_string()))?;
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                let _permit = permit;
                deliver(&dispatcher, delivery).await;
            });
        }
        Ok(())
    }
}

/// Handles a delivery and acks it on success.
///
/// A failed delivery stays unacked so the queue redelivers it.
async fn deliver(dispatcher: &Dispatcher, delivery: Delivery) {
    let message = &delivery.envelope.message;
    match dispatcher.handle(&delivery.envelope).await {
        Ok(()) => {
            if let Err(err) = dispatcher.queue().ack(&delivery.receipt).await {
                warn!(
                    message_type = message.message_type(),
                    execution_id = message.execution_id(),
                    error = %err,
                    "Failed to ack delivery"
                );
            }
        }
        Err(err) => {
            error!(
                message_type = message.message_type(),
                execution_id = message.execution_id(),
                stage_id = message.stage_id(),
                task_id = message.task_id(),
                attempt = delivery.envelope.attempt_count,
                error = %err,
                "Handler failed, leaving message for redelivery"
            );
        }
    }
}

/// Handle to a running [`QueueProcessor`].
#[derive(Debug)]
pub struct ProcessorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
}

impl ProcessorHandle {
    /// Stops polling and waits for in-flight deliveries to finish.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        // The loop may already have exited; a closed channel is fine.
        let _ = self.shutdown.send(true);
        self.join
            .await
            .map_err(|err| EngineError::Internal(format!("Queue processor panicked: {err}")))?;

        let permits = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        let _drained = self
            .semaphore
            .acquire_many(permits)
            .await
            .map_err(|err| EngineError::Internal(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionStatus;
    use crate::testing::{fixtures, ScriptedTask, TestHarness};
    use crate::tasks::TaskResult;

    #[tokio::test]
    async fn test_process_once_acks_handled_deliveries() {
        let harness = TestHarness::new().with_task(ScriptedTask::new(
            "noop",
            vec![TaskResult::succeeded()],
        ));
        let id = harness.launch(fixtures::single_task("noop")).await.unwrap();

        let processor = QueueProcessor::new(harness.dispatcher(), &QueueConfig::default());
        let mut handled = 0;
        while harness.queue().ready_len() > 0 {
            handled += processor.process_once().await.unwrap();
        }

        assert!(handled >= 6);
        assert_eq!(harness.queue().in_flight_len(), 0);
        assert_eq!(harness.status(&id).await.unwrap(), ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_started_processor_drains_and_shuts_down() {
        let harness = TestHarness::new().with_task(ScriptedTask::new(
            "noop",
            vec![TaskResult::succeeded()],
        ));
        let id = harness.launch(fixtures::single_task("noop")).await.unwrap();

        let config = QueueConfig {
            poll_interval_ms: 1,
            ..QueueConfig::default()
        };
        let handle = Arc::new(QueueProcessor::new(harness.dispatcher(), &config)).start();

        for _ in 0..500 {
            if harness.status(&id).await.unwrap() == ExecutionStatus::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        handle.shutdown().await.unwrap();

        assert_eq!(harness.status(&id).await.unwrap(), ExecutionStatus::Succeeded);
    }
}
