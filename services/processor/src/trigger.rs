use crate::config::KafkaConfig;
use crate::event::{parse_notifications, EventError};
use crate::pipeline::{BatchReport, IngestionPipeline};
use anyhow::{Context, Result};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::Offset;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a message could not be turned into a batch
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Message has no payload")]
    EmptyPayload,

    #[error(transparent)]
    Event(#[from] EventError),
}

/// What to do with a message's offset once it has been handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetAction {
    /// Move the group past the message
    Commit,
    /// Rewind the partition so the message is consumed again
    Redeliver,
}

/// Decide how to move the offset after handling a message.
///
/// Unreadable payloads are committed: replaying them cannot succeed, and
/// offsets are cumulative, so any later commit on the partition would skip
/// them anyway. A batch that left items unfinished is replayed; records are
/// upserted, so items already persisted are simply rewritten.
pub fn offset_action(outcome: &Result<BatchReport, TriggerError>) -> OffsetAction {
    match outcome {
        Ok(report) if !report.abandoned.is_empty() => OffsetAction::Redeliver,
        _ => OffsetAction::Commit,
    }
}

/// Run one notification payload through the pipeline.
///
/// Item failures, including records whose key cannot be decoded, end up in
/// the report; only an unreadable payload is an error.
pub async fn handle_payload(
    pipeline: &IngestionPipeline,
    payload: Option<&[u8]>,
) -> Result<BatchReport, TriggerError> {
    let payload = payload.ok_or(TriggerError::EmptyPayload)?;
    let batch = parse_notifications(payload)?;

    let mut report = if batch.notifications.is_empty() {
        debug!("Notification carried no object creations to process");
        BatchReport::default()
    } else {
        pipeline.process(batch.notifications).await
    };
    report.failed.extend(batch.rejected);

    Ok(report)
}

/// Kafka consumer for bucket notifications
pub struct NotificationConsumer {
    consumer: StreamConsumer,
    pipeline: Arc<IngestionPipeline>,
}

impl NotificationConsumer {
    /// Create a new Kafka consumer subscribed to the notification topic
    pub fn new(config: &KafkaConfig, pipeline: Arc<IngestionPipeline>) -> Result<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.notification_topic])
            .context("Failed to subscribe to notification topic")?;

        info!(
            topic = %config.notification_topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self { consumer, pipeline })
    }

    /// Consume notifications until `shutdown` is cancelled
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting notification consumer");

        let mut message_stream = self.consumer.stream();

        loop {
            let message_result = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Notification consumer shutting down");
                    break;
                }
                next = message_stream.next() => match next {
                    Some(result) => result,
                    None => break,
                },
            };

            match message_result {
                Ok(message) => {
                    let outcome = self.process_message(&message).await;
                    match &outcome {
                        Ok(_) => metrics::counter!("geotag.messages.processed").increment(1),
                        Err(e) => {
                            error!(
                                error = %e,
                                partition = message.partition(),
                                offset = message.offset(),
                                "Skipping unreadable message"
                            );
                            metrics::counter!("geotag.messages.failed").increment(1);
                        }
                    }

                    match offset_action(&outcome) {
                        OffsetAction::Commit => {
                            if let Err(e) =
                                self.consumer.commit_message(&message, CommitMode::Async)
                            {
                                warn!(error = %e, "Failed to commit offset");
                            }
                        }
                        OffsetAction::Redeliver => self.rewind(&message),
                    }
                }
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("geotag.kafka.errors").increment(1);
                }
            }
        }

        Ok(())
    }

    #[instrument(skip(self, message), fields(partition = message.partition(), offset = message.offset()))]
    async fn process_message(
        &self,
        message: &BorrowedMessage<'_>,
    ) -> Result<BatchReport, TriggerError> {
        let report = handle_payload(&self.pipeline, message.payload()).await?;

        info!(
            persisted = report.persisted.len(),
            failed = report.failed.len(),
            abandoned = report.abandoned.len(),
            "Notification batch handled"
        );

        Ok(report)
    }

    /// Seek the message's partition back so the message is fetched again
    fn rewind(&self, message: &BorrowedMessage<'_>) {
        warn!(
            partition = message.partition(),
            offset = message.offset(),
            "Batch left items unfinished, rewinding partition for redelivery"
        );
        metrics::counter!("geotag.messages.redelivered").increment(1);

        if let Err(e) = self.consumer.seek(
            message.topic(),
            message.partition(),
            Offset::Offset(message.offset()),
            SEEK_TIMEOUT,
        ) {
            error!(error = %e, "Failed to rewind partition");
        }
    }
}
