//! NATS JetStream consumer for incoming transaction records

use crate::config::NatsConfig;
use anyhow::{anyhow, Result};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy},
    stream, AckKind,
};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tracing::{info, warn};

/// Settles one delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Processing finished (successfully or permanently failed)
    async fn ack(&self) -> Result<()>;

    /// Ask for redelivery
    async fn nak(&self) -> Result<()>;
}

/// One delivered message, not yet acknowledged
pub struct InboundEvent {
    pub payload: Vec<u8>,
    /// Delivery count reported by the broker, 1 on first delivery
    pub delivery_attempt: Option<i64>,
    pub acker: Box<dyn Acknowledger>,
}

impl InboundEvent {
    pub fn new(payload: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            payload,
            delivery_attempt: None,
            acker,
        }
    }
}

pub type InboundStream = BoxStream<'static, InboundEvent>;

struct JetStreamAcker(jetstream::Message);

#[async_trait]
impl Acknowledger for JetStreamAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack().await.map_err(|e| anyhow!("ack failed: {}", e))
    }

    async fn nak(&self) -> Result<()> {
        self.0
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| anyhow!("nak failed: {}", e))
    }
}

/// Durable pull consumer on the transaction stream
pub struct TransactionConsumer {
    context: jetstream::Context,
    config: NatsConfig,
}

impl TransactionConsumer {
    /// Create a new transaction consumer
    pub fn new(client: Client, config: &NatsConfig) -> Self {
        Self {
            context: jetstream::new(client),
            config: config.clone(),
        }
    }

    /// Ensure stream and durable consumer exist, then start pulling.
    ///
    /// Unacknowledged messages are redelivered after `ack_wait_secs`, up to
    /// `max_deliver` times.
    pub async fn subscribe(&self) -> Result<InboundStream> {
        let stream = self
            .context
            .get_or_create_stream(stream::Config {
                name: self.config.stream.clone(),
                subjects: vec![self.config.transaction_subject.clone()],
                ..Default::default()
            })
            .await?;

        let messages: pull::Stream = stream
            .get_or_create_consumer(
                &self.config.durable_name,
                pull::Config {
                    durable_name: Some(self.config.durable_name.clone()),
                    filter_subject: self.config.transaction_subject.clone(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(self.config.ack_wait_secs),
                    max_deliver: self.config.max_deliver,
                    ..Default::default()
                },
            )
            .await?
            .messages()
            .await?;

        info!(
            stream = %self.config.stream,
            subject = %self.config.transaction_subject,
            durable = %self.config.durable_name,
            "Subscribed to transaction stream"
        );

        let events = messages.filter_map(|delivery| async move {
            match delivery {
                Ok(message) => {
                    let delivery_attempt = message.info().ok().map(|info| info.delivered);
                    Some(InboundEvent {
                        payload: message.payload.to_vec(),
                        delivery_attempt,
                        acker: Box::new(JetStreamAcker(message)),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "Failed to receive message");
                    None
                }
            }
        });
        Ok(events.boxed())
    }
}
