//! NATS message producer for ensemble results

use crate::dispatch::ResultSink;
use crate::error::DispatchError;
use crate::types::result::EnsembleResult;
use async_nats::Client;
use async_trait::async_trait;
use tracing::debug;

/// Publishes every ensemble result to a NATS subject
#[derive(Clone)]
pub struct ResultPublisher {
    client: Client,
    subject: String,
}

impl ResultPublisher {
    /// Create a new result publisher
    pub fn new(client: Client, subject: &str) -> Self {
        Self {
            client,
            subject: subject.to_string(),
        }
    }

    /// Publish one result
    pub async fn publish(&self, result: &EnsembleResult) -> Result<(), DispatchError> {
        let payload = serde_json::to_vec(result)?;

        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| DispatchError::Publish {
                subject: self.subject.clone(),
                reason: e.to_string(),
            })?;

        debug!(
            transaction_id = %result.transaction_id,
            fraud_probability = result.fraud_probability,
            verdict = %result.verdict,
            "Published ensemble result"
        );

        Ok(())
    }
}

#[async_trait]
impl ResultSink for ResultPublisher {
    fn name(&self) -> &str {
        "nats"
    }

    async fn deliver(&self, result: &EnsembleResult) -> Result<(), DispatchError> {
        self.publish(result).await
    }
}
