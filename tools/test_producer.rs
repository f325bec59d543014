//! Test Transaction Producer
//!
//! Generates normal-looking and fraud-looking transaction records and
//! publishes them to NATS for pipeline testing.
//!
//! Usage: test_producer [NATS_URL] [SUBJECT] [COUNT] [FRAUD_RATE] [DELAY_MS]

use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// Record shape the scoring service expects: `amount`, `time`, `v1..v28`
#[derive(Debug, Clone, Serialize)]
struct TransactionRecord {
    transaction_id: String,
    amount: f64,
    time: f64,
    #[serde(flatten)]
    components: serde_json::Map<String, serde_json::Value>,
}

/// Components that separate fraud from normal traffic most strongly
const FRAUD_HEAVY_COMPONENTS: [usize; 5] = [1, 3, 7, 10, 14];

/// Record generator for testing
struct RecordGenerator {
    rng: rand::rngs::ThreadRng,
    record_counter: u64,
}

impl RecordGenerator {
    fn new() -> Self {
        Self {
            rng: rand::thread_rng(),
            record_counter: 0,
        }
    }

    /// Standard normal sample (Box-Muller)
    fn normal(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }

    fn components<F>(&mut self, mut spread: F) -> serde_json::Map<String, serde_json::Value>
    where
        F: FnMut(usize) -> f64,
    {
        (1..=28)
            .map(|i| {
                let std_dev = spread(i);
                (format!("v{}", i), serde_json::json!(self.normal(0.0, std_dev)))
            })
            .collect()
    }

    /// Ordinary purchase: modest amount, unremarkable components
    fn generate_normal(&mut self) -> TransactionRecord {
        self.record_counter += 1;
        TransactionRecord {
            transaction_id: format!("tx_{:012}", self.record_counter),
            amount: self.rng.gen_range(1.0..300.0),
            time: self.rng.gen_range(0.0..172_792.0),
            components: self.components(|_| 1.0),
        }
    }

    /// Large amount at an unusual hour with widely spread key components
    fn generate_fraud(&mut self) -> TransactionRecord {
        self.record_counter += 1;
        TransactionRecord {
            transaction_id: format!("tx_{:012}", self.record_counter),
            amount: self.rng.gen_range(2_000.0..10_000.0),
            time: self.rng.gen_range(18_000.0..28_800.0),
            components: self.components(|i| {
                if FRAUD_HEAVY_COMPONENTS.contains(&i) {
                    2.0
                } else {
                    0.5
                }
            }),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("test_producer=info".parse()?),
        )
        .init();

    info!("Starting Test Transaction Producer");

    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let nats_url = args.get(1).map(|s| s.as_str()).unwrap_or("nats://localhost:4222");
    let subject = args.get(2).map(|s| s.as_str()).unwrap_or("transactions");
    let count: u64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(100);
    let fraud_rate: f64 = args
        .get(4)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.1_f64)
        .clamp(0.0, 1.0);
    let delay_ms: u64 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(100);

    info!(
        nats_url = %nats_url,
        subject = %subject,
        count = count,
        fraud_rate = fraud_rate,
        delay_ms = delay_ms,
        "Configuration loaded"
    );

    // Connect to NATS
    let client = match async_nats::connect(nats_url).await {
        Ok(c) => {
            info!("Connected to NATS");
            c
        }
        Err(e) => {
            warn!(error = %e, "Failed to connect to NATS. Running in dry-run mode.");
            return run_dry_mode(count, fraud_rate, delay_ms).await;
        }
    };

    let mut generator = RecordGenerator::new();
    let mut rng = rand::thread_rng();

    info!("Starting to publish {} records...", count);

    let mut normal_count = 0;
    let mut fraud_count = 0;

    for i in 0..count {
        let record = if rng.gen_bool(fraud_rate) {
            fraud_count += 1;
            generator.generate_fraud()
        } else {
            normal_count += 1;
            generator.generate_normal()
        };

        let payload = serde_json::to_vec(&record)?;
        client.publish(subject.to_string(), payload.into()).await?;

        if (i + 1) % 10 == 0 {
            info!(
                "Published {}/{} records ({} normal, {} fraud-like)",
                i + 1,
                count,
                normal_count,
                fraud_count
            );
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    client.flush().await?;
    info!(
        "Completed! Published {} records ({} normal, {} fraud-like)",
        count, normal_count, fraud_count
    );

    Ok(())
}

async fn run_dry_mode(count: u64, fraud_rate: f64, delay_ms: u64) -> anyhow::Result<()> {
    info!("Running in dry-run mode (no NATS connection)");

    let mut generator = RecordGenerator::new();
    let mut rng = rand::thread_rng();

    for i in 0..count {
        let record = if rng.gen_bool(fraud_rate) {
            generator.generate_fraud()
        } else {
            generator.generate_normal()
        };

        if (i + 1) % 10 == 0 || i == 0 {
            let json = serde_json::to_string_pretty(&record)?;
            info!("Sample record {}:\n{}", i + 1, json);
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    Ok(())
}
