use std::error::Error;
use std::thread;
use std::time::{Duration, Instant};
use griddle::{BatchService, BatchSubmitter, ProcessError, ServiceConfig, Vectorized};
use tracing::info;
use tracing_subscriber::EnvFilter;

const ITEMS: u64 = 880;
const BATCH_SIZE: usize = 200;
/// Milliseconds per unit of `ln(batch_len + 1)`
const COST_MS: f64 = 10.0;

/// A kernel whose cost grows with the log of the batch size, so per-item
/// cost falls as batches get larger.
struct LogCostKernel;

impl Vectorized for LogCostKernel {
    type Input = u64;
    type Output = u64;

    fn transform(&mut self, batch: &[u64]) -> Result<Vec<u64>, ProcessError> {
        thread::sleep(cost(batch.len()));
        Ok(batch.iter().map(|value| value * value).collect())
    }
}

fn cost(batch_len: usize) -> Duration {
    Duration::from_secs_f64(COST_MS * ((batch_len + 1) as f64).ln() / 1_000.0)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServiceConfig::default()
        .with_max_batch_size(BATCH_SIZE)
        .with_timeout(Duration::from_millis(10));
    let service = BatchService::new(config, || Ok(LogCostKernel))?;
    service.start().await?;

    let started = Instant::now();
    let results = service.submit_all((0..ITEMS).collect()).await;
    let elapsed = started.elapsed();

    let failed = results.iter().filter(|result| result.is_err()).count();
    let sequential = cost(1) * ITEMS as u32;
    let stats = service.stats();
    info!(
        items = ITEMS,
        failed,
        ?elapsed,
        ?sequential,
        speedup = sequential.as_secs_f64() / elapsed.as_secs_f64(),
        batches = stats.batches_flushed,
        largest_batch = stats.largest_batch,
        "throughput run finished"
    );

    service.stop().await;
    Ok(())
}
