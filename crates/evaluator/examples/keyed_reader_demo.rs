//! Demonstration of keyed splittable evaluation
//!
//! A reader function emits records of a file in chunks. Each call reads at
//! most `chunk` records and hands back the rest of the offset range as a
//! residual, which is fed back until the range is drained.
//!
//! Run with: cargo run --example keyed_reader_demo -p evaluator

use async_trait::async_trait;
use chrono::Utc;
use evaluator::{
    AppliedSplittableStep, CommittedBundle, EvaluatorConfig, FnError, InMemoryOutputManager,
    KeyedWorkItem, OutputTag, ProcessContext, ProcessContinuation, SplittableEvaluatorFactory,
    SplittableFn, StateInternalsExt, WindowedValue,
};
use std::ops::Range;
use std::sync::Arc;

#[derive(Clone)]
struct ChunkedReader {
    chunk: u64,
}

#[async_trait]
impl SplittableFn for ChunkedReader {
    type Input = String;
    type Output = String;
    type Restriction = Range<u64>;

    fn name(&self) -> &str {
        "chunked-reader"
    }

    async fn process_element(
        &mut self,
        ctx: &ProcessContext<String>,
        element: &WindowedValue<String>,
        restriction: Range<u64>,
    ) -> Result<ProcessContinuation<Range<u64>>, FnError> {
        let end = restriction.end.min(restriction.start + self.chunk);
        for offset in restriction.start..end {
            ctx.output_windowed(element.with_value(format!("{}#{}", element.value, offset)))?;
        }

        let read: u64 = ctx.state().read_value(b"records-read").await?.unwrap_or(0);
        ctx.state()
            .write_value(b"records-read", &(read + end - restriction.start))
            .await?;

        if end < restriction.end {
            Ok(ProcessContinuation::resume(end..restriction.end))
        } else {
            Ok(ProcessContinuation::Stop)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("=== Keyed Splittable Evaluation Demo ===\n");

    let sink = Arc::new(InMemoryOutputManager::new([OutputTag::from("records")]));
    let factory = SplittableEvaluatorFactory::<ChunkedReader>::in_memory(
        EvaluatorConfig::default(),
        Arc::new(sink.clone()),
    )?;
    let app = AppliedSplittableStep::new("read-files", ChunkedReader { chunk: 4 }, "records");

    let element = WindowedValue::in_global_window("access.log".to_string(), Utc::now());
    let mut pending = vec![KeyedWorkItem::new("host-a", element, 0..10)];
    let mut round = 1;

    while !pending.is_empty() {
        let bundle = CommittedBundle::new("host-a", std::mem::take(&mut pending));
        let result = factory.evaluate_bundle(&app, bundle).await?;
        println!(
            "  Round {}: {} records emitted by {}, {} residual(s)",
            round,
            result.total_outputs(),
            result.instance,
            result.residuals.len()
        );
        pending = result.residuals.into_iter().map(|r| r.item).collect();
        round += 1;
    }

    println!("\n  Total records routed: {}", sink.len());
    if let Some(stats) = factory.pool_stats(&"read-files".into()) {
        println!(
            "  Pool: created={} reused={} discarded={} idle={}",
            stats.created, stats.reused, stats.discarded, stats.idle
        );
    }

    factory.cleanup();
    println!("\n=== Demo Complete ===");
    Ok(())
}
