use std::hint::black_box;

use anyhow::Result;
use criterion::{Criterion, criterion_group, criterion_main};
use sluice::{
    config::{ImportConfig, StorageMode},
    ingest::ImportPipeline,
    sinks::MemorySink,
    sources::{SAMPLE_DATASET, StaticSource},
};

async fn run_import(pipeline: &ImportPipeline) -> Result<usize> {
    let report = pipeline
        .run(SAMPLE_DATASET, Default::default(), None)
        .await
        .into_result()?;
    Ok(report.total_processed)
}

fn criterion_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let config = ImportConfig::builder()
        .storage_mode(StorageMode::SinkOnly)
        .build()
        .unwrap();
    let pipeline = ImportPipeline::from_fetcher(StaticSource::sample(50_000), config)
        .with_sink(MemorySink::default());

    c.bench_function("import_50k_into_memory", |b| {
        b.to_async(&runtime).iter(|| run_import(black_box(&pipeline)));
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
