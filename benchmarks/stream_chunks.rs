use std::hint::black_box;

use anyhow::Result;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use futures_util::TryStreamExt as _;
use sluice::{
    config::ImportConfig,
    ingest::StreamProcessor,
    sources::{SAMPLE_DATASET, StaticSource},
};

async fn stream_chunks(source: StaticSource, config: ImportConfig) -> Result<usize> {
    let mut stream = StreamProcessor::new(source, config).process_stream(
        SAMPLE_DATASET,
        Default::default(),
        None,
    )?;

    let mut items = 0;
    while let Some(chunk) = stream.try_next().await? {
        items += chunk.len();
    }
    Ok(items)
}

fn criterion_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("stream_chunks");

    for items in [10_000, 100_000] {
        let source = StaticSource::sample(items);

        for adaptive in [false, true] {
            let config = ImportConfig::builder()
                .adaptive_chunk_size(adaptive)
                .build()
                .unwrap();
            let name = if adaptive { "adaptive" } else { "fixed" };

            group.bench_with_input(BenchmarkId::new(name, items), &items, |b, _| {
                b.to_async(&runtime)
                    .iter(|| stream_chunks(black_box(source.clone()), config.clone()));
            });
        }
    }

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
