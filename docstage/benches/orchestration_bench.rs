//! Benchmarks for retry decisions, graph validation and stage transitions.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use docstage::core::{DocumentId, ErrorType};
use docstage::orchestrator::Orchestrator;
use docstage::registry::{presets, StageDefinition, StageRegistry};
use docstage::retry::{classify_message, RetryEvaluator, RetryPolicy};
use docstage::store::{Metadata, Stores};

fn benchmark_retry_decisions(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry");
    let evaluator = RetryEvaluator::seeded(1);
    let policy = RetryPolicy::new().with_max_attempts(10);

    for error_type in [ErrorType::Transient, ErrorType::ResourceExhausted, ErrorType::ValidationFailure] {
        group.bench_with_input(
            BenchmarkId::new("decide", error_type),
            &error_type,
            |b, &error_type| b.iter(|| black_box(evaluator.decide(&policy, error_type, black_box(4)))),
        );
    }

    let messages = [
        "connection reset by peer",
        "429 Too Many Requests",
        "unsupported format: application/x-msaccess",
        "segmentation fault in native extractor",
    ];
    group.bench_function("classify_message", |b| {
        b.iter(|| {
            for m in &messages {
                black_box(classify_message(m));
            }
        })
    });

    group.finish();
}

fn layered_graph(width: usize, depth: usize) -> Vec<StageDefinition> {
    let mut defs = Vec::with_capacity(width * depth);
    for layer in 0..depth {
        for i in 0..width {
            let mut def = StageDefinition::new(format!("s{layer}_{i}"));
            if layer > 0 {
                for j in 0..width {
                    def = def.depends_on(format!("s{}_{j}", layer - 1));
                }
            }
            defs.push(def);
        }
    }
    defs
}

fn benchmark_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    for (width, depth) in [(2, 5), (5, 10), (10, 20)] {
        let defs = layered_graph(width, depth);
        group.bench_with_input(
            BenchmarkId::new("build", format!("{width}x{depth}")),
            &defs,
            |b, defs| b.iter(|| black_box(StageRegistry::new(defs.clone()).unwrap())),
        );
    }

    group.finish();
}

fn benchmark_transitions(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("orchestrator");

    group.bench_function("linear_document_in_memory", |b| {
        let orchestrator = Orchestrator::new(presets::linear(&["a", "b", "c", "d"]).unwrap(), Stores::in_memory());
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let doc = DocumentId::new(format!("bench-{n}"));
            runtime.block_on(async {
                orchestrator.register_document(&doc).await.unwrap();
                for stage in ["a", "b", "c", "d"] {
                    let token = orchestrator.start_stage(&doc, stage).await.unwrap();
                    orchestrator.complete_stage(&token, Metadata::new()).await.unwrap();
                }
            });
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_retry_decisions,
    benchmark_registry,
    benchmark_transitions
);
criterion_main!(benches);
