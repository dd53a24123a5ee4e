use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array2;
use rl_trainer::prelude::*;
use rl_trainer::rl_module::DEFAULT_MODULE_ID;
use serde_json::json;
use std::sync::Arc;

fn batch(rows: usize) -> MultiAgentBatch {
    let obs = Array2::from_shape_fn((rows, 8), |(i, j)| ((i * 8 + j) as f32 * 0.37).sin());
    let actions = Array2::from_shape_fn((rows, 2), |(i, j)| obs[[i, j]] - obs[[i, j + 2]]);
    let mut columns = SampleBatch::new();
    columns.insert("obs".to_string(), obs.into_dyn());
    columns.insert("actions".to_string(), actions.into_dyn());
    let mut batch = MultiAgentBatch::new();
    batch.insert(DEFAULT_MODULE_ID.to_string(), columns);
    batch
}

fn trainer(config: TrainerConfig) -> RlTrainer<CpuBackend, DataParallel<BcHooks>> {
    let spec = ModuleSpec::new(
        Arc::new(MlpModuleClass),
        json!({ "input_dim": 8, "output_dim": 2, "hidden_dims": [64, 64] }),
    );
    let hooks = DataParallel::new(BcHooks::new(BcConfig::default()));
    let mut trainer = RlTrainer::new(CpuBackend, hooks, spec, config).unwrap();
    trainer.build().unwrap();
    trainer
}

fn bench_local_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("bc_local_update");
    for &rows in &[32usize, 128, 512] {
        let data = batch(rows);
        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, _| {
            let mut trainer = trainer(TrainerConfig::local());
            b.iter(|| black_box(trainer.update(black_box(&data)).unwrap()));
        });
    }
    group.finish();
}

fn bench_data_parallel_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("bc_data_parallel_update");
    let data = batch(512);
    for &workers in &[1usize, 2, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            let mut trainer = trainer(TrainerConfig::distributed(workers));
            b.iter(|| black_box(trainer.update(black_box(&data)).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_local_update, bench_data_parallel_update);
criterion_main!(benches);
