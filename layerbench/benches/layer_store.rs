//! Layer store benchmarks. The backend is selected with the `LAYERBENCH_*` environment variables,
//! e.g. `LAYERBENCH_GRAPHDRIVER=vfs cargo bench -p layerbench`.

use std::{
    io::Cursor,
    time::{Duration, Instant},
};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use layerbench::{
    build_chain, make_directory, open_store, tar_from_deltas, write_file, HarnessConfig, Layer,
    LayerInit, LayerStore, RwLayer, RwLayerOptions, TestStore,
};

//--------------------------------------------------------------------------------------------------
// Benchmark
//--------------------------------------------------------------------------------------------------

fn benchmark_create_empty_layer(c: &mut Criterion) {
    let mut store = open_bench_store();
    let empty_tar = tar_from_deltas(&[]).expect("Failed to create tar bytes");

    c.bench_function("create_empty_layer", |b| {
        b.iter_custom(|iters| {
            let mut elapsed = Duration::ZERO;
            for _ in 0..iters {
                let start = Instant::now();
                let layer = store
                    .register(Cursor::new(&empty_tar), None)
                    .expect("Failed to register new layer");
                elapsed += start.elapsed();

                store.release(layer).expect("Failed to release layer");
            }
            elapsed
        })
    });

    store.cleanup().expect("Failed to clean up store");
}

fn benchmark_get_base_mount(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_base_mount");

    for depth in [1, 20, 50, 100] {
        let mut store = open_bench_store();
        let layer =
            build_chain(&mut store, &chain_inits(depth)).expect("Failed to create layer chain");

        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut rw_layer = store
            .create_rw_layer(&id, Some(layer.chain_id()), RwLayerOptions::default())
            .expect("Failed to create rw layer");

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter_custom(|iters| {
                let mut elapsed = Duration::ZERO;
                for _ in 0..iters {
                    let start = Instant::now();
                    rw_layer.mount("").expect("Mount error");
                    elapsed += start.elapsed();

                    rw_layer.unmount().expect("Unmount error");
                }
                elapsed
            })
        });

        store
            .release_rw_layer(rw_layer)
            .expect("Failed to release rw layer");
        store.release(layer).expect("Failed to release layer");
        store.cleanup().expect("Failed to clean up store");
    }

    group.finish();
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn open_bench_store() -> TestStore {
    let config = HarnessConfig::from_env().expect("Invalid harness configuration");
    open_store(&config).expect("Failed to open layer store")
}

fn chain_inits(depth: usize) -> Vec<LayerInit> {
    let mut inits = vec![LayerInit::new(vec![
        make_directory("/etc", 0o755),
        write_file("/etc/hosts", "mydomain 10.0.0.1", 0o644),
        write_file("/etc/profile", "PATH=/usr/bin", 0o644),
        make_directory("/testfiles", 0o755),
    ])];

    inits.extend((1..depth).map(|i| {
        LayerInit::new(vec![write_file(
            format!("/testfiles/t-{i}"),
            "irrelevant data",
            0o644,
        )])
    }));

    inits
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = benchmark_create_empty_layer, benchmark_get_base_mount
}
criterion_main!(benches);
