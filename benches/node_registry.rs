//! Benchmark for the node registry
//!
//! Registration churn and role lookups against a populated registry.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use sync_gateway::registry::NodeRegistry;
use sync_gateway::RegistryNode;

fn node(i: u64, role: &str) -> RegistryNode {
    RegistryNode {
        id: format!("node-{:04}", i),
        role: role.to_string(),
        system_version: sync_gateway::VERSION.to_string(),
        host: format!("host-{}.local:8090", i),
    }
}

fn populated(count: u64) -> std::sync::Arc<NodeRegistry> {
    let registry = NodeRegistry::new();
    for i in 0..count {
        let role = if i % 4 == 0 { "indexer" } else { "gateway" };
        let _ = registry.register(node(i, role));
    }
    registry
}

fn bench_register_nodes(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_registry");
    group.throughput(Throughput::Elements(1));

    group.bench_function("register_single_node", |b| {
        let registry = NodeRegistry::new();
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            let _ = registry.register(black_box(node(counter, "gateway")));
        });
    });

    group.finish();
}

fn bench_reregister(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_registry");
    group.throughput(Throughput::Elements(1));

    let registry = populated(1000);

    group.bench_function("reregister_known_node", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let _ = registry.register(black_box(node(counter % 1000, "gateway")));
        });
    });

    group.finish();
}

fn bench_nodes_for_role(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_registry");
    group.throughput(Throughput::Elements(1));

    let registry = populated(1000);

    group.bench_function("nodes_for_role_1000", |b| {
        b.iter(|| black_box(registry.nodes_for_role(black_box("indexer"))));
    });

    group.finish();
}

fn bench_concurrent_heartbeats(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_registry");
    group.throughput(Throughput::Elements(100));

    let registry = populated(1000);
    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("concurrent_100_heartbeats", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let reg = registry.clone();
                    handles.push(tokio::spawn(async move {
                        let _ = reg.heartbeat(&format!("node-{:04}", i % 1000));
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_register_nodes,
    bench_reregister,
    bench_nodes_for_role,
    bench_concurrent_heartbeats,
);
criterion_main!(benches);
