//! Scheduling Benchmarks
//!
//! Measures the coordinator's hot bookkeeping paths:
//! - Scheduler submit/dispatch/release
//! - Graph growth and effective-children lookup
//! - Checkpoint persistence

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::json;

use hive_core::scheduler::{DelegationScheduler, SchedulerLimits};
use hive_core::task::{TaskId, TaskSpec, WorkflowGraph};
use hive_core::{AgentId, CheckpointStore};

fn agents(count: usize) -> Vec<AgentId> {
    (0..count).map(|i| AgentId::new(format!("agent-{}", i))).collect()
}

/// Benchmark a full submit -> dispatch -> release cycle
fn bench_scheduler_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_cycle");

    for tasks in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*tasks as u64));

        group.bench_with_input(BenchmarkId::new("unbounded", tasks), tasks, |b, &tasks| {
            let ids = agents(8);
            b.iter(|| {
                let mut scheduler =
                    DelegationScheduler::new(ids.iter().cloned(), SchedulerLimits::default());
                for i in 0..tasks {
                    scheduler
                        .submit(TaskId::new(format!("t0.{}", i)), ids[i % ids.len()].clone())
                        .unwrap();
                }
                while !scheduler.is_idle() {
                    for slot in scheduler.dispatch() {
                        scheduler.release(slot.agent());
                    }
                }
                black_box(scheduler)
            })
        });

        group.bench_with_input(BenchmarkId::new("per_agent_1", tasks), tasks, |b, &tasks| {
            let ids = agents(8);
            let limits = SchedulerLimits {
                max_in_flight: 64,
                per_agent: 1,
            };
            b.iter(|| {
                let mut scheduler = DelegationScheduler::new(ids.iter().cloned(), limits);
                for i in 0..tasks {
                    scheduler
                        .submit(TaskId::new(format!("t0.{}", i)), ids[i % ids.len()].clone())
                        .unwrap();
                }
                while !scheduler.is_idle() {
                    for slot in scheduler.dispatch() {
                        scheduler.release(slot.agent());
                    }
                }
                black_box(scheduler)
            })
        });
    }

    group.finish();
}

fn wide_graph(children: usize) -> (WorkflowGraph, TaskId) {
    let mut graph = WorkflowGraph::new();
    let root = graph.add_root(AgentId::new("planner"), json!("goal"), 2);
    for i in 0..children {
        let spec = TaskSpec::for_agent("engineer", json!(i));
        graph
            .add_child(&root, AgentId::new("engineer"), &spec, 2)
            .unwrap();
    }
    (graph, root)
}

/// Benchmark graph operations used on every join
fn bench_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("workflow_graph");

    for children in [10, 100, 1000].iter() {
        group.bench_with_input(
            BenchmarkId::new("add_children", children),
            children,
            |b, &children| b.iter(|| black_box(wide_graph(children))),
        );

        group.bench_with_input(
            BenchmarkId::new("effective_children", children),
            children,
            |b, &children| {
                let (graph, root) = wide_graph(children);
                b.iter(|| graph.effective_children(black_box(&root)))
            },
        );
    }

    group.finish();
}

/// Benchmark checkpoint persistence
fn bench_checkpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint");

    for children in [10, 100].iter() {
        let (graph, _) = wide_graph(*children);
        let records = graph.records();

        group.bench_with_input(BenchmarkId::new("save_run", children), &records, |b, records| {
            let store = CheckpointStore::in_memory().unwrap();
            b.iter(|| store.save_run("bench", black_box(records)).unwrap())
        });

        group.bench_with_input(BenchmarkId::new("load_run", children), &records, |b, records| {
            let store = CheckpointStore::in_memory().unwrap();
            store.save_run("bench", records).unwrap();
            b.iter(|| store.load_run(black_box("bench")).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_scheduler_cycle, bench_graph, bench_checkpoint);

criterion_main!(benches);
