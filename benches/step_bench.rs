//! Benchmark of the coordinator tick loop over the loopback bus.

use std::io::Write;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use cosim::models::mock::CounterModel;
use cosim::{RuntimeArgs, Simulation};

const STACK: &str = r#"
kind: Stack
spec:
  models:
    - name: counter_inst
      model:
        name: Counter
      channels:
        - name: data
---
kind: Model
metadata:
  name: Counter
spec:
  channels:
    - name: data
      signals:
        - signal: counter
"#;

fn configured_simulation(yaml_path: &std::path::Path) -> Simulation {
    let mut args = RuntimeArgs::new("counter_inst", 0.0005, 1e12).with_yaml_file(yaml_path);
    args.registry
        .register("Counter", || Box::new(CounterModel::new("data", "counter")));
    let mut sim = Simulation::configure(args).unwrap();
    sim.run_async().unwrap();
    sim
}

fn bench_tick_loop(c: &mut Criterion) {
    let mut yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    yaml.write_all(STACK.as_bytes()).unwrap();

    c.bench_function("tick_loop_1000", |b| {
        b.iter_batched(
            || configured_simulation(yaml.path()),
            |mut sim| {
                for _ in 0..1000 {
                    sim.sync().unwrap();
                }
                sim
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_tick_loop);
criterion_main!(benches);
