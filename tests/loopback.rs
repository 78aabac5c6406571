//! End-to-end loopback simulations.
//!
//! These tests run complete simulations over the in-process loopback
//! bus: single-model stepping, cross-instance signal visibility, and
//! binary payload handoff.

use std::io::Write;
use std::sync::{Arc, Mutex};

use cosim::models::mock::CounterModel;
use cosim::{
    Model, ModelSignals, Result, RunStatus, RuntimeArgs, SimTime, Simulation, StepOutcome,
};

// ============================================================================
// Test Models
// ============================================================================

/// Does nothing each step.
struct NullModel;

impl Model for NullModel {
    fn step(
        &mut self,
        _signals: &mut ModelSignals<'_>,
        _model_time: &mut SimTime,
        _stop_time: SimTime,
    ) -> Result<StepOutcome> {
        Ok(StepOutcome::Continue)
    }
}

/// Writes a fixed scalar value on every step.
struct WriterModel {
    channel: String,
    signal: String,
    value: f64,
}

impl Model for WriterModel {
    fn step(
        &mut self,
        signals: &mut ModelSignals<'_>,
        _model_time: &mut SimTime,
        _stop_time: SimTime,
    ) -> Result<StepOutcome> {
        if let Some(ch) = signals.channel(&self.channel) {
            if let Some(idx) = ch.index_of(&self.signal) {
                ch.set_scalar(idx, self.value);
            }
        }
        Ok(StepOutcome::Continue)
    }
}

/// Records the scalar value it observes at every step.
struct ProbeModel {
    channel: String,
    signal: String,
    seen: Arc<Mutex<Vec<f64>>>,
}

impl Model for ProbeModel {
    fn step(
        &mut self,
        signals: &mut ModelSignals<'_>,
        _model_time: &mut SimTime,
        _stop_time: SimTime,
    ) -> Result<StepOutcome> {
        if let Some(ch) = signals.channel(&self.channel) {
            if let Some(idx) = ch.index_of(&self.signal) {
                self.seen.lock().unwrap().push(ch.scalar(idx));
            }
        }
        Ok(StepOutcome::Continue)
    }
}

/// Captures and consumes binary payloads.
struct CaptureModel {
    channel: String,
    captured: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Model for CaptureModel {
    fn step(
        &mut self,
        signals: &mut ModelSignals<'_>,
        _model_time: &mut SimTime,
        _stop_time: SimTime,
    ) -> Result<StepOutcome> {
        if let Some(ch) = signals.channel(&self.channel) {
            for idx in 0..ch.signal_count() {
                if !ch.binary(idx).is_empty() {
                    self.captured.lock().unwrap().push(ch.binary(idx).to_vec());
                    ch.reset_binary(idx);
                }
            }
        }
        Ok(StepOutcome::Continue)
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn write_yaml(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn single_model_counter_runs_to_end_time() {
    let yaml = write_yaml(
        r#"
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
"#,
    );
    let mut args = RuntimeArgs::new("counter_inst", 1.0, 3.0).with_yaml_file(yaml.path());
    args.registry
        .register("Counter", || Box::new(CounterModel::new("data", "counter")));

    let mut sim = Simulation::configure(args).unwrap();
    let status = sim.run().unwrap();

    assert_eq!(status, RunStatus::Finished);
    assert_eq!(sim.stats().unwrap().ticks, 3);

    let fc = sim
        .function_channel("counter_inst", "counter_inst", "data")
        .unwrap();
    assert_eq!(fc.scalar(0), 3.0);

    // Derived UID: endpoint uid for the first instance.
    assert_eq!(sim.instance("counter_inst").unwrap().uid, 42);

    sim.exit().unwrap();
}

#[test]
fn two_instances_see_writes_one_tick_later() {
    let yaml = write_yaml(
        r#"
kind: Stack
spec:
  models:
    - name: A
      model:
        name: Writer
      channels:
        - name: data
    - name: B
      model:
        name: Probe
      channels:
        - name: data
---
kind: Model
metadata:
  name: Writer
spec:
  channels:
    - name: data
      signals:
        - signal: x
---
kind: Model
metadata:
  name: Probe
spec:
  channels:
    - name: data
      signals:
        - signal: x
"#,
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let probe_seen = Arc::clone(&seen);

    let mut args = RuntimeArgs::new("A;B", 1.0, 4.0).with_yaml_file(yaml.path());
    args.registry.register("Writer", || {
        Box::new(WriterModel {
            channel: "data".to_string(),
            signal: "x".to_string(),
            value: 1.0,
        })
    });
    args.registry.register("Probe", move || {
        Box::new(ProbeModel {
            channel: "data".to_string(),
            signal: "x".to_string(),
            seen: Arc::clone(&probe_seen),
        })
    });

    let mut sim = Simulation::configure(args).unwrap();
    let status = sim.run().unwrap();
    assert_eq!(status, RunStatus::Finished);

    // Derived UIDs follow the instance position.
    assert_eq!(sim.instance("A").unwrap().uid, 42);
    assert_eq!(sim.instance("B").unwrap().uid, 10042);

    // A's write at tick k becomes visible to B at tick k+1, never
    // within the same tick.
    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), &[0.0, 1.0, 1.0, 1.0]);

    sim.exit().unwrap();
}

#[test]
fn binding_matches_signal_table_after_exchange() {
    let yaml = write_yaml(
        r#"
kind: Stack
spec:
  models:
    - name: w
      model:
        name: Writer
      channels:
        - name: data
---
kind: Model
metadata:
  name: Writer
spec:
  channels:
    - name: data
      signals:
        - signal: x
"#,
    );
    let mut args = RuntimeArgs::new("w", 1.0, 10.0).with_yaml_file(yaml.path());
    args.registry.register("Writer", || {
        Box::new(WriterModel {
            channel: "data".to_string(),
            signal: "x".to_string(),
            value: 7.5,
        })
    });

    let mut sim = Simulation::configure(args).unwrap();
    sim.run_async().unwrap();
    sim.sync().unwrap();
    sim.sync().unwrap();

    let uid = sim.instance("w").unwrap().uid;
    let binding_value = sim.function_channel("w", "w", "data").unwrap().scalar(0);
    let slot_value = {
        let adapter = sim.controller().unwrap().adapter();
        let ch = adapter.model(uid).unwrap().channel("data").unwrap();
        ch.slot(ch.lookup("x").unwrap()).val
    };

    assert_eq!(binding_value, slot_value);
    assert_eq!(slot_value, 7.5);

    sim.exit().unwrap();
}

#[test]
fn binary_payload_handoff() {
    let yaml = write_yaml(
        r#"
kind: Stack
spec:
  models:
    - name: producer
      model:
        name: Null
      channels:
        - name: raw
    - name: consumer
      model:
        name: Capture
      channels:
        - name: raw
---
kind: Model
metadata:
  name: Null
spec:
  channels:
    - name: raw
      vector_type: binary
      signals:
        - signal: frame
---
kind: Model
metadata:
  name: Capture
spec:
  channels:
    - name: raw
      vector_type: binary
      signals:
        - signal: frame
"#,
    );

    let captured = Arc::new(Mutex::new(Vec::new()));
    let capture = Arc::clone(&captured);

    let mut args = RuntimeArgs::new("producer;consumer", 0.5, 100.0).with_yaml_file(yaml.path());
    args.registry.register("Null", || Box::new(NullModel));
    args.registry.register("Capture", move || {
        Box::new(CaptureModel {
            channel: "raw".to_string(),
            captured: Arc::clone(&capture),
        })
    });

    let mut sim = Simulation::configure(args).unwrap();
    sim.run_async().unwrap();

    sim.function_channel_mut("producer", "producer", "raw")
        .unwrap()
        .append_binary(0, &[0xDE, 0xAD, 0xBE, 0xEF]);

    sim.sync().unwrap();

    // Producer side was consumed by the exchange.
    let producer = sim.function_channel("producer", "producer", "raw").unwrap();
    assert!(producer.binary(0).is_empty());

    // Consumer read back exactly the produced bytes.
    let captured = captured.lock().unwrap();
    assert_eq!(captured.as_slice(), &[vec![0xDE, 0xAD, 0xBE, 0xEF]]);

    sim.exit().unwrap();
}

#[test]
fn model_without_channels_runs_cleanly() {
    let yaml = write_yaml(
        r#"
kind: Stack
spec:
  models:
    - name: bare
      model:
        name: Null
---
kind: Model
metadata:
  name: Null
"#,
    );
    let mut args = RuntimeArgs::new("bare", 1.0, 2.0).with_yaml_file(yaml.path());
    args.registry.register("Null", || Box::new(NullModel));

    let mut sim = Simulation::configure(args).unwrap();
    let status = sim.run().unwrap();
    assert_eq!(status, RunStatus::Finished);
    assert_eq!(sim.stats().unwrap().ticks, 2);
    sim.exit().unwrap();
}

#[test]
fn setup_exit_generation_registers_its_own_functions() {
    let yaml = write_yaml(
        r#"
kind: Stack
spec:
  models:
    - name: legacy
      model:
        name: Legacy
---
kind: Model
metadata:
  name: Legacy
"#,
    );

    let steps = Arc::new(Mutex::new(0u32));
    let exited = Arc::new(Mutex::new(false));
    let steps_in = Arc::clone(&steps);
    let exited_in = Arc::clone(&exited);

    let mut args = RuntimeArgs::new("legacy", 1.0, 3.0).with_yaml_file(yaml.path());
    args.registry.register_api("Legacy", move || {
        let steps = Arc::clone(&steps_in);
        let exited = Arc::clone(&exited_in);
        cosim::model::ModelApi::SetupExit {
            setup: Some(Box::new(move |ctx| {
                let step_size = ctx.step_size();
                ctx.register_function(
                    "legacy_work",
                    step_size,
                    Some(Box::new(move |_sv, _t, _stop| {
                        *steps.lock().unwrap() += 1;
                        Ok(StepOutcome::Continue)
                    })),
                )
            })),
            exit: Some(Box::new(move || {
                *exited.lock().unwrap() = true;
                Ok(())
            })),
        }
    });

    let mut sim = Simulation::configure(args).unwrap();
    let status = sim.run().unwrap();
    assert_eq!(status, RunStatus::Finished);
    assert_eq!(*steps.lock().unwrap(), 3);

    sim.exit().unwrap();
    assert!(*exited.lock().unwrap());
}
