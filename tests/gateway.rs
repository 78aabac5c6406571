//! Gateway facade scenarios: an external driver owning the time loop.

use std::io::Write;
use std::path::PathBuf;

use cosim::{Error, ModelGateway, StepOutcome};

fn gateway_yaml() -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(
        br#"
kind: Stack
spec:
  models:
    - name: gateway
      model:
        name: Gateway
      channels:
        - name: scalar
---
kind: Model
metadata:
  name: Gateway
spec:
  runtime:
    gateway: {}
  channels:
    - name: scalar
      signals:
        - signal: foo
        - signal: bar
"#,
    )
    .unwrap();
    file
}

fn setup(step_size: f64, end_time: f64) -> (ModelGateway, tempfile::NamedTempFile) {
    let yaml = gateway_yaml();
    let files: Vec<PathBuf> = vec![yaml.path().to_path_buf()];
    let gw = ModelGateway::setup("gateway", &files, None, step_size, end_time).unwrap();
    (gw, yaml)
}

#[test]
fn caller_behind_the_bus_must_catch_up() {
    let (mut gw, _yaml) = setup(0.1, 10.0);

    // The first grant window is established during setup.
    let bus = gw.bus_time().unwrap();
    assert!((bus - 0.1).abs() < 1e-9);

    // A caller behind the bus gets the feedback signal and no work is
    // done.
    let err = gw.sync(0.05).unwrap_err();
    assert!(matches!(err, Error::GatewayBehind));
    assert!((gw.bus_time().unwrap() - 0.1).abs() < 1e-9);

    // Once caught up, the bus advances strictly past the caller.
    let outcome = gw.sync(0.2).unwrap();
    assert_eq!(outcome, StepOutcome::Continue);
    assert!(gw.bus_time().unwrap() > 0.2);

    gw.exit().unwrap();
}

#[test]
fn scalar_roundtrip_through_the_bus() {
    let (mut gw, _yaml) = setup(0.1, 10.0);

    gw.set_scalar("scalar", "foo", 42.0).unwrap();
    gw.set_scalar("scalar", "bar", -3.5).unwrap();
    gw.sync(0.1).unwrap();

    assert_eq!(gw.scalar("scalar", "foo").unwrap(), 42.0);
    assert_eq!(gw.scalar("scalar", "bar").unwrap(), -3.5);

    gw.exit().unwrap();
}

#[test]
fn driver_loop_in_gateway_style() {
    let (mut gw, _yaml) = setup(0.05, 1.0);

    let mut model_time = 0.0;
    let mut foo = 0.0;
    let mut behind = 0;
    while model_time < 0.5 {
        gw.set_scalar("scalar", "foo", foo).unwrap();
        match gw.sync(model_time) {
            Err(Error::GatewayBehind) => behind += 1,
            other => {
                other.unwrap();
            }
        }
        foo = gw.scalar("scalar", "foo").unwrap() + 1.0;
        model_time += 0.05;
    }

    // The driver started behind the primed bus and recovered.
    assert!(behind >= 1);
    assert!(foo > 1.0);

    gw.exit().unwrap();
}

#[test]
fn sync_reports_end_of_run() {
    let (mut gw, _yaml) = setup(1.0, 2.0);

    let outcome = gw.sync(1.0).unwrap();
    assert_eq!(outcome, StepOutcome::Finished);

    gw.exit().unwrap();
}

#[test]
fn exit_is_idempotent() {
    let (mut gw, _yaml) = setup(0.1, 10.0);

    assert!(gw.is_running());
    gw.exit().unwrap();
    assert!(!gw.is_running());

    // A second exit returns success without side effects.
    gw.exit().unwrap();

    // Operations after exit report a configuration error.
    let err = gw.sync(1.0).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    let err = gw.scalar("scalar", "foo").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn unknown_signal_is_an_error() {
    let (mut gw, _yaml) = setup(0.1, 10.0);

    assert!(gw.scalar("scalar", "ghost").is_err());
    assert!(gw.set_scalar("ghost", "foo", 1.0).is_err());

    gw.exit().unwrap();
}
