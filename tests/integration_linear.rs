//! Integration tests for purely linear circuits: passthrough, sources,
//! op-amp buffering, parameter binding, dead-code pruning, and streaming
//! consistency. No Newton iteration is involved anywhere here.

use circuitkernel::{
    Expr, IdealOpAmp, InputSource, Netlist, Resistor, SimConfig, Simulation,
    VoltageSource,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One input node wired straight to the output.
fn wire() -> (Netlist, Expr, Expr) {
    let mut net = Netlist::new();
    let a = net.node("a");
    let src = InputSource::new("Vin", a, Netlist::GROUND, "in");
    let input = src.signal();
    net.add(src);
    let output = net.node_voltage("a");
    (net, input, output)
}

fn divider(r1: impl Into<Expr>, r2: impl Into<Expr>) -> (Netlist, Expr, Expr) {
    let mut net = Netlist::new();
    let a = net.node("a");
    let b = net.node("b");
    let src = InputSource::new("Vin", a, Netlist::GROUND, "in");
    let input = src.signal();
    net.add(src);
    net.add(Resistor::new("R1", a, b, r1));
    net.add(Resistor::new("R2", b, Netlist::GROUND, r2));
    let output = net.node_voltage("b");
    (net, input, output)
}

// ---------------------------------------------------------------------------
// Passthrough
// ---------------------------------------------------------------------------

#[test]
fn wire_passthrough_is_exact() {
    init_logging();
    let (net, input, output) = wire();
    let config = SimConfig::new(48_000.0).with_oversample(1).with_iterations(0);
    let mut sim = Simulation::new(&net, config).unwrap();

    let in_buf = [1.0, -1.0, 0.5];
    let mut out_buf = [0.0; 3];
    sim.process_mono(&input, &in_buf, &output, &mut out_buf).unwrap();
    assert_eq!(out_buf, in_buf, "wire should pass samples through exactly");
}

// ---------------------------------------------------------------------------
// Time-varying source
// ---------------------------------------------------------------------------

#[test]
fn sine_source_tracks_the_clock() {
    // An ideal 1 kHz sine source driving an open circuit. The clock
    // advances before each step evaluates, so sample n carries
    // sin(2π·1000·(n+1)/fs).
    init_logging();
    let fs = 48_000.0;
    let mut net = Netlist::new();
    let s = net.node("s");
    net.add(VoltageSource::sine("V1", s, Netlist::GROUND, 1.0, 1000.0));
    let output = net.node_voltage("s");

    let config = SimConfig::new(fs).with_oversample(1).with_iterations(0);
    let mut sim = Simulation::new(&net, config).unwrap();

    let n = 48;
    let mut out_buf = vec![0.0; n];
    let mut pairs = [(output, out_buf.as_mut_slice())];
    sim.process(n, &[], &mut pairs, &[]).unwrap();

    for (i, &got) in out_buf.iter().enumerate() {
        let t = (i + 1) as f64 / fs;
        let expected = (2.0 * std::f64::consts::PI * 1000.0 * t).sin();
        assert!(
            (got - expected).abs() < 1e-12,
            "sample {i}: got {got}, expected {expected}"
        );
    }
}

// ---------------------------------------------------------------------------
// Op-amp voltage follower
// ---------------------------------------------------------------------------

#[test]
fn opamp_follower_buffers_a_ramp() {
    init_logging();
    let mut net = Netlist::new();
    let p = net.node("p");
    let o = net.node("o");
    let src = InputSource::new("Vin", p, Netlist::GROUND, "in");
    let input = src.signal();
    net.add(src);
    net.add(IdealOpAmp::new("U1", p, o, o));
    let output = net.node_voltage("o");

    let config = SimConfig::new(48_000.0).with_oversample(1).with_iterations(0);
    let mut sim = Simulation::new(&net, config).unwrap();

    let in_buf = [0.0, 0.25, 0.5, 0.75, 1.0];
    let mut out_buf = [0.0; 5];
    sim.process_mono(&input, &in_buf, &output, &mut out_buf).unwrap();
    for (i, (x, y)) in in_buf.iter().zip(out_buf.iter()).enumerate() {
        assert!(
            (x - y).abs() < 1e-12,
            "follower sample {i}: input {x}, output {y}"
        );
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[test]
fn parameter_rebinding_reuses_the_kernel() {
    init_logging();
    let r1 = Expr::sym(circuitkernel::Sym::param("R1"));
    let (net, input, output) = divider(r1.clone(), 1000.0);
    let config = SimConfig::new(48_000.0).with_oversample(1).with_iterations(0);
    let mut sim = Simulation::new(&net, config).unwrap();

    let in_buf = [1.0; 4];
    let mut out_buf = [0.0; 4];

    // R1 = 1k: halves. Same signature with R1 = 3k: quarters.
    sim.process(
        4,
        &[(input.clone(), &in_buf)],
        &mut [(output.clone(), &mut out_buf)],
        &[(r1.clone(), 1000.0)],
    )
    .unwrap();
    assert!((out_buf[3] - 0.5).abs() < 1e-12, "R1=1k: {}", out_buf[3]);

    sim.process(
        4,
        &[(input, &in_buf)],
        &mut [(output, &mut out_buf)],
        &[(r1, 3000.0)],
    )
    .unwrap();
    assert!((out_buf[3] - 0.25).abs() < 1e-12, "R1=3k: {}", out_buf[3]);
}

// ---------------------------------------------------------------------------
// Component-voltage outputs
// ---------------------------------------------------------------------------

#[test]
fn component_voltage_is_requestable_as_an_output() {
    init_logging();
    let (net, input, _) = divider(1000.0, 1000.0);
    let config = SimConfig::new(48_000.0).with_oversample(1).with_iterations(0);
    let mut sim = Simulation::new(&net, config).unwrap();

    // The drop across R1 in an equal divider is half the input.
    let vr1 = sim.component_voltage("R1").unwrap();
    let in_buf = [1.0, 0.5, -1.0];
    let mut out_buf = [0.0; 3];
    sim.process_mono(&input, &in_buf, &vr1, &mut out_buf).unwrap();
    for (i, (x, y)) in in_buf.iter().zip(out_buf.iter()).enumerate() {
        assert!(
            (y - 0.5 * x).abs() < 1e-12,
            "sample {i}: drop across R1 should be {}, got {y}",
            0.5 * x
        );
    }
}

// ---------------------------------------------------------------------------
// Dead-code pruning
// ---------------------------------------------------------------------------

#[test]
fn dropping_an_output_leaves_the_rest_bit_identical() {
    use circuitkernel::Capacitor;
    init_logging();

    // RC filter with two outputs: the filtered node and the input echo.
    let build = || {
        let mut net = Netlist::new();
        let a = net.node("a");
        let b = net.node("b");
        let src = InputSource::new("Vin", a, Netlist::GROUND, "in");
        let input = src.signal();
        net.add(src);
        net.add(Resistor::new("R1", a, b, 1000.0));
        net.add(Capacitor::new("C1", b, Netlist::GROUND, 1e-6));
        let echo = net.node_voltage("a");
        let filtered = net.node_voltage("b");
        (net, input, echo, filtered)
    };
    let config = SimConfig::new(48_000.0).with_oversample(2).with_iterations(0);

    let in_buf: Vec<f64> = (0..64).map(|i| (i as f64 * 0.3).sin()).collect();

    let (net, input, echo, filtered) = build();
    let mut sim = Simulation::new(&net, config.clone()).unwrap();
    let mut echo_both = vec![0.0; 64];
    let mut filt_both = vec![0.0; 64];
    {
        let mut outs = [
            (echo.clone(), echo_both.as_mut_slice()),
            (filtered, filt_both.as_mut_slice()),
        ];
        sim.process(64, &[(input.clone(), &in_buf)], &mut outs, &[]).unwrap();
    }

    let (net, input, echo, _) = build();
    let mut sim = Simulation::new(&net, config).unwrap();
    let mut echo_only = vec![0.0; 64];
    sim.process_mono(&input, &in_buf, &echo, &mut echo_only).unwrap();

    for i in 0..64 {
        assert_eq!(
            echo_both[i].to_bits(),
            echo_only[i].to_bits(),
            "sample {i}: dropping the filtered output changed the echo"
        );
    }
}

// ---------------------------------------------------------------------------
// Oversampling
// ---------------------------------------------------------------------------

#[test]
fn doubling_oversample_keeps_dc_output() {
    init_logging();
    let run = |oversample: usize| {
        let (net, input, output) = divider(1000.0, 1000.0);
        let config = SimConfig::new(48_000.0)
            .with_oversample(oversample)
            .with_iterations(0);
        let mut sim = Simulation::new(&net, config).unwrap();
        let in_buf = [1.0; 16];
        let mut out_buf = [0.0; 16];
        sim.process_mono(&input, &in_buf, &output, &mut out_buf).unwrap();
        out_buf
    };
    let x1 = run(1);
    let x2 = run(2);
    // Skip the first samples, where the interpolation is still ramping in
    // from the initial silence.
    for i in 4..16 {
        assert!(
            (x1[i] - x2[i]).abs() <= 1e-9,
            "sample {i}: oversample 1 gives {}, oversample 2 gives {}",
            x1[i],
            x2[i]
        );
    }
}

// ---------------------------------------------------------------------------
// Streaming consistency
// ---------------------------------------------------------------------------

#[test]
fn split_buffers_match_one_shot_processing() {
    use circuitkernel::Capacitor;
    init_logging();

    let build = || {
        let mut net = Netlist::new();
        let a = net.node("a");
        let b = net.node("b");
        let src = InputSource::new("Vin", a, Netlist::GROUND, "in");
        let input = src.signal();
        net.add(src);
        net.add(Resistor::new("R1", a, b, 1000.0));
        net.add(Capacitor::new("C1", b, Netlist::GROUND, 1e-6));
        let output = net.node_voltage("b");
        (net, input, output)
    };
    let config = SimConfig::new(48_000.0).with_oversample(2).with_iterations(0);
    let in_buf: Vec<f64> = (0..64).map(|i| (i as f64 * 0.2).sin()).collect();

    let (net, input, output) = build();
    let mut sim = Simulation::new(&net, config.clone()).unwrap();
    let mut whole = vec![0.0; 64];
    sim.process_mono(&input, &in_buf, &output, &mut whole).unwrap();

    let (net, input, output) = build();
    let mut sim = Simulation::new(&net, config).unwrap();
    let mut split = vec![0.0; 64];
    sim.process_mono(&input, &in_buf[..32], &output, &mut split[..32]).unwrap();
    sim.process_mono(&input, &in_buf[32..], &output, &mut split[32..]).unwrap();

    for i in 0..64 {
        assert_eq!(
            whole[i].to_bits(),
            split[i].to_bits(),
            "sample {i}: streaming split diverged from one-shot run"
        );
    }
}
