//! WAV file I/O for testing and offline rendering.
//!
//! Uses `hound` to write simulated output to WAV files so circuits can be
//! auditioned without a host audio engine, plus the test-signal generators
//! the integration suites share.

use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::algebra::Expr;
use crate::error::{Error, Result};
use crate::simulation::Simulation;

/// Default render rate: 48 kHz, 32-bit float, mono.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

fn wav_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    }
}

/// Generate a sine test signal.
pub fn sine_wave(freq_hz: f64, amplitude: f64, n: usize, sample_rate: f64) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let t = i as f64 / sample_rate;
            amplitude * (2.0 * std::f64::consts::PI * freq_hz * t).sin()
        })
        .collect()
}

/// Generate a constant step signal.
pub fn step_signal(level: f64, n: usize) -> Vec<f64> {
    vec![level; n]
}

/// Stream an input buffer through a simulation and write the output to a
/// WAV file.
pub fn render_to_wav(
    sim: &mut Simulation,
    input: &Expr,
    samples: &[f64],
    output: &Expr,
    path: &Path,
    sample_rate: u32,
) -> Result<()> {
    let mut out = vec![0.0; samples.len()];
    sim.process_mono(input, samples, output, &mut out)?;

    let mut writer = WavWriter::create(path, wav_spec(sample_rate))
        .map_err(|e| Error::Build(format!("wav create: {e}")))?;
    for &s in &out {
        writer
            .write_sample(s as f32)
            .map_err(|e| Error::Build(format!("wav write: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| Error::Build(format!("wav finalize: {e}")))?;
    Ok(())
}

/// Write raw f64 samples to a WAV file.
pub fn write_wav(samples: &[f64], path: &Path, sample_rate: u32) -> Result<()> {
    let mut writer = WavWriter::create(path, wav_spec(sample_rate))
        .map_err(|e| Error::Build(format!("wav create: {e}")))?;
    for &s in samples {
        writer
            .write_sample(s as f32)
            .map_err(|e| Error::Build(format!("wav write: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| Error::Build(format!("wav finalize: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
