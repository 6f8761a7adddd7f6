//! Feature computation from windows.
//!
//! Every kind maps a sample row of length `L` to a column vector. Binned kinds
//! first truncate the row to the largest multiple of `num_bins`, split it into
//! `num_bins` equal contiguous bins and reduce each bin to one value.

use crate::core::windowing::Window;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Featurization applied to a window row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// The row unchanged
    Raw,
    /// Row minus its first sample
    Delta,
    Variance,
    Sum,
    Mean,
    Min,
    Max,
    /// Mean forward difference per bin
    Derivative,
    /// `sqrt(x^2 / num_bins)` per sample
    RootMeanSquare,
    /// Binned real-FFT magnitudes without the DC term
    Fft,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 10] = [
        FeatureKind::Raw,
        FeatureKind::Delta,
        FeatureKind::Variance,
        FeatureKind::Sum,
        FeatureKind::Mean,
        FeatureKind::Min,
        FeatureKind::Max,
        FeatureKind::Derivative,
        FeatureKind::RootMeanSquare,
        FeatureKind::Fft,
    ];

    /// Whether `num_bins` shapes the output.
    pub fn is_binned(self) -> bool {
        !matches!(self, FeatureKind::Raw | FeatureKind::Delta)
    }

    pub fn name(self) -> &'static str {
        match self {
            FeatureKind::Raw => "raw",
            FeatureKind::Delta => "delta",
            FeatureKind::Variance => "variance",
            FeatureKind::Sum => "sum",
            FeatureKind::Mean => "mean",
            FeatureKind::Min => "min",
            FeatureKind::Max => "max",
            FeatureKind::Derivative => "derivative",
            FeatureKind::RootMeanSquare => "rms",
            FeatureKind::Fft => "fft",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FeatureKind {
    type Err = FeatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "raw" => Ok(FeatureKind::Raw),
            "delta" | "x/y" => Ok(FeatureKind::Delta),
            "variance" | "var" => Ok(FeatureKind::Variance),
            "sum" => Ok(FeatureKind::Sum),
            "mean" | "avg" => Ok(FeatureKind::Mean),
            "min" => Ok(FeatureKind::Min),
            "max" => Ok(FeatureKind::Max),
            "derivative" => Ok(FeatureKind::Derivative),
            "rms" | "root_mean_square" => Ok(FeatureKind::RootMeanSquare),
            "fft" => Ok(FeatureKind::Fft),
            other => Err(FeatureError::UnknownKind(other.to_string())),
        }
    }
}

/// Featurization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub kind: FeatureKind,
    pub num_bins: usize,
    /// Sample rate in Hz, used to label FFT bins
    pub sample_rate: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            kind: FeatureKind::Variance,
            num_bins: 60,
            sample_rate: 1000.0,
        }
    }
}

impl FeatureConfig {
    /// Check `num_bins` against a row of `frame_length` samples.
    pub fn validate(&self, frame_length: usize) -> Result<(), FeatureError> {
        validate_bins(self.kind, self.num_bins, frame_length)
    }

    /// Frequency range in Hz covered by each FFT bin for a row of
    /// `frame_length` samples.
    pub fn fft_bin_ranges(&self, frame_length: usize) -> Vec<(f64, f64)> {
        if frame_length == 0 || self.num_bins == 0 {
            return Vec::new();
        }
        let resolution = self.sample_rate / frame_length as f64;
        let usable = frame_length / 2;
        let per_bin = usable / self.num_bins;

        (0..self.num_bins)
            .map(|b| {
                let lo = (1 + b * per_bin) as f64 * resolution;
                let hi = (1 + (b + 1) * per_bin) as f64 * resolution;
                (lo, hi)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureError {
    #[error("unknown feature kind '{0}'")]
    UnknownKind(String),

    #[error("num_bins must be at least 1")]
    ZeroBins,

    #[error("{kind} supports at most {max} bins for {len} samples, got {num_bins}")]
    TooManyBins {
        kind: FeatureKind,
        num_bins: usize,
        max: usize,
        len: usize,
    },

    #[error("derivative needs at least 2 samples per bin, got {bin_len}")]
    BinTooShort { bin_len: usize },

    #[error("cannot featurize an empty row")]
    Empty,
}

/// Check a bin count against a row length before featurizing.
pub fn validate_bins(kind: FeatureKind, num_bins: usize, len: usize) -> Result<(), FeatureError> {
    if !kind.is_binned() {
        return Ok(());
    }
    if num_bins == 0 {
        return Err(FeatureError::ZeroBins);
    }

    let max = match kind {
        FeatureKind::Fft => len / 2,
        _ => len,
    };
    if num_bins > max {
        return Err(FeatureError::TooManyBins {
            kind,
            num_bins,
            max,
            len,
        });
    }
    Ok(())
}

/// Featurize one sample row into a column vector.
pub fn featurize(row: &[f64], config: &FeatureConfig) -> Result<Vec<f64>, FeatureError> {
    let kind = config.kind;
    let num_bins = config.num_bins;

    if row.is_empty() {
        return Err(FeatureError::Empty);
    }
    validate_bins(kind, num_bins, row.len())?;

    let features = match kind {
        FeatureKind::Raw => row.to_vec(),
        FeatureKind::Delta => {
            let first = row[0];
            row.iter().map(|x| x - first).collect()
        }
        FeatureKind::Variance => reduce_bins(row, num_bins, |bin| Statistics::population_variance(bin)),
        FeatureKind::Sum => reduce_bins(row, num_bins, |bin| bin.iter().sum()),
        FeatureKind::Mean => reduce_bins(row, num_bins, |bin| Statistics::mean(bin)),
        FeatureKind::Min => reduce_bins(row, num_bins, |bin| Statistics::min(bin)),
        FeatureKind::Max => reduce_bins(row, num_bins, |bin| Statistics::max(bin)),
        FeatureKind::Derivative => {
            let bin_len = row.len() / num_bins;
            if bin_len < 2 {
                return Err(FeatureError::BinTooShort { bin_len });
            }
            reduce_bins(row, num_bins, |bin| {
                let steps = bin.windows(2).map(|w| w[1] - w[0]);
                Statistics::mean(steps)
            })
        }
        FeatureKind::RootMeanSquare => {
            let scale = num_bins as f64;
            binnable(row, num_bins)
                .iter()
                .map(|x| (x * x / scale).sqrt())
                .collect()
        }
        FeatureKind::Fft => fft_bins(row, num_bins),
    };

    Ok(features)
}

/// Featurize a whole window.
///
/// Raw and delta rows are concatenated channel by channel. Binned kinds first
/// truncate every channel to the binnable length, then bin across the
/// concatenated channels, so the output holds exactly `num_bins` values
/// (or the concatenated binnable length for RMS).
pub fn featurize_window(window: &Window, config: &FeatureConfig) -> Result<Vec<f64>, FeatureError> {
    let samples = window.sample_count();
    if samples == 0 {
        return Err(FeatureError::Empty);
    }

    match config.kind {
        FeatureKind::Raw | FeatureKind::Delta => {
            let mut out = Vec::with_capacity(window.channel_count() * samples);
            for row in window.rows() {
                out.extend(featurize(&row.samples[..samples], config)?);
            }
            Ok(out)
        }
        FeatureKind::Fft => {
            let flat: Vec<f64> = window
                .rows()
                .iter()
                .flat_map(|row| row.samples[..samples].iter().copied())
                .collect();
            featurize(&flat, config)
        }
        _ => {
            validate_bins(config.kind, config.num_bins, samples)?;
            let usable = samples / config.num_bins * config.num_bins;
            let flat: Vec<f64> = window
                .rows()
                .iter()
                .flat_map(|row| row.samples[..usable].iter().copied())
                .collect();
            featurize(&flat, config)
        }
    }
}

/// The row truncated to the largest multiple of `num_bins`.
fn binnable(row: &[f64], num_bins: usize) -> &[f64] {
    &row[..row.len() / num_bins * num_bins]
}

fn reduce_bins<F>(row: &[f64], num_bins: usize, reduce: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let usable = binnable(row, num_bins);
    usable.chunks_exact(usable.len() / num_bins).map(reduce).collect()
}

fn fft_bins(row: &[f64], num_bins: usize) -> Vec<f64> {
    let n = row.len();
    let mut buffer: Vec<Complex<f64>> = row.iter().map(|&x| Complex::new(x, 0.0)).collect();

    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_forward(n).process(&mut buffer);

    // One-sided spectrum without the DC term.
    let magnitudes: Vec<f64> = buffer[1..n / 2 + 1].iter().map(|c| c.norm()).collect();
    reduce_bins(&magnitudes, num_bins, |bin| bin.iter().sum())
}
