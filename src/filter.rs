//! FBP filter tables and the rotation-center phase correction.
//!
//! Filtering runs on projections before the forward-FFT stage: each
//! detector line is edge-padded to four times the detector width,
//! multiplied in the frequency domain by a ramp-family table combined
//! with a linear phase encoding the rotation-center offset (and any
//! per-projection sub-pixel shift), then cropped back. The phase term
//! moves the rotation axis to the detector midline, which is the
//! reference the adjoint stages assume.

use std::str::FromStr;

use ndarray::Array1;
use rustfft::num_complex::Complex;

use crate::error::LamError;
use crate::float_trait::LamFloat;

/// Extension factor of the padded filtering grid.
const PAD_FACTOR: usize = 4;

/// Ramp-family filter selection, by the names the reconstruction CLI
/// vocabulary uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterKind {
    /// Unit table: no spectral weighting, phase correction only.
    None,
    /// Pure ramp |f|.
    Ramp,
    /// Shepp-Logan: ramp rolled off by sinc.
    Shepp,
    /// Parzen window on the ramp.
    #[default]
    Parzen,
    /// Hann window on the ramp.
    Hann,
}

impl FromStr for FilterKind {
    type Err = LamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(FilterKind::None),
            "ramp" => Ok(FilterKind::Ramp),
            "shepp" => Ok(FilterKind::Shepp),
            "parzen" => Ok(FilterKind::Parzen),
            "hann" => Ok(FilterKind::Hann),
            other => Err(LamError::Config(format!(
                "unknown filter kind `{other}` (expected none|ramp|shepp|parzen|hann)"
            ))),
        }
    }
}

impl std::fmt::Display for FilterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FilterKind::None => "none",
            FilterKind::Ramp => "ramp",
            FilterKind::Shepp => "shepp",
            FilterKind::Parzen => "parzen",
            FilterKind::Hann => "hann",
        };
        f.write_str(name)
    }
}

/// Precomputed filter table on the extended real-frequency grid,
/// computed once at engine construction and shared by every chunk of the
/// forward-FFT stage.
#[derive(Debug, Clone)]
pub struct FilterTable<F> {
    kind: FilterKind,
    detw: usize,
    ne: usize,
    center: F,
    /// Table values on `t = k / ne` for `k = 0 ..= ne/2`.
    values: Array1<F>,
}

impl<F: LamFloat> FilterTable<F> {
    pub fn new(kind: FilterKind, detw: usize, center: F) -> Result<Self, LamError> {
        if detw == 0 || detw % 2 != 0 {
            return Err(LamError::Config(format!(
                "filter table requires an even detector width, got {detw}"
            )));
        }
        let ne = PAD_FACTOR * detw;
        let half = F::from_f64_c(0.5);
        let two = F::from_f64_c(2.0);
        let values = Array1::from_shape_fn(ne / 2 + 1, |k| {
            let t = F::usize_as(k) / F::usize_as(ne);
            match kind {
                FilterKind::None => F::one(),
                FilterKind::Ramp => t,
                // t * sinc(t) with sinc(x) = sin(pi x) / (pi x)
                FilterKind::Shepp => (F::PI * t).sin() / F::PI,
                FilterKind::Parzen => {
                    let w = F::one() - two * t;
                    t * w * w * w
                }
                FilterKind::Hann => t * (F::one() + (two * F::PI * t).cos()) * half,
            }
        });
        Ok(Self {
            kind,
            detw,
            ne,
            center,
            values,
        })
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    /// Extended width of the padded filtering grid.
    pub fn ne(&self) -> usize {
        self.ne
    }

    /// Pad added on each side of a detector line.
    pub fn pad(&self) -> usize {
        self.ne / 2 - self.detw / 2
    }

    /// Half-spectrum table values.
    pub fn values(&self) -> &Array1<F> {
        &self.values
    }

    /// Full-length frequency weights for one projection: the table
    /// combined with the center/shift phase
    /// `exp(-2 pi i t (-center + shift + detw/2))`, Hermitian-extended
    /// to all `ne` modes so it can multiply a full complex spectrum.
    pub fn weight_line(&self, shift: F) -> Vec<Complex<F>> {
        let two_pi = F::from_f64_c(2.0) * F::PI;
        let offset = -self.center + shift + F::usize_as(self.detw) / F::from_f64_c(2.0);
        let half = self.ne / 2;
        let mut line = vec![Complex::new(F::zero(), F::zero()); self.ne];
        for k in 0..=half {
            let t = F::usize_as(k) / F::usize_as(self.ne);
            let phase = -two_pi * t * offset;
            line[k] = Complex::new(phase.cos(), phase.sin()) * self.values[k];
        }
        for k in half + 1..self.ne {
            line[k] = line[self.ne - k].conj();
        }
        line
    }
}
