//! Transform kernel suite for the back-projection pipeline.
//!
//! The chunk iterators treat these as opaque primitives operating on
//! fixed-shape buffers: a forward 2-D real FFT over projections, the
//! FBP filter, and the two adjoint unequally-spaced FFT stages that
//! realize the back-projection geometry. `KernelSuite` is the seam a
//! device implementation would plug into; `CpuKernels` is the reference
//! suite built on rustfft plans plus Gaussian-gridding NUFFT.
//!
//! Sign and centering conventions: the forward FFT uses plain array
//! indexing and normalizes by `1/(detw*deth)`. The adjoint stages
//! evaluate positive-sign sums on centered grids; the detector-column
//! half-size offset becomes a `(-1)^kt` strength factor (the filter
//! stage has already moved the rotation axis to the detector midline),
//! and the detector-row half-size offset becomes `(-1)^j` folded into
//! the Hermitian bin weights of the 1-D stage.

use std::sync::{Arc, Mutex};

use ndarray::{Array1, Array2, Array3, ArrayView1};
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::error::{lock_mutex, LamError};
use crate::filter::FilterTable;
use crate::float_trait::LamFloat;
use crate::nufft::{
    axis_window, centered_mode_index, deapodization_table, gaussian_tau, AxisWindow, OVERSAMPLE,
    SPREAD_WIDTH,
};
use crate::orchestration::LamConfig;

// =============================================================================
// Geometry descriptors
// =============================================================================

/// Per-chunk geometry of the 2-D adjoint stage: projection angles, the
/// laminography tilt, and which detector-row frequency bins this chunk
/// covers.
#[derive(Clone)]
pub struct Usfft2dGeom<F> {
    pub theta: Arc<Array1<F>>,
    pub phi: F,
    pub bin_start: usize,
    pub bin_count: usize,
}

/// Per-chunk geometry of the 1-D adjoint stage.
#[derive(Clone, Copy)]
pub struct Usfft1dGeom<F> {
    pub phi: F,
    pub row_count: usize,
}

// =============================================================================
// Kernel suite trait
// =============================================================================

/// The four transform primitives the chunk pipeline schedules.
///
/// Implementations are negotiated against one engine geometry at
/// construction; any call with buffers of a different shape is a fatal
/// precondition violation. Calls run on whatever execution stream the
/// engine submits them to.
pub trait KernelSuite<F: LamFloat>: Send + Sync + 'static {
    /// Filter the first `count` projections in place (padded
    /// frequency-domain filtering with the rotation-center phase).
    fn fbp_filter(
        &self,
        data: &mut Array3<F>,
        shifts: ArrayView1<F>,
        count: usize,
    ) -> Result<(), LamError>;

    /// Forward 2-D FFT of the first `count` projections, real to
    /// half-spectrum, normalized by `1/(detw*deth)`.
    fn fft2d_fwd(
        &self,
        dst: &mut Array3<Complex<F>>,
        src: &Array3<F>,
        count: usize,
    ) -> Result<(), LamError>;

    /// Adjoint 2-D USFFT of one chunk of detector-row frequency bins
    /// onto the centered `[n1, n2]` cross-section grid.
    fn usfft2d_adj(
        &self,
        dst: &mut Array3<Complex<F>>,
        src: &Array3<Complex<F>>,
        geom: &Usfft2dGeom<F>,
    ) -> Result<(), LamError>;

    /// Adjoint 1-D USFFT along the reconstruction axis for one chunk of
    /// cross-section rows.
    fn usfft1d_adj(
        &self,
        dst: &mut Array3<F>,
        src: &Array3<Complex<F>>,
        geom: &Usfft1dGeom<F>,
    ) -> Result<(), LamError>;
}

// =============================================================================
// FFT plan cache
// =============================================================================

/// Pre-computed FFT plans shared by every chunk of a reconstruction.
pub struct LamPlans<F: LamFloat> {
    /// Forward plan along the detector width.
    pub fwd_detw: Arc<dyn Fft<F>>,
    /// Forward plan along the detector height.
    pub fwd_deth: Arc<dyn Fft<F>>,
    /// Forward plan on the padded filtering grid.
    pub fwd_ne: Arc<dyn Fft<F>>,
    /// Inverse plan on the padded filtering grid.
    pub inv_ne: Arc<dyn Fft<F>>,
    /// Positive-sign plans over the oversampled NUFFT fine grids.
    pub inv_fine_n0: Arc<dyn Fft<F>>,
    pub inv_fine_n1: Arc<dyn Fft<F>>,
    pub inv_fine_n2: Arc<dyn Fft<F>>,
    /// Largest in-place scratch requirement across all plans.
    pub scratch_len: usize,
}

impl<F: LamFloat> LamPlans<F> {
    pub fn new(detw: usize, deth: usize, ne: usize, n0: usize, n1: usize, n2: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fwd_detw = planner.plan_fft_forward(detw);
        let fwd_deth = planner.plan_fft_forward(deth);
        let fwd_ne = planner.plan_fft_forward(ne);
        let inv_ne = planner.plan_fft_inverse(ne);
        let inv_fine_n0 = planner.plan_fft_inverse(OVERSAMPLE * n0);
        let inv_fine_n1 = planner.plan_fft_inverse(OVERSAMPLE * n1);
        let inv_fine_n2 = planner.plan_fft_inverse(OVERSAMPLE * n2);
        let scratch_len = [
            fwd_detw.get_inplace_scratch_len(),
            fwd_deth.get_inplace_scratch_len(),
            fwd_ne.get_inplace_scratch_len(),
            inv_ne.get_inplace_scratch_len(),
            inv_fine_n0.get_inplace_scratch_len(),
            inv_fine_n1.get_inplace_scratch_len(),
            inv_fine_n2.get_inplace_scratch_len(),
        ]
        .into_iter()
        .max()
        .unwrap_or(0);
        Self {
            fwd_detw,
            fwd_deth,
            fwd_ne,
            inv_ne,
            inv_fine_n0,
            inv_fine_n1,
            inv_fine_n2,
            scratch_len,
        }
    }
}

// =============================================================================
// CPU reference suite
// =============================================================================

/// Work buffers reused across kernel calls, allocated once at
/// construction. Only the compute stream invokes kernels, so the lock
/// is uncontended; it exists to keep the suite shareable.
struct KernelScratch<F: LamFloat> {
    /// 2x oversampled fine grid of the 2-D adjoint stage.
    fine2d: Array2<Complex<F>>,
    /// 2x oversampled fine grid of the 1-D adjoint stage.
    fine1d: Vec<Complex<F>>,
    /// Half-spectrum intermediate of the forward FFT (rows done, columns
    /// pending).
    spec_rows: Array2<Complex<F>>,
    /// General FFT work line, sized for the longest axis touched.
    line: Vec<Complex<F>>,
    /// rustfft in-place scratch.
    fft: Vec<Complex<F>>,
}

/// CPU reference implementation of the kernel suite.
pub struct CpuKernels<F: LamFloat> {
    ntheta: usize,
    deth: usize,
    detw: usize,
    kw: usize,
    kh: usize,
    n0: usize,
    n1: usize,
    n2: usize,
    phi: F,
    plans: LamPlans<F>,
    filter: FilterTable<F>,
    /// Deapodization tables per output axis.
    apod_n0: Vec<F>,
    apod_n1: Vec<F>,
    apod_n2: Vec<F>,
    /// NUFFT spreading variances per output axis.
    tau_n1: F,
    tau_n2: F,
    /// Spreading windows of the 1-D stage, one per detector-row
    /// frequency bin (column independent, so computed once).
    z_windows: Vec<AxisWindow<F>>,
    /// Hermitian fold weights of the 1-D stage: `beta_j * (-1)^j`.
    z_fold: Vec<F>,
    scratch: Mutex<KernelScratch<F>>,
}

impl<F: LamFloat> CpuKernels<F> {
    pub fn new(cfg: &LamConfig<F>) -> Result<Self, LamError> {
        cfg.validate()?;
        let (n0, n1, n2) = (cfg.n0, cfg.n1, cfg.n2);
        let (ntheta, deth, detw) = (cfg.ntheta, cfg.deth, cfg.detw);
        let (kw, kh) = (cfg.kw(), cfg.kh());
        let phi = cfg.phi();

        let filter = FilterTable::new(cfg.filter, detw, cfg.center)?;
        let ne = filter.ne();
        let plans = LamPlans::new(detw, deth, ne, n0, n1, n2);

        let tau_n0 = gaussian_tau::<F>(n0);
        let tau_n1 = gaussian_tau::<F>(n1);
        let tau_n2 = gaussian_tau::<F>(n2);
        let apod_n0 = deapodization_table(n0, OVERSAMPLE * n0, tau_n0);
        let apod_n1 = deapodization_table(n1, OVERSAMPLE * n1, tau_n1);
        let apod_n2 = deapodization_table(n2, OVERSAMPLE * n2, tau_n2);

        let sin_phi = phi.sin();
        let z_windows = (0..kh)
            .map(|j| {
                let nu_z = F::usize_as(j) / F::usize_as(deth) * sin_phi;
                axis_window(nu_z, OVERSAMPLE * n0, tau_n0)
            })
            .collect();
        let z_fold = (0..kh)
            .map(|j| {
                let beta = if j == 0 || j == deth / 2 {
                    F::one()
                } else {
                    F::from_f64_c(2.0)
                };
                if j % 2 == 0 {
                    beta
                } else {
                    -beta
                }
            })
            .collect();

        let line_len = ne
            .max(deth)
            .max(OVERSAMPLE * n1)
            .max(OVERSAMPLE * n2);
        let scratch = KernelScratch {
            fine2d: Array2::zeros((OVERSAMPLE * n1, OVERSAMPLE * n2)),
            fine1d: vec![Complex::new(F::zero(), F::zero()); OVERSAMPLE * n0],
            spec_rows: Array2::zeros((deth, kw)),
            line: vec![Complex::new(F::zero(), F::zero()); line_len],
            fft: vec![Complex::new(F::zero(), F::zero()); plans.scratch_len],
        };

        Ok(Self {
            ntheta,
            deth,
            detw,
            kw,
            kh,
            n0,
            n1,
            n2,
            phi,
            plans,
            filter,
            apod_n0,
            apod_n1,
            apod_n2,
            tau_n1,
            tau_n2,
            z_windows,
            z_fold,
            scratch: Mutex::new(scratch),
        })
    }

    pub fn filter_table(&self) -> &FilterTable<F> {
        &self.filter
    }
}

/// Spread one strength over the separable 2-D Gaussian footprint.
#[inline]
fn spread_2d<F: LamFloat>(
    fine: &mut Array2<Complex<F>>,
    wy: &AxisWindow<F>,
    wx: &AxisWindow<F>,
    value: Complex<F>,
) {
    for a in 0..SPREAD_WIDTH {
        let row_value = value * wy.weights[a];
        let iy = wy.indices[a];
        for b in 0..SPREAD_WIDTH {
            fine[[iy, wx.indices[b]]] += row_value * wx.weights[b];
        }
    }
}

impl<F: LamFloat> KernelSuite<F> for CpuKernels<F> {
    fn fbp_filter(
        &self,
        data: &mut Array3<F>,
        shifts: ArrayView1<F>,
        count: usize,
    ) -> Result<(), LamError> {
        let dim = data.dim();
        if dim.1 != self.deth || dim.2 != self.detw || count > dim.0 {
            return Err(LamError::shape(
                "fbp_filter projection slot",
                &[count, self.deth, self.detw],
                &[dim.0, dim.1, dim.2],
            ));
        }
        if shifts.len() < count {
            return Err(LamError::shape(
                "fbp_filter shifts",
                &[count],
                &[shifts.len()],
            ));
        }
        let ne = self.filter.ne();
        let pad = self.filter.pad();
        let inv_ne = F::one() / F::usize_as(ne);

        let mut scratch = lock_mutex(&self.scratch, "kernel scratch")?;
        let KernelScratch {
            ref mut line,
            ref mut fft,
            ..
        } = *scratch;
        for t in 0..count {
            let weights = self.filter.weight_line(shifts[t]);
            for r in 0..self.deth {
                // Edge-replicate pad into the extended line.
                let first = data[[t, r, 0]];
                let last = data[[t, r, self.detw - 1]];
                for item in line[..pad].iter_mut() {
                    *item = Complex::new(first, F::zero());
                }
                for i in 0..self.detw {
                    line[pad + i] = Complex::new(data[[t, r, i]], F::zero());
                }
                for item in line[pad + self.detw..ne].iter_mut() {
                    *item = Complex::new(last, F::zero());
                }

                self.plans.fwd_ne.process_with_scratch(&mut line[..ne], fft);
                for (sample, w) in line[..ne].iter_mut().zip(&weights) {
                    *sample = *sample * *w;
                }
                self.plans.inv_ne.process_with_scratch(&mut line[..ne], fft);

                // Crop the original window back, in place.
                for i in 0..self.detw {
                    data[[t, r, i]] = line[pad + i].re * inv_ne;
                }
            }
        }
        Ok(())
    }

    fn fft2d_fwd(
        &self,
        dst: &mut Array3<Complex<F>>,
        src: &Array3<F>,
        count: usize,
    ) -> Result<(), LamError> {
        let sdim = src.dim();
        let ddim = dst.dim();
        if sdim.1 != self.deth || sdim.2 != self.detw || count > sdim.0 {
            return Err(LamError::shape(
                "fft2d_fwd source slot",
                &[count, self.deth, self.detw],
                &[sdim.0, sdim.1, sdim.2],
            ));
        }
        if ddim.1 != self.deth || ddim.2 != self.kw || count > ddim.0 {
            return Err(LamError::shape(
                "fft2d_fwd destination slot",
                &[count, self.deth, self.kw],
                &[ddim.0, ddim.1, ddim.2],
            ));
        }
        let norm = F::one() / F::usize_as(self.detw * self.deth);

        let mut scratch = lock_mutex(&self.scratch, "kernel scratch")?;
        let KernelScratch {
            ref mut spec_rows,
            ref mut line,
            ref mut fft,
            ..
        } = *scratch;
        for t in 0..count {
            // 1. Real-to-half-spectrum transform of every detector row.
            for r in 0..self.deth {
                for i in 0..self.detw {
                    line[i] = Complex::new(src[[t, r, i]], F::zero());
                }
                self.plans
                    .fwd_detw
                    .process_with_scratch(&mut line[..self.detw], fft);
                for c in 0..self.kw {
                    spec_rows[[r, c]] = line[c];
                }
            }
            // 2. Full transform down every kept column.
            for c in 0..self.kw {
                for r in 0..self.deth {
                    line[r] = spec_rows[[r, c]];
                }
                self.plans
                    .fwd_deth
                    .process_with_scratch(&mut line[..self.deth], fft);
                for r in 0..self.deth {
                    dst[[t, r, c]] = line[r] * norm;
                }
            }
        }
        Ok(())
    }

    fn usfft2d_adj(
        &self,
        dst: &mut Array3<Complex<F>>,
        src: &Array3<Complex<F>>,
        geom: &Usfft2dGeom<F>,
    ) -> Result<(), LamError> {
        let sdim = src.dim();
        let ddim = dst.dim();
        if sdim.0 != 2 * self.ntheta || sdim.2 != self.kw || geom.bin_count > sdim.1 {
            return Err(LamError::shape(
                "usfft2d_adj source slot",
                &[2 * self.ntheta, geom.bin_count, self.kw],
                &[sdim.0, sdim.1, sdim.2],
            ));
        }
        if ddim.0 != self.n1 || ddim.2 != self.n2 || geom.bin_count > ddim.1 {
            return Err(LamError::shape(
                "usfft2d_adj destination slot",
                &[self.n1, geom.bin_count, self.n2],
                &[ddim.0, ddim.1, ddim.2],
            ));
        }
        if geom.theta.len() != self.ntheta {
            return Err(LamError::shape(
                "usfft2d_adj angles",
                &[self.ntheta],
                &[geom.theta.len()],
            ));
        }
        if geom.bin_start + geom.bin_count > self.kh {
            return Err(LamError::shape(
                "usfft2d_adj bin range",
                &[self.kh],
                &[geom.bin_start + geom.bin_count],
            ));
        }
        let dethc = sdim.1;
        let cos_phi = geom.phi.cos();
        let nf1 = OVERSAMPLE * self.n1;
        let nf2 = OVERSAMPLE * self.n2;
        let trig: Vec<(F, F)> = geom.theta.iter().map(|&th| (th.cos(), th.sin())).collect();

        let mut scratch = lock_mutex(&self.scratch, "kernel scratch")?;
        let KernelScratch {
            ref mut fine2d,
            ref mut line,
            ref mut fft,
            ..
        } = *scratch;
        for l in 0..geom.bin_count {
            let j = geom.bin_start + l;
            let nu_q = F::usize_as(j) / F::usize_as(self.deth) * cos_phi;
            fine2d.fill(Complex::new(F::zero(), F::zero()));

            // 1. Spread every (theta, kt) sample of this bin, primary
            //    block plus Hermitian mirror block at negated kt.
            for (t, &(cos_t, sin_t)) in trig.iter().enumerate() {
                for kt in 0..self.kw {
                    let nu_t = F::usize_as(kt) / F::usize_as(self.detw);
                    let sign = if kt % 2 == 0 { F::one() } else { -F::one() };

                    let ky = nu_t * sin_t + nu_q * cos_t;
                    let kx = nu_t * cos_t - nu_q * sin_t;
                    let value = src[[t, l, kt]] * sign;
                    let wy = axis_window(ky, nf1, self.tau_n1);
                    let wx = axis_window(kx, nf2, self.tau_n2);
                    spread_2d(fine2d, &wy, &wx, value);

                    // Columns 0 and detw/2 are self-paired in the half
                    // spectrum; mirroring them would double count.
                    if kt == 0 || kt == self.detw / 2 {
                        continue;
                    }
                    let mirror = src[[self.ntheta + t, dethc - 1 - l, kt]].conj() * sign;
                    let ky_m = -nu_t * sin_t + nu_q * cos_t;
                    let kx_m = -nu_t * cos_t - nu_q * sin_t;
                    let wy_m = axis_window(ky_m, nf1, self.tau_n1);
                    let wx_m = axis_window(kx_m, nf2, self.tau_n2);
                    spread_2d(fine2d, &wy_m, &wx_m, mirror);
                }
            }

            // 2. Positive-sign FFT over the fine grid, rows then columns.
            for mut row in fine2d.rows_mut() {
                for (i, item) in line[..nf2].iter_mut().enumerate() {
                    *item = row[i];
                }
                self.plans
                    .inv_fine_n2
                    .process_with_scratch(&mut line[..nf2], fft);
                for (i, &item) in line[..nf2].iter().enumerate() {
                    row[i] = item;
                }
            }
            for c in 0..nf2 {
                for r in 0..nf1 {
                    line[r] = fine2d[[r, c]];
                }
                self.plans
                    .inv_fine_n1
                    .process_with_scratch(&mut line[..nf1], fft);
                for r in 0..nf1 {
                    fine2d[[r, c]] = line[r];
                }
            }

            // 3. Deapodize and crop onto the centered output grid.
            for i1 in 0..self.n1 {
                let fy = centered_mode_index(i1, self.n1, nf1);
                let ay = self.apod_n1[i1];
                for i2 in 0..self.n2 {
                    let fx = centered_mode_index(i2, self.n2, nf2);
                    dst[[i1, l, i2]] = fine2d[[fy, fx]] * (ay * self.apod_n2[i2]);
                }
            }
        }
        Ok(())
    }

    fn usfft1d_adj(
        &self,
        dst: &mut Array3<F>,
        src: &Array3<Complex<F>>,
        geom: &Usfft1dGeom<F>,
    ) -> Result<(), LamError> {
        let sdim = src.dim();
        let ddim = dst.dim();
        if sdim.1 != self.kh || sdim.2 != self.n2 || geom.row_count > sdim.0 {
            return Err(LamError::shape(
                "usfft1d_adj source slot",
                &[geom.row_count, self.kh, self.n2],
                &[sdim.0, sdim.1, sdim.2],
            ));
        }
        if ddim.1 != self.n0 || ddim.2 != self.n2 || geom.row_count > ddim.0 {
            return Err(LamError::shape(
                "usfft1d_adj destination slot",
                &[geom.row_count, self.n0, self.n2],
                &[ddim.0, ddim.1, ddim.2],
            ));
        }
        // The bin windows were built for the engine's tilt; a different
        // angle would need new tables.
        if (geom.phi - self.phi).abs() > F::from_f64_c(1e-9) {
            return Err(LamError::Kernel {
                kernel: "usfft1d_adj",
                message: format!(
                    "tilt angle {:?} differs from negotiated {:?}",
                    geom.phi, self.phi
                ),
            });
        }
        let nf0 = OVERSAMPLE * self.n0;
        let zero = Complex::new(F::zero(), F::zero());

        let mut scratch = lock_mutex(&self.scratch, "kernel scratch")?;
        let KernelScratch {
            ref mut fine1d,
            ref mut fft,
            ..
        } = *scratch;
        for l in 0..geom.row_count {
            for i2 in 0..self.n2 {
                fine1d.fill(zero);
                for j in 0..self.kh {
                    let value = src[[l, j, i2]] * self.z_fold[j];
                    let window = &self.z_windows[j];
                    for a in 0..SPREAD_WIDTH {
                        fine1d[window.indices[a]] += value * window.weights[a];
                    }
                }
                self.plans.inv_fine_n0.process_with_scratch(fine1d, fft);
                for i0 in 0..self.n0 {
                    let fz = centered_mode_index(i0, self.n0, nf0);
                    dst[[l, i0, i2]] = (fine1d[fz] * self.apod_n0[i0]).re;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterKind;
    use ndarray::Array3;

    /// Simple deterministic LCG for reproducible test data.
    struct SimpleLcg {
        state: u64,
    }

    impl SimpleLcg {
        fn new(seed: u64) -> Self {
            Self { state: seed }
        }

        fn next_u64(&mut self) -> u64 {
            // LCG parameters from Numerical Recipes
            self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
            self.state
        }

        fn next_f64(&mut self) -> f64 {
            let u = self.next_u64();
            ((u >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
        }
    }

    fn test_config(
        n0: usize,
        n1: usize,
        n2: usize,
        ntheta: usize,
        deth: usize,
        detw: usize,
    ) -> LamConfig<f64> {
        let mut cfg = LamConfig::<f64>::for_volume(n0, n1, n2, ntheta, deth, detw);
        cfg.filter = FilterKind::None;
        cfg
    }

    #[test]
    fn test_fft2d_fwd_impulse_spectrum() {
        let cfg = test_config(4, 4, 4, 3, 8, 8);
        let kernels = CpuKernels::new(&cfg).unwrap();
        let mut src = Array3::<f64>::zeros((3, 8, 8));
        let (r0, s0) = (3, 5);
        src[[1, r0, s0]] = 1.0;
        let mut dst = Array3::<Complex<f64>>::zeros((3, 8, 5));
        kernels.fft2d_fwd(&mut dst, &src, 3).unwrap();

        // Impulse transforms to pure phases scaled by 1/(detw*deth).
        let norm = 1.0 / 64.0;
        for j in 0..8 {
            for k in 0..5 {
                let phase =
                    -2.0 * std::f64::consts::PI * (j * r0 + k * s0) as f64 / 8.0;
                let expected = Complex::new(phase.cos(), phase.sin()) * norm;
                let got = dst[[1, j, k]];
                assert!(
                    (got - expected).norm() < 1e-12,
                    "mode ({j},{k}): {got} vs {expected}"
                );
            }
        }
        // Projections 0 and 2 were zero.
        assert!(dst.slice(ndarray::s![0, .., ..]).iter().all(|c| c.norm() == 0.0));
    }

    #[test]
    fn test_unit_filter_centered_axis_is_identity() {
        let cfg = test_config(4, 4, 4, 2, 6, 16);
        let kernels = CpuKernels::new(&cfg).unwrap();
        let mut rng = SimpleLcg::new(7);
        let mut data = Array3::<f64>::from_shape_fn((2, 6, 16), |_| rng.next_f64());
        let original = data.clone();
        let shifts = Array1::<f64>::zeros(2);
        kernels.fbp_filter(&mut data, shifts.view(), 2).unwrap();
        for (a, b) in data.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-9, "{a} vs {b}");
        }
    }

    #[test]
    fn test_filter_phase_recenters_rotation_axis() {
        // An axis one pixel right of the midline shifts content one
        // pixel left.
        let mut cfg = test_config(4, 4, 4, 1, 2, 64);
        cfg.center = 33.0;
        let kernels = CpuKernels::new(&cfg).unwrap();
        let mut data = Array3::<f64>::zeros((1, 2, 64));
        data[[0, 0, 40]] = 1.0;
        data[[0, 1, 40]] = 1.0;
        let shifts = Array1::<f64>::zeros(1);
        kernels.fbp_filter(&mut data, shifts.view(), 1).unwrap();
        for r in 0..2 {
            let row: Vec<f64> = (0..64).map(|i| data[[0, r, i]]).collect();
            let peak = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
                .map(|(i, _)| i)
                .unwrap();
            assert_eq!(peak, 39);
            assert!((row[39] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_per_projection_shift_matches_center_offset() {
        // shifts[t] = +1 must act exactly like moving the center by -1.
        let mut base = test_config(4, 4, 4, 1, 2, 32);
        base.center = 16.0;
        let shifted_kernels = CpuKernels::new(&base).unwrap();

        let mut rng = SimpleLcg::new(99);
        let data0 = Array3::<f64>::from_shape_fn((1, 2, 32), |_| rng.next_f64());

        let mut a = data0.clone();
        let shifts = Array1::<f64>::from_elem(1, 1.0);
        shifted_kernels.fbp_filter(&mut a, shifts.view(), 1).unwrap();

        let mut off_center = base.clone();
        off_center.center = 15.0;
        let center_kernels = CpuKernels::new(&off_center).unwrap();
        let mut b = data0.clone();
        let zero = Array1::<f64>::zeros(1);
        center_kernels.fbp_filter(&mut b, zero.view(), 1).unwrap();

        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_usfft1d_adj_matches_direct_sum() {
        let cfg = test_config(8, 4, 3, 2, 8, 8);
        let kernels = CpuKernels::new(&cfg).unwrap();
        let kh = 5;
        let mut rng = SimpleLcg::new(404);
        let src = Array3::<Complex<f64>>::from_shape_fn((2, kh, 3), |_| {
            Complex::new(rng.next_f64(), rng.next_f64())
        });
        let mut dst = Array3::<f64>::zeros((2, 8, 3));
        let geom = Usfft1dGeom {
            phi: cfg.phi(),
            row_count: 2,
        };
        kernels.usfft1d_adj(&mut dst, &src, &geom).unwrap();

        let sin_phi = cfg.phi().sin();
        for l in 0..2 {
            for i2 in 0..3 {
                for i0 in 0..8 {
                    let z = i0 as f64 - 4.0;
                    let mut expected = 0.0;
                    for j in 0..kh {
                        let beta = if j == 0 || j == 4 { 1.0 } else { 2.0 };
                        let fold = beta * if j % 2 == 0 { 1.0 } else { -1.0 };
                        let phase =
                            2.0 * std::f64::consts::PI * (j as f64 / 8.0) * sin_phi * z;
                        let term = src[[l, j, i2]] * Complex::new(phase.cos(), phase.sin());
                        expected += fold * term.re;
                    }
                    let got = dst[[l, i0, i2]];
                    // One gridded axis, accurate to a few 1e-6 of the row scale.
                    assert!(
                        (got - expected).abs() < 1e-4,
                        "row {l} col {i2} z {i0}: {got} vs {expected}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_usfft2d_adj_matches_direct_sum() {
        let ntheta = 3;
        let (deth, detw) = (8, 8);
        let (n1, n2) = (8, 8);
        let cfg = {
            let mut cfg = test_config(4, n1, n2, ntheta, deth, detw);
            cfg.lamino_angle = -20.0; // exercise the in-plane nu_q coupling
            cfg
        };
        let kernels = CpuKernels::new(&cfg).unwrap();
        let theta = Arc::new(Array1::from_shape_fn(ntheta, |t| {
            t as f64 * std::f64::consts::PI / ntheta as f64
        }));
        let dethc = 2;
        let mut rng = SimpleLcg::new(31415);
        let src = Array3::<Complex<f64>>::from_shape_fn((2 * ntheta, dethc, 5), |_| {
            Complex::new(rng.next_f64(), rng.next_f64())
        });
        let mut dst = Array3::<Complex<f64>>::zeros((n1, dethc, n2));
        let geom = Usfft2dGeom {
            theta: Arc::clone(&theta),
            phi: cfg.phi(),
            bin_start: 1,
            bin_count: 2,
        };
        kernels.usfft2d_adj(&mut dst, &src, &geom).unwrap();

        let cos_phi = cfg.phi().cos();
        let mut worst = 0.0f64;
        let mut scale = 1e-30f64;
        for l in 0..2 {
            let j = 1 + l;
            let nu_q = j as f64 / deth as f64 * cos_phi;
            for i1 in 0..n1 {
                let y = i1 as f64 - (n1 / 2) as f64;
                for i2 in 0..n2 {
                    let x = i2 as f64 - (n2 / 2) as f64;
                    let mut expected = Complex::new(0.0, 0.0);
                    for t in 0..ntheta {
                        let (cos_t, sin_t) = (theta[t].cos(), theta[t].sin());
                        for kt in 0..5 {
                            let nu_t = kt as f64 / detw as f64;
                            let sign = if kt % 2 == 0 { 1.0 } else { -1.0 };
                            let ky = nu_t * sin_t + nu_q * cos_t;
                            let kx = nu_t * cos_t - nu_q * sin_t;
                            let phase = 2.0 * std::f64::consts::PI * (ky * y + kx * x);
                            expected += src[[t, l, kt]]
                                * sign
                                * Complex::new(phase.cos(), phase.sin());
                            if kt == 0 || kt == 4 {
                                continue;
                            }
                            let ky_m = -nu_t * sin_t + nu_q * cos_t;
                            let kx_m = -nu_t * cos_t - nu_q * sin_t;
                            let phase_m =
                                2.0 * std::f64::consts::PI * (ky_m * y + kx_m * x);
                            expected += src[[ntheta + t, dethc - 1 - l, kt]].conj()
                                * sign
                                * Complex::new(phase_m.cos(), phase_m.sin());
                        }
                    }
                    let got = dst[[i1, l, i2]];
                    scale = scale.max(expected.norm());
                    worst = worst.max((got - expected).norm());
                }
            }
        }
        // Two gridded axes at a few 1e-6 each.
        assert!(
            worst / scale < 1e-4,
            "2-D adjoint error {} too large",
            worst / scale
        );
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let cfg = test_config(4, 4, 4, 2, 8, 8);
        let kernels = CpuKernels::new(&cfg).unwrap();
        let src = Array3::<f64>::zeros((2, 8, 6)); // wrong detw
        let mut dst = Array3::<Complex<f64>>::zeros((2, 8, 5));
        let err = kernels.fft2d_fwd(&mut dst, &src, 2).unwrap_err();
        assert!(matches!(err, LamError::ShapeMismatch { context, .. }
            if context.contains("fft2d_fwd")));

        let bad_geom = Usfft1dGeom {
            phi: cfg.phi(),
            row_count: 3, // more rows than the slot holds
        };
        let src1 = Array3::<Complex<f64>>::zeros((2, 5, 4));
        let mut dst1 = Array3::<f64>::zeros((2, 4, 4));
        assert!(kernels.usfft1d_adj(&mut dst1, &src1, &bad_geom).is_err());
    }
}
