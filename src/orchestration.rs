//! Chunked pipelined back-projection engine.
//!
//! `LamEngine` owns everything one reconstruction geometry needs: the
//! stage-boundary host buffers, the six double-buffered transfer rings,
//! the three execution streams, and the host worker pool. All memory is
//! laid out through an `ArenaPlan` and verified disjoint before a
//! single element is allocated. `reconstruct` then runs:
//! 1. Parallel stage-in of the projections
//! 2. FBP filter + forward 2-D FFT over projection chunks
//! 3. Adjoint 2-D USFFT over detector-row frequency bin chunks
//! 4. Adjoint 1-D USFFT over cross-section row chunks
//! 5. Transpose into output order and parallel write fan-out

use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ndarray::{Array1, Array3, ArrayView1, ArrayView3};
use rustfft::num_complex::Complex;

use crate::buffers::{ArenaPlan, DoubleBuffer};
use crate::error::{lock_mutex, LamError};
use crate::filter::FilterKind;
use crate::float_trait::LamFloat;
use crate::host_ops::{copy_into, copy_transposed, write_parallel, ChunkWriter, VolumeSink};
use crate::pipeline::{fft2_chunks, usfft1d_chunks, usfft2d_chunks};
use crate::stream::StreamTrio;
use crate::transforms::{CpuKernels, KernelSuite};

// =============================================================================
// Constants
// =============================================================================

/// Default chunk length along each stage's chunk axis.
const DEFAULT_CHUNK: usize = 8;

/// Default number of host copy/transpose/write workers.
const DEFAULT_WRITE_THREADS: usize = 8;

const PROFILE_TIMING_ENV: &str = "LAMFOURIER_PROFILE";

// =============================================================================
// Types
// =============================================================================

/// Reconstruction geometry and engine tuning.
///
/// Dimensions follow the projection stack layout `[ntheta, deth, detw]`
/// and the output volume layout `[n0, n1, n2]` (reconstruction axis
/// first). The three chunk lengths bound device-side memory; they trade
/// transfer granularity against overlap and never affect the result.
#[derive(Debug, Clone)]
pub struct LamConfig<F: LamFloat> {
    /// Output depth along the reconstruction axis.
    pub n0: usize,
    /// Output cross-section height.
    pub n1: usize,
    /// Output cross-section width.
    pub n2: usize,
    /// Number of projection angles.
    pub ntheta: usize,
    /// Detector height in pixels. Must be even.
    pub deth: usize,
    /// Detector width in pixels. Must be even.
    pub detw: usize,
    /// Chunk length along the cross-section row axis. Default: 8
    pub n1c: usize,
    /// Chunk length along the detector-row frequency bin axis. Default: 8
    pub dethc: usize,
    /// Chunk length along the projection angle axis. Default: 8
    pub nthetac: usize,
    /// Rotation axis position in detector columns. Default: detw / 2
    pub center: F,
    /// Laminography tilt in degrees away from the beam normal.
    /// Zero gives plain parallel-beam geometry. Default: 0
    pub lamino_angle: F,
    /// Reconstruction filter. Default: Parzen
    pub filter: FilterKind,
    /// Host copy/transpose/write worker count. Default: 8
    pub max_write_threads: usize,
}

impl<F: LamFloat> LamConfig<F> {
    /// Configuration for the given volume and projection stack sizes,
    /// with default chunking, a centered rotation axis, and the Parzen
    /// filter.
    pub fn for_volume(
        n0: usize,
        n1: usize,
        n2: usize,
        ntheta: usize,
        deth: usize,
        detw: usize,
    ) -> Self {
        let kh = deth / 2 + 1;
        Self {
            n0,
            n1,
            n2,
            ntheta,
            deth,
            detw,
            n1c: DEFAULT_CHUNK.min(n1.max(1)),
            dethc: DEFAULT_CHUNK.min(kh),
            nthetac: DEFAULT_CHUNK.min(ntheta.max(1)),
            center: F::from_f64_c(detw as f64 / 2.0),
            lamino_angle: F::zero(),
            filter: FilterKind::default(),
            max_write_threads: DEFAULT_WRITE_THREADS,
        }
    }

    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<(), LamError> {
        let positive = [
            (self.n0, "n0"),
            (self.n1, "n1"),
            (self.n2, "n2"),
            (self.ntheta, "ntheta"),
            (self.deth, "deth"),
            (self.detw, "detw"),
        ];
        for (value, name) in positive {
            if value == 0 {
                return Err(LamError::Config(format!("{name} must be > 0")));
            }
        }
        if self.detw % 2 != 0 || self.deth % 2 != 0 {
            return Err(LamError::Config(format!(
                "detector sizes must be even, got {}x{}",
                self.deth, self.detw
            )));
        }
        if self.nthetac == 0 || self.nthetac > self.ntheta {
            return Err(LamError::Config(format!(
                "nthetac must be in 1..={}, got {}",
                self.ntheta, self.nthetac
            )));
        }
        if self.dethc == 0 || self.dethc > self.kh() {
            return Err(LamError::Config(format!(
                "dethc must be in 1..={}, got {}",
                self.kh(),
                self.dethc
            )));
        }
        if self.n1c == 0 || self.n1c > self.n1 {
            return Err(LamError::Config(format!(
                "n1c must be in 1..={}, got {}",
                self.n1, self.n1c
            )));
        }
        if !self.center.is_finite()
            || self.center < F::zero()
            || self.center >= F::usize_as(self.detw)
        {
            return Err(LamError::Config(format!(
                "center must lie within the detector width 0..{}, got {:?}",
                self.detw, self.center
            )));
        }
        if !self.lamino_angle.is_finite() {
            return Err(LamError::Config("lamino_angle must be finite".to_string()));
        }
        if self.max_write_threads == 0 {
            return Err(LamError::Config(
                "max_write_threads must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Width of the detector-column half spectrum.
    pub fn kw(&self) -> usize {
        self.detw / 2 + 1
    }

    /// Number of detector-row frequency bins.
    pub fn kh(&self) -> usize {
        self.deth / 2 + 1
    }

    /// Beam tilt in radians: `pi/2` plus the laminography angle.
    pub fn phi(&self) -> F {
        F::PI / F::from_f64_c(2.0) + self.lamino_angle * F::PI / F::from_f64_c(180.0)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn resolve_profile_timing() -> bool {
    std::env::var(PROFILE_TIMING_ENV)
        .ok()
        .map(|value| {
            let v = value.trim();
            v == "1"
                || v.eq_ignore_ascii_case("true")
                || v.eq_ignore_ascii_case("yes")
                || v.eq_ignore_ascii_case("on")
        })
        .unwrap_or(false)
}

#[derive(Default, Clone, Copy)]
struct StageTimings {
    stage_in_ns: u128,
    fft2_ns: u128,
    usfft2d_ns: u128,
    usfft1d_ns: u128,
    transpose_ns: u128,
    write_ns: u128,
}

/// One key=value line covering the whole reconstruction, including the
/// verified buffer footprint.
fn profile_line(
    shape: [usize; 3],
    ntheta: usize,
    footprint: usize,
    wall_ns: u128,
    timings: &StageTimings,
) -> String {
    let to_ms = |ns: u128| ns as f64 / 1_000_000.0;
    format!(
        "lamfourier_profile shape={}x{}x{} ntheta={} footprint_bytes={} wall_ms={:.3} stage_in_ms={:.3} fft2_ms={:.3} usfft2d_ms={:.3} usfft1d_ms={:.3} transpose_ms={:.3} write_ms={:.3}",
        shape[0],
        shape[1],
        shape[2],
        ntheta,
        footprint,
        to_ms(wall_ns),
        to_ms(timings.stage_in_ns),
        to_ms(timings.fft2_ns),
        to_ms(timings.usfft2d_ns),
        to_ms(timings.usfft1d_ns),
        to_ms(timings.transpose_ns),
        to_ms(timings.write_ns),
    )
}

// =============================================================================
// Engine
// =============================================================================

/// A reconstruction engine negotiated for one geometry.
///
/// Construction allocates every host buffer and ring slot the pipeline
/// will touch and spawns the three execution streams; `reconstruct` can
/// then be called any number of times without further allocation of
/// bulk memory. The engine is generic over the kernel suite so a device
/// implementation can replace [`CpuKernels`] wholesale.
pub struct LamEngine<F: LamFloat, K: KernelSuite<F> = CpuKernels<F>> {
    cfg: LamConfig<F>,
    kernels: Arc<K>,
    streams: StreamTrio,
    pool: rayon::ThreadPool,
    footprint: usize,
    // Stage-boundary host buffers.
    host_proj: Arc<Mutex<Array3<F>>>,
    host_spectrum: Arc<Mutex<Array3<Complex<F>>>>,
    host_bins: Arc<Mutex<Array3<Complex<F>>>>,
    host_volume: Arc<Mutex<Array3<F>>>,
    host_out: Arc<Mutex<Array3<F>>>,
    // Double-buffered transfer rings, one pair per stage side.
    proj_ring: Arc<DoubleBuffer<Array3<F>>>,
    spectrum_ring: Arc<DoubleBuffer<Array3<Complex<F>>>>,
    bins_src_ring: Arc<DoubleBuffer<Array3<Complex<F>>>>,
    bins_dst_ring: Arc<DoubleBuffer<Array3<Complex<F>>>>,
    cols_src_ring: Arc<DoubleBuffer<Array3<Complex<F>>>>,
    cols_dst_ring: Arc<DoubleBuffer<Array3<F>>>,
}

impl<F: LamFloat> LamEngine<F, CpuKernels<F>> {
    /// Build an engine with the CPU reference kernels.
    pub fn with_cpu_kernels(cfg: LamConfig<F>) -> Result<Self, LamError> {
        let kernels = CpuKernels::new(&cfg)?;
        Self::new(cfg, kernels)
    }
}

impl<F: LamFloat, K: KernelSuite<F>> LamEngine<F, K> {
    pub fn new(cfg: LamConfig<F>, kernels: K) -> Result<Self, LamError> {
        cfg.validate()?;
        let (n0, n1, n2) = (cfg.n0, cfg.n1, cfg.n2);
        let (ntheta, deth, detw) = (cfg.ntheta, cfg.deth, cfg.detw);
        let (kw, kh) = (cfg.kw(), cfg.kh());
        let (nthetac, dethc, n1c) = (cfg.nthetac, cfg.dethc, cfg.n1c);
        let real = mem::size_of::<F>();
        let cplx = mem::size_of::<Complex<F>>();

        // Lay out every span up front and prove the layout disjoint
        // before allocating anything.
        let mut plan = ArenaPlan::new();
        plan.reserve("host projections", real, &[ntheta, deth, detw])?;
        plan.reserve("host spectrum", cplx, &[ntheta, deth, kw])?;
        plan.reserve("host frequency bins", cplx, &[n1, kh, n2])?;
        plan.reserve("host volume", real, &[n1, n0, n2])?;
        plan.reserve("host output", real, &[n0, n1, n2])?;
        plan.reserve("projection ring slot 0", real, &[nthetac, deth, detw])?;
        plan.reserve("projection ring slot 1", real, &[nthetac, deth, detw])?;
        plan.reserve("spectrum ring slot 0", cplx, &[nthetac, deth, kw])?;
        plan.reserve("spectrum ring slot 1", cplx, &[nthetac, deth, kw])?;
        plan.reserve("bin source ring slot 0", cplx, &[2 * ntheta, dethc, kw])?;
        plan.reserve("bin source ring slot 1", cplx, &[2 * ntheta, dethc, kw])?;
        plan.reserve("cross-section ring slot 0", cplx, &[n1, dethc, n2])?;
        plan.reserve("cross-section ring slot 1", cplx, &[n1, dethc, n2])?;
        plan.reserve("column source ring slot 0", cplx, &[n1c, kh, n2])?;
        plan.reserve("column source ring slot 1", cplx, &[n1c, kh, n2])?;
        plan.reserve("column ring slot 0", real, &[n1c, n0, n2])?;
        plan.reserve("column ring slot 1", real, &[n1c, n0, n2])?;
        let footprint = plan.verify()?;

        let host_proj = Arc::new(Mutex::new(Array3::zeros((ntheta, deth, detw))));
        let host_spectrum = Arc::new(Mutex::new(Array3::zeros((ntheta, deth, kw))));
        let host_bins = Arc::new(Mutex::new(Array3::zeros((n1, kh, n2))));
        let host_volume = Arc::new(Mutex::new(Array3::zeros((n1, n0, n2))));
        let host_out = Arc::new(Mutex::new(Array3::zeros((n0, n1, n2))));
        let proj_ring = Arc::new(DoubleBuffer::new(
            Array3::zeros((nthetac, deth, detw)),
            Array3::zeros((nthetac, deth, detw)),
        ));
        let spectrum_ring = Arc::new(DoubleBuffer::new(
            Array3::zeros((nthetac, deth, kw)),
            Array3::zeros((nthetac, deth, kw)),
        ));
        let bins_src_ring = Arc::new(DoubleBuffer::new(
            Array3::zeros((2 * ntheta, dethc, kw)),
            Array3::zeros((2 * ntheta, dethc, kw)),
        ));
        let bins_dst_ring = Arc::new(DoubleBuffer::new(
            Array3::zeros((n1, dethc, n2)),
            Array3::zeros((n1, dethc, n2)),
        ));
        let cols_src_ring = Arc::new(DoubleBuffer::new(
            Array3::zeros((n1c, kh, n2)),
            Array3::zeros((n1c, kh, n2)),
        ));
        let cols_dst_ring = Arc::new(DoubleBuffer::new(
            Array3::zeros((n1c, n0, n2)),
            Array3::zeros((n1c, n0, n2)),
        ));

        let streams = StreamTrio::spawn()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.max_write_threads)
            .thread_name(|i| format!("lam-host-{i}"))
            .build()
            .map_err(|e| LamError::Config(format!("failed to build host worker pool: {e}")))?;

        Ok(Self {
            cfg,
            kernels: Arc::new(kernels),
            streams,
            pool,
            footprint,
            host_proj,
            host_spectrum,
            host_bins,
            host_volume,
            host_out,
            proj_ring,
            spectrum_ring,
            bins_src_ring,
            bins_dst_ring,
            cols_src_ring,
            cols_dst_ring,
        })
    }

    pub fn config(&self) -> &LamConfig<F> {
        &self.cfg
    }

    /// Total bytes of the verified buffer layout.
    pub fn memory_footprint(&self) -> usize {
        self.footprint
    }

    /// Run one reconstruction and hand the output volume to `writer` in
    /// parallel chunks.
    ///
    /// `proj` is the projection stack `[ntheta, deth, detw]`, `theta`
    /// the per-projection angles in radians, and `shifts` an optional
    /// per-projection rotation-center correction in detector columns.
    /// Takes `&mut self` so that two reconstructions can never
    /// interleave work on the same streams and buffers.
    pub fn reconstruct<W: ChunkWriter<F>>(
        &mut self,
        proj: ArrayView3<'_, F>,
        theta: ArrayView1<'_, F>,
        shifts: Option<ArrayView1<'_, F>>,
        writer: &W,
    ) -> Result<(), LamError> {
        let cfg = &self.cfg;
        let pdim = proj.dim();
        if pdim != (cfg.ntheta, cfg.deth, cfg.detw) {
            return Err(LamError::shape(
                "projection stack",
                &[cfg.ntheta, cfg.deth, cfg.detw],
                &[pdim.0, pdim.1, pdim.2],
            ));
        }
        if theta.len() != cfg.ntheta {
            return Err(LamError::shape(
                "projection angles",
                &[cfg.ntheta],
                &[theta.len()],
            ));
        }
        if let Some(ref s) = shifts {
            if s.len() != cfg.ntheta {
                return Err(LamError::shape(
                    "center shifts",
                    &[cfg.ntheta],
                    &[s.len()],
                ));
            }
        }
        let theta = Arc::new(theta.to_owned());
        let shifts = Arc::new(match shifts {
            Some(s) => s.to_owned(),
            None => Array1::zeros(cfg.ntheta),
        });
        let mut timings = StageTimings::default();

        // 1. Stage the projections into the pinned host buffer.
        let started = Instant::now();
        {
            let mut host = lock_mutex(&self.host_proj, "projection host buffer")?;
            copy_into(&self.pool, &mut host, proj)?;
        }
        timings.stage_in_ns = started.elapsed().as_nanos();

        // 2. Filter + forward FFT over projection chunks.
        let stage = Instant::now();
        fft2_chunks(
            &self.streams,
            &self.kernels,
            &self.host_proj,
            &self.host_spectrum,
            &self.proj_ring,
            &self.spectrum_ring,
            &shifts,
            cfg.ntheta,
            cfg.nthetac,
        )?;
        timings.fft2_ns = stage.elapsed().as_nanos();

        // 3. Adjoint 2-D USFFT over frequency bin chunks.
        let stage = Instant::now();
        usfft2d_chunks(
            &self.streams,
            &self.kernels,
            &self.host_spectrum,
            &self.host_bins,
            &self.bins_src_ring,
            &self.bins_dst_ring,
            &theta,
            cfg.phi(),
            cfg.deth,
            cfg.dethc,
        )?;
        timings.usfft2d_ns = stage.elapsed().as_nanos();

        // 4. Adjoint 1-D USFFT over cross-section row chunks.
        let stage = Instant::now();
        usfft1d_chunks(
            &self.streams,
            &self.kernels,
            &self.host_bins,
            &self.host_volume,
            &self.cols_src_ring,
            &self.cols_dst_ring,
            cfg.phi(),
            cfg.n1,
            cfg.n1c,
        )?;
        timings.usfft1d_ns = stage.elapsed().as_nanos();

        // 5. Transpose into output order, then fan out to the writer.
        let stage = Instant::now();
        let out = {
            let volume = lock_mutex(&self.host_volume, "volume host buffer")?;
            let mut out = lock_mutex(&self.host_out, "output host buffer")?;
            copy_transposed(&self.pool, &mut out, &volume)?;
            timings.transpose_ns = stage.elapsed().as_nanos();
            out
        };
        let stage = Instant::now();
        write_parallel(&self.pool, writer, &out, cfg.max_write_threads)?;
        timings.write_ns = stage.elapsed().as_nanos();
        drop(out);

        if resolve_profile_timing() {
            eprintln!(
                "{}",
                profile_line(
                    [cfg.n0, cfg.n1, cfg.n2],
                    cfg.ntheta,
                    self.footprint,
                    started.elapsed().as_nanos(),
                    &timings,
                )
            );
        }
        Ok(())
    }

    /// Convenience wrapper that reconstructs into an in-memory volume.
    pub fn reconstruct_to_volume(
        &mut self,
        proj: ArrayView3<'_, F>,
        theta: ArrayView1<'_, F>,
        shifts: Option<ArrayView1<'_, F>>,
    ) -> Result<Array3<F>, LamError> {
        let sink = VolumeSink::new(self.cfg.n0, self.cfg.n1, self.cfg.n2);
        self.reconstruct(proj, theta, shifts, &sink)?;
        Ok(sink.into_volume())
    }
}

// =============================================================================
// Tests
// =============================================================================
