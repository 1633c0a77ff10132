//! Chunked three-phase iterators, one per transform stage.
//!
//! Each iterator walks its stage's chunk axis with a software pipeline:
//! at step `k` it computes chunk `k-1`, drains chunk `k-2` back to the
//! stage's host output buffer, and fills chunk `k` from the stage's
//! host input buffer, each phase on its own execution stream. The loop
//! runs `nchunk + 2` steps so the last chunk finishes draining, and
//! ends every step with the trio barrier. Phases of one step touch
//! pairwise disjoint ring slots (the parity argument lives next to
//! `ring_claims_disjoint`), so the three streams never contend.
//!
//! Stage boundaries are host buffers: a stage reads its predecessor's
//! output only after the predecessor's iterator has fully returned, so
//! the chunk layouts of adjacent stages are independent.

use std::sync::{Arc, Mutex};

use ndarray::{s, Array1, Array3};
use rustfft::num_complex::Complex;

use crate::buffers::{ring_claims_disjoint, DoubleBuffer};
use crate::error::{lock_mutex, LamError};
use crate::float_trait::LamFloat;
use crate::stream::StreamTrio;
use crate::transforms::{KernelSuite, Usfft1dGeom, Usfft2dGeom};

// =============================================================================
// Chunk schedule helpers
// =============================================================================

/// Global index range of one chunk, clipped at the axis length.
#[inline]
fn chunk_range(chunk: usize, chunk_len: usize, axis_len: usize) -> (usize, usize, usize) {
    let start = chunk * chunk_len;
    let end = axis_len.min(start + chunk_len);
    (start, end, end - start)
}

fn nonzero_chunk(chunk_len: usize, what: &str) -> Result<(), LamError> {
    if chunk_len == 0 {
        return Err(LamError::Config(format!(
            "{what} chunk size must be nonzero"
        )));
    }
    Ok(())
}

/// Both ring slots must carry the negotiated shape.
fn check_slot_dims<T>(
    ring: &DoubleBuffer<Array3<T>>,
    context: &'static str,
    expected: (usize, usize, usize),
) -> Result<(), LamError> {
    for chunk in 0..2 {
        let slot = lock_mutex(ring.filling(chunk), context)?;
        let dim = slot.dim();
        if dim != expected {
            return Err(LamError::shape(
                context,
                &[expected.0, expected.1, expected.2],
                &[dim.0, dim.1, dim.2],
            ));
        }
    }
    Ok(())
}

// =============================================================================
// Stage A: filter + forward 2-D FFT over projection chunks
// =============================================================================

/// Filter and transform the projections in chunks along the angle axis,
/// `host_proj [ntheta, deth, detw] -> host_spectrum [ntheta, deth, kw]`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fft2_chunks<F: LamFloat, K: KernelSuite<F>>(
    streams: &StreamTrio,
    kernels: &Arc<K>,
    host_proj: &Arc<Mutex<Array3<F>>>,
    host_spectrum: &Arc<Mutex<Array3<Complex<F>>>>,
    proj_ring: &Arc<DoubleBuffer<Array3<F>>>,
    spectrum_ring: &Arc<DoubleBuffer<Array3<Complex<F>>>>,
    shifts: &Arc<Array1<F>>,
    ntheta: usize,
    nthetac: usize,
) -> Result<(), LamError> {
    nonzero_chunk(nthetac, "projection")?;
    let (deth, kw) = {
        let proj = lock_mutex(host_proj, "projection host buffer")?;
        let spectrum = lock_mutex(host_spectrum, "spectrum host buffer")?;
        let pdim = proj.dim();
        if pdim.0 != ntheta {
            return Err(LamError::shape(
                "projection host buffer",
                &[ntheta, pdim.1, pdim.2],
                &[pdim.0, pdim.1, pdim.2],
            ));
        }
        let kw = pdim.2 / 2 + 1;
        let sdim = spectrum.dim();
        if sdim != (ntheta, pdim.1, kw) {
            return Err(LamError::shape(
                "spectrum host buffer",
                &[ntheta, pdim.1, kw],
                &[sdim.0, sdim.1, sdim.2],
            ));
        }
        (pdim.1, kw)
    };
    let detw = (kw - 1) * 2;
    check_slot_dims(proj_ring, "projection ring slot", (nthetac, deth, detw))?;
    check_slot_dims(spectrum_ring, "spectrum ring slot", (nthetac, deth, kw))?;
    if shifts.len() != ntheta {
        return Err(LamError::shape(
            "projection shifts",
            &[ntheta],
            &[shifts.len()],
        ));
    }

    let nchunk = ntheta.div_ceil(nthetac);
    for step in 0..nchunk + 2 {
        debug_assert!(ring_claims_disjoint(step, nchunk));

        // 1. Compute chunk step-1: filter in place, then transform.
        if (1..=nchunk).contains(&step) {
            let chunk = step - 1;
            let (start, end, count) = chunk_range(chunk, nthetac, ntheta);
            let kernels = Arc::clone(kernels);
            let proj_ring = Arc::clone(proj_ring);
            let spectrum_ring = Arc::clone(spectrum_ring);
            let shifts = Arc::clone(shifts);
            streams.compute.submit(move || {
                let mut proj = lock_mutex(proj_ring.computing(chunk), "projection ring")?;
                let mut spectrum =
                    lock_mutex(spectrum_ring.computing(chunk), "spectrum ring")?;
                kernels.fbp_filter(&mut proj, shifts.slice(s![start..end]), count)?;
                kernels.fft2d_fwd(&mut spectrum, &proj, count)
            })?;
        }

        // 2. Drain chunk step-2 into the spectrum host buffer.
        if step >= 2 {
            let chunk = step - 2;
            let (start, end, count) = chunk_range(chunk, nthetac, ntheta);
            let host = Arc::clone(host_spectrum);
            let ring = Arc::clone(spectrum_ring);
            streams.drain.submit(move || {
                let mut host = lock_mutex(&host, "spectrum host buffer")?;
                let slot = lock_mutex(ring.draining(chunk), "spectrum ring")?;
                host.slice_mut(s![start..end, .., ..])
                    .assign(&slot.slice(s![..count, .., ..]));
                Ok(())
            })?;
        }

        // 3. Fill chunk step from the projection host buffer.
        if step < nchunk {
            let chunk = step;
            let (start, end, count) = chunk_range(chunk, nthetac, ntheta);
            let host = Arc::clone(host_proj);
            let ring = Arc::clone(proj_ring);
            streams.fill.submit(move || {
                let host = lock_mutex(&host, "projection host buffer")?;
                let mut slot = lock_mutex(ring.filling(chunk), "projection ring")?;
                slot.slice_mut(s![..count, .., ..])
                    .assign(&host.slice(s![start..end, .., ..]));
                Ok(())
            })?;
        }

        streams.synchronize_all()?;
    }
    Ok(())
}

// =============================================================================
// Stage B: adjoint 2-D USFFT over detector-row frequency bins
// =============================================================================

/// Back-project the half spectrum in chunks of detector-row frequency
/// bins, `host_spectrum [ntheta, deth, kw] -> host_bins [n1, kh, n2]`.
///
/// The fill phase assembles each source slot as two stacked blocks: the
/// primary block copies bin rows `start..end` for every projection, and
/// the mirror block copies the Hermitian partner rows `(deth - j) % deth`
/// in reversed order, so bin `j` and its conjugate mirror land in the
/// same kernel call. The modulo folds bin 0 onto itself, which is what
/// makes the first chunk's mirror block wrap back to row 0.
#[allow(clippy::too_many_arguments)]
pub(crate) fn usfft2d_chunks<F: LamFloat, K: KernelSuite<F>>(
    streams: &StreamTrio,
    kernels: &Arc<K>,
    host_spectrum: &Arc<Mutex<Array3<Complex<F>>>>,
    host_bins: &Arc<Mutex<Array3<Complex<F>>>>,
    bins_src_ring: &Arc<DoubleBuffer<Array3<Complex<F>>>>,
    bins_dst_ring: &Arc<DoubleBuffer<Array3<Complex<F>>>>,
    theta: &Arc<Array1<F>>,
    phi: F,
    deth: usize,
    dethc: usize,
) -> Result<(), LamError> {
    nonzero_chunk(dethc, "frequency bin")?;
    let kh = deth / 2 + 1;
    let (ntheta, kw, n1, n2) = {
        let spectrum = lock_mutex(host_spectrum, "spectrum host buffer")?;
        let bins = lock_mutex(host_bins, "bin host buffer")?;
        let sdim = spectrum.dim();
        if sdim.1 != deth {
            return Err(LamError::shape(
                "spectrum host buffer",
                &[sdim.0, deth, sdim.2],
                &[sdim.0, sdim.1, sdim.2],
            ));
        }
        let bdim = bins.dim();
        if bdim.1 != kh {
            return Err(LamError::shape(
                "bin host buffer",
                &[bdim.0, kh, bdim.2],
                &[bdim.0, bdim.1, bdim.2],
            ));
        }
        (sdim.0, sdim.2, bdim.0, bdim.2)
    };
    check_slot_dims(
        bins_src_ring,
        "bin source ring slot",
        (2 * ntheta, dethc, kw),
    )?;
    check_slot_dims(bins_dst_ring, "cross-section ring slot", (n1, dethc, n2))?;
    if theta.len() != ntheta {
        return Err(LamError::shape(
            "projection angles",
            &[ntheta],
            &[theta.len()],
        ));
    }

    let nchunk = kh.div_ceil(dethc);
    for step in 0..nchunk + 2 {
        debug_assert!(ring_claims_disjoint(step, nchunk));

        // 1. Compute chunk step-1.
        if (1..=nchunk).contains(&step) {
            let chunk = step - 1;
            let (start, _, count) = chunk_range(chunk, dethc, kh);
            let kernels = Arc::clone(kernels);
            let src_ring = Arc::clone(bins_src_ring);
            let dst_ring = Arc::clone(bins_dst_ring);
            let geom = Usfft2dGeom {
                theta: Arc::clone(theta),
                phi,
                bin_start: start,
                bin_count: count,
            };
            streams.compute.submit(move || {
                let src = lock_mutex(src_ring.computing(chunk), "bin source ring")?;
                let mut dst = lock_mutex(dst_ring.computing(chunk), "cross-section ring")?;
                kernels.usfft2d_adj(&mut dst, &src, &geom)
            })?;
        }

        // 2. Drain chunk step-2 into the bin host buffer.
        if step >= 2 {
            let chunk = step - 2;
            let (start, end, count) = chunk_range(chunk, dethc, kh);
            let host = Arc::clone(host_bins);
            let ring = Arc::clone(bins_dst_ring);
            streams.drain.submit(move || {
                let mut host = lock_mutex(&host, "bin host buffer")?;
                let slot = lock_mutex(ring.draining(chunk), "cross-section ring")?;
                host.slice_mut(s![.., start..end, ..])
                    .assign(&slot.slice(s![.., ..count, ..]));
                Ok(())
            })?;
        }

        // 3. Fill chunk step: primary rows plus Hermitian mirror rows.
        if step < nchunk {
            let chunk = step;
            let (start, end, count) = chunk_range(chunk, dethc, kh);
            let host = Arc::clone(host_spectrum);
            let ring = Arc::clone(bins_src_ring);
            streams.fill.submit(move || {
                let host = lock_mutex(&host, "spectrum host buffer")?;
                let mut slot = lock_mutex(ring.filling(chunk), "bin source ring")?;
                slot.slice_mut(s![..ntheta, ..count, ..])
                    .assign(&host.slice(s![.., start..end, ..]));
                for t in 0..ntheta {
                    for l in 0..count {
                        let mirror_row = (deth - (start + l)) % deth;
                        slot.slice_mut(s![ntheta + t, dethc - 1 - l, ..])
                            .assign(&host.slice(s![t, mirror_row, ..]));
                    }
                }
                Ok(())
            })?;
        }

        streams.synchronize_all()?;
    }
    Ok(())
}

// =============================================================================
// Stage C: adjoint 1-D USFFT along the reconstruction axis
// =============================================================================

/// Resolve the reconstruction axis in chunks of cross-section rows,
/// `host_bins [n1, kh, n2] -> host_volume [n1, n0, n2]`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn usfft1d_chunks<F: LamFloat, K: KernelSuite<F>>(
    streams: &StreamTrio,
    kernels: &Arc<K>,
    host_bins: &Arc<Mutex<Array3<Complex<F>>>>,
    host_volume: &Arc<Mutex<Array3<F>>>,
    cols_src_ring: &Arc<DoubleBuffer<Array3<Complex<F>>>>,
    cols_dst_ring: &Arc<DoubleBuffer<Array3<F>>>,
    phi: F,
    n1: usize,
    n1c: usize,
) -> Result<(), LamError> {
    nonzero_chunk(n1c, "cross-section row")?;
    let (kh, n0, n2) = {
        let bins = lock_mutex(host_bins, "bin host buffer")?;
        let volume = lock_mutex(host_volume, "volume host buffer")?;
        let bdim = bins.dim();
        if bdim.0 != n1 {
            return Err(LamError::shape(
                "bin host buffer",
                &[n1, bdim.1, bdim.2],
                &[bdim.0, bdim.1, bdim.2],
            ));
        }
        let vdim = volume.dim();
        if vdim.0 != n1 || vdim.2 != bdim.2 {
            return Err(LamError::shape(
                "volume host buffer",
                &[n1, vdim.1, bdim.2],
                &[vdim.0, vdim.1, vdim.2],
            ));
        }
        (bdim.1, vdim.1, bdim.2)
    };
    check_slot_dims(cols_src_ring, "column source ring slot", (n1c, kh, n2))?;
    check_slot_dims(cols_dst_ring, "column ring slot", (n1c, n0, n2))?;

    let nchunk = n1.div_ceil(n1c);
    for step in 0..nchunk + 2 {
        debug_assert!(ring_claims_disjoint(step, nchunk));

        // 1. Compute chunk step-1.
        if (1..=nchunk).contains(&step) {
            let chunk = step - 1;
            let (_, _, count) = chunk_range(chunk, n1c, n1);
            let kernels = Arc::clone(kernels);
            let src_ring = Arc::clone(cols_src_ring);
            let dst_ring = Arc::clone(cols_dst_ring);
            let geom = Usfft1dGeom {
                phi,
                row_count: count,
            };
            streams.compute.submit(move || {
                let src = lock_mutex(src_ring.computing(chunk), "column source ring")?;
                let mut dst = lock_mutex(dst_ring.computing(chunk), "column ring")?;
                kernels.usfft1d_adj(&mut dst, &src, &geom)
            })?;
        }

        // 2. Drain chunk step-2 into the volume host buffer.
        if step >= 2 {
            let chunk = step - 2;
            let (start, end, count) = chunk_range(chunk, n1c, n1);
            let host = Arc::clone(host_volume);
            let ring = Arc::clone(cols_dst_ring);
            streams.drain.submit(move || {
                let mut host = lock_mutex(&host, "volume host buffer")?;
                let slot = lock_mutex(ring.draining(chunk), "column ring")?;
                host.slice_mut(s![start..end, .., ..])
                    .assign(&slot.slice(s![..count, .., ..]));
                Ok(())
            })?;
        }

        // 3. Fill chunk step from the bin host buffer.
        if step < nchunk {
            let chunk = step;
            let (start, end, count) = chunk_range(chunk, n1c, n1);
            let host = Arc::clone(host_bins);
            let ring = Arc::clone(cols_src_ring);
            streams.fill.submit(move || {
                let host = lock_mutex(&host, "bin host buffer")?;
                let mut slot = lock_mutex(ring.filling(chunk), "column source ring")?;
                slot.slice_mut(s![..count, .., ..])
                    .assign(&host.slice(s![start..end, .., ..]));
                Ok(())
            })?;
        }

        streams.synchronize_all()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterKind;
    use crate::orchestration::LamConfig;
    use crate::transforms::CpuKernels;
    use ndarray::{Array1, ArrayView1};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SimpleLcg {
        state: u64,
    }

    impl SimpleLcg {
        fn new(seed: u64) -> Self {
            Self { state: seed }
        }

        fn next_u64(&mut self) -> u64 {
            self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
            self.state
        }

        fn next_f64(&mut self) -> f64 {
            let u = self.next_u64();
            ((u >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
        }
    }

    fn shared<T>(value: T) -> Arc<Mutex<T>> {
        Arc::new(Mutex::new(value))
    }

    fn ring3<T: Clone + num_traits::Zero>(
        dim: (usize, usize, usize),
    ) -> Arc<DoubleBuffer<Array3<T>>> {
        Arc::new(DoubleBuffer::new(Array3::zeros(dim), Array3::zeros(dim)))
    }

    #[test]
    fn test_fft2_chunks_matches_unchunked() {
        // ntheta = 10 with chunks of 4 exercises a short tail chunk.
        let (ntheta, deth, detw) = (10, 6, 8);
        let cfg = {
            let mut cfg = LamConfig::<f64>::for_volume(4, 4, 4, ntheta, deth, detw);
            cfg.filter = FilterKind::Shepp;
            cfg
        };
        let kernels = Arc::new(CpuKernels::new(&cfg).unwrap());
        let kw = detw / 2 + 1;

        let mut rng = SimpleLcg::new(2024);
        let proj = Array3::<f64>::from_shape_fn((ntheta, deth, detw), |_| rng.next_f64());
        let shifts = Arc::new(Array1::from_shape_fn(ntheta, |t| (t as f64 - 5.0) * 0.1));

        // Reference: the same kernels applied to the whole stack at once.
        let mut reference_proj = proj.clone();
        kernels
            .fbp_filter(&mut reference_proj, shifts.view(), ntheta)
            .unwrap();
        let mut reference = Array3::<Complex<f64>>::zeros((ntheta, deth, kw));
        kernels
            .fft2d_fwd(&mut reference, &reference_proj, ntheta)
            .unwrap();

        let streams = StreamTrio::spawn().unwrap();
        let host_proj = shared(proj);
        let host_spectrum = shared(Array3::<Complex<f64>>::zeros((ntheta, deth, kw)));
        let proj_ring = ring3::<f64>((4, deth, detw));
        let spectrum_ring = ring3::<Complex<f64>>((4, deth, kw));
        fft2_chunks(
            &streams,
            &kernels,
            &host_proj,
            &host_spectrum,
            &proj_ring,
            &spectrum_ring,
            &shifts,
            ntheta,
            4,
        )
        .unwrap();

        let got = host_spectrum.lock().unwrap();
        for (a, b) in got.iter().zip(reference.iter()) {
            assert!((a - b).norm() < 1e-12, "{a} vs {b}");
        }
    }

    #[test]
    fn test_usfft1d_chunks_matches_unchunked() {
        let (n0, n1, n2, deth) = (8, 8, 6, 8);
        let cfg = {
            let mut cfg = LamConfig::<f64>::for_volume(n0, n1, n2, 4, deth, 8);
            cfg.lamino_angle = 75.0;
            cfg
        };
        let kernels = Arc::new(CpuKernels::new(&cfg).unwrap());
        let kh = deth / 2 + 1;

        let mut rng = SimpleLcg::new(555);
        let bins = Array3::<Complex<f64>>::from_shape_fn((n1, kh, n2), |_| {
            Complex::new(rng.next_f64(), rng.next_f64())
        });

        let mut reference = Array3::<f64>::zeros((n1, n0, n2));
        kernels
            .usfft1d_adj(
                &mut reference,
                &bins,
                &Usfft1dGeom {
                    phi: cfg.phi(),
                    row_count: n1,
                },
            )
            .unwrap();

        // n1c = 3 leaves a tail chunk of two rows.
        let streams = StreamTrio::spawn().unwrap();
        let host_bins = shared(bins);
        let host_volume = shared(Array3::<f64>::zeros((n1, n0, n2)));
        let src_ring = ring3::<Complex<f64>>((3, kh, n2));
        let dst_ring = ring3::<f64>((3, n0, n2));
        usfft1d_chunks(
            &streams,
            &kernels,
            &host_bins,
            &host_volume,
            &src_ring,
            &dst_ring,
            cfg.phi(),
            n1,
            3,
        )
        .unwrap();

        let got = host_volume.lock().unwrap();
        for (a, b) in got.iter().zip(reference.iter()) {
            assert!((a - b).abs() < 1e-12, "{a} vs {b}");
        }
    }

    /// Kernel stand-in for the 2-D stage: checks the exact content the
    /// fill phase must deliver (primary and mirror blocks) and emits
    /// bin-tagged output so the drain placement can be verified too.
    struct MirrorCheckingKernels {
        ntheta: usize,
        deth: usize,
        kw: usize,
        bins_seen: AtomicUsize,
    }

    fn encode(t: usize, row: usize, kt: usize) -> Complex<f64> {
        Complex::new((t * 10_000 + row * 100 + kt) as f64, (row + 1) as f64)
    }

    impl KernelSuite<f64> for MirrorCheckingKernels {
        fn fbp_filter(
            &self,
            _data: &mut Array3<f64>,
            _shifts: ArrayView1<f64>,
            _count: usize,
        ) -> Result<(), LamError> {
            Err(LamError::Kernel {
                kernel: "fbp_filter",
                message: "not exercised by this test".into(),
            })
        }

        fn fft2d_fwd(
            &self,
            _dst: &mut Array3<Complex<f64>>,
            _src: &Array3<f64>,
            _count: usize,
        ) -> Result<(), LamError> {
            Err(LamError::Kernel {
                kernel: "fft2d_fwd",
                message: "not exercised by this test".into(),
            })
        }

        fn usfft2d_adj(
            &self,
            dst: &mut Array3<Complex<f64>>,
            src: &Array3<Complex<f64>>,
            geom: &Usfft2dGeom<f64>,
        ) -> Result<(), LamError> {
            let dethc = src.dim().1;
            for l in 0..geom.bin_count {
                let j = geom.bin_start + l;
                let mirror_row = (self.deth - j) % self.deth;
                for t in 0..self.ntheta {
                    for kt in 0..self.kw {
                        if src[[t, l, kt]] != encode(t, j, kt) {
                            return Err(LamError::Kernel {
                                kernel: "usfft2d_adj",
                                message: format!("primary row for bin {j} is wrong"),
                            });
                        }
                        if src[[self.ntheta + t, dethc - 1 - l, kt]] != encode(t, mirror_row, kt)
                        {
                            return Err(LamError::Kernel {
                                kernel: "usfft2d_adj",
                                message: format!("mirror row for bin {j} is wrong"),
                            });
                        }
                    }
                }
                for i1 in 0..dst.dim().0 {
                    for i2 in 0..dst.dim().2 {
                        dst[[i1, l, i2]] = Complex::new(j as f64, 0.0);
                    }
                }
                self.bins_seen.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn usfft1d_adj(
            &self,
            _dst: &mut Array3<f64>,
            _src: &Array3<Complex<f64>>,
            _geom: &Usfft1dGeom<f64>,
        ) -> Result<(), LamError> {
            Err(LamError::Kernel {
                kernel: "usfft1d_adj",
                message: "not exercised by this test".into(),
            })
        }
    }

    #[test]
    fn test_usfft2d_chunks_mirror_rows_and_drain_placement() {
        // deth = 8 gives kh = 5; dethc = 2 makes three chunks with a
        // short tail, and the first chunk holds the self-paired bin 0.
        let (ntheta, deth, kw) = (3, 8, 5);
        let (n1, n2, dethc) = (4, 4, 2);
        let kh = deth / 2 + 1;

        let host_spectrum = shared(Array3::<Complex<f64>>::from_shape_fn(
            (ntheta, deth, kw),
            |(t, r, k)| encode(t, r, k),
        ));
        let host_bins = shared(Array3::<Complex<f64>>::zeros((n1, kh, n2)));
        let src_ring = ring3::<Complex<f64>>((2 * ntheta, dethc, kw));
        let dst_ring = ring3::<Complex<f64>>((n1, dethc, n2));
        let theta = Arc::new(Array1::<f64>::zeros(ntheta));
        let checker = Arc::new(MirrorCheckingKernels {
            ntheta,
            deth,
            kw,
            bins_seen: AtomicUsize::new(0),
        });

        let streams = StreamTrio::spawn().unwrap();
        usfft2d_chunks(
            &streams,
            &checker,
            &host_spectrum,
            &host_bins,
            &src_ring,
            &dst_ring,
            &theta,
            0.0,
            deth,
            dethc,
        )
        .unwrap();

        assert_eq!(checker.bins_seen.load(Ordering::SeqCst), kh);
        let bins = host_bins.lock().unwrap();
        for i1 in 0..n1 {
            for j in 0..kh {
                for i2 in 0..n2 {
                    assert_eq!(bins[[i1, j, i2]], Complex::new(j as f64, 0.0));
                }
            }
        }
    }

    #[test]
    fn test_rejects_mismatched_host_shapes() {
        let cfg = LamConfig::<f64>::for_volume(4, 4, 4, 4, 8, 8);
        let kernels = Arc::new(CpuKernels::new(&cfg).unwrap());
        let streams = StreamTrio::spawn().unwrap();

        // Spectrum host buffer narrower than the half spectrum.
        let host_proj = shared(Array3::<f64>::zeros((4, 8, 8)));
        let host_spectrum = shared(Array3::<Complex<f64>>::zeros((4, 8, 4)));
        let proj_ring = ring3::<f64>((2, 8, 8));
        let spectrum_ring = ring3::<Complex<f64>>((2, 8, 5));
        let shifts = Arc::new(Array1::<f64>::zeros(4));
        let err = fft2_chunks(
            &streams,
            &kernels,
            &host_proj,
            &host_spectrum,
            &proj_ring,
            &spectrum_ring,
            &shifts,
            4,
            2,
        )
        .unwrap_err();
        assert!(matches!(err, LamError::ShapeMismatch { .. }));
    }
}
