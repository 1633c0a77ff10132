//! Host-side staging and output fan-out.
//!
//! The engine's host buffers sit between stages; everything that moves
//! whole volumes in host memory lives here: the parallel stage-in copy,
//! the axis transpose into output order, and the fan-out that hands
//! contiguous slabs of the finished volume to a `ChunkWriter` from a
//! fixed worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use ndarray::parallel::prelude::*;
use ndarray::{s, Array3, ArrayView3, Axis};

use crate::error::LamError;
use crate::float_trait::LamFloat;

// =============================================================================
// Chunk writers
// =============================================================================

/// Destination for finished output slices.
///
/// `write_chunk` receives a view of slices `start..end` along the
/// output's first axis together with the chunk's `ordinal` in the write
/// order. Calls arrive concurrently from the write pool; an error
/// message is wrapped into [`LamError::Write`] by the engine, and when
/// several chunks fail the error with the lowest ordinal is reported.
pub trait ChunkWriter<F: LamFloat>: Send + Sync {
    fn write_chunk(
        &self,
        data: ArrayView3<'_, F>,
        start: usize,
        end: usize,
        ordinal: usize,
    ) -> Result<(), String>;
}

/// In-memory writer that assembles the full reconstruction.
pub struct VolumeSink<F: LamFloat> {
    volume: Mutex<Array3<F>>,
    chunks_written: AtomicUsize,
}

impl<F: LamFloat> VolumeSink<F> {
    pub fn new(n0: usize, n1: usize, n2: usize) -> Self {
        Self {
            volume: Mutex::new(Array3::zeros((n0, n1, n2))),
            chunks_written: AtomicUsize::new(0),
        }
    }

    pub fn chunks_written(&self) -> usize {
        self.chunks_written.load(Ordering::SeqCst)
    }

    /// Take the assembled `[n0, n1, n2]` volume out of the sink.
    pub fn into_volume(self) -> Array3<F> {
        self.volume
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<F: LamFloat> ChunkWriter<F> for VolumeSink<F> {
    fn write_chunk(
        &self,
        data: ArrayView3<'_, F>,
        start: usize,
        end: usize,
        _ordinal: usize,
    ) -> Result<(), String> {
        let mut volume = self
            .volume
            .lock()
            .map_err(|_| "output volume lock poisoned".to_string())?;
        let vdim = volume.dim();
        let ddim = data.dim();
        if end > vdim.0 || end - start != ddim.0 || ddim.1 != vdim.1 || ddim.2 != vdim.2 {
            return Err(format!(
                "chunk {start}..{end} of shape {ddim:?} does not fit volume of shape {vdim:?}"
            ));
        }
        volume.slice_mut(s![start..end, .., ..]).assign(&data);
        self.chunks_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Parallel host copies
// =============================================================================

/// Split `len` into `parts` contiguous near-equal ranges, dropping the
/// excess parts when there are fewer items than parts.
pub(crate) fn split_ranges(len: usize, parts: usize) -> Vec<(usize, usize)> {
    if len == 0 || parts == 0 {
        return Vec::new();
    }
    let parts = parts.min(len);
    let base = len / parts;
    let extra = len % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let size = base + usize::from(i < extra);
        ranges.push((start, start + size));
        start += size;
    }
    ranges
}

/// Copy `src` into `dst` with the pool's workers, slabbed along the
/// first axis.
pub(crate) fn copy_into<F: LamFloat>(
    pool: &rayon::ThreadPool,
    dst: &mut Array3<F>,
    src: ArrayView3<'_, F>,
) -> Result<(), LamError> {
    let ddim = dst.dim();
    let sdim = src.dim();
    if ddim != sdim {
        return Err(LamError::shape(
            "parallel copy",
            &[sdim.0, sdim.1, sdim.2],
            &[ddim.0, ddim.1, ddim.2],
        ));
    }
    let per = slab_len(ddim.0, pool);
    pool.install(|| {
        dst.axis_chunks_iter_mut(Axis(0), per)
            .into_par_iter()
            .zip(src.axis_chunks_iter(Axis(0), per).into_par_iter())
            .for_each(|(mut d, s)| d.assign(&s));
    });
    Ok(())
}

/// Copy `src [a, b, c]` into `dst [b, a, c]`, swapping the first two
/// axes. Workers own output slabs, so writes never alias.
pub(crate) fn copy_transposed<F: LamFloat>(
    pool: &rayon::ThreadPool,
    dst: &mut Array3<F>,
    src: &Array3<F>,
) -> Result<(), LamError> {
    let ddim = dst.dim();
    let sdim = src.dim();
    if (sdim.1, sdim.0, sdim.2) != ddim {
        return Err(LamError::shape(
            "transposing copy",
            &[sdim.1, sdim.0, sdim.2],
            &[ddim.0, ddim.1, ddim.2],
        ));
    }
    let per = slab_len(ddim.0, pool);
    pool.install(|| {
        dst.axis_chunks_iter_mut(Axis(0), per)
            .into_par_iter()
            .enumerate()
            .for_each(|(slab, mut block)| {
                let base = slab * per;
                for (local, mut plane) in block.axis_iter_mut(Axis(0)).enumerate() {
                    plane.assign(&src.index_axis(Axis(1), base + local));
                }
            });
    });
    Ok(())
}

fn slab_len(rows: usize, pool: &rayon::ThreadPool) -> usize {
    rows.div_ceil(pool.current_num_threads().max(1)).max(1)
}

// =============================================================================
// Parallel write fan-out
// =============================================================================

/// Hand the finished volume to the writer as `parts` contiguous slabs,
/// one `write_chunk` call per pool worker. Every chunk is attempted
/// even when an earlier one fails; the failure with the lowest ordinal
/// is the one returned.
pub(crate) fn write_parallel<F: LamFloat, W: ChunkWriter<F> + ?Sized>(
    pool: &rayon::ThreadPool,
    writer: &W,
    volume: &Array3<F>,
    parts: usize,
) -> Result<(), LamError> {
    let ranges = split_ranges(volume.dim().0, parts.max(1));
    let results: Vec<Result<(), LamError>> = pool.install(|| {
        ranges
            .par_iter()
            .enumerate()
            .map(|(ordinal, &(start, end))| {
                writer
                    .write_chunk(volume.slice(s![start..end, .., ..]), start, end, ordinal)
                    .map_err(|message| LamError::Write {
                        ordinal,
                        start,
                        end,
                        message,
                    })
            })
            .collect()
    });
    for result in results {
        result?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn pool(threads: usize) -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap()
    }

    #[test]
    fn test_split_ranges_cover_len_exactly() {
        assert_eq!(split_ranges(10, 3), vec![(0, 4), (4, 7), (7, 10)]);
        assert_eq!(split_ranges(3, 8), vec![(0, 1), (1, 2), (2, 3)]);
        assert_eq!(split_ranges(8, 1), vec![(0, 8)]);
        assert!(split_ranges(0, 4).is_empty());
        assert!(split_ranges(4, 0).is_empty());
    }

    #[test]
    fn test_copy_transposed_swaps_leading_axes() {
        let mut rng = SimpleLcg::new(17);
        let src = Array3::<f64>::from_shape_fn((3, 5, 4), |_| rng.next_f64());
        let mut dst = Array3::<f64>::zeros((5, 3, 4));
        copy_transposed(&pool(3), &mut dst, &src).unwrap();
        for a in 0..3 {
            for b in 0..5 {
                for c in 0..4 {
                    assert_eq!(dst[[b, a, c]], src[[a, b, c]]);
                }
            }
        }
    }

    #[test]
    fn test_copies_agree_across_pool_sizes() {
        let mut rng = SimpleLcg::new(23);
        let src = Array3::<f64>::from_shape_fn((13, 4, 6), |_| rng.next_f64());
        let mut serial = Array3::<f64>::zeros((13, 4, 6));
        let mut parallel = Array3::<f64>::zeros((13, 4, 6));
        copy_into(&pool(1), &mut serial, src.view()).unwrap();
        copy_into(&pool(8), &mut parallel, src.view()).unwrap();
        assert_eq!(serial, src);
        assert_eq!(parallel, src);
    }

    #[test]
    fn test_volume_sink_assembles_chunks() {
        let sink = VolumeSink::<f64>::new(6, 2, 3);
        let data = Array3::<f64>::from_elem((4, 2, 3), 1.5);
        sink.write_chunk(data.slice(s![..4, .., ..]), 0, 4, 0).unwrap();
        let tail = Array3::<f64>::from_elem((2, 2, 3), -2.5);
        sink.write_chunk(tail.view(), 4, 6, 1).unwrap();
        assert_eq!(sink.chunks_written(), 2);
        let volume = sink.into_volume();
        assert_eq!(volume[[0, 0, 0]], 1.5);
        assert_eq!(volume[[3, 1, 2]], 1.5);
        assert_eq!(volume[[4, 0, 0]], -2.5);
        assert_eq!(volume[[5, 1, 2]], -2.5);
    }

    #[test]
    fn test_volume_sink_rejects_out_of_range_chunk() {
        let sink = VolumeSink::<f64>::new(4, 2, 2);
        let data = Array3::<f64>::zeros((3, 2, 2));
        assert!(sink.write_chunk(data.view(), 2, 5, 0).is_err());
    }

    struct FlakyWriter {
        calls: AtomicUsize,
        fail_ordinals: Vec<usize>,
    }

    impl ChunkWriter<f64> for FlakyWriter {
        fn write_chunk(
            &self,
            _data: ArrayView3<'_, f64>,
            _start: usize,
            _end: usize,
            ordinal: usize,
        ) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_ordinals.contains(&ordinal) {
                Err(format!("ordinal {ordinal} refused"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_write_parallel_reports_lowest_failing_ordinal() {
        let writer = FlakyWriter {
            calls: AtomicUsize::new(0),
            fail_ordinals: vec![3, 1],
        };
        let volume = Array3::<f64>::zeros((16, 2, 2));
        let err = write_parallel(&pool(4), &writer, &volume, 4).unwrap_err();
        match err {
            LamError::Write { ordinal, start, end, .. } => {
                assert_eq!(ordinal, 1);
                assert_eq!((start, end), (4, 8));
            }
            other => panic!("unexpected error {other:?}"),
        }
        // Later chunks were still attempted.
        assert_eq!(writer.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_write_parallel_delivers_every_slice_once() {
        let sink = VolumeSink::<f64>::new(10, 3, 3);
        let mut rng = SimpleLcg::new(808);
        let volume = Array3::<f64>::from_shape_fn((10, 3, 3), |_| rng.next_f64());
        write_parallel(&pool(3), &sink, &volume, 3).unwrap();
        assert_eq!(sink.chunks_written(), 3);
        assert_eq!(sink.into_volume(), volume);
    }
}
