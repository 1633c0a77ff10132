//! Laminographic Fourier Back-Projection Library
//!
//! Pure Rust implementation of chunked, pipelined filtered
//! back-projection for tilted parallel-beam (laminography) geometries.
//! The reconstruction runs as three transform stages over host stage
//! buffers: a forward 2-D FFT of the filtered projections, an adjoint
//! 2-D USFFT over detector-row frequency bins, and an adjoint 1-D USFFT
//! along the reconstruction axis. Each stage walks its chunk axis with
//! fill/compute/drain phases overlapped on three execution streams.

pub mod buffers;
pub mod error;
pub mod filter;
pub mod float_trait;
pub mod host_ops;
pub mod nufft;
pub mod orchestration;
mod pipeline;
pub mod stream;
pub mod transforms;

// Re-export commonly used types at the crate root
pub use buffers::{ArenaPlan, DoubleBuffer, Reservation};
pub use error::LamError;
pub use filter::{FilterKind, FilterTable};
pub use float_trait::LamFloat;
pub use host_ops::{ChunkWriter, VolumeSink};
pub use orchestration::{LamConfig, LamEngine};
pub use stream::{ExecStream, StreamTrio};
pub use transforms::{CpuKernels, KernelSuite, LamPlans, Usfft1dGeom, Usfft2dGeom};
