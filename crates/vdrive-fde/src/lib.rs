//! vdrive-fde: the encrypted data path.
//!
//! The host sees logical blocks of `multiplier × 512` bytes; the pipeline
//! maps them onto physical sectors, running cipher work in parallel with
//! storage I/O in fixed-size batches. Ordering within one host command is
//! preserved by joining every cipher task before the buffer is surfaced.

mod drive;

pub use drive::{Drive, BLOCK_SIZE_MULTIPLIER, READ_PIPELINE_SIZE, WRITE_PIPELINE_SIZE};
