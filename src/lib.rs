//! External merge sort over record files of arbitrary size: inputs are split
//! into sorted runs that fit in memory, then merged in rounds of bounded
//! fan-in down to a single output. Also carries merge-join set operations
//! over already-sorted inputs.

pub mod codec;
pub mod error;
pub mod fs;
pub mod setops;
pub mod sort;

pub use codec::{Codec, FixedCodec, LinesCodec, RecordRead, RecordWrite};
pub use error::{SortError, SortResult};
pub use fs::{DiskDir, MockDir, SortDir};
pub use sort::{Input, SortConfig, SortedStream, Sorter};
