// DedupIndex - deduplication index engine
// Core library module
//
// Answers "has this 256-bit record name been seen before, and where?"
// against a bounded-memory volume index backed by delta-encoded chapter
// indexes on disk.

pub mod chapter;
pub mod common;
pub mod config;
pub mod delta;
pub mod error;
pub mod geometry;
pub mod index;
pub mod request;
pub mod volume;
pub mod volume_index;

pub use common::{RecordData, RecordName, VirtualChapter, NO_CHAPTER};
pub use config::IndexConfig;
pub use error::{IndexError, Result};
pub use geometry::Geometry;
pub use index::{DedupIndex, IndexStats, LoadContext, OpenType};
pub use request::{EnqueueStage, IndexRegion, Request, RequestCallback, RequestType};
