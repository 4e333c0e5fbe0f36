//! # sift
//!
//! A compact, disk-resident k-mer search index over document corpora.
//!
//! A corpus directory of sequence files is turned into one Bloom filter per
//! document; the filters are stacked column-wise into batch blocks, combined
//! into per-geometry root blocks, and laid out as a page-aligned index file
//! that the query engines address with pure offset arithmetic. Hashing a
//! single query k-mer yields a bit-row indicating membership across every
//! document at once; a document's score is the number of query k-mers whose
//! hash bits are all set in its column.
//!
//! ## Example
//!
//! ```no_run
//! use sift::{build_index, search, BuildParams, MmapLoader, QueryOptions};
//! use std::path::Path;
//! use std::sync::atomic::AtomicBool;
//!
//! fn main() -> sift::Result<()> {
//!     let cancel = AtomicBool::new(false);
//!     build_index(
//!         Path::new("corpus/"),
//!         Path::new("corpus.cobs_idx"),
//!         BuildParams::default(),
//!         &cancel,
//!     )?;
//!
//!     let mut loader = MmapLoader::open(Path::new("corpus.cobs_idx"))?;
//!     let hits = search(&mut loader, "ACGTACGTACGT", &QueryOptions::default())?;
//!     for hit in hits {
//!         println!("{}\t{}", hit.name, hit.score);
//!     }
//!     Ok(())
//! }
//! ```

pub mod bloom;
pub mod build;
pub mod config;
pub mod error;
pub mod hashing;
pub mod index;
pub mod kmer;
pub mod logging;
pub mod query;
pub mod sample;
pub mod scan;

pub use build::{build_index, BuildParams, BuildSummary};
pub use error::{Result, SiftError};
#[cfg(target_os = "linux")]
pub use index::loader::DirectIoLoader;
pub use index::loader::{MmapLoader, RowBuffer, RowReader};
pub use index::{IndexHeader, LayerParams, INDEX_EXTENSION};
pub use query::{search, DocHit, QueryOptions};
pub use scan::{DocumentEntry, DocumentList, FileType};
