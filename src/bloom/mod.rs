//! Bloom filter construction: per-batch sizing, column-stacked block
//! building and block combining.

pub mod block;
pub mod combine;
pub mod sizing;

pub use block::{build_block, read_block_header, BlockHeader, BlockRows, BLOCK_EXTENSION};
pub use combine::{combine_pass, list_blocks};
pub use sizing::{bits_per_element, signature_size};
