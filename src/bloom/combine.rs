//! Block combining: vertical concatenation of sibling Bloom blocks.
//!
//! One pass groups the blocks of a directory by (signature_size,
//! num_hashes), merges up to `fan_in` siblings per output block and carries
//! singletons over. The driver re-runs passes on successive generation
//! directories until a pass performs no merge, at which point each group
//! holds a single root block.

use crate::bloom::block::{BlockHeader, BlockRows, read_block_header, BLOCK_EXTENSION};
use crate::error::{Result, SiftError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// List the block files of a directory in name order.
pub fn list_blocks(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut blocks = Vec::new();
    let read_dir = std::fs::read_dir(dir).map_err(|e| SiftError::io(dir, "read directory", e))?;
    for entry in read_dir {
        let entry = entry.map_err(|e| SiftError::io(dir, "read directory entry", e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(BLOCK_EXTENSION) {
            blocks.push(path);
        }
    }
    blocks.sort();
    Ok(blocks)
}

/// Run one combine pass from `in_dir` into `out_dir`.
///
/// Returns `true` when the pass reached the fixed point: every
/// (signature_size, num_hashes) group already held a single block, which was
/// carried over as a root.
pub fn combine_pass(in_dir: &Path, out_dir: &Path, fan_in: usize) -> Result<bool> {
    if fan_in < 2 {
        return Err(SiftError::invalid(format!(
            "combine fan-in must be >= 2 (got {})",
            fan_in
        )));
    }
    std::fs::create_dir_all(out_dir).map_err(|e| SiftError::io(out_dir, "create directory", e))?;

    let blocks = list_blocks(in_dir)?;

    // Group by geometry, preserving first-appearance order.
    let mut groups: Vec<((u64, u32), Vec<PathBuf>)> = Vec::new();
    for path in blocks {
        let header = read_block_header(&path)?;
        let key = (header.signature_size, header.num_hashes);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(path),
            None => groups.push((key, vec![path])),
        }
    }

    let mut merged_any = false;
    let mut out_index = 0usize;
    for (_, members) in &groups {
        for chunk in members.chunks(fan_in) {
            out_index += 1;
            let out_path = out_dir.join(format!("{:07}.{}", out_index, BLOCK_EXTENSION));
            if chunk.len() == 1 {
                std::fs::rename(&chunk[0], &out_path)
                    .map_err(|e| SiftError::io(&chunk[0], "carry block over", e))?;
            } else {
                merge_blocks(chunk, &out_path)?;
                merged_any = true;
            }
        }
    }

    Ok(!merged_any)
}

// Byte-wise concatenation of input row r from each input, in order.
fn merge_blocks(inputs: &[PathBuf], out_path: &Path) -> Result<()> {
    let mut readers = Vec::with_capacity(inputs.len());
    for path in inputs {
        readers.push(BlockRows::open(path)?);
    }

    let first = readers[0].header().clone();
    let mut doc_names = Vec::new();
    for (i, reader) in readers.iter().enumerate() {
        let header = reader.header();
        if header.signature_size != first.signature_size || header.num_hashes != first.num_hashes {
            return Err(SiftError::invalid(format!(
                "cannot merge blocks with differing geometry ({} vs {})",
                inputs[0].display(),
                inputs[i].display()
            )));
        }
        // Interior padding bits would shift every later document's column.
        if i + 1 < readers.len() && header.num_docs() % 8 != 0 {
            return Err(SiftError::invalid(format!(
                "block {} has a partial trailing byte but is not the last of its group",
                inputs[i].display()
            )));
        }
        doc_names.extend(header.doc_names.iter().cloned());
    }

    let out_header = BlockHeader {
        signature_size: first.signature_size,
        num_hashes: first.num_hashes,
        doc_names,
    };

    let file = File::create(out_path).map_err(|e| SiftError::io(out_path, "create block", e))?;
    let mut writer = BufWriter::new(file);
    out_header
        .write_to(&mut writer)
        .map_err(|e| SiftError::io(out_path, "write block header", e))?;

    let strides: Vec<usize> = readers.iter().map(|r| r.header().row_bytes()).collect();
    let mut row = vec![0u8; strides.iter().copied().max().unwrap_or(0)];
    for _ in 0..first.signature_size {
        for (reader, &stride) in readers.iter_mut().zip(&strides) {
            let got = reader.next_row(&mut row[..stride])?;
            if !got {
                return Err(SiftError::corrupt(
                    out_path,
                    "input block ended before its declared signature size",
                ));
            }
            writer
                .write_all(&row[..stride])
                .map_err(|e| SiftError::io(out_path, "write block row", e))?;
        }
    }
    writer
        .flush()
        .map_err(|e| SiftError::io(out_path, "flush block", e))?;

    Ok(())
}
