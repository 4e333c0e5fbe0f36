//! Bloom blocks: the column-stacked bit matrix of one document batch.
//!
//! A block stores `signature_size` rows of `ceil(num_docs / 8)` bytes;
//! column *j* is the Bloom filter of the *j*-th document. Document *j*'s bit
//! in a row is bit `j % 8` of byte `j / 8` — this packing order is a format
//! contract shared with the query engine.

use crate::bloom::sizing;
use crate::error::{Result, SiftError};
use crate::hashing::hash_kmer;
use crate::sample::{self, SampleReader};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const BLOCK_MAGIC: &[u8; 4] = b"SIFB";
pub const BLOCK_VERSION: u32 = 1;

/// File extension of Bloom block files (without the leading dot).
pub const BLOCK_EXTENSION: &str = "sift_blk";

/// Header of a Bloom block file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub signature_size: u64,
    pub num_hashes: u32,
    pub doc_names: Vec<String>,
}

impl BlockHeader {
    pub fn num_docs(&self) -> usize {
        self.doc_names.len()
    }

    /// Bytes per row: `ceil(num_docs / 8)`.
    pub fn row_bytes(&self) -> usize {
        (self.num_docs() + 7) / 8
    }

    fn names_size(&self) -> usize {
        self.doc_names.iter().map(|n| 2 + n.len()).sum()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(BLOCK_MAGIC)?;
        w.write_all(&BLOCK_VERSION.to_le_bytes())?;
        w.write_all(&self.signature_size.to_le_bytes())?;
        w.write_all(&self.num_hashes.to_le_bytes())?;
        w.write_all(&(self.num_docs() as u32).to_le_bytes())?;
        w.write_all(&(self.names_size() as u32).to_le_bytes())?;
        for name in &self.doc_names {
            w.write_all(&(name.len() as u16).to_le_bytes())?;
            w.write_all(name.as_bytes())?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R, path: &Path) -> Result<Self> {
        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];
        let mut buf2 = [0u8; 2];

        r.read_exact(&mut buf4)
            .map_err(|e| SiftError::io(path, "read block magic", e))?;
        if &buf4 != BLOCK_MAGIC {
            return Err(SiftError::corrupt(path, "invalid block magic"));
        }

        r.read_exact(&mut buf4)
            .map_err(|e| SiftError::io(path, "read block version", e))?;
        let version = u32::from_le_bytes(buf4);
        if version != BLOCK_VERSION {
            return Err(SiftError::VersionMismatch {
                have: version,
                want: BLOCK_VERSION,
            });
        }

        r.read_exact(&mut buf8)
            .map_err(|e| SiftError::io(path, "read block signature size", e))?;
        let signature_size = u64::from_le_bytes(buf8);
        if signature_size == 0 {
            return Err(SiftError::corrupt(path, "zero signature size"));
        }

        r.read_exact(&mut buf4)
            .map_err(|e| SiftError::io(path, "read block hash count", e))?;
        let num_hashes = u32::from_le_bytes(buf4);

        r.read_exact(&mut buf4)
            .map_err(|e| SiftError::io(path, "read block doc count", e))?;
        let num_docs = u32::from_le_bytes(buf4) as usize;

        r.read_exact(&mut buf4)
            .map_err(|e| SiftError::io(path, "read block names size", e))?;
        let names_size = u32::from_le_bytes(buf4) as usize;

        let mut doc_names = Vec::with_capacity(num_docs);
        let mut consumed = 0usize;
        for _ in 0..num_docs {
            r.read_exact(&mut buf2)
                .map_err(|e| SiftError::io(path, "read doc name length", e))?;
            let len = u16::from_le_bytes(buf2) as usize;
            let mut name_buf = vec![0u8; len];
            r.read_exact(&mut name_buf)
                .map_err(|e| SiftError::io(path, "read doc name", e))?;
            consumed += 2 + len;
            doc_names.push(
                String::from_utf8(name_buf)
                    .map_err(|_| SiftError::corrupt(path, "doc name is not UTF-8"))?,
            );
        }
        if consumed != names_size {
            return Err(SiftError::corrupt(
                path,
                format!(
                    "doc name section size mismatch ({} recorded, {} read)",
                    names_size, consumed
                ),
            ));
        }

        let header = BlockHeader {
            signature_size,
            num_hashes,
            doc_names,
        };
        Ok(header)
    }

    /// Serialized header size, which is also the payload offset.
    pub fn byte_len(&self) -> u64 {
        (4 + 4 + 8 + 4 + 4 + 4 + self.names_size()) as u64
    }
}

/// Read only the header of a block file.
pub fn read_block_header(path: &Path) -> Result<BlockHeader> {
    let file = File::open(path).map_err(|e| SiftError::io(path, "open block", e))?;
    let mut reader = BufReader::new(file);
    BlockHeader::read_from(&mut reader, path)
}

// Removes the partially written block on drop unless committed.
struct CommitGuard {
    path: PathBuf,
    committed: bool,
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Build one Bloom block from a batch of sample files.
///
/// Sizing follows the largest sample in the batch so the per-document
/// false-positive rate stays within the target for every member. The bit
/// matrix is kept column-byte-major in memory so that 8-document groups can
/// be filled in parallel without sharing bytes; serialization transposes it
/// to the row-major on-disk order.
pub fn build_block(
    samples: &[PathBuf],
    out_path: &Path,
    batch_size: usize,
    num_hashes: u32,
    fp: f64,
    expected_k: u32,
) -> Result<BlockHeader> {
    if batch_size % 8 != 0 {
        return Err(SiftError::invalid(format!(
            "batch_size must be a multiple of 8 (got {})",
            batch_size
        )));
    }
    if samples.is_empty() || samples.len() > batch_size {
        return Err(SiftError::invalid(format!(
            "batch must hold 1..={} samples (got {})",
            batch_size,
            samples.len()
        )));
    }

    // One header scan: document names and the sizing element count.
    let mut doc_names = Vec::with_capacity(samples.len());
    let mut max_kmers = 0u64;
    for path in samples {
        let header = sample::read_header(path)?;
        if header.k != expected_k {
            return Err(SiftError::corrupt(
                path,
                format!("sample k={} does not match build k={}", header.k, expected_k),
            ));
        }
        max_kmers = max_kmers.max(header.num_kmers);
        doc_names.push(header.name);
    }

    let signature_size = sizing::signature_size(max_kmers.max(1), num_hashes, fp)?;
    let num_docs = samples.len();
    let row_bytes = (num_docs + 7) / 8;

    // Column-byte-major matrix: byte c of every row lives in the contiguous
    // slice matrix[c * signature_size ..][.. signature_size], owned by the
    // worker filling documents 8c .. 8c+8.
    let sig = signature_size as usize;
    let mut matrix = vec![0u8; row_bytes * sig];

    matrix
        .par_chunks_mut(sig)
        .enumerate()
        .try_for_each(|(c, column)| -> Result<()> {
            let group = &samples[c * 8..((c + 1) * 8).min(num_docs)];
            for (bit, sample_path) in group.iter().enumerate() {
                let mask = 1u8 << bit;
                let mut reader = SampleReader::open(sample_path)?;
                while let Some(kmer) = reader.next_kmer()? {
                    for seed in 0..u64::from(num_hashes) {
                        let row = hash_kmer(kmer, seed) % signature_size;
                        column[row as usize] |= mask;
                    }
                }
            }
            Ok(())
        })?;

    let header = BlockHeader {
        signature_size,
        num_hashes,
        doc_names,
    };

    let mut guard = CommitGuard {
        path: out_path.to_path_buf(),
        committed: false,
    };
    let file = File::create(out_path).map_err(|e| SiftError::io(out_path, "create block", e))?;
    let mut writer = BufWriter::new(file);
    header
        .write_to(&mut writer)
        .map_err(|e| SiftError::io(out_path, "write block header", e))?;

    // Transpose to row-major while streaming out.
    let mut row = vec![0u8; row_bytes];
    for r in 0..sig {
        for (c, byte) in row.iter_mut().enumerate() {
            *byte = matrix[c * sig + r];
        }
        writer
            .write_all(&row)
            .map_err(|e| SiftError::io(out_path, "write block row", e))?;
    }
    writer
        .flush()
        .map_err(|e| SiftError::io(out_path, "flush block", e))?;
    guard.committed = true;

    Ok(header)
}

/// Streaming row reader over a block payload.
pub struct BlockRows {
    path: PathBuf,
    reader: BufReader<File>,
    header: BlockHeader,
    rows_read: u64,
}

impl BlockRows {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| SiftError::io(path, "open block", e))?;
        let mut reader = BufReader::new(file);
        let header = BlockHeader::read_from(&mut reader, path)?;
        Ok(BlockRows {
            path: path.to_path_buf(),
            reader,
            header,
            rows_read: 0,
        })
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// Read the next row into `row` (must be `row_bytes()` long).
    pub fn next_row(&mut self, row: &mut [u8]) -> Result<bool> {
        debug_assert_eq!(row.len(), self.header.row_bytes());
        if self.rows_read == self.header.signature_size {
            return Ok(false);
        }
        self.reader
            .read_exact(row)
            .map_err(|e| SiftError::io(&self.path, "read block row", e))?;
        self.rows_read += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleWriter;
    use tempfile::tempdir;

    fn write_sample(dir: &Path, name: &str, k: u32, kmers: &[u64]) -> PathBuf {
        let path = dir.join(format!("{}.sift_sample", name));
        let mut writer = SampleWriter::new(k, 1 << 20);
        writer.extend(kmers).unwrap();
        writer.finish(&path, name).unwrap();
        path
    }

    #[test]
    fn test_header_roundtrip() {
        let header = BlockHeader {
            signature_size: 1234,
            num_hashes: 3,
            doc_names: vec!["a".to_string(), "b".to_string()],
        };
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len() as u64, header.byte_len());

        let parsed = BlockHeader::read_from(&mut bytes.as_slice(), Path::new("mem")).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.row_bytes(), 1);
    }

    #[test]
    fn test_build_block_sets_expected_bits() {
        let dir = tempdir().unwrap();
        let s0 = write_sample(dir.path(), "d0", 9, &[10, 20]);
        let s1 = write_sample(dir.path(), "d1", 9, &[30]);

        let out = dir.path().join("0000001.sift_blk");
        let header = build_block(&[s0, s1], &out, 8, 2, 0.3, 9).unwrap();
        assert_eq!(header.num_docs(), 2);
        assert_eq!(header.row_bytes(), 1);

        // Load the payload and verify every expected bit is set.
        let mut rows = BlockRows::open(&out).unwrap();
        let sig = rows.header().signature_size;
        let mut payload = Vec::new();
        let mut row = vec![0u8; 1];
        while rows.next_row(&mut row).unwrap() {
            payload.push(row[0]);
        }
        assert_eq!(payload.len() as u64, sig);

        for (doc, kmers) in [(0usize, vec![10u64, 20]), (1usize, vec![30u64])] {
            for kmer in kmers {
                for seed in 0..2u64 {
                    let r = (hash_kmer(kmer, seed) % sig) as usize;
                    assert_ne!(payload[r] & (1 << doc), 0, "doc {} kmer {}", doc, kmer);
                }
            }
        }
    }

    #[test]
    fn test_build_block_rejects_bad_batch_size() {
        let dir = tempdir().unwrap();
        let s0 = write_sample(dir.path(), "d0", 9, &[1]);
        let out = dir.path().join("x.sift_blk");
        assert!(build_block(&[s0], &out, 7, 1, 0.3, 9).is_err());
    }

    #[test]
    fn test_build_block_rejects_k_mismatch() {
        let dir = tempdir().unwrap();
        let s0 = write_sample(dir.path(), "d0", 15, &[1]);
        let out = dir.path().join("x.sift_blk");
        match build_block(&[s0], &out, 8, 1, 0.3, 31) {
            Err(SiftError::Corrupt { .. }) => {}
            other => panic!("expected Corrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_empty_document_column_is_zero() {
        let dir = tempdir().unwrap();
        let s0 = write_sample(dir.path(), "full", 9, &[5, 6, 7]);
        let s1 = write_sample(dir.path(), "empty", 9, &[]);

        let out = dir.path().join("0000001.sift_blk");
        build_block(&[s0, s1], &out, 8, 3, 0.1, 9).unwrap();

        let mut rows = BlockRows::open(&out).unwrap();
        let mut row = vec![0u8; 1];
        while rows.next_row(&mut row).unwrap() {
            assert_eq!(row[0] & 0b10, 0, "empty document must have an all-zero column");
        }
    }
}
