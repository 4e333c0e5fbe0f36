//! The compact index: header layout and assembly from root blocks.
//!
//! The on-disk file is a versioned header (magic, geometry, layer table,
//! fixed-width document names) padded to a `page_size` boundary, followed by
//! one contiguous region per layer. Row *r* of layer *i* starts at
//! `base_i + r * page_size`; rows are right-padded with zeros to
//! `page_size`, which lets the query engines address rows with pure offset
//! arithmetic under both mmap and O_DIRECT.

pub mod loader;

use crate::bloom::block::BlockRows;
use crate::error::{Result, SiftError};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const INDEX_MAGIC: &[u8; 4] = b"COBS";
pub const INDEX_VERSION: u32 = 1;

/// File extension of compact index files (without the leading dot).
pub const INDEX_EXTENSION: &str = "cobs_idx";

/// Geometry of one parameter layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerParams {
    pub signature_size: u64,
    pub num_docs: u64,
}

impl LayerParams {
    /// Payload bytes per row: `ceil(num_docs / 8)`.
    pub fn row_bytes(&self) -> usize {
        ((self.num_docs + 7) / 8) as usize
    }
}

/// Parsed header of a compact index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    pub k: u32,
    pub num_hashes: u32,
    pub canonical: bool,
    pub page_size: u32,
    pub layers: Vec<LayerParams>,
    /// Names of all documents, in layer order.
    pub doc_names: Vec<String>,
}

impl IndexHeader {
    pub fn total_docs(&self) -> u64 {
        self.layers.iter().map(|l| l.num_docs).sum()
    }

    /// Serialize the header, zero-padded to the next `page_size` boundary.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let name_width = self
            .doc_names
            .iter()
            .map(|n| n.len())
            .max()
            .unwrap_or(0);
        if name_width > u8::MAX as usize {
            return Err(SiftError::invalid(format!(
                "document name exceeds 255 bytes ({} bytes)",
                name_width
            )));
        }

        let mut out = Vec::new();
        out.extend_from_slice(INDEX_MAGIC);
        out.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        out.extend_from_slice(&self.k.to_le_bytes());
        out.extend_from_slice(&self.num_hashes.to_le_bytes());
        out.push(self.canonical as u8);
        out.extend_from_slice(&self.page_size.to_le_bytes());
        out.extend_from_slice(&(self.layers.len() as u32).to_le_bytes());
        for layer in &self.layers {
            out.extend_from_slice(&layer.signature_size.to_le_bytes());
            out.extend_from_slice(&layer.num_docs.to_le_bytes());
        }
        out.push(name_width as u8);
        for name in &self.doc_names {
            out.extend_from_slice(name.as_bytes());
            out.resize(out.len() + name_width - name.len(), 0);
        }

        let page = self.page_size as usize;
        let padded = out.len().div_ceil(page) * page;
        out.resize(padded, 0);
        Ok(out)
    }

    /// Parse a header, returning it together with the byte offset of the
    /// first layer region.
    pub fn read_from<R: Read>(r: &mut R, path: &Path) -> Result<(Self, u64)> {
        let mut buf1 = [0u8; 1];
        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];

        r.read_exact(&mut buf4)
            .map_err(|e| SiftError::io(path, "read index magic", e))?;
        if &buf4 != INDEX_MAGIC {
            return Err(SiftError::corrupt(path, "invalid index magic"));
        }

        r.read_exact(&mut buf4)
            .map_err(|e| SiftError::io(path, "read index version", e))?;
        let version = u32::from_le_bytes(buf4);
        if version != INDEX_VERSION {
            return Err(SiftError::VersionMismatch {
                have: version,
                want: INDEX_VERSION,
            });
        }

        r.read_exact(&mut buf4)
            .map_err(|e| SiftError::io(path, "read index k", e))?;
        let k = u32::from_le_bytes(buf4);

        r.read_exact(&mut buf4)
            .map_err(|e| SiftError::io(path, "read index hash count", e))?;
        let num_hashes = u32::from_le_bytes(buf4);

        r.read_exact(&mut buf1)
            .map_err(|e| SiftError::io(path, "read index canonical flag", e))?;
        let canonical = buf1[0] != 0;

        r.read_exact(&mut buf4)
            .map_err(|e| SiftError::io(path, "read index page size", e))?;
        let page_size = u32::from_le_bytes(buf4);
        if page_size == 0 || page_size % 4096 != 0 {
            return Err(SiftError::corrupt(
                path,
                format!("page size {} is not a positive multiple of 4096", page_size),
            ));
        }

        r.read_exact(&mut buf4)
            .map_err(|e| SiftError::io(path, "read index layer count", e))?;
        let num_layers = u32::from_le_bytes(buf4) as usize;

        let mut layers = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            r.read_exact(&mut buf8)
                .map_err(|e| SiftError::io(path, "read layer signature size", e))?;
            let signature_size = u64::from_le_bytes(buf8);
            if signature_size == 0 {
                return Err(SiftError::corrupt(path, "zero layer signature size"));
            }
            r.read_exact(&mut buf8)
                .map_err(|e| SiftError::io(path, "read layer doc count", e))?;
            let num_docs = u64::from_le_bytes(buf8);
            layers.push(LayerParams {
                signature_size,
                num_docs,
            });
        }

        r.read_exact(&mut buf1)
            .map_err(|e| SiftError::io(path, "read name width", e))?;
        let name_width = buf1[0] as usize;

        let total_docs: u64 = layers.iter().map(|l| l.num_docs).sum();
        let mut doc_names = Vec::with_capacity(total_docs as usize);
        let mut name_buf = vec![0u8; name_width];
        for _ in 0..total_docs {
            r.read_exact(&mut name_buf)
                .map_err(|e| SiftError::io(path, "read doc name", e))?;
            let end = name_buf
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(name_width);
            let name = std::str::from_utf8(&name_buf[..end])
                .map_err(|_| SiftError::corrupt(path, "doc name is not UTF-8"))?;
            doc_names.push(name.to_string());
        }

        let header = IndexHeader {
            k,
            num_hashes,
            canonical,
            page_size,
            layers,
            doc_names,
        };

        let raw_len = 4 + 4 + 4 + 4 + 1 + 4 + 4
            + 16 * header.layers.len()
            + 1
            + name_width * header.doc_names.len();
        let page = page_size as u64;
        let data_start = (raw_len as u64).div_ceil(page) * page;
        Ok((header, data_start))
    }

    /// Byte offset of each layer region, given the data start offset.
    pub fn layer_offsets(&self, data_start: u64) -> Vec<u64> {
        let mut offsets = Vec::with_capacity(self.layers.len());
        let mut base = data_start;
        for layer in &self.layers {
            offsets.push(base);
            base += u64::from(self.page_size) * layer.signature_size;
        }
        offsets
    }
}

/// Open an index file and parse its header.
pub fn read_index_header(path: &Path) -> Result<(IndexHeader, u64)> {
    let file = File::open(path).map_err(|e| SiftError::io(path, "open index", e))?;
    let mut reader = BufReader::new(file);
    IndexHeader::read_from(&mut reader, path)
}

// Removes a partially written index on drop unless committed.
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

/// Assemble the compact index from the root blocks, one layer per block.
///
/// Blocks must share `num_hashes`; each layer's rows are streamed out
/// zero-padded to `page_size`. An empty `roots` slice produces a valid
/// zero-layer index.
pub fn write_index(
    roots: &[PathBuf],
    out_path: &Path,
    k: u32,
    canonical: bool,
    num_hashes: u32,
    page_size: u32,
) -> Result<()> {
    if page_size == 0 || page_size % 4096 != 0 {
        return Err(SiftError::invalid(format!(
            "page_size must be a positive multiple of 4096 (got {})",
            page_size
        )));
    }

    let mut readers = Vec::with_capacity(roots.len());
    let mut layers = Vec::with_capacity(roots.len());
    let mut doc_names = Vec::new();
    for path in roots {
        let rows = BlockRows::open(path)?;
        let header = rows.header();
        if header.num_hashes != num_hashes {
            return Err(SiftError::invalid(format!(
                "block {} was built with {} hashes, index uses {}",
                path.display(),
                header.num_hashes,
                num_hashes
            )));
        }
        if header.row_bytes() > page_size as usize {
            return Err(SiftError::invalid(format!(
                "layer of {} documents needs {} bytes per row; raise page_size above {}",
                header.num_docs(),
                header.row_bytes(),
                page_size
            )));
        }
        layers.push(LayerParams {
            signature_size: header.signature_size,
            num_docs: header.num_docs() as u64,
        });
        doc_names.extend(header.doc_names.iter().cloned());
        readers.push(rows);
    }

    let index_header = IndexHeader {
        k,
        num_hashes,
        canonical,
        page_size,
        layers,
        doc_names,
    };
    let header_bytes = index_header.serialize()?;

    let mut guard = CommitGuard {
        path: out_path.to_path_buf(),
        committed: false,
    };
    let file = File::create(out_path).map_err(|e| SiftError::io(out_path, "create index", e))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(&header_bytes)
        .map_err(|e| SiftError::io(out_path, "write index header", e))?;

    let mut page = vec![0u8; page_size as usize];
    for (reader, layer) in readers.iter_mut().zip(&index_header.layers) {
        let stride = layer.row_bytes();
        for _ in 0..layer.signature_size {
            page[stride..].iter_mut().for_each(|b| *b = 0);
            let got = reader.next_row(&mut page[..stride])?;
            if !got {
                return Err(SiftError::corrupt(
                    out_path,
                    "root block ended before its declared signature size",
                ));
            }
            writer
                .write_all(&page)
                .map_err(|e| SiftError::io(out_path, "write index rows", e))?;
        }
    }
    writer
        .flush()
        .map_err(|e| SiftError::io(out_path, "flush index", e))?;
    guard.committed = true;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_header() -> IndexHeader {
        IndexHeader {
            k: 31,
            num_hashes: 3,
            canonical: true,
            page_size: 4096,
            layers: vec![
                LayerParams {
                    signature_size: 100,
                    num_docs: 8,
                },
                LayerParams {
                    signature_size: 250,
                    num_docs: 5,
                },
            ],
            doc_names: (0..13).map(|i| format!("doc{}", i)).collect(),
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let bytes = header.serialize().unwrap();
        assert_eq!(bytes.len() % 4096, 0);

        let (parsed, data_start) =
            IndexHeader::read_from(&mut bytes.as_slice(), Path::new("mem")).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(data_start, bytes.len() as u64);
        assert_eq!(parsed.total_docs(), 13);
    }

    #[test]
    fn test_layer_offsets() {
        let header = sample_header();
        let offsets = header.layer_offsets(4096);
        assert_eq!(offsets, vec![4096, 4096 + 4096 * 100]);
    }

    #[test]
    fn test_row_bytes() {
        assert_eq!(
            LayerParams {
                signature_size: 1,
                num_docs: 8
            }
            .row_bytes(),
            1
        );
        assert_eq!(
            LayerParams {
                signature_size: 1,
                num_docs: 9
            }
            .row_bytes(),
            2
        );
    }

    #[test]
    fn test_corrupt_magic() {
        let header = sample_header();
        let mut bytes = header.serialize().unwrap();
        bytes[0] = b'X';
        match IndexHeader::read_from(&mut bytes.as_slice(), Path::new("mem")) {
            Err(SiftError::Corrupt { .. }) => {}
            other => panic!("expected Corrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unknown_version_refused() {
        let header = sample_header();
        let mut bytes = header.serialize().unwrap();
        bytes[4..8].copy_from_slice(&77u32.to_le_bytes());
        match IndexHeader::read_from(&mut bytes.as_slice(), Path::new("mem")) {
            Err(SiftError::VersionMismatch { have: 77, want: 1 }) => {}
            other => panic!("expected VersionMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_empty_index_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.cobs_idx");
        write_index(&[], &path, 31, true, 3, 4096).unwrap();

        let (header, data_start) = read_index_header(&path).unwrap();
        assert!(header.layers.is_empty());
        assert_eq!(header.total_docs(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), data_start);
    }

    #[test]
    fn test_bad_page_size_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.cobs_idx");
        assert!(write_index(&[], &path, 31, true, 3, 4095).is_err());
        assert!(write_index(&[], &path, 31, true, 3, 0).is_err());
    }
}
