//! Corpus scanning: walk a directory, classify files, expand multi-record
//! files into sub-documents, and hand out batches in a deterministic order.
//!
//! The scanner accepts `.txt`, `.ctx`, `.cobs_doc`, `.fasta` and `.fastq`
//! files. FASTA/FASTQ files contribute one document per record, each with
//! its own sub-document index and record size. The resulting list is sorted
//! by path (stable across runs) or by size ascending with a path tie-break;
//! the sort order decides which documents share a batch.

use crate::error::{Result, SiftError};
use needletail::parse_fastx_file;
use std::path::{Path, PathBuf};

/// Document file types, used both as a scan filter and as an entry tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Any,
    Text,
    Cortex,
    KmerBuffer,
    Fasta,
    Fastq,
}

impl FileType {
    /// Classify a path by extension; `None` for unrecognized files.
    pub fn classify(path: &Path) -> Option<FileType> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("txt") => Some(FileType::Text),
            Some("ctx") => Some(FileType::Cortex),
            Some("cobs_doc") => Some(FileType::KmerBuffer),
            Some("fasta") => Some(FileType::Fasta),
            Some("fastq") => Some(FileType::Fastq),
            _ => None,
        }
    }

    /// Whether a path passes this filter.
    pub fn accepts(self, path: &Path) -> bool {
        match FileType::classify(path) {
            None => false,
            Some(t) => self == FileType::Any || self == t,
        }
    }
}

/// A document or sub-document that can deliver a k-mer set for indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEntry {
    pub path: PathBuf,
    pub file_type: FileType,
    /// Size in bytes; for FASTA/FASTQ records, the record's sequence length.
    pub size: u64,
    /// Sub-document index within a multi-record file (0 otherwise).
    pub subdoc_index: usize,
}

impl DocumentEntry {
    /// Column name of this document in the index.
    ///
    /// Single-document files use their file stem; records of multi-record
    /// files get a `_N` suffix in record order.
    pub fn display_name(&self) -> String {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned());
        match self.file_type {
            FileType::Fasta | FileType::Fastq => format!("{}_{}", stem, self.subdoc_index),
            _ => stem,
        }
    }
}

/// A classified, ordered list of documents under a corpus directory.
#[derive(Debug, Default)]
pub struct DocumentList {
    entries: Vec<DocumentEntry>,
}

impl DocumentList {
    /// Recursively scan `dir`, keeping files accepted by `filter`.
    ///
    /// Unreadable multi-record files are logged and skipped unless `strict`.
    /// The list comes back sorted by path.
    pub fn scan(dir: &Path, filter: FileType, strict: bool) -> Result<Self> {
        let mut files = Vec::new();
        collect_files(dir, &mut files)?;

        let mut entries = Vec::new();
        for path in files {
            if !filter.accepts(&path) {
                continue;
            }
            if let Err(err) = add_entries(&path, &mut entries) {
                if strict {
                    return Err(err);
                }
                log::warn!("skipping document {}: {}", path.display(), err);
            }
        }

        entries.sort_by(|a, b| {
            a.path
                .cmp(&b.path)
                .then(a.subdoc_index.cmp(&b.subdoc_index))
        });
        Ok(DocumentList { entries })
    }

    /// Build from an explicit entry list (sorted by path).
    pub fn from_entries(mut entries: Vec<DocumentEntry>) -> Self {
        entries.sort_by(|a, b| {
            a.path
                .cmp(&b.path)
                .then(a.subdoc_index.cmp(&b.subdoc_index))
        });
        DocumentList { entries }
    }

    /// Re-sort by size ascending, ties broken by path then sub-index.
    pub fn sort_by_size(&mut self) {
        self.entries.sort_by(|a, b| {
            (a.size, &a.path, a.subdoc_index).cmp(&(b.size, &b.path, b.subdoc_index))
        });
    }

    pub fn entries(&self) -> &[DocumentEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `func` over consecutive batches of up to `batch_size` entries.
    ///
    /// The batch label (`[first-last]`) and the 1-based zero-padded batch
    /// number are logged around each call, mirroring the build progress
    /// banner of the pipeline.
    pub fn process_batches<F>(&self, batch_size: usize, mut func: F) -> Result<()>
    where
        F: FnMut(usize, &[DocumentEntry]) -> Result<()>,
    {
        for (j, batch) in self.entries.chunks(batch_size).enumerate() {
            let first = batch.first().map(|e| e.display_name()).unwrap_or_default();
            let last = batch.last().map(|e| e.display_name()).unwrap_or_default();
            log::info!("IN - {:07} - [{}-{}]", j + 1, first, last);
            func(j, batch)?;
            log::info!("OK - {:07} - [{}-{}]", j + 1, first, last);
        }
        Ok(())
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let read_dir = std::fs::read_dir(dir).map_err(|e| SiftError::io(dir, "read directory", e))?;
    for entry in read_dir {
        let entry = entry.map_err(|e| SiftError::io(dir, "read directory entry", e))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| SiftError::io(&path, "stat", e))?;
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

// One entry for plain files; one entry per record for FASTA/FASTQ.
fn add_entries(path: &Path, out: &mut Vec<DocumentEntry>) -> Result<()> {
    let file_type = match FileType::classify(path) {
        Some(t) => t,
        None => return Ok(()),
    };

    match file_type {
        FileType::Text | FileType::Cortex | FileType::KmerBuffer => {
            let size = std::fs::metadata(path)
                .map_err(|e| SiftError::io(path, "stat", e))?
                .len();
            out.push(DocumentEntry {
                path: path.to_path_buf(),
                file_type,
                size,
                subdoc_index: 0,
            });
        }
        FileType::Fasta | FileType::Fastq => {
            let mut reader = parse_fastx_file(path).map_err(|e| {
                SiftError::corrupt(path, format!("cannot parse sequence file: {}", e))
            })?;
            let mut subdoc_index = 0usize;
            while let Some(record) = reader.next() {
                let record = record.map_err(|e| {
                    SiftError::corrupt(path, format!("invalid record {}: {}", subdoc_index, e))
                })?;
                out.push(DocumentEntry {
                    path: path.to_path_buf(),
                    file_type,
                    size: record.seq().len() as u64,
                    subdoc_index,
                });
                subdoc_index += 1;
            }
        }
        FileType::Any => unreachable!("classify never returns Any"),
    }
    Ok(())
}
