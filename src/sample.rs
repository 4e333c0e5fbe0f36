//! Sample files: the deduplicated, sorted k-mer set of one document.
//!
//! On disk a sample is a small header followed by the payload of strictly
//! ascending little-endian u64 k-mers. Samples are written once during the
//! ingest stage and read-only afterwards.
//!
//! The writer keeps memory bounded: once a document's k-mer buffer exceeds
//! the spill threshold, the buffer is sorted, deduplicated and flushed to a
//! temporary run file; `finish` merges all runs with a k-way heap merge and
//! streams the union to the final file.

use crate::error::{Result, SiftError};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

// Distinguishes the spill runs of concurrently writing workers.
static SPILL_COUNTER: AtomicU64 = AtomicU64::new(0);

pub const SAMPLE_MAGIC: &[u8; 4] = b"SIFS";
pub const SAMPLE_VERSION: u32 = 1;

/// File extension of sample files (without the leading dot).
pub const SAMPLE_EXTENSION: &str = "sift_sample";

/// Spill to disk once a single document has this many buffered k-mers
/// (64 Mi k-mers = 512 MiB).
pub const DEFAULT_SPILL_THRESHOLD: usize = 1 << 26;

// Byte offset of the num_kmers field, patched after streaming the payload.
const NUM_KMERS_OFFSET: u64 = 12;

/// Header of a sample file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleHeader {
    pub k: u32,
    pub num_kmers: u64,
    pub name: String,
}

impl SampleHeader {
    /// Serialized size of this header in bytes.
    pub fn byte_len(&self) -> u64 {
        4 + 4 + 4 + 8 + 2 + self.name.len() as u64
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(SAMPLE_MAGIC)?;
        w.write_all(&SAMPLE_VERSION.to_le_bytes())?;
        w.write_all(&self.k.to_le_bytes())?;
        w.write_all(&self.num_kmers.to_le_bytes())?;
        let name_bytes = self.name.as_bytes();
        w.write_all(&(name_bytes.len() as u16).to_le_bytes())?;
        w.write_all(name_bytes)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R, path: &Path) -> Result<Self> {
        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];
        let mut buf2 = [0u8; 2];

        r.read_exact(&mut buf4)
            .map_err(|e| SiftError::io(path, "read sample magic", e))?;
        if &buf4 != SAMPLE_MAGIC {
            return Err(SiftError::corrupt(path, "invalid sample magic"));
        }

        r.read_exact(&mut buf4)
            .map_err(|e| SiftError::io(path, "read sample version", e))?;
        let version = u32::from_le_bytes(buf4);
        if version != SAMPLE_VERSION {
            return Err(SiftError::VersionMismatch {
                have: version,
                want: SAMPLE_VERSION,
            });
        }

        r.read_exact(&mut buf4)
            .map_err(|e| SiftError::io(path, "read sample k", e))?;
        let k = u32::from_le_bytes(buf4);

        r.read_exact(&mut buf8)
            .map_err(|e| SiftError::io(path, "read sample k-mer count", e))?;
        let num_kmers = u64::from_le_bytes(buf8);

        r.read_exact(&mut buf2)
            .map_err(|e| SiftError::io(path, "read sample name length", e))?;
        let name_len = u16::from_le_bytes(buf2) as usize;
        let mut name_buf = vec![0u8; name_len];
        r.read_exact(&mut name_buf)
            .map_err(|e| SiftError::io(path, "read sample name", e))?;
        let name = String::from_utf8(name_buf)
            .map_err(|_| SiftError::corrupt(path, "sample name is not UTF-8"))?;

        Ok(SampleHeader { k, num_kmers, name })
    }
}

/// Read only the header of a sample file.
pub fn read_header(path: &Path) -> Result<SampleHeader> {
    let file = File::open(path).map_err(|e| SiftError::io(path, "open sample", e))?;
    let mut reader = BufReader::new(file);
    SampleHeader::read_from(&mut reader, path)
}

/// Read a whole sample, validating strict monotonicity of the payload.
pub fn read_sample(path: &Path) -> Result<(SampleHeader, Vec<u64>)> {
    let file = File::open(path).map_err(|e| SiftError::io(path, "open sample", e))?;
    let mut reader = BufReader::new(file);
    let header = SampleHeader::read_from(&mut reader, path)?;

    let mut kmers = Vec::with_capacity(header.num_kmers as usize);
    let mut buf8 = [0u8; 8];
    let mut prev: Option<u64> = None;
    for i in 0..header.num_kmers {
        reader
            .read_exact(&mut buf8)
            .map_err(|e| SiftError::io(path, "read sample payload", e))?;
        let kmer = u64::from_le_bytes(buf8);
        if let Some(p) = prev {
            if kmer <= p {
                return Err(SiftError::corrupt(
                    path,
                    format!("nonmonotone sample payload at entry {}", i),
                ));
            }
        }
        kmers.push(kmer);
        prev = Some(kmer);
    }
    Ok((header, kmers))
}

/// A streaming reader over a sample payload.
///
/// Yields k-mers in file order and fails on nonmonotone data, so downstream
/// consumers never see an invalid sample.
pub struct SampleReader {
    path: PathBuf,
    reader: BufReader<File>,
    header: SampleHeader,
    read: u64,
    prev: Option<u64>,
}

impl SampleReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| SiftError::io(path, "open sample", e))?;
        let mut reader = BufReader::new(file);
        let header = SampleHeader::read_from(&mut reader, path)?;
        Ok(SampleReader {
            path: path.to_path_buf(),
            reader,
            header,
            read: 0,
            prev: None,
        })
    }

    pub fn header(&self) -> &SampleHeader {
        &self.header
    }

    /// Next k-mer, or `None` at the end of the payload.
    pub fn next_kmer(&mut self) -> Result<Option<u64>> {
        if self.read == self.header.num_kmers {
            return Ok(None);
        }
        let mut buf8 = [0u8; 8];
        self.reader
            .read_exact(&mut buf8)
            .map_err(|e| SiftError::io(&self.path, "read sample payload", e))?;
        let kmer = u64::from_le_bytes(buf8);
        if let Some(p) = self.prev {
            if kmer <= p {
                return Err(SiftError::corrupt(
                    &self.path,
                    format!("nonmonotone sample payload at entry {}", self.read),
                ));
            }
        }
        self.read += 1;
        self.prev = Some(kmer);
        Ok(Some(kmer))
    }
}

// A spilled run: sorted unique k-mers as raw LE u64s in a temp file.
struct RunStream {
    reader: BufReader<File>,
    next: Option<u64>,
}

impl RunStream {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| SiftError::io(path, "open spill run", e))?;
        let mut stream = RunStream {
            reader: BufReader::new(file),
            next: None,
        };
        stream.advance()?;
        Ok(stream)
    }

    fn advance(&mut self) -> Result<()> {
        let mut buf8 = [0u8; 8];
        match self.reader.read_exact(&mut buf8) {
            Ok(()) => {
                self.next = Some(u64::from_le_bytes(buf8));
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.next = None;
                Ok(())
            }
            Err(e) => Err(SiftError::io(Path::new("<spill run>"), "read spill run", e)),
        }
    }
}

/// Accumulates one document's k-mers and writes them as a sample file.
pub struct SampleWriter {
    k: u32,
    spill_threshold: usize,
    buf: Vec<u64>,
    spill_dir: PathBuf,
    runs: Vec<PathBuf>,
}

impl SampleWriter {
    pub fn new(k: u32, spill_threshold: usize) -> Self {
        SampleWriter {
            k,
            spill_threshold: spill_threshold.max(1),
            buf: Vec::new(),
            spill_dir: std::env::temp_dir(),
            runs: Vec::new(),
        }
    }

    /// Buffered + spilled k-mer count so far (before deduplication).
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, kmer: u64) -> Result<()> {
        self.buf.push(kmer);
        if self.buf.len() >= self.spill_threshold {
            self.spill()?;
        }
        Ok(())
    }

    pub fn extend(&mut self, kmers: &[u64]) -> Result<()> {
        for &kmer in kmers {
            self.push(kmer)?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        self.buf.sort_unstable();
        self.buf.dedup();

        let run_id = SPILL_COUNTER.fetch_add(1, Ordering::Relaxed);
        let run_path = self
            .spill_dir
            .join(format!("sift-spill-{}-{}.run", std::process::id(), run_id));
        let file =
            File::create(&run_path).map_err(|e| SiftError::io(&run_path, "create spill run", e))?;
        let mut writer = BufWriter::new(file);
        for &kmer in &self.buf {
            writer
                .write_all(&kmer.to_le_bytes())
                .map_err(|e| SiftError::io(&run_path, "write spill run", e))?;
        }
        writer
            .flush()
            .map_err(|e| SiftError::io(&run_path, "flush spill run", e))?;

        log::info!(
            "spilled {} k-mers to {}",
            self.buf.len(),
            run_path.display()
        );
        self.runs.push(run_path);
        self.buf.clear();
        Ok(())
    }

    /// Sort, deduplicate and write the accumulated set to `path`.
    ///
    /// Returns the number of unique k-mers written. Spill runs are merged
    /// with a k-way heap merge so the peak memory stays at one buffer.
    pub fn finish(mut self, path: &Path, name: &str) -> Result<u64> {
        self.buf.sort_unstable();
        self.buf.dedup();

        let file = File::create(path).map_err(|e| SiftError::io(path, "create sample", e))?;
        let mut writer = BufWriter::new(file);

        let header = SampleHeader {
            k: self.k,
            num_kmers: 0,
            name: name.to_string(),
        };
        header
            .write_to(&mut writer)
            .map_err(|e| SiftError::io(path, "write sample header", e))?;

        let count = if self.runs.is_empty() {
            for &kmer in &self.buf {
                writer
                    .write_all(&kmer.to_le_bytes())
                    .map_err(|e| SiftError::io(path, "write sample payload", e))?;
            }
            self.buf.len() as u64
        } else {
            self.merge_runs(&mut writer, path)?
        };

        // Patch the k-mer count now that it is known.
        let mut file = writer
            .into_inner()
            .map_err(|e| SiftError::io(path, "flush sample", e.into_error()))?;
        file.seek(SeekFrom::Start(NUM_KMERS_OFFSET))
            .map_err(|e| SiftError::io(path, "seek sample header", e))?;
        file.write_all(&count.to_le_bytes())
            .map_err(|e| SiftError::io(path, "patch sample header", e))?;

        for run in &self.runs {
            let _ = std::fs::remove_file(run);
        }
        self.runs.clear();
        Ok(count)
    }

    // K-way merge of spill runs plus the in-memory buffer, deduplicating on
    // the fly. Heap entries are (Reverse(kmer), stream_index); the in-memory
    // buffer is stream usize::MAX.
    fn merge_runs(&mut self, writer: &mut BufWriter<File>, path: &Path) -> Result<u64> {
        let mut streams = Vec::with_capacity(self.runs.len());
        for run in &self.runs {
            streams.push(RunStream::open(run)?);
        }

        let mut heap: BinaryHeap<(Reverse<u64>, usize)> = BinaryHeap::new();
        for (idx, stream) in streams.iter().enumerate() {
            if let Some(kmer) = stream.next {
                heap.push((Reverse(kmer), idx));
            }
        }
        let mut buf_pos = 0usize;
        if buf_pos < self.buf.len() {
            heap.push((Reverse(self.buf[buf_pos]), usize::MAX));
        }

        let mut count = 0u64;
        let mut last: Option<u64> = None;
        while let Some((Reverse(kmer), idx)) = heap.pop() {
            if last != Some(kmer) {
                writer
                    .write_all(&kmer.to_le_bytes())
                    .map_err(|e| SiftError::io(path, "write sample payload", e))?;
                count += 1;
                last = Some(kmer);
            }

            if idx == usize::MAX {
                buf_pos += 1;
                if buf_pos < self.buf.len() {
                    heap.push((Reverse(self.buf[buf_pos]), usize::MAX));
                }
            } else {
                streams[idx].advance()?;
                if let Some(next) = streams[idx].next {
                    heap.push((Reverse(next), idx));
                }
            }
        }
        Ok(count)
    }
}

impl Drop for SampleWriter {
    fn drop(&mut self) {
        for run in &self.runs {
            let _ = std::fs::remove_file(run);
        }
    }
}
