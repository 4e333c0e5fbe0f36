//! Index loaders: resolve layer offsets and deliver bit-rows to the query
//! engine.
//!
//! Two loaders share the `RowReader` capability: `MmapLoader` maps the whole
//! file read-only and copies rows out of the mapping, `DirectIoLoader`
//! (Linux) opens the file with `O_DIRECT` and fetches rows with batched
//! io_uring reads into a page-aligned buffer. Both fill the same buffer
//! layout: slot `i * hashes.len() + j` holds layer *i*'s row for hash *j*.

use crate::error::{Result, SiftError};
use crate::index::{read_index_header, IndexHeader};
use memmap2::Mmap;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::File;
use std::path::Path;
#[cfg(target_os = "linux")]
use std::path::PathBuf;

/// O_DIRECT requires buffers aligned to the logical block size; 4096 covers
/// every common device and is the minimum index page size anyway.
const BUFFER_ALIGN: usize = 4096;

/// A page-aligned row buffer with one `page_size` slot per fetched row.
pub struct RowBuffer {
    ptr: *mut u8,
    slots: usize,
    page_size: usize,
}

// The buffer is an exclusively owned allocation; slot access follows the
// usual borrow rules.
unsafe impl Send for RowBuffer {}
unsafe impl Sync for RowBuffer {}

impl RowBuffer {
    pub fn new(slots: usize, page_size: usize) -> Result<Self> {
        if page_size == 0 || page_size % BUFFER_ALIGN != 0 {
            return Err(SiftError::invalid(format!(
                "row buffer page size must be a positive multiple of {} (got {})",
                BUFFER_ALIGN, page_size
            )));
        }
        let capacity = slots.max(1) * page_size;
        let layout = Layout::from_size_align(capacity, BUFFER_ALIGN)
            .map_err(|e| SiftError::invalid(format!("row buffer layout: {}", e)))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(SiftError::invalid(format!(
                "row buffer allocation of {} bytes failed",
                capacity
            )));
        }
        Ok(RowBuffer {
            ptr,
            slots,
            page_size,
        })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn slot(&self, i: usize) -> &[u8] {
        assert!(i < self.slots);
        unsafe { std::slice::from_raw_parts(self.ptr.add(i * self.page_size), self.page_size) }
    }

    pub fn slot_mut(&mut self, i: usize) -> &mut [u8] {
        assert!(i < self.slots);
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.add(i * self.page_size), self.page_size)
        }
    }

    #[cfg(target_os = "linux")]
    fn slot_ptr(&mut self, i: usize) -> *mut u8 {
        assert!(i < self.slots);
        unsafe { self.ptr.add(i * self.page_size) }
    }
}

impl Drop for RowBuffer {
    fn drop(&mut self) {
        let capacity = self.slots.max(1) * self.page_size;
        let layout = Layout::from_size_align(capacity, BUFFER_ALIGN).expect("valid by construction");
        unsafe { dealloc(self.ptr, layout) };
    }
}

/// The loader capability shared by the query engines.
///
/// `fetch_rows` receives the raw 64-bit hashes of the query (all hash
/// functions of all query k-mers) and fills `rows` so that slot
/// `i * hashes.len() + j` holds layer *i*'s row `hashes[j] %
/// signature_size_i`. Only the leading `row_bytes` of each slot are
/// meaningful; the engines never read past them.
pub trait RowReader {
    fn header(&self) -> &IndexHeader;

    fn fetch_rows(&mut self, hashes: &[u64], rows: &mut RowBuffer) -> Result<()>;
}

/// Number of buffer slots `fetch_rows` needs for a hash list.
pub fn required_slots(header: &IndexHeader, num_hashes: usize) -> usize {
    header.layers.len() * num_hashes
}

/// Memory-mapped loader.
pub struct MmapLoader {
    header: IndexHeader,
    offsets: Vec<u64>,
    mmap: Mmap,
}

impl MmapLoader {
    pub fn open(path: &Path) -> Result<Self> {
        let (header, data_start) = read_index_header(path)?;
        let offsets = header.layer_offsets(data_start);

        let file = File::open(path).map_err(|e| SiftError::io(path, "open index", e))?;
        let mmap =
            unsafe { Mmap::map(&file) }.map_err(|e| SiftError::io(path, "mmap index", e))?;

        let expected_len = offsets
            .last()
            .map(|&base| {
                base + u64::from(header.page_size)
                    * header.layers.last().map(|l| l.signature_size).unwrap_or(0)
            })
            .unwrap_or(data_start);
        if (mmap.len() as u64) < expected_len {
            return Err(SiftError::corrupt(
                path,
                format!(
                    "index truncated: {} bytes on disk, {} required by header",
                    mmap.len(),
                    expected_len
                ),
            ));
        }

        Ok(MmapLoader {
            header,
            offsets,
            mmap,
        })
    }
}

impl RowReader for MmapLoader {
    fn header(&self) -> &IndexHeader {
        &self.header
    }

    fn fetch_rows(&mut self, hashes: &[u64], rows: &mut RowBuffer) -> Result<()> {
        debug_assert!(rows.slots() >= required_slots(&self.header, hashes.len()));
        let page_size = u64::from(self.header.page_size);
        for (i, layer) in self.header.layers.iter().enumerate() {
            let stride = layer.row_bytes();
            for (j, &hash) in hashes.iter().enumerate() {
                let row = hash % layer.signature_size;
                let src = (self.offsets[i] + row * page_size) as usize;
                let slot = rows.slot_mut(i * hashes.len() + j);
                slot[..stride].copy_from_slice(&self.mmap[src..src + stride]);
            }
        }
        Ok(())
    }
}

/// O_DIRECT + io_uring loader.
#[cfg(target_os = "linux")]
pub struct DirectIoLoader {
    path: PathBuf,
    header: IndexHeader,
    offsets: Vec<u64>,
    file: File,
    ring: io_uring::IoUring,
}

#[cfg(target_os = "linux")]
impl DirectIoLoader {
    /// In-flight read depth of the io_uring submission queue.
    pub const QUEUE_DEPTH: u32 = 4096;

    pub fn open(path: &Path) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        let (header, data_start) = read_index_header(path)?;

        let os_page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if os_page <= 0 || u64::from(header.page_size) % (os_page as u64) != 0 {
            return Err(SiftError::invalid(format!(
                "index page size {} is not a multiple of the OS page size {}",
                header.page_size, os_page
            )));
        }

        let offsets = header.layer_offsets(data_start);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)
            .map_err(|e| SiftError::io(path, "open index with O_DIRECT", e))?;
        let ring = io_uring::IoUring::new(Self::QUEUE_DEPTH)
            .map_err(|e| SiftError::io(path, "io_uring setup", e))?;

        Ok(DirectIoLoader {
            path: path.to_path_buf(),
            header,
            offsets,
            file,
            ring,
        })
    }
}

#[cfg(target_os = "linux")]
impl RowReader for DirectIoLoader {
    fn header(&self) -> &IndexHeader {
        &self.header
    }

    fn fetch_rows(&mut self, hashes: &[u64], rows: &mut RowBuffer) -> Result<()> {
        use io_uring::{opcode, types};
        use std::os::unix::io::AsRawFd;

        debug_assert!(rows.slots() >= required_slots(&self.header, hashes.len()));
        let page_size = u64::from(self.header.page_size);
        let fd = self.file.as_raw_fd();

        // (slot, file offset) of every row to read.
        let total = self.header.layers.len() * hashes.len();
        let mut requests = Vec::with_capacity(total);
        for (i, layer) in self.header.layers.iter().enumerate() {
            for (j, &hash) in hashes.iter().enumerate() {
                let row = hash % layer.signature_size;
                requests.push((i * hashes.len() + j, self.offsets[i] + row * page_size));
            }
        }

        // Submit in waves bounded by the ring depth.
        let mut next = 0usize;
        let mut completed = 0usize;
        while completed < total {
            {
                let mut sq = self.ring.submission();
                while next < total && !sq.is_full() {
                    let (slot, offset) = requests[next];
                    let sqe = opcode::Read::new(
                        types::Fd(fd),
                        rows.slot_ptr(slot),
                        self.header.page_size,
                    )
                    .offset(offset)
                    .build()
                    .user_data(slot as u64);
                    // SAFETY: the buffer slot outlives the ring round-trip;
                    // completions are drained before fetch_rows returns.
                    unsafe {
                        sq.push(&sqe).map_err(|_| {
                            SiftError::io(
                                &self.path,
                                "io_uring submit",
                                std::io::Error::new(
                                    std::io::ErrorKind::Other,
                                    "submission queue full",
                                ),
                            )
                        })?;
                    }
                    next += 1;
                }
                sq.sync();
            }

            self.ring
                .submit_and_wait(1)
                .map_err(|e| SiftError::io(&self.path, "io_uring submit_and_wait", e))?;

            for cqe in self.ring.completion() {
                let res = cqe.result();
                if res < 0 {
                    return Err(SiftError::io(
                        &self.path,
                        "io_uring read",
                        std::io::Error::from_raw_os_error(-res),
                    ));
                }
                if res as u32 != self.header.page_size {
                    return Err(SiftError::io(
                        &self.path,
                        "io_uring read",
                        std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!("short read of {} bytes at slot {}", res, cqe.user_data()),
                        ),
                    ));
                }
                completed += 1;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::block::build_block;
    use crate::index::write_index;
    use crate::sample::SampleWriter;
    use tempfile::tempdir;

    #[test]
    fn test_row_buffer_alignment_and_access() {
        let mut buf = RowBuffer::new(4, 4096).unwrap();
        assert_eq!(buf.slots(), 4);
        assert_eq!(buf.page_size(), 4096);
        assert_eq!(buf.slot(0).as_ptr() as usize % 4096, 0);
        buf.slot_mut(3)[0] = 0xAB;
        assert_eq!(buf.slot(3)[0], 0xAB);
        assert_eq!(buf.slot(0)[0], 0);
    }

    #[test]
    fn test_row_buffer_rejects_unaligned_page() {
        assert!(RowBuffer::new(1, 1000).is_err());
        assert!(RowBuffer::new(1, 0).is_err());
    }

    #[test]
    fn test_mmap_loader_fetches_built_rows() {
        let dir = tempdir().unwrap();

        // Two single-doc samples -> one block -> one-layer index.
        let mut writer = SampleWriter::new(9, 1 << 20);
        writer.extend(&[11, 22, 33]).unwrap();
        let s0 = dir.path().join("0000001.sift_sample");
        writer.finish(&s0, "d0").unwrap();
        let mut writer = SampleWriter::new(9, 1 << 20);
        writer.extend(&[44]).unwrap();
        let s1 = dir.path().join("0000002.sift_sample");
        writer.finish(&s1, "d1").unwrap();

        let block = dir.path().join("0000001.sift_blk");
        let block_header = build_block(&[s0, s1], &block, 8, 2, 0.2, 9).unwrap();

        let index = dir.path().join("t.cobs_idx");
        write_index(&[block], &index, 9, true, 2, 4096).unwrap();

        let mut loader = MmapLoader::open(&index).unwrap();
        assert_eq!(loader.header().layers.len(), 1);
        assert_eq!(loader.header().doc_names, vec!["d0", "d1"]);

        // Fetch the rows of k-mer 11 and check doc 0's bits are set.
        let hashes: Vec<u64> = (0..2u64)
            .map(|seed| crate::hashing::hash_kmer(11, seed))
            .collect();
        let mut rows = RowBuffer::new(required_slots(loader.header(), 2), 4096).unwrap();
        loader.fetch_rows(&hashes, &mut rows).unwrap();
        for j in 0..2 {
            assert_ne!(rows.slot(j)[0] & 1, 0, "hash {} row must have doc 0 set", j);
        }
        let _ = block_header;
    }

    #[test]
    fn test_mmap_loader_rejects_truncated_index() {
        let dir = tempdir().unwrap();

        let mut writer = SampleWriter::new(9, 1 << 20);
        writer.extend(&[7]).unwrap();
        let s0 = dir.path().join("0000001.sift_sample");
        writer.finish(&s0, "d0").unwrap();
        let block = dir.path().join("0000001.sift_blk");
        build_block(&[s0], &block, 8, 1, 0.3, 9).unwrap();
        let index = dir.path().join("t.cobs_idx");
        write_index(&[block], &index, 9, true, 1, 4096).unwrap();

        let full = std::fs::metadata(&index).unwrap().len();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&index)
            .unwrap();
        file.set_len(full - 4096).unwrap();

        match MmapLoader::open(&index) {
            Err(SiftError::Corrupt { detail, .. }) => assert!(detail.contains("truncated")),
            other => panic!("expected Corrupt, got {:?}", other.map(|_| ())),
        }
    }
}
