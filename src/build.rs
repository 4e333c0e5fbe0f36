//! The indexing pipeline: corpus → samples → batches → Bloom blocks →
//! combined root blocks → compact index file.
//!
//! Every stage works through the filesystem under a scratch directory next
//! to the output file, so peak memory stays at one batch's bit matrix plus
//! the per-document k-mer buffers. Batches are independent and build
//! concurrently; a cancellation flag is honored between batches and a
//! partially written output never survives an abort.

use crate::bloom::{self, combine::combine_pass, combine::list_blocks};
use crate::error::{Result, SiftError};
use crate::index;
use crate::kmer;
use crate::sample::{SampleWriter, SAMPLE_EXTENSION};
use crate::scan::{DocumentEntry, DocumentList, FileType};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Validated parameters of one index build.
#[derive(Debug, Clone)]
pub struct BuildParams {
    pub k: u32,
    pub num_hashes: u32,
    pub false_positive: f64,
    /// Documents per batch; must be a multiple of 8.
    pub batch_size: usize,
    /// Row alignment of the final index; must be a multiple of 4096.
    pub page_size: u32,
    /// Blocks merged per combine step; 0 selects `batch_size / 8`.
    pub combine_fan_in: usize,
    pub canonical: bool,
    /// Assign batches by ascending document size instead of path order.
    pub sort_by_size: bool,
    /// Abort on per-document scan/extract failures instead of skipping.
    pub strict: bool,
    /// Narrow the corpus scan to one file type.
    pub file_type: FileType,
    /// K-mer count above which a document's sample spills to disk.
    pub spill_threshold: usize,
}

impl Default for BuildParams {
    fn default() -> Self {
        BuildParams {
            k: 31,
            num_hashes: 3,
            false_positive: 0.3,
            batch_size: 64,
            page_size: 4096,
            combine_fan_in: 0,
            canonical: true,
            sort_by_size: false,
            strict: false,
            file_type: FileType::Any,
            spill_threshold: crate::sample::DEFAULT_SPILL_THRESHOLD,
        }
    }
}

impl BuildParams {
    /// Check every precondition and resolve defaults.
    pub fn validated(mut self) -> Result<Self> {
        if self.k < 1 || self.k as usize > kmer::MAX_K {
            return Err(SiftError::invalid(format!(
                "k must be in 1..={} (got {})",
                kmer::MAX_K,
                self.k
            )));
        }
        if self.num_hashes < 1 {
            return Err(SiftError::invalid(format!(
                "num_hashes must be >= 1 (got {})",
                self.num_hashes
            )));
        }
        if !(self.false_positive > 0.0 && self.false_positive < 1.0) {
            return Err(SiftError::invalid(format!(
                "false-positive probability must be in (0, 1) (got {})",
                self.false_positive
            )));
        }
        if self.batch_size == 0 || self.batch_size % 8 != 0 {
            return Err(SiftError::invalid(format!(
                "batch_size must be a positive multiple of 8 (got {})",
                self.batch_size
            )));
        }
        if self.page_size == 0 || self.page_size % 4096 != 0 {
            return Err(SiftError::invalid(format!(
                "page_size must be a positive multiple of 4096 (got {})",
                self.page_size
            )));
        }
        if self.combine_fan_in == 0 {
            self.combine_fan_in = (self.batch_size / 8).max(2);
        }
        if self.combine_fan_in < 2 {
            return Err(SiftError::invalid(format!(
                "combine_fan_in must be >= 2 (got {})",
                self.combine_fan_in
            )));
        }
        Ok(self)
    }
}

/// Outcome of a successful build.
#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub documents: usize,
    pub layers: usize,
    pub output: PathBuf,
}

fn cancelled(path: &Path) -> SiftError {
    SiftError::io(
        path,
        "build",
        std::io::Error::new(std::io::ErrorKind::Interrupted, "build cancelled"),
    )
}

// Scratch directory removed on drop, success or failure.
struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    fn create(out_path: &Path) -> Result<Self> {
        let mut name = out_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "index".to_string());
        name.push_str(".work");
        let path = out_path.with_file_name(name);
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .map_err(|e| SiftError::io(&path, "clear scratch directory", e))?;
        }
        std::fs::create_dir_all(&path)
            .map_err(|e| SiftError::io(&path, "create scratch directory", e))?;
        Ok(WorkDir { path })
    }

    fn join(&self, sub: &str) -> PathBuf {
        self.path.join(sub)
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

// All sub-documents of one corpus file, with their global ordinals.
struct FileTask {
    path: PathBuf,
    file_type: FileType,
    // (subdoc_index, ordinal, document name)
    docs: Vec<(usize, usize, String)>,
}

/// Build a compact index over the corpus at `in_dir`.
pub fn build_index(
    in_dir: &Path,
    out_path: &Path,
    params: BuildParams,
    cancel: &AtomicBool,
) -> Result<BuildSummary> {
    let params = params.validated()?;

    let mut documents = DocumentList::scan(in_dir, params.file_type, params.strict)?;
    if params.sort_by_size {
        documents.sort_by_size();
    }

    // Cortex parsing is an external collaborator; classified but not indexed.
    let mut entries: Vec<DocumentEntry> = Vec::with_capacity(documents.len());
    for entry in documents.entries() {
        if entry.file_type == FileType::Cortex {
            if params.strict {
                return Err(SiftError::invalid(format!(
                    "cortex input is not supported: {}",
                    entry.path.display()
                )));
            }
            log::warn!("skipping cortex document {}", entry.path.display());
            continue;
        }
        entries.push(entry.clone());
    }

    log::info!(
        "indexing {} documents from {} (k={}, h={}, fp={}, batch={}, page={})",
        entries.len(),
        in_dir.display(),
        params.k,
        params.num_hashes,
        params.false_positive,
        params.batch_size,
        params.page_size
    );

    if entries.is_empty() {
        index::write_index(
            &[],
            out_path,
            params.k,
            params.canonical,
            params.num_hashes,
            params.page_size,
        )?;
        return Ok(BuildSummary {
            documents: 0,
            layers: 0,
            output: out_path.to_path_buf(),
        });
    }

    let work = WorkDir::create(out_path)?;

    // Stage 1: one sample per document.
    let samples_dir = work.join("samples");
    std::fs::create_dir_all(&samples_dir)
        .map_err(|e| SiftError::io(&samples_dir, "create directory", e))?;
    write_samples(&entries, &samples_dir, &params, cancel, out_path)?;

    // Stage 2: distribute samples into numbered batch directories.
    let batches_dir = work.join("batches");
    let batch_dirs = partition_batches(&samples_dir, &batches_dir, params.batch_size)?;

    // Stage 3: one Bloom block per batch, batches in parallel.
    let gen1 = work.join("bloom1");
    std::fs::create_dir_all(&gen1).map_err(|e| SiftError::io(&gen1, "create directory", e))?;
    batch_dirs
        .par_iter()
        .enumerate()
        .try_for_each(|(j, batch_dir)| -> Result<()> {
            if cancel.load(Ordering::Relaxed) {
                return Err(cancelled(out_path));
            }
            let samples = list_samples(batch_dir)?;
            log::info!("IN - {:07} - {} samples", j + 1, samples.len());
            let out = gen1.join(format!("{:07}.{}", j + 1, bloom::BLOCK_EXTENSION));
            bloom::build_block(
                &samples,
                &out,
                params.batch_size,
                params.num_hashes,
                params.false_positive,
                params.k,
            )?;
            log::info!("OK - {:07} - {} samples", j + 1, samples.len());
            Ok(())
        })?;

    // Stage 4: combine generations until each signature bucket has one root.
    let mut gen = 1usize;
    let roots_dir = loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(cancelled(out_path));
        }
        let in_gen = work.join(&format!("bloom{}", gen));
        let out_gen = work.join(&format!("bloom{}", gen + 1));
        let done = combine_pass(&in_gen, &out_gen, params.combine_fan_in)?;
        log::info!("combine pass {} -> {} (done: {})", gen, gen + 1, done);
        gen += 1;
        if done {
            break out_gen;
        }
    };

    // Stage 5: lay the root blocks out as the compact index.
    let roots = list_blocks(&roots_dir)?;
    index::write_index(
        &roots,
        out_path,
        params.k,
        params.canonical,
        params.num_hashes,
        params.page_size,
    )?;

    log::info!(
        "wrote {} ({} documents, {} layers)",
        out_path.display(),
        entries.len(),
        roots.len()
    );
    Ok(BuildSummary {
        documents: entries.len(),
        layers: roots.len(),
        output: out_path.to_path_buf(),
    })
}

fn sample_path(dir: &Path, ordinal: usize) -> PathBuf {
    dir.join(format!("{:07}.{}", ordinal, SAMPLE_EXTENSION))
}

fn write_samples(
    entries: &[DocumentEntry],
    samples_dir: &Path,
    params: &BuildParams,
    cancel: &AtomicBool,
    out_path: &Path,
) -> Result<()> {
    // Group sub-documents by file so multi-record files are read once.
    let mut tasks: Vec<FileTask> = Vec::new();
    for (ordinal, entry) in entries.iter().enumerate() {
        let doc = (entry.subdoc_index, ordinal, entry.display_name());
        match tasks.iter_mut().find(|t| t.path == entry.path) {
            Some(task) => task.docs.push(doc),
            None => tasks.push(FileTask {
                path: entry.path.clone(),
                file_type: entry.file_type,
                docs: vec![doc],
            }),
        }
    }

    let results: Vec<(usize, Result<()>)> = tasks
        .par_iter()
        .enumerate()
        .map(|(i, task)| {
            if cancel.load(Ordering::Relaxed) {
                return (i, Err(cancelled(out_path)));
            }
            (i, write_samples_for_file(task, samples_dir, params))
        })
        .collect();

    for (i, result) in results {
        if let Err(err) = result {
            // Drop every sample of the failed file so the document set stays
            // consistent with what was actually extracted.
            for (_, ordinal, _) in &tasks[i].docs {
                let _ = std::fs::remove_file(sample_path(samples_dir, *ordinal));
            }
            if params.strict || cancel.load(Ordering::Relaxed) {
                return Err(err);
            }
            log::warn!("skipping document {}: {}", tasks[i].path.display(), err);
        }
    }
    Ok(())
}

fn write_samples_for_file(task: &FileTask, samples_dir: &Path, params: &BuildParams) -> Result<()> {
    match task.file_type {
        FileType::Text => {
            let bytes = std::fs::read(&task.path)
                .map_err(|e| SiftError::io(&task.path, "read document", e))?;
            let (_, ordinal, name) = &task.docs[0];
            let mut writer = SampleWriter::new(params.k, params.spill_threshold);
            let mut kmers = Vec::new();
            kmer::extract_into(&bytes, params.k as usize, params.canonical, &mut kmers);
            writer.extend(&kmers)?;
            writer.finish(&sample_path(samples_dir, *ordinal), name)?;
        }
        FileType::KmerBuffer => {
            // Opaque sorted stream of 8-byte k-mers, already canonical.
            let bytes = std::fs::read(&task.path)
                .map_err(|e| SiftError::io(&task.path, "read document", e))?;
            if bytes.len() % 8 != 0 {
                return Err(SiftError::corrupt(
                    &task.path,
                    "k-mer buffer is not a multiple of 8 bytes",
                ));
            }
            let (_, ordinal, name) = &task.docs[0];
            let mut writer = SampleWriter::new(params.k, params.spill_threshold);
            for chunk in bytes.chunks_exact(8) {
                writer.push(u64::from_le_bytes(chunk.try_into().expect("8-byte chunk")))?;
            }
            writer.finish(&sample_path(samples_dir, *ordinal), name)?;
        }
        FileType::Fasta | FileType::Fastq => {
            let mut reader = needletail::parse_fastx_file(&task.path).map_err(|e| {
                SiftError::corrupt(&task.path, format!("cannot parse sequence file: {}", e))
            })?;
            let mut record_index = 0usize;
            let mut kmers = Vec::new();
            while let Some(record) = reader.next() {
                let record = record.map_err(|e| {
                    SiftError::corrupt(
                        &task.path,
                        format!("invalid record {}: {}", record_index, e),
                    )
                })?;
                if let Some((_, ordinal, name)) =
                    task.docs.iter().find(|(sub, _, _)| *sub == record_index)
                {
                    kmers.clear();
                    kmer::extract_into(
                        &record.seq(),
                        params.k as usize,
                        params.canonical,
                        &mut kmers,
                    );
                    let mut writer = SampleWriter::new(params.k, params.spill_threshold);
                    writer.extend(&kmers)?;
                    writer.finish(&sample_path(samples_dir, *ordinal), name)?;
                }
                record_index += 1;
            }
        }
        FileType::Cortex | FileType::Any => {
            unreachable!("filtered before sample writing")
        }
    }
    Ok(())
}

fn list_samples(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut samples = Vec::new();
    let read_dir = std::fs::read_dir(dir).map_err(|e| SiftError::io(dir, "read directory", e))?;
    for entry in read_dir {
        let entry = entry.map_err(|e| SiftError::io(dir, "read directory entry", e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(SAMPLE_EXTENSION) {
            samples.push(path);
        }
    }
    samples.sort();
    Ok(samples)
}

// Move sample files into numbered batch directories of `batch_size` each.
fn partition_batches(
    samples_dir: &Path,
    batches_dir: &Path,
    batch_size: usize,
) -> Result<Vec<PathBuf>> {
    let samples = list_samples(samples_dir)?;
    let mut batch_dirs = Vec::new();
    for (j, chunk) in samples.chunks(batch_size).enumerate() {
        let dir = batches_dir.join(format!("{:07}", j + 1));
        std::fs::create_dir_all(&dir).map_err(|e| SiftError::io(&dir, "create directory", e))?;
        for sample in chunk {
            let target = dir.join(sample.file_name().expect("sample files have names"));
            std::fs::rename(sample, &target)
                .map_err(|e| SiftError::io(sample, "move sample into batch", e))?;
        }
        batch_dirs.push(dir);
    }
    Ok(batch_dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::loader::MmapLoader;
    use crate::index::read_index_header;
    use crate::query::{search, QueryOptions};
    use std::fs;
    use tempfile::tempdir;

    fn no_cancel() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn test_params_validation() {
        assert!(BuildParams::default().validated().is_ok());
        assert!(BuildParams {
            k: 0,
            ..BuildParams::default()
        }
        .validated()
        .is_err());
        assert!(BuildParams {
            k: 33,
            ..BuildParams::default()
        }
        .validated()
        .is_err());
        assert!(BuildParams {
            batch_size: 12,
            ..BuildParams::default()
        }
        .validated()
        .is_err());
        assert!(BuildParams {
            page_size: 1000,
            ..BuildParams::default()
        }
        .validated()
        .is_err());
        assert!(BuildParams {
            false_positive: 1.0,
            ..BuildParams::default()
        }
        .validated()
        .is_err());

        let resolved = BuildParams {
            batch_size: 64,
            combine_fan_in: 0,
            ..BuildParams::default()
        }
        .validated()
        .unwrap();
        assert_eq!(resolved.combine_fan_in, 8);
    }

    #[test]
    fn test_empty_corpus_builds_empty_index() {
        let dir = tempdir().unwrap();
        let corpus = dir.path().join("corpus");
        fs::create_dir(&corpus).unwrap();
        let out = dir.path().join("empty.cobs_idx");

        let summary = build_index(&corpus, &out, BuildParams::default(), &no_cancel()).unwrap();
        assert_eq!(summary.documents, 0);
        assert_eq!(summary.layers, 0);

        let (header, _) = read_index_header(&out).unwrap();
        assert!(header.layers.is_empty());

        // Querying an empty index returns an empty result set.
        let mut loader = MmapLoader::open(&out).unwrap();
        let hits = search(&mut loader, "ACGTACGT", &QueryOptions::default()).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_build_and_query_small_corpus() {
        let dir = tempdir().unwrap();
        let corpus = dir.path().join("corpus");
        fs::create_dir(&corpus).unwrap();
        fs::write(corpus.join("doc1.txt"), "AAAAAAAA").unwrap();
        let out = dir.path().join("small.cobs_idx");

        let params = BuildParams {
            k: 4,
            num_hashes: 1,
            false_positive: 0.1,
            batch_size: 8,
            ..BuildParams::default()
        };
        let summary = build_index(&corpus, &out, params, &no_cancel()).unwrap();
        assert_eq!(summary.documents, 1);
        assert_eq!(summary.layers, 1);

        let mut loader = MmapLoader::open(&out).unwrap();
        let hits = search(&mut loader, "AAAA", &QueryOptions::default()).unwrap();
        assert_eq!(hits[0].name, "doc1");
        assert_eq!(hits[0].score, 1);
    }

    #[test]
    fn test_scratch_directory_removed() {
        let dir = tempdir().unwrap();
        let corpus = dir.path().join("corpus");
        fs::create_dir(&corpus).unwrap();
        fs::write(corpus.join("doc1.txt"), "ACGTACGTACGT").unwrap();
        let out = dir.path().join("x.cobs_idx");

        build_index(
            &corpus,
            &out,
            BuildParams {
                k: 4,
                ..BuildParams::default()
            },
            &no_cancel(),
        )
        .unwrap();
        assert!(!out.with_file_name("x.cobs_idx.work").exists());
    }

    #[test]
    fn test_cancellation_aborts_without_output() {
        let dir = tempdir().unwrap();
        let corpus = dir.path().join("corpus");
        fs::create_dir(&corpus).unwrap();
        for i in 0..4 {
            fs::write(corpus.join(format!("d{}.txt", i)), "ACGTACGTACGT").unwrap();
        }
        let out = dir.path().join("x.cobs_idx");

        let cancel = AtomicBool::new(true);
        let result = build_index(
            &corpus,
            &out,
            BuildParams {
                k: 4,
                ..BuildParams::default()
            },
            &cancel,
        );
        assert!(result.is_err());
        assert!(!out.exists());
    }

    #[test]
    fn test_multi_batch_corpus_total_docs() {
        let dir = tempdir().unwrap();
        let corpus = dir.path().join("corpus");
        fs::create_dir(&corpus).unwrap();
        // 20 identical-size documents, batch 8 -> 3 batches.
        for i in 0..20 {
            fs::write(
                corpus.join(format!("doc{:02}.txt", i)),
                "ACGTACGTACGTACGT",
            )
            .unwrap();
        }
        let out = dir.path().join("multi.cobs_idx");

        let params = BuildParams {
            k: 8,
            num_hashes: 2,
            batch_size: 8,
            combine_fan_in: 4,
            ..BuildParams::default()
        };
        let summary = build_index(&corpus, &out, params, &no_cancel()).unwrap();
        assert_eq!(summary.documents, 20);

        let (header, _) = read_index_header(&out).unwrap();
        assert_eq!(header.total_docs(), 20);
        // Equal-content documents share one signature size, so the combine
        // loop ends in a single root layer.
        assert_eq!(header.layers.len(), 1);
    }

    #[test]
    fn test_rebuild_is_byte_identical() {
        let dir = tempdir().unwrap();
        let corpus = dir.path().join("corpus");
        fs::create_dir(&corpus).unwrap();
        fs::write(corpus.join("a.txt"), "ACGTACGTACGT").unwrap();
        fs::write(corpus.join("b.txt"), "TTTTGGGGCCCC").unwrap();

        let params = BuildParams {
            k: 4,
            num_hashes: 2,
            batch_size: 8,
            ..BuildParams::default()
        };
        let out1 = dir.path().join("one.cobs_idx");
        let out2 = dir.path().join("two.cobs_idx");
        build_index(&corpus, &out1, params.clone(), &no_cancel()).unwrap();
        build_index(&corpus, &out2, params, &no_cancel()).unwrap();

        assert_eq!(fs::read(&out1).unwrap(), fs::read(&out2).unwrap());
    }
}
