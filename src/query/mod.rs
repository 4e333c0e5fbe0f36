//! The query engine: score documents by the number of query k-mers whose
//! hash bits are all set in the document's Bloom column.
//!
//! The algorithm is written once over the `RowReader` capability, so the
//! mmap and O_DIRECT loaders share it. For each query k-mer the `h` fetched
//! rows are ANDed byte-wise; each surviving bit then increments the count of
//! the document at that column, 8 documents per byte. Results are ranked by
//! (score descending, document index ascending).

use crate::error::{Result, SiftError};
use crate::hashing::fill_row_hashes;
use crate::index::loader::{required_slots, RowBuffer, RowReader};
use crate::index::LayerParams;
use crate::kmer;
use rayon::prelude::*;

/// Options controlling one search.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Number of top documents to return.
    pub num_results: usize,
    /// Caller's configured k; must match the index when given.
    pub expected_k: Option<u32>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            num_results: 100,
            expected_k: None,
        }
    }
}

/// One scored document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocHit {
    pub doc_index: usize,
    pub name: String,
    /// Count of query k-mers with all hash bits set for this document.
    pub score: u32,
    /// `score / num_query_kmers` (0 for an empty query).
    pub fraction: f64,
}

/// Search an index for a query sequence.
///
/// Query k-mers are scored with multiplicity: a repeated k-mer contributes
/// its full repeat count. A query shorter than `k` yields zero k-mers and
/// all-zero scores, not an error.
pub fn search<R: RowReader + ?Sized>(
    reader: &mut R,
    query: &str,
    opts: &QueryOptions,
) -> Result<Vec<DocHit>> {
    let header = reader.header().clone();

    if let Some(expected) = opts.expected_k {
        if expected != header.k {
            return Err(SiftError::invalid(format!(
                "index was built with k={}, query tooling is configured for k={}",
                header.k, expected
            )));
        }
    }

    let total_docs = header.total_docs() as usize;
    if total_docs == 0 {
        return Ok(Vec::new());
    }

    let kmers = kmer::extract(query.as_bytes(), header.k as usize, header.canonical);
    let num_kmers = kmers.len();
    let num_hashes = header.num_hashes as usize;

    let mut counts = vec![0u32; total_docs];
    if num_kmers > 0 {
        let mut hashes = Vec::new();
        fill_row_hashes(&kmers, num_hashes, &mut hashes);

        let mut rows = RowBuffer::new(
            required_slots(&header, hashes.len()),
            header.page_size as usize,
        )?;
        reader.fetch_rows(&hashes, &mut rows)?;

        // Layers cover disjoint document ranges; score them in parallel.
        let mut slices: Vec<(usize, &LayerParams, &mut [u32])> = Vec::new();
        let mut rest: &mut [u32] = counts.as_mut_slice();
        for (i, layer) in header.layers.iter().enumerate() {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(layer.num_docs as usize);
            slices.push((i, layer, head));
            rest = tail;
        }
        let slot_count = hashes.len();
        slices
            .into_par_iter()
            .for_each(|(layer_index, layer, layer_counts)| {
                score_layer(
                    &rows,
                    layer_index * slot_count,
                    layer,
                    num_kmers,
                    num_hashes,
                    layer_counts,
                );
            });
    }

    let mut ranked: Vec<usize> = (0..total_docs).collect();
    ranked.sort_by(|&a, &b| counts[b].cmp(&counts[a]).then(a.cmp(&b)));
    ranked.truncate(opts.num_results);

    Ok(ranked
        .into_iter()
        .map(|doc_index| DocHit {
            doc_index,
            name: header.doc_names[doc_index].clone(),
            score: counts[doc_index],
            fraction: if num_kmers > 0 {
                f64::from(counts[doc_index]) / num_kmers as f64
            } else {
                0.0
            },
        })
        .collect())
}

// AND the h rows of each query k-mer, then count surviving bits per
// document column. The inner loop handles 8 documents per row byte.
fn score_layer(
    rows: &RowBuffer,
    slot_base: usize,
    layer: &LayerParams,
    num_kmers: usize,
    num_hashes: usize,
    counts: &mut [u32],
) {
    let stride = layer.row_bytes();
    let num_docs = layer.num_docs as usize;
    let mut matched = vec![0u8; stride];

    for q in 0..num_kmers {
        let first = rows.slot(slot_base + q * num_hashes);
        matched.copy_from_slice(&first[..stride]);
        for t in 1..num_hashes {
            let row = rows.slot(slot_base + q * num_hashes + t);
            for (m, &b) in matched.iter_mut().zip(&row[..stride]) {
                *m &= b;
            }
        }

        for (c, &m) in matched.iter().enumerate() {
            if m == 0 {
                continue;
            }
            let base = c * 8;
            let width = 8.min(num_docs - base);
            for bit in 0..width {
                counts[base + bit] += u32::from((m >> bit) & 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::loader::MmapLoader;
    use crate::index::{write_index, IndexHeader};
    use crate::bloom::block::build_block;
    use crate::sample::SampleWriter;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    fn write_doc_sample(dir: &Path, ordinal: usize, name: &str, seq: &[u8], k: u32) -> PathBuf {
        let path = dir.join(format!("{:07}.sift_sample", ordinal));
        let mut kmers = kmer::extract(seq, k as usize, true);
        kmers.sort_unstable();
        kmers.dedup();
        let mut writer = SampleWriter::new(k, 1 << 20);
        writer.extend(&kmers).unwrap();
        writer.finish(&path, name).unwrap();
        path
    }

    fn build_tiny_index(dir: &Path, docs: &[(&str, &[u8])], k: u32, h: u32) -> PathBuf {
        let samples: Vec<PathBuf> = docs
            .iter()
            .enumerate()
            .map(|(i, (name, seq))| write_doc_sample(dir, i + 1, name, seq, k))
            .collect();
        let block = dir.join("0000001.sift_blk");
        build_block(&samples, &block, 8, h, 0.1, k).unwrap();
        let index = dir.join("t.cobs_idx");
        write_index(&[block], &index, k, true, h, 4096).unwrap();
        index
    }

    #[test]
    fn test_no_false_negatives() {
        let dir = tempdir().unwrap();
        let index = build_tiny_index(
            dir.path(),
            &[("a", b"ACGTACGTAC"), ("b", b"TTTTTTTTTT")],
            4,
            3,
        );
        let mut loader = MmapLoader::open(&index).unwrap();

        // Every k-mer of document a must be found in document a.
        let hits = search(&mut loader, "ACGTACGTAC", &QueryOptions::default()).unwrap();
        let a = hits.iter().find(|h| h.name == "a").unwrap();
        assert_eq!(a.score, 7, "all 7 query k-mers occur in a");
        assert!((a.fraction - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_score_bounded_by_query_size() {
        let dir = tempdir().unwrap();
        let index = build_tiny_index(
            dir.path(),
            &[("a", b"ACGTACGTAC"), ("b", b"TTTTTTTTTT")],
            4,
            3,
        );
        let mut loader = MmapLoader::open(&index).unwrap();

        let query = "ACGTAAC";
        let q = kmer::extract(query.as_bytes(), 4, true).len() as u32;
        let hits = search(&mut loader, query, &QueryOptions::default()).unwrap();
        for hit in &hits {
            assert!(hit.score <= q);
        }
    }

    #[test]
    fn test_ranking_ties_by_doc_index() {
        let dir = tempdir().unwrap();
        // Identical documents: identical scores, order by index.
        let index = build_tiny_index(
            dir.path(),
            &[("x", b"ACGTACGT"), ("y", b"ACGTACGT"), ("z", b"ACGTACGT")],
            4,
            2,
        );
        let mut loader = MmapLoader::open(&index).unwrap();

        let hits = search(&mut loader, "ACGTACGT", &QueryOptions::default()).unwrap();
        let indices: Vec<usize> = hits.iter().map(|h| h.doc_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_num_results_truncates() {
        let dir = tempdir().unwrap();
        let index = build_tiny_index(
            dir.path(),
            &[("x", b"ACGTACGT"), ("y", b"ACGTACGT"), ("z", b"ACGTACGT")],
            4,
            2,
        );
        let mut loader = MmapLoader::open(&index).unwrap();

        let opts = QueryOptions {
            num_results: 2,
            ..QueryOptions::default()
        };
        let hits = search(&mut loader, "ACGTACGT", &opts).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_query_shorter_than_k_scores_zero() {
        let dir = tempdir().unwrap();
        let index = build_tiny_index(dir.path(), &[("a", b"ACGTACGT")], 4, 2);
        let mut loader = MmapLoader::open(&index).unwrap();

        let hits = search(&mut loader, "ACG", &QueryOptions::default()).unwrap();
        assert!(hits.iter().all(|h| h.score == 0));
        assert!(hits.iter().all(|h| h.fraction == 0.0));
    }

    #[test]
    fn test_k_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let index = build_tiny_index(dir.path(), &[("a", b"ACGTACGT")], 4, 2);
        let mut loader = MmapLoader::open(&index).unwrap();

        let opts = QueryOptions {
            expected_k: Some(31),
            ..QueryOptions::default()
        };
        match search(&mut loader, "ACGTACGT", &opts) {
            Err(SiftError::InvalidParameters(msg)) => assert!(msg.contains("k=")),
            other => panic!("expected InvalidParameters, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_query_multiplicity_counts() {
        let dir = tempdir().unwrap();
        let index = build_tiny_index(dir.path(), &[("a", b"AAAAAAAA")], 4, 2);
        let mut loader = MmapLoader::open(&index).unwrap();

        // "AAAAAA" has 3 windows of AAAA; all identical, scored 3 times.
        let hits = search(&mut loader, "AAAAAA", &QueryOptions::default()).unwrap();
        assert_eq!(hits[0].score, 3);
    }

    // Compile-time check that search works through a trait object, the way
    // the CLI dispatches over engines.
    #[allow(dead_code)]
    fn assert_object_safe(reader: &mut dyn RowReader) -> Result<Vec<DocHit>> {
        search(reader, "ACGT", &QueryOptions::default())
    }

    #[allow(dead_code)]
    fn assert_header_clone(h: &IndexHeader) -> IndexHeader {
        h.clone()
    }
}
