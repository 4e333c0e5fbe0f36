use crate::build::BuildParams;
use crate::error::{Result, SiftError};
use crate::scan::FileType;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// TOML build configuration, an alternative to passing every flag.
///
/// ```toml
/// [index]
/// k = 31
/// num_hashes = 3
/// false_positive = 0.3
/// batch_size = 64
/// page_size = 4096
///
/// [corpus]
/// input = "docs"
/// output = "corpus.cobs_idx"
/// ```
#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    pub index: IndexSettings,
    pub corpus: CorpusSettings,
}

#[derive(Debug, Deserialize)]
pub struct IndexSettings {
    #[serde(default = "default_k")]
    pub k: u32,
    #[serde(default = "default_num_hashes")]
    pub num_hashes: u32,
    #[serde(default = "default_false_positive")]
    pub false_positive: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// 0 selects the default of batch_size / 8.
    #[serde(default)]
    pub combine_fan_in: usize,
    #[serde(default = "default_true")]
    pub canonical: bool,
}

#[derive(Debug, Deserialize)]
pub struct CorpusSettings {
    pub input: PathBuf,
    pub output: PathBuf,
    #[serde(default)]
    pub sort_by_size: bool,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub file_type: Option<String>,
}

fn default_k() -> u32 {
    31
}

fn default_num_hashes() -> u32 {
    3
}

fn default_false_positive() -> f64 {
    0.3
}

fn default_batch_size() -> usize {
    64
}

fn default_page_size() -> u32 {
    4096
}

fn default_true() -> bool {
    true
}

pub fn parse_config(path: &Path) -> Result<ConfigFile> {
    let contents =
        fs::read_to_string(path).map_err(|e| SiftError::io(path, "read config file", e))?;

    let config: ConfigFile = toml::from_str(&contents).map_err(|e| {
        SiftError::invalid(format!("cannot parse config {}: {}", path.display(), e))
    })?;

    if config.corpus.input.as_os_str().is_empty() {
        return Err(SiftError::invalid("config must set [corpus].input"));
    }
    if config.corpus.output.as_os_str().is_empty() {
        return Err(SiftError::invalid("config must set [corpus].output"));
    }
    Ok(config)
}

/// Parse a file-type name as used by the CLI and config files.
pub fn parse_file_type(name: &str) -> Result<FileType> {
    match name.to_ascii_lowercase().as_str() {
        "any" => Ok(FileType::Any),
        "text" => Ok(FileType::Text),
        "cortex" => Ok(FileType::Cortex),
        "kmer-buffer" | "kmer_buffer" => Ok(FileType::KmerBuffer),
        "fasta" => Ok(FileType::Fasta),
        "fastq" => Ok(FileType::Fastq),
        other => Err(SiftError::invalid(format!(
            "unknown file type '{}' (use any, text, cortex, kmer-buffer, fasta, fastq)",
            other
        ))),
    }
}

/// Resolve a possibly relative config path against the config file's
/// directory.
pub fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl ConfigFile {
    /// Lower the config into validated-at-build-time parameters.
    pub fn to_build_params(&self) -> Result<BuildParams> {
        let file_type = match &self.corpus.file_type {
            Some(name) => parse_file_type(name)?,
            None => FileType::Any,
        };
        Ok(BuildParams {
            k: self.index.k,
            num_hashes: self.index.num_hashes,
            false_positive: self.index.false_positive,
            batch_size: self.index.batch_size,
            page_size: self.index.page_size,
            combine_fan_in: self.index.combine_fan_in,
            canonical: self.index.canonical,
            sort_by_size: self.corpus.sort_by_size,
            strict: self.corpus.strict,
            file_type,
            ..BuildParams::default()
        })
    }
}
