use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use sift::error::SiftError;
use sift::{build_index, config, logging, search, BuildParams, DocumentList, QueryOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

static CANCEL: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "sift")]
#[command(about = "Compact, disk-resident k-mer search index", long_about = None)]
struct Cli {
    /// Log progress at info level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Engine {
    /// Memory-mapped row reads
    Mmap,
    /// O_DIRECT + io_uring row reads (Linux)
    Direct,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an index from a corpus directory
    Build {
        /// Corpus directory (required unless --config is given)
        #[arg(long = "in")]
        in_dir: Option<PathBuf>,
        /// Output index file (required unless --config is given)
        #[arg(long)]
        out: Option<PathBuf>,
        /// TOML build configuration; explicit flags override its values
        #[arg(long)]
        config: Option<PathBuf>,
        /// K-mer length (default 31)
        #[arg(short, long)]
        k: Option<u32>,
        /// Hash functions per k-mer (default 3)
        #[arg(long)]
        num_hashes: Option<u32>,
        /// Target false-positive probability per layer (default 0.3)
        #[arg(long)]
        fp: Option<f64>,
        /// Documents per batch, multiple of 8 (default 64)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Row alignment of the index file, multiple of 4096 (default 4096)
        #[arg(long)]
        page_size: Option<u32>,
        /// Blocks merged per combine step (default: batch_size / 8)
        #[arg(long)]
        combine_fan_in: Option<usize>,
        /// Assign batches by ascending document size
        #[arg(long)]
        sort_by_size: bool,
        /// Abort on per-document failures instead of skipping them
        #[arg(long)]
        strict: bool,
        /// Index forward k-mers without canonicalization
        #[arg(long)]
        no_canonical: bool,
        /// Restrict the scan to one file type
        #[arg(long)]
        file_type: Option<String>,
    },

    /// Score documents of an index against a query sequence
    Query {
        #[arg(short, long)]
        index: PathBuf,
        #[arg(short, long)]
        query: String,
        #[arg(short, long, default_value_t = 100)]
        num_results: usize,
        #[arg(long, value_enum, default_value_t = Engine::Mmap)]
        engine: Engine,
        /// Also print score / num_query_kmers
        #[arg(long)]
        normalize: bool,
        /// Expected k; fails if the index was built with a different k
        #[arg(short, long)]
        k: Option<u32>,
    },

    /// Inspect corpus documents
    Doc {
        #[command(subcommand)]
        command: DocCommands,
    },
}

#[derive(Subcommand)]
enum DocCommands {
    /// List the classified documents under a directory
    Scan {
        dir: PathBuf,
        /// Restrict the scan to one file type
        #[arg(long)]
        file_type: Option<String>,
        /// Sort by size ascending instead of by path
        #[arg(long)]
        sort_by_size: bool,
    },
}

#[cfg(unix)]
extern "C" fn handle_sigint(_: libc::c_int) {
    CANCEL.store(true, Ordering::Relaxed);
}

#[cfg(unix)]
fn install_sigint_handler() {
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
    }
}

/// Tuning flags as given on the command line; `None` falls back to the
/// config file value (if any) and then to the built-in default.
#[derive(Default)]
struct BuildOverrides {
    k: Option<u32>,
    num_hashes: Option<u32>,
    fp: Option<f64>,
    batch_size: Option<usize>,
    page_size: Option<u32>,
    combine_fan_in: Option<usize>,
    sort_by_size: bool,
    strict: bool,
    no_canonical: bool,
    file_type: Option<String>,
}

impl BuildOverrides {
    fn apply(self, mut params: BuildParams) -> Result<BuildParams> {
        if let Some(k) = self.k {
            params.k = k;
        }
        if let Some(h) = self.num_hashes {
            params.num_hashes = h;
        }
        if let Some(fp) = self.fp {
            params.false_positive = fp;
        }
        if let Some(b) = self.batch_size {
            params.batch_size = b;
        }
        if let Some(p) = self.page_size {
            params.page_size = p;
        }
        if let Some(f) = self.combine_fan_in {
            params.combine_fan_in = f;
        }
        if self.sort_by_size {
            params.sort_by_size = true;
        }
        if self.strict {
            params.strict = true;
        }
        if self.no_canonical {
            params.canonical = false;
        }
        if let Some(name) = &self.file_type {
            params.file_type = config::parse_file_type(name)?;
        }
        Ok(params)
    }
}

fn run_build(
    in_dir: Option<PathBuf>,
    out: Option<PathBuf>,
    config_path: Option<PathBuf>,
    overrides: BuildOverrides,
) -> Result<()> {
    let (in_dir, out, base_params) = match config_path {
        Some(path) => {
            let cfg = config::parse_config(&path)?;
            let base = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let cfg_in = config::resolve_path(base, &cfg.corpus.input);
            let cfg_out = config::resolve_path(base, &cfg.corpus.output);
            (
                in_dir.unwrap_or(cfg_in),
                out.unwrap_or(cfg_out),
                cfg.to_build_params()?,
            )
        }
        None => {
            let in_dir = in_dir
                .ok_or_else(|| SiftError::invalid("--in is required when no --config is given"))?;
            let out = out
                .ok_or_else(|| SiftError::invalid("--out is required when no --config is given"))?;
            (in_dir, out, BuildParams::default())
        }
    };
    let params = overrides.apply(base_params)?;

    let summary = build_index(&in_dir, &out, params, &CANCEL)?;
    println!(
        "{}\t{} documents\t{} layers",
        summary.output.display(),
        summary.documents,
        summary.layers
    );
    Ok(())
}

fn run_query(
    index: PathBuf,
    query: String,
    num_results: usize,
    engine: Engine,
    normalize: bool,
    k: Option<u32>,
) -> Result<()> {
    let opts = QueryOptions {
        num_results,
        expected_k: k,
    };

    let mut loader: Box<dyn sift::RowReader> = match engine {
        Engine::Mmap => Box::new(sift::MmapLoader::open(&index)?),
        Engine::Direct => {
            #[cfg(target_os = "linux")]
            {
                Box::new(sift::DirectIoLoader::open(&index)?)
            }
            #[cfg(not(target_os = "linux"))]
            {
                return Err(SiftError::invalid("the direct engine requires Linux").into());
            }
        }
    };

    let hits = search(loader.as_mut(), &query, &opts)?;
    for hit in hits {
        if normalize {
            println!("{}\t{}\t{:.6}", hit.name, hit.score, hit.fraction);
        } else {
            println!("{}\t{}", hit.name, hit.score);
        }
    }
    Ok(())
}

fn run_doc_scan(dir: PathBuf, file_type: Option<String>, sort_by_size: bool) -> Result<()> {
    let filter = match file_type {
        Some(name) => config::parse_file_type(&name)?,
        None => sift::FileType::Any,
    };
    let mut list = DocumentList::scan(&dir, filter, false)?;
    if sort_by_size {
        list.sort_by_size();
    }
    for entry in list.entries() {
        println!(
            "{:?}\t{}\t{}\t{}",
            entry.file_type,
            entry.size,
            entry.subdoc_index,
            entry.path.display()
        );
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Build {
            in_dir,
            out,
            config,
            k,
            num_hashes,
            fp,
            batch_size,
            page_size,
            combine_fan_in,
            sort_by_size,
            strict,
            no_canonical,
            file_type,
        } => run_build(
            in_dir,
            out,
            config,
            BuildOverrides {
                k,
                num_hashes,
                fp,
                batch_size,
                page_size,
                combine_fan_in,
                sort_by_size,
                strict,
                no_canonical,
                file_type,
            },
        ),
        Commands::Query {
            index,
            query,
            num_results,
            engine,
            normalize,
            k,
        } => run_query(index, query, num_results, engine, normalize, k),
        Commands::Doc { command } => match command {
            DocCommands::Scan {
                dir,
                file_type,
                sort_by_size,
            } => run_doc_scan(dir, file_type, sort_by_size),
        },
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            use clap::error::ErrorKind;
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    logging::init_logger(cli.verbose);
    #[cfg(unix)]
    install_sigint_handler();

    if let Err(err) = run(cli) {
        eprintln!("sift: {:#}", err);
        let code = err
            .downcast_ref::<SiftError>()
            .map(SiftError::exit_code)
            .unwrap_or(4);
        std::process::exit(code);
    }
}
