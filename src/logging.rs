use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Initialize the logger.
///
/// `verbose` raises the filter from Warn to Info; `RUST_LOG` still wins.
/// Lines are prefixed with the time elapsed since startup, as
/// `[MM:SS.t] LEVEL message`, and go to stderr so build banners never mix
/// with query results on stdout.
pub fn init_logger(verbose: bool) {
    let start = *START_TIME.get_or_init(Instant::now);

    let level = if verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format(move |buf, record| {
            let elapsed = start.elapsed();
            writeln!(
                buf,
                "[{:02}:{:02}.{}] {} {}",
                elapsed.as_secs() / 60,
                elapsed.as_secs() % 60,
                elapsed.subsec_millis() / 100,
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Stderr)
        .init();
}
