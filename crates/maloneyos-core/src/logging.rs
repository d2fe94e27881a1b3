//! Logging bootstrapper shared by the installer binaries.
//!
//! Installs run from a live session whose terminal is usually gone by the time
//! someone asks what happened, so the logger can also tee into a file.

use env_logger::{Env, Target};
use serde_json::json;
use std::env;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "MALONEYOS_LOG_FORMAT";
const LEVEL_ENV: &str = "MALONEYOS_LOG_LEVEL";
const FILE_ENV: &str = "MALONEYOS_LOG_FILE";

/// Output shape for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

impl LogFormat {
    /// Anything other than `plain` keeps the JSON default.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("plain") {
            LogFormat::Plain
        } else {
            LogFormat::Json
        }
    }
}

/// Initialize the global logger.
///
/// The first caller wins; later calls are no-ops. When `RUST_LOG` is unset the
/// level comes from `MALONEYOS_LOG_LEVEL`, then `default_level`.
/// `MALONEYOS_LOG_FORMAT=plain` selects plain lines instead of JSON and
/// `MALONEYOS_LOG_FILE` also appends every record to that file.
pub fn init(default_level: &str) {
    let _ = INIT.get_or_init(|| configure(default_level));
}

fn configure(default_level: &str) {
    let default_level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", &default_level);
    }

    let format = env::var(FORMAT_ENV)
        .map(|value| LogFormat::parse(&value))
        .unwrap_or(LogFormat::Json);

    let mut builder = env_logger::Builder::from_env(Env::default());
    match format {
        LogFormat::Json => {
            builder.format(|buf, record| {
                let payload = json!({
                    "timestamp": buf.timestamp().to_string(),
                    "level": record.level().to_string().to_lowercase(),
                    "target": record.target(),
                    "installer": env!("CARGO_PKG_VERSION"),
                    "message": record.args().to_string(),
                });
                writeln!(buf, "{}", payload)
            });
        }
        LogFormat::Plain => {
            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "{} {} {} - {}",
                    buf.timestamp(),
                    record.level().to_string().to_lowercase(),
                    record.target(),
                    record.args()
                )
            });
        }
    }

    if let Ok(path) = env::var(FILE_ENV) {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(Tee {
                    console: io::stderr(),
                    file,
                })));
            }
            Err(err) => eprintln!("unable to open log file {path}: {err}; logging to stderr"),
        }
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {}", err);
    }
}

/// Writes each record to the console and to the log file.
struct Tee<C, F> {
    console: C,
    file: F,
}

impl<C: Write, F: Write> Write for Tee<C, F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        self.console.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.console.flush()
    }
}
