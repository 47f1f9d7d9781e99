use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use colored::Colorize;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

use crate::error::Result;

/// How chatty a run is on stdout and in the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Verbosity {
    pub quiet: bool,
    pub verbose: bool,
    pub debug: bool,
}

impl Verbosity {
    pub fn file_level(self) -> LevelFilter {
        if self.debug {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        }
    }

    pub fn stdout_level(self) -> LevelFilter {
        if self.quiet {
            LevelFilter::OFF
        } else if self.verbose {
            self.file_level()
        } else {
            LevelFilter::WARN
        }
    }
}

/// Install the global subscriber: everything at the file level goes to
/// `logfile`, stdout gets what `verbosity` allows. A second call is a no-op.
pub fn init(logfile: &Path, verbosity: Verbosity) -> Result<()> {
    if let Some(parent) = logfile.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(logfile)?;

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(file))
        .with_filter(verbosity.file_level());
    let stdout_layer = fmt::layer()
        .with_target(false)
        .without_time()
        .with_filter(verbosity.stdout_level());

    // Fails only when a subscriber is already installed (tests, repeated runs).
    let _ = tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .try_init();
    Ok(())
}

/// Phase and summary lines: always on stdout unless quiet, always logged.
pub fn progress(verbosity: Verbosity, message: &str) {
    info!("{message}");
    if !verbosity.quiet {
        println!("{}", message.bold());
    }
}
