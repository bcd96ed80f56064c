use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

// log macros to check if log and log channel is enabled before performing potentially expensive string formatting
macro_rules! log {
    ($log:expr, $($arg:tt)*) => {
        $log.log(&format!($($arg)*));
    };
}
macro_rules! verbose {
    ($log:expr, $($arg:tt)*) => {
        if $log.verbose_enabled() {
            $log.log(&format!($($arg)*));
        }
    };
}
macro_rules! debug {
    ($log:expr, $($arg:tt)*) => {
        if $log.debug_enabled() {
            $log.log(&format!($($arg)*));
        }
    };
}

pub(crate) use debug;
pub(crate) use log;
pub(crate) use verbose;

/// Diagnostics from the library go to stderr, filtered by `RUST_LOG`.
/// `--debug` turns the library's debug events on when `RUST_LOG` is unset.
pub(crate) fn setup_tracing(debug: bool) -> Result<()> {
    let default = if debug { "blamcache=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .compact()
        .with_level(true)
        .with_target(true)
        .without_time();

    tracing_subscriber::registry().with(filter).with(layer).try_init()?;
    Ok(())
}

/// User facing output, routed around an active progress bar.
#[derive(Clone)]
pub(crate) struct Log {
    verbose: bool,
    debug: bool,
    progress: Arc<Mutex<Option<indicatif::ProgressBar>>>,
}
impl Log {
    pub(crate) fn new(verbose: bool, debug: bool) -> Self {
        Self {
            verbose,
            debug,
            progress: Default::default(),
        }
    }
    fn progress(&self) -> MutexGuard<'_, Option<indicatif::ProgressBar>> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
    pub(crate) fn set_progress(&self, progress: Option<&indicatif::ProgressBar>) {
        *self.progress() = progress.cloned();
    }
    pub(crate) fn log(&self, msg: &str) {
        if let Some(progress) = self.progress().as_ref() {
            progress.println(msg);
        } else {
            println!("{msg}");
        }
    }
    pub(crate) fn verbose_enabled(&self) -> bool {
        self.verbose
    }
    pub(crate) fn debug_enabled(&self) -> bool {
        self.debug
    }
}
