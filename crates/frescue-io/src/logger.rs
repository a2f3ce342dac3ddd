//! Auxiliary data logs: read-rate history and per-read traces.
//!
//! These are data files with a stable column format, not diagnostics;
//! they stay separate from the `tracing` output. A log that fails while
//! being written is disabled with a warning rather than aborting a
//! rescue in progress.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use frescue_error::{RescueError, Result};

/// One line per one-second tick: position and rate history.
#[derive(Debug, Default)]
pub struct RatesLog {
    writer: Option<BufWriter<File>>,
}

impl RatesLog {
    pub fn disabled() -> RatesLog {
        RatesLog::default()
    }

    pub fn create(path: &Path) -> Result<RatesLog> {
        let file = File::create(path).map_err(|source| RescueError::CannotOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "# seconds  ipos  current_rate  average_rate  errsize  errors")
            .map_err(RescueError::Io)?;
        Ok(RatesLog {
            writer: Some(writer),
        })
    }

    pub fn log(
        &mut self,
        elapsed: Duration,
        ipos: u64,
        current_rate: u64,
        average_rate: u64,
        errsize: u64,
        errors: u64,
    ) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let result = writeln!(
            writer,
            "{:6} {:10} {:10} {:10} {:10} {:7}",
            elapsed.as_secs(),
            ipos,
            current_rate,
            average_rate,
            errsize,
            errors
        );
        if let Err(e) = result {
            tracing::warn!(error = %e, "rates log failed; disabling");
            self.writer = None;
        }
    }

    pub fn finish(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

/// One line per read call issued to the input.
#[derive(Debug, Default)]
pub struct ReadsLog {
    writer: Option<BufWriter<File>>,
}

impl ReadsLog {
    pub fn disabled() -> ReadsLog {
        ReadsLog::default()
    }

    pub fn create(path: &Path) -> Result<ReadsLog> {
        let file = File::create(path).map_err(|source| RescueError::CannotOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "# phase  pos  size  copied  error_size").map_err(RescueError::Io)?;
        Ok(ReadsLog {
            writer: Some(writer),
        })
    }

    pub fn log(&mut self, phase: &str, pos: u64, size: usize, copied: usize, error_size: usize) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let result = writeln!(
            writer,
            "{phase:9} {pos:10} {size:7} {copied:7} {error_size:7}"
        );
        if let Err(e) = result {
            tracing::warn!(error = %e, "reads log failed; disabling");
            self.writer = None;
        }
    }

    pub fn finish(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

/// The pair of optional data logs a driver carries.
#[derive(Debug, Default)]
pub struct Loggers {
    pub rates: RatesLog,
    pub reads: ReadsLog,
}

impl Loggers {
    pub fn finish(&mut self) {
        self.rates.finish();
        self.reads.finish();
    }
}
