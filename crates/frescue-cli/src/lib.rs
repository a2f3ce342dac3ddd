//! Shared plumbing for the `frescue` and `frescuemap` binaries: tracing
//! setup, numeric-argument adapters, file sanity checks and exit-status
//! handling. The binaries are thin: every decision of substance lives in
//! the engine crates.

use std::path::Path;
use std::time::Duration;

use frescue_error::{RescueError, Result};
use frescue_types::units::{self, UnitsError};
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the log filter.
pub const LOG_ENV: &str = "FRESCUE_LOG";

/// Install the fmt subscriber on stderr. `-q` forces errors only; each
/// `-v` raises the default level one step.
pub fn init_tracing(quiet: bool, verbose: u8) {
    let default = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// The invoking command line, for the mapfile header comment.
pub fn command_line() -> String {
    std::env::args().collect::<Vec<_>>().join(" ")
}

/// Terminate the process: the engine's exit codes, with signals
/// re-raised so the shell observes `128 + signum`.
pub fn exit_with(result: Result<i32>) -> ! {
    let code = match result {
        Ok(code) => code,
        Err(RescueError::Interrupted { signum }) => {
            tracing::info!(signum, "interrupted; mapfile saved");
            frescue_io::signal::reraise(signum)
        }
        Err(e) => {
            tracing::error!("{e}");
            e.exit_code()
        }
    };
    std::process::exit(code)
}

fn units_err(e: UnitsError) -> RescueError {
    RescueError::bad_argument(e.to_string())
}

/// Parse a size argument with multiplier suffixes.
pub fn parse_size(arg: &str, hardbs: u64) -> Result<u64> {
    units::parse_num(arg, hardbs).map_err(units_err)
}

/// Parse a size argument and enforce an inclusive range.
pub fn parse_size_in(arg: &str, hardbs: u64, min: u64, max: u64) -> Result<u64> {
    units::parse_num_in(arg, hardbs, min, max).map_err(units_err)
}

/// Parse a time interval argument.
pub fn parse_interval(arg: &str) -> Result<Duration> {
    units::parse_interval(arg).map_err(units_err)
}

/// Parse the `-K size[,max]` skip-size argument.
///
/// Returns `(skipbs, max_skipbs)`; either side may be absent.
pub fn parse_skip_sizes(arg: &str, hardbs: u64) -> Result<(Option<u64>, Option<u64>)> {
    match arg.split_once(',') {
        None => Ok((Some(parse_size(arg, hardbs)?), None)),
        Some(("", max)) => Ok((None, Some(parse_size(max, hardbs)?))),
        Some((initial, max)) => Ok((
            Some(parse_size(initial, hardbs)?),
            Some(parse_size(max, hardbs)?),
        )),
    }
}

/// Parse the `--cpass=n[,n]` pass list into the pass bitmap.
/// `0` alone selects no copying passes at all.
pub fn parse_cpass(arg: &str) -> Result<u8> {
    let bad = || RescueError::bad_argument(format!("bad list of passes '{arg}'"));
    let mut bitmap = 0u8;
    if arg.is_empty() {
        return Err(bad());
    }
    for tok in arg.split(',') {
        match tok {
            "0" => {}
            "1" => bitmap |= 0b0001,
            "2" => bitmap |= 0b0010,
            "3" => bitmap |= 0b0100,
            "4" => bitmap |= 0b1000,
            _ => return Err(bad()),
        }
    }
    Ok(bitmap)
}

/// Parse the `-e [+]n` error budget: `+` counts only new error areas.
pub fn parse_max_errors(arg: &str) -> Result<(u64, bool)> {
    let (body, new_only) = match arg.strip_prefix('+') {
        Some(rest) => (rest, true),
        None => (arg, false),
    };
    let n = body
        .parse::<u64>()
        .map_err(|_| RescueError::bad_argument(format!("bad max-errors value '{arg}'")))?;
    Ok((n, new_only))
}

/// Refuse runs where any two of infile, outfile and mapfile are the same
/// file (same path, or same device+inode on disk).
pub fn ensure_distinct_files(paths: &[(&str, &Path)]) -> Result<()> {
    use std::os::unix::fs::MetadataExt;
    let ids: Vec<_> = paths
        .iter()
        .map(|(role, p)| {
            let id = std::fs::metadata(p).ok().map(|m| (m.dev(), m.ino()));
            (*role, *p, id)
        })
        .collect();
    for (i, (role_a, a, id_a)) in ids.iter().enumerate() {
        for (role_b, b, id_b) in &ids[i + 1..] {
            let same_path = a == b;
            let same_inode = matches!((id_a, id_b), (Some(x), Some(y)) if x == y);
            if same_path || same_inode {
                return Err(RescueError::bad_argument(format!(
                    "{role_a} and {role_b} are the same file"
                )));
            }
        }
    }
    Ok(())
}

/// An existing mapfile must be a regular file, not a device or directory.
pub fn ensure_regular_mapfile(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if !meta.is_file() => Err(RescueError::bad_argument(format!(
            "mapfile '{}' exists and is not a regular file",
            path.display()
        ))),
        _ => Ok(()),
    }
}
