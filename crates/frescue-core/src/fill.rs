//! Fill mode: overwrite selected extents of the output with a pattern.
//!
//! The pattern is the content of the input file, read once into a
//! cluster-sized buffer (repeated if the input is shorter). Extents
//! whose status matches the selector are overwritten cluster by cluster;
//! each completed extent flips to finished in the map, so a resumed fill
//! never writes the same extent twice. The map is treated as a stream of
//! targets captured up front, never re-read mid-run.

use frescue_error::{RescueError, Result};
use frescue_io::{Clock, Input, InterruptFlag, Output};
use frescue_map::{Domain, Mapbook};
use frescue_types::{Block, MapStatus, Status};

use crate::apply_offset;

/// Header note recording the completion convention (Open Question 3).
const FILL_NOTE: &str = "Filled blocks are marked finished (+); a resumed fill skips them";

/// Knobs of a fill run.
#[derive(Debug, Clone)]
pub struct FillOptions {
    pub hardbs: u64,
    pub cluster: u64,
    /// Statuses selecting the extents to overwrite.
    pub filltypes: Vec<Status>,
    /// Stamp each written cluster with its decimal output position.
    pub write_location_data: bool,
    /// Count write failures instead of aborting.
    pub ignore_write_errors: bool,
    /// Sync the output after every cluster.
    pub synchronous: bool,
}

impl Default for FillOptions {
    fn default() -> FillOptions {
        FillOptions {
            hardbs: 512,
            cluster: 128,
            filltypes: Vec::new(),
            write_location_data: false,
            ignore_write_errors: false,
            synchronous: false,
        }
    }
}

impl FillOptions {
    pub fn softbs(&self) -> u64 {
        self.cluster * self.hardbs
    }

    pub fn validate(&self) -> Result<()> {
        if self.hardbs == 0 || self.cluster == 0 {
            return Err(RescueError::bad_argument(
                "sector and cluster sizes must be positive",
            ));
        }
        if self.filltypes.is_empty() {
            return Err(RescueError::bad_argument(
                "fill mode needs at least one status to fill",
            ));
        }
        Ok(())
    }
}

/// Parse a fill selector such as `"?-*"` or `"-l"`.
///
/// Returns the selected statuses and whether the `l` flag (location
/// markers) was present.
pub fn parse_filltypes(arg: &str) -> Result<(Vec<Status>, bool)> {
    let mut statuses = Vec::new();
    let mut location = false;
    for ch in arg.chars() {
        if ch == 'l' {
            location = true;
            continue;
        }
        let st = Status::try_from(ch)
            .map_err(|e| RescueError::bad_argument(format!("{e} in fill types '{arg}'")))?;
        if !statuses.contains(&st) {
            statuses.push(st);
        }
    }
    if statuses.is_empty() {
        return Err(RescueError::bad_argument(format!(
            "no fillable status in fill types '{arg}'"
        )));
    }
    Ok((statuses, location))
}

/// Final accounting of a fill run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillSummary {
    /// Bytes written (or skipped over ignored write errors).
    pub filled: u64,
    /// Write failures tolerated by `ignore_write_errors`.
    pub write_errors: u64,
}

#[derive(Debug)]
pub struct Fillbook<'a, I: Input, O: Output> {
    book: Mapbook,
    domain: Domain,
    input: I,
    output: O,
    opts: FillOptions,
    clock: &'a dyn Clock,
    interrupt: InterruptFlag,
    pattern: Vec<u8>,
    scratch: Vec<u8>,
    filled: u64,
    write_errors: u64,
}

impl<'a, I: Input, O: Output> Fillbook<'a, I, O> {
    pub fn new(
        input: I,
        output: O,
        book: Mapbook,
        opts: FillOptions,
        clock: &'a dyn Clock,
        interrupt: InterruptFlag,
    ) -> Result<Fillbook<'a, I, O>> {
        opts.validate()?;
        if book.is_blank() {
            return Err(RescueError::bad_argument(
                "fill mode needs an existing, non-empty mapfile",
            ));
        }
        let domain = book.domain().clone();
        Ok(Fillbook {
            book,
            domain,
            input,
            output,
            opts,
            clock,
            interrupt,
            pattern: Vec::new(),
            scratch: Vec::new(),
            filled: 0,
            write_errors: 0,
        })
    }

    pub fn book(&self) -> &Mapbook {
        &self.book
    }

    pub fn into_parts(self) -> (I, O, Mapbook) {
        (self.input, self.output, self.book)
    }

    pub fn run(&mut self) -> Result<FillSummary> {
        self.book.set_note(Some(FILL_NOTE.to_owned()));
        self.read_pattern()?;
        let result = self.fill_all();
        if let Err(e) = self.book.write_mapfile() {
            tracing::error!(error = %e, "final mapfile save failed");
            if result.is_ok() {
                return Err(e);
            }
        }
        result?;
        Ok(FillSummary {
            filled: self.filled,
            write_errors: self.write_errors,
        })
    }

    /// Read one cluster's worth of pattern data, repeating the input if
    /// it is shorter than a cluster.
    fn read_pattern(&mut self) -> Result<()> {
        let size = self.opts.softbs() as usize;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        let mut ipos = 0u64;
        while filled < size {
            let chunk = self.input.read_at(&mut buf[filled..], ipos)?;
            if chunk.error {
                return Err(RescueError::bad_argument(
                    "error reading fill data from the input file",
                ));
            }
            if chunk.copied == 0 {
                if ipos == 0 {
                    return Err(RescueError::bad_argument("fill data input is empty"));
                }
                ipos = 0; // repeat the pattern from the start
                continue;
            }
            filled += chunk.copied;
            ipos += chunk.copied as u64;
        }
        self.pattern = buf;
        Ok(())
    }

    fn fill_all(&mut self) -> Result<()> {
        // The map is a stream of targets fixed at start; status flips
        // below must not grow the worklist.
        let targets: Vec<Block> = self
            .book
            .sblocks()
            .iter()
            .take_while(|sb| !self.domain.entirely_before(sb.block()))
            .filter(|sb| self.domain.includes(sb.block()))
            .filter(|sb| self.opts.filltypes.contains(&sb.status()))
            .map(|sb| sb.block())
            .collect();
        tracing::info!(targets = targets.len(), "filling matched blocks");

        self.book.set_current_status(MapStatus::Filling);
        self.book.update_mapfile(self.clock.elapsed(), true)?;
        let softbs = self.opts.softbs();
        for target in targets {
            let mut pos = target.pos();
            while pos < target.end() {
                self.check_interrupt()?;
                let size = softbs.min(target.end() - pos) as usize;
                let out_pos = apply_offset(pos, self.book.offset())?;
                self.scratch.clear();
                self.scratch.extend_from_slice(&self.pattern[..size]);
                if self.opts.write_location_data {
                    stamp_location(&mut self.scratch, out_pos);
                }
                match self.output.write_at(&self.scratch, out_pos) {
                    Ok(()) => {}
                    Err(e @ RescueError::WriteFailed { .. }) if self.opts.ignore_write_errors => {
                        self.write_errors += 1;
                        tracing::warn!(error = %e, "write error ignored");
                    }
                    Err(e) => return Err(e),
                }
                if self.opts.synchronous {
                    self.output.sync()?;
                }
                self.filled += size as u64;
                pos += size as u64;
                self.book.set_current_pos(pos);
                self.book.update_mapfile(self.clock.elapsed(), false)?;
            }
            self.book.change_chunk_status(target, Status::Finished)?;
            self.book.update_mapfile(self.clock.elapsed(), true)?;
        }
        self.book.set_current_status(MapStatus::Finished);
        Ok(())
    }

    fn check_interrupt(&self) -> Result<()> {
        match self.interrupt.as_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Overwrite the head of `buf` with the ASCII decimal output position,
/// so filled garbage can be located after the fact.
fn stamp_location(buf: &mut [u8], out_pos: u64) {
    let marker = format!("{out_pos}\n");
    let n = marker.len().min(buf.len());
    buf[..n].copy_from_slice(&marker.as_bytes()[..n]);
}
