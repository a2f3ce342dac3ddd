//! The rescue state machine.
//!
//! A rescue runs up to four copying passes over non-tried data (skipping
//! ahead on errors to grab the easy data first), then trims the edges of
//! the failed clusters, then scrapes the remaining regions sector by
//! sector, then optionally retries the bad sectors. Every transition is
//! persisted to the mapfile before the next phase begins, so a killed
//! run resumes at exactly the phase it lost.

use std::time::Duration;

use frescue_error::{RescueError, Result};
use frescue_io::{Clock, Input, InterruptFlag, Loggers, Output};
use frescue_map::{Domain, Mapbook, StatusCounts};
use frescue_types::{align_down, align_up, Block, MapStatus, Pass, Status};

use crate::apply_offset;
use crate::rates::RateMeter;

/// Default initial skip size after a read error.
pub const DEFAULT_SKIPBS: u64 = 65_536;
/// Hard ceiling for the skip size.
pub const MAX_SKIPBS: u64 = 1 << 30;
/// Bytes of preview kept per requested line.
const PREVIEW_LINE_BYTES: usize = 64;

/// Minimum read-rate policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MinReadRate {
    /// No minimum.
    #[default]
    Off,
    /// Measure the average rate and cancel when the current rate falls
    /// an order of magnitude below it.
    Auto,
    /// Cancel when the current rate falls below this many bytes/s.
    Limit(u64),
}

/// Knobs of the rescue state machine.
#[derive(Debug, Clone)]
pub struct RescueOptions {
    /// Sector size of the input device.
    pub hardbs: u64,
    /// Sectors copied per read during the copying phase.
    pub cluster: u64,
    /// Initial skip size after a read error; 0 disables skipping.
    pub skipbs: u64,
    /// Ceiling for the doubling skip size.
    pub max_skipbs: u64,
    /// Retry passes over bad sectors; -1 means no limit.
    pub max_retries: i32,
    /// Bitmap gating copying passes 1..=4.
    pub cpass: u8,
    /// Run every pass in the same direction.
    pub unidirectional: bool,
    /// Start from the high end of the domain.
    pub reverse: bool,
    /// Skip the trimming phase.
    pub notrim: bool,
    /// Skip the scraping phase.
    pub noscrape: bool,
    /// Re-mark bad-sector and non-scraped as non-trimmed before starting.
    pub retrim: bool,
    /// Re-mark non-trimmed and non-scraped as non-tried before starting.
    pub try_again: bool,
    pub min_read_rate: MinReadRate,
    /// Throttle reads to this many bytes/s.
    pub max_read_rate: Option<u64>,
    /// Cancel when errsize grows faster than this many bytes/s.
    pub max_error_rate: Option<u64>,
    /// Cancel when the damaged-area count exceeds this.
    pub max_errors: Option<u64>,
    /// Count only areas damaged during this run.
    pub new_errors_only: bool,
    /// Cancel on the first read error.
    pub exit_on_error: bool,
    /// Cancel when this long passes without a successful read.
    pub timeout: Option<Duration>,
    /// Wait between passes.
    pub pause: Duration,
    /// Re-read the latest good sector after every failed read.
    pub verify_on_error: bool,
    /// Close and reopen the input after every read error.
    pub reopen_on_error: bool,
    /// Keep the last n lines' worth of read data for display (1..=32).
    pub preview_lines: Option<u8>,
}

impl Default for RescueOptions {
    fn default() -> RescueOptions {
        RescueOptions {
            hardbs: 512,
            cluster: 128,
            skipbs: DEFAULT_SKIPBS,
            max_skipbs: MAX_SKIPBS,
            max_retries: 0,
            cpass: 0b1111,
            unidirectional: false,
            reverse: false,
            notrim: false,
            noscrape: false,
            retrim: false,
            try_again: false,
            min_read_rate: MinReadRate::Off,
            max_read_rate: None,
            max_error_rate: None,
            max_errors: None,
            new_errors_only: false,
            exit_on_error: false,
            timeout: None,
            pause: Duration::ZERO,
            verify_on_error: false,
            reopen_on_error: false,
            preview_lines: None,
        }
    }
}

impl RescueOptions {
    /// Copy granularity of the copying phase.
    pub fn softbs(&self) -> u64 {
        self.cluster * self.hardbs
    }

    pub fn validate(&self) -> Result<()> {
        let arg = |msg: &str| Err(RescueError::bad_argument(msg.to_owned()));
        if self.hardbs == 0 {
            return arg("sector size must be positive");
        }
        if self.cluster == 0 {
            return arg("cluster size must be at least one sector");
        }
        if self.skipbs % self.hardbs != 0 || self.max_skipbs % self.hardbs != 0 {
            return arg("skip size must be a multiple of the sector size");
        }
        if self.skipbs > 0 && self.skipbs < DEFAULT_SKIPBS {
            return arg("minimum initial skip size is 64 KiB");
        }
        if self.skipbs > self.max_skipbs || self.max_skipbs > MAX_SKIPBS {
            return arg("initial skip size is larger than the maximum skip size");
        }
        if let Some(n) = self.preview_lines {
            if n < 1 || n > 32 {
                return arg("preview lines must be between 1 and 32");
            }
        }
        Ok(())
    }

    fn pass_enabled(&self, pass: Pass) -> bool {
        self.cpass & pass.bit() != 0
    }
}

/// Final accounting of a completed rescue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RescueSummary {
    /// Bytes finished over the domain.
    pub rescued: u64,
    /// Bytes still damaged over the domain.
    pub errsize: u64,
    /// Damaged areas over the domain.
    pub errors: u64,
    /// Read calls issued to the input.
    pub read_attempts: u64,
}

/// Outcome of one read-and-record step.
struct ReadOutcome {
    copied: usize,
    /// The region recorded as failed, when the read stopped on an error.
    error: Option<Block>,
    /// The read stopped early at end-of-medium.
    eof: bool,
}

pub struct Rescuebook<'a, I: Input, O: Output> {
    book: Mapbook,
    domain: Domain,
    input: I,
    output: O,
    opts: RescueOptions,
    clock: &'a dyn Clock,
    interrupt: InterruptFlag,
    loggers: Loggers,
    meter: RateMeter,
    buf: Vec<u8>,
    current_skip: u64,
    counts_cache: StatusCounts,
    counts_dirty: bool,
    initial_errors: u64,
    last_good_sector: Option<Block>,
    preview: Vec<u8>,
    read_attempts: u64,
}

impl<'a, I: Input, O: Output> Rescuebook<'a, I, O> {
    pub fn new(
        input: I,
        output: O,
        book: Mapbook,
        opts: RescueOptions,
        clock: &'a dyn Clock,
        interrupt: InterruptFlag,
    ) -> Result<Rescuebook<'a, I, O>> {
        opts.validate()?;
        let domain = book.domain().clone();
        let now = clock.elapsed();
        let buf = vec![0u8; opts.softbs() as usize];
        Ok(Rescuebook {
            book,
            domain,
            input,
            output,
            opts,
            clock,
            interrupt,
            loggers: Loggers::default(),
            meter: RateMeter::new(now),
            buf,
            current_skip: 0,
            counts_cache: StatusCounts::default(),
            counts_dirty: true,
            initial_errors: 0,
            last_good_sector: None,
            preview: Vec::new(),
            read_attempts: 0,
        })
    }

    pub fn with_loggers(mut self, loggers: Loggers) -> Self {
        self.loggers = loggers;
        self
    }

    pub fn book(&self) -> &Mapbook {
        &self.book
    }

    /// Bytes of the most recently read good data, newest last.
    pub fn preview(&self) -> &[u8] {
        &self.preview
    }

    pub fn into_parts(self) -> (I, O, Mapbook) {
        (self.input, self.output, self.book)
    }

    /// Run the rescue to completion, cancellation or interrupt.
    ///
    /// The mapfile is saved on every exit path, including errors.
    pub fn run(&mut self) -> Result<RescueSummary> {
        self.prepare()?;
        let result = self.all_phases();
        if let Err(e) = self.book.write_mapfile() {
            tracing::error!(error = %e, "final mapfile save failed");
            if result.is_ok() {
                return Err(e);
            }
        }
        self.loggers.finish();
        result?;
        let counts = self.counts();
        Ok(RescueSummary {
            rescued: counts.size_of(Status::Finished),
            errsize: counts.errsize,
            errors: counts.errors,
            read_attempts: self.read_attempts,
        })
    }

    fn prepare(&mut self) -> Result<()> {
        if self.opts.retrim {
            self.remark(
                &[Status::BadSector, Status::NonScraped],
                Status::NonTrimmed,
            );
        }
        if self.opts.try_again {
            self.remark(
                &[Status::NonTrimmed, Status::NonScraped],
                Status::NonTried,
            );
        }
        self.initial_errors = self.counts().errors;
        // Make sure a mapfile exists before the first read.
        self.book.write_mapfile()
    }

    /// Re-mark whole in-domain sblocks; the explicit exception to rescue
    /// monotonicity.
    fn remark(&mut self, from: &[Status], to: Status) {
        for i in 0..self.book.sblocks().len() {
            let sb = self.book.sblock(i);
            if !self.domain.includes(sb.block()) {
                if self.domain.entirely_before(sb.block()) {
                    break;
                }
                continue;
            }
            if from.contains(&sb.status()) {
                self.book.change_sblock_status(i, to);
            }
        }
        self.book.compact_sblock_vector();
        self.counts_dirty = true;
    }

    fn all_phases(&mut self) -> Result<()> {
        self.copy_phases()?;
        self.trim_phase()?;
        self.scrape_phase()?;
        self.retry_phase()?;
        self.book.set_current_status(MapStatus::Finished);
        Ok(())
    }

    /// Whether any chunk of status `st` remains inside the domain.
    ///
    /// Deliberately not derived from the domain counts: a blank map is
    /// one sblock spanning the whole input, which a restricted domain
    /// only partially covers.
    fn has_work(&self, st: Status) -> bool {
        !self
            .book
            .find_chunk_in(Block::new(0, u64::MAX), st, Some(&self.domain))
            .is_empty()
    }

    // -----------------------------------------------------------------
    // Copying
    // -----------------------------------------------------------------

    fn copy_phases(&mut self) -> Result<()> {
        if !self.has_work(Status::NonTried) {
            return Ok(());
        }
        let resuming = self.book.current_status() == MapStatus::Copying;
        let saved = if resuming {
            self.book.current_pass()
        } else {
            Pass::FIRST
        };
        // If the saved pass is no longer enabled, move to the next
        // enabled one, wrapping to the first.
        let mut pass = {
            let mut p = Some(saved);
            while let Some(candidate) = p {
                if self.opts.pass_enabled(candidate) {
                    break;
                }
                p = candidate.next();
            }
            match p {
                Some(candidate) => candidate,
                None => match (1..=4).filter_map(Pass::new).find(|c| self.opts.pass_enabled(*c)) {
                    Some(first) => first,
                    None => return Ok(()), // no copying passes selected
                },
            }
        };
        let mut resume_from = (resuming && pass == saved).then(|| self.book.current_pos());
        loop {
            self.book.set_current_status(MapStatus::Copying);
            self.book.set_current_pass(pass);
            self.book.update_mapfile(self.clock.elapsed(), true)?;
            let forward = self.direction_of(pass.get() as u32);
            tracing::info!(pass = %pass, forward, "copying non-tried blocks");
            self.copy_pass(forward, resume_from.take())?;
            if !self.has_work(Status::NonTried) {
                return Ok(());
            }
            pass = loop {
                match pass.next() {
                    Some(next) if self.opts.pass_enabled(next) => break next,
                    Some(next) => pass = next,
                    None => return Ok(()),
                }
            };
            self.pause_between_passes()?;
        }
    }

    fn direction_of(&self, ordinal: u32) -> bool {
        let base = !self.opts.reverse;
        if self.opts.unidirectional {
            base
        } else {
            base ^ (ordinal.wrapping_sub(1) % 2 == 1)
        }
    }

    fn copy_pass(&mut self, forward: bool, resume_from: Option<u64>) -> Result<()> {
        self.current_skip = 0;
        let softbs = self.opts.softbs();
        if forward {
            let mut pos = resume_from.unwrap_or(0);
            loop {
                self.check_interrupt()?;
                self.check_limits()?;
                let wsize = softbs - pos % softbs;
                let chunk = self.book.find_chunk_in(
                    Block::new(pos, wsize),
                    Status::NonTried,
                    Some(&self.domain),
                );
                if chunk.is_empty() {
                    return Ok(());
                }
                self.book.set_current_pos(chunk.pos());
                let outcome = self.copy_and_update(chunk, Status::NonTrimmed, "copying")?;
                if outcome.eof {
                    self.book
                        .truncate_vector(chunk.pos() + outcome.copied as u64, false);
                    self.counts_dirty = true;
                    return Ok(());
                }
                pos = chunk.end();
                if let Some(error) = outcome.error {
                    self.on_copy_error()?;
                    if self.current_skip_enabled() {
                        let skip = self.next_skip();
                        let span = Block::new(error.end(), skip);
                        self.mark_span_non_trimmed(span)?;
                        pos = span.end();
                    }
                    self.book.update_mapfile(self.clock.elapsed(), true)?;
                } else {
                    self.relax_skip();
                    self.book.update_mapfile(self.clock.elapsed(), false)?;
                }
                self.book.set_current_pos(pos);
            }
        } else {
            let top = self.domain.end().min(self.book.extent().end());
            let mut end = resume_from.unwrap_or(top).min(top);
            loop {
                self.check_interrupt()?;
                self.check_limits()?;
                let wsize = {
                    let rem = end % softbs;
                    if rem == 0 { softbs } else { rem }
                };
                let wsize = wsize.min(end);
                if wsize == 0 {
                    return Ok(());
                }
                let chunk = self.book.rfind_chunk_in(
                    Block::new(end - wsize, wsize),
                    Status::NonTried,
                    Some(&self.domain),
                );
                if chunk.is_empty() {
                    return Ok(());
                }
                self.book.set_current_pos(chunk.pos());
                let outcome = self.copy_and_update(chunk, Status::NonTrimmed, "copying")?;
                if outcome.eof {
                    self.book
                        .truncate_vector(chunk.pos() + outcome.copied as u64, false);
                    self.counts_dirty = true;
                }
                end = chunk.pos();
                if let Some(_error) = outcome.error {
                    self.on_copy_error()?;
                    if self.current_skip_enabled() {
                        let skip = self.next_skip().min(chunk.pos());
                        let span = Block::new(chunk.pos() - skip, skip);
                        if !span.is_empty() {
                            self.mark_span_non_trimmed(span)?;
                        }
                        end = span.pos();
                    }
                    self.book.update_mapfile(self.clock.elapsed(), true)?;
                } else {
                    self.relax_skip();
                    self.book.update_mapfile(self.clock.elapsed(), false)?;
                }
                self.book.set_current_pos(end);
                if end == 0 {
                    return Ok(());
                }
            }
        }
    }

    fn on_copy_error(&mut self) -> Result<()> {
        if self.opts.exit_on_error {
            return Err(RescueError::cancelled("read error with exit-on-error set"));
        }
        Ok(())
    }

    fn current_skip_enabled(&self) -> bool {
        self.opts.skipbs > 0
    }

    /// Next skip size: doubling from `skipbs` up to `max_skipbs`.
    fn next_skip(&mut self) -> u64 {
        self.current_skip = if self.current_skip == 0 {
            self.opts.skipbs
        } else {
            (self.current_skip * 2).min(self.opts.max_skipbs)
        };
        self.current_skip
    }

    /// Halve the skip size after a successful read, not below `skipbs`.
    fn relax_skip(&mut self) {
        if self.current_skip > self.opts.skipbs {
            self.current_skip = (self.current_skip / 2).max(self.opts.skipbs);
        }
    }

    /// Mark the non-tried parts of `span` (within the domain) as
    /// non-trimmed: the data skipped over is handed to the trimmer.
    fn mark_span_non_trimmed(&mut self, span: Block) -> Result<()> {
        let mut pos = span.pos();
        while pos < span.end() {
            let window = Block::new(pos, span.end() - pos);
            let c = self
                .book
                .find_chunk_in(window, Status::NonTried, Some(&self.domain));
            if c.is_empty() || c.pos() >= span.end() {
                break;
            }
            let mut part = c;
            part.crop(span);
            if part.is_empty() {
                break;
            }
            self.book.change_chunk_status(part, Status::NonTrimmed)?;
            self.counts_dirty = true;
            pos = part.end();
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Trimming
    // -----------------------------------------------------------------

    fn trim_phase(&mut self) -> Result<()> {
        if self.opts.notrim || !self.has_work(Status::NonTrimmed) {
            return Ok(());
        }
        self.book.set_current_status(MapStatus::Trimming);
        self.book.update_mapfile(self.clock.elapsed(), true)?;
        tracing::info!("trimming failed blocks");
        let hardbs = self.opts.hardbs;
        loop {
            let block = self.book.find_chunk_in(
                Block::new(0, u64::MAX),
                Status::NonTrimmed,
                Some(&self.domain),
            );
            if block.is_empty() {
                return Ok(());
            }
            self.book.set_current_pos(block.pos());
            // Left edge first, then right, both inward.
            let mut left = block.pos();
            let mut left_bad = None;
            while left < block.end() {
                self.check_interrupt()?;
                self.check_limits()?;
                let ssize = (align_up(left + 1, hardbs) - left).min(block.end() - left);
                let sector = Block::new(left, ssize);
                let outcome = self.copy_and_update(sector, Status::BadSector, "trimming")?;
                if outcome.eof {
                    self.book
                        .truncate_vector(sector.pos() + outcome.copied as u64, false);
                    self.counts_dirty = true;
                    return Ok(());
                }
                left = sector.end();
                if let Some(err) = outcome.error {
                    left_bad = Some(err);
                    break;
                }
            }
            if left_bad.is_none() {
                // The whole block read clean.
                self.book.update_mapfile(self.clock.elapsed(), true)?;
                continue;
            }
            let mut right = block.end();
            let mut right_bad = None;
            while right > left {
                self.check_interrupt()?;
                self.check_limits()?;
                let spos = align_down(right - 1, hardbs).max(left);
                let sector = Block::new(spos, right - spos);
                let outcome = self.copy_and_update(sector, Status::BadSector, "trimming")?;
                if let Some(err) = outcome.error {
                    right_bad = Some(err);
                    break;
                }
                right = sector.pos();
            }
            let interior_end = right_bad.map_or(right, |err| err.pos());
            if left < interior_end {
                self.book
                    .change_chunk_status(Block::new(left, interior_end - left), Status::NonScraped)?;
                self.counts_dirty = true;
            }
            self.book.update_mapfile(self.clock.elapsed(), true)?;
        }
    }

    // -----------------------------------------------------------------
    // Scraping
    // -----------------------------------------------------------------

    fn scrape_phase(&mut self) -> Result<()> {
        if self.opts.noscrape || !self.has_work(Status::NonScraped) {
            return Ok(());
        }
        self.book.set_current_status(MapStatus::Scraping);
        self.book.update_mapfile(self.clock.elapsed(), true)?;
        tracing::info!("scraping failed blocks");
        let hardbs = self.opts.hardbs;
        loop {
            let block = self.book.find_chunk_in(
                Block::new(0, u64::MAX),
                Status::NonScraped,
                Some(&self.domain),
            );
            if block.is_empty() {
                return Ok(());
            }
            self.book.set_current_pos(block.pos());
            let mut pos = block.pos();
            while pos < block.end() {
                self.check_interrupt()?;
                self.check_limits()?;
                let ssize = (align_up(pos + 1, hardbs) - pos).min(block.end() - pos);
                let sector = Block::new(pos, ssize);
                let outcome = self.copy_and_update(sector, Status::BadSector, "scraping")?;
                if outcome.eof {
                    self.book
                        .truncate_vector(sector.pos() + outcome.copied as u64, false);
                    self.counts_dirty = true;
                    return Ok(());
                }
                pos = sector.end();
                self.book.update_mapfile(self.clock.elapsed(), false)?;
            }
            self.book.update_mapfile(self.clock.elapsed(), true)?;
        }
    }

    // -----------------------------------------------------------------
    // Retrying
    // -----------------------------------------------------------------

    fn retry_phase(&mut self) -> Result<()> {
        if self.opts.max_retries == 0 {
            return Ok(());
        }
        let mut round: u32 = 0;
        loop {
            if !self.has_work(Status::BadSector) {
                return Ok(());
            }
            if self.opts.max_retries > 0 && round >= self.opts.max_retries as u32 {
                return Ok(());
            }
            round += 1;
            self.book.set_current_status(MapStatus::Retrying);
            self.book.update_mapfile(self.clock.elapsed(), true)?;
            let forward = self.direction_of(round);
            tracing::info!(round, forward, "retrying bad sectors");
            self.retry_round(forward)?;
            self.pause_between_passes()?;
        }
    }

    fn retry_round(&mut self, forward: bool) -> Result<()> {
        let hardbs = self.opts.hardbs;
        if forward {
            let mut pos = 0;
            loop {
                self.check_interrupt()?;
                self.check_limits()?;
                let chunk = self.book.find_chunk_in(
                    Block::new(pos, hardbs),
                    Status::BadSector,
                    Some(&self.domain),
                );
                if chunk.is_empty() {
                    return Ok(());
                }
                let ssize = (align_up(chunk.pos() + 1, hardbs) - chunk.pos()).min(chunk.size());
                let sector = Block::new(chunk.pos(), ssize);
                let outcome = self.copy_and_update(sector, Status::BadSector, "retrying")?;
                if outcome.eof {
                    self.book
                        .truncate_vector(sector.pos() + outcome.copied as u64, false);
                    self.counts_dirty = true;
                    return Ok(());
                }
                pos = sector.end();
                self.book.set_current_pos(pos);
                self.book.update_mapfile(self.clock.elapsed(), false)?;
            }
        } else {
            let mut end = self.domain.end().min(self.book.extent().end());
            loop {
                self.check_interrupt()?;
                self.check_limits()?;
                if end == 0 {
                    return Ok(());
                }
                let wsize = hardbs.min(end);
                let chunk = self.book.rfind_chunk_in(
                    Block::new(end - wsize, wsize),
                    Status::BadSector,
                    Some(&self.domain),
                );
                if chunk.is_empty() {
                    return Ok(());
                }
                let outcome = self.copy_and_update(chunk, Status::BadSector, "retrying")?;
                if outcome.eof {
                    self.book
                        .truncate_vector(chunk.pos() + outcome.copied as u64, false);
                    self.counts_dirty = true;
                    return Ok(());
                }
                end = chunk.pos();
                self.book.set_current_pos(end);
                self.book.update_mapfile(self.clock.elapsed(), false)?;
            }
        }
    }

    // -----------------------------------------------------------------
    // The per-read step shared by all phases
    // -----------------------------------------------------------------

    /// Read `b`, write the good prefix to the output, and record both
    /// halves in the map: good data becomes finished, the failed
    /// remainder becomes `err_status`.
    fn copy_and_update(
        &mut self,
        b: Block,
        err_status: Status,
        phase: &'static str,
    ) -> Result<ReadOutcome> {
        let size = b.size() as usize;
        if self.buf.len() < size {
            self.buf.resize(size, 0);
        }
        self.read_attempts += 1;
        let chunk = self.input.read_at(&mut self.buf[..size], b.pos())?;
        self.check_interrupt()?;
        let now = self.clock.elapsed();
        let error_size = if chunk.error { size - chunk.copied } else { 0 };
        self.loggers
            .reads
            .log(phase, b.pos(), size, chunk.copied, error_size);

        if chunk.copied > 0 {
            let good = Block::new(b.pos(), chunk.copied as u64);
            let out_pos = apply_offset(good.pos(), self.book.offset())?;
            self.output.write_at(&self.buf[..chunk.copied], out_pos)?;
            self.book.change_chunk_status(good, Status::Finished)?;
            self.counts_dirty = true;
            self.meter.on_good_read(now, chunk.copied as u64);
            let sector_start = align_down(good.end().saturating_sub(1), self.opts.hardbs)
                .max(good.pos());
            self.last_good_sector = Some(Block::new(sector_start, good.end() - sector_start));
            self.push_preview(chunk.copied);
        }

        let error = if error_size > 0 {
            let bad = Block::new(b.pos() + chunk.copied as u64, error_size as u64);
            self.book.change_chunk_status(bad, err_status)?;
            self.counts_dirty = true;
            tracing::debug!(phase, pos = bad.pos(), size = bad.size(), "read failed");
            if self.opts.verify_on_error {
                self.verify_last_good()?;
            }
            if self.opts.reopen_on_error {
                self.input.reopen()?;
            }
            Some(bad)
        } else {
            None
        };
        Ok(ReadOutcome {
            copied: chunk.copied,
            error,
            eof: !chunk.error && chunk.copied < size,
        })
    }

    /// Re-read the most recent good sector; if it fails now, the device
    /// itself has gone away and continuing would shred the map.
    fn verify_last_good(&mut self) -> Result<()> {
        let Some(sector) = self.last_good_sector else {
            return Ok(());
        };
        let size = sector.size() as usize;
        let mut scratch = vec![0u8; size];
        let chunk = self.input.read_at(&mut scratch, sector.pos())?;
        if chunk.error || chunk.copied < size {
            return Err(RescueError::cancelled(
                "input device disappeared: the latest good sector no longer reads",
            ));
        }
        Ok(())
    }

    fn push_preview(&mut self, copied: usize) {
        let Some(lines) = self.opts.preview_lines else {
            return;
        };
        let cap = lines as usize * PREVIEW_LINE_BYTES;
        let take = copied.min(cap);
        self.preview.extend_from_slice(&self.buf[copied - take..copied]);
        if self.preview.len() > cap {
            let excess = self.preview.len() - cap;
            self.preview.drain(..excess);
        }
    }

    // -----------------------------------------------------------------
    // Budgets, cancellation, pacing
    // -----------------------------------------------------------------

    fn check_interrupt(&self) -> Result<()> {
        match self.interrupt.as_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn counts(&mut self) -> StatusCounts {
        if self.counts_dirty {
            self.counts_cache = self.book.counts_in_domain();
            self.counts_dirty = false;
        }
        self.counts_cache
    }

    fn check_limits(&mut self) -> Result<()> {
        let now = self.clock.elapsed();
        let counts = self.counts();

        if let Some(max) = self.opts.max_errors {
            let n = if self.opts.new_errors_only {
                counts.errors.saturating_sub(self.initial_errors)
            } else {
                counts.errors
            };
            if n > max {
                return Err(RescueError::cancelled(format!(
                    "too many {}error areas ({n} > {max})",
                    if self.opts.new_errors_only { "new " } else { "" }
                )));
            }
        }
        if let Some(timeout) = self.opts.timeout {
            if now.saturating_sub(self.meter.last_good()) > timeout {
                return Err(RescueError::cancelled(
                    "timeout since the last successful read",
                ));
            }
        }
        if let Some(sample) = self.meter.tick(now, counts.errsize) {
            self.loggers.rates.log(
                now,
                self.book.current_pos(),
                sample.current_rate,
                sample.average_rate,
                counts.errsize,
                counts.errors,
            );
            if let Some(limit) = self.opts.max_error_rate {
                if sample.error_growth > limit {
                    return Err(RescueError::cancelled("maximum error rate exceeded"));
                }
            }
            match self.opts.min_read_rate {
                MinReadRate::Off => {}
                MinReadRate::Limit(limit) => {
                    if sample.current_rate < limit {
                        return Err(RescueError::cancelled("read rate below minimum"));
                    }
                }
                MinReadRate::Auto => {
                    if self.meter.warmed_up() && sample.current_rate < sample.average_rate / 10 {
                        return Err(RescueError::cancelled(
                            "read rate collapsed below a tenth of the average",
                        ));
                    }
                }
            }
        }
        if let Some(limit) = self.opts.max_read_rate {
            if let Some(delay) = self.meter.throttle_delay(now, limit) {
                self.clock.sleep(delay);
            }
        }
        Ok(())
    }

    fn pause_between_passes(&mut self) -> Result<()> {
        if !self.opts.pause.is_zero() {
            self.clock.sleep(self.opts.pause);
            self.check_interrupt()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frescue_io::{ManualClock, MemInput, MemOutput};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn fresh_book(isize: u64, path: Option<&std::path::Path>) -> Mapbook {
        Mapbook::new(0, isize, Domain::new(0, None), path, "frescue test", false).unwrap()
    }

    fn map_shape(book: &Mapbook) -> Vec<(u64, u64, Status)> {
        book.sblocks()
            .iter()
            .map(|sb| (sb.pos(), sb.size(), sb.status()))
            .collect()
    }

    fn small_opts() -> RescueOptions {
        RescueOptions {
            hardbs: 512,
            cluster: 8,
            skipbs: 0,
            ..Default::default()
        }
    }

    #[test]
    fn clean_copy_finishes_everything() {
        let size = 1 << 20;
        let data = pattern(size);
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("rescue.map");
        let clock = ManualClock::new();
        let book = fresh_book(size as u64, Some(&map));
        let mut rescue = Rescuebook::new(
            MemInput::new(data.clone()),
            MemOutput::new(),
            book,
            RescueOptions::default(),
            &clock,
            InterruptFlag::new(),
        )
        .unwrap();

        let summary = rescue.run().unwrap();
        assert_eq!(summary.rescued, size as u64);
        assert_eq!(summary.errsize, 0);
        assert_eq!(summary.errors, 0);
        let (_, out, book) = rescue.into_parts();
        assert_eq!(out.data(), &data[..]);
        assert_eq!(map_shape(&book), vec![(0, size as u64, Status::Finished)]);
        assert_eq!(book.current_status(), MapStatus::Finished);

        // The saved mapfile agrees.
        let reloaded = Mapbook::new(0, size as u64, Domain::new(0, None), Some(&map), "", false)
            .unwrap();
        assert_eq!(map_shape(&reloaded), vec![(0, size as u64, Status::Finished)]);
    }

    #[test]
    fn single_bad_sector_is_isolated() {
        let size = 1 << 20;
        let data = pattern(size);
        let mut input = MemInput::new(data.clone());
        input.inject_bad(4096, 512);
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("rescue.map");
        let clock = ManualClock::new();
        let book = fresh_book(size as u64, Some(&map));
        let mut rescue = Rescuebook::new(
            input,
            MemOutput::new(),
            book,
            small_opts(),
            &clock,
            InterruptFlag::new(),
        )
        .unwrap();

        let summary = rescue.run().unwrap();
        assert_eq!(summary.errsize, 512);
        assert_eq!(summary.errors, 1);
        let (_, out, book) = rescue.into_parts();
        assert_eq!(
            map_shape(&book),
            vec![
                (0, 4096, Status::Finished),
                (4096, 512, Status::BadSector),
                (4608, (size as u64) - 4608, Status::Finished),
            ]
        );
        // Every readable byte matches the source.
        assert_eq!(&out.data()[..4096], &data[..4096]);
        assert_eq!(&out.data()[4608..], &data[4608..]);
    }

    #[test]
    fn skip_heuristic_bounds_attempts_and_trims_edges() {
        let size = 10 << 20;
        let data = pattern(size);
        let mut input = MemInput::new(data.clone());
        input.inject_bad(1 << 20, 1 << 20);
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("rescue.map");
        let clock = ManualClock::new();
        let book = fresh_book(size as u64, Some(&map));
        let opts = RescueOptions::default(); // skipbs = 64 KiB
        let mut rescue = Rescuebook::new(
            input,
            MemOutput::new(),
            book,
            opts,
            &clock,
            InterruptFlag::new(),
        )
        .unwrap();

        let summary = rescue.run().unwrap();
        let (_, out, book) = rescue.into_parts();
        // Edges finished, the damaged megabyte fully identified.
        assert_eq!(
            map_shape(&book),
            vec![
                (0, 1 << 20, Status::Finished),
                (1 << 20, 1 << 20, Status::BadSector),
                (2 << 20, 8 << 20, Status::Finished),
            ]
        );
        assert_eq!(summary.errsize, 1 << 20);
        assert_eq!(&out.data()[..1 << 20], &data[..1 << 20]);
        assert_eq!(&out.data()[2 << 20..], &data[2 << 20..]);
    }

    /// A copying-phase-only run shows the bounded-attempt property: the
    /// whole damaged range is classified in far fewer reads than a
    /// sector-by-sector sweep would take.
    #[test]
    fn skip_heuristic_attempt_budget() {
        let size = 10 << 20;
        let mut input = MemInput::new(pattern(size));
        input.inject_bad(1 << 20, 1 << 20);
        let clock = ManualClock::new();
        let book = fresh_book(size as u64, None);
        let opts = RescueOptions {
            notrim: true,
            noscrape: true,
            ..Default::default()
        };
        let mut rescue =
            Rescuebook::new(input, MemOutput::new(), book, opts, &clock, InterruptFlag::new())
                .unwrap();
        let summary = rescue.run().unwrap();
        // Good data: 9 MiB in 64 KiB clusters = 144 reads; the damaged
        // 2 MiB window must stay under 2 * (2 MiB / 64 KiB) = 64 reads.
        let good_reads: u64 = (9 << 20) / (64 << 10);
        assert!(
            summary.read_attempts < good_reads + 64,
            "attempts = {}",
            summary.read_attempts
        );
        let counts = rescue.book().counts_in_domain();
        // The skip overshoot may classify a little good data past the
        // damaged range as non-trimmed; the trimmer recovers it later.
        assert!(counts.size_of(Status::NonTrimmed) >= 1 << 20);
        assert!(counts.size_of(Status::NonTrimmed) <= (1 << 20) + MAX_SKIPBS);
        assert_eq!(counts.size_of(Status::NonTried), 0);
    }

    #[test]
    fn skip_doubles_and_halves() {
        let clock = ManualClock::new();
        let book = fresh_book(1 << 20, None);
        let mut rescue = Rescuebook::new(
            MemInput::new(vec![0; 1]),
            MemOutput::new(),
            book,
            RescueOptions::default(),
            &clock,
            InterruptFlag::new(),
        )
        .unwrap();
        assert_eq!(rescue.next_skip(), DEFAULT_SKIPBS);
        assert_eq!(rescue.next_skip(), 2 * DEFAULT_SKIPBS);
        assert_eq!(rescue.next_skip(), 4 * DEFAULT_SKIPBS);
        rescue.relax_skip();
        assert_eq!(rescue.current_skip, 2 * DEFAULT_SKIPBS);
        rescue.relax_skip();
        rescue.relax_skip();
        assert_eq!(rescue.current_skip, DEFAULT_SKIPBS);
        // Saturates at the ceiling.
        rescue.current_skip = MAX_SKIPBS;
        assert_eq!(rescue.next_skip(), MAX_SKIPBS);
    }

    /// An input that raises the interrupt flag after a fixed number of
    /// reads, standing in for a mid-run SIGINT.
    struct TripwireInput {
        inner: MemInput,
        flag: InterruptFlag,
        fire_after: u64,
        reads: u64,
    }

    impl Input for TripwireInput {
        fn read_at(&mut self, buf: &mut [u8], pos: u64) -> Result<frescue_io::ReadChunk> {
            self.reads += 1;
            if self.reads == self.fire_after {
                self.flag.set(2);
            }
            self.inner.read_at(buf, pos)
        }

        fn size(&mut self) -> Result<Option<u64>> {
            self.inner.size()
        }

        fn reopen(&mut self) -> Result<()> {
            self.inner.reopen()
        }
    }

    #[test]
    fn interrupt_saves_map_and_resume_completes() {
        let size = 1 << 20;
        let data = pattern(size);
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("rescue.map");
        let clock = ManualClock::new();
        let flag = InterruptFlag::new();
        let total_reads = (size as u64) / RescueOptions::default().softbs();

        let tripwire = TripwireInput {
            inner: MemInput::new(data.clone()),
            flag: flag.clone(),
            fire_after: total_reads / 2,
            reads: 0,
        };
        let book = fresh_book(size as u64, Some(&map));
        let mut rescue = Rescuebook::new(
            tripwire,
            MemOutput::new(),
            book,
            RescueOptions::default(),
            &clock,
            flag.clone(),
        )
        .unwrap();
        let err = rescue.run().unwrap_err();
        assert!(matches!(err, RescueError::Interrupted { signum: 2 }));
        let (_, out, _) = rescue.into_parts();
        let partial = out;

        // The saved map records real progress, none of it lost.
        let book = fresh_book(size as u64, Some(&map));
        assert!(!book.is_blank());
        let finished_before: u64 = book.counts_in_domain().size_of(Status::Finished);
        assert!(finished_before > 0 && finished_before < size as u64);
        // Every byte marked finished was actually written (durability).
        for sb in book.sblocks() {
            if sb.status() == Status::Finished {
                let (a, b) = (sb.pos() as usize, sb.end() as usize);
                assert_eq!(&partial.data()[a..b], &data[a..b]);
            }
        }

        // Second run: clean flag, same mapfile, same output.
        let mut rescue = Rescuebook::new(
            MemInput::new(data.clone()),
            partial,
            book,
            RescueOptions::default(),
            &clock,
            InterruptFlag::new(),
        )
        .unwrap();
        let summary = rescue.run().unwrap();
        assert_eq!(summary.rescued, size as u64);
        // The resumed run only reads what was still missing.
        assert!(
            summary.read_attempts <= total_reads - total_reads / 2 + 2,
            "re-read finished regions: {} attempts",
            summary.read_attempts
        );
        let (_, out, book) = rescue.into_parts();
        assert_eq!(out.data(), &data[..]);
        assert_eq!(book.current_status(), MapStatus::Finished);
    }

    #[test]
    fn retry_recovers_healed_sectors() {
        let size = 64 << 10;
        let data = pattern(size);
        let mut input = MemInput::new(data.clone());
        input.inject_bad(8192, 512);
        let clock = ManualClock::new();

        // First pass leaves one bad sector.
        let book = fresh_book(size as u64, None);
        let mut rescue = Rescuebook::new(
            input,
            MemOutput::new(),
            book,
            small_opts(),
            &clock,
            InterruptFlag::new(),
        )
        .unwrap();
        rescue.run().unwrap();
        let (mut input, out, book) = rescue.into_parts();
        assert_eq!(book.counts_in_domain().size_of(Status::BadSector), 512);

        // The sector recovers; a retry pass rescues it.
        input.heal(Block::new(8192, 512));
        let opts = RescueOptions {
            max_retries: 1,
            ..small_opts()
        };
        let mut rescue =
            Rescuebook::new(input, out, book, opts, &clock, InterruptFlag::new()).unwrap();
        let summary = rescue.run().unwrap();
        assert_eq!(summary.errsize, 0);
        let (_, out, _) = rescue.into_parts();
        assert_eq!(out.data(), &data[..]);
    }

    #[test]
    fn backward_retry_stops_at_shrunken_input() {
        let size = 64 << 10;
        let data = pattern(size);
        let mut input = MemInput::new(data.clone());
        input.inject_bad(60 << 10, 512);
        let clock = ManualClock::new();
        let book = fresh_book(size as u64, None);
        let mut rescue = Rescuebook::new(
            input,
            MemOutput::new(),
            book,
            small_opts(),
            &clock,
            InterruptFlag::new(),
        )
        .unwrap();
        rescue.run().unwrap();
        let (_, out, book) = rescue.into_parts();
        assert_eq!(book.counts_in_domain().size_of(Status::BadSector), 512);

        // The device shrinks below the bad sector between runs. With
        // unlimited reverse-only retries, the run must truncate at the
        // new end and finish instead of retrying the lost tail forever.
        let shrunk = MemInput::new(data[..48 << 10].to_vec());
        let opts = RescueOptions {
            max_retries: -1,
            reverse: true,
            unidirectional: true,
            ..small_opts()
        };
        let mut rescue =
            Rescuebook::new(shrunk, out, book, opts, &clock, InterruptFlag::new()).unwrap();
        let summary = rescue.run().unwrap();
        assert_eq!(summary.errsize, 0);
        // Truncated at the first read past the new end of medium.
        assert_eq!(rescue.book().extent().end(), 60 << 10);
        assert_eq!(rescue.book().current_status(), MapStatus::Finished);
    }

    #[test]
    fn exit_on_error_cancels() {
        let mut input = MemInput::new(pattern(256 << 10));
        input.inject_bad(0, 512);
        let clock = ManualClock::new();
        let book = fresh_book(256 << 10, None);
        let opts = RescueOptions {
            exit_on_error: true,
            ..small_opts()
        };
        let mut rescue =
            Rescuebook::new(input, MemOutput::new(), book, opts, &clock, InterruptFlag::new())
                .unwrap();
        let err = rescue.run().unwrap_err();
        assert!(matches!(err, RescueError::Cancelled { .. }));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn max_errors_budget_cancels() {
        let mut input = MemInput::new(pattern(256 << 10));
        input.inject_bad(0, 512);
        input.inject_bad(65536, 512);
        input.inject_bad(131072, 512);
        let clock = ManualClock::new();
        let book = fresh_book(256 << 10, None);
        let opts = RescueOptions {
            max_errors: Some(1),
            ..small_opts()
        };
        let mut rescue =
            Rescuebook::new(input, MemOutput::new(), book, opts, &clock, InterruptFlag::new())
                .unwrap();
        assert!(matches!(
            rescue.run(),
            Err(RescueError::Cancelled { .. })
        ));
    }

    #[test]
    fn timeout_without_good_reads_cancels() {
        let mut input = MemInput::new(pattern(256 << 10));
        input.inject_bad(0, 256 << 10);
        let clock = ManualClock::new();
        clock.advance(Duration::from_secs(1));
        let book = fresh_book(256 << 10, None);
        let opts = RescueOptions {
            timeout: Some(Duration::from_secs(0)),
            ..small_opts()
        };
        let mut rescue =
            Rescuebook::new(input, MemOutput::new(), book, opts, &clock, InterruptFlag::new())
                .unwrap();
        clock.advance(Duration::from_secs(5));
        assert!(matches!(
            rescue.run(),
            Err(RescueError::Cancelled { .. })
        ));
    }

    #[test]
    fn reverse_run_matches_forward_result() {
        let size = 1 << 20;
        let data = pattern(size);
        let mut input = MemInput::new(data.clone());
        input.inject_bad(300 << 10, 1024);
        let clock = ManualClock::new();
        let book = fresh_book(size as u64, None);
        let opts = RescueOptions {
            reverse: true,
            ..small_opts()
        };
        let mut rescue =
            Rescuebook::new(input, MemOutput::new(), book, opts, &clock, InterruptFlag::new())
                .unwrap();
        let summary = rescue.run().unwrap();
        assert_eq!(summary.errsize, 1024);
        let (_, out, book) = rescue.into_parts();
        assert_eq!(
            map_shape(&book)
                .iter()
                .filter(|(_, _, st)| *st == Status::BadSector)
                .count(),
            1
        );
        assert_eq!(&out.data()[..300 << 10], &data[..300 << 10]);
    }

    #[test]
    fn try_again_remarks_damage_for_another_pass() {
        let size = 256 << 10;
        let data = pattern(size);
        let mut input = MemInput::new(data.clone());
        input.inject_bad(4096, 4096);
        let clock = ManualClock::new();
        let book = fresh_book(size as u64, None);
        let opts = RescueOptions {
            notrim: true,
            noscrape: true,
            ..small_opts()
        };
        let mut rescue =
            Rescuebook::new(input, MemOutput::new(), book, opts, &clock, InterruptFlag::new())
                .unwrap();
        rescue.run().unwrap();
        let (mut input, out, book) = rescue.into_parts();
        assert_eq!(book.counts_in_domain().size_of(Status::NonTrimmed), 4096);

        // After healing, try-again reclassifies and rescues everything.
        input.heal(Block::new(4096, 4096));
        let opts = RescueOptions {
            try_again: true,
            ..small_opts()
        };
        let mut rescue =
            Rescuebook::new(input, out, book, opts, &clock, InterruptFlag::new()).unwrap();
        let summary = rescue.run().unwrap();
        assert_eq!(summary.rescued, size as u64);
        let (_, out, _) = rescue.into_parts();
        assert_eq!(out.data(), &data[..]);
    }

    #[test]
    fn domain_restriction_leaves_rest_untouched() {
        let size = 256 << 10;
        let data = pattern(size);
        let clock = ManualClock::new();
        let domain = Domain::new(64 << 10, Some(64 << 10));
        let book = Mapbook::new(0, size as u64, domain, None, "", false).unwrap();
        let mut rescue = Rescuebook::new(
            MemInput::new(data.clone()),
            MemOutput::new(),
            book,
            small_opts(),
            &clock,
            InterruptFlag::new(),
        )
        .unwrap();
        let summary = rescue.run().unwrap();
        assert_eq!(summary.rescued, 64 << 10);
        let (_, out, book) = rescue.into_parts();
        let counts = book.counts_in_domain();
        assert_eq!(counts.size_of(Status::Finished), 64 << 10);
        // Output only covers the domain window.
        assert_eq!(out.data().len(), 128 << 10);
        assert_eq!(&out.data()[64 << 10..], &data[64 << 10..128 << 10]);
    }

    #[test]
    fn options_are_validated() {
        let bad = RescueOptions {
            skipbs: 1000, // not a sector multiple
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = RescueOptions {
            cluster: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = RescueOptions {
            skipbs: 512,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = RescueOptions {
            preview_lines: Some(40),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn preview_keeps_latest_bytes() {
        let size = 256 << 10;
        let clock = ManualClock::new();
        let book = fresh_book(size as u64, None);
        let opts = RescueOptions {
            preview_lines: Some(1),
            ..small_opts()
        };
        let mut rescue = Rescuebook::new(
            MemInput::new(pattern(size)),
            MemOutput::new(),
            book,
            opts,
            &clock,
            InterruptFlag::new(),
        )
        .unwrap();
        rescue.run().unwrap();
        let data = pattern(size);
        assert_eq!(rescue.preview(), &data[size - PREVIEW_LINE_BYTES..]);
    }
}
