//! Generate mode: reconstruct an approximate mapfile from a partial copy.
//!
//! For every cluster-sized window the engine reads the same region from
//! the input and from the existing partial copy. A sector whose copy is
//! entirely zero while the input is not cannot have been rescued, so it
//! is marked non-tried; every other sector is marked finished. The
//! resulting mapfile lets a rescue resume from a copy whose mapfile was
//! lost.

use frescue_error::{RescueError, Result};
use frescue_io::{Clock, Input, InterruptFlag};
use frescue_map::{Domain, Mapbook};
use frescue_types::{align_up, Block, MapStatus, Status};

use crate::apply_offset;

/// Knobs of a generate run.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub hardbs: u64,
    pub cluster: u64,
}

impl Default for GenerateOptions {
    fn default() -> GenerateOptions {
        GenerateOptions {
            hardbs: 512,
            cluster: 128,
        }
    }
}

impl GenerateOptions {
    pub fn softbs(&self) -> u64 {
        self.cluster * self.hardbs
    }

    pub fn validate(&self) -> Result<()> {
        if self.hardbs == 0 || self.cluster == 0 {
            return Err(RescueError::bad_argument(
                "sector and cluster sizes must be positive",
            ));
        }
        Ok(())
    }
}

/// Final accounting of a generate run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerateSummary {
    /// Bytes judged rescued.
    pub finished: u64,
    /// Bytes judged still needing rescue.
    pub non_tried: u64,
}

/// The generate driver. Both the input and the partial copy are read
/// through the positioned [`Input`] contract.
#[derive(Debug)]
pub struct Genbook<'a, I: Input, J: Input> {
    book: Mapbook,
    domain: Domain,
    input: I,
    copy: J,
    opts: GenerateOptions,
    clock: &'a dyn Clock,
    interrupt: InterruptFlag,
}

impl<'a, I: Input, J: Input> Genbook<'a, I, J> {
    /// Refuses a mapfile that exists and is neither empty nor a resumed
    /// generation.
    pub fn new(
        input: I,
        copy: J,
        book: Mapbook,
        opts: GenerateOptions,
        clock: &'a dyn Clock,
        interrupt: InterruptFlag,
    ) -> Result<Genbook<'a, I, J>> {
        opts.validate()?;
        if !book.is_blank() && book.current_status() != MapStatus::Generating {
            return Err(RescueError::bad_argument(
                "mapfile exists and is not a resumed generation",
            ));
        }
        let domain = book.domain().clone();
        Ok(Genbook {
            book,
            domain,
            input,
            copy,
            opts,
            clock,
            interrupt,
        })
    }

    pub fn book(&self) -> &Mapbook {
        &self.book
    }

    pub fn into_book(self) -> Mapbook {
        self.book
    }

    pub fn run(&mut self) -> Result<GenerateSummary> {
        let result = self.generate_all();
        if let Err(e) = self.book.write_mapfile() {
            tracing::error!(error = %e, "final mapfile save failed");
            if result.is_ok() {
                return Err(e);
            }
        }
        result?;
        let counts = self.book.counts_in_domain();
        Ok(GenerateSummary {
            finished: counts.size_of(Status::Finished),
            non_tried: counts.size_of(Status::NonTried),
        })
    }

    fn generate_all(&mut self) -> Result<()> {
        let resuming = self.book.current_status() == MapStatus::Generating;
        self.book.set_current_status(MapStatus::Generating);
        self.book.update_mapfile(self.clock.elapsed(), true)?;

        let softbs = self.opts.softbs();
        let offset = self.book.offset();
        // Never examine positions that would map before the start of
        // the copy.
        let floor = if offset < 0 { offset.unsigned_abs() } else { 0 };
        let mut pos = floor;
        if resuming && self.book.current_pos() > pos {
            pos = self.book.current_pos();
        }
        let mut in_buf = vec![0u8; softbs as usize];
        let mut out_buf = vec![0u8; softbs as usize];
        loop {
            self.check_interrupt()?;
            let wsize = softbs - pos % softbs;
            let window = self.book.find_chunk_in(
                Block::new(pos, wsize),
                Status::NonTried,
                Some(&self.domain),
            );
            if window.is_empty() {
                break;
            }
            self.book.set_current_pos(window.pos());
            self.classify_window(window, &mut in_buf, &mut out_buf)?;
            pos = window.end();
            self.book.set_current_pos(pos);
            self.book.update_mapfile(self.clock.elapsed(), false)?;
        }
        self.book.set_current_status(MapStatus::Finished);
        Ok(())
    }

    fn classify_window(
        &mut self,
        window: Block,
        in_buf: &mut [u8],
        out_buf: &mut [u8],
    ) -> Result<()> {
        let size = window.size() as usize;
        let in_buf = &mut in_buf[..size];
        let out_buf = &mut out_buf[..size];
        in_buf.fill(0);
        out_buf.fill(0);

        let in_chunk = self.input.read_at(in_buf, window.pos())?;
        let out_pos = apply_offset(window.pos(), self.book.offset())?;
        // Short or failed copy reads leave zeros, which classify as
        // not-yet-rescued below.
        let _ = self.copy.read_at(out_buf, out_pos)?;

        let hardbs = self.opts.hardbs;
        let mut pos = window.pos();
        while pos < window.end() {
            let ssize = (align_up(pos + 1, hardbs) - pos).min(window.end() - pos);
            let lo = (pos - window.pos()) as usize;
            let hi = lo + ssize as usize;
            // Sectors past an input read error stay non-tried: nothing
            // is known about them.
            let input_known = hi <= in_chunk.copied || !in_chunk.error;
            let out_zero = out_buf[lo..hi].iter().all(|&b| b == 0);
            let in_zero = in_buf[lo..hi].iter().all(|&b| b == 0);
            let rescued = out_zero && input_known && in_zero || !out_zero;
            if rescued {
                self.book
                    .change_chunk_status(Block::new(pos, ssize), Status::Finished)?;
            }
            pos += ssize;
        }
        Ok(())
    }

    fn check_interrupt(&self) -> Result<()> {
        match self.interrupt.as_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frescue_io::{ManualClock, MemInput};
    use std::path::Path;

    fn book_for(path: &Path, isize: u64) -> Mapbook {
        Mapbook::new(0, isize, Domain::new(0, None), Some(path), "frescue -G", false).unwrap()
    }

    fn opts() -> GenerateOptions {
        GenerateOptions {
            hardbs: 512,
            cluster: 2,
        }
    }

    #[test]
    fn classifies_zero_holes_as_non_tried() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("gen.map");
        let size = 4096u64;
        // Input has data everywhere; the copy has a hole at [1024, 2048).
        let input: Vec<u8> = (0..size).map(|i| (i % 200 + 1) as u8).collect();
        let mut copy = input.clone();
        copy[1024..2048].fill(0);

        let clock = ManualClock::new();
        let mut gen = Genbook::new(
            MemInput::new(input),
            MemInput::new(copy),
            book_for(&map, size),
            opts(),
            &clock,
            InterruptFlag::new(),
        )
        .unwrap();
        let summary = gen.run().unwrap();
        assert_eq!(summary.non_tried, 1024);
        assert_eq!(summary.finished, size - 1024);

        let book = gen.into_book();
        assert_eq!(book.current_status(), MapStatus::Finished);
        let shape: Vec<_> = book
            .sblocks()
            .iter()
            .map(|sb| (sb.pos(), sb.size(), sb.status()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (0, 1024, Status::Finished),
                (1024, 1024, Status::NonTried),
                (2048, 2048, Status::Finished),
            ]
        );
    }

    #[test]
    fn zero_in_both_counts_as_rescued() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("gen.map");
        let size = 2048u64;
        // Input itself is zero in [512, 1024): a zero copy there is
        // correct data, not a hole.
        let mut input = vec![7u8; size as usize];
        input[512..1024].fill(0);
        let mut copy = input.clone();
        copy[1536..2048].fill(0); // a real hole

        let clock = ManualClock::new();
        let mut gen = Genbook::new(
            MemInput::new(input),
            MemInput::new(copy),
            book_for(&map, size),
            opts(),
            &clock,
            InterruptFlag::new(),
        )
        .unwrap();
        let summary = gen.run().unwrap();
        assert_eq!(summary.non_tried, 512);
        assert_eq!(summary.finished, 1536);
    }

    #[test]
    fn refuses_foreign_mapfile_and_accepts_resume() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("gen.map");
        let size = 1024u64;

        // A mapfile mid-rescue is not ours to overwrite.
        {
            let mut book = book_for(&map, size);
            book.set_current_status(MapStatus::Copying);
            book.change_chunk_status(Block::new(0, 512), Status::Finished)
                .unwrap();
            book.write_mapfile().unwrap();
        }
        let clock = ManualClock::new();
        let err = Genbook::new(
            MemInput::new(vec![1; size as usize]),
            MemInput::new(vec![1; size as usize]),
            book_for(&map, size),
            opts(),
            &clock,
            InterruptFlag::new(),
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 1);

        // A generating-status mapfile resumes.
        {
            let mut book = book_for(&map, size);
            book.set_current_status(MapStatus::Generating);
            book.write_mapfile().unwrap();
        }
        let mut gen = Genbook::new(
            MemInput::new(vec![1; size as usize]),
            MemInput::new(vec![1; size as usize]),
            book_for(&map, size),
            opts(),
            &clock,
            InterruptFlag::new(),
        )
        .unwrap();
        let summary = gen.run().unwrap();
        assert_eq!(summary.finished, size);
    }
}
