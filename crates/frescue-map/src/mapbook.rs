//! The mapbook: the single source of truth for "what has been done where".
//!
//! A mapbook owns the ordered sblock partition plus the persisted cursor
//! (`current_pos`, `current_status`, `current_pass`), the domain the
//! current operation is confined to, and the path of the backing mapfile.
//! The list invariants hold at all times: contiguous, positive sizes,
//! covering one half-open interval; compactness is restored by
//! [`Mapbook::compact_sblock_vector`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use frescue_error::{RescueError, Result};
use frescue_types::{Block, MapStatus, Pass, Sblock, Status};

use crate::domain::Domain;
use crate::mapfile::{self, MapData, SaveMeta};

/// Minimum interval between throttled saves during steady-state copying.
const SAVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct Mapbook {
    path: Option<PathBuf>,
    meta: SaveMeta,
    /// Constant difference between output and input positions.
    offset: i64,
    domain: Domain,
    sblocks: Vec<Sblock>,
    current_pos: u64,
    current_status: MapStatus,
    current_pass: Pass,
    /// Input size recorded by the mapfile (end of its last block), or 0.
    mapfile_isize: u64,
    blank: bool,
    last_save: Option<Duration>,
}

impl Mapbook {
    /// Build a mapbook for a device of known size.
    ///
    /// Loads `path` when it exists (a corrupt file is fatal), truncates
    /// extents past `isize`, and pads with non-tried up to `isize`. With
    /// `complete_only`, the domain is confined to what the mapfile
    /// already declares instead of extending.
    pub fn new(
        offset: i64,
        isize: u64,
        mut domain: Domain,
        path: Option<&Path>,
        command_line: &str,
        complete_only: bool,
    ) -> Result<Mapbook> {
        let loaded = match path {
            Some(p) => mapfile::load(p)?,
            None => None,
        };
        let mut book = Mapbook {
            path: path.map(Path::to_path_buf),
            meta: SaveMeta {
                command_line: command_line.to_owned(),
                note: None,
            },
            offset,
            domain: Domain::new(0, Some(0)),
            sblocks: Vec::new(),
            current_pos: 0,
            current_status: MapStatus::Copying,
            current_pass: Pass::FIRST,
            mapfile_isize: 0,
            blank: true,
            last_save: None,
        };
        if let Some(data) = loaded {
            book.blank = data.sblocks.is_empty();
            book.mapfile_isize = data.sblocks.last().map_or(0, |sb| sb.end());
            book.current_pos = data.current_pos;
            book.current_status = data.current_status;
            book.current_pass = data.current_pass;
            book.sblocks = data.sblocks;
        }
        if complete_only && !book.blank {
            let end = book.extent().end();
            let bound = if isize > 0 { end.min(isize) } else { end };
            domain.crop_to(Block::new(0, bound));
            book.truncate_vector(bound, false);
        } else if isize > 0 {
            book.truncate_vector(isize, false);
            book.extend_sblock_vector(isize);
            domain.crop_to(Block::new(0, isize));
        } else if !book.blank {
            domain.crop_to(Block::new(0, book.extent().end()));
        }
        book.domain = domain;
        book.compact_sblock_vector();
        Ok(book)
    }

    /// Open an existing mapfile as a standalone book (the map-algebra
    /// tools). The input size is whatever the file declares.
    pub fn open(path: &Path, domain: Domain, offset: i64) -> Result<Mapbook> {
        if mapfile::load(path)?.is_none() {
            return Err(RescueError::MapfileMissing {
                path: path.to_path_buf(),
            });
        }
        Mapbook::new(offset, 0, domain, Some(path), "", false)
    }

    /// Build a book over `[0, isize)` without reading the mapfile, for
    /// operations that create one from scratch.
    pub fn new_blank(
        isize: u64,
        domain: Domain,
        path: &Path,
        command_line: &str,
    ) -> Mapbook {
        let mut book = Mapbook {
            path: Some(path.to_path_buf()),
            meta: SaveMeta {
                command_line: command_line.to_owned(),
                note: None,
            },
            offset: 0,
            domain,
            sblocks: Vec::new(),
            current_pos: 0,
            current_status: MapStatus::Finished,
            current_pass: Pass::FIRST,
            mapfile_isize: 0,
            blank: true,
            last_save: None,
        };
        book.extend_sblock_vector(isize);
        book
    }

    /// The canonical mapfile text for the current state.
    pub fn render_map(&mut self) -> String {
        self.compact_sblock_vector();
        mapfile::render(&self.snapshot(), &self.meta)
    }

    // -----------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------

    pub fn sblocks(&self) -> &[Sblock] {
        &self.sblocks
    }

    pub fn sblock(&self, i: usize) -> Sblock {
        self.sblocks[i]
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether no mapfile data was loaded.
    pub fn is_blank(&self) -> bool {
        self.blank
    }

    pub fn mapfile_isize(&self) -> u64 {
        self.mapfile_isize
    }

    pub fn current_pos(&self) -> u64 {
        self.current_pos
    }

    pub fn current_status(&self) -> MapStatus {
        self.current_status
    }

    pub fn current_pass(&self) -> Pass {
        self.current_pass
    }

    pub fn set_current_pos(&mut self, pos: u64) {
        self.current_pos = pos;
    }

    pub fn set_current_status(&mut self, status: MapStatus) {
        self.current_status = status;
    }

    pub fn set_current_pass(&mut self, pass: Pass) {
        self.current_pass = pass;
    }

    /// Extra mapfile header note (the fill convention line).
    pub fn set_note(&mut self, note: Option<String>) {
        self.meta.note = note;
    }

    /// The single interval covered by the sblock list.
    pub fn extent(&self) -> Block {
        match (self.sblocks.first(), self.sblocks.last()) {
            (Some(first), Some(last)) => Block::new(first.pos(), last.end() - first.pos()),
            _ => Block::empty_at(0),
        }
    }

    // -----------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------

    /// Index of the sblock containing `pos`. O(log n).
    pub fn find_index(&self, pos: u64) -> Option<usize> {
        let i = self.sblocks.partition_point(|sb| sb.end() <= pos);
        (i < self.sblocks.len() && self.sblocks[i].block().includes_addr(pos)).then_some(i)
    }

    /// First chunk of status `st` starting at or after `window.pos()`,
    /// at most `window.size()` bytes, confined to one sblock. Empty when
    /// none remains.
    pub fn find_chunk(&self, window: Block, st: Status) -> Block {
        self.find_chunk_in(window, st, None)
    }

    /// As [`Mapbook::find_chunk`], also confined to one `domain` member.
    pub fn find_chunk_in(&self, window: Block, st: Status, domain: Option<&Domain>) -> Block {
        if window.is_empty() || self.sblocks.is_empty() {
            return Block::empty_at(window.pos());
        }
        let size = window.size();
        let pos = window.pos().max(self.sblocks[0].pos());
        let start = match self.find_index(pos) {
            Some(i) => i,
            None => return Block::empty_at(pos),
        };
        for sb in &self.sblocks[start..] {
            if sb.status() != st {
                continue;
            }
            let base = sb.pos().max(pos);
            if base >= sb.end() {
                continue;
            }
            let from = match domain {
                None => base,
                Some(d) => match d.next_inside(base) {
                    Some(p) if p < sb.end() => p,
                    Some(_) => continue,
                    None => return Block::empty_at(sb.end()),
                },
            };
            let mut chunk = Block::new(from, size);
            chunk.crop(sb.block());
            if let Some(d) = domain {
                chunk = d.limit(chunk);
            }
            if !chunk.is_empty() {
                return chunk;
            }
        }
        Block::empty_at(self.extent().end())
    }

    /// Last chunk of status `st` ending at or before `window.end()`,
    /// at most `window.size()` bytes. Empty when none remains.
    pub fn rfind_chunk(&self, window: Block, st: Status) -> Block {
        self.rfind_chunk_in(window, st, None)
    }

    /// As [`Mapbook::rfind_chunk`], also confined to one `domain` member.
    pub fn rfind_chunk_in(&self, window: Block, st: Status, domain: Option<&Domain>) -> Block {
        if window.is_empty() || self.sblocks.is_empty() {
            return Block::empty_at(window.pos());
        }
        let size = window.size();
        let end = window.end().min(self.extent().end());
        if end <= self.sblocks[0].pos() {
            return Block::empty_at(self.sblocks[0].pos());
        }
        let start = match self.find_index(end - 1) {
            Some(i) => i,
            None => return Block::empty_at(end),
        };
        for sb in self.sblocks[..=start].iter().rev() {
            if sb.status() != st {
                continue;
            }
            let cap = sb.end().min(end);
            if cap <= sb.pos() {
                continue;
            }
            let to = match domain {
                None => cap,
                Some(d) => match d.prev_inside(cap) {
                    Some(p) if p > sb.pos() => p,
                    Some(_) => continue,
                    None => return Block::empty_at(self.sblocks[0].pos()),
                },
            };
            let from = to.saturating_sub(size).max(sb.pos());
            let mut chunk = Block::new(from, to - from);
            if let Some(d) = domain {
                if let Some(part) = d.part_containing(to - 1) {
                    chunk.crop(part);
                }
            }
            if !chunk.is_empty() {
                return chunk;
            }
        }
        Block::empty_at(self.sblocks[0].pos())
    }

    // -----------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------

    /// Change the status of a single sblock by index, without merging.
    pub fn change_sblock_status(&mut self, i: usize, st: Status) {
        self.sblocks[i].set_status(st);
    }

    /// Split sblock `i` at `pos`, both halves keeping the status.
    /// No-op when `pos` is not interior to the sblock.
    pub fn split_sblock_by(&mut self, pos: u64, i: usize) {
        if let Some(front) = self.sblocks[i].split(pos) {
            self.sblocks.insert(i, front);
        }
    }

    /// Insert an sblock, replacing whatever the overlapped range held.
    ///
    /// `sb` must lie inside the current extent.
    pub fn insert_sblock(&mut self, sb: Sblock) -> Result<()> {
        self.change_chunk_status(sb.block(), sb.status()).map(|_| ())
    }

    /// Retype the chunk `b`, splitting as needed; returns the index of
    /// the sblock now starting at `b.pos()`.
    ///
    /// `b` must be contained in the list extent; anything else is an
    /// internal consistency error.
    pub fn change_chunk_status(&mut self, b: Block, st: Status) -> Result<usize> {
        if b.is_empty() {
            return Err(RescueError::internal("empty chunk in change_chunk_status"));
        }
        if !self.extent().includes(b) {
            return Err(RescueError::internal(format!(
                "chunk {b} outside map extent {}",
                self.extent()
            )));
        }
        let mut i = self
            .find_index(b.pos())
            .ok_or_else(|| RescueError::internal("lost index in change_chunk_status"))?;
        if self.sblocks[i].pos() < b.pos() {
            self.split_sblock_by(b.pos(), i);
            i += 1;
        }
        let first = i;
        let mut j = i;
        loop {
            let sb = self.sblocks[j];
            if sb.end() <= b.end() {
                self.sblocks[j].set_status(st);
                if sb.end() == b.end() {
                    break;
                }
                j += 1;
                if j >= self.sblocks.len() {
                    return Err(RescueError::internal("chunk ran past map extent"));
                }
            } else {
                self.split_sblock_by(b.end(), j);
                self.sblocks[j].set_status(st);
                break;
            }
        }
        self.coalesce_around(first, j);
        self.find_index(b.pos())
            .ok_or_else(|| RescueError::internal("lost index after change_chunk_status"))
    }

    /// Merge same-status neighbors in the window `[from-1, to+1]`.
    fn coalesce_around(&mut self, from: usize, to: usize) {
        let mut k = from.saturating_sub(1);
        let mut limit = (to + 1).min(self.sblocks.len().saturating_sub(1));
        while k < limit {
            if self.sblocks[k].status() == self.sblocks[k + 1].status() {
                let next = self.sblocks.remove(k + 1);
                let mut cur = self.sblocks[k];
                if !cur.join(next) {
                    // Contiguity is a standing invariant; adjacent blocks
                    // always join.
                    unreachable!("non-contiguous sblock vector");
                }
                self.sblocks[k] = cur;
                limit -= 1;
            } else {
                k += 1;
            }
        }
    }

    /// Drop or clip everything at or past `end`; with `pad`, then extend
    /// with non-tried so the list reaches `end`.
    pub fn truncate_vector(&mut self, end: u64, pad: bool) {
        while self.sblocks.last().is_some_and(|last| last.pos() >= end) {
            self.sblocks.pop();
        }
        if let Some(last) = self.sblocks.last_mut() {
            if last.end() > end {
                *last = Sblock::new(Block::new(last.pos(), end - last.pos()), last.status());
            }
        }
        if pad {
            self.extend_sblock_vector(end);
        }
        if self.current_pos > end {
            self.current_pos = end;
        }
    }

    /// Append a trailing non-tried sblock so the list covers `[.., isize)`.
    pub fn extend_sblock_vector(&mut self, isize: u64) {
        let Some(&last) = self.sblocks.last() else {
            if isize > 0 {
                self.sblocks
                    .push(Sblock::new(Block::new(0, isize), Status::NonTried));
            }
            return;
        };
        if last.end() >= isize {
            return;
        }
        if last.status() == Status::NonTried {
            let i = self.sblocks.len() - 1;
            self.sblocks[i] = Sblock::new(
                Block::new(last.pos(), isize - last.pos()),
                Status::NonTried,
            );
        } else {
            self.sblocks.push(Sblock::new(
                Block::new(last.end(), isize - last.end()),
                Status::NonTried,
            ));
        }
    }

    /// Merge all adjacent same-status sblocks.
    pub fn compact_sblock_vector(&mut self) {
        let mut compacted: Vec<Sblock> = Vec::with_capacity(self.sblocks.len());
        for sb in self.sblocks.drain(..) {
            if let Some(last) = compacted.last_mut() {
                if last.join(sb) {
                    continue;
                }
            }
            compacted.push(sb);
        }
        self.sblocks = compacted;
    }

    // -----------------------------------------------------------------
    // Accounting
    // -----------------------------------------------------------------

    /// Per-status totals over the domain, plus the damaged-area count.
    pub fn counts_in_domain(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        let mut first_block = true;
        let mut in_good = true;
        let mut prev: Option<Status> = None;
        for sb in &self.sblocks {
            if !self.domain.includes(sb.block()) {
                if self.domain.entirely_before(sb.block()) {
                    break;
                }
                first_block = true;
                in_good = true;
                continue;
            }
            let st = sb.status();
            let idx = st.rank() as usize;
            counts.size[idx] += sb.size();
            if first_block || prev != Some(st) {
                counts.areas[idx] += 1;
            }
            if st.is_damaged() {
                counts.errsize += sb.size();
                if in_good {
                    in_good = false;
                    counts.errors += 1;
                }
            } else {
                in_good = true;
            }
            first_block = false;
            prev = Some(st);
        }
        counts
    }

    // -----------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------

    fn snapshot(&self) -> MapData {
        MapData {
            current_pos: self.current_pos,
            current_status: self.current_status,
            current_pass: self.current_pass,
            sblocks: self.sblocks.clone(),
        }
    }

    /// Unconditional atomic save.
    pub fn write_mapfile(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        self.compact_sblock_vector();
        let data = self.snapshot();
        mapfile::save(&path, &data, &self.meta)?;
        tracing::debug!(path = %path.display(), status = %self.current_status, "mapfile saved");
        Ok(())
    }

    /// Throttled save: at most one per ~30 s unless `force`.
    ///
    /// Returns whether a save actually happened.
    pub fn update_mapfile(&mut self, now: Duration, force: bool) -> Result<bool> {
        if self.path.is_none() {
            return Ok(false);
        }
        if !force {
            if let Some(last) = self.last_save {
                if now.saturating_sub(last) < SAVE_INTERVAL {
                    return Ok(false);
                }
            }
        }
        self.write_mapfile()?;
        self.last_save = Some(now);
        Ok(true)
    }
}

/// Per-status byte and area totals, indexed by [`Status::rank`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub size: [u64; 5],
    pub areas: [u64; 5],
    /// Maximal runs of damaged statuses.
    pub errors: u64,
    /// Total bytes in damaged statuses.
    pub errsize: u64,
}

impl StatusCounts {
    pub fn size_of(&self, st: Status) -> u64 {
        self.size[st.rank() as usize]
    }

    pub fn areas_of(&self, st: Status) -> u64 {
        self.areas[st.rank() as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn book_with(sblocks: &[(u64, u64, Status)]) -> Mapbook {
        let mut book = Mapbook::new(0, 0, Domain::new(0, None), None, "", false).unwrap();
        for &(pos, size, st) in sblocks {
            book.sblocks.push(Sblock::new(Block::new(pos, size), st));
        }
        book
    }

    fn fresh(isize: u64) -> Mapbook {
        Mapbook::new(0, isize, Domain::new(0, None), None, "", false).unwrap()
    }

    fn assert_invariants(book: &Mapbook) {
        let v = book.sblocks();
        for sb in v {
            assert!(sb.size() > 0, "zero-size sblock");
        }
        for pair in v.windows(2) {
            assert_eq!(pair[0].end(), pair[1].pos(), "not contiguous");
        }
    }

    #[test]
    fn fresh_book_covers_input() {
        let book = fresh(1 << 20);
        assert_eq!(book.sblocks().len(), 1);
        assert_eq!(book.extent(), Block::new(0, 1 << 20));
        assert_eq!(book.sblock(0).status(), Status::NonTried);
        assert!(book.is_blank());
    }

    #[test]
    fn find_index_binary_search() {
        let book = book_with(&[
            (0, 100, Status::Finished),
            (100, 50, Status::BadSector),
            (150, 850, Status::NonTried),
        ]);
        assert_eq!(book.find_index(0), Some(0));
        assert_eq!(book.find_index(99), Some(0));
        assert_eq!(book.find_index(100), Some(1));
        assert_eq!(book.find_index(149), Some(1));
        assert_eq!(book.find_index(150), Some(2));
        assert_eq!(book.find_index(999), Some(2));
        assert_eq!(book.find_index(1000), None);
    }

    #[test]
    fn change_chunk_status_splits() {
        let mut book = fresh(1000);
        let i = book
            .change_chunk_status(Block::new(100, 200), Status::Finished)
            .unwrap();
        assert_eq!(i, 1);
        assert_invariants(&book);
        assert_eq!(book.sblocks().len(), 3);
        assert_eq!(book.sblock(0).block(), Block::new(0, 100));
        assert_eq!(book.sblock(1).status(), Status::Finished);
        assert_eq!(book.sblock(1).block(), Block::new(100, 200));
        assert_eq!(book.sblock(2).block(), Block::new(300, 700));
    }

    #[test]
    fn change_chunk_status_merges_neighbors() {
        let mut book = fresh(1000);
        book.change_chunk_status(Block::new(0, 100), Status::Finished)
            .unwrap();
        book.change_chunk_status(Block::new(100, 100), Status::Finished)
            .unwrap();
        assert_invariants(&book);
        assert_eq!(book.sblocks().len(), 2);
        assert_eq!(book.sblock(0).block(), Block::new(0, 200));
    }

    #[test]
    fn change_chunk_status_idempotent() {
        let mut book = fresh(1000);
        book.change_chunk_status(Block::new(100, 200), Status::BadSector)
            .unwrap();
        let before = book.sblocks().to_vec();
        book.change_chunk_status(Block::new(100, 200), Status::BadSector)
            .unwrap();
        assert_eq!(book.sblocks(), &before[..]);
    }

    #[test]
    fn change_chunk_status_spanning_multiple() {
        let mut book = fresh(1000);
        book.change_chunk_status(Block::new(100, 100), Status::Finished)
            .unwrap();
        book.change_chunk_status(Block::new(300, 100), Status::BadSector)
            .unwrap();
        // Overwrite a range crossing all of them.
        book.change_chunk_status(Block::new(50, 500), Status::NonScraped)
            .unwrap();
        assert_invariants(&book);
        let statuses: Vec<_> = book.sblocks().iter().map(|sb| sb.status()).collect();
        assert_eq!(
            statuses,
            vec![Status::NonTried, Status::NonScraped, Status::NonTried]
        );
        assert_eq!(book.sblock(1).block(), Block::new(50, 500));
    }

    #[test]
    fn chunk_outside_extent_is_internal_error() {
        let mut book = fresh(1000);
        let err = book
            .change_chunk_status(Block::new(900, 200), Status::Finished)
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn find_chunk_basic() {
        let book = book_with(&[
            (0, 100, Status::Finished),
            (100, 50, Status::NonTried),
            (150, 50, Status::BadSector),
            (200, 100, Status::NonTried),
        ]);
        // From the start, limited to 30 bytes.
        let c = book.find_chunk(Block::new(0, 30), Status::NonTried);
        assert_eq!(c, Block::new(100, 30));
        // Starting inside the first non-tried block.
        let c = book.find_chunk(Block::new(120, 1000), Status::NonTried);
        assert_eq!(c, Block::new(120, 30));
        // Past everything.
        let c = book.find_chunk(Block::new(250, 100), Status::BadSector);
        assert!(c.is_empty());
    }

    #[test]
    fn rfind_chunk_basic() {
        let book = book_with(&[
            (0, 100, Status::NonTried),
            (100, 100, Status::Finished),
            (200, 100, Status::NonTried),
        ]);
        let c = book.rfind_chunk(Block::new(0, 300), Status::NonTried);
        assert_eq!(c, Block::new(200, 100));
        // Limited size takes the tail end below the window end.
        let c = book.rfind_chunk(Block::new(260, 40), Status::NonTried);
        assert_eq!(c, Block::new(260, 40));
        // Window ending before the second block.
        let c = book.rfind_chunk(Block::new(0, 150), Status::NonTried);
        assert_eq!(c, Block::new(0, 100));
    }

    #[test]
    fn find_chunk_respects_domain() {
        let book = book_with(&[(0, 1000, Status::NonTried)]);
        let domain = Domain::new(300, Some(100));
        let c = book.find_chunk_in(Block::new(0, 64), Status::NonTried, Some(&domain));
        assert_eq!(c, Block::new(300, 64));
        let c = book.find_chunk_in(Block::new(390, 64), Status::NonTried, Some(&domain));
        assert_eq!(c, Block::new(390, 10));
        let c = book.find_chunk_in(Block::new(400, 64), Status::NonTried, Some(&domain));
        assert!(c.is_empty());
    }

    #[test]
    fn truncate_and_extend() {
        let mut book = fresh(1000);
        book.change_chunk_status(Block::new(800, 200), Status::Finished)
            .unwrap();
        book.truncate_vector(900, false);
        assert_invariants(&book);
        assert_eq!(book.extent().end(), 900);
        assert_eq!(book.sblocks().last().unwrap().status(), Status::Finished);

        book.extend_sblock_vector(1200);
        assert_invariants(&book);
        assert_eq!(book.extent().end(), 1200);
        assert_eq!(book.sblocks().last().unwrap().status(), Status::NonTried);

        // Extending a non-tried tail grows it in place.
        let len = book.sblocks().len();
        book.extend_sblock_vector(1500);
        assert_eq!(book.sblocks().len(), len);
        assert_eq!(book.extent().end(), 1500);
    }

    #[test]
    fn compact_merges_and_is_idempotent() {
        let mut book = book_with(&[
            (0, 100, Status::Finished),
            (100, 100, Status::Finished),
            (200, 100, Status::BadSector),
            (300, 100, Status::Finished),
        ]);
        book.compact_sblock_vector();
        assert_invariants(&book);
        assert_eq!(book.sblocks().len(), 3);
        let once = book.sblocks().to_vec();
        book.compact_sblock_vector();
        assert_eq!(book.sblocks(), &once[..]);
    }

    #[test]
    fn counts_over_domain() {
        let mut book = fresh(1000);
        book.change_chunk_status(Block::new(0, 400), Status::Finished)
            .unwrap();
        book.change_chunk_status(Block::new(400, 100), Status::NonTrimmed)
            .unwrap();
        book.change_chunk_status(Block::new(500, 100), Status::BadSector)
            .unwrap();
        let counts = book.counts_in_domain();
        assert_eq!(counts.size_of(Status::Finished), 400);
        assert_eq!(counts.size_of(Status::NonTried), 400);
        assert_eq!(counts.errsize, 200);
        // The two damaged blocks are adjacent: one error area.
        assert_eq!(counts.errors, 1);
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.map");
        {
            let mut book = Mapbook::new(
                0,
                1000,
                Domain::new(0, None),
                Some(&path),
                "frescue in out map",
                false,
            )
            .unwrap();
            book.change_chunk_status(Block::new(0, 600), Status::Finished)
                .unwrap();
            book.set_current_pos(600);
            book.set_current_status(MapStatus::Trimming);
            book.write_mapfile().unwrap();
        }
        let book = Mapbook::new(0, 1000, Domain::new(0, None), Some(&path), "", false).unwrap();
        assert!(!book.is_blank());
        assert_eq!(book.current_pos(), 600);
        assert_eq!(book.current_status(), MapStatus::Trimming);
        assert_eq!(book.sblock(0).status(), Status::Finished);
        assert_eq!(book.mapfile_isize(), 1000);
    }

    #[test]
    fn throttled_saves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.map");
        let mut book =
            Mapbook::new(0, 1000, Domain::new(0, None), Some(&path), "", false).unwrap();
        assert!(book.update_mapfile(Duration::from_secs(0), false).unwrap());
        assert!(!book.update_mapfile(Duration::from_secs(10), false).unwrap());
        assert!(book.update_mapfile(Duration::from_secs(10), true).unwrap());
        assert!(book.update_mapfile(Duration::from_secs(45), false).unwrap());
    }

    #[test]
    fn map_past_input_end_is_truncated_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.map");
        {
            let mut book =
                Mapbook::new(0, 2000, Domain::new(0, None), Some(&path), "", false).unwrap();
            book.change_chunk_status(Block::new(0, 2000), Status::Finished)
                .unwrap();
            book.write_mapfile().unwrap();
        }
        // Reopen against a smaller input.
        let book = Mapbook::new(0, 1200, Domain::new(0, None), Some(&path), "", false).unwrap();
        assert_eq!(book.extent().end(), 1200);
    }

    proptest! {
        /// I1/I2/I5: random chunk rewrites preserve the partition and are
        /// idempotent; compaction never changes coverage.
        #[test]
        fn random_mutations_preserve_invariants(
            ops in proptest::collection::vec((0u64..1000, 1u64..400, 0usize..5), 1..40)
        ) {
            let mut book = fresh(1000);
            for (pos, size, st) in ops {
                let end = (pos + size).min(1000);
                if end <= pos { continue; }
                let b = Block::new(pos, end - pos);
                let st = Status::ALL[st];
                book.change_chunk_status(b, st).unwrap();
                let snapshot = book.sblocks().to_vec();
                book.change_chunk_status(b, st).unwrap();
                prop_assert_eq!(book.sblocks(), &snapshot[..]);
            }
            book.compact_sblock_vector();
            prop_assert!(book.sblocks().len() >= 1);
            prop_assert_eq!(book.sblock(0).pos(), 0);
            prop_assert_eq!(book.extent().end(), 1000);
            for pair in book.sblocks().windows(2) {
                prop_assert_eq!(pair[0].end(), pair[1].pos());
                prop_assert!(pair[0].status() != pair[1].status());
                prop_assert!(pair[0].size() > 0 && pair[1].size() > 0);
            }
        }
    }
}
