//! Rescue domain: the subset of the input address space under
//! consideration.
//!
//! A domain is an ordered, disjoint set of blocks. Without a domain
//! mapfile it is the single window `[ipos, ipos + max_size)`; with one it
//! is the finished extents of that mapfile intersected with the window.

use std::path::Path;

use frescue_error::{RescueError, Result};
use frescue_types::{Block, MapStatus, Status};

use crate::mapfile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    parts: Vec<Block>,
}

impl Domain {
    /// The window `[ipos, ipos + max_size)`; unbounded when `max_size`
    /// is `None`.
    pub fn new(ipos: u64, max_size: Option<u64>) -> Domain {
        let size = max_size.unwrap_or(u64::MAX - ipos);
        let base = Block::new(ipos, size);
        Domain {
            parts: if base.is_empty() { Vec::new() } else { vec![base] },
        }
    }

    /// Restrict the window to the finished extents of a domain mapfile.
    ///
    /// An unfinished domain mapfile is refused unless `loose`.
    pub fn from_mapfile(
        ipos: u64,
        max_size: Option<u64>,
        path: &Path,
        loose: bool,
    ) -> Result<Domain> {
        let data = mapfile::load(path)?.ok_or_else(|| RescueError::MapfileMissing {
            path: path.to_path_buf(),
        })?;
        if !loose && data.current_status != MapStatus::Finished {
            return Err(RescueError::bad_argument(format!(
                "domain mapfile '{}' is incomplete; use --loose-domain to accept it",
                path.display()
            )));
        }
        let base = Domain::new(ipos, max_size);
        let window = match base.parts.first() {
            Some(b) => *b,
            None => return Ok(base),
        };
        let mut parts: Vec<Block> = Vec::new();
        for sb in &data.sblocks {
            if sb.status() != Status::Finished {
                continue;
            }
            let mut b = sb.block();
            b.crop(window);
            if b.is_empty() {
                continue;
            }
            if let Some(last) = parts.last_mut() {
                if last.join(b) {
                    continue;
                }
            }
            parts.push(b);
        }
        Ok(Domain { parts })
    }

    /// Start of the first part, or 0 for an empty domain.
    pub fn pos(&self) -> u64 {
        self.parts.first().map_or(0, |b| b.pos())
    }

    /// End of the last part, or 0 for an empty domain.
    pub fn end(&self) -> u64 {
        self.parts.last().map_or(0, |b| b.end())
    }

    /// Span from first to last part, holes included.
    pub fn size(&self) -> u64 {
        self.end() - self.pos()
    }

    /// Total bytes inside the domain.
    pub fn in_size(&self) -> u64 {
        self.parts.iter().map(|b| b.size()).sum()
    }

    /// Number of member blocks.
    pub fn blocks(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Whether the domain is the whole unrestricted address space.
    pub fn is_full(&self) -> bool {
        self.parts.len() == 1 && self.parts[0].pos() == 0 && self.parts[0].end() == u64::MAX
    }

    /// Whether some member fully contains `b`.
    pub fn includes(&self, b: Block) -> bool {
        self.parts.iter().any(|p| p.includes(b))
    }

    pub fn includes_addr(&self, addr: u64) -> bool {
        self.parts.iter().any(|p| p.includes_addr(addr))
    }

    /// Whether the whole domain lies strictly before `b`.
    ///
    /// The iteration helper: once true, no later sblock can intersect.
    pub fn entirely_before(&self, b: Block) -> bool {
        self.end() <= b.pos()
    }

    /// Smallest domain address at or after `pos`.
    pub fn next_inside(&self, pos: u64) -> Option<u64> {
        self.parts
            .iter()
            .find(|p| p.end() > pos)
            .map(|p| p.pos().max(pos))
    }

    /// Largest exclusive end at or before `end` still inside the domain.
    pub fn prev_inside(&self, end: u64) -> Option<u64> {
        self.parts
            .iter()
            .rev()
            .find(|p| p.pos() < end)
            .map(|p| p.end().min(end))
    }

    /// The member containing `addr`.
    pub fn part_containing(&self, addr: u64) -> Option<Block> {
        self.parts.iter().copied().find(|p| p.includes_addr(addr))
    }

    /// Crop `b` to the member containing its start; empty when the start
    /// is outside the domain.
    pub fn limit(&self, mut b: Block) -> Block {
        match self.part_containing(b.pos()) {
            Some(part) => {
                b.crop(part);
                b
            }
            None => Block::empty_at(b.pos()),
        }
    }

    /// Intersect every member with `bound` in place.
    pub fn crop_to(&mut self, bound: Block) {
        self.parts.retain_mut(|p| {
            p.crop(bound);
            !p.is_empty()
        });
    }
}
