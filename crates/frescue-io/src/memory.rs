//! In-memory backends with fault injection.
//!
//! `MemInput` simulates a failing device: reads inside an injected bad
//! range stop at the range boundary and report a device error, exactly
//! like a medium with unreadable sectors. Ranges can be healed to model
//! sectors that recover on retry. The backends are first-class (not
//! test-only) so downstream crates can drive full rescues without real
//! devices.

use frescue_error::Result;
use frescue_types::Block;

use crate::traits::{Input, Output, ReadChunk};

/// A rescue source over a byte vector with injectable bad ranges.
#[derive(Debug, Clone)]
pub struct MemInput {
    data: Vec<u8>,
    bad: Vec<Block>,
    reopen_count: u32,
}

impl MemInput {
    pub fn new(data: Vec<u8>) -> MemInput {
        MemInput {
            data,
            bad: Vec::new(),
            reopen_count: 0,
        }
    }

    /// Mark `[pos, pos + size)` as unreadable.
    pub fn inject_bad(&mut self, pos: u64, size: u64) {
        self.bad.push(Block::new(pos, size));
        self.bad.sort();
    }

    /// Make previously bad addresses inside `block` readable again.
    pub fn heal(&mut self, block: Block) {
        let mut healed = Vec::new();
        for mut b in self.bad.drain(..) {
            if !b.overlaps(block) {
                healed.push(b);
                continue;
            }
            if b.pos() < block.pos() {
                healed.push(Block::new(b.pos(), block.pos() - b.pos()));
            }
            if b.end() > block.end() {
                b.crop(Block::new(block.end(), u64::MAX - block.end()));
                healed.push(b);
            }
        }
        self.bad = healed;
        self.bad.sort();
    }

    /// Number of times [`Input::reopen`] was called.
    pub fn reopen_count(&self) -> u32 {
        self.reopen_count
    }

    fn first_bad_in(&self, window: Block) -> Option<Block> {
        self.bad.iter().copied().find(|b| b.overlaps(window))
    }
}

impl Input for MemInput {
    fn read_at(&mut self, buf: &mut [u8], pos: u64) -> Result<ReadChunk> {
        let len = self.data.len() as u64;
        if pos >= len {
            return Ok(ReadChunk {
                copied: 0,
                error: false,
            });
        }
        let end = len.min(pos + buf.len() as u64);
        let window = Block::new(pos, end - pos);
        let (good_end, error) = match self.first_bad_in(window) {
            Some(bad) => (bad.pos().max(pos).min(end), true),
            None => (end, false),
        };
        let copied = (good_end - pos) as usize;
        buf[..copied].copy_from_slice(&self.data[pos as usize..good_end as usize]);
        if error {
            return Ok(ReadChunk { copied, error: true });
        }
        Ok(ReadChunk {
            copied,
            // A short read at the end of the vector is EOF, not an error.
            error: false,
        })
    }

    fn size(&mut self) -> Result<Option<u64>> {
        Ok(Some(self.data.len() as u64))
    }

    fn reopen(&mut self) -> Result<()> {
        self.reopen_count += 1;
        Ok(())
    }
}

/// A rescue destination over a growable byte vector.
#[derive(Debug, Clone, Default)]
pub struct MemOutput {
    data: Vec<u8>,
    sync_count: u32,
}

impl MemOutput {
    pub fn new() -> MemOutput {
        MemOutput::default()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn sync_count(&self) -> u32 {
        self.sync_count
    }

    fn ensure_len(&mut self, len: u64) {
        if (self.data.len() as u64) < len {
            self.data.resize(len as usize, 0);
        }
    }
}

impl Output for MemOutput {
    fn write_at(&mut self, buf: &[u8], pos: u64) -> Result<()> {
        self.ensure_len(pos + buf.len() as u64);
        self.data[pos as usize..pos as usize + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.sync_count += 1;
        Ok(())
    }

    fn extend_to(&mut self, size: u64) -> Result<()> {
        self.ensure_len(size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_read() {
        let mut input = MemInput::new((0..=255).collect());
        let mut buf = [0u8; 16];
        let chunk = input.read_at(&mut buf, 10).unwrap();
        assert_eq!(chunk, ReadChunk::complete(16));
        assert_eq!(buf[0], 10);
        assert_eq!(input.size().unwrap(), Some(256));
    }

    #[test]
    fn read_stops_at_bad_range() {
        let mut input = MemInput::new(vec![0xAA; 8192]);
        input.inject_bad(4096, 512);

        let mut buf = [0u8; 1024];
        // Window entirely before the bad range.
        assert_eq!(input.read_at(&mut buf, 0).unwrap(), ReadChunk::complete(1024));
        // Window straddling the bad range start.
        let chunk = input.read_at(&mut buf, 3584).unwrap();
        assert_eq!(chunk.copied, 512);
        assert!(chunk.error);
        // Window starting inside the bad range.
        let chunk = input.read_at(&mut buf, 4096).unwrap();
        assert_eq!(chunk.copied, 0);
        assert!(chunk.error);
        // Window past the bad range.
        assert_eq!(
            input.read_at(&mut buf, 4608).unwrap(),
            ReadChunk::complete(1024)
        );
    }

    #[test]
    fn heal_restores_reads() {
        let mut input = MemInput::new(vec![1; 4096]);
        input.inject_bad(1024, 2048);
        let mut buf = [0u8; 512];
        assert!(input.read_at(&mut buf, 1024).unwrap().error);

        input.heal(Block::new(1024, 512));
        assert_eq!(input.read_at(&mut buf, 1024).unwrap(), ReadChunk::complete(512));
        // The rest of the range is still bad.
        assert!(input.read_at(&mut buf, 1536).unwrap().error);
    }

    #[test]
    fn eof_is_short_and_clean() {
        let mut input = MemInput::new(vec![5; 100]);
        let mut buf = [0u8; 64];
        let chunk = input.read_at(&mut buf, 90).unwrap();
        assert_eq!(chunk.copied, 10);
        assert!(!chunk.error);
        let chunk = input.read_at(&mut buf, 200).unwrap();
        assert_eq!(chunk.copied, 0);
        assert!(!chunk.error);
    }

    #[test]
    fn output_grows_and_records() {
        let mut out = MemOutput::new();
        out.write_at(b"xyz", 5).unwrap();
        assert_eq!(out.data(), &[0, 0, 0, 0, 0, b'x', b'y', b'z']);
        out.extend_to(12).unwrap();
        assert_eq!(out.data().len(), 12);
        out.sync().unwrap();
        assert_eq!(out.sync_count(), 1);
    }
}
