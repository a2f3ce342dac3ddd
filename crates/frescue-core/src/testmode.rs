//! Artificial fault injection from a reference map.
//!
//! Test mode wraps a real input so that only the finished extents of a
//! reference mapfile read successfully; everything else fails as if the
//! medium were damaged there. This exercises the whole rescue pipeline
//! against a healthy device.

use frescue_error::Result;
use frescue_io::{Input, ReadChunk};
use frescue_map::Domain;

/// An input whose readable areas are dictated by a domain.
pub struct TestModeInput<I: Input> {
    inner: I,
    good: Domain,
}

impl<I: Input> TestModeInput<I> {
    /// `good` is typically built from the finished extents of a
    /// reference mapfile.
    pub fn new(inner: I, good: Domain) -> TestModeInput<I> {
        TestModeInput { inner, good }
    }
}

impl<I: Input> Input for TestModeInput<I> {
    fn read_at(&mut self, buf: &mut [u8], pos: u64) -> Result<ReadChunk> {
        let Some(part) = self.good.part_containing(pos) else {
            return Ok(ReadChunk {
                copied: 0,
                error: true,
            });
        };
        let limit = ((part.end() - pos).min(buf.len() as u64)) as usize;
        let chunk = self.inner.read_at(&mut buf[..limit], pos)?;
        if !chunk.error && chunk.copied == limit && limit < buf.len() {
            // The read ran into simulated damage at the part boundary.
            return Ok(ReadChunk {
                copied: limit,
                error: true,
            });
        }
        Ok(chunk)
    }

    fn size(&mut self) -> Result<Option<u64>> {
        self.inner.size()
    }

    fn reopen(&mut self) -> Result<()> {
        self.inner.reopen()
    }
}
