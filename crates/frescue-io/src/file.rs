//! Unix file backends for the positioned-I/O traits.
//!
//! Reads and writes go through `pread`/`pwrite` (via [`FileExt`]) in a
//! retry loop that absorbs `EINTR`, so a signal arriving mid-transfer is
//! observed at the next loop head instead of surfacing as a spurious I/O
//! error. A read that stops early with no OS error is end-of-medium; a
//! read that stops on an OS error reports the good prefix and flags the
//! remainder as failed.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use frescue_error::{RescueError, Result};

use crate::traits::{Input, Output, ReadChunk};

/// Rescue source backed by a file or block device.
#[derive(Debug)]
pub struct FileInput {
    file: File,
    path: PathBuf,
    direct: bool,
}

impl FileInput {
    /// Open `path` read-only, optionally with direct disc access.
    pub fn open(path: impl AsRef<Path>, direct: bool) -> Result<FileInput> {
        let path = path.as_ref().to_path_buf();
        let file = open_input(&path, direct)?;
        Ok(FileInput { file, path, direct })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_input(path: &Path, direct: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    if direct {
        options.custom_flags(libc::O_DIRECT);
    }
    options.open(path).map_err(|source| RescueError::CannotOpen {
        path: path.to_path_buf(),
        source,
    })
}

impl Input for FileInput {
    fn read_at(&mut self, buf: &mut [u8], pos: u64) -> Result<ReadChunk> {
        let mut copied = 0;
        while copied < buf.len() {
            match self.file.read_at(&mut buf[copied..], pos + copied as u64) {
                Ok(0) => {
                    return Ok(ReadChunk {
                        copied,
                        error: false,
                    });
                }
                Ok(n) => copied += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(pos, copied, error = %e, "read error");
                    return Ok(ReadChunk {
                        copied,
                        error: true,
                    });
                }
            }
        }
        Ok(ReadChunk::complete(copied))
    }

    fn size(&mut self) -> Result<Option<u64>> {
        match self.file.seek(SeekFrom::End(0)) {
            Ok(size) => Ok(Some(size)),
            Err(_) => Err(RescueError::NotSeekable {
                path: self.path.clone(),
            }),
        }
    }

    fn reopen(&mut self) -> Result<()> {
        self.file = open_input(&self.path, self.direct)?;
        tracing::debug!(path = %self.path.display(), "input reopened");
        Ok(())
    }
}

/// How to open a rescue destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputOpenMode {
    /// Truncate the file to zero length on open.
    pub truncate: bool,
    /// Open with `O_DIRECT`.
    pub direct: bool,
    /// Open with `O_DSYNC` so every write reaches the device.
    pub synchronous: bool,
    /// Skip writes of all-zero buffers, leaving holes.
    pub sparse: bool,
}

/// Rescue destination backed by a file or block device.
#[derive(Debug)]
pub struct FileOutput {
    file: File,
    path: PathBuf,
    sparse: bool,
    /// Highest end position of a skipped sparse write; the file must be
    /// grown to at least this size before closing.
    sparse_end: u64,
}

impl FileOutput {
    /// Open (creating if needed) `path` for writing.
    pub fn open(path: impl AsRef<Path>, mode: OutputOpenMode) -> Result<FileOutput> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(mode.truncate);
        let mut flags = 0;
        if mode.direct {
            flags |= libc::O_DIRECT;
        }
        if mode.synchronous {
            flags |= libc::O_DSYNC;
        }
        if flags != 0 {
            options.custom_flags(flags);
        }
        let file = options.open(&path).map_err(|source| RescueError::CannotOpen {
            path: path.clone(),
            source,
        })?;
        Ok(FileOutput {
            file,
            path,
            sparse: mode.sparse,
            sparse_end: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reserve space for `[offset, offset + len)` on the underlying disc.
    pub fn preallocate(&self, offset: u64, len: u64) -> Result<()> {
        use std::os::fd::AsRawFd;
        nix::fcntl::fallocate(
            self.file.as_raw_fd(),
            nix::fcntl::FallocateFlags::empty(),
            offset as libc::off_t,
            len as libc::off_t,
        )
        .map_err(|e| RescueError::Io(e.into()))?;
        Ok(())
    }
}

impl Output for FileOutput {
    fn write_at(&mut self, buf: &[u8], pos: u64) -> Result<()> {
        if self.sparse && buf.iter().all(|&b| b == 0) {
            self.sparse_end = self.sparse_end.max(pos + buf.len() as u64);
            return Ok(());
        }
        let mut written = 0;
        while written < buf.len() {
            match self.file.write_at(&buf[written..], pos + written as u64) {
                Ok(0) => {
                    return Err(RescueError::WriteFailed {
                        pos: pos + written as u64,
                        source: std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "device accepted no data",
                        ),
                    });
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(RescueError::WriteFailed {
                        pos: pos + written as u64,
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all().map_err(RescueError::Io)
    }

    fn extend_to(&mut self, size: u64) -> Result<()> {
        let target = size.max(self.sparse_end);
        let current = self.file.metadata().map_err(RescueError::Io)?.len();
        if current < target {
            self.file.set_len(target).map_err(RescueError::Io)?;
        }
        Ok(())
    }
}
