//! Mapfile text format: load and crash-consistent save.
//!
//! The format is UTF-8 text. `#` starts a comment line. The first
//! non-comment line holds `current_pos current_status [current_pass]`;
//! every following non-comment line holds `pos size status` with
//! hexadecimal integers. The block list must be a contiguous partition
//! with positive sizes; anything else is a corrupt mapfile (exit 2).
//!
//! Saves write `<name>.new` and rename it over the target, so a crash
//! mid-save leaves the previous mapfile intact.

use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::Path;

use frescue_error::{RescueError, Result};
use frescue_types::{Block, MapStatus, Pass, Sblock, Status};

/// The persisted state of a mapbook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapData {
    pub current_pos: u64,
    pub current_status: MapStatus,
    pub current_pass: Pass,
    pub sblocks: Vec<Sblock>,
}

/// Header context for a save.
#[derive(Debug, Clone, Default)]
pub struct SaveMeta {
    /// The invoking command line, recorded as a comment.
    pub command_line: String,
    /// Extra header note (e.g. the fill-mode completion convention).
    pub note: Option<String>,
}

/// Load a mapfile. A missing file is not an error: it means start fresh.
pub fn load(path: &Path) -> Result<Option<MapData>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(RescueError::CannotOpen {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };
    parse(path, &text).map(Some)
}

fn parse(path: &Path, text: &str) -> Result<MapData> {
    let corrupt =
        |line: usize, detail: &str| RescueError::corrupt(path, line, detail.to_owned());

    let mut header: Option<(u64, MapStatus, Pass)> = None;
    let mut sblocks: Vec<Sblock> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if header.is_none() {
            if fields.len() < 2 || fields.len() > 3 {
                return Err(corrupt(lineno, "malformed status line"));
            }
            let pos = parse_int(fields[0]).ok_or_else(|| corrupt(lineno, "bad position"))?;
            let status = single_char(fields[1])
                .and_then(|ch| MapStatus::try_from(ch).ok())
                .ok_or_else(|| corrupt(lineno, "unknown mapfile status"))?;
            let pass = match fields.get(2) {
                None => Pass::FIRST,
                Some(tok) => tok
                    .parse::<u8>()
                    .ok()
                    .and_then(Pass::new)
                    .ok_or_else(|| corrupt(lineno, "bad pass number"))?,
            };
            header = Some((pos, status, pass));
            continue;
        }
        if fields.len() != 3 {
            return Err(corrupt(lineno, "malformed block line"));
        }
        let pos = parse_int(fields[0]).ok_or_else(|| corrupt(lineno, "bad position"))?;
        let size = parse_int(fields[1]).ok_or_else(|| corrupt(lineno, "bad size"))?;
        let status = single_char(fields[2])
            .and_then(|ch| Status::try_from(ch).ok())
            .ok_or_else(|| corrupt(lineno, "unknown block status"))?;
        if size == 0 {
            return Err(corrupt(lineno, "block size is zero"));
        }
        if let Some(last) = sblocks.last() {
            if pos != last.end() {
                return Err(corrupt(lineno, "blocks are not contiguous"));
            }
        }
        let block = Block::new(pos, size);
        if block.size() != size {
            return Err(corrupt(lineno, "block end overflows the address space"));
        }
        sblocks.push(Sblock::new(block, status));
    }

    let Some((current_pos, current_status, current_pass)) = header else {
        return Err(corrupt(text.lines().count() + 1, "missing status line"));
    };
    // A list starting past zero still partitions [0, end): cover the gap.
    if let Some(first) = sblocks.first() {
        if first.pos() > 0 {
            sblocks.insert(0, Sblock::new(Block::new(0, first.pos()), Status::NonTried));
        }
    }
    Ok(MapData {
        current_pos,
        current_status,
        current_pass,
        sblocks,
    })
}

/// Parse mapfile text that is not backed by a file (combined-map output,
/// tests).
pub fn load_from_str(text: &str) -> Result<MapData> {
    parse(Path::new("<memory>"), text)
}

fn parse_int(tok: &str) -> Option<u64> {
    if let Some(hex) = tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if tok.len() > 1 && tok.starts_with('0') {
        u64::from_str_radix(&tok[1..], 8).ok()
    } else {
        tok.parse().ok()
    }
}

fn single_char(tok: &str) -> Option<char> {
    let mut chars = tok.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => Some(ch),
        _ => None,
    }
}

/// Render the mapfile text for `data`.
pub fn render(data: &MapData, meta: &SaveMeta) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# Rescue mapfile. Created by FrankenRescue version {}",
        env!("CARGO_PKG_VERSION")
    );
    if !meta.command_line.is_empty() {
        let _ = writeln!(out, "# Command line: {}", meta.command_line);
    }
    if let Some(note) = &meta.note {
        let _ = writeln!(out, "# {note}");
    }
    let _ = writeln!(out, "# current_pos  current_status  current_pass");
    let _ = writeln!(
        out,
        "0x{:08X}     {}               {}",
        data.current_pos,
        data.current_status.as_char(),
        data.current_pass
    );
    let _ = writeln!(out, "#      pos        size  status");
    for sb in &data.sblocks {
        let _ = writeln!(
            out,
            "0x{:08X}  0x{:08X}  {}",
            sb.pos(),
            sb.size(),
            sb.status().as_char()
        );
    }
    out
}

/// Save `data` to `path` atomically.
///
/// The text is written to `<path>.new`, synced, then renamed over the
/// target, so the previous mapfile survives any mid-save failure.
pub fn save(path: &Path, data: &MapData, meta: &SaveMeta) -> Result<()> {
    let text = render(data, meta);
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".new");
    let tmp = Path::new(&tmp);

    let mut file = fs::File::create(tmp).map_err(|source| RescueError::CannotOpen {
        path: tmp.to_path_buf(),
        source,
    })?;
    file.write_all(text.as_bytes()).map_err(RescueError::Io)?;
    file.sync_all().map_err(RescueError::Io)?;
    drop(file);
    fs::rename(tmp, path).map_err(RescueError::Io)?;
    if let Some(dir) = path.parent() {
        // Durability of the rename itself; best effort on filesystems
        // that refuse to open a directory.
        if let Ok(d) = fs::File::open(dir) {
            let _ = d.sync_all();
        }
    }
    Ok(())
}
