//! Pure mapfile operations: the algebra behind the map tool.
//!
//! Everything here works on mapfiles over a chosen domain without
//! touching device I/O. Combined or retyped maps are rendered to the
//! given writer (stdout in the tool); `create` writes the mapfile it
//! builds. Notices go through `tracing`, keeping the data output clean.

use std::io::{BufRead, Write};
use std::path::Path;

use frescue_error::{RescueError, Result};
use frescue_types::{Block, Status};

use crate::domain::Domain;
use crate::mapbook::Mapbook;

/// Binary map combinators.
///
/// The algebra acts on finished-ness: which regions of the result count
/// as rescued is the same in either operand order. Regions the operation
/// leaves untouched keep their status from the *first* map, so the full
/// status maps are order-dependent in the shades of not-yet-rescued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    /// Finished regions of the first map that are not finished in the
    /// second become bad-sector.
    And,
    /// Regions finished in the second map become finished.
    Or,
    /// Regions finished in exactly one map become finished; in both,
    /// bad-sector.
    Xor,
}

/// Parse a `from,to` status-pair argument for `change-types`.
///
/// When `to` is shorter than `from`, its last status is replicated.
pub fn parse_type_pair(arg: &str) -> Result<(Vec<Status>, Vec<Status>)> {
    let bad = || RescueError::bad_argument(format!("invalid types '{arg}' for change-types"));
    let (from, to) = arg.split_once(',').ok_or_else(bad)?;
    let parse = |s: &str| -> Result<Vec<Status>> {
        s.chars()
            .map(|ch| Status::try_from(ch).map_err(|_| bad()))
            .collect()
    };
    let from = parse(from)?;
    let mut to = parse(to)?;
    if from.is_empty() || to.is_empty() || to.len() > from.len() {
        return Err(bad());
    }
    while to.len() < from.len() {
        to.push(*to.last().expect("checked non-empty"));
    }
    Ok((from, to))
}

/// Parse a status selector like `"?-*"`.
pub fn parse_selector(arg: &str) -> Result<Vec<Status>> {
    if arg.is_empty() {
        return Err(RescueError::bad_argument("empty status selector"));
    }
    arg.chars()
        .map(|ch| {
            Status::try_from(ch)
                .map_err(|e| RescueError::bad_argument(format!("{e} in selector '{arg}'")))
        })
        .collect()
}

fn open_checked(path: &Path, domain: Domain) -> Result<Option<Mapbook>> {
    let book = Mapbook::open(path, domain, 0)?;
    if book.domain().is_empty() {
        tracing::info!(mapfile = %path.display(), "empty domain");
        return Ok(None);
    }
    Ok(Some(book))
}

/// AND/OR/XOR two mapfiles; the combined map is rendered to `out`.
pub fn logic_op(
    op: LogicOp,
    first: &Path,
    second: &Path,
    domain: &Domain,
    out: &mut dyn Write,
) -> Result<i32> {
    let Some(mut book) = open_checked(first, domain.clone())? else {
        return Ok(0);
    };
    let Some(book2) = open_checked(second, domain.clone())? else {
        return Ok(0);
    };
    if op == LogicOp::Xor && book.domain() != book2.domain() {
        return Err(RescueError::bad_argument(
            "xor requires mapfiles with matching domains",
        ));
    }

    let mut i = 0;
    while i < book.sblocks().len() {
        let sb = book.sblock(i);
        if !book.domain().includes(sb.block()) {
            if book.domain().entirely_before(sb.block()) {
                break;
            }
            i += 1;
            continue;
        }
        let retype = match op {
            LogicOp::And => {
                if sb.status() != Status::Finished {
                    i += 1;
                    continue;
                }
                None // overlap with B-finished keeps its status
            }
            LogicOp::Or => {
                if sb.status() == Status::Finished {
                    i += 1;
                    continue;
                }
                Some(Status::Finished)
            }
            LogicOp::Xor => Some(if sb.status() == Status::Finished {
                Status::BadSector
            } else {
                Status::Finished
            }),
        };

        let mut c = book2.find_chunk(sb.block(), Status::Finished);
        let present = !c.is_empty() && c.pos() < sb.end();
        if !present {
            if op == LogicOp::And {
                book.change_sblock_status(i, Status::BadSector);
            }
            i += 1;
            continue;
        }
        c.crop(sb.block());
        if c.pos() > sb.pos() {
            // The front part sees no B-finished data.
            book.split_sblock_by(c.pos(), i);
            if op == LogicOp::And {
                book.change_sblock_status(i, Status::BadSector);
            }
            i += 1; // the back part is re-examined next
            continue;
        }
        if c.end() < sb.end() {
            book.split_sblock_by(c.end(), i);
        }
        if let Some(st) = retype {
            book.change_sblock_status(i, st);
        }
        i += 1;
    }

    write_map(&mut book, out)
}

/// Parallel status substitution over the domain.
pub fn change_types(
    path: &Path,
    domain: &Domain,
    from: &[Status],
    to: &[Status],
    out: &mut dyn Write,
) -> Result<i32> {
    let Some(mut book) = open_checked(path, domain.clone())? else {
        return Ok(0);
    };
    for i in 0..book.sblocks().len() {
        let sb = book.sblock(i);
        if !book.domain().includes(sb.block()) {
            if book.domain().entirely_before(sb.block()) {
                break;
            }
            continue;
        }
        if let Some(j) = from.iter().position(|&st| st == sb.status()) {
            book.change_sblock_status(i, to[j]);
        }
    }
    write_map(&mut book, out)
}

/// Finished stays finished, everything else becomes bad-sector, and
/// vice versa: the shorthand for `change-types ?*/-+ ++++-`.
pub fn invert(path: &Path, domain: &Domain, out: &mut dyn Write) -> Result<i32> {
    use Status::*;
    change_types(
        path,
        domain,
        &[NonTried, NonTrimmed, NonScraped, BadSector, Finished],
        &[Finished, Finished, Finished, Finished, BadSector],
        out,
    )
}

/// Exit 0 iff the two mapfiles agree over the domain.
pub fn compare(first: &Path, second: &Path, domain: &Domain) -> Result<i32> {
    let Some(book) = open_checked(first, domain.clone())? else {
        return Ok(0);
    };
    let Some(book2) = open_checked(second, domain.clone())? else {
        return Ok(0);
    };
    let mut differ = book.domain() != book2.domain();
    if !differ {
        for &sb in book.sblocks() {
            if !book.domain().includes(sb.block()) {
                if book.domain().entirely_before(sb.block()) {
                    break;
                }
                continue;
            }
            match book2.find_index(sb.pos()) {
                Some(j) if book2.sblock(j) == sb => {}
                _ => {
                    differ = true;
                    break;
                }
            }
        }
    }
    if differ {
        tracing::warn!(
            first = %first.display(),
            second = %second.display(),
            "mapfiles differ"
        );
        return Ok(1);
    }
    Ok(0)
}

/// Build a mapfile from a list of decimal block numbers on `input`.
///
/// Listed blocks (at `hardbs` granularity) get `listed`; everything else
/// in the domain gets `rest`.
pub fn create(
    path: &Path,
    domain: &Domain,
    hardbs: u64,
    listed: Status,
    rest: Status,
    force: bool,
    input: &mut dyn BufRead,
    command_line: &str,
) -> Result<i32> {
    if path.exists() && !force {
        return Err(RescueError::bad_argument(format!(
            "mapfile '{}' exists; use --force to overwrite it",
            path.display()
        )));
    }
    if domain.is_empty() {
        tracing::info!("empty domain");
        return Ok(0);
    }
    let mut book = Mapbook::new_blank(domain.end(), domain.clone(), path, command_line);
    for i in 0..book.sblocks().len() {
        book.change_sblock_status(i, rest);
    }
    let mut line = String::new();
    for lineno in 1.. {
        line.clear();
        if input.read_line(&mut line).map_err(RescueError::Io)? == 0 {
            break;
        }
        let tok = line.trim();
        if tok.is_empty() {
            continue;
        }
        let block: u64 = tok.parse().map_err(|_| {
            RescueError::corrupt(
                "standard input",
                lineno,
                format!("bad block number '{tok}'"),
            )
        })?;
        let pos = block.checked_mul(hardbs).ok_or_else(|| {
            RescueError::corrupt("standard input", lineno, "block number out of range")
        })?;
        let b = Block::new(pos, hardbs);
        if domain.includes(b) {
            book.change_chunk_status(b, listed)?;
        }
    }
    book.truncate_vector(domain.end(), true);
    book.write_mapfile()?;
    Ok(0)
}

/// Print decimal block numbers (at `hardbs` granularity) of all sblocks
/// whose status is in `selector`, unique and monotonic.
pub fn list_blocks(
    path: &Path,
    domain: &Domain,
    hardbs: u64,
    offset: i64,
    selector: &[Status],
    out: &mut dyn Write,
) -> Result<i32> {
    let Some(book) = open_checked(path, domain.clone())? else {
        return Ok(0);
    };
    let hardbs = hardbs as i64;
    let mut last_block: Option<i64> = None;
    for &sb in book.sblocks() {
        if !book.domain().includes(sb.block()) {
            if book.domain().entirely_before(sb.block()) {
                break;
            }
            continue;
        }
        if !selector.contains(&sb.status()) {
            continue;
        }
        let mut block = (sb.pos() as i64 + offset).div_euclid(hardbs);
        while block * hardbs < sb.end() as i64 + offset {
            match last_block {
                Some(last) if block <= last => {}
                _ => {
                    writeln!(out, "{block}").map_err(RescueError::Io)?;
                    last_block = Some(block);
                }
            }
            block += 1;
        }
    }
    Ok(0)
}

/// Print a per-status summary of the mapfile over the domain.
pub fn show_status(path: &Path, domain: &Domain, out: &mut dyn Write) -> Result<i32> {
    let Some(book) = open_checked(path, domain.clone())? else {
        return Ok(0);
    };
    let counts = book.counts_in_domain();
    let domain_size = book.domain().in_size();
    let line = |out: &mut dyn Write, label: &str, st: Status| -> Result<()> {
        writeln!(
            out,
            "{label}: {:10} B,  in {:4} area(s)  ({})",
            counts.size_of(st),
            counts.areas_of(st),
            percentage(counts.size_of(st), domain_size)
        )
        .map_err(RescueError::Io)
    };
    writeln!(
        out,
        "current pos: {:10} B,  current status: {}",
        book.current_pos(),
        book.current_status()
    )
    .map_err(RescueError::Io)?;
    writeln!(
        out,
        "domain size: {:10} B,  in {:4} area(s)",
        domain_size,
        book.domain().blocks()
    )
    .map_err(RescueError::Io)?;
    line(out, "    rescued", Status::Finished)?;
    line(out, "  non-tried", Status::NonTried)?;
    writeln!(
        out,
        "    errsize: {:10} B,  errors: {:7}  ({})",
        counts.errsize,
        counts.errors,
        percentage(counts.errsize, domain_size)
    )
    .map_err(RescueError::Io)?;
    line(out, "non-trimmed", Status::NonTrimmed)?;
    line(out, "non-scraped", Status::NonScraped)?;
    line(out, " bad-sector", Status::BadSector)?;
    Ok(0)
}

/// Exit 0 iff every sblock in the domain is finished; with `delete`,
/// also remove the mapfile on success.
pub fn done_status(path: &Path, domain: &Domain, delete: bool) -> Result<i32> {
    let Some(book) = open_checked(path, domain.clone())? else {
        return Ok(0);
    };
    for &sb in book.sblocks() {
        if !book.domain().includes(sb.block()) {
            if book.domain().entirely_before(sb.block()) {
                break;
            }
            continue;
        }
        if sb.status() != Status::Finished {
            tracing::info!(mapfile = %path.display(), "rescue is not finished");
            return Ok(1);
        }
    }
    if delete {
        std::fs::remove_file(path).map_err(RescueError::Io)?;
        tracing::info!(mapfile = %path.display(), "mapfile deleted");
    }
    Ok(0)
}

fn percentage(num: u64, den: u64) -> String {
    if den == 0 {
        return "--".to_owned();
    }
    format!("{:.2}%", num as f64 * 100.0 / den as f64)
}

fn write_map(book: &mut Mapbook, out: &mut dyn Write) -> Result<i32> {
    out.write_all(book.render_map().as_bytes())
        .map_err(RescueError::Io)?;
    Ok(0)
}
