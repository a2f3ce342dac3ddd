//! `frescuemap` manipulates rescue mapfiles: combine them, retype
//! them, list their blocks, test and summarize rescue status.

use std::io::Write;
use std::path::PathBuf;

use clap::Parser;

use frescue_cli::{command_line, exit_with, init_tracing, parse_size, parse_size_in};
use frescue_error::{RescueError, Result};
use frescue_map::ops::{self, LogicOp};
use frescue_map::Domain;
use frescue_types::Status;

#[derive(Debug, Parser)]
#[command(
    name = "frescuemap",
    version,
    about = "Tool for rescue mapfiles.\n\
             Manipulates mapfiles, shows their contents, combines them,\n\
             compares them, and tests rescue status.",
    after_help = "Exactly one operation must be selected.\n\
                  Numbers accept multiplier suffixes: s = sectors, k = 1000, Ki = 1024,\n\
                  M = 10^6, Mi = 2^20, and so on.\n\
                  Exit status: 0 normal, 1 environmental problems, 2 corrupt mapfile,\n\
                  3 internal consistency error."
)]
struct Cli {
    /// Change the block types of the mapfile (`old-types,new-types`).
    #[arg(short = 'a', long, value_name = "OT,NT")]
    change_types: Option<String>,

    /// Block size in bytes for block-number operations.
    #[arg(short = 'b', long, value_name = "BYTES", default_value = "512")]
    block_size: String,

    /// Create a mapfile from the list of block numbers on stdin.
    #[arg(
        short = 'c',
        long,
        value_name = "TT",
        num_args = 0..=1,
        default_missing_value = "+-"
    )]
    create_mapfile: Option<String>,

    /// Delete the mapfile if the rescue is finished.
    #[arg(short = 'd', long)]
    delete_if_done: bool,

    /// Return 0 if the rescue is finished.
    #[arg(short = 'D', long)]
    done_status: bool,

    /// Overwrite an existing mapfile (create mode).
    #[arg(short = 'f', long)]
    force: bool,

    /// Starting position of the domain.
    #[arg(short = 'i', long, value_name = "BYTES")]
    input_position: Option<String>,

    /// Print block numbers of the given types (?*/-+).
    #[arg(short = 'l', long, value_name = "TYPES")]
    list_blocks: Option<String>,

    /// Accept an incomplete domain mapfile.
    #[arg(short = 'L', long)]
    loose_domain: bool,

    /// Restrict the domain to the finished blocks in this mapfile.
    #[arg(short = 'm', long, value_name = "FILE")]
    domain_mapfile: Option<PathBuf>,

    /// Invert block types (finished and the rest swap).
    #[arg(short = 'n', long)]
    invert_mapfile: bool,

    /// Starting position in the output file.
    #[arg(short = 'o', long, value_name = "BYTES")]
    output_position: Option<String>,

    /// Compare block types in the domain of both mapfiles.
    #[arg(short = 'p', long, value_name = "FILE")]
    compare_mapfile: Option<PathBuf>,

    /// Suppress all messages.
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Maximum size of the domain to be processed.
    #[arg(short = 's', long, value_name = "BYTES")]
    size: Option<String>,

    /// Show a summary of the mapfile contents.
    #[arg(short = 't', long)]
    show_status: bool,

    /// Be verbose (repeat for more).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// XOR the finished blocks in FILE with the mapfile.
    #[arg(short = 'x', long, value_name = "FILE")]
    xor_mapfile: Option<PathBuf>,

    /// AND the finished blocks in FILE with the mapfile.
    #[arg(short = 'y', long, value_name = "FILE")]
    and_mapfile: Option<PathBuf>,

    /// OR the finished blocks in FILE with the mapfile.
    #[arg(short = 'z', long, value_name = "FILE")]
    or_mapfile: Option<PathBuf>,

    mapfile: PathBuf,
}

enum Operation {
    ChangeTypes(String),
    Create(String),
    DeleteIfDone,
    DoneStatus,
    ListBlocks(String),
    Invert,
    Compare(PathBuf),
    ShowStatus,
    Logic(LogicOp, PathBuf),
}

fn select_operation(cli: &Cli) -> Result<Operation> {
    let mut selected: Vec<Operation> = Vec::new();
    if let Some(arg) = &cli.change_types {
        selected.push(Operation::ChangeTypes(arg.clone()));
    }
    if let Some(arg) = &cli.create_mapfile {
        selected.push(Operation::Create(arg.clone()));
    }
    if cli.delete_if_done {
        selected.push(Operation::DeleteIfDone);
    }
    if cli.done_status {
        selected.push(Operation::DoneStatus);
    }
    if let Some(arg) = &cli.list_blocks {
        selected.push(Operation::ListBlocks(arg.clone()));
    }
    if cli.invert_mapfile {
        selected.push(Operation::Invert);
    }
    if let Some(path) = &cli.compare_mapfile {
        selected.push(Operation::Compare(path.clone()));
    }
    if cli.show_status {
        selected.push(Operation::ShowStatus);
    }
    if let Some(path) = &cli.xor_mapfile {
        selected.push(Operation::Logic(LogicOp::Xor, path.clone()));
    }
    if let Some(path) = &cli.and_mapfile {
        selected.push(Operation::Logic(LogicOp::And, path.clone()));
    }
    if let Some(path) = &cli.or_mapfile {
        selected.push(Operation::Logic(LogicOp::Or, path.clone()));
    }
    match selected.len() {
        0 => Err(RescueError::bad_argument(
            "you must specify the operation to be performed",
        )),
        1 => Ok(selected.pop().expect("length checked")),
        _ => Err(RescueError::bad_argument(
            "only one operation can be specified",
        )),
    }
}

/// Parse the create-mode `tt` argument: two distinct status characters,
/// listed blocks first, the rest second.
fn parse_create_types(arg: &str) -> Result<(Status, Status)> {
    let bad = || RescueError::bad_argument(format!("invalid types '{arg}' for create-mapfile"));
    let chars: Vec<char> = arg.chars().collect();
    if chars.len() != 2 || chars[0] == chars[1] {
        return Err(bad());
    }
    let listed = Status::try_from(chars[0]).map_err(|_| bad())?;
    let rest = Status::try_from(chars[1]).map_err(|_| bad())?;
    Ok((listed, rest))
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose);
    let result = run(&cli);
    exit_with(result)
}

fn run(cli: &Cli) -> Result<i32> {
    let hardbs = parse_size_in(&cli.block_size, 0, 1, u64::from(u32::MAX))?;
    let ipos = match &cli.input_position {
        Some(arg) => parse_size(arg, hardbs)?,
        None => 0,
    };
    let opos = match &cli.output_position {
        Some(arg) => parse_size(arg, hardbs)?,
        None => ipos,
    };
    let max_size = cli
        .size
        .as_deref()
        .map(|arg| parse_size(arg, hardbs))
        .transpose()?;
    let domain = match &cli.domain_mapfile {
        Some(path) => Domain::from_mapfile(ipos, max_size, path, cli.loose_domain)?,
        None => Domain::new(ipos, max_size),
    };
    let operation = select_operation(cli)?;

    let map = cli.mapfile.as_path();
    let mut stdout = std::io::stdout().lock();
    match operation {
        Operation::ChangeTypes(arg) => {
            let (from, to) = ops::parse_type_pair(&arg)?;
            ops::change_types(map, &domain, &from, &to, &mut stdout)
        }
        Operation::Invert => ops::invert(map, &domain, &mut stdout),
        Operation::Create(arg) => {
            let (listed, rest) = parse_create_types(&arg)?;
            let mut stdin = std::io::stdin().lock();
            ops::create(
                map,
                &domain,
                hardbs,
                listed,
                rest,
                cli.force,
                &mut stdin,
                &command_line(),
            )
        }
        Operation::DeleteIfDone => ops::done_status(map, &domain, true),
        Operation::DoneStatus => ops::done_status(map, &domain, false),
        Operation::ListBlocks(arg) => {
            let selector = ops::parse_selector(&arg)?;
            ops::list_blocks(
                map,
                &domain,
                hardbs,
                opos as i64 - ipos as i64,
                &selector,
                &mut stdout,
            )
        }
        Operation::Compare(second) => ops::compare(map, &second, &domain),
        Operation::ShowStatus => ops::show_status(map, &domain, &mut stdout),
        Operation::Logic(op, second) => ops::logic_op(op, map, &second, &domain, &mut stdout),
    }
    .and_then(|code| {
        stdout.flush().map_err(RescueError::Io)?;
        Ok(code)
    })
}
