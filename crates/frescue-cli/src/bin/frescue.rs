//! `frescue` copies data from a failing source to a destination,
//! rescuing the good parts first and recording progress in a mapfile.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use clap::Parser;

use frescue_cli::{
    command_line, ensure_distinct_files, ensure_regular_mapfile, exit_with, init_tracing,
    parse_cpass, parse_interval, parse_max_errors, parse_size, parse_size_in, parse_skip_sizes,
};
use frescue_core::{
    parse_filltypes, FillOptions, Fillbook, Genbook, GenerateOptions, MinReadRate, RescueOptions,
    Rescuebook, TestModeInput,
};
use frescue_error::{RescueError, Result};
use frescue_io::{
    FileInput, FileOutput, Input, InterruptFlag, Loggers, MonotonicClock, Output, OutputOpenMode,
    RatesLog, ReadsLog,
};
use frescue_map::{Domain, Mapbook};

const DEFAULT_CLUSTER_BYTES: u64 = 65_536;

#[derive(Debug, Parser)]
#[command(
    name = "frescue",
    version,
    about = "Data recovery tool.\n\
             Copies data from one file or block device to another, trying to\n\
             rescue the good parts first in case of read errors.",
    after_help = "Always use a mapfile unless you know you won't need it; without one the\n\
                  rescue cannot be resumed, only restarted.\n\
                  Numbers accept multiplier suffixes: s = sectors, k = 1000, Ki = 1024,\n\
                  M = 10^6, Mi = 2^20, and so on. Time intervals look like 1.5s, 10m, 1/2h.\n\
                  Exit status: 0 normal, 1 environmental problems, 2 corrupt mapfile,\n\
                  3 internal consistency error, 128+signum on signal."
)]
struct Cli {
    /// Minimum read rate of good areas in bytes/s (0 = auto).
    #[arg(short = 'a', long, value_name = "BYTES")]
    min_read_rate: Option<String>,

    /// Mark non-trimmed and non-scraped blocks as non-tried.
    #[arg(short = 'A', long)]
    try_again: bool,

    /// Sector size of the input device.
    #[arg(short = 'b', long, value_name = "BYTES", default_value = "512")]
    sector_size: String,

    /// Sectors to copy at a time.
    #[arg(short = 'c', long, value_name = "SECTORS")]
    cluster_size: Option<String>,

    /// Do not read new data beyond the mapfile limits.
    #[arg(short = 'C', long)]
    complete_only: bool,

    /// Use direct disc access for the input file.
    #[arg(short = 'd', long)]
    idirect: bool,

    /// Use direct disc access for the output file.
    #[arg(short = 'D', long)]
    odirect: bool,

    /// Maximum number of [+ new] error areas allowed.
    #[arg(short = 'e', long, value_name = "[+]N")]
    max_errors: Option<String>,

    /// Maximum allowed rate of read errors per second.
    #[arg(short = 'E', long, value_name = "BYTES")]
    max_error_rate: Option<String>,

    /// Overwrite an existing output device or partition.
    #[arg(short = 'f', long)]
    force: bool,

    /// Fill blocks of the given types with data read from infile (?*/-+l).
    #[arg(short = 'F', long, value_name = "TYPES")]
    fill_mode: Option<String>,

    /// Generate an approximate mapfile from a partial copy.
    #[arg(short = 'G', long)]
    generate_mode: bool,

    /// Simulate read errors outside the finished blocks of this mapfile.
    #[arg(short = 'H', long, value_name = "FILE")]
    test_mode: Option<PathBuf>,

    /// Starting position of the rescue domain in the input.
    #[arg(short = 'i', long, value_name = "BYTES")]
    input_position: Option<String>,

    /// Verify that the input size matches the size in the mapfile.
    #[arg(short = 'I', long)]
    verify_input_size: bool,

    /// Re-read the latest good sector after every read error.
    #[arg(short = 'J', long)]
    verify_on_error: bool,

    /// Initial size to skip on read error, and optional maximum.
    #[arg(short = 'K', long, value_name = "SIZE[,MAX]")]
    skip_size: Option<String>,

    /// Accept an incomplete domain mapfile.
    #[arg(short = 'L', long)]
    loose_domain: bool,

    /// Restrict the domain to the finished blocks in this mapfile.
    #[arg(short = 'm', long, value_name = "FILE")]
    domain_mapfile: Option<PathBuf>,

    /// Mark all failed blocks as non-trimmed.
    #[arg(short = 'M', long)]
    retrim: bool,

    /// Skip the scraping phase.
    #[arg(short = 'n', long)]
    no_scrape: bool,

    /// Skip the trimming phase.
    #[arg(short = 'N', long)]
    no_trim: bool,

    /// Starting position in the output file.
    #[arg(short = 'o', long, value_name = "BYTES")]
    output_position: Option<String>,

    /// Reopen the input file after every read error.
    #[arg(short = 'O', long)]
    reopen_on_error: bool,

    /// Preallocate space on disc for the output file.
    #[arg(short = 'p', long)]
    preallocate: bool,

    /// Keep the latest read data for preview (1..=32 lines).
    #[arg(
        short = 'P',
        long,
        value_name = "LINES",
        num_args = 0..=1,
        default_missing_value = "3"
    )]
    data_preview: Option<u8>,

    /// Suppress all messages.
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Exit after this many retry passes (-1 = infinity).
    #[arg(short = 'r', long, value_name = "N", default_value_t = 0, allow_hyphen_values = true)]
    retry_passes: i32,

    /// Reverse the direction of all passes.
    #[arg(short = 'R', long)]
    reverse: bool,

    /// Maximum size of the input data to be copied.
    #[arg(short = 's', long, value_name = "BYTES")]
    size: Option<String>,

    /// Use sparse writes for the output file.
    #[arg(short = 'S', long)]
    sparse: bool,

    /// Truncate the output file to zero size before copying.
    #[arg(short = 't', long)]
    truncate: bool,

    /// Maximum time since the last successful read.
    #[arg(short = 'T', long, value_name = "INTERVAL")]
    timeout: Option<String>,

    /// Run all passes in the same direction.
    #[arg(short = 'u', long)]
    unidirectional: bool,

    /// Be verbose (repeat for more).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Make fill mode ignore write errors.
    #[arg(short = 'w', long)]
    ignore_write_errors: bool,

    /// Extend the output file to be at least this long.
    #[arg(short = 'x', long, value_name = "BYTES")]
    extend_outfile: Option<String>,

    /// Exit after the first read error.
    #[arg(short = 'X', long)]
    exit_on_error: bool,

    /// Use synchronous writes for the output file.
    #[arg(short = 'y', long)]
    synchronous: bool,

    /// Maximum read rate in bytes/s.
    #[arg(short = 'Z', long, value_name = "BYTES")]
    max_read_rate: Option<String>,

    /// Ask for confirmation before starting the copy.
    #[arg(long)]
    ask: bool,

    /// Select which copying passes to run.
    #[arg(long, value_name = "N[,N]")]
    cpass: Option<String>,

    /// Time to wait between passes.
    #[arg(long, value_name = "INTERVAL")]
    pause: Option<String>,

    /// Log rates and error sizes to this file.
    #[arg(long, value_name = "FILE")]
    log_rates: Option<PathBuf>,

    /// Log all read operations to this file.
    #[arg(long, value_name = "FILE")]
    log_reads: Option<PathBuf>,

    infile: PathBuf,
    outfile: PathBuf,
    mapfile: Option<PathBuf>,
}

/// Geometry and domain settings shared by all three modes.
struct Resolved {
    hardbs: u64,
    cluster: u64,
    ipos: u64,
    opos: u64,
    max_size: Option<u64>,
    offset: i64,
}

fn resolve(cli: &Cli) -> Result<Resolved> {
    let hardbs = parse_size_in(&cli.sector_size, 0, 1, frescue_core::rescue::MAX_SKIPBS)?;
    let cluster = match &cli.cluster_size {
        Some(arg) => parse_size_in(arg, 0, 1, u64::from(u32::MAX))?,
        None => (DEFAULT_CLUSTER_BYTES / hardbs).max(1),
    };
    let ipos = match &cli.input_position {
        Some(arg) => parse_size(arg, hardbs)?,
        None => 0,
    };
    let opos = match &cli.output_position {
        Some(arg) => parse_size(arg, hardbs)?,
        None => ipos,
    };
    let max_size = cli.size.as_deref().map(|arg| parse_size(arg, hardbs)).transpose()?;
    Ok(Resolved {
        hardbs,
        cluster,
        ipos,
        opos,
        max_size,
        offset: opos as i64 - ipos as i64,
    })
}

fn build_domain(cli: &Cli, geo: &Resolved) -> Result<Domain> {
    match &cli.domain_mapfile {
        Some(path) => Domain::from_mapfile(geo.ipos, geo.max_size, path, cli.loose_domain),
        None => Ok(Domain::new(geo.ipos, geo.max_size)),
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose);
    let result = run(&cli);
    exit_with(result)
}

fn run(cli: &Cli) -> Result<i32> {
    let geo = resolve(cli)?;
    let mut checked: Vec<(&str, &Path)> = vec![
        ("infile", cli.infile.as_path()),
        ("outfile", cli.outfile.as_path()),
    ];
    if let Some(map) = &cli.mapfile {
        checked.push(("mapfile", map.as_path()));
        ensure_regular_mapfile(map)?;
    }
    ensure_distinct_files(&checked)?;
    if cli.fill_mode.is_some() && cli.generate_mode {
        return Err(RescueError::bad_argument(
            "fill mode and generate mode are mutually exclusive",
        ));
    }
    if cli.ask && (cli.fill_mode.is_some() || cli.generate_mode) {
        return Err(RescueError::bad_argument(
            "--ask is only meaningful in rescue mode",
        ));
    }
    if cli.ignore_write_errors && cli.fill_mode.is_none() {
        return Err(RescueError::bad_argument(
            "--ignore-write-errors is only meaningful in fill mode",
        ));
    }

    let interrupt = InterruptFlag::new();
    interrupt.install()?;

    let domain = build_domain(cli, &geo)?;
    if let Some(types) = &cli.fill_mode {
        do_fill(cli, &geo, domain, types, interrupt)
    } else if cli.generate_mode {
        do_generate(cli, &geo, domain, interrupt)
    } else {
        do_rescue(cli, &geo, domain, interrupt)
    }
}

// ---------------------------------------------------------------------
// Rescue mode
// ---------------------------------------------------------------------

fn rescue_options(cli: &Cli, geo: &Resolved) -> Result<RescueOptions> {
    let mut opts = RescueOptions {
        hardbs: geo.hardbs,
        cluster: geo.cluster,
        max_retries: cli.retry_passes,
        unidirectional: cli.unidirectional,
        reverse: cli.reverse,
        notrim: cli.no_trim,
        noscrape: cli.no_scrape,
        retrim: cli.retrim,
        try_again: cli.try_again,
        exit_on_error: cli.exit_on_error,
        verify_on_error: cli.verify_on_error,
        reopen_on_error: cli.reopen_on_error,
        preview_lines: cli.data_preview,
        ..Default::default()
    };
    if let Some(arg) = &cli.skip_size {
        let (skipbs, max_skipbs) = parse_skip_sizes(arg, geo.hardbs)?;
        if let Some(s) = skipbs {
            opts.skipbs = s;
        }
        if let Some(m) = max_skipbs {
            opts.max_skipbs = m;
        }
    }
    if let Some(arg) = &cli.cpass {
        opts.cpass = parse_cpass(arg)?;
    }
    if let Some(arg) = &cli.min_read_rate {
        let rate = parse_size(arg, geo.hardbs)?;
        opts.min_read_rate = if rate == 0 {
            MinReadRate::Auto
        } else {
            MinReadRate::Limit(rate)
        };
    }
    if let Some(arg) = &cli.max_read_rate {
        opts.max_read_rate = Some(parse_size_in(arg, geo.hardbs, 1, u64::MAX)?);
    }
    if let Some(arg) = &cli.max_error_rate {
        opts.max_error_rate = Some(parse_size(arg, geo.hardbs)?);
    }
    if let Some(arg) = &cli.max_errors {
        let (n, new_only) = parse_max_errors(arg)?;
        opts.max_errors = Some(n);
        opts.new_errors_only = new_only;
    }
    if let Some(arg) = &cli.timeout {
        opts.timeout = Some(parse_interval(arg)?);
    }
    if let Some(arg) = &cli.pause {
        opts.pause = parse_interval(arg)?;
    }
    opts.validate()?;
    Ok(opts)
}

fn do_rescue(cli: &Cli, geo: &Resolved, domain: Domain, interrupt: InterruptFlag) -> Result<i32> {
    let mut input = FileInput::open(&cli.infile, cli.idirect)?;
    let mut isize = input.size()?.unwrap_or(0);

    let test_domain = match &cli.test_mode {
        Some(path) => {
            let d = Domain::from_mapfile(0, None, path, cli.loose_domain)?;
            if isize == 0 || isize > d.end() {
                isize = d.end();
            }
            Some(d)
        }
        None => None,
    };

    let book = Mapbook::new(
        geo.offset,
        isize,
        domain,
        cli.mapfile.as_deref(),
        &command_line(),
        cli.complete_only,
    )?;

    if cli.verify_input_size {
        if book.is_blank() || isize == 0 || book.mapfile_isize() == 0 {
            return Err(RescueError::bad_argument(
                "cannot verify input size: mapfile is missing, empty or unsized",
            ));
        }
        if book.mapfile_isize() != isize {
            return Err(RescueError::bad_argument(
                "input size differs from the size calculated from the mapfile",
            ));
        }
    }
    if cli.truncate && !book.is_blank() {
        return Err(RescueError::bad_argument(
            "output truncation and mapfile input are incompatible",
        ));
    }
    if book.domain().is_empty() {
        tracing::warn!("empty domain; nothing to do");
        return Ok(0);
    }
    if cli.ask && !user_agrees(cli, book.domain().in_size())? {
        return Ok(1);
    }

    let mut output = FileOutput::open(
        &cli.outfile,
        OutputOpenMode {
            truncate: cli.truncate,
            direct: cli.odirect,
            synchronous: cli.synchronous,
            sparse: cli.sparse,
        },
    )?;
    if let Some(arg) = &cli.extend_outfile {
        let min_size = parse_size_in(arg, geo.hardbs, 1, u64::MAX)?;
        output.extend_to(min_size)?;
    }
    if cli.preallocate {
        let pos = (book.domain().pos() as i64 + geo.offset).max(0) as u64;
        output.preallocate(pos, book.domain().size())?;
    }
    finish_rescue(cli, geo, book, input, output, test_domain, interrupt)
}

fn finish_rescue(
    cli: &Cli,
    geo: &Resolved,
    book: Mapbook,
    input: FileInput,
    output: FileOutput,
    test_domain: Option<Domain>,
    interrupt: InterruptFlag,
) -> Result<i32> {
    let opts = rescue_options(cli, geo)?;
    let loggers = open_loggers(cli)?;
    let clock = MonotonicClock::new();
    let summary = match test_domain {
        Some(good) => {
            let wrapped = TestModeInput::new(input, good);
            Rescuebook::new(wrapped, output, book, opts, &clock, interrupt)?
                .with_loggers(loggers)
                .run()?
        }
        None => Rescuebook::new(input, output, book, opts, &clock, interrupt)?
            .with_loggers(loggers)
            .run()?,
    };
    let mut out = std::io::stdout().lock();
    writeln!(
        out,
        "rescued: {} B,  errsize: {} B,  errors: {}",
        summary.rescued, summary.errsize, summary.errors
    )
    .map_err(RescueError::Io)?;
    Ok(0)
}

fn open_loggers(cli: &Cli) -> Result<Loggers> {
    let rates = match &cli.log_rates {
        Some(path) => RatesLog::create(path)?,
        None => RatesLog::disabled(),
    };
    let reads = match &cli.log_reads {
        Some(path) => ReadsLog::create(path)?,
        None => ReadsLog::disabled(),
    };
    Ok(Loggers { rates, reads })
}

fn user_agrees(cli: &Cli, in_size: u64) -> Result<bool> {
    let mut out = std::io::stdout().lock();
    write!(
        out,
        "About to copy {in_size} bytes from '{}' to '{}'.\nProceed (y/N)? ",
        cli.infile.display(),
        cli.outfile.display()
    )
    .map_err(RescueError::Io)?;
    out.flush().map_err(RescueError::Io)?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .map_err(RescueError::Io)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

// ---------------------------------------------------------------------
// Fill mode
// ---------------------------------------------------------------------

fn do_fill(
    cli: &Cli,
    geo: &Resolved,
    domain: Domain,
    types: &str,
    interrupt: InterruptFlag,
) -> Result<i32> {
    let Some(mapfile) = cli.mapfile.as_deref() else {
        return Err(RescueError::bad_argument("fill mode requires a mapfile"));
    };
    let (filltypes, write_location_data) = parse_filltypes(types)?;
    if filltypes.contains(&frescue_types::Status::Finished) {
        tracing::warn!("filling finished blocks: this fill cannot be resumed");
    }
    let opts = FillOptions {
        hardbs: geo.hardbs,
        cluster: geo.cluster,
        filltypes,
        write_location_data,
        ignore_write_errors: cli.ignore_write_errors,
        synchronous: cli.synchronous,
    };
    let input = FileInput::open(&cli.infile, false)?;
    let output = FileOutput::open(
        &cli.outfile,
        OutputOpenMode {
            direct: cli.odirect,
            ..Default::default()
        },
    )?;
    let book = Mapbook::new(geo.offset, 0, domain, Some(mapfile), &command_line(), false)?;
    if book.domain().is_empty() {
        tracing::warn!("empty domain; nothing to do");
        return Ok(0);
    }
    let clock = MonotonicClock::new();
    let summary = Fillbook::new(input, output, book, opts, &clock, interrupt)?.run()?;
    let mut out = std::io::stdout().lock();
    writeln!(
        out,
        "filled: {} B,  ignored write errors: {}",
        summary.filled, summary.write_errors
    )
    .map_err(RescueError::Io)?;
    Ok(0)
}

// ---------------------------------------------------------------------
// Generate mode
// ---------------------------------------------------------------------

fn do_generate(cli: &Cli, geo: &Resolved, domain: Domain, interrupt: InterruptFlag) -> Result<i32> {
    let Some(mapfile) = cli.mapfile.as_deref() else {
        return Err(RescueError::bad_argument("generate mode requires a mapfile"));
    };
    let mut input = FileInput::open(&cli.infile, false)?;
    let isize = input.size()?.unwrap_or(0);
    let copy = FileInput::open(&cli.outfile, false)?;
    let book = Mapbook::new(
        geo.offset,
        isize,
        domain,
        Some(mapfile),
        &command_line(),
        false,
    )?;
    if book.domain().is_empty() {
        tracing::warn!("empty domain; nothing to do");
        return Ok(0);
    }
    let opts = GenerateOptions {
        hardbs: geo.hardbs,
        cluster: geo.cluster,
    };
    let clock = MonotonicClock::new();
    let summary = Genbook::new(input, copy, book, opts, &clock, interrupt)?.run()?;
    let mut out = std::io::stdout().lock();
    writeln!(
        out,
        "generated map: {} B rescued, {} B non-tried",
        summary.finished, summary.non_tried
    )
    .map_err(RescueError::Io)?;
    Ok(0)
}
