use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gcg::catalogue::CatalogueError;
use gcg::catalogue::extractions::CancelToken;
use gcg::catalogue::worklist::{self, BuildReport, BuildRequest, Worklist};
use gcg::config::AppConfig;
use gcg::navigation::{CommitStatus, Transition};
use gcg::search::SearchResolver;
use gcg::session::{Command, HELP, OverwritePrompt, Session, SessionError};
use gcg::state::RecordField;
use gcg::store::OutputStore;
use gcg::store::schema::{self, OutputSchema};

#[derive(Parser)]
#[command(name = "gcg", version, about = "Visual classification of NIRISS grism extractions")]
struct Cli {
    /// Config file (defaults to ~/.config/gcg/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the worklist and report what was kept
    Scan {
        /// Include objects already in the output table
        #[arg(long)]
        all: bool,
    },

    /// Find the object nearest a sky position
    Search {
        /// "10.0 -30.0", "00h40m00s -30d00m00s", "00:40:00 -30:00:00", ...
        coordinate: String,
    },

    /// Match a file of "id, ra, dec" or "ra, dec" lines against the worklist
    Batch {
        file: PathBuf,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Page through the worklist and classify objects
    Session {
        /// Start in write mode instead of read-only
        #[arg(short, long)]
        write: bool,

        /// Start at this object id
        #[arg(long)]
        start: Option<String>,
    },

    /// Summarise the output table
    Stats,

    /// Export the output table as CSV
    Export { path: PathBuf },

    /// Write a default config file
    InitConfig,
}

/// Asks on the terminal before replacing a stored classification.
struct TerminalPrompt;

impl OverwritePrompt for TerminalPrompt {
    fn confirm_overwrite(&mut self, id: &str, seg_id: i64) -> bool {
        dialoguer::Confirm::new()
            .with_prompt(format!(
                "Object {id} (seg id {seg_id}) has already been classified. \
                 Overwrite existing classification? (This cannot be undone.)"
            ))
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    if let Commands::InitConfig = cli.command {
        let path = AppConfig::write_default(cli.config.as_deref())
            .context("Failed to write config")?;
        println!("Wrote default config to {}", path.display());
        return Ok(());
    }

    let config = AppConfig::load(cli.config.as_deref());

    match cli.command {
        Commands::Scan { all } => {
            let Some((_, report)) = build_worklist(&config, all)? else {
                return Ok(());
            };
            println!("{report}");
        }

        Commands::Search { coordinate } => {
            let Some((worklist, _)) = build_worklist(&config, true)? else {
                return Ok(());
            };
            let found = SearchResolver::new(&worklist)
                .resolve_sky_coordinate(&coordinate)
                .context("Search failed")?;
            let entry = worklist
                .get(found.index)
                .context("Match outside the worklist")?;
            println!(
                "{}  seg {}  {:.6} {:.6}  ({:.2}\" away)",
                found.id,
                entry.row.segmentation_id,
                entry.row.ra,
                entry.row.dec,
                found.separation_arcsec
            );
        }

        Commands::Batch { file, json } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let Some((worklist, _)) = build_worklist(&config, true)? else {
                return Ok(());
            };
            let matches = SearchResolver::new(&worklist)
                .resolve_batch(&text)
                .context("Batch search failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&matches)?);
            } else {
                println!(
                    "{:<12} {:>12} {:>12}  {:<12} {:>10}",
                    "Input", "RA", "Dec", "Match", "Sep (\")"
                );
                println!("{}", "-".repeat(62));
                for m in &matches {
                    println!(
                        "{:<12} {:>12.6} {:>12.6}  {:<12} {:>10.2}",
                        m.input_id.as_deref().unwrap_or("-"),
                        m.coord.ra,
                        m.coord.dec,
                        m.matched_id,
                        m.separation_arcsec
                    );
                }
            }
        }

        Commands::Session { write, start } => {
            let mut session = match Session::open(config, Box::new(TerminalPrompt)) {
                Ok(session) => session,
                Err(e) if is_no_objects(&e) => {
                    print_no_objects(&e);
                    return Ok(());
                }
                Err(e) => return Err(e).context("Failed to start session"),
            };
            if write {
                session.set_mode(gcg::session::WriteMode::WriteOutput);
            }
            println!("{}", session.report());
            if let Some(id) = start {
                report_transition(&session.jump_to(&id));
            }
            run_session(&mut session)?;
        }

        Commands::Stats => {
            let store = open_store(&config)?;
            print_stats(&store)?;
        }

        Commands::Export { path } => {
            let store = open_store(&config)?;
            let n = store
                .export_csv(&path)
                .with_context(|| format!("Failed to export to {}", path.display()))?;
            println!("Exported {} classifications to {}", n, path.display());
        }

        // Written before the config is loaded.
        Commands::InitConfig => {}
    }

    Ok(())
}

fn open_store(config: &AppConfig) -> Result<OutputStore> {
    config.validate_paths().context("Incomplete configuration")?;
    let path = config.output_path();
    log::info!("Output table: {}", path.display());
    OutputStore::load(&path, OutputSchema::from_config(config)).context("Failed to open output table")
}

/// Build the worklist with a progress spinner. `None` means nothing to show;
/// the reason has been printed.
fn build_worklist(config: &AppConfig, include_classified: bool) -> Result<Option<(Worklist, BuildReport)>> {
    if let Err(e) = config.validate_paths() {
        eprintln!("{e}");
        return Ok(None);
    }
    let skip_ids = if include_classified || !config.files.skip_existing {
        HashSet::new()
    } else {
        open_store(config)?.seg_ids().context("Failed to read output table")?
    };
    let mut request = BuildRequest::from_config(config, skip_ids);
    request.progress = true;
    match worklist::build(&request, &CancelToken::new()) {
        Ok(built) => Ok(Some(built)),
        Err(e @ CatalogueError::EmptyWorklist) => {
            eprintln!("{e}");
            Ok(None)
        }
        Err(e) => Err(e).context("Failed to build worklist"),
    }
}

fn is_no_objects(e: &SessionError) -> bool {
    matches!(
        e,
        SessionError::Catalogue(CatalogueError::EmptyWorklist) | SessionError::Config(_)
    )
}

fn print_no_objects(e: &SessionError) {
    eprintln!("{e}");
    if let SessionError::Config(_) = e {
        eprintln!("No objects found. Check the supplied directories, or rescan.");
    }
}

fn run_session(session: &mut Session) -> Result<()> {
    print_current(session);
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        if let Some(result) = session.poll_rescan() {
            report_rescan(session, result);
        }

        print!("[{}] {}> ", session.mode(), session.view());
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let command = match line?.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match command {
            Command::Next => report_transition(&session.next()),
            Command::Previous => report_transition(&session.previous()),
            Command::Jump(id) => report_transition(&session.jump_to(&id)),
            Command::Sky(text) => match session.search_sky(&text) {
                Ok((found, transition)) => {
                    println!("Nearest: {} ({:.2}\" away)", found.id, found.separation_arcsec);
                    report_transition(&transition);
                }
                Err(e) => eprintln!("{e}"),
            },
            Command::View(view) => session.set_view(view),
            Command::Mode(mode) => session.set_mode(mode),
            Command::Set { field, value } => {
                if let Err(e) = session.record_str(&field, &value) {
                    eprintln!("{e}");
                }
            }
            Command::Save => report_commit(&session.save()),
            Command::Show => print_current(session),
            Command::Rescan => match session.rescan() {
                Ok(generation) => println!("Rescan {generation} started"),
                Err(e) => eprintln!("{e}"),
            },
            Command::Help => println!("{HELP}"),
            Command::Quit => break,
        }
    }

    if session.rescan_running() {
        if let Some(result) = session.wait_rescan(Duration::from_secs(1)) {
            report_rescan(session, result);
        }
    }
    Ok(())
}

fn report_rescan(session: &Session, result: gcg::session::Result<BuildReport>) {
    match result {
        Ok(report) => {
            println!("Rescan finished: {report}");
            print_current(session);
        }
        Err(e) => eprintln!("Rescan failed, keeping the current worklist: {e}"),
    }
}

fn report_transition(t: &Transition) {
    if let Some(commit) = &t.commit {
        report_commit(commit);
    }
    if let Some(e) = &t.error {
        eprintln!("{e}");
    }
    if t.from != t.to {
        println!("{} -> {}", t.from, t.to);
    }
}

fn report_commit(status: &CommitStatus) {
    match status {
        CommitStatus::Written(outcome) => println!("Saved ({outcome:?})"),
        CommitStatus::NotReady { missing } => {
            println!("Not saved, still missing: {}", missing.join(", "))
        }
        CommitStatus::ReadOnly => {}
        CommitStatus::Declined => println!("Kept the existing classification"),
        CommitStatus::Failed(e) => eprintln!("Save failed: {e}"),
        CommitStatus::NoObject => {}
    }
}

fn print_current(session: &Session) {
    let Some(current) = session.current() else {
        println!("No object selected");
        return;
    };
    let total = session.state().worklist().len();
    println!(
        "{} [{}/{}]  seg {}  {}  {}",
        current.id,
        current.index + 1,
        total,
        current.seg_id,
        current.coord_string(),
        session.view()
    );
    println!("  1D:    {}", current.paths.spec_1d.display());
    println!("  stack: {}", current.paths.stack.display());
    match &current.paths.full {
        Some(path) => println!("  full:  {}", path.display()),
        None => println!("  full:  (missing, no redshift grid)"),
    }
    for (key, value) in session.state().flatten_record() {
        println!("  {key:<28} {value}");
    }
    let missing = session.state().missing_fields();
    if !missing.is_empty() {
        println!("  ({} fields to go)", missing.len());
    }

    let z = session
        .state()
        .record()
        .get(&RecordField::EstimatedRedshift)
        .and_then(|v| v.as_f64());
    if let Some(z) = z {
        let lines: Vec<String> = session
            .config()
            .lines
            .observed(z)
            .iter()
            .map(|l| format!("{} {:.1}", l.name, l.observed))
            .collect();
        println!("  lines at z={z:.3}: {}", lines.join(", "));
    }
}

fn print_stats(store: &OutputStore) -> Result<()> {
    let rows = store.rows().context("Failed to read output table")?;
    println!("Output Table");
    println!("============");
    match store.path() {
        Some(path) => println!("Location:        {}", path.display()),
        None => println!("Location:        (in memory)"),
    }
    println!("Classified:      {}", rows.len());
    if rows.is_empty() {
        return Ok(());
    }

    let redshifts: Vec<f64> = rows
        .iter()
        .filter_map(|r| r.get(schema::ESTIMATED_REDSHIFT).and_then(|v| v.as_f64()))
        .collect();
    if !redshifts.is_empty() {
        let min = redshifts.iter().copied().fold(f64::INFINITY, f64::min);
        let max = redshifts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = redshifts.iter().sum::<f64>() / redshifts.len() as f64;
        println!("Redshift:        {min:.3} to {max:.3} (mean {mean:.3})");
    }
    let flagged = |column: &str| {
        rows.iter()
            .filter(|r| matches!(r.get(column), Some(gcg::record::FieldValue::Bool(true))))
            .count()
    };
    println!("Unreliable z:    {}", flagged(schema::UNRELIABLE_REDSHIFT));
    println!("Bad seg map:     {}", flagged(schema::BAD_SEG_MAP));
    println!();

    println!("Beam quality:");
    for beam in store.schema().beams() {
        let column = schema::BeamField::Quality.column(beam);
        let mut counts: Vec<(String, usize)> = Vec::new();
        for value in rows.iter().filter_map(|r| r.get(&column)) {
            let label = value.to_string();
            match counts.iter_mut().find(|(l, _)| *l == label) {
                Some((_, n)) => *n += 1,
                None => counts.push((label, 1)),
            }
        }
        let summary: Vec<String> = counts.iter().map(|(l, n)| format!("{l} {n}")).collect();
        println!("  {:<14} {}", beam.to_string(), summary.join(", "));
    }
    Ok(())
}
