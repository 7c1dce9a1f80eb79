//! The `bunsen` command-line front end.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};

use bunsen::errors::BunsenError;
use bunsen::repo::Repository;

#[derive(Parser, Debug)]
#[command(name = "bunsen", about, version)]
struct Cli {
    /// Repository location (falls back to the current directory).
    #[arg(long, global = true, env = "BUNSEN_ROOT")]
    repo: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a repository.
    Init {
        /// Directory to initialize; defaults to the repository location.
        dir: Option<PathBuf>,
    },
    /// Store a testrun bundle from a tar archive.
    Ingest {
        #[arg(long)]
        project: Option<String>,
        /// Extra label suffix for the testruns branch.
        #[arg(long)]
        extra: Option<String>,
        tar: PathBuf,
    },
    /// List stored testruns.
    ListRuns {
        #[arg(long)]
        project: Option<String>,
        /// Restrict to one month (YYYY-MM).
        #[arg(long)]
        month: Option<String>,
        /// Include runs marked obsolete.
        #[arg(long)]
        include_obsolete: bool,
    },
    /// Print one stored log file, or list a testrun's log files.
    GetLogs {
        bunsen_commit_id: String,
        path: Option<String>,
    },
    /// Print the log lines a cursor refers to.
    ShowCursor {
        cursor: String,
        /// Commit context for abbreviated cursors.
        #[arg(long)]
        id: Option<String>,
    },
    /// Rebuild missing index entries and full-testrun files.
    Repair,
    /// Exclude a testrun from queries (logs are kept).
    MarkObsolete { bunsen_commit_id: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .without_time()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("bunsen: {e} [{}]", e.kind());
            ExitCode::from(e.exit_code().clamp(0, 255) as u8)
        }
    }
}

fn run(cli: Cli) -> Result<(), BunsenError> {
    let root = cli
        .repo
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    match cli.command {
        Command::Init { dir } => {
            let dir = dir.unwrap_or(root);
            Repository::init(&dir)?;
            println!("initialized bunsen repository at {}", dir.display());
            Ok(())
        }
        Command::Ingest {
            project,
            extra,
            tar,
        } => {
            let repo = Repository::open(&root)?;
            let reader = File::open(&tar)?;
            let outcome = repo.ingest_tar(project.as_deref(), reader, extra)?;
            println!("{}", outcome.id);
            Ok(())
        }
        Command::ListRuns {
            project,
            month,
            include_obsolete,
        } => {
            let repo = Repository::open(&root)?;
            let query = repo.query();
            let projects: Vec<String> = match project {
                Some(project) => vec![project],
                None => query.list_projects()?.into_iter().collect(),
            };
            for project in projects {
                for run in query.list_testruns(&project, month.as_deref(), include_obsolete)? {
                    let run = run?;
                    print_summary_line(&project, &run);
                }
            }
            Ok(())
        }
        Command::GetLogs {
            bunsen_commit_id,
            path,
        } => {
            let repo = Repository::open(&root)?;
            let query = repo.query();
            match path {
                Some(path) => {
                    let bytes = query.open_log(&bunsen_commit_id, &path)?;
                    std::io::stdout().write_all(&bytes)?;
                }
                None => {
                    for name in query.list_logs(&bunsen_commit_id)? {
                        println!("{name}");
                    }
                }
            }
            Ok(())
        }
        Command::ShowCursor { cursor, id } => {
            let repo = Repository::open(&root)?;
            let resolved = repo.query().resolve_cursor(&cursor, id.as_deref())?;
            for line in &resolved.lines {
                println!("{line}");
            }
            if resolved.truncated {
                eprintln!("bunsen: cursor range extends past the end of the file");
            }
            Ok(())
        }
        Command::Repair => {
            let repo = Repository::open(&root)?;
            let report = repo.repair()?;
            println!(
                "scanned {} commits, rebuilt {} testrun files, appended {} index entries",
                report.scanned, report.rebuilt_testruns, report.appended_index
            );
            Ok(())
        }
        Command::MarkObsolete { bunsen_commit_id } => {
            let repo = Repository::open(&root)?;
            let id = repo.mark_obsolete(&bunsen_commit_id)?;
            println!("{id} marked obsolete");
            Ok(())
        }
    }
}

fn print_summary_line(project: &str, run: &bunsen::model::Testrun) {
    let id = run
        .bunsen_commit_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".repeat(40));
    let month = run.year_month.as_deref().unwrap_or("-");
    let passes = run.pass_count.map(|n| n.to_string()).unwrap_or_else(|| "?".into());
    let fails = run.fail_count.map(|n| n.to_string()).unwrap_or_else(|| "?".into());
    let mut flags = String::new();
    if run.is_obsolete() {
        flags.push_str(" obsolete");
    }
    if run.has_problems() {
        flags.push_str(" problems");
    }
    println!("{id} {project} {month} pass {passes} fail {fails}{flags}");
}
