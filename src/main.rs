use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use minidumper_demo::{dump_symbols, stackwalk, Database, StackwalkOptions, SymbolDumpOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about = "Post-processing companion to the crash demo: dump symbols, walk stacks, inspect the crash database")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dump breakpad symbols for a binary and the shared libraries beside it
    Symbols {
        /// Binary to dump symbols for
        binary: PathBuf,
        /// Directory receiving the <name>/<debug id>/<name>.sym layout
        symbols_dir: PathBuf,
        /// Path to the dump_syms executable
        #[arg(long, default_value = "dump_syms")]
        dump_syms: PathBuf,
        /// Parallel dump jobs, defaults to the number of cpus
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Empty the symbols directory before dumping
        #[arg(long)]
        clear: bool,
    },
    /// Resolve a minidump into a human-readable backtrace
    Stackwalk {
        /// The .dmp file to resolve
        minidump: PathBuf,
        /// Symbol directory produced by the symbols command
        symbols_dir: PathBuf,
        /// Path to the minidump-stackwalk executable
        #[arg(long, default_value = "minidump-stackwalk")]
        stackwalker: PathBuf,
        /// Print the condensed backtrace instead of the full report
        #[arg(long)]
        brief: bool,
    },
    /// List the reports in a crash database
    Reports {
        /// Crash database directory
        database: PathBuf,
    },
    /// Record upload consent in a crash database
    Uploads {
        /// Crash database directory
        database: PathBuf,
        state: UploadsState,
    },
}

#[derive(Copy, Clone, ValueEnum)]
enum UploadsState {
    On,
    Off,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Symbols {
            binary,
            symbols_dir,
            dump_syms,
            jobs,
            clear,
        } => {
            let mut options = SymbolDumpOptions {
                dump_syms,
                clear,
                ..Default::default()
            };
            if let Some(jobs) = jobs {
                options.jobs = jobs;
            }

            let summary = dump_symbols(&binary, &symbols_dir, &options)
                .with_context(|| format!("dumping symbols for {}", binary.display()))?;

            println!(
                "{} symbol files written, {} already present",
                summary.written.len(),
                summary.skipped.len()
            );

            if !summary.failed.is_empty() {
                for (binary, reason) in &summary.failed {
                    eprintln!("failed: {}: {reason}", binary.display());
                }
                anyhow::bail!("symbol generation failed for {} binaries", summary.failed.len());
            }
        }
        Command::Stackwalk {
            minidump,
            symbols_dir,
            stackwalker,
            brief,
        } => {
            let report = stackwalk(
                &minidump,
                &symbols_dir,
                &StackwalkOptions { stackwalker, brief },
            )
            .with_context(|| format!("walking {}", minidump.display()))?;

            print!("{report}");
        }
        Command::Reports { database } => {
            let database = Database::open(&database)
                .with_context(|| format!("opening crash database {}", database.display()))?;

            let settings = database.settings()?;
            println!("uploads enabled: {}", settings.uploads_enabled);
            if let Some(last) = settings.last_upload_attempt {
                println!("last upload attempt: {last}");
            }

            for (state, reports) in [
                ("pending", database.pending_reports()?),
                ("completed", database.completed_reports()?),
            ] {
                println!("{state}: {}", reports.len());
                for report in reports {
                    let product = report
                        .annotations
                        .get("product")
                        .map(String::as_str)
                        .unwrap_or("-");
                    let version = report
                        .annotations
                        .get("version")
                        .map(String::as_str)
                        .unwrap_or("-");
                    println!(
                        "  {} {} {product} {version} {}",
                        report.id,
                        report.created_at.format("%Y-%m-%d %H:%M:%S"),
                        report.minidump.display()
                    );
                }
            }
        }
        Command::Uploads { database, state } => {
            let database = Database::open(&database)
                .with_context(|| format!("opening crash database {}", database.display()))?;
            database.set_uploads_enabled(matches!(state, UploadsState::On))?;
        }
    }

    Ok(())
}
