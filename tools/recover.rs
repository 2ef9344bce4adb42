// Offline recovery driver.
//
// Usage:
//   recover <progname> [--mount <dir>] [--user <name>]
//
// Opens the crashed program's undo log, rolls back every interrupted
// failure-atomic section, and deletes the log. Exits 0 when recovery
// succeeded or there was nothing to do; non-zero on unrecoverable errors.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use nvrt::{api, RuntimeConfig};

#[derive(Parser, Debug)]
#[command(name = "recover")]
#[command(about = "Roll back interrupted failure-atomic sections after a crash", long_about = None)]
struct Args {
    /// Name of the crashed program (the log region is logs_<progname>)
    #[arg(value_name = "PROGNAME")]
    progname: String,

    /// Persistent-memory mount point (defaults to the configured mount)
    #[arg(long)]
    mount: Option<PathBuf>,

    /// User namespace under the mount (defaults to $USER)
    #[arg(long)]
    user: Option<String>,

    /// Verbose progress output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let mut cfg = match RuntimeConfig::load_from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("recover: bad configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    cfg.progname = args.progname;
    if let Some(mount) = args.mount {
        cfg.mount = mount;
    }
    if let Some(user) = args.user {
        cfg.user = user;
    }

    match api::recover_program(cfg) {
        Ok(outcome) => {
            if outcome.nothing_to_do {
                println!("nothing to recover");
            } else {
                println!(
                    "recovered: {} sections rolled back across {} threads ({} entries)",
                    outcome.sections_undone, outcome.lanes, outcome.entries_undone
                );
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("recover: {err}");
            ExitCode::FAILURE
        }
    }
}
