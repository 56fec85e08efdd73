use clap::{Parser, Subcommand};
use k_vault::backup::config::{Access, AppConfig};
use k_vault::backup::result_error::error::Error;
use k_vault::backup::result_error::result::Result;
use k_vault::backup::result_error::WithMsg;
use k_vault::backup::secret::SecretKey;
use k_vault::backup::session::SessionKind;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{error, info};

/// Scheduled, encrypted backups of local files
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long, default_value = "k-vault.yml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run configured schedules until killed
    Daemon,
    /// Back up the given paths right now
    Backup {
        #[arg(short, long, default_value = "manual")]
        name: String,
        #[arg(short, long, value_enum, default_value_t = KindArg::Selective)]
        kind: KindArg,
        /// Glob over full paths to leave out, may repeat
        #[arg(short, long)]
        exclude: Vec<String>,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Continue a paused session
    Resume { session: String },
    /// Download, verify and write one file of a session
    Restore {
        session: String,
        file: String,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Print stored sessions
    Sessions {
        /// Print every file record, not just the summary
        #[arg(short, long)]
        verbose: bool,
    },
    /// Print registered schedules with their next run
    Schedules,
    /// Print a fresh random encryption key
    Keygen,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Full,
    Incremental,
    Selective,
}

impl From<KindArg> for SessionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Full => SessionKind::Full,
            KindArg::Incremental => SessionKind::Incremental,
            KindArg::Selective => SessionKind::Selective,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn write_atomically(out: &Path, data: &[u8]) -> Result<()> {
    let dir = match out.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(out).map_err(|e| Error::from(e.error))?;
    Ok(())
}

fn run(args: Args) -> Result<()> {
    if let Command::Keygen = args.command {
        println!("{}", SecretKey::generate().to_base64());
        return Ok(());
    }

    let config = AppConfig::load(&args.config)?;
    // only the daemon recovers interrupted sessions and rewrites schedules
    let access = match args.command {
        Command::Daemon => Access::Owner,
        _ => Access::Shared,
    };
    let services = Arc::new(config.open(access)?);

    match args.command {
        Command::Daemon => {
            let pool = Arc::new(config.build_pool()?);
            let handle = services.start_daemon(pool)?;
            info!("Daemon running");
            handle.wait();
            Err(Error::Scheduling("scheduler loop exited".into()))
        }
        Command::Backup {
            name,
            kind,
            exclude,
            paths,
        } => {
            let summary = services.backup_now(name, kind.into(), &paths[..], &exclude[..])?;
            print_json(&summary)
        }
        Command::Resume { session } => print_json(&services.tracker.resume(&session)?),
        Command::Restore { session, file, out } => {
            let data = services
                .tracker
                .restore_file(&session, &file)
                .with_msg(format!("Restore of file {file} from session {session} failed"))?;
            write_atomically(&out, &data)?;
            info!("Restored {} bytes to {:?}", data.len(), out);
            Ok(())
        }
        Command::Sessions { verbose } => {
            let sessions = services.tracker.sessions();
            if verbose {
                print_json(&sessions)
            } else {
                print_json(&sessions.iter().map(|s| s.summary()).collect::<Vec<_>>())
            }
        }
        Command::Schedules => print_json(&services.schedules()),
        Command::Keygen => Ok(()),
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        error!("{e}");
        exit(1);
    }
}
