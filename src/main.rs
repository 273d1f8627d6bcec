// Entrypoint for the CLI application.
//
// One-shot subcommands run a single dispatch and map the outcome onto a
// process exit code; `--interactive` hands the same client to the REPL.
// Everything the client needs (transport, cache, limiter, credentials,
// cancel flag) is built here and passed down explicitly.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cratedig::api::{ApiClient, CancelFlag};
use cratedig::dispatch::Dispatcher;
use cratedig::limiter::AcquireMode;
use cratedig::session::{Session, SessionState};
use cratedig::ui;

#[derive(Parser)]
#[command(
    name = "cratedig",
    version,
    about = "Search artists, releases, labels and marketplace listings on Discogs",
    after_help = "Filters are passed as key=value, e.g. `cratedig search-release kind of blue year=1959`.\n\
                  Set DISCOGS_TOKEN for authenticated access."
)]
struct Cli {
    /// Launch the interactive session
    #[arg(short, long)]
    interactive: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Search for artists
    SearchArtist {
        /// Search terms, with optional key=value filters
        #[arg(required = true)]
        args: Vec<String>,
    },
    /// Search for releases
    SearchRelease {
        #[arg(required = true)]
        args: Vec<String>,
    },
    /// Search for labels
    SearchLabel {
        #[arg(required = true)]
        args: Vec<String>,
    },
    /// Search marketplace listings
    SearchMarketplace {
        #[arg(required = true)]
        args: Vec<String>,
    },
    /// Browse an artist's releases by artist id
    ListReleases {
        artist_id: u64,
    },
}

impl Command {
    fn into_parts(self) -> (&'static str, Vec<String>) {
        match self {
            Command::SearchArtist { args } => ("search-artist", args),
            Command::SearchRelease { args } => ("search-release", args),
            Command::SearchLabel { args } => ("search-label", args),
            Command::SearchMarketplace { args } => ("search-marketplace", args),
            Command::ListReleases { artist_id } => {
                ("list-releases", vec![artist_id.to_string()])
            }
        }
    }
}

fn cache_path() -> PathBuf {
    if let Ok(path) = std::env::var("CRATEDIG_CACHE") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cratedig_cache.json")
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancelFlag::new();

    let client = match ApiClient::from_env(cache_path(), cancel.clone()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(command) => {
            let (name, args) = command.into_parts();
            let dispatcher = Dispatcher::new(&client, AcquireMode::FailFast);
            let mut state = SessionState::new();
            match dispatcher.dispatch(name, &args, &mut state) {
                Ok(outcome) => {
                    ui::render_outcome(&outcome);
                    if let Err(e) = client.cache().flush() {
                        warn!(error = %e, "cache flush failed");
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    ui::render_error(&e);
                    ExitCode::from(e.exit_code())
                }
            }
        }
        None if cli.interactive => {
            // SIGINT cancels the in-flight call instead of killing the
            // session; the handler just flips the shared flag.
            let handler_flag = cancel.clone();
            if let Err(e) = ctrlc::set_handler(move || handler_flag.set()) {
                warn!(error = %e, "could not install SIGINT handler");
            }
            let mut session = Session::new(&client, cancel);
            match session.run() {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {e:#}");
                    ExitCode::FAILURE
                }
            }
        }
        None => {
            let _ = Cli::command().print_help();
            println!();
            ExitCode::SUCCESS
        }
    }
}
