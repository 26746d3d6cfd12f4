use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use vutor::config::{EngineConfig, DEFAULT_MAX_PEERS, DEFAULT_PORT};
use vutor::engine;

/// A download-only BitTorrent client.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the .torrent file.
    file: PathBuf,

    /// Max number of peer sessions running concurrently.
    #[arg(long, default_value_t = DEFAULT_MAX_PEERS)]
    max_peers: usize,

    /// Port advertised to the tracker (this client never listens).
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Increase log verbosity; repeat for more (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = EngineConfig {
        max_peers: cli.max_peers,
        port: cli.port,
        ..EngineConfig::default()
    };

    match engine::run(&cli.file, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
