//! Board hand-off demo.
//!
//! Plays both devices over the simulated radio: one hosts a board, the other
//! scans, picks the host and fetches the board.
//!
//!   cargo run -p boardlink-demo-duel -- --board-size 25 --host-pick 7
//!   cargo run -p boardlink-demo-duel -- --flaky 3 --frame-cap 8
//!
//! `--flaky N` makes the first N connect attempts fail with the busy-radio
//! status, so the retry loop has something to do.

mod duel;

use boardlink_core::SessionPayload;
use boardlink_session::SessionConfig;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "duel", about = "Hand a game board from one device to another")]
struct Args {
    /// Session config (TOML)
    #[arg(long, env = "BOARDLINK_CONFIG")]
    config: Option<PathBuf>,
    /// Number of cards on the board
    #[arg(long, default_value_t = 25)]
    board_size: u32,
    /// Card the host has picked, if any
    #[arg(long)]
    host_pick: Option<u32>,
    /// Connect attempts to fail before one goes through
    #[arg(long, default_value_t = 0)]
    flaky: usize,
    /// Most bytes the host serves per read, overriding the config
    #[arg(long)]
    frame_cap: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("duel=info".parse()?)
                .add_directive("boardlink_session=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Some(frame_cap) = args.frame_cap {
        config.frame_cap = frame_cap;
    }
    config.validate()?;

    let board = SessionPayload::new((1..=args.board_size).collect(), args.host_pick);
    tracing::info!(
        cards = args.board_size,
        frame_cap = config.frame_cap,
        flaky = args.flaky,
        "starting duel"
    );

    duel::run(config, board, args.flaky).await
}
