mod config;
mod logger;

use clap::{Parser, Subcommand};
use feedwatch_sim::{run_script, Script, SimHarness};
use feedwatch_watchlist::{WatchlistEvent, WatchlistStats};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ConsumerConfig;
use crate::logger::{BufferLayer, LogBuffer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Print buffered log entries as JSON before exiting
    #[arg(long)]
    dump_log: bool,
    /// Entries kept for --dump-log
    #[arg(long, default_value_t = 1_000)]
    log_capacity: usize,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a watchlist against the scripted provider and print the fan-out
    Run {
        /// TOML scenario file
        script: PathBuf,
    },
    /// Print the resolved configuration (default)
    Config,
}

fn init_logging(capacity: usize) -> Arc<LogBuffer> {
    let buffer = Arc::new(LogBuffer::new(capacity));
    let filter = EnvFilter::try_from_env("FEEDWATCH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(BufferLayer {
            buffer: buffer.clone(),
        })
        .init();
    buffer
}

fn load_script(path: &Path) -> Result<Script, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| format!("read {}: {err}", path.display()))?;
    toml::from_str(&text).map_err(|err| format!("parse {}: {err}", path.display()))
}

fn print_event(event: &WatchlistEvent) {
    match event {
        WatchlistEvent::Channel(channel) => println!("channel {channel:?}"),
        WatchlistEvent::Message { msg, tag } => {
            let body = serde_json::to_string(msg).unwrap_or_else(|err| format!("<{err}>"));
            match tag {
                Some(tag) => println!("stream {} tag {tag} {body}", msg.stream_id()),
                None => println!("stream {} {body}", msg.stream_id()),
            }
        }
    }
}

fn print_stats(stats: &WatchlistStats) {
    println!("inbound_messages={}", stats.inbound_messages);
    println!("decode_errors={}", stats.decode_errors);
    println!("unknown_stream_messages={}", stats.unknown_stream_messages);
    println!("requests_sent={}", stats.requests_sent);
    println!("closes_sent={}", stats.closes_sent);
    println!("posts_sent={}", stats.posts_sent);
    println!("events_delivered={}", stats.events_delivered);
    println!("request_timeouts={}", stats.request_timeouts);
    println!("post_timeouts={}", stats.post_timeouts);
    println!("recoveries={}", stats.recoveries);
    println!("rejected_submits={}", stats.rejected_submits);
}

fn run(cfg: &ConsumerConfig, script_path: &Path) -> Result<(), String> {
    let script = load_script(script_path)?;
    info!(
        service = %script.service,
        steps = script.steps.len(),
        "running scenario {}",
        script_path.display()
    );
    let mut harness = SimHarness::connected(cfg.watchlist(), script.provider())
        .map_err(|err| format!("handshake: {err}"))?;
    run_script(&mut harness, &script).map_err(|err| format!("scenario: {err}"))?;

    for event in &harness.events {
        print_event(event);
    }
    print_stats(&harness.watchlist.stats());
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let buffer = init_logging(cli.log_capacity);

    let cfg = match ConsumerConfig::new(cli.config.clone()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("config load failed: {err}");
            std::process::exit(1);
        }
    };

    let outcome = match &cli.command {
        Some(Commands::Run { script }) => run(&cfg, script),
        Some(Commands::Config) | None => serde_json::to_string_pretty(&cfg)
            .map(|json| println!("{json}"))
            .map_err(|err| err.to_string()),
    };

    if cli.dump_log {
        match serde_json::to_string_pretty(&buffer.get_all()) {
            Ok(json) => println!("{json}"),
            Err(err) => error!("log dump failed: {err}"),
        }
    }

    if let Err(err) = outcome {
        error!("{err}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedwatch_watchlist::WatchlistConfig;

    #[test]
    fn test_cli_parsing() {
        use clap::Parser;

        let cli = Cli::try_parse_from(["feedwatch-consumer"]).expect("bare invocation");
        assert!(cli.command.is_none());
        assert!(!cli.dump_log);
        assert_eq!(cli.log_capacity, 1_000);

        let cli = Cli::try_parse_from([
            "feedwatch-consumer",
            "--dump-log",
            "-c",
            "feedwatch.toml",
            "run",
            "scenarios/reconnect.toml",
        ])
        .expect("run with options");
        assert!(cli.dump_log);
        assert_eq!(cli.config, Some(PathBuf::from("feedwatch.toml")));
        match cli.command {
            Some(Commands::Run { script }) => {
                assert_eq!(script, PathBuf::from("scenarios/reconnect.toml"))
            }
            _ => panic!("expected Run command"),
        }

        assert!(Cli::try_parse_from(["feedwatch-consumer", "run"]).is_err());
    }

    #[test]
    fn bundled_scenario_runs_end_to_end() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios/reconnect.toml");
        let script = load_script(&path).expect("bundled scenario parses");
        let mut harness = SimHarness::connected(WatchlistConfig::default(), script.provider())
            .expect("handshake");
        run_script(&mut harness, &script).expect("scenario runs");
        assert!(harness.watchlist.stats().recoveries > 0);
        assert!(!harness.events.is_empty());
    }

    #[test]
    fn missing_script_is_reported() {
        let err = load_script(Path::new("does/not/exist.toml")).expect_err("no such file");
        assert!(err.starts_with("read does/not/exist.toml"));
    }
}
