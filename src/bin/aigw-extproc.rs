use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use http::{HeaderMap, HeaderName, HeaderValue};

use aigw_extproc::config::DEFAULT_WATCH_INTERVAL;
use aigw_extproc::{
    Backend, ConfigSnapshot, ConfigWatcher, RouteResolver, RuleRouter, SnapshotStore, telemetry,
};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration document (.json, .yaml, .yml or .toml)
    #[arg(long)]
    config: PathBuf,

    /// Write logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and print its rules
    Check,
    /// Resolve the backend candidates for a set of request headers
    Route {
        /// Request header as name=value, repeatable
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(HeaderName, HeaderValue)>,
    },
    /// Reload the configuration whenever the file changes, until Ctrl-C
    Watch {
        /// Poll interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

fn parse_header(raw: &str) -> Result<(HeaderName, HeaderValue), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{raw}`"))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|err| format!("invalid header name `{name}`: {err}"))?;
    let value = HeaderValue::from_str(value.trim())
        .map_err(|err| format!("invalid header value for `{name}`: {err}"))?;
    Ok((name, value))
}

fn describe_backend(backend: &Backend) -> String {
    let mut out = format!("{} ({}", backend.name, backend.schema.name);
    if let Some(version) = backend.schema.version.as_deref() {
        out.push(' ');
        out.push_str(version);
    }
    out.push(')');
    if let Some(url) = backend.url.as_deref() {
        out.push_str(&format!(" url={url}"));
    }
    if let Some(model) = backend.model_name_override.as_deref() {
        out.push_str(&format!(" model={model}"));
    }
    out
}

fn print_summary(snapshot: &ConfigSnapshot) {
    println!(
        "config ok: schema={} selectedRouteHeaderKey={} modelNameHeaderKey={} rules={}",
        snapshot.schema().name,
        snapshot.selected_route_header_key(),
        snapshot.model_name_header_key(),
        snapshot.rules().len()
    );
    for rule in snapshot.rules() {
        let matches = if rule.headers.is_empty() {
            "*".to_string()
        } else {
            rule.headers
                .iter()
                .map(|header| format!("{}={}", header.name, header.value))
                .collect::<Vec<_>>()
                .join(",")
        };
        println!("rule {} [{matches}]", rule.name);
        for (index, backend) in rule.backends.iter().enumerate() {
            println!("  {}. {}", index + 1, describe_backend(backend));
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.json_logs, &cli.log_level)?;

    let snapshot = ConfigSnapshot::load(&cli.config).await?;
    match cli.command {
        Command::Check => print_summary(&snapshot),
        Command::Route { headers } => {
            let mut map = HeaderMap::new();
            for (name, value) in headers {
                map.append(name, value);
            }
            let route = RuleRouter::new().resolve(&map, &snapshot)?;
            println!("rule {}", route.rule);
            for (index, backend) in route.backends.iter().enumerate() {
                println!("  {}. {}", index + 1, describe_backend(backend));
            }
        }
        Command::Watch { interval_ms } => {
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_WATCH_INTERVAL);
            let store = Arc::new(SnapshotStore::new(snapshot));
            tracing::info!(path = %cli.config.display(), generation = store.load().generation(), "watching config");
            let watcher = ConfigWatcher::spawn(store, cli.config.clone(), interval);
            tokio::signal::ctrl_c().await?;
            watcher.shutdown().await;
        }
    }
    Ok(())
}
