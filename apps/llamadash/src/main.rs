use std::time::Duration;

use {
    anyhow::{Context, Result, bail},
    clap::{Parser, Subcommand, ValueEnum},
    llamadash_client::DashboardClient,
    llamadash_config::DashboardConfig,
    llamadash_protocol::{LogEntry, Model, RouterStatus},
    tokio::sync::broadcast,
    tracing::{info, warn},
};

/// Dashboard gateway and socket client for llama.cpp routers.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket gateway.
    Serve {
        /// Address to bind the HTTP server to.
        #[arg(long, env = "LLAMADASH_BIND")]
        bind: Option<String>,

        /// Port to listen on.
        #[arg(long, env = "LLAMADASH_PORT")]
        port: Option<u16>,
    },
    /// Connect to a gateway and log every cache change.
    Watch {
        /// Gateway socket URL, e.g. ws://127.0.0.1:8585/llamaproxws.
        #[arg(long, env = "LLAMADASH_URL")]
        url: Option<String>,

        /// Give up if the first connection takes longer than this many seconds.
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    match args.command {
        Command::Serve { bind, port } => llamadash_gateway::start_gateway(bind.as_deref(), port)
            .await
            .context("gateway stopped"),
        Command::Watch {
            url,
            connect_timeout,
        } => {
            let mut config = llamadash_config::discover_and_load();
            if let Some(url) = url {
                config.client.url = url;
            }
            watch(config, Duration::from_secs(connect_timeout)).await
        },
    }
}

// ── Watch ────────────────────────────────────────────────────────────────────

async fn watch(config: DashboardConfig, connect_timeout: Duration) -> Result<()> {
    let client = DashboardClient::new(&config.client, config.logs.capacity);
    info!(url = %config.client.url, "connecting");
    client.connect();
    if !client.wait_connected(connect_timeout).await {
        bail!(
            "could not connect to {} within {connect_timeout:?}",
            config.client.url
        );
    }

    let mut established = client.established();
    let mut models = client.models().subscribe();
    let mut logs = client.logs().subscribe();
    let mut router = client.router().subscribe();
    let mut last_log_id = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, disconnecting");
                client.disconnect();
                return Ok(());
            },
            event = established.recv() => match event {
                Ok(e) => info!(conn_id = ?e.conn_id, epoch = e.epoch, "connection established"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "established notifications lagged");
                },
                Err(broadcast::error::RecvError::Closed) => bail!("coordinator dropped"),
            },
            changed = models.changed() => {
                changed.context("models cache dropped")?;
                let snapshot = models.borrow_and_update().clone();
                if let Some(list) = snapshot {
                    log_models(&list);
                }
            },
            changed = logs.changed() => {
                changed.context("logs cache dropped")?;
                let snapshot = logs.borrow_and_update().clone();
                if let Some(list) = snapshot {
                    last_log_id = log_entries(&list, last_log_id);
                }
            },
            changed = router.changed() => {
                changed.context("router cache dropped")?;
                let status = router.borrow_and_update().clone();
                if let Some(status) = status {
                    log_router(&status);
                }
            },
        }
    }
}

fn log_models(models: &[Model]) {
    info!(count = models.len(), "models");
    for model in models {
        info!(id = %model.id, name = %model.name, status = %model.status, "  model");
    }
}

/// Print entries newer than `seen` oldest first. Returns the newest id.
fn log_entries(entries: &[LogEntry], seen: u64) -> u64 {
    for entry in entries.iter().rev().filter(|e| e.id > seen) {
        info!(level = ?entry.level, id = entry.id, "{}", entry.message);
    }
    entries.iter().map(|e| e.id).max().unwrap_or(seen).max(seen)
}

fn log_router(status: &RouterStatus) {
    info!(
        status = %status.status,
        url = status.url.as_deref().unwrap_or("-"),
        loaded = status.loaded_models.len(),
        "router"
    );
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {super::*, llamadash_protocol::LogLevel};

    fn entry(id: u64) -> LogEntry {
        LogEntry {
            id,
            level: LogLevel::Info,
            message: format!("line {id}"),
            timestamp: 0,
        }
    }

    #[test]
    fn log_entries_tracks_newest_id() {
        assert_eq!(log_entries(&[entry(3), entry(2)], 0), 3);
        assert_eq!(log_entries(&[entry(3), entry(2)], 5), 5);
        assert_eq!(log_entries(&[], 4), 4);
    }

    #[test]
    fn parses_subcommands() {
        let args = Args::try_parse_from(["llamadash", "serve", "--port", "9000"]).unwrap();
        assert!(matches!(args.command, Command::Serve { port: Some(9000), .. }));

        let args = Args::try_parse_from([
            "llamadash",
            "--log-format",
            "json",
            "watch",
            "--url",
            "ws://h:1/x",
        ])
        .unwrap();
        assert!(matches!(args.log_format, LogFormat::Json));
        assert!(matches!(args.command, Command::Watch { url: Some(ref u), .. } if u == "ws://h:1/x"));
    }
}
