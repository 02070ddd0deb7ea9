/*
 * 5D Labs Agent Platform - Self-Heal Engine Service
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Self-heal engine
//!
//! Reads episode signals as JSON lines (one `Signal` per line, from a file or stdin), and
//! hands each to the per-node dispatcher:
//!
//! ```json
//! {"signal":"observed","nodeName":"gpu-a-017","type":"gpu","condition":"XidError","value":79}
//! {"signal":"resolved","nodeName":"gpu-a-017","type":"gpu","condition":"XidError"}
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use selfheal::cluster::KubeCluster;
use selfheal::config::{EngineConfig, TicketBackend};
use selfheal::status::HttpStatusClient;
use selfheal::template::TemplateStore;
use selfheal::tickets::{
    ConfigMapStore, ConfigMapTicketManager, MemoryTicketManager, TicketManager,
};
use selfheal::{ApiBridge, Dispatcher, Registry, Signal};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "selfheal-engine")]
#[command(about = "Self-healing remediation engine for GPU cluster nodes")]
#[command(version)]
struct Cli {
    /// Engine configuration file
    #[arg(long, env = "SELFHEAL_CONFIG", default_value = "/config/config.yaml")]
    config: String,

    /// JSON-lines signal feed; `-` reads stdin
    #[arg(long, env = "SELFHEAL_INPUT", default_value = "-")]
    input: String,

    /// Emit JSON logs
    #[arg(long, env = "SELFHEAL_JSON_LOGS")]
    json_logs: bool,

    /// Namespace for remediation Jobs/Pods (overrides the config file)
    #[arg(long)]
    namespace: Option<String>,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,selfheal=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn build_bridge(config: EngineConfig) -> Result<Arc<ApiBridge>> {
    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let tickets: Arc<dyn TicketManager> = match config.tickets.backend {
        TicketBackend::ConfigMap => {
            let store = ConfigMapStore::new(client.clone(), config.ticket_namespace());
            Arc::new(ConfigMapTicketManager::new(
                store,
                config.tickets.history_depth,
            ))
        }
        TicketBackend::Memory => {
            warn!("Using in-memory tickets; history is lost on restart");
            Arc::new(MemoryTicketManager::in_memory(config.tickets.history_depth))
        }
    };

    let templates = match &config.template_dir {
        Some(dir) => TemplateStore::from_dir(dir)
            .with_context(|| format!("failed to load templates from {}", dir.display()))?,
        None => TemplateStore::embedded().context("embedded templates are invalid")?,
    };

    let status = HttpStatusClient::new(&config.status).context("failed to build status client")?;

    Ok(Arc::new(ApiBridge::new(
        Arc::new(KubeCluster::new(client)),
        Arc::new(status),
        tickets,
        templates,
        config,
    )))
}

/// Feeds signals to the dispatcher until the input ends or the token is cancelled
async fn pump<R>(reader: R, dispatcher: &Dispatcher, token: &CancellationToken) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut submitted = 0usize;
    loop {
        let line = tokio::select! {
            biased;
            () = token.cancelled() => break,
            line = lines.next_line() => line.context("failed to read input")?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<Signal>(line) {
            Ok(signal) => {
                dispatcher.submit(signal);
                submitted += 1;
            }
            Err(e) => warn!(error = %e, "Skipping malformed signal line"),
        }
    }
    Ok(submitted)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::from_mounted_file(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config))?;
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    init_tracing(cli.json_logs || config.logging.json);
    config.validate().context("invalid configuration")?;

    info!(
        namespace = %config.namespace,
        aggressive = config.remediation.aggressive,
        aggressive_level = config.remediation.aggressive_level,
        "🚀 Starting selfheal engine"
    );

    let bridge = build_bridge(config).await?;
    let registry = Registry::with_default_policies().context("failed to build policy registry")?;
    registry
        .initialize(bridge)
        .context("failed to initialize policies")?;

    let token = CancellationToken::new();
    let dispatcher = Dispatcher::new(Arc::new(registry), token.clone());

    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal, cancelling remediation");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let submitted = if cli.input == "-" {
        pump(BufReader::new(tokio::io::stdin()), &dispatcher, &token).await?
    } else {
        let file = tokio::fs::File::open(PathBuf::from(&cli.input))
            .await
            .with_context(|| format!("failed to open input {}", cli.input))?;
        pump(BufReader::new(file), &dispatcher, &token).await?
    };

    info!(submitted, "Input finished, waiting for node workers");
    dispatcher.shutdown().await;
    Ok(())
}
