//! design-relay: bridges HTTP callers to design-tool plugin connections.
//!
//! ```bash
//! RELAY_AUTH_TOKEN=secret design-relay --port 9091
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;

use relay_core::analysis::Summarizer;
use relay_llm::{AnthropicSummarizer, SummarizerConfig};
use relay_server::ServerConfig;
use relay_telemetry::{init_telemetry, parse_level, TelemetryConfig};

// No `Debug`: the struct holds raw secrets until they are wrapped.
#[derive(Parser)]
#[command(name = "design-relay")]
#[command(about = "WebSocket relay between HTTP callers and design-tool plugins")]
#[command(version)]
struct Args {
    /// Bind address
    #[arg(long, env = "RELAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// HTTP and WebSocket port
    #[arg(short, long, env = "RELAY_PORT", default_value_t = 9091)]
    port: u16,

    /// Bearer token required on command routes. Unset disables auth.
    #[arg(long, env = "RELAY_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Default wait for a plugin reply, in milliseconds
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    request_timeout_ms: u64,

    /// Outbound frames buffered per plugin connection
    #[arg(long, env = "RELAY_MAX_SEND_QUEUE", default_value_t = 256)]
    max_send_queue: usize,

    #[arg(long, env = "RELAY_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Drop connections silent for this long
    #[arg(long, env = "RELAY_CLIENT_TIMEOUT_SECS", default_value_t = 90)]
    client_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit JSON log lines
    #[arg(long, env = "RELAY_LOG_JSON")]
    log_json: bool,

    /// Enables `analyze` requests
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    anthropic_api_key: Option<String>,

    #[arg(long, env = "RELAY_SUMMARY_MODEL")]
    summary_model: Option<String>,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            auth_token: self.auth_token.clone().map(SecretString::from),
            max_send_queue: self.max_send_queue,
            request_timeout_ms: self.request_timeout_ms,
            heartbeat_interval_secs: self.heartbeat_secs,
            client_timeout_secs: self.client_timeout_secs,
            ..ServerConfig::default()
        }
    }

    fn summarizer(&self) -> anyhow::Result<Option<Arc<dyn Summarizer>>> {
        let Some(key) = self.anthropic_api_key.clone().filter(|k| !k.is_empty()) else {
            return Ok(None);
        };
        let mut config = SummarizerConfig::new(SecretString::from(key));
        if let Some(model) = &self.summary_model {
            config.model = model.clone();
        }
        let summarizer =
            AnthropicSummarizer::new(config).context("failed to build summarizer client")?;
        tracing::info!(model = summarizer.model(), "analysis enabled");
        Ok(Some(Arc::new(summarizer)))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_telemetry(&TelemetryConfig {
        log_level: parse_level(&args.log_level)?,
        json: args.log_json,
        ..TelemetryConfig::default()
    })?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting design-relay");

    let summarizer = args.summarizer()?;
    let handle = relay_server::start(args.server_config(), summarizer)
        .await
        .with_context(|| format!("failed to bind {}:{}", args.host, args.port))?;

    tracing::info!(port = handle.port, "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    handle.shutdown().await;
    tracing::info!("relay stopped");
    Ok(())
}
