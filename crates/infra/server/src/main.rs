//! DXP events relay.
//!
//! Usage: `dxp-events [config.toml]`. Reads one JSON event per line from
//! stdin and emits it on the bus until EOF or Ctrl-C.

use dxp_server::{AppConfig, AppContext, load_config};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => load_config(&path)?,
        None => AppConfig::from_env()?,
    };

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let app = AppContext::init_http(config).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (mut emitted, mut rejected) = (0u64, 0u64);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let accepted = match serde_json::from_str(line) {
                    Ok(raw) => app.events().emit_raw(raw).await,
                    Err(e) => {
                        tracing::warn!("Skipping malformed line: {}", e);
                        false
                    }
                };
                if accepted { emitted += 1 } else { rejected += 1 }
            }
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    tracing::info!(emitted, rejected, "Input closed");
    app.shutdown().await;
    Ok(())
}
