//! nlbd — the NLB daemon.
//!
//! Single binary that assembles all load balancer subsystems:
//! - Protocol inspector + L4 listener
//! - Traffic router and heartbeat sweeper
//! - Rate limiter
//! - Autoscaler
//! - Blue/green controller
//! - Registration/management API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! nlbd run --config /etc/nlb/nlb.toml
//! nlbd check-config --config /etc/nlb/nlb.toml
//! nlbd inspect 2a310d0a24340d0a50494e470d0a
//! ```

mod daemon;
mod proxy;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use nlb_core::NlbConfig;
use nlb_inspector::{InspectError, ProtocolInspector};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,nlbd=debug,nlb=debug";

#[derive(Parser)]
#[command(name = "nlbd", about = "Protocol-aware network load balancer")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the load balancer.
    Run {
        /// Path to nlb.toml. Built-in defaults are used when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `server.bind` (L4 listener).
        #[arg(long)]
        bind: Option<String>,

        /// Override `server.api_bind` (management API).
        #[arg(long)]
        api_bind: Option<String>,
    },
    /// Parse and validate a config file, then print it normalized.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
    /// Classify a hex-encoded connection prefix.
    Inspect {
        /// Bytes as hex, e.g. `474554202f20` for "GET / ".
        hex: String,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            bind,
            api_bind,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(api_bind) = api_bind {
                config.server.api_bind = api_bind;
            }
            daemon::run(config).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            config.validate().context("invalid configuration")?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Command::Inspect { hex } => {
            println!("{}", inspect(&hex)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<NlbConfig> {
    match path {
        Some(path) => NlbConfig::from_file(path)
            .with_context(|| format!("load config from {}", path.display())),
        None => Ok(NlbConfig::default()),
    }
}

/// Describe what the inspector makes of `hex`.
fn inspect(hex: &str) -> anyhow::Result<String> {
    let cleaned: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&cleaned).context("decode hex input")?;
    let inspector = ProtocolInspector::default();
    let report = match inspector.classify(&bytes) {
        Ok(c) => serde_json::json!({
            "bytes": bytes.len(),
            "protocol": c.protocol,
            "confidence": c.confidence,
        }),
        Err(InspectError::Incomplete {
            available,
            required,
        }) => serde_json::json!({
            "bytes": available,
            "incomplete": true,
            "required": required,
        }),
        Err(InspectError::Unknown) => serde_json::json!({
            "bytes": bytes.len(),
            "protocol": null,
        }),
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspect_reports_protocol() {
        let out = inspect("2a310d0a24340d0a50494e470d0a").unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["protocol"], "redis");
    }

    #[test]
    fn inspect_reports_incomplete_prefix() {
        // "GE" could still become "GET ".
        let v: serde_json::Value = serde_json::from_str(&inspect("4745").unwrap()).unwrap();
        assert_eq!(v["incomplete"], true);
        assert_eq!(v["required"], 4);
    }

    #[test]
    fn inspect_rejects_bad_hex() {
        assert!(inspect("zz").is_err());
    }

    #[test]
    fn cli_parses_run_overrides() {
        let cli = Cli::try_parse_from([
            "nlbd",
            "run",
            "--bind",
            "127.0.0.1:9000",
            "--log-json",
        ])
        .unwrap();
        assert!(cli.log_json);
        assert!(matches!(
            cli.command,
            Command::Run { bind: Some(ref b), config: None, .. } if b == "127.0.0.1:9000"
        ));
    }

    #[test]
    fn missing_config_path_uses_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.server.bind, NlbConfig::default().server.bind);
    }
}
