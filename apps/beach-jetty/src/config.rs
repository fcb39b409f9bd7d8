use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::acceptor::DEFAULT_GREETING;
use crate::cli::{ConsoleArgs, ReapArgs, ServeArgs, StoreArgs};
use crate::control_plane::{MemoryControlPlane, RedisControlPlane, SharedControlPlane};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// In-process tree; only visible to this process.
    Memory,
    Redis { url: String, prefix: String },
}

impl StoreConfig {
    pub fn is_shared(&self) -> bool {
        matches!(self, StoreConfig::Redis { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            StoreConfig::Memory => "memory".to_string(),
            StoreConfig::Redis { url, prefix } => format!("{} (prefix {})", url, prefix),
        }
    }

    pub async fn open(&self) -> Result<SharedControlPlane> {
        match self {
            StoreConfig::Memory => Ok(MemoryControlPlane::new()),
            StoreConfig::Redis { url, prefix } => {
                let store = RedisControlPlane::new(url, prefix)
                    .await
                    .with_context(|| format!("failed to connect to control plane at {}", url))?;
                Ok(Arc::new(store))
            }
        }
    }
}

impl TryFrom<StoreArgs> for StoreConfig {
    type Error = anyhow::Error;

    fn try_from(args: StoreArgs) -> Result<Self> {
        let store = args.store.trim();
        if store.eq_ignore_ascii_case("memory") {
            return Ok(StoreConfig::Memory);
        }
        if store.starts_with("redis://") || store.starts_with("rediss://") {
            return Ok(StoreConfig::Redis {
                url: store.to_string(),
                prefix: args.store_prefix,
            });
        }
        bail!("unsupported control plane store: {}", args.store)
    }
}

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub tcp_listen: SocketAddr,
    pub http_listen: SocketAddr,
    pub store: StoreConfig,
    pub greeting: String,
    /// `None` disables the periodic reaper.
    pub reap_interval: Option<Duration>,
    pub settle: Duration,
    pub console: bool,
    pub templates: PathBuf,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServeArgs> for ServeConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self> {
        let tcp_listen = parse_addr(&args.tcp_listen, "tcp")?;
        let http_listen = parse_addr(&args.http_listen, "http")?;
        Ok(ServeConfig {
            tcp_listen,
            http_listen,
            store: StoreConfig::try_from(args.store)?,
            greeting: args
                .greeting
                .unwrap_or_else(|| DEFAULT_GREETING.to_string()),
            reap_interval: (args.reap_interval_secs > 0)
                .then(|| Duration::from_secs(args.reap_interval_secs)),
            settle: Duration::from_secs(args.settle_secs),
            console: args.console,
            templates: PathBuf::from(args.templates),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub store: StoreConfig,
    pub templates: PathBuf,
    pub output_timeout: Duration,
    pub settle: Duration,
}

impl TryFrom<ConsoleArgs> for ConsoleConfig {
    type Error = anyhow::Error;

    fn try_from(args: ConsoleArgs) -> Result<Self> {
        Ok(ConsoleConfig {
            store: shared_store(args.store, "console")?,
            templates: PathBuf::from(args.templates),
            output_timeout: Duration::from_secs(args.timeout_secs),
            settle: Duration::from_secs(args.settle_secs),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReapConfig {
    pub store: StoreConfig,
    pub settle: Duration,
}

impl TryFrom<ReapArgs> for ReapConfig {
    type Error = anyhow::Error;

    fn try_from(args: ReapArgs) -> Result<Self> {
        Ok(ReapConfig {
            store: shared_store(args.store, "reap")?,
            settle: Duration::from_secs(args.settle_secs),
        })
    }
}

fn parse_addr(raw: &str, which: &str) -> Result<SocketAddr> {
    raw.parse()
        .with_context(|| format!("invalid {} listen address: {}", which, raw))
}

/// Out-of-process commands cannot see another process's memory store.
fn shared_store(args: StoreArgs, command: &str) -> Result<StoreConfig> {
    let store = StoreConfig::try_from(args)?;
    if !store.is_shared() {
        bail!(
            "`{}` needs a shared control plane; pass --store redis://...",
            command
        );
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_args(store: &str) -> StoreArgs {
        StoreArgs {
            store: store.to_string(),
            store_prefix: "jetty:".to_string(),
        }
    }

    fn serve_args() -> ServeArgs {
        ServeArgs {
            tcp_listen: "127.0.0.1:8081".to_string(),
            http_listen: "127.0.0.1:5005".to_string(),
            store: store_args("memory"),
            greeting: None,
            reap_interval_secs: 0,
            settle_secs: 2,
            console: false,
            shutdown_grace_secs: 1,
            templates: "command_templates.json".to_string(),
        }
    }

    #[test_timeout::timeout]
    fn serve_defaults_convert() {
        let config = ServeConfig::try_from(serve_args()).unwrap();
        assert_eq!(config.store, StoreConfig::Memory);
        assert_eq!(config.greeting, DEFAULT_GREETING);
        assert!(config.reap_interval.is_none());
        assert_eq!(config.settle, Duration::from_secs(2));
    }

    #[test_timeout::timeout]
    fn bad_listen_address_is_rejected() {
        let mut args = serve_args();
        args.tcp_listen = "not-an-address".to_string();
        let err = ServeConfig::try_from(args).unwrap_err();
        assert!(err.to_string().contains("invalid tcp listen address"));
    }

    #[test_timeout::timeout]
    fn unknown_store_is_rejected() {
        assert!(StoreConfig::try_from(store_args("postgres://db")).is_err());
        assert_eq!(
            StoreConfig::try_from(store_args("redis://localhost:6379")).unwrap(),
            StoreConfig::Redis {
                url: "redis://localhost:6379".to_string(),
                prefix: "jetty:".to_string(),
            }
        );
    }

    #[test_timeout::timeout]
    fn console_needs_a_shared_store() {
        let args = ConsoleArgs {
            store: store_args("memory"),
            templates: "t.json".to_string(),
            timeout_secs: 10,
            settle_secs: 2,
        };
        assert!(ConsoleConfig::try_from(args).is_err());

        let args = ReapArgs {
            store: store_args("redis://localhost:6379"),
            settle_secs: 2,
        };
        assert!(ReapConfig::try_from(args).unwrap().store.is_shared());
    }
}
