//! Command-line and environment configuration.
//!
//! Every flag has an `AGENTSCOPE_*` environment fallback. `--data-dir` is
//! resolved separately by `paths::init_data_dir`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::frame::MAX_PAYLOAD_BYTES;
use crate::router::HeaderLimits;

#[derive(Debug, Parser)]
#[command(name = "agentscope", version, about = "Local monitor for autonomous agent sessions")]
pub struct Cli {
    /// Address to listen on (HTTP and WebSocket share the port)
    #[arg(long, env = "AGENTSCOPE_BIND", default_value = "127.0.0.1:4317")]
    pub bind: SocketAddr,

    /// Request path that accepts WebSocket upgrades
    #[arg(long, env = "AGENTSCOPE_WS_PATH", default_value = "/ws", value_parser = parse_ws_path)]
    pub ws_path: String,

    /// Data directory (logs). Defaults to AGENTSCOPE_DATA_DIR or ~/.agentscope
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Largest frame or reassembled message accepted, in bytes
    #[arg(long, env = "AGENTSCOPE_MAX_MESSAGE_BYTES", default_value_t = MAX_PAYLOAD_BYTES)]
    pub max_message_bytes: usize,

    /// Largest request head accepted before answering 431
    #[arg(long, env = "AGENTSCOPE_MAX_HEADER_BYTES", default_value_t = 16 * 1024)]
    pub max_header_bytes: usize,

    /// Seconds a client may take to send its request head
    #[arg(long, env = "AGENTSCOPE_HEADER_TIMEOUT_SECS", default_value_t = 10)]
    pub header_timeout_secs: u64,

    /// Seconds to wait for connections to finish on shutdown
    #[arg(long, env = "AGENTSCOPE_SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    pub shutdown_timeout_secs: u64,
}

fn parse_ws_path(raw: &str) -> Result<String, String> {
    if raw.starts_with('/') {
        Ok(raw.to_string())
    } else {
        Err(format!("path must start with '/': {raw}"))
    }
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            ws_path: self.ws_path.clone(),
            max_message_bytes: self.max_message_bytes,
            header_limits: HeaderLimits {
                max_bytes: self.max_header_bytes,
                timeout: Duration::from_secs(self.header_timeout_secs),
            },
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

/// Runtime settings shared by the listener and every connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub ws_path: String,
    pub max_message_bytes: usize,
    pub header_limits: HeaderLimits,
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 4317)),
            ws_path: "/ws".to_string(),
            max_message_bytes: MAX_PAYLOAD_BYTES,
            header_limits: HeaderLimits::default(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "agentscope",
            "--bind",
            "127.0.0.1:9000",
            "--ws-path",
            "/agents",
            "--max-message-bytes",
            "1024",
            "--header-timeout-secs",
            "2",
        ])
        .unwrap();
        let config = cli.server_config();
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.ws_path, "/agents");
        assert_eq!(config.max_message_bytes, 1024);
        assert_eq!(config.header_limits.timeout, Duration::from_secs(2));
        assert_eq!(config.header_limits.max_bytes, 16 * 1024);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn ws_path_must_be_absolute() {
        assert!(Cli::try_parse_from(["agentscope", "--ws-path", "ws"]).is_err());
    }
}
