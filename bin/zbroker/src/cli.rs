use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

use zbroker_observability::LogFormat;
use zbroker_tunnel::ConnectionRole;

/// Reverse-tunnel HTTP broker
#[derive(Parser)]
#[command(name = "zbroker")]
#[command(version, about = "Reverse-tunnel HTTP broker")]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "ZBROKER_CONFIG", global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Enable verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub(crate) verbose: u8,

    /// Log output format; defaults to pretty on a terminal, JSON otherwise
    #[arg(long, value_enum, global = true)]
    pub(crate) log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the public-facing broker server
    Server {
        /// HTTP bind address
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Tunnel bind address
        #[arg(long)]
        tunnel_bind: Option<SocketAddr>,

        /// Accept rules (JSON) filtering public requests
        #[arg(short, long)]
        accept: Option<PathBuf>,
    },

    /// Run the broker client inside the private network
    Client {
        /// Broker token
        #[arg(long, env = "BROKER_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Server HTTP URL, used for streamed response uploads
        #[arg(long, env = "BROKER_SERVER_URL")]
        server_url: Option<String>,

        /// Server tunnel URL; derived from the server URL when absent
        #[arg(long)]
        tunnel_url: Option<String>,

        /// Accept rules (JSON) filtering tunnel requests
        #[arg(short, long)]
        accept: Option<PathBuf>,

        /// Connection type selecting per-type rules and plugins
        #[arg(long)]
        connection_type: Option<String>,

        /// HA role announced to the server
        #[arg(long, value_enum)]
        role: Option<RoleArg>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum LogFormatArg {
    Pretty,
    Json,
    Compact,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Compact => LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum RoleArg {
    Primary,
    Secondary,
}

impl From<RoleArg> for ConnectionRole {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::Primary => ConnectionRole::Primary,
            RoleArg::Secondary => ConnectionRole::Secondary,
        }
    }
}
