//! Command-line surface for callout binaries, mapping onto the
//! [`ServerConfig`] builder.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{parse_address, ConfigError, ServerConfig, ServerConfigBuilder};

/// Common options accepted by every callout server binary.
#[derive(Parser, Debug, Default)]
pub struct ServerArgs {
    /// Address for the secure (TLS) server with format: "0.0.0.0:443"
    #[arg(long, value_parser = parse_address)]
    pub address: Option<std::net::SocketAddr>,

    /// Address for the plaintext server with format: "0.0.0.0:8080"
    #[arg(long, value_parser = parse_address)]
    pub plaintext_address: Option<std::net::SocketAddr>,

    /// Health check address for the server with format: "0.0.0.0:80"
    #[arg(long, value_parser = parse_address)]
    pub health_check_address: Option<std::net::SocketAddr>,

    /// Run a HTTPS health check rather than an HTTP one.
    #[arg(long)]
    pub secure_health_check: bool,

    /// Do not create a separate health check server.
    #[arg(long)]
    pub combined_health_check: bool,

    /// Disables the plaintext address of the callout server.
    #[arg(long)]
    pub disable_plaintext: bool,

    /// Path to the PEM certificate chain for secure connections.
    #[arg(long)]
    pub cert_chain_path: Option<PathBuf>,

    /// Path to the PEM private key for secure connections.
    #[arg(long)]
    pub private_key_path: Option<PathBuf>,

    /// Worker threads allocated to the grpc service per process.
    #[arg(long)]
    pub server_thread_count: Option<usize>,

    /// Number of gRPC worker processes; 1 disables multiprocessing.
    #[arg(long)]
    pub num_processes: Option<usize>,
}

impl ServerArgs {
    /// Fold the parsed arguments into a server configuration.
    pub fn to_config(&self) -> Result<ServerConfig, ConfigError> {
        let mut builder: ServerConfigBuilder = ServerConfig::builder()
            .secure_health_check(self.secure_health_check)
            .combined_health_check(self.combined_health_check)
            .disable_plaintext(self.disable_plaintext);
        if let Some(addr) = self.address {
            builder = builder.secure_address(addr);
        }
        if let Some(addr) = self.plaintext_address {
            builder = builder.plaintext_address(addr);
        }
        if let Some(addr) = self.health_check_address {
            builder = builder.health_check_address(addr);
        }
        if let Some(path) = &self.cert_chain_path {
            builder = builder.cert_chain_path(path);
        }
        if let Some(path) = &self.private_key_path {
            builder = builder.private_key_path(path);
        }
        if let Some(count) = self.server_thread_count {
            builder = builder.server_thread_count(count);
        }
        if let Some(count) = self.num_processes {
            builder = builder.num_processes(count);
        }
        builder.build()
    }
}

/// Install the default tracing subscriber; `RUST_LOG` overrides the filter.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
