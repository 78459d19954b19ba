//! Server configuration: listen addresses, TLS material, worker sizing.
//!
//! The configuration is immutable once built. TLS credentials are loaded a
//! single time here; certificate rotation requires a restart.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Errors surfaced while assembling a [`ServerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid listen address '{0}': expected host:port")]
    InvalidAddress(String),
    #[error("secure health check requires a loaded cert chain and private key")]
    MissingTlsMaterial,
}

/// Parse a `host:port` string into a socket address.
pub fn parse_address(value: &str) -> Result<SocketAddr, ConfigError> {
    if !value.contains(':') {
        return Err(ConfigError::InvalidAddress(value.to_string()));
    }
    value
        .parse::<SocketAddr>()
        .map_err(|_| ConfigError::InvalidAddress(value.to_string()))
}

/// PEM encoded certificate chain plus private key, held in memory.
#[derive(Clone)]
pub struct TlsMaterial {
    pub cert_chain: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key bytes stay out of logs.
        f.debug_struct("TlsMaterial")
            .field("cert_chain_len", &self.cert_chain.len())
            .field("private_key_len", &self.private_key.len())
            .finish()
    }
}

/// Immutable runtime configuration for a callout server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub secure_address: SocketAddr,
    pub plaintext_address: Option<SocketAddr>,
    pub health_check_address: Option<SocketAddr>,
    pub secure_health_check: bool,
    pub tls: Option<TlsMaterial>,
    pub server_thread_count: usize,
    pub num_processes: usize,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        // Default construction never fails: no TLS paths, no secure health check.
        ServerConfigBuilder::default().build().unwrap()
    }
}

/// Builder for [`ServerConfig`]. Credential files are read once in
/// [`build`](ServerConfigBuilder::build); an unreadable path downgrades the
/// features that needed it rather than failing, except for the secure health
/// check which has no insecure fallback.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    secure_address: Option<SocketAddr>,
    plaintext_address: Option<SocketAddr>,
    disable_plaintext: bool,
    health_check_address: Option<SocketAddr>,
    combined_health_check: bool,
    secure_health_check: bool,
    cert_chain: Option<Vec<u8>>,
    cert_chain_path: Option<PathBuf>,
    private_key: Option<Vec<u8>>,
    private_key_path: Option<PathBuf>,
    server_thread_count: Option<usize>,
    num_processes: Option<usize>,
    shutdown_grace: Option<Duration>,
}

impl ServerConfigBuilder {
    /// Bind address of the TLS gRPC listener. Defaults to `0.0.0.0:443`.
    pub fn secure_address(mut self, addr: SocketAddr) -> Self {
        self.secure_address = Some(addr);
        self
    }

    /// Bind address of the cleartext gRPC listener. Defaults to `0.0.0.0:8080`.
    pub fn plaintext_address(mut self, addr: SocketAddr) -> Self {
        self.plaintext_address = Some(addr);
        self
    }

    /// Do not serve cleartext gRPC at all.
    pub fn disable_plaintext(mut self, disable: bool) -> Self {
        self.disable_plaintext = disable;
        self
    }

    /// Bind address of the health-check listener. Defaults to `0.0.0.0:80`.
    pub fn health_check_address(mut self, addr: SocketAddr) -> Self {
        self.health_check_address = Some(addr);
        self
    }

    /// Skip the separate health-check listener; the gRPC listener is assumed
    /// to satisfy external liveness probes.
    pub fn combined_health_check(mut self, combined: bool) -> Self {
        self.combined_health_check = combined;
        self
    }

    /// Serve the health check over TLS with the loaded credentials.
    pub fn secure_health_check(mut self, secure: bool) -> Self {
        self.secure_health_check = secure;
        self
    }

    /// In-memory PEM certificate chain. Takes precedence over a path.
    pub fn cert_chain(mut self, pem: Vec<u8>) -> Self {
        self.cert_chain = Some(pem);
        self
    }

    pub fn cert_chain_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_chain_path = Some(path.into());
        self
    }

    /// In-memory PEM private key. Takes precedence over a path.
    pub fn private_key(mut self, pem: Vec<u8>) -> Self {
        self.private_key = Some(pem);
        self
    }

    pub fn private_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }

    /// Tokio worker threads per process. Defaults to 2.
    pub fn server_thread_count(mut self, count: usize) -> Self {
        self.server_thread_count = Some(count);
        self
    }

    /// Number of gRPC worker processes. Defaults to the CPU count; 1 disables
    /// multi-process serving.
    pub fn num_processes(mut self, count: usize) -> Self {
        self.num_processes = Some(count);
        self
    }

    /// Bound on draining in-flight streams during shutdown. Defaults to 10s.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    pub fn build(self) -> Result<ServerConfig, ConfigError> {
        let secure_address = self
            .secure_address
            .unwrap_or_else(|| "0.0.0.0:443".parse().unwrap());
        let plaintext_address = if self.disable_plaintext {
            None
        } else {
            Some(
                self.plaintext_address
                    .unwrap_or_else(|| "0.0.0.0:8080".parse().unwrap()),
            )
        };
        let health_check_address = if self.combined_health_check {
            None
        } else {
            Some(
                self.health_check_address
                    .unwrap_or_else(|| "0.0.0.0:80".parse().unwrap()),
            )
        };

        let cert_chain = load_pem("cert chain", self.cert_chain, self.cert_chain_path);
        let private_key = load_pem("private key", self.private_key, self.private_key_path);
        let tls = match (cert_chain, private_key) {
            (Some(cert_chain), Some(private_key)) => Some(TlsMaterial {
                cert_chain,
                private_key,
            }),
            (None, None) => None,
            _ => {
                warn!("only one of cert chain and private key is available, secure listeners disabled");
                None
            }
        };

        if self.secure_health_check && tls.is_none() {
            return Err(ConfigError::MissingTlsMaterial);
        }

        let num_processes = match self.num_processes {
            Some(n) if n >= 1 => n,
            Some(_) => {
                warn!("num_processes must be at least 1, defaulting to 1 worker");
                1
            }
            None => num_cpus::get(),
        };

        Ok(ServerConfig {
            secure_address,
            plaintext_address,
            health_check_address,
            secure_health_check: self.secure_health_check,
            tls,
            server_thread_count: self.server_thread_count.unwrap_or(2),
            num_processes,
            shutdown_grace: self.shutdown_grace.unwrap_or(Duration::from_secs(10)),
        })
    }
}

/// In-memory bytes win over a path. A path that cannot be read logs a warning
/// and yields nothing, downgrading whichever listener needed the material.
fn load_pem(what: &str, inline: Option<Vec<u8>>, path: Option<PathBuf>) -> Option<Vec<u8>> {
    if inline.is_some() {
        return inline;
    }
    let path = path?;
    match std::fs::read(&path) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!("unable to read {what} from {}: {err}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_host_port() {
        assert_eq!(
            parse_address("0.0.0.0:443").unwrap(),
            "0.0.0.0:443".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_address("[::1]:8080").unwrap(),
            "[::1]:8080".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in ["", "no-port", "1.2.3.4:", "1.2.3.4:notaport", ":80"] {
            assert!(parse_address(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.secure_address, "0.0.0.0:443".parse().unwrap());
        assert_eq!(cfg.plaintext_address, Some("0.0.0.0:8080".parse().unwrap()));
        assert_eq!(cfg.health_check_address, Some("0.0.0.0:80".parse().unwrap()));
        assert_eq!(cfg.server_thread_count, 2);
        assert!(cfg.tls.is_none());
        assert!(!cfg.secure_health_check);
    }

    #[test]
    fn disable_flags_remove_listeners() {
        let cfg = ServerConfig::builder()
            .disable_plaintext(true)
            .combined_health_check(true)
            .build()
            .unwrap();
        assert!(cfg.plaintext_address.is_none());
        assert!(cfg.health_check_address.is_none());
    }

    #[test]
    fn inline_pem_wins_over_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"from-file").unwrap();
        let cfg = ServerConfig::builder()
            .cert_chain(b"inline-cert".to_vec())
            .cert_chain_path(file.path())
            .private_key(b"inline-key".to_vec())
            .build()
            .unwrap();
        let tls = cfg.tls.unwrap();
        assert_eq!(tls.cert_chain, b"inline-cert");
        assert_eq!(tls.private_key, b"inline-key");
    }

    #[test]
    fn unreadable_path_disables_tls() {
        let cfg = ServerConfig::builder()
            .cert_chain_path("/nonexistent/chain.pem")
            .private_key_path("/nonexistent/key.pem")
            .build()
            .unwrap();
        assert!(cfg.tls.is_none());
    }

    #[test]
    fn secure_health_check_requires_tls() {
        let err = ServerConfig::builder()
            .secure_health_check(true)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingTlsMaterial));
    }

    #[test]
    fn partial_tls_material_is_dropped() {
        let cfg = ServerConfig::builder()
            .cert_chain(b"cert-only".to_vec())
            .build()
            .unwrap();
        assert!(cfg.tls.is_none());
    }
}
