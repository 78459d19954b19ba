//! Server lifecycle supervisor: binds the secure/plaintext gRPC listeners
//! and the health-check endpoint, serves until shutdown, and drains
//! gracefully.
//!
//! `run()` blocks the calling thread and owns its tokio runtime, so it can
//! fork worker processes before any runtime exists (see `workers`).
//! `shutdown()` may be called from any thread and is idempotent; SIGINT and
//! SIGTERM take the same path.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::Routes;
use tonic::transport::server::Server;
use tonic::transport::{Identity, ServerTlsConfig};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::extauthz::{AuthzHandler, AuthzService, AuthorizationServer};
use crate::extproc::{ExtProcHandler, ExtProcService, ExternalProcessorServer};
use crate::health;
use crate::network::{NetworkExternalProcessorServer, NetworkHandler, NetworkService};

/// Errors surfaced while starting or running a [`CalloutServer`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid TLS material: {0}")]
    InvalidTlsMaterial(String),
    #[error("grpc transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("no listener could be bound")]
    NoListeners,
    #[error("server has been shut down and cannot be restarted")]
    AlreadyClosed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Created,
    Starting,
    Serving,
    Stopping,
    Closed,
}

/// Which listeners this process serves. The multi-process supervisor keeps
/// the health check for itself and gives workers the gRPC ports.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Role {
    All,
    GrpcOnly,
    HealthOnly,
}

impl Role {
    fn grpc(self) -> bool {
        matches!(self, Role::All | Role::GrpcOnly)
    }

    fn health(self) -> bool {
        matches!(self, Role::All | Role::HealthOnly)
    }
}

/// Addresses actually bound, observable once the server is serving. With
/// port 0 in the configuration this is the only way to learn the real port.
#[derive(Clone, Debug, Default)]
pub struct BoundAddresses {
    pub secure: Option<SocketAddr>,
    pub plaintext: Option<SocketAddr>,
    pub health_check: Option<SocketAddr>,
}

/// Server wrapper managing the listeners and processing lifecycle for one
/// callout service.
pub struct CalloutServer {
    config: ServerConfig,
    routes: Routes,
    state: Mutex<State>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    bound: Mutex<BoundAddresses>,
}

impl CalloutServer {
    /// Serve an ext-proc handler.
    pub fn ext_proc<H: ExtProcHandler>(config: ServerConfig, handler: H) -> Self {
        Self::from_routes(
            config,
            Routes::new(ExternalProcessorServer::new(ExtProcService::new(handler))),
        )
    }

    /// Serve an ext-authz handler.
    pub fn ext_authz<H: AuthzHandler>(config: ServerConfig, handler: H) -> Self {
        Self::from_routes(
            config,
            Routes::new(AuthorizationServer::new(AuthzService::new(handler))),
        )
    }

    /// Serve an L4 network handler.
    pub fn network<H: NetworkHandler>(config: ServerConfig, handler: H) -> Self {
        Self::from_routes(
            config,
            Routes::new(NetworkExternalProcessorServer::new(NetworkService::new(
                handler,
            ))),
        )
    }

    /// Serve arbitrary routes; the escape hatch for co-hosting several
    /// callout services on the same listeners.
    pub fn from_routes(config: ServerConfig, routes: Routes) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            routes,
            state: Mutex::new(State::Created),
            shutdown_tx: Arc::new(shutdown_tx),
            bound: Mutex::new(BoundAddresses::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Snapshot of the addresses bound so far.
    pub fn local_addrs(&self) -> BoundAddresses {
        self.bound.lock().unwrap().clone()
    }

    /// Start all requested listeners and serve until shutdown; blocking.
    pub fn run(&self) -> Result<(), ServerError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                State::Created | State::Stopping => *state = State::Starting,
                State::Closed => return Err(ServerError::AlreadyClosed),
                State::Starting | State::Serving => {
                    warn!("server is already running");
                    return Ok(());
                }
            }
        }

        let result = if self.config.num_processes > 1 {
            self.run_multi_process()
        } else {
            self.run_single_process()
        };

        self.shutdown_tx.send_replace(true);
        *self.state.lock().unwrap() = State::Closed;
        info!("callout server shutdown complete");
        result
    }

    /// Signal every listener (and worker process) to stop. Idempotent; safe
    /// from signal handlers and other threads.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                State::Stopping | State::Closed => {
                    debug!("shutdown already in progress");
                }
                _ => *state = State::Stopping,
            }
        }
        self.shutdown_tx.send_replace(true);
    }

    fn run_single_process(&self) -> Result<(), ServerError> {
        let runtime = self.build_runtime()?;
        runtime.block_on(self.serve_until_shutdown(Role::All, false))
    }

    pub(crate) fn build_runtime(&self) -> Result<tokio::runtime::Runtime, ServerError> {
        Ok(tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.server_thread_count.max(1))
            .enable_all()
            .thread_name("callout-server")
            .build()?)
    }

    /// Bind this role's listeners and serve them until the shutdown signal,
    /// then drain within the configured grace period.
    pub(crate) async fn serve_until_shutdown(
        &self,
        role: Role,
        reuseport: bool,
    ) -> Result<(), ServerError> {
        self.spawn_signal_listener();

        let mut join = JoinSet::new();
        let mut bound = BoundAddresses::default();

        if role.grpc() {
            match &self.config.tls {
                Some(tls) => match bind_listener(self.config.secure_address, reuseport) {
                    Ok(listener) => {
                        let addr = listener.local_addr()?;
                        let identity = Identity::from_pem(&tls.cert_chain, &tls.private_key);
                        let mut server = Server::builder()
                            .tls_config(ServerTlsConfig::new().identity(identity))?;
                        let router = server.add_routes(self.routes.clone());
                        let signal = self.shutdown_signal();
                        join.spawn(async move {
                            if let Err(err) = router
                                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
                                .await
                            {
                                warn!("secure gRPC listener terminated: {err}");
                            }
                        });
                        bound.secure = Some(addr);
                        info!("gRPC callout server (secure) listening on {addr}");
                    }
                    Err(err) => {
                        warn!(
                            "failed to bind secure address {}: {err}",
                            self.config.secure_address
                        );
                    }
                },
                None => warn!("TLS material not loaded, secure gRPC listener disabled"),
            }

            if let Some(plaintext_address) = self.config.plaintext_address {
                match bind_listener(plaintext_address, reuseport) {
                    Ok(listener) => {
                        let addr = listener.local_addr()?;
                        let mut server = Server::builder();
                        let router = server.add_routes(self.routes.clone());
                        let signal = self.shutdown_signal();
                        join.spawn(async move {
                            if let Err(err) = router
                                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
                                .await
                            {
                                warn!("plaintext gRPC listener terminated: {err}");
                            }
                        });
                        bound.plaintext = Some(addr);
                        info!("gRPC callout server (plaintext) listening on {addr}");
                    }
                    Err(err) => warn!("failed to bind plaintext address {plaintext_address}: {err}"),
                }
            }

            if bound.secure.is_none() && bound.plaintext.is_none() {
                return Err(ServerError::NoListeners);
            }
        }

        if role.health() {
            if let Some(health_check_address) = self.config.health_check_address {
                let acceptor = if self.config.secure_health_check {
                    // Config construction guarantees material is present;
                    // unparseable material downgrades the feature.
                    match self.config.tls.as_ref().map(health::tls_acceptor) {
                        Some(Ok(acceptor)) => Some(acceptor),
                        Some(Err(err)) => {
                            warn!("secure health check disabled: {err}");
                            None
                        }
                        None => {
                            warn!("secure health check requested without TLS material, disabled");
                            None
                        }
                    }
                } else {
                    None
                };
                let secure = acceptor.is_some();
                match bind_listener(health_check_address, false) {
                    Ok(listener) => {
                        let addr = listener.local_addr()?;
                        join.spawn(health::serve(
                            listener,
                            acceptor,
                            self.shutdown_tx.subscribe(),
                        ));
                        bound.health_check = Some(addr);
                        info!(
                            "{} health check server bound to {addr}",
                            if secure { "HTTPS" } else { "HTTP" }
                        );
                    }
                    Err(err) => {
                        warn!("failed to bind health check address {health_check_address}: {err}")
                    }
                }
            }
        }

        if role.grpc() && join.is_empty() {
            return Err(ServerError::NoListeners);
        }

        *self.bound.lock().unwrap() = bound;
        {
            let mut state = self.state.lock().unwrap();
            if *state == State::Starting {
                *state = State::Serving;
            }
        }

        // Serve until the shutdown signal, or until every listener stopped
        // on its own.
        let mut rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = rx.wait_for(|&stop| stop) => break,
                next = join.join_next(), if !join.is_empty() => {
                    if let Some(Err(err)) = next {
                        warn!("listener task failed: {err}");
                    }
                    if join.is_empty() {
                        break;
                    }
                }
                else => break,
            }
        }

        // Drain in-flight streams within the grace period, then abort.
        let grace = self.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while let Some(res) = join.join_next().await {
                if let Err(err) = res {
                    warn!("listener task failed during drain: {err}");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("grace period of {grace:?} expired, aborting remaining streams");
            join.abort_all();
            while join.join_next().await.is_some() {}
        }
        Ok(())
    }

    fn shutdown_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown_tx.subscribe();
        async move {
            let _ = rx.wait_for(|&stop| stop).await;
        }
    }

    fn spawn_signal_listener(&self) {
        let tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_termination_signal().await;
            info!("termination signal received, shutting down");
            tx.send_replace(true);
        });
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!("unable to install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Bind a TCP listener, optionally with kernel port sharing so several
/// worker processes can accept on the same address.
pub(crate) fn bind_listener(addr: SocketAddr, reuseport: bool) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(unix)]
    if reuseport {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuseport;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}
