//! TCP server implementation.

use crate::error::{ServerError, ServiceError};
use crate::service::{Args, Request, Service};
use crate::session::{ConnState, Session};
use seqrpc_protocol::{
    accept_option, CodecError, CodecReader, CodecRegistry, CodecWriter, Header, DEFAULT_PORT,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Per-request handling limit. `None` waits for the service indefinitely.
    pub handle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_connections: 1000,
            handle_timeout: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Sets the per-request handling limit.
    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = Some(timeout);
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Everything a connection task needs, detached from the `Server` borrow.
#[derive(Clone)]
struct ConnContext {
    registry: Arc<CodecRegistry>,
    service: Arc<dyn Service>,
    stats: Arc<ServerStats>,
    handle_timeout: Option<Duration>,
}

type SharedWriter = Arc<Mutex<CodecWriter>>;

/// RPC server.
pub struct Server {
    config: ServerConfig,
    registry: Arc<CodecRegistry>,
    service: Arc<dyn Service>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a server using the default codec registry.
    pub fn new(config: ServerConfig, service: impl Service) -> Self {
        Self::with_registry(config, CodecRegistry::default(), service)
    }

    /// Creates a server accepting the codecs in `registry`.
    pub fn with_registry(
        config: ServerConfig,
        registry: CodecRegistry,
        service: impl Service,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry: Arc::new(registry),
            service: Arc::new(service),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    fn context(&self) -> ConnContext {
        ConnContext {
            registry: self.registry.clone(),
            service: self.service.clone(),
            stats: self.stats.clone(),
            handle_timeout: self.config.handle_timeout,
        }
    }

    /// Binds the configured address and runs the accept loop.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the accept loop on an already-bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on {} (codecs: {:?})",
            listener.local_addr()?,
            self.registry.types()
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            if let Err(e) = stream.set_nodelay(true) {
                                tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let ctx = self.context();
                            let conn_shutdown = self.shutdown.subscribe();
                            tokio::spawn(async move {
                                let _ = Self::run_connection(stream, addr.to_string(), ctx, conn_shutdown).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Serves one already-established connection on the current task.
    ///
    /// Returns once the peer disconnects and every dispatched request has been
    /// answered. Works with any byte stream, which is how tests drive the
    /// server over in-memory pipes.
    pub async fn serve_conn<S>(&self, stream: S, peer: impl Into<String>) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Self::run_connection(stream, peer.into(), self.context(), self.shutdown.subscribe()).await
    }

    /// Connection wrapper that keeps the statistics honest.
    async fn run_connection<S>(
        stream: S,
        peer: String,
        ctx: ConnContext,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let stats = ctx.stats.clone();
        let result = Self::handle_connection(stream, Session::new(peer.clone()), ctx, shutdown).await;

        if let Err(ref e) = result {
            tracing::debug!("Connection {} error: {}", peer, e);
            stats.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        tracing::info!("Client disconnected: {}", peer);
        result
    }

    /// Negotiates the codec, then serves requests until the peer goes away.
    async fn handle_connection<S>(
        mut stream: S,
        mut session: Session,
        ctx: ConnContext,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tracing::info!("Client connected: {}", session.peer);

        let codec = match accept_option(&mut stream, &ctx.registry).await {
            Ok((opt, codec)) => {
                session.negotiated(opt.codec_type);
                codec
            }
            Err(e) => {
                tracing::warn!("[{}] rpc server: options error: {}", session.peer, e);
                session.advance(ConnState::Closed);
                return Err(e.into());
            }
        };

        let (reader, writer) = seqrpc_protocol::split(stream, codec);
        Self::serve_codec(reader, writer, session, ctx, shutdown).await
    }

    /// Request loop for one negotiated connection.
    async fn serve_codec(
        mut reader: CodecReader,
        writer: CodecWriter,
        mut session: Session,
        ctx: ConnContext,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let peer: Arc<str> = Arc::from(session.peer.as_str());
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let mut handlers = JoinSet::new();
        let mut read_error = None;

        loop {
            let result = tokio::select! {
                result = reader.read_header() => result,
                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", peer);
                    break;
                }
            };

            // Reap finished handlers so the set stays small on long connections.
            while handlers.try_join_next().is_some() {}

            let header = match result {
                Ok(header) => header,
                Err(CodecError::Eof) => {
                    tracing::debug!("[{}] Connection closed by client", peer);
                    break;
                }
                Err(e) => {
                    tracing::warn!("[{}] rpc server: read header error: {}", peer, e);
                    read_error = Some(e);
                    break;
                }
            };

            let body = reader.take_body().unwrap_or_default();
            let count = session.record_request();
            ctx.stats.requests_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "[{}] Request #{}: {} (seq={})",
                peer,
                count,
                header.service_method,
                header.seq
            );

            let request = Request::new(header, Args::new(reader.codec().clone(), body));
            handlers.spawn(Self::handle_request(
                request,
                ctx.service.clone(),
                writer.clone(),
                ctx.handle_timeout,
                peer.clone(),
            ));
        }

        session.advance(ConnState::Draining);
        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("[{}] Request task failed: {}", peer, e);
            }
        }

        if let Err(e) = writer.lock().await.close().await {
            tracing::debug!("[{}] Error closing connection: {}", peer, e);
        }
        session.advance(ConnState::Closed);
        tracing::debug!(
            "[{}] Served {} requests in {:?}",
            peer,
            session.request_count(),
            session.age()
        );

        match read_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Runs the service for one request and writes exactly one response.
    async fn handle_request(
        request: Request,
        service: Arc<dyn Service>,
        writer: SharedWriter,
        handle_timeout: Option<Duration>,
        peer: Arc<str>,
    ) {
        let mut header = request.header.clone();
        let task = tokio::task::spawn_blocking(move || service.call(&request));

        let joined = match handle_timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => Ok(Err(ServiceError::Timeout(limit))),
            },
            None => task.await,
        };
        let result = joined.unwrap_or_else(|e| {
            tracing::warn!(
                "[{}] Service task for {} (seq={}) failed: {}",
                peer,
                header.service_method,
                header.seq,
                e
            );
            Err(ServiceError::Panicked)
        });

        match result {
            Ok(reply) => Self::send_response(&writer, &header, reply.body(), &peer).await,
            Err(e) => {
                tracing::debug!("[{}] {} (seq={}) failed: {}", peer, header.service_method, header.seq, e);
                header.error = e.to_string();
                Self::send_response(&writer, &header, &(), &peer).await
            }
        }
    }

    /// Writes one response under the connection's write lock.
    async fn send_response(
        writer: &Mutex<CodecWriter>,
        header: &Header,
        body: &(dyn erased_serde::Serialize + Sync),
        peer: &str,
    ) {
        let mut writer = writer.lock().await;
        let result = match writer.write(header, body).await {
            Err(CodecError::Encode(msg)) => {
                let mut header = header.clone();
                header.error = format!("rpc server: encode reply err: {}", msg);
                writer.write(&header, &()).await
            }
            other => other,
        };
        if let Err(e) = result {
            tracing::warn!("[{}] rpc server: write response error: {}", peer, e);
        }
    }

    /// Initiates server shutdown.
    ///
    /// Stops the accept loop and every connection's read loop; in-flight
    /// requests are still answered before their connections close.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }
}
