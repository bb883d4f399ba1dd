//! High-level client API.

use crate::connection::{Call, ClientConfig, Connection};
use crate::error::ClientError;
use seqrpc_protocol::{write_option, CodecRegistry, NegotiationError, Opt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};

/// RPC client multiplexing many calls over one connection.
///
/// Share it behind an `Arc` to issue calls from several tasks. Dropping the
/// client stops its receive loop and releases the connection.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Connects to `addr` using the default codec registry.
    ///
    /// `opt` may be `None` (default option) or leave the codec tag empty; the
    /// magic number is always set to the protocol constant.
    pub async fn dial(
        addr: impl ToSocketAddrs,
        opt: Option<Opt>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        Self::dial_with_registry(addr, opt, &CodecRegistry::default(), config).await
    }

    /// Connects to `addr`, resolving the codec in `registry`.
    pub async fn dial_with_registry(
        addr: impl ToSocketAddrs,
        opt: Option<Opt>,
        registry: &CodecRegistry,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let opt = Opt::normalized(opt);
        if !registry.contains(&opt.codec_type) {
            return Err(NegotiationError::UnknownCodec(opt.codec_type).into());
        }

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                tracing::debug!("Connection timeout");
                ClientError::ConnectTimeout(config.connect_timeout)
            })??;
        stream.set_nodelay(true).ok();

        if let Ok(peer) = stream.peer_addr() {
            tracing::debug!("Connected to {}, negotiating {}", peer, opt.codec_type);
        }
        Self::with_stream(stream, Some(opt), registry, config).await
    }

    /// Negotiates over an already-established stream.
    pub async fn with_stream<S>(
        mut stream: S,
        opt: Option<Opt>,
        registry: &CodecRegistry,
        config: ClientConfig,
    ) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let opt = Opt::normalized(opt);
        let codec = opt.validate(registry)?;

        write_option(&mut stream, &opt).await?;

        let (reader, writer) = seqrpc_protocol::split(stream, codec);
        Ok(Self {
            conn: Connection::start(reader, writer, opt, config),
        })
    }

    /// Sends a call without waiting for its response.
    ///
    /// Resolves once the request is written (or has failed); the returned
    /// [`Call`] yields the outcome.
    pub async fn go<A, R>(&self, service_method: &str, args: &A) -> Call<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send + 'static,
    {
        self.conn.send(service_method, args).await
    }

    /// Invokes `service_method` and waits for the reply.
    ///
    /// Honors the configured call timeout.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, ClientError>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send + 'static,
    {
        let call = self.go(service_method, args).await;
        match self.conn.config().call_timeout {
            Some(limit) => call.done_within(&self.conn, limit).await,
            None => call.done().await,
        }
    }

    /// Invokes `service_method`, giving up after `limit`.
    ///
    /// A timeout affects only this call; the connection stays usable.
    pub async fn call_with_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        limit: Duration,
    ) -> Result<R, ClientError>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send + 'static,
    {
        self.go(service_method, args)
            .await
            .done_within(&self.conn, limit)
            .await
    }

    /// Closes the connection and fails every pending call.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns whether new calls can be sent.
    pub fn is_available(&self) -> bool {
        self.conn.is_available()
    }

    /// Returns the number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.conn.pending_count()
    }

    /// Returns the negotiated option.
    pub fn opt(&self) -> &Opt {
        self.conn.opt()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.conn.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqrpc_protocol::{accept_option, split, CodecError, CodecType, Header};
    use seqrpc_server::{Methods, Reply, Request, Server, ServerConfig, ServiceError};
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn methods() -> Methods {
        let mut methods = Methods::new();
        methods
            .register("User.Sum", |(a, b): (i32, i32)| Ok(a + b))
            .register("User.Sleep", |ms: u64| {
                std::thread::sleep(Duration::from_millis(ms));
                Ok(ms)
            });
        methods
    }

    async fn start_server(server: Server) -> (SocketAddr, Arc<Server>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(server);
        tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });
        (addr, server)
    }

    async fn dial(addr: SocketAddr) -> Client {
        Client::dial(addr, None, ClientConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_call() {
        let (addr, _server) = start_server(Server::new(ServerConfig::default(), methods())).await;
        let client = dial(addr).await;

        assert!(client.is_available());
        assert_eq!(client.opt().codec_type, CodecType::bincode());

        let sum: i32 = client.call("User.Sum", &(1i32, 2i32)).await.unwrap();
        assert_eq!(sum, 3);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_matches_sequence_number() {
        let service = |req: &Request| -> Result<Reply, ServiceError> {
            let _arg: String = req.args.decode()?;
            Ok(Reply::new(format!("rpc resp {}", req.seq())))
        };
        let (addr, _server) = start_server(Server::new(ServerConfig::default(), service)).await;
        let client = dial(addr).await;

        for i in 1..=3u64 {
            let call = client
                .go::<_, String>("User.Sum", &format!("rpc req {}", i))
                .await;
            assert_eq!(call.seq(), i);
            assert_eq!(call.service_method(), "User.Sum");
            assert_eq!(call.done().await.unwrap(), format!("rpc resp {}", i));
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_distinct_seqs() {
        let (addr, _server) = start_server(Server::new(ServerConfig::default(), methods())).await;
        let client = Arc::new(dial(addr).await);

        const N: usize = 32;
        let mut tasks = Vec::with_capacity(N);
        for i in 0..N {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let call = client.go::<_, i32>("User.Sum", &(i as i32, 0i32)).await;
                let seq = call.seq();
                let sum = call.done().await.unwrap();
                (seq, i as i32, sum)
            }));
        }

        let mut seqs = HashSet::new();
        for task in tasks {
            let (seq, expected, sum) = task.await.unwrap();
            assert_eq!(sum, expected);
            assert!(seqs.insert(seq));
        }
        let expected: HashSet<u64> = (1..=N as u64).collect();
        assert_eq!(seqs, expected);
    }

    #[tokio::test]
    async fn test_server_error() {
        let (addr, _server) = start_server(Server::new(ServerConfig::default(), methods())).await;
        let client = dial(addr).await;

        let err = client.call::<_, ()>("User.Nope", &()).await.unwrap_err();
        assert!(matches!(err, ClientError::Server(_)));
        assert!(err.to_string().contains("can't find method"));

        // Application errors are scoped to the call.
        assert!(client.is_available());
        let sum: i32 = client.call("User.Sum", &(2i32, 2i32)).await.unwrap();
        assert_eq!(sum, 4);
    }

    #[tokio::test]
    async fn test_reply_type_mismatch() {
        let (addr, _server) = start_server(Server::new(ServerConfig::default(), methods())).await;
        let client = dial(addr).await;

        let err = client
            .call::<_, String>("User.Sum", &(1i32, 2i32))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ReadBody(_)));
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (addr, _server) = start_server(Server::new(ServerConfig::default(), methods())).await;
        let client = dial(addr).await;

        let mut calls = Vec::new();
        for _ in 0..3 {
            calls.push(client.go::<_, u64>("User.Sleep", &300u64).await);
        }
        assert_eq!(client.pending_count(), 3);

        client.close().await.unwrap();
        assert!(!client.is_available());

        for call in calls {
            let err = call.done().await.unwrap_err();
            assert!(err.is_shutdown(), "unexpected error: {}", err);
        }
        assert_eq!(client.pending_count(), 0);

        assert!(matches!(client.close().await, Err(ClientError::Shutdown)));
        let err = client.call::<_, i32>("User.Sum", &(1i32, 1i32)).await.unwrap_err();
        assert!(matches!(err, ClientError::Shutdown));
    }

    #[tokio::test]
    async fn test_server_drop_fails_in_flight_calls() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        // A peer that accepts two requests and then goes away without answering.
        let peer = tokio::spawn(async move {
            let mut server_io = server_io;
            let registry = CodecRegistry::default();
            let (_, codec) = accept_option(&mut server_io, &registry).await.unwrap();
            let (mut reader, writer) = split(server_io, codec);
            let first = reader.read_header().await.unwrap();
            let second = reader.read_header().await.unwrap();
            drop(writer);
            drop(reader);
            (first, second)
        });

        let client = Client::with_stream(
            client_io,
            None,
            &CodecRegistry::default(),
            ClientConfig::default(),
        )
        .await
        .unwrap();

        let first = client.go::<_, String>("User.Sum", &"rpc req 1").await;
        let second = client.go::<_, String>("User.Sum", &"rpc req 2").await;

        let (h1, h2): (Header, Header) = peer.await.unwrap();
        assert_eq!((h1.seq, h2.seq), (1, 2));

        for call in [first, second] {
            let err = call.done().await.unwrap_err();
            assert!(matches!(err, ClientError::ConnectionClosed), "unexpected error: {}", err);
        }
        assert!(!client.is_available());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_timeout_leaves_connection_usable() {
        let (addr, _server) = start_server(Server::new(ServerConfig::default(), methods())).await;
        let config = ClientConfig::default().with_call_timeout(Duration::from_millis(50));
        let client = Client::dial(addr, None, config).await.unwrap();

        let err = client.call::<_, u64>("User.Sleep", &300u64).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
        assert_eq!(client.pending_count(), 0);

        // Wait for the late response to arrive and be discarded.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(client.is_available());

        let sum: i32 = client.call("User.Sum", &(3i32, 4i32)).await.unwrap();
        assert_eq!(sum, 7);
    }

    #[tokio::test]
    async fn test_call_with_timeout_returns_fast_reply() {
        let (addr, _server) = start_server(Server::new(ServerConfig::default(), methods())).await;
        let client = dial(addr).await;

        let sum: i32 = client
            .call_with_timeout("User.Sum", &(1i32, 1i32), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(sum, 2);
    }

    #[tokio::test]
    async fn test_dial_unknown_codec() {
        // Rejected before any connection attempt, so no listener is needed.
        let result = Client::dial(
            "127.0.0.1:1",
            Some(Opt::with_codec("application/gob")),
            ClientConfig::default(),
        )
        .await;
        assert!(matches!(
            result,
            Err(ClientError::Negotiation(NegotiationError::UnknownCodec(_)))
        ));
    }

    #[tokio::test]
    async fn test_server_rejects_unregistered_codec() {
        // The client knows a codec the server does not.
        #[derive(Debug)]
        struct Alias;

        impl seqrpc_protocol::Codec for Alias {
            fn codec_type(&self) -> CodecType {
                CodecType::new("application/alias")
            }
            fn encode_header(
                &self,
                header: &Header,
            ) -> Result<Vec<u8>, seqrpc_protocol::CodecError> {
                seqrpc_protocol::BincodeCodec::new().encode_header(header)
            }
            fn decode_header(&self, bytes: &[u8]) -> Result<Header, seqrpc_protocol::CodecError> {
                seqrpc_protocol::BincodeCodec::new().decode_header(bytes)
            }
            fn encode_body(
                &self,
                body: &dyn erased_serde::Serialize,
            ) -> Result<Vec<u8>, seqrpc_protocol::CodecError> {
                seqrpc_protocol::BincodeCodec::new().encode_body(body)
            }
            fn decode_body(
                &self,
                bytes: &[u8],
                visit: seqrpc_protocol::BodyVisitor<'_>,
            ) -> Result<(), seqrpc_protocol::CodecError> {
                seqrpc_protocol::BincodeCodec::new().decode_body(bytes, visit)
            }
        }

        let (addr, server) = start_server(Server::new(ServerConfig::default(), methods())).await;
        let mut registry = CodecRegistry::default();
        registry.register(CodecType::new("application/alias"), || Arc::new(Alias));

        let client = Client::dial_with_registry(
            addr,
            Some(Opt::with_codec("application/alias")),
            &registry,
            ClientConfig::default(),
        )
        .await
        .unwrap();

        // The server hangs up after reading the option; the receive loop
        // notices and marks the client shut down.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!client.is_available());

        let err = client.call::<_, i32>("User.Sum", &(1i32, 1i32)).await.unwrap_err();
        assert!(matches!(err, ClientError::Shutdown));
        assert_eq!(
            server
                .stats()
                .errors_total
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    /// Stream whose reads never complete and whose writes fail once `broken`
    /// is set.
    struct BrokenPipe {
        broken: Arc<std::sync::atomic::AtomicBool>,
    }

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Pending
        }
    }

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            if self.broken.load(std::sync::atomic::Ordering::SeqCst) {
                std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
            } else {
                std::task::Poll::Ready(Ok(buf.len()))
            }
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_failure_shuts_connection_down() {
        let broken = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stream = BrokenPipe {
            broken: broken.clone(),
        };
        let client = Client::with_stream(
            stream,
            None,
            &CodecRegistry::default(),
            ClientConfig::default(),
        )
        .await
        .unwrap();

        // Written before the pipe breaks; waits for a reply that never comes.
        let in_flight = client.go::<_, i32>("User.Sum", &(1i32, 2i32)).await;
        assert_eq!(client.pending_count(), 1);

        broken.store(true, std::sync::atomic::Ordering::SeqCst);
        let failed = client.go::<_, i32>("User.Sum", &(3i32, 4i32)).await;
        assert_eq!(failed.seq(), 2);

        let err = failed.done().await.unwrap_err();
        assert!(matches!(err, ClientError::Codec(CodecError::Io(_))));

        let err = in_flight.done().await.unwrap_err();
        assert!(err.is_shutdown());
        assert_eq!(client.pending_count(), 0);
        assert!(!client.is_available());

        let err = client.call::<_, i32>("User.Sum", &(5i32, 6i32)).await.unwrap_err();
        assert!(matches!(err, ClientError::Shutdown));
    }

    #[tokio::test]
    async fn test_oversized_request_fails_only_that_call() {
        let (addr, _server) = start_server(Server::new(ServerConfig::default(), methods())).await;
        let client = dial(addr).await;

        let big = vec![0u8; seqrpc_protocol::MAX_FRAME_SIZE as usize + 1];
        let err = client.call::<_, i32>("User.Sum", &big).await.unwrap_err();
        assert!(matches!(err, ClientError::Codec(CodecError::Encode(_))));
        assert!(client.is_available());

        let sum: i32 = client.call("User.Sum", &(2i32, 2i32)).await.unwrap();
        assert_eq!(sum, 4);
    }
}
