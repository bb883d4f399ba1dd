//! Connection management.
//!
//! A [`Connection`] owns the write half of a negotiated stream and the table of
//! calls waiting for a response. One background task owns the read half and
//! routes every response header to the call registered under its sequence
//! number.
//!
//! Two locks guard the connection. The send lock (async) is held for the whole
//! of a request write so frames never interleave. The state lock (sync) guards
//! the sequence counter, the pending table and the closing/shutdown flags and is
//! never held across I/O. When both are needed the send lock is taken first.

use crate::error::ClientError;
use bytes::Bytes;
use parking_lot::Mutex;
use seqrpc_protocol::{Codec, CodecError, CodecReader, CodecWriter, Header, Opt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Limit for establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Limit for each `call`. `None` waits for the response indefinitely.
    pub call_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            call_timeout: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

/// Destination for one call's outcome.
///
/// Completing consumes the box, so a call can only be resolved once.
trait Completion: Send {
    fn complete_with_body(self: Box<Self>, codec: &Arc<dyn Codec>, body: Bytes);

    fn complete_with_error(self: Box<Self>, err: ClientError);
}

/// Completion that decodes the reply into `R` and hands it to a `Call<R>`.
struct ReplySlot<R> {
    tx: oneshot::Sender<Result<R, ClientError>>,
}

impl<R> Completion for ReplySlot<R>
where
    R: DeserializeOwned + Send + 'static,
{
    fn complete_with_body(self: Box<Self>, codec: &Arc<dyn Codec>, body: Bytes) {
        let result = codec
            .decode_as::<R>(&body)
            .map_err(|e| ClientError::ReadBody(e.to_string()));
        let _ = self.tx.send(result);
    }

    fn complete_with_error(self: Box<Self>, err: ClientError) {
        let _ = self.tx.send(Err(err));
    }
}

/// An in-flight invocation.
///
/// Await [`Call::done`] for the outcome. Dropping a `Call` does not cancel the
/// request; its response is discarded when it arrives.
#[derive(Debug)]
pub struct Call<R> {
    seq: u64,
    service_method: String,
    rx: oneshot::Receiver<Result<R, ClientError>>,
    _reply: PhantomData<fn() -> R>,
}

impl<R> Call<R> {
    /// Sequence number assigned at send time; 0 if the call never registered.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Waits for the reply or the error that resolved this call.
    pub async fn done(self) -> Result<R, ClientError> {
        self.rx.await.unwrap_or(Err(ClientError::Shutdown))
    }

    /// Like [`Call::done`], but gives up after `limit`.
    ///
    /// On timeout the call is withdrawn from the pending table, so its response
    /// is discarded if it arrives later. If the response won the race it is
    /// returned instead of the timeout.
    pub(crate) async fn done_within(
        mut self,
        conn: &Connection,
        limit: Duration,
    ) -> Result<R, ClientError> {
        match tokio::time::timeout(limit, &mut self.rx).await {
            Ok(result) => result.unwrap_or(Err(ClientError::Shutdown)),
            Err(_) => {
                if conn.remove_call(self.seq).is_some() {
                    tracing::debug!(
                        "rpc client: {} (seq={}) timed out after {:?}",
                        self.service_method,
                        self.seq,
                        limit
                    );
                    return Err(ClientError::Timeout(limit));
                }
                self.done().await
            }
        }
    }
}

/// Why the receive loop stopped.
#[derive(Debug)]
enum Termination {
    /// `close` was called.
    Closed,
    /// The server went away.
    Disconnected,
    /// Reading from the connection failed.
    Failed(String),
}

impl Termination {
    fn from_read_error(err: CodecError) -> Self {
        match err {
            CodecError::Eof | CodecError::UnexpectedEof { .. } => Termination::Disconnected,
            other => Termination::Failed(other.to_string()),
        }
    }

    fn error(&self) -> ClientError {
        match self {
            Termination::Closed => ClientError::Shutdown,
            Termination::Disconnected => ClientError::ConnectionClosed,
            Termination::Failed(msg) => ClientError::Transport(msg.clone()),
        }
    }
}

/// Writer plus the header reused for every request.
struct Sender {
    writer: CodecWriter,
    header: Header,
}

struct State {
    seq: u64,
    pending: HashMap<u64, Box<dyn Completion>>,
    closing: bool,
    shutdown: bool,
}

/// A negotiated connection to a seqrpc server.
pub struct Connection {
    opt: Opt,
    config: ClientConfig,
    sender: tokio::sync::Mutex<Sender>,
    state: Mutex<State>,
    stop: broadcast::Sender<()>,
}

impl Connection {
    /// Wraps a negotiated reader/writer pair and starts the receive loop.
    pub(crate) fn start(
        reader: CodecReader,
        writer: CodecWriter,
        opt: Opt,
        config: ClientConfig,
    ) -> Arc<Self> {
        let (stop, stop_rx) = broadcast::channel(1);
        let conn = Arc::new(Self {
            opt,
            config,
            sender: tokio::sync::Mutex::new(Sender {
                writer,
                header: Header::default(),
            }),
            state: Mutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            stop,
        });
        tokio::spawn(conn.clone().receive(reader, stop_rx));
        conn
    }

    pub fn opt(&self) -> &Opt {
        &self.opt
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Registers a call and writes its request.
    ///
    /// Never fails directly: every failure is delivered through the returned
    /// call.
    pub(crate) async fn send<A, R>(&self, service_method: &str, args: &A) -> Call<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut call = Call {
            seq: 0,
            service_method: service_method.to_string(),
            rx,
            _reply: PhantomData,
        };

        let mut sender = self.sender.lock().await;

        let seq = match self.register_call(Box::new(ReplySlot { tx })) {
            Ok(seq) => seq,
            Err(slot) => {
                slot.complete_with_error(ClientError::Shutdown);
                return call;
            }
        };
        call.seq = seq;

        let Sender { writer, header } = &mut *sender;
        header.service_method.clear();
        header.service_method.push_str(service_method);
        header.seq = seq;
        header.error.clear();

        tracing::debug!("rpc client: sending {} (seq={})", service_method, seq);
        if let Err(e) = writer.write(header, args).await {
            tracing::debug!("rpc client: write {} (seq={}) failed: {}", service_method, seq, e);
            let terminal = e.is_terminal().then(|| Termination::Failed(e.to_string()));
            // The receive loop may have swept the call already.
            if let Some(slot) = self.remove_call(seq) {
                slot.complete_with_error(ClientError::Codec(e));
            }
            if let Some(termination) = terminal {
                tracing::warn!("rpc client: connection unusable after write failure");
                // The send lock is held, so sweep directly.
                self.fail_pending(termination);
                self.abort();
            }
        }
        call
    }

    fn register_call(&self, slot: Box<dyn Completion>) -> Result<u64, Box<dyn Completion>> {
        let mut state = self.state.lock();
        if state.closing || state.shutdown {
            return Err(slot);
        }
        let seq = state.seq;
        state.pending.insert(seq, slot);
        state.seq += 1;
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<Box<dyn Completion>> {
        self.state.lock().pending.remove(&seq)
    }

    /// Reads responses until the connection ends or `close` is called.
    async fn receive(self: Arc<Self>, mut reader: CodecReader, mut stop: broadcast::Receiver<()>) {
        let termination = loop {
            let header = tokio::select! {
                result = reader.read_header() => match result {
                    Ok(header) => header,
                    Err(e) => {
                        if !e.is_eof() {
                            tracing::warn!("rpc client: receive error: {}", e);
                        }
                        break Termination::from_read_error(e);
                    }
                },
                _ = stop.recv() => break Termination::Closed,
            };

            match self.remove_call(header.seq) {
                None => {
                    // Timed out, or the write failed partway through.
                    tracing::debug!("rpc client: no pending call for seq={}", header.seq);
                    reader.discard_body();
                }
                Some(slot) if header.is_error() => {
                    reader.discard_body();
                    slot.complete_with_error(ClientError::Server(header.error));
                }
                Some(slot) => match reader.take_body() {
                    Ok(body) => slot.complete_with_body(reader.codec(), body),
                    Err(e) => slot.complete_with_error(ClientError::ReadBody(e.to_string())),
                },
            }
        };

        tracing::debug!("rpc client: receive loop stopped: {:?}", termination);
        self.terminate_calls(termination).await;
    }

    /// Marks the connection shut down and fails every pending call.
    async fn terminate_calls(&self, termination: Termination) {
        let _sender = self.sender.lock().await;
        self.fail_pending(termination);
    }

    /// Sweep body of [`Connection::terminate_calls`]; the caller holds the
    /// send lock.
    fn fail_pending(&self, termination: Termination) {
        let pending = {
            let mut state = self.state.lock();
            state.shutdown = true;
            std::mem::take(&mut state.pending)
        };

        if !pending.is_empty() {
            tracing::debug!("rpc client: failing {} pending calls", pending.len());
        }
        for slot in pending.into_values() {
            slot.complete_with_error(termination.error());
        }
    }

    /// Closes the connection. A second call returns [`ClientError::Shutdown`].
    pub async fn close(&self) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock();
            if state.closing {
                return Err(ClientError::Shutdown);
            }
            state.closing = true;
        }

        let _ = self.stop.send(());
        if let Err(e) = self.sender.lock().await.writer.close().await {
            tracing::debug!("rpc client: error closing connection: {}", e);
        }
        Ok(())
    }

    /// Stops the receive loop without marking the connection closed.
    pub(crate) fn abort(&self) {
        let _ = self.stop.send(());
    }

    /// Returns whether new calls can be sent.
    pub fn is_available(&self) -> bool {
        let state = self.state.lock();
        !state.closing && !state.shutdown
    }

    /// Returns the number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}
