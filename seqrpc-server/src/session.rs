//! Per-connection state tracking.

use seqrpc_protocol::CodecType;
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle of one server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the option line.
    Negotiating,
    /// Reading and dispatching requests.
    Serving,
    /// No more reads; waiting for in-flight handlers.
    Draining,
    /// Codec and connection released.
    Closed,
}

impl ConnState {
    /// Returns whether `next` is a legal successor of this state.
    pub fn can_advance_to(self, next: ConnState) -> bool {
        matches!(
            (self, next),
            (ConnState::Negotiating, ConnState::Serving)
                | (ConnState::Negotiating, ConnState::Closed)
                | (ConnState::Serving, ConnState::Draining)
                | (ConnState::Draining, ConnState::Closed)
        )
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Negotiating => "NEGOTIATING",
            ConnState::Serving => "SERVING",
            ConnState::Draining => "DRAINING",
            ConnState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// A server-side connection session.
#[derive(Debug)]
pub struct Session {
    /// Remote peer, for log lines.
    pub peer: String,
    state: ConnState,
    codec_type: Option<CodecType>,
    request_count: u64,
    created_at: Instant,
}

impl Session {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            state: ConnState::Negotiating,
            codec_type: None,
            request_count: 0,
            created_at: Instant::now(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Moves to `next`.
    pub fn advance(&mut self, next: ConnState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!("[{}] {} -> {}", self.peer, self.state, next);
        self.state = next;
    }

    /// Records the negotiated codec and starts serving.
    pub fn negotiated(&mut self, codec_type: CodecType) {
        self.codec_type = Some(codec_type);
        self.advance(ConnState::Serving);
    }

    pub fn codec_type(&self) -> Option<&CodecType> {
        self.codec_type.as_ref()
    }

    /// Counts one dispatched request.
    pub fn record_request(&mut self) -> u64 {
        self.request_count += 1;
        self.request_count
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let mut session = Session::new("127.0.0.1:5000");
        assert_eq!(session.state(), ConnState::Negotiating);
        assert!(session.codec_type().is_none());

        session.negotiated(CodecType::bincode());
        assert_eq!(session.state(), ConnState::Serving);
        assert_eq!(session.codec_type(), Some(&CodecType::bincode()));

        assert_eq!(session.record_request(), 1);
        assert_eq!(session.record_request(), 2);
        assert_eq!(session.request_count(), 2);

        session.advance(ConnState::Draining);
        session.advance(ConnState::Closed);
        assert_eq!(session.state(), ConnState::Closed);
    }

    #[test]
    fn test_transitions() {
        assert!(ConnState::Negotiating.can_advance_to(ConnState::Closed));
        assert!(ConnState::Serving.can_advance_to(ConnState::Draining));
        assert!(!ConnState::Serving.can_advance_to(ConnState::Closed));
        assert!(!ConnState::Closed.can_advance_to(ConnState::Serving));
        assert!(!ConnState::Draining.can_advance_to(ConnState::Serving));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnState::Draining.to_string(), "DRAINING");
    }
}
