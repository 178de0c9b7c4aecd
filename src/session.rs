//! Per-exchange session tracking
//!
//! A [`ProxySession`] follows one request from the moment the proxy starts
//! talking to the backend until the exchange is over:
//!
//! ```text
//! Connecting ──► Forwarding ──► Closed
//!                    │             ▲
//!                    └─► Tunneling ┘
//! ```
//!
//! Any state may jump to `Closed`. Dropping a session that was never closed
//! counts as a client-side cancellation and is logged at debug level only.

use http_body_util::combinators::BoxBody;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the backend connection / response head
    Connecting,
    /// Relaying a request/response exchange
    Forwarding,
    /// Raw byte relay after a successful upgrade
    Tunneling,
    Closed,
}

impl SessionState {
    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Forwarding) | (Forwarding, Tunneling) | (Connecting | Forwarding | Tunneling, Closed)
        )
    }
}

#[derive(Debug)]
pub struct ProxySession {
    request_id: String,
    state: SessionState,
    started: Instant,
}

impl ProxySession {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            state: SessionState::Connecting,
            started: Instant::now(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. Returns false, leaving the state as is, if the
    /// transition is not allowed.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if !self.state.can_advance_to(next) {
            warn!(
                request_id = %self.request_id,
                from = ?self.state,
                to = ?next,
                "Ignoring invalid session transition"
            );
            return false;
        }
        trace!(request_id = %self.request_id, from = ?self.state, to = ?next, "Session transition");
        self.state = next;
        true
    }

    /// Close the session, recording why
    pub fn close(&mut self, reason: &str) {
        if self.state == SessionState::Closed {
            return;
        }
        let previous = self.state;
        self.state = SessionState::Closed;
        debug!(
            request_id = %self.request_id,
            from = ?previous,
            reason,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Session closed"
        );
    }
}

impl Drop for ProxySession {
    fn drop(&mut self) {
        self.close("cancelled");
    }
}

/// Response body that keeps its session open until the last frame is sent.
///
/// If the client goes away mid-body hyper drops this value, which drops the
/// backend body and with it the backend connection.
pub struct SessionBody {
    inner: BoxBody<Bytes, hyper::Error>,
    session: ProxySession,
}

impl SessionBody {
    /// Wrap `inner`. A body that is already at its end (HEAD, 204, 304) may
    /// never be polled, so its session is closed here.
    pub fn new(inner: BoxBody<Bytes, hyper::Error>, mut session: ProxySession) -> Self {
        if inner.is_end_stream() {
            session.close("complete");
        }
        Self { inner, session }
    }
}

impl Body for SessionBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) => this.session.close("complete"),
            Poll::Ready(Some(Err(e))) => {
                debug!(request_id = %this.session.request_id(), error = %e, "Backend body error");
                this.session.close("backend error");
            }
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Empty, Full};

    #[test]
    fn test_plain_lifecycle() {
        let mut session = ProxySession::new("req-1");
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.advance(SessionState::Forwarding));
        session.close("complete");
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_tunnel_lifecycle() {
        let mut session = ProxySession::new("req-2");
        assert!(session.advance(SessionState::Forwarding));
        assert!(session.advance(SessionState::Tunneling));
        assert!(session.advance(SessionState::Closed));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut session = ProxySession::new("req-3");
        assert!(!session.advance(SessionState::Tunneling));
        assert_eq!(session.state(), SessionState::Connecting);

        session.close("error");
        assert!(!session.advance(SessionState::Forwarding));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_connecting_can_close_directly() {
        let mut session = ProxySession::new("req-4");
        assert!(session.advance(SessionState::Closed));
    }

    #[tokio::test]
    async fn test_session_body_relays_frames_unchanged() {
        let inner = Full::new(Bytes::from_static(b"hello"))
            .map_err(|never| match never {})
            .boxed();
        let mut session = ProxySession::new("req-5");
        session.advance(SessionState::Forwarding);

        let body = SessionBody::new(inner, session);
        assert_eq!(body.size_hint().exact(), Some(5));

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello");
    }

    #[test]
    fn test_empty_body_closes_session_without_polling() {
        let inner = Empty::<Bytes>::new().map_err(|never| match never {}).boxed();
        let mut session = ProxySession::new("req-6");
        session.advance(SessionState::Forwarding);

        let body = SessionBody::new(inner, session);
        assert!(body.is_end_stream());
        assert_eq!(body.session.state(), SessionState::Closed);
    }

    #[test]
    fn test_pending_body_keeps_session_open() {
        let inner = Full::new(Bytes::from_static(b"data"))
            .map_err(|never| match never {})
            .boxed();
        let mut session = ProxySession::new("req-7");
        session.advance(SessionState::Forwarding);

        let body = SessionBody::new(inner, session);
        assert_eq!(body.session.state(), SessionState::Forwarding);
    }
}
