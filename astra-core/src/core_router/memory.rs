//! In-memory links
//!
//! `session_pair` runs a real Noise handshake over an in-process duplex
//! pipe, so sessions can be exercised without sockets. `FailAfter`
//! wraps a sink and drops the link after a fixed number of frames.

use super::frame::Frame;
use super::session::{FrameSink, Session};
use super::TransportError;
use crate::core_identity::StaticKeypair;
use async_trait::async_trait;
use tracing::debug;

const PIPE_CAPACITY: usize = 256 * 1024;

/// Two connected sessions; `initiator` dials, `responder` answers
pub async fn session_pair(
    initiator: &StaticKeypair,
    responder: &StaticKeypair,
) -> Result<(Session, Session), TransportError> {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    let (sa, sb) = tokio::join!(Session::initiate(a, initiator), Session::respond(b, responder));
    Ok((sa?, sb?))
}

/// Sink that closes the underlying link once `limit` frames went through
pub struct FailAfter<S> {
    inner: S,
    remaining: usize,
}

impl<S: FrameSink> FailAfter<S> {
    pub fn new(inner: S, limit: usize) -> Self {
        FailAfter { inner, remaining: limit }
    }
}

#[async_trait]
impl<S: FrameSink> FrameSink for FailAfter<S> {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.remaining == 0 {
            debug!(kind = frame.kind(), "injected link failure");
            self.inner.close().await?;
            return Err(TransportError::Closed);
        }
        self.remaining -= 1;
        self.inner.send(frame).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_router::session::FrameSource;

    #[tokio::test]
    async fn test_fail_after_drops_link() {
        let (sa, sb) =
            session_pair(&StaticKeypair::generate(), &StaticKeypair::generate()).await.unwrap();
        let (writer, _reader) = sa.split();
        let (_peer_writer, mut peer_reader) = sb.split();
        let mut sink = FailAfter::new(writer, 2);

        for _ in 0..2 {
            sink.send(Frame::PairConfirm { accepted: true }).await.unwrap();
        }
        assert!(matches!(
            sink.send(Frame::PairConfirm { accepted: true }).await,
            Err(TransportError::Closed)
        ));

        assert!(peer_reader.receive().await.is_ok());
        assert!(peer_reader.receive().await.is_ok());
        assert!(matches!(peer_reader.receive().await, Err(TransportError::Closed)));
    }
}
