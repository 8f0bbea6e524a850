/*
  Session - Noise XX session over any byte stream

  Upgrades a raw connection into an encrypted, authenticated frame
  channel.

  Workflow:
  1. Noise XX handshake (-> e / <- e, ee, s, es / -> s, se); static keys
     are exchanged inside the handshake, no prior trust needed.
  2. The remote static key and the handshake hash are kept for trust
     checks and pairing short codes.
  3. The stream is split: `SessionWriter` encrypts outgoing frames, a
     reader task decrypts incoming frames into a channel that
     `SessionReader` drains. Both halves share the transport state.

  Notes:
  A frame larger than one Noise message is sent as several chunks, each
  prefixed with a continuation flag. Chunks of one frame are never
  interleaved with another frame because the writer is not shared.
*/

use super::frame::{Frame, Hello};
use super::transport_manager::{read_message, write_message, MAX_MESSAGE_LEN};
use super::TransportError;
use crate::core_identity::{StaticKeypair, TrustKey};
use crate::core_store::model::ReplicaId;
use crate::metrics;
use async_trait::async_trait;
use snow::{Builder, TransportState};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Largest encoded frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const TAG_LEN: usize = 16;
const CHUNK_LEN: usize = MAX_MESSAGE_LEN - TAG_LEN - 1;
const CHUNK_MORE: u8 = 1;
const CHUNK_LAST: u8 = 0;

type SharedTransport = Arc<Mutex<TransportState>>;

/// Sending half of a frame channel
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the channel; the peer sees `Closed` after draining
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Receiving half of a frame channel
#[async_trait]
pub trait FrameSource: Send {
    async fn receive(&mut self) -> Result<Frame, TransportError>;
}

fn lock_error() -> TransportError {
    TransportError::Handshake("transport state poisoned".to_string())
}

pub struct SessionWriter {
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    transport: SharedTransport,
    buf: Vec<u8>,
}

impl SessionWriter {
    fn encrypt(&mut self, message: &[u8]) -> Result<usize, TransportError> {
        let mut transport = self.transport.lock().map_err(|_| lock_error())?;
        Ok(transport.write_message(message, &mut self.buf)?)
    }
}

#[async_trait]
impl FrameSink for SessionWriter {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let plaintext = frame.encode()?;
        if plaintext.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(plaintext.len()));
        }

        let chunk_count = plaintext.len().div_ceil(CHUNK_LEN).max(1);
        for index in 0..chunk_count {
            let start = index * CHUNK_LEN;
            let end = (start + CHUNK_LEN).min(plaintext.len());
            let flag = if index + 1 == chunk_count { CHUNK_LAST } else { CHUNK_MORE };

            let mut message = Vec::with_capacity(end - start + 1);
            message.push(flag);
            message.extend_from_slice(&plaintext[start..end]);

            let len = self.encrypt(&message)?;
            write_message(&mut self.writer, &self.buf[..len]).await?;
        }

        metrics::record_frame_sent();
        trace!(kind = frame.kind(), bytes = plaintext.len(), "frame sent");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Receiving half; frames are decrypted by a background task
pub struct SessionReader {
    frames: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    task: JoinHandle<()>,
}

impl SessionReader {
    fn spawn<R>(mut reader: R, transport: SharedTransport) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, frames) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_MESSAGE_LEN];
            loop {
                let result = read_frame(&mut reader, &transport, &mut buf).await;
                let failed = result.is_err();
                if tx.send(result).is_err() || failed {
                    break;
                }
            }
        });
        SessionReader { frames, task }
    }
}

async fn read_frame<R>(
    reader: &mut R,
    transport: &SharedTransport,
    buf: &mut [u8],
) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut plaintext = Vec::new();
    loop {
        let message = read_message(reader).await?;
        let len = {
            let mut transport = transport.lock().map_err(|_| lock_error())?;
            transport.read_message(&message, buf)?
        };
        let (flag, chunk) = match buf[..len].split_first() {
            Some((flag, chunk)) => (*flag, chunk),
            None => return Err(TransportError::Codec("empty chunk".to_string())),
        };
        plaintext.extend_from_slice(chunk);
        if plaintext.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(plaintext.len()));
        }
        if flag == CHUNK_LAST {
            break;
        }
    }
    Frame::decode(&plaintext)
}

#[async_trait]
impl FrameSource for SessionReader {
    async fn receive(&mut self) -> Result<Frame, TransportError> {
        let frame = self.frames.recv().await.unwrap_or(Err(TransportError::Closed))?;
        metrics::record_frame_received();
        trace!(kind = frame.kind(), "frame received");
        Ok(frame)
    }
}

impl Drop for SessionReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// An established Noise session
pub struct Session {
    remote_static: TrustKey,
    handshake_hash: Vec<u8>,
    writer: SessionWriter,
    reader: SessionReader,
}

impl Session {
    /// Run the initiator side of the handshake over `stream`
    pub async fn initiate<S>(stream: S, keypair: &StaticKeypair) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::handshake(stream, keypair, true).await
    }

    /// Run the responder side of the handshake over `stream`
    pub async fn respond<S>(stream: S, keypair: &StaticKeypair) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::handshake(stream, keypair, false).await
    }

    async fn handshake<S>(
        stream: S,
        keypair: &StaticKeypair,
        initiator: bool,
    ) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
        let builder = Builder::new(NOISE_PARAMS.parse()?).local_private_key(keypair.secret_bytes());
        let mut noise =
            if initiator { builder.build_initiator()? } else { builder.build_responder()? };

        let mut buf = vec![0u8; MAX_MESSAGE_LEN];
        let mut payload = vec![0u8; MAX_MESSAGE_LEN];
        // XX: initiator writes messages 1 and 3, responder writes message 2
        for step in 0..3 {
            let our_turn = (step % 2 == 0) == initiator;
            if our_turn {
                let len = noise.write_message(&[], &mut buf)?;
                write_message(&mut writer, &buf[..len]).await?;
            } else {
                let message = read_message(&mut reader).await?;
                noise.read_message(&message, &mut payload)?;
            }
        }

        let remote_static = noise
            .get_remote_static()
            .ok_or_else(|| TransportError::Handshake("peer sent no static key".to_string()))
            .and_then(|key| {
                TrustKey::from_slice(key).map_err(|e| TransportError::Handshake(e.to_string()))
            })?;
        let handshake_hash = noise.get_handshake_hash().to_vec();
        let transport = Arc::new(Mutex::new(noise.into_transport_mode()?));

        debug!(remote = %remote_static.fingerprint(), initiator, "noise handshake complete");
        Ok(Session {
            remote_static,
            handshake_hash,
            writer: SessionWriter {
                writer: Box::new(writer),
                transport: transport.clone(),
                buf: vec![0u8; MAX_MESSAGE_LEN],
            },
            reader: SessionReader::spawn(reader, transport),
        })
    }

    /// Static key the peer proved possession of during the handshake
    pub fn remote_static(&self) -> &TrustKey {
        &self.remote_static
    }

    /// Channel binding value; identical on both ends of one session
    pub fn handshake_hash(&self) -> &[u8] {
        &self.handshake_hash
    }

    /// Check the peer against the trust key pinned at pairing time
    pub fn verify_trust(&self, expected: &TrustKey) -> Result<(), TransportError> {
        if &self.remote_static != expected {
            return Err(TransportError::TrustViolation {
                expected: expected.fingerprint(),
                actual: self.remote_static.fingerprint(),
            });
        }
        Ok(())
    }

    pub async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.writer.send(frame).await
    }

    pub async fn receive(&mut self) -> Result<Frame, TransportError> {
        self.reader.receive().await
    }

    /// Send our `Hello` and read the peer's; refuses incompatible versions
    pub async fn exchange_hello(&mut self, local: Hello) -> Result<Hello, TransportError> {
        let local_version = local.protocol_version;
        self.send(Frame::Hello(local)).await?;
        match self.receive().await? {
            Frame::Hello(remote) => {
                if !local_version.is_compatible(&remote.protocol_version) {
                    return Err(TransportError::VersionMismatch {
                        local: local_version,
                        remote: remote.protocol_version,
                    });
                }
                Ok(remote)
            }
            other => Err(TransportError::UnexpectedFrame { expected: "Hello", actual: other.kind() }),
        }
    }

    /// Responder side of the Hello exchange: wait for the peer's Hello and
    /// answer with ours for the same purpose. The answer is sent even when
    /// the versions are incompatible so both ends report the mismatch.
    pub async fn answer_hello(
        &mut self,
        replica_id: ReplicaId,
        display_name: &str,
    ) -> Result<Hello, TransportError> {
        let remote = match self.receive().await? {
            Frame::Hello(remote) => remote,
            other => {
                return Err(TransportError::UnexpectedFrame { expected: "Hello", actual: other.kind() })
            }
        };
        let local = Hello::new(replica_id, display_name, remote.purpose);
        let local_version = local.protocol_version;
        self.send(Frame::Hello(local)).await?;

        if !local_version.is_compatible(&remote.protocol_version) {
            return Err(TransportError::VersionMismatch {
                local: local_version,
                remote: remote.protocol_version,
            });
        }
        Ok(remote)
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.close().await
    }

    pub fn split(self) -> (SessionWriter, SessionReader) {
        (self.writer, self.reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_router::frame::{ProtocolVersion, SessionPurpose};
    use crate::core_router::memory::session_pair;

    #[tokio::test]
    async fn test_handshake_exposes_static_keys() {
        let a = StaticKeypair::generate();
        let b = StaticKeypair::generate();
        let (sa, sb) = session_pair(&a, &b).await.unwrap();

        assert_eq!(sa.remote_static(), b.public());
        assert_eq!(sb.remote_static(), a.public());
        assert_eq!(sa.handshake_hash(), sb.handshake_hash());
        assert!(sa.verify_trust(b.public()).is_ok());
        assert!(matches!(
            sa.verify_trust(a.public()),
            Err(TransportError::TrustViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (mut sa, mut sb) =
            session_pair(&StaticKeypair::generate(), &StaticKeypair::generate()).await.unwrap();

        sa.send(Frame::PairConfirm { accepted: true }).await.unwrap();
        sb.send(Frame::PairConfirm { accepted: false }).await.unwrap();

        assert_eq!(sb.receive().await.unwrap(), Frame::PairConfirm { accepted: true });
        assert_eq!(sa.receive().await.unwrap(), Frame::PairConfirm { accepted: false });
    }

    #[tokio::test]
    async fn test_large_frame_is_chunked() {
        let (mut sa, mut sb) =
            session_pair(&StaticKeypair::generate(), &StaticKeypair::generate()).await.unwrap();

        let display_name = "x".repeat(200_000);
        let frame =
            Frame::PairRequest { replica_id: ReplicaId::from("a"), display_name: display_name.clone() };
        sa.send(frame.clone()).await.unwrap();

        assert_eq!(sb.receive().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_closed_peer_reports_closed() {
        let (mut sa, sb) =
            session_pair(&StaticKeypair::generate(), &StaticKeypair::generate()).await.unwrap();
        drop(sb);

        assert!(matches!(sa.receive().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_hello_version_mismatch() {
        let (mut sa, mut sb) =
            session_pair(&StaticKeypair::generate(), &StaticKeypair::generate()).await.unwrap();

        let mut future = Hello::new(ReplicaId::from("b"), "b", SessionPurpose::Sync);
        future.protocol_version = ProtocolVersion { major: 2, minor: 0 };
        let current = Hello::new(ReplicaId::from("a"), "a", SessionPurpose::Sync);

        let (ra, rb) = tokio::join!(sa.exchange_hello(current), sb.exchange_hello(future));
        assert!(matches!(ra, Err(TransportError::VersionMismatch { .. })));
        assert!(matches!(rb, Err(TransportError::VersionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_answer_hello_echoes_purpose() {
        let (mut sa, mut sb) =
            session_pair(&StaticKeypair::generate(), &StaticKeypair::generate()).await.unwrap();

        let request = Hello::new(ReplicaId::from("a"), "a", SessionPurpose::Pair);
        let (ra, rb) =
            tokio::join!(sa.exchange_hello(request), sb.answer_hello(ReplicaId::from("b"), "b"));

        let answer = ra.unwrap();
        assert_eq!(answer.replica_id, ReplicaId::from("b"));
        assert_eq!(answer.purpose, SessionPurpose::Pair);
        assert_eq!(rb.unwrap().replica_id, ReplicaId::from("a"));
    }
}
