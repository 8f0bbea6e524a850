/*
  TransportManager - raw TCP transport

  Owns the listening socket and dialing. Knows nothing about identities
  or encryption: it hands accepted streams to the replica coordinator,
  which upgrades them into Noise sessions.

  Framing:
  Every message on the wire is a 4-byte big-endian length followed by
  that many bytes. Lengths above MAX_MESSAGE_LEN are rejected before
  any allocation.

┌─────────────────────────────────────────────────────────┐
│                   TransportManager                       │
├─────────────────────────────────────────────────────────┤
│  listen(addr)  ──► Spawn accept loop                     │
│  dial(addr)    ──► TcpStream                             │
│                                                          │
│  Events out:                                             │
│    • Connected { stream, remote_addr } ◄── accepted      │
└─────────────────────────────────────────────────────────┘
*/
use super::TransportError;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Largest message a single length prefix may announce (one Noise message)
pub const MAX_MESSAGE_LEN: usize = 65535;

#[derive(Debug)]
pub enum TransportEvent {
    Connected { stream: TcpStream, remote_addr: SocketAddr },
}

/// Write one length-prefixed message
pub async fn write_message<W>(writer: &mut W, bytes: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(TransportError::FrameTooLarge(bytes.len()));
    }
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message; a clean EOF before the prefix is `Closed`
pub async fn read_message<R>(reader: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub struct TransportManager {
    event_tx: mpsc::Sender<TransportEvent>,
}

impl TransportManager {
    pub fn new(event_tx: mpsc::Sender<TransportEvent>) -> Self {
        TransportManager { event_tx }
    }

    /// Bind `addr` and spawn the accept loop; returns the bound address.
    ///
    /// The loop ends when `shutdown` fires or the event receiver is dropped.
    pub async fn listen(
        &self,
        addr: &str,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let event_tx = self.event_tx.clone();
        info!(address = %local_addr, "transport listening");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("transport listener stopping");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote_addr)) => {
                            debug!(remote = %remote_addr, "accepted connection");
                            if event_tx
                                .send(TransportEvent::Connected { stream, remote_addr })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to accept connection"),
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Single connection attempt; see `backoff::connect_with_backoff` for retries
    pub async fn dial(addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_listen_accepts_connections() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let manager = TransportManager::new(event_tx);
        let addr = manager.listen("127.0.0.1:0", shutdown_rx).await.unwrap();

        let _client = TransportManager::dial(addr).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .expect("Timeout waiting for event")
            .expect("Event channel closed");

        let TransportEvent::Connected { remote_addr, .. } = event;
        assert!(remote_addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_listen_invalid_address() {
        let (event_tx, _event_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let manager = TransportManager::new(event_tx);

        let result = manager.listen("invalid:address", shutdown_rx).await;
        assert!(result.is_err(), "Should fail with invalid address");
    }

    #[tokio::test]
    async fn test_length_prefixed_messages() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_message(&mut a, b"hello").await.unwrap();
        write_message(&mut a, b"").await.unwrap();

        assert_eq!(read_message(&mut b).await.unwrap(), b"hello");
        assert_eq!(read_message(&mut b).await.unwrap(), b"");

        drop(a);
        assert!(matches!(read_message(&mut b).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_prefix_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&(MAX_MESSAGE_LEN as u32 + 1).to_be_bytes()).await.unwrap();

        assert!(matches!(read_message(&mut b).await, Err(TransportError::FrameTooLarge(_))));
    }
}
