//! Transport bridge between the message bus connection and a node's logic loop.
//!
//! The socket is owned by two background tasks. The reader task decodes
//! length-prefixed datagrams and pushes them onto an unbounded queue; the
//! writer task drains an [`Outbox`] onto the socket. The logic loop never
//! touches the socket and instead calls [`Bridge::poll`] once per iteration.
//!
//! Stream framing is `[len:u16][datagram]`, little-endian.

use crate::datagram::Datagram;
use log::{debug, error, info, warn};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Default time [`Bridge::poll`] waits for the first datagram.
pub const POLL_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to connect to message director at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The bus connection is gone. Nodes treat this as fatal.
    #[error("lost connection to the message director")]
    ConnectionLost,
}

/// Items produced by the reader task.
#[derive(Debug)]
pub enum Inbound {
    Datagram(Datagram),
    ConnectionLost,
}

/// Cloneable handle for queueing outbound datagrams.
///
/// Sends never block; the writer task performs the socket write.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Datagram>,
}

impl Outbox {
    /// Creates an outbox and the receiving end a writer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Datagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues `dg` for sending. Returns false once the writer is gone.
    pub fn send(&self, dg: Datagram) -> bool {
        if self.tx.send(dg).is_err() {
            debug!("Outbox closed, dropping datagram");
            return false;
        }
        true
    }
}

/// The logic loop's view of the bus connection.
pub struct Bridge {
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    outbox: Outbox,
    lost: bool,
}

impl Bridge {
    /// Connects to the message director over TCP.
    pub async fn connect(addr: &str) -> Result<Self, BridgeError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| BridgeError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        info!("Connected to message director at {}", addr);

        Ok(Self::from_stream(stream))
    }

    /// Wraps an already-established byte stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbox, outbound_rx) = Outbox::channel();

        Self::spawn_reader(reader, inbound_tx.clone());
        Self::spawn_writer(writer, outbound_rx, inbound_tx);

        Self {
            inbound_rx,
            outbox,
            lost: false,
        }
    }

    /// Spawns task that decodes datagrams off the socket
    fn spawn_reader<R>(mut reader: R, inbound_tx: mpsc::UnboundedSender<Inbound>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            loop {
                let len = match reader.read_u16_le().await {
                    Ok(len) => len as usize,
                    Err(e) => {
                        warn!("Bus connection closed: {}", e);
                        break;
                    }
                };

                let mut data = vec![0u8; len];
                if let Err(e) = reader.read_exact(&mut data).await {
                    error!("Bus connection closed mid-datagram: {}", e);
                    break;
                }

                if inbound_tx.send(Inbound::Datagram(Datagram::from_bytes(data))).is_err() {
                    debug!("Logic loop gone, stopping reader");
                    return;
                }
            }

            let _ = inbound_tx.send(Inbound::ConnectionLost);
        });
    }

    /// Spawns task that drains the outbox onto the socket
    fn spawn_writer<W>(
        mut writer: W,
        mut outbound_rx: mpsc::UnboundedReceiver<Datagram>,
        inbound_tx: mpsc::UnboundedSender<Inbound>,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(dg) = outbound_rx.recv().await {
                let len = match u16::try_from(dg.len()) {
                    Ok(len) => len,
                    Err(_) => {
                        error!("Dropping oversized datagram of {} bytes", dg.len());
                        continue;
                    }
                };

                let mut frame = Vec::with_capacity(2 + dg.len());
                frame.extend_from_slice(&len.to_le_bytes());
                frame.extend_from_slice(dg.as_bytes());

                if let Err(e) = writer.write_all(&frame).await {
                    error!("Failed to write to bus: {}", e);
                    let _ = inbound_tx.send(Inbound::ConnectionLost);
                    return;
                }
            }

            let _ = writer.shutdown().await;
        });
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub fn send(&self, dg: Datagram) {
        self.outbox.send(dg);
    }

    /// Waits up to `wait` for the first datagram, then drains whatever else
    /// is already queued without blocking.
    ///
    /// An empty batch means nothing arrived in time. Datagrams received
    /// before a connection loss are still returned; the loss is reported by
    /// the following call.
    pub async fn poll(&mut self, wait: Duration) -> Result<Vec<Datagram>, BridgeError> {
        if self.lost {
            return Err(BridgeError::ConnectionLost);
        }

        let mut batch = Vec::new();
        match tokio::time::timeout(wait, self.inbound_rx.recv()).await {
            Ok(Some(Inbound::Datagram(dg))) => batch.push(dg),
            Ok(Some(Inbound::ConnectionLost)) | Ok(None) => {
                self.lost = true;
                return Err(BridgeError::ConnectionLost);
            }
            Err(_) => return Ok(batch),
        }

        loop {
            match self.inbound_rx.try_recv() {
                Ok(Inbound::Datagram(dg)) => batch.push(dg),
                Ok(Inbound::ConnectionLost) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.lost = true;
                    break;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }

        Ok(batch)
    }

    /// Waits indefinitely for the next datagram.
    pub async fn recv(&mut self) -> Result<Datagram, BridgeError> {
        if self.lost {
            return Err(BridgeError::ConnectionLost);
        }
        match self.inbound_rx.recv().await {
            Some(Inbound::Datagram(dg)) => Ok(dg),
            Some(Inbound::ConnectionLost) | None => {
                self.lost = true;
                Err(BridgeError::ConnectionLost)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) {
        w.write_u16_le(bytes.len() as u16).await.unwrap();
        w.write_all(bytes).await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_drains_queued_datagrams() {
        let (ours, mut theirs) = duplex(4096);
        let mut bridge = Bridge::from_stream(ours);

        write_frame(&mut theirs, &[1, 2, 3]).await;
        write_frame(&mut theirs, &[4]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let batch = bridge.poll(POLL_WAIT).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].as_bytes(), &[1, 2, 3]);
        assert_eq!(batch[1].as_bytes(), &[4]);
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let stream = tokio_test::io::Builder::new()
            .read(&[3, 0, 1])
            .read(&[2, 3])
            .build();
        let mut bridge = Bridge::from_stream(stream);

        let dg = tokio_test::assert_ok!(bridge.recv().await);
        assert_eq!(dg.as_bytes(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_poll_times_out_empty() {
        let (ours, _theirs) = duplex(64);
        let mut bridge = Bridge::from_stream(ours);

        let batch = bridge.poll(Duration::from_millis(10)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_outbox_writes_length_prefixed_frames() {
        let (ours, mut theirs) = duplex(4096);
        let bridge = Bridge::from_stream(ours);

        let mut dg = Datagram::new();
        dg.add_u32(0x01020304);
        assert!(bridge.outbox().send(dg));

        assert_eq!(theirs.read_u16_le().await.unwrap(), 4);
        let mut body = [0u8; 4];
        theirs.read_exact(&mut body).await.unwrap();
        assert_eq!(body, 0x01020304u32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_oversized_datagram_dropped() {
        let (ours, mut theirs) = duplex(1 << 20);
        let bridge = Bridge::from_stream(ours);

        bridge.send(Datagram::from_bytes(vec![0u8; u16::MAX as usize + 1]));
        bridge.send(Datagram::from_bytes(vec![7]));

        // Only the small datagram reaches the wire.
        assert_eq!(theirs.read_u16_le().await.unwrap(), 1);
        assert_eq!(theirs.read_u8().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_connection_loss_is_reported() {
        let (ours, mut theirs) = duplex(4096);
        let mut bridge = Bridge::from_stream(ours);

        write_frame(&mut theirs, &[9]).await;
        drop(theirs);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The datagram read before the close is still delivered.
        let batch = bridge.poll(POLL_WAIT).await.unwrap();
        assert_eq!(batch.len(), 1);

        assert!(matches!(
            bridge.poll(POLL_WAIT).await,
            Err(BridgeError::ConnectionLost)
        ));
        assert!(matches!(bridge.recv().await, Err(BridgeError::ConnectionLost)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(matches!(
            Bridge::connect(&addr).await,
            Err(BridgeError::Connect { .. })
        ));
    }
}
