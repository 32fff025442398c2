//! # Framed TCP Transport
//!
//! Newline-framed frame exchange over TCP, in two shapes:
//!
//! - **One-shot**: open a connection, send a frame, optionally read one frame
//!   back, close. Used for seed registration, seed-to-seed proposals, degree
//!   probes, and corroboration test pings.
//! - **Persistent [`Link`]**: the long-lived neighbor connection. A reader
//!   task turns inbound lines into [`LinkEvent`]s on the owner's channel; a
//!   writer task drains a bounded outbound queue so a slow peer cannot stall
//!   the node.
//!
//! Malformed lines are dropped with a log and the stream keeps going; a
//! single bad frame never costs the sender its connection. Overlong lines
//! are treated the same as malformed ones.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::codec::Frame;
use crate::identity::NodeId;

/// Deadline for outbound connect attempts.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for a full one-shot request/response exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest line accepted from the wire; anything bigger is dropped.
pub const MAX_FRAME_LEN: usize = 8 * 1024;

/// Outbound queue depth per neighbor link.
pub const LINK_QUEUE_DEPTH: usize = 64;

/// Write one frame followed by a newline.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> std::io::Result<()> {
    let mut line = frame.encode();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Read the next well-formed frame from a buffered stream.
///
/// Returns `Ok(None)` on clean EOF. Malformed or overlong lines are logged
/// and skipped, never surfaced as errors.
pub async fn read_frame<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> std::io::Result<Option<Frame>> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if n > MAX_FRAME_LEN {
            warn!(len = n, "dropping overlong frame");
            continue;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }
        match Frame::parse(trimmed) {
            Ok(frame) => return Ok(Some(frame)),
            Err(e) => {
                warn!(error = %e, line = trimmed, "dropping malformed frame");
            }
        }
    }
}

/// One-shot exchange: connect, send `frame`, read a single frame back.
pub async fn request(addr: SocketAddr, frame: &Frame, deadline: Duration) -> Result<Frame> {
    let exchange = async {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to {addr}"))?;
        let (read_half, mut write_half) = stream.into_split();
        write_frame(&mut write_half, frame)
            .await
            .with_context(|| format!("send {} to {addr}", frame.kind()))?;
        let mut reader = BufReader::new(read_half);
        read_frame(&mut reader)
            .await
            .with_context(|| format!("read reply from {addr}"))?
            .with_context(|| format!("{addr} closed without replying"))
    };
    timeout(deadline, exchange)
        .await
        .with_context(|| format!("request to {addr} timed out"))?
}

/// One-shot send: connect, write `frame`, close. No reply expected.
/// A transient failure is retried once before it is surfaced.
pub async fn send(addr: SocketAddr, frame: &Frame, deadline: Duration) -> Result<()> {
    match send_once(addr, frame, deadline).await {
        Ok(()) => Ok(()),
        Err(first) => {
            debug!(%addr, error = %first, "send failed, retrying once");
            send_once(addr, frame, deadline).await
        }
    }
}

async fn send_once(addr: SocketAddr, frame: &Frame, deadline: Duration) -> Result<()> {
    let exchange = async {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to {addr}"))?;
        let (_read_half, mut write_half) = stream.into_split();
        write_frame(&mut write_half, frame)
            .await
            .with_context(|| format!("send {} to {addr}", frame.kind()))?;
        write_half.shutdown().await.ok();
        Ok(())
    };
    timeout(deadline, exchange)
        .await
        .with_context(|| format!("send to {addr} timed out"))?
}

/// Events a [`Link`]'s reader task delivers to the owning node.
#[derive(Debug)]
pub enum LinkEvent {
    /// A frame arrived from the named neighbor.
    Frame(NodeId, Frame),
    /// The neighbor's connection closed or failed; the link is unusable.
    Closed(NodeId),
}

/// A persistent neighbor connection: bounded writer queue plus reader task.
pub struct Link {
    peer: NodeId,
    outbound: mpsc::Sender<Frame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    /// Take over an established stream (already split and possibly
    /// part-consumed during the attach handshake) and wire it to `events`.
    pub fn spawn(
        peer: NodeId,
        read_half: BufReader<OwnedReadHalf>,
        write_half: OwnedWriteHalf,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let (outbound, mut outbound_rx) = mpsc::channel::<Frame>(LINK_QUEUE_DEPTH);

        let writer = tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &frame).await {
                    debug!(peer = %peer, error = %e, "link write failed");
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut read_half = read_half;
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => {
                        if events.send(LinkEvent::Frame(peer, frame)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        trace!(peer = %peer, error = %e, "link read failed");
                        break;
                    }
                }
            }
            let _ = events.send(LinkEvent::Closed(peer)).await;
        });

        Self {
            peer,
            outbound,
            reader,
            writer,
        }
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Best-effort enqueue. Returns false when the queue is full or the
    /// writer is gone; the caller decides whether that counts as a miss.
    pub fn enqueue(&self, frame: Frame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "link enqueue failed");
                false
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn ping(nonce: u64) -> Frame {
        Frame::Ping { nonce }
    }

    #[tokio::test]
    async fn one_shot_request_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            if let Ok(Some(Frame::Ping { nonce })) = read_frame(&mut reader).await {
                write_frame(&mut write_half, &Frame::Pong { nonce })
                    .await
                    .unwrap();
            }
        });

        let reply = request(addr, &ping(42), REQUEST_TIMEOUT).await.unwrap();
        assert_eq!(reply, Frame::Pong { nonce: 42 });
    }

    #[tokio::test]
    async fn request_times_out_on_silence() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            // Accept and hold the connection open without replying.
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let result = request(addr, &ping(7), Duration::from_millis(200)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reader_skips_malformed_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"GARBAGE this is not a frame\nPONG 9\n")
                .await
                .unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, _write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let frame = read_frame(&mut reader).await.unwrap();
        assert_eq!(frame, Some(Frame::Pong { nonce: 9 }));
    }

    #[tokio::test]
    async fn link_delivers_frames_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer: NodeId = "127.0.0.1:6001".parse().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            write_frame(&mut write_half, &Frame::Ping { nonce: 1 })
                .await
                .unwrap();
            // Echo whatever the link sends back, then hang up.
            let mut reader = BufReader::new(read_half);
            let echoed = read_frame(&mut reader).await.unwrap();
            drop(write_half);
            echoed
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let link = Link::spawn(peer, BufReader::new(read_half), write_half, events_tx);

        match events_rx.recv().await {
            Some(LinkEvent::Frame(from, Frame::Ping { nonce: 1 })) => assert_eq!(from, peer),
            other => panic!("unexpected event {other:?}"),
        }

        assert!(link.enqueue(Frame::Pong { nonce: 1 }));
        let echoed = server.await.unwrap();
        assert_eq!(echoed, Some(Frame::Pong { nonce: 1 }));

        match events_rx.recv().await {
            Some(LinkEvent::Closed(from)) => assert_eq!(from, peer),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
