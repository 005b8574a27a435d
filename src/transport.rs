//! Link to the radio.
//!
//! Framing, escaping and checksums are handled by an external codec that
//! exchanges one JSON frame per line with us over TCP. Outgoing frames go
//! through a single FIFO so configuration sequences keep their pacing and
//! are never overtaken by later runtime writes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::frame::{InboundFrame, OutboundFrame};
use crate::gateway::GatewayEvent;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("frame transport is not available")]
    Unavailable,
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sink for frames addressed to modules.
///
/// Submitting never waits on the radio: frames are queued and written in
/// order by a separate task.
pub trait FrameTransport: Send + Sync {
    /// Queue `frame`; the writer then pauses for `settle` before the next one.
    fn submit(&self, frame: OutboundFrame, settle: Duration) -> Result<(), TransportError>;

    fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        self.submit(frame, Duration::ZERO)
    }
}

#[derive(Debug)]
pub struct QueuedFrame {
    pub frame: OutboundFrame,
    pub settle: Duration,
}

pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<QueuedFrame>,
}

impl OutboundQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<QueuedFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutboundQueue { tx }, rx)
    }

    /// Queue with no writer behind it; every submit fails.
    pub fn offline() -> Self {
        let (queue, _) = Self::channel();
        queue
    }
}

impl FrameTransport for OutboundQueue {
    fn submit(&self, frame: OutboundFrame, settle: Duration) -> Result<(), TransportError> {
        self.tx
            .send(QueuedFrame { frame, settle })
            .map_err(|_| TransportError::Unavailable)
    }
}

/// Frame ids run 1..=255; 0 would ask the radio not to answer.
struct FrameIds(AtomicU8);

impl FrameIds {
    fn next(&self) -> u8 {
        loop {
            let id = self.0.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

/// Write queued frames as JSON lines, honouring each frame's settle delay.
pub async fn write_frames<W: AsyncWrite + Unpin>(
    mut rx: mpsc::UnboundedReceiver<QueuedFrame>,
    mut writer: W,
) -> Result<(), TransportError> {
    let ids = FrameIds(AtomicU8::new(1));
    while let Some(queued) = rx.recv().await {
        let id = ids.next();
        let mut line = match serde_json::to_string(&queued.frame.to_wire(id)) {
            Ok(line) => line,
            Err(err) => {
                error!("Dropping unencodable frame {:?}: {}", queued.frame, err);
                continue;
            }
        };
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        debug!(
            "Sent {} to {} (frame {})",
            queued.frame.command, queued.frame.destination, id
        );
        if !queued.settle.is_zero() {
            tokio::time::sleep(queued.settle).await;
        }
    }
    Ok(())
}

/// Parse JSON lines into frames and hand them to the gateway loop.
///
/// Malformed lines are logged and skipped. Returns when the stream ends.
pub async fn read_frames<R: AsyncRead + Unpin>(
    reader: R,
    events: mpsc::UnboundedSender<GatewayEvent>,
) -> Result<(), TransportError> {
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match InboundFrame::from_json(&line) {
            Ok(frame) => {
                if events.send(GatewayEvent::Frame(frame)).is_err() {
                    debug!("Gateway loop gone, stopping frame reader");
                    break;
                }
            }
            Err(err) => warn!("Dropping malformed frame {:?}: {}", line, err),
        }
    }
    Ok(())
}

/// Connect to the frame codec and spawn the reader and writer tasks.
///
/// When either side ends, a [`GatewayEvent::TransportClosed`] is sent. There
/// is no reconnect; the gateway stays degraded until restarted.
pub async fn connect(
    address: &str,
    events: mpsc::UnboundedSender<GatewayEvent>,
) -> Result<OutboundQueue, TransportError> {
    let stream = TcpStream::connect(address).await?;
    info!("Connected to frame transport at {}", address);
    let (read_half, write_half) = stream.into_split();
    let (queue, rx) = OutboundQueue::channel();

    let reader_events = events.clone();
    tokio::spawn(async move {
        let reason = match read_frames(read_half, reader_events.clone()).await {
            Ok(()) => "frame stream ended".to_string(),
            Err(err) => err.to_string(),
        };
        let _ = reader_events.send(GatewayEvent::TransportClosed(reason));
    });

    tokio::spawn(async move {
        if let Err(err) = write_frames(rx, write_half).await {
            error!("Frame writer stopped: {}", err);
            let _ = events.send(GatewayEvent::TransportClosed(err.to_string()));
        }
    });

    Ok(queue)
}
