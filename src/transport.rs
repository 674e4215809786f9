//! Raw CAN frame transport.
//!
//! Owns the SocketCAN socket in a single background task: inbound frames are
//! forwarded to the protocol engine as [`TransportEvent`]s, outbound frames
//! are drained from a FIFO queue with a separate urgent lane (heartbeats)
//! that is always served first. Any I/O failure closes the socket and
//! re-opens it with exponential backoff.

use socketcan::tokio::CanSocket;
use socketcan::{CanFrame, EmbeddedFrame, Id, StandardId};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// First reconnect delay after an I/O failure.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Ceiling for the reconnect delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Capacity of the normal outbound lane.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Capacity of the urgent (heartbeat) lane.
const URGENT_QUEUE_CAPACITY: usize = 4;

/// Largest payload a classic CAN frame can carry.
pub const MAX_FRAME_DATA: usize = 8;

/// Largest 11-bit identifier.
const MAX_STANDARD_ID: u16 = 0x7FF;

/// Errors surfaced to transport callers.
///
/// Read-side failures never appear here; they are recovered in place by the
/// reconnect loop.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket is not open; the frame was not queued.
    #[error("CAN bus is down")]
    BusDown,
    /// The outbound queue did not accept the frame.
    #[error("outbound queue full, send timed out")]
    SendTimeout,
    /// Frame construction rejected.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// A classic CAN frame with an 11-bit identifier and up to 8 data bytes.
///
/// The invariant (id ≤ 0x7FF, len ≤ 8) is enforced at construction, so
/// conversion to a kernel frame cannot fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    id: u16,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(id: u16, data: &[u8]) -> Result<Self, TransportError> {
        if id > MAX_STANDARD_ID {
            return Err(TransportError::InvalidFrame(format!(
                "id 0x{id:X} exceeds 11 bits"
            )));
        }
        if data.len() > MAX_FRAME_DATA {
            return Err(TransportError::InvalidFrame(format!(
                "payload of {} bytes exceeds {MAX_FRAME_DATA}",
                data.len()
            )));
        }
        Ok(Self {
            id,
            data: data.to_vec(),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Converts an inbound kernel frame. Extended-id frames are not part of
    /// the cabinet protocol and yield `None`.
    fn from_can(frame: &CanFrame) -> Option<Self> {
        match frame.id() {
            Id::Standard(sid) => Some(Self {
                id: sid.as_raw(),
                data: frame.data().to_vec(),
            }),
            Id::Extended(_) => None,
        }
    }

    fn to_can(&self) -> Option<CanFrame> {
        let id = StandardId::new(self.id)?;
        CanFrame::new(id, &self.data)
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03X}#", self.id)?;
        for byte in &self.data {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Events sent from the transport task to the protocol engine.
#[derive(Debug)]
pub enum TransportEvent {
    /// The socket is open; handshaking may begin.
    Up,
    /// The socket was lost; reconnect is in progress.
    Down { reason: String },
    /// An inbound frame.
    Frame(Frame),
}

/// Control requests from the protocol engine.
#[derive(Debug)]
enum Control {
    /// A successful handshake resets the reconnect backoff.
    BackoffReset,
    /// Cycle the socket (handshake timeout or stale link).
    Reconnect,
}

/// Cloneable handle for queueing outbound frames.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    normal_tx: mpsc::Sender<Frame>,
    urgent_tx: mpsc::Sender<Frame>,
    control_tx: mpsc::Sender<Control>,
    link_up: watch::Receiver<bool>,
}

impl TransportHandle {
    /// Queues a frame on the FIFO lane.
    ///
    /// Fails with [`TransportError::BusDown`] while the socket is closed;
    /// callers apply their own policy (commands surface the error, the
    /// handshake retries on its timer).
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !*self.link_up.borrow() {
            return Err(TransportError::BusDown);
        }
        self.normal_tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::SendTimeout,
            mpsc::error::TrySendError::Closed(_) => TransportError::BusDown,
        })
    }

    /// Queues a frame on the urgent lane, served before anything queued on
    /// the FIFO lane. Used for heartbeats, which drop on failure.
    pub fn send_urgent(&self, frame: Frame) -> Result<(), TransportError> {
        if !*self.link_up.borrow() {
            return Err(TransportError::BusDown);
        }
        self.urgent_tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::SendTimeout,
            mpsc::error::TrySendError::Closed(_) => TransportError::BusDown,
        })
    }

    /// Tells the transport the handshake completed, resetting the backoff.
    pub fn reset_backoff(&self) {
        let _ = self.control_tx.try_send(Control::BackoffReset);
    }

    /// Asks the transport to close and re-open the socket. Used by the
    /// protocol engine on handshake timeout and stale links.
    pub fn request_reconnect(&self) {
        let _ = self.control_tx.try_send(Control::Reconnect);
    }
}

/// Spawns the transport task for `interface`.
///
/// Returns the handle used for outbound traffic; inbound frames and link
/// state changes arrive on `event_tx`. The task exits when `shutdown`
/// flips to `true`.
pub fn spawn(
    interface: String,
    event_tx: mpsc::Sender<TransportEvent>,
    shutdown: watch::Receiver<bool>,
) -> (TransportHandle, JoinHandle<()>) {
    let (normal_tx, normal_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let (urgent_tx, urgent_rx) = mpsc::channel(URGENT_QUEUE_CAPACITY);
    let (control_tx, control_rx) = mpsc::channel(4);
    let (up_tx, up_rx) = watch::channel(false);

    let handle = TransportHandle {
        normal_tx,
        urgent_tx,
        control_tx,
        link_up: up_rx,
    };

    let task = tokio::spawn(run(
        interface, event_tx, shutdown, normal_rx, urgent_rx, control_rx, up_tx,
    ));

    (handle, task)
}

async fn run(
    interface: String,
    event_tx: mpsc::Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
    mut normal_rx: mpsc::Receiver<Frame>,
    mut urgent_rx: mpsc::Receiver<Frame>,
    mut control_rx: mpsc::Receiver<Control>,
    up_tx: watch::Sender<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let socket = match CanSocket::open(&interface) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(
                    interface = %interface,
                    error = %e,
                    retry_in = ?backoff,
                    "failed to open CAN socket"
                );
                if sleep_or_shutdown(&mut shutdown, backoff).await {
                    break;
                }
                backoff = next_backoff(backoff);
                continue;
            }
        };

        // Drop reconnect requests aimed at the previous socket; a backoff
        // reset that raced the failure is still honored.
        while let Ok(control) = control_rx.try_recv() {
            if matches!(control, Control::BackoffReset) {
                backoff = INITIAL_BACKOFF;
            }
        }

        info!(interface = %interface, "CAN socket open");
        up_tx.send_replace(true);
        if event_tx.send(TransportEvent::Up).await.is_err() {
            break;
        }

        let reason = serve(
            &socket,
            &event_tx,
            &mut shutdown,
            &mut normal_rx,
            &mut urgent_rx,
            &mut control_rx,
            &mut backoff,
        )
        .await;

        up_tx.send_replace(false);
        drop(socket);

        let Some(reason) = reason else {
            // Shutdown: the socket is already closed, nothing to report.
            break;
        };

        warn!(interface = %interface, reason = %reason, retry_in = ?backoff, "CAN socket lost");
        let _ = event_tx.send(TransportEvent::Down { reason }).await;

        if sleep_or_shutdown(&mut shutdown, backoff).await {
            break;
        }
        backoff = next_backoff(backoff);
    }

    debug!("transport task exiting");
}

/// Serves one open socket until an I/O failure or shutdown.
///
/// Returns the failure reason, or `None` on shutdown.
async fn serve(
    socket: &CanSocket,
    event_tx: &mpsc::Sender<TransportEvent>,
    shutdown: &mut watch::Receiver<bool>,
    normal_rx: &mut mpsc::Receiver<Frame>,
    urgent_rx: &mut mpsc::Receiver<Frame>,
    control_rx: &mut mpsc::Receiver<Control>,
    backoff: &mut Duration,
) -> Option<String> {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return None;
                }
            }

            Some(control) = control_rx.recv() => match control {
                Control::BackoffReset => *backoff = INITIAL_BACKOFF,
                Control::Reconnect => return Some("reconnect requested".to_string()),
            },

            Some(frame) = urgent_rx.recv() => {
                if let Some(reason) = write_frame(socket, &frame).await {
                    return Some(reason);
                }
            }

            Some(frame) = normal_rx.recv() => {
                if let Some(reason) = write_frame(socket, &frame).await {
                    return Some(reason);
                }
            }

            result = socket.read_frame() => match result {
                Ok(can_frame) => {
                    let Some(frame) = Frame::from_can(&can_frame) else {
                        continue;
                    };
                    if event_tx.send(TransportEvent::Frame(frame)).await.is_err() {
                        return None;
                    }
                }
                Err(e) => return Some(format!("read failed: {e}")),
            },
        }
    }
}

async fn write_frame(socket: &CanSocket, frame: &Frame) -> Option<String> {
    // The Frame invariant guarantees a representable kernel frame.
    let Some(can_frame) = frame.to_can() else {
        warn!(frame = %frame, "dropping unrepresentable frame");
        return None;
    };
    match socket.write_frame(can_frame).await {
        Ok(()) => {
            debug!(frame = %frame, "tx");
            None
        }
        Err(e) => Some(format!("write failed: {e}")),
    }
}

/// Sleeps for `delay`, returning `true` if shutdown was signalled first.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    mod frame_tests {
        use super::*;

        #[test]
        fn accepts_maximum_standard_id_and_payload() {
            let frame = Frame::new(0x7FF, &[0u8; 8]).expect("valid frame");
            assert_eq!(frame.id(), 0x7FF);
            assert_eq!(frame.data().len(), 8);
        }

        #[test]
        fn accepts_empty_payload() {
            let frame = Frame::new(0x10A, &[]).expect("valid frame");
            assert!(frame.data().is_empty());
        }

        #[test]
        fn rejects_extended_id() {
            assert!(Frame::new(0x800, &[]).is_err());
        }

        #[test]
        fn rejects_oversized_payload() {
            assert!(Frame::new(0x10A, &[0u8; 9]).is_err());
        }

        #[test]
        fn kernel_round_trip_preserves_id_and_data() {
            let frame = Frame::new(0x10B, &[0x14, 0x01, 0x02]).expect("valid frame");
            let can = frame.to_can().expect("representable");
            assert_eq!(Frame::from_can(&can), Some(frame));
        }

        #[test]
        fn displays_candump_style() {
            let frame = Frame::new(0x10A, &[0x0E, 0x00, 0x01]).expect("valid frame");
            assert_eq!(frame.to_string(), "10A#0E0001");
        }
    }

    mod backoff_tests {
        use super::*;

        #[test]
        fn doubles_until_cap() {
            let mut delay = INITIAL_BACKOFF;
            delay = next_backoff(delay);
            assert_eq!(delay, Duration::from_secs(2));
            for _ in 0..10 {
                delay = next_backoff(delay);
            }
            assert_eq!(delay, MAX_BACKOFF);
        }
    }
}
