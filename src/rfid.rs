//! Fragmented RFID transfer sessions.
//!
//! A transfer starts with a NOTIFY or RESPONSE start packet, carries its
//! payload in 4-byte DATA packets indexed by packet number, and finishes
//! with an END packet declaring the packet count and a 16-bit wrapping-sum
//! checksum. The tracker keeps at most one session per extruder, tolerates
//! out-of-order and duplicated packets, and cancels sessions that stall.
//!
//! The tracker is synchronous; the protocol engine drives it from its event
//! loop and a periodic reaper tick. Time is passed in explicitly so the
//! timeout logic is testable.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Payload bytes carried by one DATA packet.
pub const BYTES_PER_PACKET: usize = 4;

/// Largest payload a transfer may declare.
pub const MAX_TRANSFER_BYTES: usize = 256;

/// How a transfer was initiated on the cabinet side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSource {
    /// Pushed after an RFID tag read.
    Rfid,
    /// Entered manually on the cabinet panel.
    Manual,
}

impl TransferSource {
    pub fn from_wire(byte: u8) -> Self {
        if byte == 0 {
            Self::Rfid
        } else {
            Self::Manual
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rfid => "rfid",
            Self::Manual => "manual",
        }
    }
}

/// Decoded START packet (NOTIFY 0x14 or RESPONSE 0x16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStart {
    /// Session correlation byte, echoed by every DATA and END packet.
    pub session_id: u8,
    pub extruder_id: u8,
    pub channel_id: u8,
    pub total_packets: u8,
    pub total_bytes: u16,
    pub source: TransferSource,
}

/// Decoded DATA packet (0x17). `data` holds exactly the valid bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferData {
    pub session_id: u8,
    pub packet_no: u8,
    pub data: Vec<u8>,
}

/// Decoded END packet (0x18).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEnd {
    pub session_id: u8,
    pub total_packets: u8,
    pub checksum: u16,
    pub status: u8,
}

/// Session-scoped failures. These abort one transfer and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("checksum mismatch (computed 0x{computed:04X}, declared 0x{declared:04X})")]
    ChecksumError { computed: u16, declared: u16 },
    #[error("length mismatch (got {got}, want {want})")]
    LengthMismatch { got: usize, want: usize },
    #[error("no progress for {0:?}")]
    TransferTimeout(Duration),
    #[error("superseded by a new transfer start")]
    Superseded,
    #[error("cabinet reported {}", describe_cabinet_error(*primary, *extended))]
    CabinetError { primary: u8, extended: u8 },
}

/// Result of feeding one packet (or a reaper sweep) into the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A transfer finished and verified; `payload` is the reassembled bytes.
    Completed {
        extruder_id: u8,
        channel_id: u8,
        source: TransferSource,
        payload: Vec<u8>,
    },
    /// A transfer was cancelled or failed verification.
    Aborted {
        extruder_id: u8,
        error: SessionError,
    },
}

/// One in-flight transfer.
#[derive(Debug)]
struct Session {
    id: u8,
    extruder_id: u8,
    channel_id: u8,
    source: TransferSource,
    total_packets: u8,
    expected_bytes: usize,
    buf: Vec<u8>,
    packet_seen: Vec<bool>,
    received_bytes: usize,
    last_progress: Instant,
}

impl Session {
    fn new(start: &TransferStart, now: Instant) -> Self {
        Self {
            id: start.session_id,
            extruder_id: start.extruder_id,
            channel_id: start.channel_id,
            source: start.source,
            total_packets: start.total_packets,
            expected_bytes: start.total_bytes as usize,
            buf: vec![0; start.total_bytes as usize],
            packet_seen: vec![false; start.total_packets as usize],
            received_bytes: 0,
            last_progress: now,
        }
    }
}

/// Tracks active transfers, keyed by extruder.
#[derive(Debug)]
pub struct SessionTracker {
    timeout: Duration,
    sessions: HashMap<u8, Session>,
}

impl SessionTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sessions: HashMap::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_active(&self, extruder_id: u8) -> bool {
        self.sessions.contains_key(&extruder_id)
    }

    /// Opens a session. An active session for the same extruder is cancelled
    /// (the cabinet is expected to retry), unless the new START carries the
    /// same session id, which restarts the transfer in place.
    pub fn start(&mut self, start: TransferStart, now: Instant) -> Option<SessionEvent> {
        if start.total_bytes as usize > MAX_TRANSFER_BYTES {
            warn!(
                session = start.session_id,
                bytes = start.total_bytes,
                "rejecting transfer start beyond maximum length"
            );
            return None;
        }

        let superseded = match self.sessions.remove(&start.extruder_id) {
            Some(old) if old.id == start.session_id => {
                debug!(
                    session = old.id,
                    extruder = old.extruder_id,
                    "restarting transfer in place"
                );
                None
            }
            Some(old) => Some(SessionEvent::Aborted {
                extruder_id: old.extruder_id,
                error: SessionError::Superseded,
            }),
            None => None,
        };

        debug!(
            session = start.session_id,
            extruder = start.extruder_id,
            channel = start.channel_id,
            packets = start.total_packets,
            bytes = start.total_bytes,
            "transfer start"
        );
        self.sessions
            .insert(start.extruder_id, Session::new(&start, now));
        superseded
    }

    /// Applies a DATA packet to its session.
    ///
    /// Packets with an unknown session id, an out-of-range packet number, or
    /// more bytes than the session still expects are logged and dropped
    /// without aborting: the cabinet may retransmit. A duplicate packet with
    /// identical bytes is idempotent; differing bytes abort the session.
    pub fn data(&mut self, packet: TransferData, now: Instant) -> Option<SessionEvent> {
        let Some(extruder_id) = self.find_extruder(packet.session_id) else {
            debug!(session = packet.session_id, "data packet for unknown session");
            return None;
        };
        let session = self.sessions.get_mut(&extruder_id).expect("session exists");

        if packet.packet_no == 0 || packet.packet_no > session.total_packets {
            warn!(
                session = session.id,
                packet = packet.packet_no,
                total = session.total_packets,
                "packet number out of range, dropping"
            );
            return None;
        }
        if packet.data.is_empty() || packet.data.len() > BYTES_PER_PACKET {
            warn!(
                session = session.id,
                packet = packet.packet_no,
                len = packet.data.len(),
                "invalid data length, dropping"
            );
            return None;
        }

        let offset = (packet.packet_no as usize - 1) * BYTES_PER_PACKET;
        if offset + packet.data.len() > session.expected_bytes {
            warn!(
                session = session.id,
                packet = packet.packet_no,
                "data exceeds declared transfer length, dropping"
            );
            return None;
        }

        let slot = &mut session.buf[offset..offset + packet.data.len()];
        if session.packet_seen[packet.packet_no as usize - 1] {
            if slot == packet.data.as_slice() {
                debug!(
                    session = session.id,
                    packet = packet.packet_no,
                    "duplicate packet, ignoring"
                );
                return None;
            }
            // Same packet number, different bytes: the payload can no longer
            // be trusted.
            let error = SessionError::ChecksumError {
                computed: checksum(slot),
                declared: checksum(&packet.data),
            };
            self.sessions.remove(&extruder_id);
            return Some(SessionEvent::Aborted { extruder_id, error });
        }

        slot.copy_from_slice(&packet.data);
        session.packet_seen[packet.packet_no as usize - 1] = true;
        session.received_bytes += packet.data.len();
        session.last_progress = now;
        None
    }

    /// Finalizes a session against its END packet.
    pub fn end(&mut self, end: TransferEnd, _now: Instant) -> Option<SessionEvent> {
        let Some(extruder_id) = self.find_extruder(end.session_id) else {
            debug!(session = end.session_id, "end packet for unknown session");
            return None;
        };
        let session = self.sessions.remove(&extruder_id).expect("session exists");

        if end.total_packets != session.total_packets {
            return Some(SessionEvent::Aborted {
                extruder_id,
                error: SessionError::LengthMismatch {
                    got: end.total_packets as usize,
                    want: session.total_packets as usize,
                },
            });
        }
        if session.received_bytes != session.expected_bytes {
            return Some(SessionEvent::Aborted {
                extruder_id,
                error: SessionError::LengthMismatch {
                    got: session.received_bytes,
                    want: session.expected_bytes,
                },
            });
        }
        let computed = checksum(&session.buf);
        if computed != end.checksum {
            return Some(SessionEvent::Aborted {
                extruder_id,
                error: SessionError::ChecksumError {
                    computed,
                    declared: end.checksum,
                },
            });
        }
        if end.status != 0 {
            return Some(SessionEvent::Aborted {
                extruder_id,
                error: SessionError::CabinetError {
                    primary: end.status,
                    extended: 0,
                },
            });
        }

        Some(SessionEvent::Completed {
            extruder_id,
            channel_id: session.channel_id,
            source: session.source,
            payload: session.buf,
        })
    }

    /// Cancels the session for `extruder_id` after a cabinet error frame.
    pub fn cabinet_error(
        &mut self,
        extruder_id: u8,
        primary: u8,
        extended: u8,
    ) -> Option<SessionEvent> {
        self.sessions.remove(&extruder_id)?;
        Some(SessionEvent::Aborted {
            extruder_id,
            error: SessionError::CabinetError { primary, extended },
        })
    }

    /// Cancels every session whose age has reached the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<SessionEvent> {
        let timeout = self.timeout;
        let expired: Vec<u8> = self
            .sessions
            .values()
            .filter(|s| now.duration_since(s.last_progress) >= timeout)
            .map(|s| s.extruder_id)
            .collect();

        expired
            .into_iter()
            .map(|extruder_id| {
                self.sessions.remove(&extruder_id);
                SessionEvent::Aborted {
                    extruder_id,
                    error: SessionError::TransferTimeout(timeout),
                }
            })
            .collect()
    }

    /// Drops every active session without emitting events (shutdown path).
    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    fn find_extruder(&self, session_id: u8) -> Option<u8> {
        self.sessions
            .values()
            .find(|s| s.id == session_id)
            .map(|s| s.extruder_id)
    }
}

/// Unsigned 16-bit wrapping sum of the payload bytes.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// Names the cabinet's RFID error codes for logging.
pub fn describe_cabinet_error(primary: u8, extended: u8) -> String {
    let kind = match primary {
        0x01 => "tag read failed",
        0x02 => "no filament present",
        0x03 => "invalid tag data",
        0x04 => "read timeout",
        0x05 => "no channel mapping",
        0x06 => "reader busy",
        _ => "unknown error",
    };
    let detail = match (primary, extended) {
        (_, 0x00) => None,
        (0x01, 0x01) => Some("UART error"),
        (0x01, 0x02) => Some("tag checksum"),
        (0x01, 0x03) => Some("no tag in range"),
        (0x01, 0x04) => Some("authentication failure"),
        _ => Some("unrecognized detail"),
    };
    match detail {
        Some(detail) => format!("{kind} ({detail}, 0x{primary:02X}/0x{extended:02X})"),
        None => format!("{kind} (0x{primary:02X})"),
    }
}
