//! Cabinet protocol engine.
//!
//! Encodes and decodes the application messages exchanged with the filament
//! cabinet, runs the handshake and heartbeat that keep the link alive, and
//! drives the RFID session tracker. Inbound traffic is normalized into
//! [`ProtocolEvent`]s drained by the orchestrator; outbound operations are
//! issued through the [`CabinetClient`] handle.
//!
//! Wire format: 11-bit identifiers, byte 0 of the payload is the command
//! code. 16-bit protocol header fields are split high-byte-then-low-byte;
//! RFID record *content* is little-endian (see [`crate::opentag`]).

use crate::opentag::FilamentRecord;
use crate::rfid::{
    SessionError, SessionEvent, SessionTracker, TransferData, TransferEnd, TransferSource,
    TransferStart, BYTES_PER_PACKET,
};
use crate::transport::{Frame, TransportEvent, TransportHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Commands hub → cabinet.
pub const HUB_COMMAND_ID: u16 = 0x10A;
/// Commands cabinet → hub.
pub const CABINET_COMMAND_ID: u16 = 0x10B;
/// Handshake request hub → cabinet.
pub const HANDSHAKE_REQUEST_ID: u16 = 0x3F0;
/// Handshake response cabinet → hub.
pub const HANDSHAKE_RESPONSE_ID: u16 = 0x3F1;

/// Protocol version byte carried in the handshake.
pub const PROTOCOL_VERSION: u8 = 0x01;

// Command codes (payload byte 0).
const CMD_HEARTBEAT: u8 = 0x00;
const CMD_FEED: u8 = 0x01;
const CMD_CANCEL_FEED: u8 = 0x02;
const CMD_EXTRUDER_STATUS_QUERY: u8 = 0x03;
const CMD_PRINT_STARTED: u8 = 0x04;
const CMD_PRINT_PAUSED: u8 = 0x05;
const CMD_PRINT_RESUMED: u8 = 0x06;
const CMD_PRINT_COMPLETED: u8 = 0x07;
const CMD_PRINT_CANCELLED: u8 = 0x08;
const CMD_PRINT_ERROR: u8 = 0x09;
const CMD_MAPPING_QUERY: u8 = 0x0A;
const CMD_MAPPING_RESPONSE: u8 = 0x0B;
const CMD_MAPPING_SET: u8 = 0x0C;
const CMD_STATUS_QUERY: u8 = 0x0D;
const CMD_STATUS_RESPONSE: u8 = 0x0E;
const CMD_RFID_NOTIFY_START: u8 = 0x14;
const CMD_RFID_REQUEST: u8 = 0x15;
const CMD_RFID_RESPONSE_START: u8 = 0x16;
const CMD_RFID_DATA: u8 = 0x17;
const CMD_RFID_END: u8 = 0x18;
const CMD_RFID_ERROR: u8 = 0x19;

/// Extruder byte the cabinet sends when it does not name one.
const EXTRUDER_UNSPECIFIED: u8 = 0xFF;

/// Handshake request cadence while waiting for a response.
const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Overall handshake deadline before the link is torn down and re-opened.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Heartbeat cadence while the link is up.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Inbound silence after which the link is declared stale.
const LINK_STALE_TIMEOUT: Duration = Duration::from_secs(5);

/// Send attempts for a feed request on transport errors.
const FEED_SEND_RETRIES: u32 = 3;

/// Delay between feed send attempts.
const FEED_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Capacity of the command channel into the engine task.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Protocol-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// No handshake response within the deadline; recovered by reconnect.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    /// The cabinet speaks a different protocol version. Fatal.
    #[error("protocol version mismatch (ours 0x{ours:02X}, cabinet 0x{theirs:02X})")]
    VersionMismatch { ours: u8, theirs: u8 },
    /// A frame that cannot be decoded; logged and dropped.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

fn malformed(context: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedFrame(context.into())
}

/// Link lifecycle as seen by the engine. Opening and re-opening the socket
/// itself is the transport's business; the engine only distinguishes the
/// phases it drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Handshaking,
    Up,
    Reconnecting,
}

/// Outcome byte of a cabinet feed acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    InProgress,
    Complete,
    Failed,
}

impl FeedStatus {
    fn from_wire(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(Self::InProgress),
            0x01 => Ok(Self::Complete),
            0x02 => Ok(Self::Failed),
            other => Err(malformed(format!("feed status 0x{other:02X}"))),
        }
    }
}

/// Print lifecycle notifications to the cabinet (commands 0x04–0x09).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintStateNotify {
    Started,
    Paused,
    Resumed,
    Completed,
    Cancelled,
    Error,
}

impl PrintStateNotify {
    fn code(self) -> u8 {
        match self {
            Self::Started => CMD_PRINT_STARTED,
            Self::Paused => CMD_PRINT_PAUSED,
            Self::Resumed => CMD_PRINT_RESUMED,
            Self::Completed => CMD_PRINT_COMPLETED,
            Self::Cancelled => CMD_PRINT_CANCELLED,
            Self::Error => CMD_PRINT_ERROR,
        }
    }
}

/// A decoded inbound message from the cabinet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InboundMessage {
    HandshakeResponse { version: u8 },
    FeedResult { extruder_id: u8, status: FeedStatus },
    /// Legacy per-extruder status query, answered like [`Self::FilamentStatusQuery`].
    ExtruderStatusQuery,
    MappingQuery,
    MappingSet { entries: Vec<(u8, u8)> },
    FilamentStatusQuery,
    RfidStart(TransferStart),
    RfidData(TransferData),
    RfidEnd(TransferEnd),
    RfidError { extruder_id: u8, primary: u8, extended: u8 },
    Heartbeat,
}

impl InboundMessage {
    /// Decodes a raw frame.
    ///
    /// Frames on identifiers outside the protocol yield `Ok(None)` and are
    /// ignored; recognized identifiers with unparseable payloads are a
    /// [`ProtocolError::MalformedFrame`].
    pub fn decode(frame: &Frame) -> Result<Option<Self>, ProtocolError> {
        match frame.id() {
            HANDSHAKE_RESPONSE_ID => {
                let version = *frame
                    .data()
                    .first()
                    .ok_or_else(|| malformed("empty handshake response"))?;
                Ok(Some(Self::HandshakeResponse { version }))
            }
            CABINET_COMMAND_ID => Self::decode_command(frame.data()).map(Some),
            _ => Ok(None),
        }
    }

    fn decode_command(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&cmd, rest) = data
            .split_first()
            .ok_or_else(|| malformed("empty command payload"))?;
        match cmd {
            CMD_HEARTBEAT => Ok(Self::Heartbeat),
            CMD_FEED => {
                let [extruder_id, status, ..] = *rest else {
                    return Err(malformed("short feed acknowledgement"));
                };
                Ok(Self::FeedResult {
                    extruder_id,
                    status: FeedStatus::from_wire(status)?,
                })
            }
            CMD_EXTRUDER_STATUS_QUERY => Ok(Self::ExtruderStatusQuery),
            CMD_MAPPING_QUERY => Ok(Self::MappingQuery),
            CMD_MAPPING_SET => {
                let (&count, pairs) = rest
                    .split_first()
                    .ok_or_else(|| malformed("empty mapping set"))?;
                let needed = count as usize * 2;
                if pairs.len() < needed {
                    return Err(malformed(format!(
                        "mapping set declares {count} pairs but carries {} bytes",
                        pairs.len()
                    )));
                }
                let entries = pairs[..needed]
                    .chunks_exact(2)
                    .map(|pair| (pair[0], pair[1]))
                    .collect();
                Ok(Self::MappingSet { entries })
            }
            CMD_STATUS_QUERY => Ok(Self::FilamentStatusQuery),
            CMD_RFID_NOTIFY_START => {
                // [seq, channel, packets, len_hi, len_lo, extruder, source]
                let [session_id, channel_id, total_packets, len_hi, len_lo, extruder_id, source, ..] =
                    *rest
                else {
                    return Err(malformed("short RFID notify start"));
                };
                Ok(Self::RfidStart(TransferStart {
                    session_id,
                    extruder_id,
                    channel_id,
                    total_packets,
                    total_bytes: u16::from_be_bytes([len_hi, len_lo]),
                    source: TransferSource::from_wire(source),
                }))
            }
            CMD_RFID_RESPONSE_START => {
                // Same layout as notify with extruder and channel swapped:
                // [seq, extruder, packets, len_hi, len_lo, channel, source]
                let [session_id, extruder_id, total_packets, len_hi, len_lo, channel_id, source, ..] =
                    *rest
                else {
                    return Err(malformed("short RFID response start"));
                };
                Ok(Self::RfidStart(TransferStart {
                    session_id,
                    extruder_id,
                    channel_id,
                    total_packets,
                    total_bytes: u16::from_be_bytes([len_hi, len_lo]),
                    source: TransferSource::from_wire(source),
                }))
            }
            CMD_RFID_DATA => {
                let [session_id, packet_no, count, ..] = *rest else {
                    return Err(malformed("short RFID data packet"));
                };
                if count == 0 || count as usize > BYTES_PER_PACKET {
                    return Err(malformed(format!("RFID data count {count}")));
                }
                let data = rest
                    .get(3..3 + count as usize)
                    .ok_or_else(|| malformed("RFID data shorter than its count"))?;
                Ok(Self::RfidData(TransferData {
                    session_id,
                    packet_no,
                    data: data.to_vec(),
                }))
            }
            CMD_RFID_END => {
                let [session_id, total_packets, ck_hi, ck_lo, status, ..] = *rest else {
                    return Err(malformed("short RFID end packet"));
                };
                Ok(Self::RfidEnd(TransferEnd {
                    session_id,
                    total_packets,
                    checksum: u16::from_be_bytes([ck_hi, ck_lo]),
                    status,
                }))
            }
            CMD_RFID_ERROR => {
                let [extruder_id, primary, ..] = *rest else {
                    return Err(malformed("short RFID error packet"));
                };
                let extended = rest.get(2).copied().unwrap_or(0);
                Ok(Self::RfidError {
                    extruder_id,
                    primary,
                    extended,
                })
            }
            other => Err(malformed(format!("unknown command 0x{other:02X}"))),
        }
    }
}

// Outbound frame builders. The Frame invariant cannot fail here: ids are
// protocol constants and payloads are at most 8 bytes by construction.
fn hub_frame(payload: &[u8]) -> Frame {
    Frame::new(HUB_COMMAND_ID, payload).expect("hub frame within CAN limits")
}

pub fn encode_handshake_request() -> Frame {
    Frame::new(HANDSHAKE_REQUEST_ID, &[PROTOCOL_VERSION]).expect("handshake frame within CAN limits")
}

pub fn encode_heartbeat(seq: u8) -> Frame {
    hub_frame(&[CMD_HEARTBEAT, seq])
}

pub fn encode_request_feed(extruder_id: u8, force: bool) -> Frame {
    hub_frame(&[CMD_FEED, extruder_id, u8::from(force)])
}

pub fn encode_cancel_feed(extruder_id: u8) -> Frame {
    hub_frame(&[CMD_CANCEL_FEED, extruder_id])
}

pub fn encode_print_state(notify: PrintStateNotify) -> Frame {
    hub_frame(&[notify.code()])
}

/// Encodes the mapping reply as `[0x0B, n, (extruder, zone, is_default) × n]`
/// frames, where `n` counts the triples in that frame. Two triples fit a
/// classic frame, so larger mappings are chunked; the mapping is total over
/// configured extruders and every one of them is reported.
pub fn encode_mapping_response(entries: &[(u8, u8, bool)]) -> Vec<Frame> {
    if entries.is_empty() {
        return vec![hub_frame(&[CMD_MAPPING_RESPONSE, 0])];
    }
    entries
        .chunks(2)
        .map(|chunk| {
            let mut payload = vec![CMD_MAPPING_RESPONSE, chunk.len() as u8];
            for &(extruder_id, zone_id, is_default) in chunk {
                payload.extend_from_slice(&[extruder_id, zone_id, u8::from(is_default)]);
            }
            hub_frame(&payload)
        })
        .collect()
}

pub fn encode_filament_status(validity: u8, bitmap: u8) -> Frame {
    hub_frame(&[CMD_STATUS_RESPONSE, validity, bitmap])
}

pub fn encode_rfid_request(seq: u8, extruder_id: u8) -> Frame {
    hub_frame(&[CMD_RFID_REQUEST, seq, extruder_id])
}

/// Packs per-zone filament presence into the status bitmap (bit i = zone i).
pub fn encode_zone_bitmap<'a>(zones: impl Iterator<Item = (&'a u8, &'a bool)>) -> u8 {
    zones.fold(0u8, |acc, (&zone, &present)| {
        if present && zone < 8 {
            acc | (1 << zone)
        } else {
            acc
        }
    })
}

/// Wrapping sequence counter for outbound messages needing correlation.
#[derive(Debug, Default)]
pub struct SequenceCounter(u8);

impl SequenceCounter {
    pub fn next(&mut self) -> u8 {
        self.0 = self.0.wrapping_add(1);
        self.0
    }
}

/// Events sent from the engine task to the orchestrator.
#[derive(Debug)]
#[non_exhaustive]
pub enum ProtocolEvent {
    /// Handshake completed; the cabinet is reachable.
    LinkUp,
    /// The link was lost (transport failure, stale silence, or handshake
    /// timeout); reconnect is in progress.
    LinkDown,
    /// The cabinet acknowledged a feed request.
    FeedResult { extruder_id: u8, status: FeedStatus },
    /// The cabinet asked for the filament-presence bitmap.
    FilamentStatusQuery {
        /// True when asked via the deprecated 0x03 query.
        legacy: bool,
    },
    /// The cabinet asked for the extruder→zone mapping.
    MappingQuery,
    /// The cabinet pushed a new extruder→zone mapping.
    MappingSet { entries: Vec<(u8, u8)> },
    /// An RFID transfer completed and verified.
    RfidCompleted {
        extruder_id: u8,
        channel_id: u8,
        source: TransferSource,
        record: FilamentRecord,
    },
    /// An RFID transfer was cancelled or failed verification.
    RfidAborted {
        extruder_id: u8,
        error: SessionError,
    },
    /// Unrecoverable protocol failure (version mismatch).
    Fatal(ProtocolError),
}

/// Outbound operations accepted by the engine task.
#[derive(Debug)]
enum EngineCommand {
    RequestFeed { extruder_id: u8, force: bool },
    CancelFeed { extruder_id: u8 },
    NotifyPrintState(PrintStateNotify),
    SendFilamentStatus { validity: u8, bitmap: u8 },
    SendMapping { entries: Vec<(u8, u8, bool)> },
    RequestRfidData { extruder_id: u8 },
    HaltOutbound,
    ResumeOutbound,
}

/// Handle for issuing typed sends to the cabinet.
#[derive(Debug, Clone)]
pub struct CabinetClient {
    command_tx: mpsc::Sender<EngineCommand>,
}

impl CabinetClient {
    async fn command(&self, command: EngineCommand) {
        if self.command_tx.send(command).await.is_err() {
            warn!("protocol engine is gone, dropping command");
        }
    }

    pub async fn request_feed(&self, extruder_id: u8, force: bool) {
        self.command(EngineCommand::RequestFeed { extruder_id, force })
            .await;
    }

    pub async fn cancel_feed(&self, extruder_id: u8) {
        self.command(EngineCommand::CancelFeed { extruder_id }).await;
    }

    pub async fn notify_print_state(&self, notify: PrintStateNotify) {
        self.command(EngineCommand::NotifyPrintState(notify)).await;
    }

    pub async fn send_filament_status(&self, validity: u8, bitmap: u8) {
        self.command(EngineCommand::SendFilamentStatus { validity, bitmap })
            .await;
    }

    pub async fn send_mapping(&self, entries: Vec<(u8, u8, bool)>) {
        self.command(EngineCommand::SendMapping { entries }).await;
    }

    pub async fn request_rfid_data(&self, extruder_id: u8) {
        self.command(EngineCommand::RequestRfidData { extruder_id })
            .await;
    }

    /// Stops outbound command traffic after a fatal error. Heartbeats
    /// continue so the link stays alive for diagnostics.
    pub async fn halt_outbound(&self) {
        self.command(EngineCommand::HaltOutbound).await;
    }

    /// Lifts the outbound halt after an operator reset.
    pub async fn resume_outbound(&self) {
        self.command(EngineCommand::ResumeOutbound).await;
    }
}

/// Engine tuning taken from the configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Extruder substituted when the cabinet sends 0xFF.
    pub default_extruder: u8,
    /// RFID session no-progress timeout.
    pub transfer_timeout: Duration,
    /// Reaper sweep cadence.
    pub cleanup_interval: Duration,
    /// Gate for RFID session handling.
    pub rfid_enabled: bool,
}

/// Spawns the engine task.
pub fn spawn(
    settings: EngineSettings,
    transport: TransportHandle,
    transport_rx: mpsc::Receiver<TransportEvent>,
    event_tx: mpsc::Sender<ProtocolEvent>,
    shutdown: watch::Receiver<bool>,
) -> (CabinetClient, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let engine = Engine {
        tracker: SessionTracker::new(settings.transfer_timeout),
        settings,
        transport,
        event_tx,
        link: LinkState::Closed,
        seq: SequenceCounter::default(),
        last_rx: Instant::now(),
        handshake_started: None,
        outbound_halted: false,
    };
    let task = tokio::spawn(engine.run(transport_rx, command_rx, shutdown));
    (CabinetClient { command_tx }, task)
}

struct Engine {
    settings: EngineSettings,
    transport: TransportHandle,
    event_tx: mpsc::Sender<ProtocolEvent>,
    link: LinkState,
    seq: SequenceCounter,
    last_rx: Instant,
    handshake_started: Option<Instant>,
    tracker: SessionTracker,
    outbound_halted: bool,
}

impl Engine {
    async fn run(
        mut self,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        mut command_rx: mpsc::Receiver<EngineCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut handshake_tick = tokio::time::interval(HANDSHAKE_RETRY_INTERVAL);
        handshake_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut reaper = tokio::time::interval(self.settings.cleanup_interval);
        reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Sessions in progress are abandoned, no partial
                        // records are emitted.
                        self.tracker.clear();
                        break;
                    }
                }

                Some(event) = transport_rx.recv() => match event {
                    TransportEvent::Up => self.begin_handshake(),
                    TransportEvent::Down { reason } => {
                        debug!(reason = %reason, "link lost");
                        // The transport is already cycling the socket.
                        self.mark_link_down().await;
                    }
                    TransportEvent::Frame(frame) => {
                        self.last_rx = Instant::now();
                        self.handle_frame(&frame).await;
                    }
                },

                _ = handshake_tick.tick(), if self.link == LinkState::Handshaking => {
                    self.drive_handshake().await;
                }

                _ = heartbeat.tick(), if self.link == LinkState::Up => {
                    self.drive_heartbeat().await;
                }

                _ = reaper.tick() => {
                    for event in self.tracker.expire(Instant::now()) {
                        self.emit_session_event(event).await;
                    }
                }

                Some(command) = command_rx.recv() => self.handle_command(command).await,
            }
        }

        debug!("protocol engine exiting");
    }

    fn begin_handshake(&mut self) {
        info!("CAN transport up, handshaking");
        self.link = LinkState::Handshaking;
        self.handshake_started = Some(Instant::now());
        if let Err(e) = self.transport.send(encode_handshake_request()) {
            debug!(error = %e, "handshake request not queued, will retry");
        }
    }

    async fn drive_handshake(&mut self) {
        let started = self.handshake_started.unwrap_or_else(Instant::now);
        if started.elapsed() >= HANDSHAKE_DEADLINE {
            let err = ProtocolError::HandshakeTimeout(HANDSHAKE_DEADLINE);
            warn!(error = %err, "tearing the link down");
            self.link_lost().await;
            return;
        }
        if let Err(e) = self.transport.send(encode_handshake_request()) {
            debug!(error = %e, "handshake request not queued, will retry");
        }
    }

    async fn drive_heartbeat(&mut self) {
        if self.last_rx.elapsed() >= LINK_STALE_TIMEOUT {
            warn!(
                silence = ?self.last_rx.elapsed(),
                "no inbound traffic, declaring the link stale"
            );
            self.link_lost().await;
            return;
        }
        let seq = self.seq.next();
        // Heartbeats drop on transport errors.
        if let Err(e) = self.transport.send_urgent(encode_heartbeat(seq)) {
            debug!(error = %e, "heartbeat dropped");
        }
    }

    /// Marks the link down and asks the transport to cycle the socket.
    async fn link_lost(&mut self) {
        self.transport.request_reconnect();
        self.mark_link_down().await;
    }

    async fn mark_link_down(&mut self) {
        let was_usable = self.link == LinkState::Up || self.link == LinkState::Handshaking;
        self.link = LinkState::Reconnecting;
        self.handshake_started = None;
        // In-flight transfers cannot survive the link; drop them quietly,
        // the cabinet re-announces after reconnect.
        self.tracker.clear();
        if was_usable {
            self.emit(ProtocolEvent::LinkDown).await;
        }
    }

    async fn handle_frame(&mut self, frame: &Frame) {
        let message = match InboundMessage::decode(frame) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(frame = %frame, "ignoring frame outside the protocol");
                return;
            }
            Err(e) => {
                warn!(frame = %frame, error = %e, "dropping malformed frame");
                return;
            }
        };

        match message {
            InboundMessage::HandshakeResponse { version } => {
                self.handle_handshake_response(version).await;
            }
            InboundMessage::Heartbeat => {}
            InboundMessage::FeedResult {
                extruder_id,
                status,
            } => {
                self.emit(ProtocolEvent::FeedResult {
                    extruder_id,
                    status,
                })
                .await;
            }
            InboundMessage::ExtruderStatusQuery => {
                debug!("deprecated extruder status query (0x03), answering like 0x0D");
                self.emit(ProtocolEvent::FilamentStatusQuery { legacy: true })
                    .await;
            }
            InboundMessage::FilamentStatusQuery => {
                self.emit(ProtocolEvent::FilamentStatusQuery { legacy: false })
                    .await;
            }
            InboundMessage::MappingQuery => self.emit(ProtocolEvent::MappingQuery).await,
            InboundMessage::MappingSet { entries } => {
                self.emit(ProtocolEvent::MappingSet { entries }).await;
            }
            InboundMessage::RfidStart(mut start) => {
                if !self.settings.rfid_enabled {
                    debug!("RFID disabled, ignoring transfer start");
                    return;
                }
                if start.extruder_id == EXTRUDER_UNSPECIFIED {
                    start.extruder_id = self.settings.default_extruder;
                }
                if let Some(event) = self.tracker.start(start, Instant::now()) {
                    self.emit_session_event(event).await;
                }
            }
            InboundMessage::RfidData(packet) => {
                if let Some(event) = self.tracker.data(packet, Instant::now()) {
                    self.emit_session_event(event).await;
                }
            }
            InboundMessage::RfidEnd(end) => {
                if let Some(event) = self.tracker.end(end, Instant::now()) {
                    self.emit_session_event(event).await;
                }
            }
            InboundMessage::RfidError {
                extruder_id,
                primary,
                extended,
            } => {
                let extruder_id = if extruder_id == EXTRUDER_UNSPECIFIED {
                    self.settings.default_extruder
                } else {
                    extruder_id
                };
                match self.tracker.cabinet_error(extruder_id, primary, extended) {
                    Some(event) => self.emit_session_event(event).await,
                    None => {
                        // No session to cancel; still surface the error.
                        self.emit(ProtocolEvent::RfidAborted {
                            extruder_id,
                            error: SessionError::CabinetError { primary, extended },
                        })
                        .await;
                    }
                }
            }
        }
    }

    async fn handle_handshake_response(&mut self, version: u8) {
        if self.link != LinkState::Handshaking {
            debug!("handshake response outside handshaking, ignoring");
            return;
        }
        if version != PROTOCOL_VERSION {
            let err = ProtocolError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: version,
            };
            error!(error = %err, "cabinet firmware is incompatible");
            self.outbound_halted = true;
            self.link = LinkState::Up;
            self.emit(ProtocolEvent::Fatal(err)).await;
            return;
        }
        info!(version = PROTOCOL_VERSION, "handshake complete, link up");
        self.link = LinkState::Up;
        self.handshake_started = None;
        self.last_rx = Instant::now();
        self.transport.reset_backoff();
        self.emit(ProtocolEvent::LinkUp).await;
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        if self.outbound_halted
            && !matches!(
                command,
                EngineCommand::HaltOutbound | EngineCommand::ResumeOutbound
            )
        {
            warn!(?command, "outbound halted, dropping command");
            return;
        }
        match command {
            EngineCommand::RequestFeed { extruder_id, force } => {
                // Fire-and-forget with bounded retries; retries run off the
                // engine loop so inbound handling is never stalled.
                let transport = self.transport.clone();
                let frame = encode_request_feed(extruder_id, force);
                tokio::spawn(async move {
                    for attempt in 1..=FEED_SEND_RETRIES {
                        match transport.send(frame.clone()) {
                            Ok(()) => return,
                            Err(e) if attempt < FEED_SEND_RETRIES => {
                                debug!(attempt, error = %e, "feed request retry");
                                tokio::time::sleep(FEED_RETRY_DELAY).await;
                            }
                            Err(e) => {
                                error!(extruder = extruder_id, error = %e, "feed request failed");
                            }
                        }
                    }
                });
            }
            EngineCommand::CancelFeed { extruder_id } => {
                self.send_logged(encode_cancel_feed(extruder_id), "cancel feed");
            }
            EngineCommand::NotifyPrintState(notify) => {
                self.send_logged(encode_print_state(notify), "print state notify");
            }
            EngineCommand::SendFilamentStatus { validity, bitmap } => {
                self.send_logged(encode_filament_status(validity, bitmap), "filament status");
            }
            EngineCommand::SendMapping { entries } => {
                for frame in encode_mapping_response(&entries) {
                    self.send_logged(frame, "mapping response");
                }
            }
            EngineCommand::RequestRfidData { extruder_id } => {
                let seq = self.seq.next();
                self.send_logged(encode_rfid_request(seq, extruder_id), "RFID data request");
            }
            EngineCommand::HaltOutbound => {
                warn!("halting outbound command traffic");
                self.outbound_halted = true;
            }
            EngineCommand::ResumeOutbound => {
                info!("resuming outbound command traffic");
                self.outbound_halted = false;
            }
        }
    }

    fn send_logged(&self, frame: Frame, what: &str) {
        if let Err(e) = self.transport.send(frame) {
            warn!(error = %e, "{what} not sent");
        }
    }

    async fn emit_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Completed {
                extruder_id,
                channel_id,
                source,
                payload,
            } => {
                if !payload.is_empty() && payload.len() != crate::opentag::RECORD_LEN {
                    debug!(
                        len = payload.len(),
                        "record length differs from the firmware's usual layout"
                    );
                }
                // The record is only constructed after reassembly and
                // checksum verification have both passed.
                let record = FilamentRecord::parse(&payload);
                self.emit(ProtocolEvent::RfidCompleted {
                    extruder_id,
                    channel_id,
                    source,
                    record,
                })
                .await;
            }
            SessionEvent::Aborted { extruder_id, error } => {
                warn!(extruder = extruder_id, error = %error, "RFID session aborted");
                self.emit(ProtocolEvent::RfidAborted { extruder_id, error })
                    .await;
            }
        }
    }

    async fn emit(&self, event: ProtocolEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("orchestrator is gone, dropping event");
        }
    }
}
