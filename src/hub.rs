//! Orchestrator: wires printer observations and cabinet protocol events
//! into state-machine transitions and issues the side effects the
//! transition table calls for.
//!
//! This task is the sole writer to the [`StateManager`], so every
//! transition is serialized through one place. Receive loops never call
//! back into state; they only emit events onto the channels drained here.

use crate::config::Config;
use crate::klipper::{KlipperClient, ObserverEvent, PrintState};
use crate::opentag::FilamentRecord;
use crate::protocol::{
    encode_zone_bitmap, CabinetClient, FeedStatus, PrintStateNotify, ProtocolError, ProtocolEvent,
};
use crate::rfid::TransferSource;
use crate::state::{FatalKind, StateManager, SystemEvent, SystemState};
use crate::storage::RecordStore;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Sensor data marker in the status reply: 0 = fresh, 1 = printer offline.
const STATUS_VALID: u8 = 0;
const STATUS_STALE: u8 = 1;

/// The orchestrator task.
pub struct Orchestrator {
    state: StateManager,
    cabinet: CabinetClient,
    printer: KlipperClient,
    store: RecordStore,
    runout_enabled: bool,
    rfid_enabled: bool,
    auto_set_temperature: bool,
    /// Extruder → buffer zone. Seeded from config, updatable by the
    /// cabinet's mapping-set command.
    mapping: BTreeMap<u8, u8>,
    default_active: u8,
    /// Latest per-extruder filament presence.
    sensors: BTreeMap<u8, bool>,
    last_print_state: Option<PrintState>,
    printer_connected: bool,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        state: StateManager,
        cabinet: CabinetClient,
        printer: KlipperClient,
        store: RecordStore,
    ) -> Self {
        Self {
            state,
            cabinet,
            printer,
            store,
            runout_enabled: config.filament_runout.enabled,
            rfid_enabled: config.rfid.enabled,
            auto_set_temperature: config.rfid.auto_set_temperature,
            mapping: config.extruder_mapping.tube_mapping.clone(),
            default_active: config.extruder_mapping.default_active,
            sensors: BTreeMap::new(),
            last_print_state: None,
            printer_connected: false,
        }
    }

    /// Drains the event streams and the operator-reset trigger until
    /// shutdown.
    pub async fn run(
        mut self,
        mut protocol_rx: mpsc::Receiver<ProtocolEvent>,
        mut observer_rx: mpsc::Receiver<ObserverEvent>,
        mut reset_rx: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                Some(event) = protocol_rx.recv() => self.on_protocol(event).await,
                Some(event) = observer_rx.recv() => self.on_observer(event).await,
                Some(()) = reset_rx.recv() => self.on_operator_reset().await,
                else => break,
            }
        }
        debug!("orchestrator exiting");
    }

    /// Clears the `Error` state after the operator signalled a reset
    /// (SIGHUP) and lifts the outbound halt. Outside `Error` the signal is
    /// ignored.
    async fn on_operator_reset(&mut self) {
        if let SystemState::Error { kind } = self.state.current() {
            info!(?kind, "operator reset, leaving error state");
            if self.state.apply(SystemEvent::OperatorReset).is_ok() {
                self.cabinet.resume_outbound().await;
            }
        } else {
            debug!("operator reset outside error state, ignoring");
        }
    }

    async fn on_protocol(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::LinkUp => {
                match self.state.current() {
                    SystemState::Starting => {
                        let _ = self.state.apply(SystemEvent::ComponentsReady);
                    }
                    SystemState::Disconnected => {
                        let _ = self.state.apply(SystemEvent::LinkUp);
                    }
                    _ => {}
                }
            }
            ProtocolEvent::LinkDown => {
                let _ = self.state.apply(SystemEvent::LinkLost);
            }
            ProtocolEvent::FeedResult {
                extruder_id,
                status,
            } => self.on_feed_result(extruder_id, status).await,
            ProtocolEvent::FilamentStatusQuery { legacy } => {
                if legacy {
                    debug!("answering deprecated status query");
                }
                let validity = if self.printer_connected {
                    STATUS_VALID
                } else {
                    STATUS_STALE
                };
                let bitmap = self.presence_bitmap();
                self.cabinet.send_filament_status(validity, bitmap).await;
            }
            ProtocolEvent::MappingQuery => {
                let entries: Vec<(u8, u8, bool)> = self
                    .mapping
                    .iter()
                    .map(|(&extruder, &zone)| (extruder, zone, extruder == self.default_active))
                    .collect();
                self.cabinet.send_mapping(entries).await;
            }
            ProtocolEvent::MappingSet { entries } => self.apply_mapping_set(entries),
            ProtocolEvent::RfidCompleted {
                extruder_id,
                channel_id,
                source,
                record,
            } => {
                self.on_rfid_record(extruder_id, channel_id, source, record)
                    .await;
            }
            ProtocolEvent::RfidAborted { extruder_id, error } => {
                debug!(extruder = extruder_id, %error, "RFID transfer failed, awaiting retry");
            }
            ProtocolEvent::Fatal(err) => {
                error!(error = %err, "fatal protocol failure");
                if matches!(err, ProtocolError::VersionMismatch { .. }) {
                    let _ = self.state.apply(SystemEvent::FatalError {
                        kind: FatalKind::VersionMismatch,
                    });
                    self.cabinet.halt_outbound().await;
                }
            }
        }
    }

    async fn on_observer(&mut self, event: ObserverEvent) {
        match event {
            ObserverEvent::Connected => {
                self.printer_connected = true;
            }
            ObserverEvent::Disconnected => {
                self.printer_connected = false;
            }
            ObserverEvent::UnreachableLimit => {
                error!("printer unreachable beyond threshold");
                let _ = self.state.apply(SystemEvent::FatalError {
                    kind: FatalKind::PrinterUnreachable,
                });
                self.cabinet.halt_outbound().await;
            }
            ObserverEvent::ActiveExtruder { extruder_id } => {
                debug!(extruder = extruder_id, "active extruder");
            }
            ObserverEvent::PrintState(print_state) => {
                if self.last_print_state == Some(print_state) {
                    return;
                }
                self.last_print_state = Some(print_state);
                self.on_print_state(print_state).await;
            }
            ObserverEvent::SensorChange {
                extruder_id,
                detected,
            } => self.on_sensor_change(extruder_id, detected).await,
        }
    }

    async fn on_print_state(&mut self, print_state: PrintState) {
        match print_state {
            PrintState::Printing => match self.state.current() {
                SystemState::Idle => {
                    if self.state.apply(SystemEvent::PrintStarted).is_ok() {
                        self.cabinet
                            .notify_print_state(PrintStateNotify::Started)
                            .await;
                    }
                }
                SystemState::Resuming { .. } => {
                    if self.state.apply(SystemEvent::ResumeConfirmed).is_ok() {
                        self.cabinet
                            .notify_print_state(PrintStateNotify::Resumed)
                            .await;
                    }
                }
                _ => {}
            },
            PrintState::Paused => {
                if let SystemState::Runout { extruder_id } = self.state.current() {
                    if self.state.apply(SystemEvent::PauseConfirmed).is_ok() {
                        // The pause is in effect; ask the cabinet for fresh
                        // filament right away.
                        if self.state.apply(SystemEvent::RequestFeed).is_ok() {
                            info!(extruder = extruder_id, "requesting feed");
                            self.cabinet.request_feed(extruder_id, false).await;
                        }
                    }
                } else {
                    debug!("print paused outside a runout, leaving it to the operator");
                }
            }
            PrintState::Complete => {
                self.abort_feed_in_flight().await;
                if self.state.apply(SystemEvent::PrintFinished).is_ok() {
                    self.cabinet
                        .notify_print_state(PrintStateNotify::Completed)
                        .await;
                }
            }
            PrintState::Cancelled => {
                self.abort_feed_in_flight().await;
                if self.state.apply(SystemEvent::PrintCancelled).is_ok() {
                    self.cabinet
                        .notify_print_state(PrintStateNotify::Cancelled)
                        .await;
                }
            }
            PrintState::Error => {
                self.abort_feed_in_flight().await;
                if self.state.apply(SystemEvent::PrintError).is_ok() {
                    self.cabinet
                        .notify_print_state(PrintStateNotify::Error)
                        .await;
                }
            }
            PrintState::Standby => {
                // A job that vanishes into standby ended without a verdict.
                if self.state.current().is_print_active() {
                    self.abort_feed_in_flight().await;
                    if self.state.apply(SystemEvent::PrintCancelled).is_ok() {
                        debug!("print dropped to standby, treating as cancelled");
                        self.cabinet
                            .notify_print_state(PrintStateNotify::Cancelled)
                            .await;
                    }
                }
            }
        }
    }

    async fn on_sensor_change(&mut self, extruder_id: u8, detected: bool) {
        let previous = self.sensors.insert(extruder_id, detected);
        if !is_runout_edge(previous, detected) {
            return;
        }
        if !self.runout_enabled {
            debug!(extruder = extruder_id, "runout detected but handling is disabled");
            return;
        }
        if self.state.current() != SystemState::Printing {
            debug!(extruder = extruder_id, "runout outside printing, ignoring");
            return;
        }

        warn!(extruder = extruder_id, "filament runout");
        if self
            .state
            .apply(SystemEvent::SensorRunout { extruder_id })
            .is_ok()
        {
            if let Err(e) = self.printer.pause().await {
                error!(error = %e, "failed to issue pause");
            }
            self.cabinet
                .notify_print_state(PrintStateNotify::Paused)
                .await;
        }
    }

    async fn on_feed_result(&mut self, extruder_id: u8, status: FeedStatus) {
        let SystemState::Feeding {
            extruder_id: feeding,
        } = self.state.current()
        else {
            debug!(extruder = extruder_id, ?status, "feed result outside feeding");
            return;
        };
        if feeding != extruder_id {
            warn!(
                expected = feeding,
                got = extruder_id,
                "feed result for the wrong extruder"
            );
            return;
        }

        match status {
            FeedStatus::InProgress => debug!(extruder = extruder_id, "feed in progress"),
            FeedStatus::Complete => {
                info!(extruder = extruder_id, "feed complete, resuming print");
                if self.state.apply(SystemEvent::FeedComplete).is_ok() {
                    if let Err(e) = self.printer.resume().await {
                        error!(error = %e, "failed to issue resume");
                    }
                    if self.rfid_enabled {
                        // Fresh filament was loaded; ask for its tag.
                        self.cabinet.request_rfid_data(extruder_id).await;
                    }
                }
            }
            FeedStatus::Failed => {
                warn!(extruder = extruder_id, "cabinet could not feed, staying paused");
                let _ = self.state.apply(SystemEvent::FeedFailed);
            }
        }
    }

    async fn on_rfid_record(
        &mut self,
        extruder_id: u8,
        channel_id: u8,
        source: TransferSource,
        record: FilamentRecord,
    ) {
        info!(
            extruder = extruder_id,
            channel = channel_id,
            material = record.material.as_deref().unwrap_or("unknown"),
            "filament record received"
        );
        match self.store.write(extruder_id, channel_id, source, &record) {
            Ok(path) => debug!(path = %path.display(), "record persisted"),
            Err(e) => error!(error = %e, "failed to persist filament record"),
        }

        if self.auto_set_temperature
            && (record.print_temp_c.is_some() || record.bed_temp_c.is_some())
        {
            info!(
                hotend = ?record.print_temp_c,
                bed = ?record.bed_temp_c,
                "applying temperatures from record"
            );
            if let Err(e) = self
                .printer
                .set_temperatures(record.print_temp_c, record.bed_temp_c)
                .await
            {
                error!(error = %e, "failed to apply temperatures");
            }
        }
    }

    /// Tells the cabinet to stop feeding when the job it was feeding for
    /// is gone.
    async fn abort_feed_in_flight(&mut self) {
        if let SystemState::Feeding { extruder_id } = self.state.current() {
            info!(extruder = extruder_id, "cancelling feed for a finished job");
            self.cabinet.cancel_feed(extruder_id).await;
        }
    }

    fn apply_mapping_set(&mut self, entries: Vec<(u8, u8)>) {
        let mut updated = self.mapping.clone();
        for (extruder, zone) in &entries {
            updated.insert(*extruder, *zone);
        }
        let mut zones: Vec<u8> = updated.values().copied().collect();
        zones.sort_unstable();
        zones.dedup();
        if zones.len() != updated.len() {
            warn!(?entries, "rejecting mapping set with duplicate zones");
            return;
        }
        info!(?entries, "mapping updated by cabinet");
        self.mapping = updated;
    }

    fn presence_bitmap(&self) -> u8 {
        let zone_presence = zone_presence(&self.mapping, &self.sensors);
        encode_zone_bitmap(zone_presence.iter())
    }
}

/// Projects per-extruder sensor readings onto buffer zones. Extruders with
/// no reading yet count as empty.
fn zone_presence(mapping: &BTreeMap<u8, u8>, sensors: &BTreeMap<u8, bool>) -> BTreeMap<u8, bool> {
    mapping
        .iter()
        .map(|(extruder, &zone)| (zone, sensors.get(extruder).copied().unwrap_or(false)))
        .collect()
}

/// A runout is the detected → not-detected edge. The first report for a
/// sensor is not an edge, even when it reports no filament.
fn is_runout_edge(previous: Option<bool>, detected: bool) -> bool {
    previous == Some(true) && !detected
}

#[cfg(test)]
mod tests {
    use super::*;

    mod runout_edge_tests {
        use super::*;

        #[test]
        fn detects_the_falling_edge() {
            assert!(is_runout_edge(Some(true), false));
        }

        #[test]
        fn first_report_is_not_an_edge() {
            assert!(!is_runout_edge(None, false));
            assert!(!is_runout_edge(None, true));
        }

        #[test]
        fn repeats_and_recoveries_are_not_edges() {
            assert!(!is_runout_edge(Some(false), false));
            assert!(!is_runout_edge(Some(false), true));
            assert!(!is_runout_edge(Some(true), true));
        }
    }

    mod zone_presence_tests {
        use super::*;

        #[test]
        fn projects_sensors_through_the_mapping() {
            let mapping = BTreeMap::from([(0u8, 0u8), (1u8, 1u8)]);
            let sensors = BTreeMap::from([(0u8, true), (1u8, false)]);
            let zones = zone_presence(&mapping, &sensors);
            assert_eq!(zones, BTreeMap::from([(0u8, true), (1u8, false)]));
            assert_eq!(encode_zone_bitmap(zones.iter()), 0b01);
        }

        #[test]
        fn unreported_extruders_read_as_empty() {
            let mapping = BTreeMap::from([(0u8, 3u8)]);
            let zones = zone_presence(&mapping, &BTreeMap::new());
            assert_eq!(zones, BTreeMap::from([(3u8, false)]));
        }

        #[test]
        fn nonidentity_mapping_moves_the_bit() {
            let mapping = BTreeMap::from([(0u8, 5u8)]);
            let sensors = BTreeMap::from([(0u8, true)]);
            let zones = zone_presence(&mapping, &sensors);
            assert_eq!(encode_zone_bitmap(zones.iter()), 0b10_0000);
        }
    }
}
