//! Printer observer: Moonraker JSON-RPC over WebSocket.
//!
//! Subscribes to `print_stats`, the configured filament switch sensors, and
//! `toolhead`, and normalizes Moonraker's status pushes into
//! [`ObserverEvent`]s. Action primitives (pause, resume, cancel, G-code)
//! are fire-and-forget JSON-RPC calls; their effect is observed through the
//! status stream rather than response correlation.
//!
//! The connection lives in one background task. On any failure it
//! reconnects with exponential backoff and re-subscribes, since Moonraker
//! drops subscriptions with the connection.

use crate::config::KlipperConfig;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// First reconnect delay after a connection failure.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Ceiling for the reconnect delay.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Consecutive connection failures before the daemon gives up supervising.
const UNREACHABLE_THRESHOLD: u32 = 10;

/// JSON-RPC id used by the subscribe call issued inside the task.
const SUBSCRIBE_REQUEST_ID: u64 = 1;

/// First id handed out for action calls, above the task-internal ids.
const FIRST_ACTION_REQUEST_ID: u64 = 16;

/// Capacity of the outgoing JSON-RPC channel.
const RPC_CHANNEL_CAPACITY: usize = 32;

/// Print job state reported by `print_stats.state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintState {
    Standby,
    Printing,
    Paused,
    Complete,
    Cancelled,
    Error,
}

impl PrintState {
    fn from_wire(state: &str) -> Option<Self> {
        match state {
            "standby" => Some(Self::Standby),
            "printing" => Some(Self::Printing),
            "paused" => Some(Self::Paused),
            "complete" => Some(Self::Complete),
            "cancelled" => Some(Self::Cancelled),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Events sent from the observer task to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ObserverEvent {
    /// Connected and subscribed.
    Connected,
    /// Connection lost; reconnect is in progress.
    Disconnected,
    /// `print_stats.state` was reported.
    PrintState(PrintState),
    /// A filament sensor reported presence or absence.
    SensorChange { extruder_id: u8, detected: bool },
    /// The active toolhead extruder was reported.
    ActiveExtruder { extruder_id: u8 },
    /// The printer stayed unreachable beyond the retry threshold.
    UnreachableLimit,
}

/// Handle for issuing printer actions.
#[derive(Debug, Clone)]
pub struct KlipperClient {
    rpc_tx: mpsc::Sender<Value>,
    request_id: Arc<AtomicU64>,
}

impl KlipperClient {
    /// Spawns the observer task.
    ///
    /// `sensors` are the configured filament switch sensor names, indexed by
    /// extruder. Events arrive on `event_tx`; actions go through the
    /// returned client.
    pub fn spawn(
        config: &KlipperConfig,
        sensors: Vec<String>,
        event_tx: mpsc::Sender<ObserverEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (rpc_tx, rpc_rx) = mpsc::channel(RPC_CHANNEL_CAPACITY);
        let task = tokio::spawn(run(
            config.base_url.clone(),
            Duration::from_secs_f64(config.update_interval),
            sensors,
            event_tx,
            rpc_rx,
            shutdown,
        ));
        (
            Self {
                rpc_tx,
                request_id: Arc::new(AtomicU64::new(FIRST_ACTION_REQUEST_ID)),
            },
            task,
        )
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queues one JSON-RPC call. Delivery is best-effort: outcome shows up
    /// in the status stream, errors in the response are logged by the task.
    async fn call(&self, method: &str, params: Option<Value>) -> Result<()> {
        let mut request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "id": self.next_request_id(),
        });
        if let Some(params) = params {
            request["params"] = params;
        }
        self.rpc_tx
            .send(request)
            .await
            .context("printer observer is gone")
    }

    /// Pauses the current print job.
    pub async fn pause(&self) -> Result<()> {
        self.call("printer.print.pause", None).await
    }

    /// Resumes a paused print job.
    pub async fn resume(&self) -> Result<()> {
        self.call("printer.print.resume", None).await
    }

    /// Cancels the current print job.
    pub async fn cancel(&self) -> Result<()> {
        self.call("printer.print.cancel", None).await
    }

    /// Runs one G-code line.
    pub async fn run_gcode(&self, line: &str) -> Result<()> {
        self.call("printer.gcode.script", Some(json!({ "script": line })))
            .await
    }

    /// Sets hotend and bed temperature targets via G-code.
    pub async fn set_temperatures(&self, hotend_c: Option<u16>, bed_c: Option<u16>) -> Result<()> {
        if let Some(temp) = hotend_c {
            self.run_gcode(&format!("M104 S{temp}")).await?;
        }
        if let Some(temp) = bed_c {
            self.run_gcode(&format!("M140 S{temp}")).await?;
        }
        Ok(())
    }
}

/// Builds the `printer.objects.subscribe` request for our object set.
fn subscribe_request(sensors: &[String]) -> Value {
    let mut objects = serde_json::Map::new();
    objects.insert("print_stats".to_string(), json!(["state"]));
    objects.insert("toolhead".to_string(), json!(["extruder"]));
    for name in sensors {
        objects.insert(
            format!("filament_switch_sensor {name}"),
            json!(["filament_detected"]),
        );
    }
    json!({
        "jsonrpc": "2.0",
        "method": "printer.objects.subscribe",
        "params": { "objects": Value::Object(objects) },
        "id": SUBSCRIBE_REQUEST_ID,
    })
}

/// Normalizes one status object (from a subscribe result or a
/// `notify_status_update`) into observer events.
fn status_events(status: &Value, sensors: &[String]) -> Vec<ObserverEvent> {
    let mut events = Vec::new();

    if let Some(state) = status["print_stats"]["state"].as_str() {
        match PrintState::from_wire(state) {
            Some(state) => events.push(ObserverEvent::PrintState(state)),
            None => debug!(state, "unknown print_stats state"),
        }
    }

    for (extruder_id, name) in sensors.iter().enumerate() {
        let key = format!("filament_switch_sensor {name}");
        if let Some(detected) = status[&key]["filament_detected"].as_bool() {
            events.push(ObserverEvent::SensorChange {
                extruder_id: extruder_id as u8,
                detected,
            });
        }
    }

    if let Some(toolhead) = status["toolhead"]["extruder"].as_str() {
        match parse_extruder_name(toolhead) {
            Some(extruder_id) => events.push(ObserverEvent::ActiveExtruder { extruder_id }),
            None => debug!(toolhead, "unparseable active extruder"),
        }
    }

    events
}

/// Maps Klipper extruder object names to indices: `extruder` is 0,
/// `extruder1` is 1, and so on.
fn parse_extruder_name(name: &str) -> Option<u8> {
    let suffix = name.strip_prefix("extruder")?;
    if suffix.is_empty() {
        Some(0)
    } else {
        suffix.parse().ok()
    }
}

async fn run(
    url: String,
    refresh_interval: Duration,
    sensors: Vec<String>,
    event_tx: mpsc::Sender<ObserverEvent>,
    mut rpc_rx: mpsc::Receiver<Value>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay = INITIAL_RECONNECT_DELAY;
    let mut consecutive_failures = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let stream = tokio::select! {
            result = connect_async(url.as_str()) => result,
            _ = shutdown.changed() => continue,
        };

        let (ws, _) = match stream {
            Ok(ok) => ok,
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    url = %url,
                    error = %e,
                    failures = consecutive_failures,
                    retry_in = ?delay,
                    "printer unreachable"
                );
                if consecutive_failures == UNREACHABLE_THRESHOLD {
                    let _ = event_tx.send(ObserverEvent::UnreachableLimit).await;
                }
                if sleep_or_shutdown(&mut shutdown, delay).await {
                    break;
                }
                delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                continue;
            }
        };

        info!(url = %url, "printer connected");
        consecutive_failures = 0;
        delay = INITIAL_RECONNECT_DELAY;

        let disconnect_reason = serve(
            ws,
            &sensors,
            refresh_interval,
            &event_tx,
            &mut rpc_rx,
            &mut shutdown,
        )
        .await;

        let Some(reason) = disconnect_reason else {
            break;
        };
        warn!(reason = %reason, retry_in = ?delay, "printer connection lost");
        let _ = event_tx.send(ObserverEvent::Disconnected).await;
        if sleep_or_shutdown(&mut shutdown, delay).await {
            break;
        }
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }

    debug!("printer observer exiting");
}

/// Serves one WebSocket connection until failure or shutdown.
///
/// Returns the failure reason, or `None` on shutdown.
async fn serve(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    sensors: &[String],
    refresh_interval: Duration,
    event_tx: &mpsc::Sender<ObserverEvent>,
    rpc_rx: &mut mpsc::Receiver<Value>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<String> {
    let (mut write, mut read) = ws.split();

    // Moonraker discards subscriptions with the connection, so every
    // (re)connect starts with a fresh subscribe. The response carries the
    // full current status, which seeds our sensor and print state.
    let subscribe = subscribe_request(sensors);
    if let Err(e) = write.send(Message::text(subscribe.to_string())).await {
        return Some(format!("subscribe failed: {e}"));
    }
    let _ = event_tx.send(ObserverEvent::Connected).await;

    let mut refresh = tokio::time::interval(refresh_interval);
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    refresh.reset();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return None;
                }
            }

            Some(request) = rpc_rx.recv() => {
                if let Err(e) = write.send(Message::text(request.to_string())).await {
                    return Some(format!("send failed: {e}"));
                }
            }

            _ = refresh.tick() => {
                // Safety net against silently lost pushes: re-query the
                // subscribed objects on the configured pacing.
                let query = json!({
                    "jsonrpc": "2.0",
                    "method": "printer.objects.query",
                    "params": subscribe["params"].clone(),
                    "id": SUBSCRIBE_REQUEST_ID,
                });
                if let Err(e) = write.send(Message::text(query.to_string())).await {
                    return Some(format!("status query failed: {e}"));
                }
            }

            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    handle_text(text.as_str(), sensors, event_tx).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = write.send(Message::Pong(payload)).await {
                        return Some(format!("pong failed: {e}"));
                    }
                }
                Some(Ok(Message::Close(_))) => return Some("server closed".to_string()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Some(format!("read failed: {e}")),
                None => return Some("stream ended".to_string()),
            },
        }
    }
}

async fn handle_text(text: &str, sensors: &[String], event_tx: &mpsc::Sender<ObserverEvent>) {
    let message: Value = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "non-JSON frame from printer");
            return;
        }
    };

    let mut events = Vec::new();
    match message["method"].as_str() {
        Some("notify_status_update") => {
            if let Some(status) = message["params"].get(0) {
                events = status_events(status, sensors);
            }
        }
        Some("notify_klippy_shutdown") => {
            warn!("klippy reported shutdown");
            events.push(ObserverEvent::PrintState(PrintState::Error));
        }
        Some(_) => {}
        None => {
            // A response. Subscribe/query responses carry the full status.
            if let Some(status) = message["result"].get("status") {
                events = status_events(status, sensors);
            } else if let Some(error) = message.get("error") {
                warn!(%error, "printer rejected a request");
            }
        }
    }

    for event in events {
        let _ = event_tx.send(event).await;
    }
}

async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor_names() -> Vec<String> {
        vec!["filament_sensor_0".to_string(), "filament_sensor_1".to_string()]
    }

    mod status_events_tests {
        use super::*;

        #[test]
        fn extracts_print_state_and_sensors() {
            let status = json!({
                "print_stats": { "state": "printing" },
                "filament_switch_sensor filament_sensor_0": { "filament_detected": true },
                "filament_switch_sensor filament_sensor_1": { "filament_detected": false },
            });
            let events = status_events(&status, &sensor_names());
            assert!(events.contains(&ObserverEvent::PrintState(PrintState::Printing)));
            assert!(events.contains(&ObserverEvent::SensorChange {
                extruder_id: 0,
                detected: true,
            }));
            assert!(events.contains(&ObserverEvent::SensorChange {
                extruder_id: 1,
                detected: false,
            }));
        }

        #[test]
        fn partial_update_yields_only_reported_fields() {
            let status = json!({
                "filament_switch_sensor filament_sensor_0": { "filament_detected": false },
            });
            let events = status_events(&status, &sensor_names());
            assert_eq!(
                events,
                vec![ObserverEvent::SensorChange {
                    extruder_id: 0,
                    detected: false,
                }]
            );
        }

        #[test]
        fn reports_active_extruder() {
            let status = json!({ "toolhead": { "extruder": "extruder1" } });
            let events = status_events(&status, &sensor_names());
            assert_eq!(events, vec![ObserverEvent::ActiveExtruder { extruder_id: 1 }]);
        }

        #[test]
        fn unknown_print_state_is_skipped() {
            let status = json!({ "print_stats": { "state": "warming_up" } });
            assert!(status_events(&status, &sensor_names()).is_empty());
        }

        #[test]
        fn unwatched_sensors_are_ignored() {
            let status = json!({
                "filament_switch_sensor other_sensor": { "filament_detected": false },
            });
            assert!(status_events(&status, &sensor_names()).is_empty());
        }
    }

    mod print_state_tests {
        use super::*;

        #[test]
        fn parses_all_klipper_states() {
            assert_eq!(PrintState::from_wire("standby"), Some(PrintState::Standby));
            assert_eq!(PrintState::from_wire("printing"), Some(PrintState::Printing));
            assert_eq!(PrintState::from_wire("paused"), Some(PrintState::Paused));
            assert_eq!(PrintState::from_wire("complete"), Some(PrintState::Complete));
            assert_eq!(PrintState::from_wire("cancelled"), Some(PrintState::Cancelled));
            assert_eq!(PrintState::from_wire("error"), Some(PrintState::Error));
            assert_eq!(PrintState::from_wire("bogus"), None);
        }
    }

    mod extruder_name_tests {
        use super::*;

        #[test]
        fn primary_extruder_has_no_suffix() {
            assert_eq!(parse_extruder_name("extruder"), Some(0));
        }

        #[test]
        fn numbered_extruders_parse_their_suffix() {
            assert_eq!(parse_extruder_name("extruder1"), Some(1));
            assert_eq!(parse_extruder_name("extruder2"), Some(2));
        }

        #[test]
        fn foreign_names_are_rejected() {
            assert_eq!(parse_extruder_name("heater_bed"), None);
            assert_eq!(parse_extruder_name("extruderx"), None);
        }
    }

    mod subscribe_request_tests {
        use super::*;

        #[test]
        fn subscribes_to_all_watched_objects() {
            let request = subscribe_request(&sensor_names());
            let objects = &request["params"]["objects"];
            assert!(objects.get("print_stats").is_some());
            assert!(objects.get("toolhead").is_some());
            assert!(objects
                .get("filament_switch_sensor filament_sensor_0")
                .is_some());
            assert!(objects
                .get("filament_switch_sensor filament_sensor_1")
                .is_some());
        }
    }
}
