//! Supervisory state machine.
//!
//! [`StateManager`] is the single source of truth for what the daemon is
//! doing. Every transition goes through [`StateManager::apply`]; an event
//! that is not legal in the current state is rejected and logged, never
//! promoted. The orchestrator task owns the manager, so transitions are
//! serialized by construction, and a change notification is broadcast only
//! after the new state is committed.

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

/// Why the daemon entered the `Error` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// The cabinet speaks an incompatible protocol version.
    VersionMismatch,
    /// The printer service stayed unreachable beyond the retry threshold.
    PrinterUnreachable,
}

/// Supervisory states. Extruder payloads name the extruder being serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Starting,
    Idle,
    Printing,
    /// A runout was detected; waiting for the printer to confirm the pause.
    Runout { extruder_id: u8 },
    Paused { extruder_id: u8 },
    /// The cabinet is feeding fresh filament.
    Feeding { extruder_id: u8 },
    /// The print was resumed; waiting for the printer to confirm.
    Resuming { extruder_id: u8 },
    Error { kind: FatalKind },
    /// The cabinet link is down. The previous state is restored once the
    /// link comes back.
    Disconnected,
}

impl SystemState {
    /// True while a print job is underway in some form.
    pub fn is_print_active(&self) -> bool {
        matches!(
            self,
            Self::Printing
                | Self::Runout { .. }
                | Self::Paused { .. }
                | Self::Feeding { .. }
                | Self::Resuming { .. }
        )
    }
}

/// Transition triggers, produced by the orchestrator from observer and
/// protocol events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    ComponentsReady,
    LinkLost,
    LinkUp,
    PrintStarted,
    SensorRunout { extruder_id: u8 },
    PauseConfirmed,
    RequestFeed,
    FeedComplete,
    /// The cabinet reported the feed failed; back to `Paused` for retry.
    FeedFailed,
    ResumeConfirmed,
    PrintFinished,
    PrintCancelled,
    PrintError,
    FatalError { kind: FatalKind },
    OperatorReset,
}

/// A committed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SystemState,
    pub to: SystemState,
}

/// An event that is not legal in the current state. The state is unchanged.
#[derive(Debug, Clone, Error)]
#[error("illegal transition {event:?} in state {state:?}")]
pub struct IllegalTransition {
    pub state: SystemState,
    pub event: SystemEvent,
}

/// Owner of the supervisory state.
#[derive(Debug)]
pub struct StateManager {
    current: SystemState,
    /// State to restore when the link comes back.
    prior_to_disconnect: Option<SystemState>,
    notify: watch::Sender<SystemState>,
}

impl StateManager {
    /// Creates the manager in `Starting` along with the change-notification
    /// receiver.
    pub fn new() -> (Self, watch::Receiver<SystemState>) {
        let (notify, watcher) = watch::channel(SystemState::Starting);
        (
            Self {
                current: SystemState::Starting,
                prior_to_disconnect: None,
                notify,
            },
            watcher,
        )
    }

    pub fn current(&self) -> SystemState {
        self.current
    }

    /// Applies one event.
    ///
    /// On success the new state is committed and broadcast. Illegal events
    /// are logged and rejected with no effect.
    pub fn apply(&mut self, event: SystemEvent) -> Result<Transition, IllegalTransition> {
        let from = self.current;
        let to = match (from, event) {
            (SystemState::Starting, SystemEvent::ComponentsReady) => SystemState::Idle,

            // The link can drop in any state except while already
            // disconnected; remember where we were.
            (SystemState::Disconnected, SystemEvent::LinkLost) => {
                return self.reject(event);
            }
            (state, SystemEvent::LinkLost) => {
                self.prior_to_disconnect = Some(state);
                SystemState::Disconnected
            }
            (SystemState::Disconnected, SystemEvent::LinkUp) => {
                match self.prior_to_disconnect.take() {
                    Some(SystemState::Starting) | None => SystemState::Idle,
                    Some(prior) => prior,
                }
            }

            (SystemState::Idle, SystemEvent::PrintStarted) => SystemState::Printing,
            (SystemState::Printing, SystemEvent::SensorRunout { extruder_id }) => {
                SystemState::Runout { extruder_id }
            }
            (SystemState::Runout { extruder_id }, SystemEvent::PauseConfirmed) => {
                SystemState::Paused { extruder_id }
            }
            (SystemState::Paused { extruder_id }, SystemEvent::RequestFeed) => {
                SystemState::Feeding { extruder_id }
            }
            (SystemState::Feeding { extruder_id }, SystemEvent::FeedComplete) => {
                SystemState::Resuming { extruder_id }
            }
            (SystemState::Feeding { extruder_id }, SystemEvent::FeedFailed) => {
                SystemState::Paused { extruder_id }
            }
            (SystemState::Resuming { .. }, SystemEvent::ResumeConfirmed) => SystemState::Printing,

            // A job can finish, be cancelled, or fail from any active-print
            // state; the runout flow is abandoned with it.
            (state, SystemEvent::PrintFinished)
            | (state, SystemEvent::PrintCancelled)
            | (state, SystemEvent::PrintError)
                if state.is_print_active() =>
            {
                SystemState::Idle
            }

            (_, SystemEvent::FatalError { kind }) => SystemState::Error { kind },
            (SystemState::Error { .. }, SystemEvent::OperatorReset) => SystemState::Idle,

            _ => return self.reject(event),
        };

        self.current = to;
        self.notify.send_replace(to);
        let transition = Transition { from, to };
        info!(from = ?transition.from, to = ?transition.to, ?event, "state transition");
        Ok(transition)
    }

    fn reject(&self, event: SystemEvent) -> Result<Transition, IllegalTransition> {
        let err = IllegalTransition {
            state: self.current,
            event,
        };
        warn!(%err, "rejected");
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_in(state: SystemState) -> StateManager {
        let (mut manager, _watcher) = StateManager::new();
        manager.current = state;
        manager
    }

    fn assert_moves(manager: &mut StateManager, event: SystemEvent, expected: SystemState) {
        let transition = manager.apply(event).expect("legal transition");
        assert_eq!(transition.to, expected);
        assert_eq!(manager.current(), expected);
    }

    mod transition_table_tests {
        use super::*;

        #[test]
        fn startup_reaches_idle() {
            let (mut manager, _watcher) = StateManager::new();
            assert_moves(&mut manager, SystemEvent::ComponentsReady, SystemState::Idle);
        }

        #[test]
        fn runout_feed_resume_cycle() {
            let mut manager = manager_in(SystemState::Idle);
            assert_moves(&mut manager, SystemEvent::PrintStarted, SystemState::Printing);
            assert_moves(
                &mut manager,
                SystemEvent::SensorRunout { extruder_id: 0 },
                SystemState::Runout { extruder_id: 0 },
            );
            assert_moves(
                &mut manager,
                SystemEvent::PauseConfirmed,
                SystemState::Paused { extruder_id: 0 },
            );
            assert_moves(
                &mut manager,
                SystemEvent::RequestFeed,
                SystemState::Feeding { extruder_id: 0 },
            );
            assert_moves(
                &mut manager,
                SystemEvent::FeedComplete,
                SystemState::Resuming { extruder_id: 0 },
            );
            assert_moves(&mut manager, SystemEvent::ResumeConfirmed, SystemState::Printing);
        }

        #[test]
        fn failed_feed_returns_to_paused() {
            let mut manager = manager_in(SystemState::Feeding { extruder_id: 1 });
            assert_moves(
                &mut manager,
                SystemEvent::FeedFailed,
                SystemState::Paused { extruder_id: 1 },
            );
        }

        #[test]
        fn print_completion_returns_to_idle_from_any_active_state() {
            for state in [
                SystemState::Printing,
                SystemState::Runout { extruder_id: 0 },
                SystemState::Paused { extruder_id: 0 },
                SystemState::Feeding { extruder_id: 0 },
                SystemState::Resuming { extruder_id: 0 },
            ] {
                let mut manager = manager_in(state);
                assert_moves(&mut manager, SystemEvent::PrintCancelled, SystemState::Idle);
            }
        }

        #[test]
        fn fatal_error_reaches_error_from_anywhere() {
            for state in [
                SystemState::Starting,
                SystemState::Idle,
                SystemState::Printing,
                SystemState::Disconnected,
            ] {
                let mut manager = manager_in(state);
                assert_moves(
                    &mut manager,
                    SystemEvent::FatalError {
                        kind: FatalKind::VersionMismatch,
                    },
                    SystemState::Error {
                        kind: FatalKind::VersionMismatch,
                    },
                );
            }
        }

        #[test]
        fn operator_reset_leaves_error() {
            let mut manager = manager_in(SystemState::Error {
                kind: FatalKind::PrinterUnreachable,
            });
            assert_moves(&mut manager, SystemEvent::OperatorReset, SystemState::Idle);
        }
    }

    mod disconnect_tests {
        use super::*;

        #[test]
        fn link_flap_restores_the_prior_state() {
            let mut manager = manager_in(SystemState::Printing);
            assert_moves(&mut manager, SystemEvent::LinkLost, SystemState::Disconnected);
            assert_moves(&mut manager, SystemEvent::LinkUp, SystemState::Printing);
        }

        #[test]
        fn reconnect_from_startup_lands_in_idle() {
            let (mut manager, _watcher) = StateManager::new();
            assert_moves(&mut manager, SystemEvent::LinkLost, SystemState::Disconnected);
            assert_moves(&mut manager, SystemEvent::LinkUp, SystemState::Idle);
        }

        #[test]
        fn repeated_link_loss_is_rejected_and_keeps_prior() {
            let mut manager = manager_in(SystemState::Printing);
            manager.apply(SystemEvent::LinkLost).expect("first loss");
            assert!(manager.apply(SystemEvent::LinkLost).is_err());
            assert_moves(&mut manager, SystemEvent::LinkUp, SystemState::Printing);
        }
    }

    mod rejection_tests {
        use super::*;

        #[test]
        fn illegal_event_has_no_effect() {
            let mut manager = manager_in(SystemState::Printing);
            assert!(manager.apply(SystemEvent::FeedComplete).is_err());
            assert_eq!(manager.current(), SystemState::Printing);
        }

        #[test]
        fn runout_outside_printing_is_rejected() {
            let mut manager = manager_in(SystemState::Idle);
            assert!(manager
                .apply(SystemEvent::SensorRunout { extruder_id: 0 })
                .is_err());
        }

        #[test]
        fn link_up_outside_disconnected_is_rejected() {
            let mut manager = manager_in(SystemState::Idle);
            assert!(manager.apply(SystemEvent::LinkUp).is_err());
        }

        #[test]
        fn print_finish_in_idle_is_rejected() {
            let mut manager = manager_in(SystemState::Idle);
            assert!(manager.apply(SystemEvent::PrintFinished).is_err());
        }
    }

    mod notification_tests {
        use super::*;

        #[test]
        fn watcher_sees_the_committed_state() {
            let (mut manager, watcher) = StateManager::new();
            assert_eq!(*watcher.borrow(), SystemState::Starting);
            manager.apply(SystemEvent::ComponentsReady).expect("legal");
            assert_eq!(*watcher.borrow(), SystemState::Idle);
        }

        #[test]
        fn rejected_event_does_not_notify() {
            let (mut manager, mut watcher) = StateManager::new();
            watcher.borrow_and_update();
            let _ = manager.apply(SystemEvent::FeedComplete);
            assert!(!watcher.has_changed().expect("sender alive"));
        }
    }
}
