use crate::types::{ActuatorEvent, SafetyPhase, SafetyState, StopReason};
use crate::{CellError, Result};
use crossbeam_channel::Receiver;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// xArm reports state 4 when the controller has stopped.
pub const DEFAULT_TERMINAL_STATE: i32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Actuator state that ends the run.
    pub terminal_state: i32,
    /// How often the monitor thread re-checks its stop flag.
    pub poll_interval_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            terminal_state: DEFAULT_TERMINAL_STATE,
            poll_interval_ms: 50,
        }
    }
}

/// Shared view of the safety record.
///
/// The monitor thread is the only writer; the engine reads a snapshot before
/// every command.
#[derive(Debug, Clone, Default)]
pub struct SafetyHandle {
    state: Arc<Mutex<SafetyState>>,
}

impl SafetyHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SafetyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> SafetyState {
        self.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().alive()
    }

    /// Apply one notification. Returns the stop reason if this event ended the run.
    pub(crate) fn apply(&self, event: &ActuatorEvent, terminal_state: i32) -> Option<StopReason> {
        let mut state = self.lock();
        let reason = match *event {
            ActuatorEvent::ErrorWarnChanged {
                error_code,
                warn_code,
            } => {
                if warn_code != 0 {
                    log::warn!("warn={}", warn_code);
                }
                if error_code == 0 {
                    return None;
                }
                state.error_code = error_code;
                log::error!("err={}, quit", error_code);
                StopReason::Error { code: error_code }
            }
            ActuatorEvent::StateChanged { state: s } => {
                if s != terminal_state {
                    return None;
                }
                log::error!("state={}, quit", s);
                StopReason::TerminalState { state: s }
            }
            ActuatorEvent::ConnectionChanged {
                connected,
                reported,
            } => {
                state.connected = connected;
                if connected {
                    return None;
                }
                log::error!(
                    "disconnect, connected={}, reported={}, quit",
                    connected,
                    reported
                );
                StopReason::Disconnected
            }
            ActuatorEvent::CountChanged { count } => {
                if state.alive() {
                    log::info!("counter val: {}", count);
                }
                return None;
            }
        };

        if state.phase == SafetyPhase::Stopped {
            return None;
        }
        state.phase = SafetyPhase::Stopped;
        state.reason = Some(reason.clone());
        Some(reason)
    }

    fn begin_shutdown(&self) {
        let mut state = self.lock();
        if state.phase == SafetyPhase::Running {
            state.phase = SafetyPhase::Stopping;
        }
    }

    fn finish_shutdown(&self) {
        let mut state = self.lock();
        if state.phase == SafetyPhase::Stopping {
            state.phase = SafetyPhase::Stopped;
            state.reason = Some(StopReason::Shutdown);
        }
    }
}

/// Background consumer of actuator notifications.
///
/// Owns the notification receiver; stopping or dropping the monitor drops it,
/// which releases the actuator subscription.
pub struct SafetyMonitor {
    handle: SafetyHandle,
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SafetyMonitor {
    /// Start the monitor thread writing into `handle`.
    pub fn start(
        events: Receiver<ActuatorEvent>,
        handle: SafetyHandle,
        config: &SafetyConfig,
    ) -> Result<SafetyMonitor> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();
        let writer = handle.clone();
        let terminal_state = config.terminal_state;
        let poll = Duration::from_millis(config.poll_interval_ms.max(1));

        let thread = std::thread::Builder::new()
            .name("pickcell-safety".into())
            .spawn(move || {
                monitor_loop(events, writer, stop_clone, terminal_state, poll);
            })
            .map_err(|e| CellError::Spawn(format!("safety monitor: {}", e)))?;

        Ok(SafetyMonitor {
            handle,
            stop_flag,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> SafetyHandle {
        self.handle.clone()
    }

    pub fn is_active(&self) -> bool {
        !self.stop_flag.load(Ordering::Relaxed)
    }

    /// Drain pending notifications, stop the thread and release the subscription.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.handle.begin_shutdown();
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.handle.finish_shutdown();
    }
}

impl Drop for SafetyMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn monitor_loop(
    events: Receiver<ActuatorEvent>,
    handle: SafetyHandle,
    stop_flag: Arc<AtomicBool>,
    terminal_state: i32,
    poll: Duration,
) {
    log::info!("Safety monitor started");

    loop {
        if stop_flag.load(Ordering::Relaxed) {
            while let Ok(event) = events.try_recv() {
                handle.apply(&event, terminal_state);
            }
            log::info!("Safety monitor stopping (stop flag set)");
            break;
        }

        match events.recv_timeout(poll) {
            Ok(event) => {
                handle.apply(&event, terminal_state);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                // Without notifications the arm can no longer be supervised.
                handle.apply(
                    &ActuatorEvent::ConnectionChanged {
                        connected: false,
                        reported: false,
                    },
                    terminal_state,
                );
                log::warn!("Notification channel closed, safety monitor exiting");
                break;
            }
        }
    }
}
