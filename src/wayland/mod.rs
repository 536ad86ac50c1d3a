//! Event-driven backend speaking the KDE output device, management and
//! order protocols over a Wayland session connection.
//!
//! A dedicated pump thread owns the connection and every protocol object;
//! callers interact through a snapshot mutex and a request channel, so no
//! protocol state ever crosses threads.

mod client;
mod device;
mod protocol;
mod topology;

pub use device::{DeviceEvent, DeviceMode, DeviceState, ModeHandle, RgbRange, VrrPolicy};
pub use topology::{SyncOutcome, SyncState, Topology};

use std::sync::Arc;
use std::sync::mpsc::{self, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;

use log::warn;

use crate::backend::{Backend, BackendEvent};
use crate::config::Config;
use crate::error::BackendError;
use crate::output::OutputId;

use self::client::{Request, Shared};

/// Bound on waiting for the first ready snapshot or an apply verdict.
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WaylandBackend {
    shared: Arc<Shared>,
    requests: SyncSender<Request>,
    pump: Option<JoinHandle<()>>,
}

impl WaylandBackend {
    /// Connect to the session compositor and start the event pump. Returns
    /// immediately; readiness is awaited on the first [`Backend::config`]
    /// call.
    pub fn new(emitter: SyncSender<BackendEvent>) -> Result<Self, BackendError> {
        let shared = Shared::new();
        let (requests, request_rx) = mpsc::sync_channel(8);
        let pump_shared = shared.clone();
        let pump = std::thread::Builder::new()
            .name("screentopo-wayland".into())
            .spawn(move || client::run(pump_shared, emitter, request_rx))
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            shared,
            requests,
            pump: Some(pump),
        })
    }

    fn wait_for_snapshot(&self) -> Result<Config, BackendError> {
        let state = self.shared.state.lock().unwrap();
        let (state, timeout) = self
            .shared
            .ready
            .wait_timeout_while(state, WAIT_TIMEOUT, |s| {
                s.snapshot.is_none() && s.failure.is_none() && !s.shutdown
            })
            .unwrap();
        resolve_snapshot(&state, timeout.timed_out())
    }
}

/// A recorded failure outranks any snapshot taken before the connection
/// died; callers must never keep reading a frozen topology.
fn resolve_snapshot(
    state: &client::SharedState,
    timed_out: bool,
) -> Result<Config, BackendError> {
    if let Some(reason) = &state.failure {
        return Err(BackendError::ConnectionFailed(reason.clone()));
    }
    if let Some(config) = &state.snapshot {
        return Ok(config.clone());
    }
    if timed_out {
        return Err(BackendError::Timeout("initial topology snapshot"));
    }
    Err(BackendError::Disconnected)
}

impl Backend for WaylandBackend {
    fn name(&self) -> &'static str {
        "wayland"
    }

    fn service_name(&self) -> &'static str {
        "org.screentopo.Backend.Wayland"
    }

    fn is_valid(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.failure.is_none() && state.snapshot.is_some()
    }

    fn config(&self) -> Result<Config, BackendError> {
        self.wait_for_snapshot()
    }

    fn set_config(&self, config: &Config) -> Result<(), BackendError> {
        if config.output_count() == 0 {
            return Ok(());
        }
        // Apply only makes sense against a ready topology.
        self.wait_for_snapshot()?;

        let (reply, verdict) = mpsc::sync_channel(1);
        self.requests
            .send(Request::Apply {
                config: config.clone(),
                reply,
            })
            .map_err(|_| BackendError::Disconnected)?;
        match verdict.recv_timeout(WAIT_TIMEOUT) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(BackendError::Timeout("configuration apply verdict"))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(BackendError::Disconnected),
        }
    }

    fn edid(&self, output: OutputId) -> Vec<u8> {
        let state = self.shared.state.lock().unwrap();
        state
            .snapshot
            .as_ref()
            .and_then(|config| config.output(output))
            .map(|output| output.edid.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::client::SharedState;

    #[test]
    fn failure_outranks_stale_snapshot() {
        let state = SharedState {
            snapshot: Some(Config::new()),
            failure: Some("socket closed".into()),
            shutdown: false,
        };
        assert!(matches!(
            resolve_snapshot(&state, false),
            Err(BackendError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn snapshot_resolves_when_healthy() {
        let state = SharedState {
            snapshot: Some(Config::new()),
            failure: None,
            shutdown: false,
        };
        assert!(resolve_snapshot(&state, false).is_ok());
    }

    #[test]
    fn empty_state_times_out() {
        let state = SharedState::default();
        assert!(matches!(
            resolve_snapshot(&state, true),
            Err(BackendError::Timeout(_))
        ));
        assert!(matches!(
            resolve_snapshot(&state, false),
            Err(BackendError::Disconnected)
        ));
    }
}

impl Drop for WaylandBackend {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.ready.notify_all();
        let _ = self.requests.send(Request::Shutdown);
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                warn!("wayland pump thread panicked during shutdown");
            }
        }
    }
}
