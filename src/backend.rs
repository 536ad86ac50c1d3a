use std::env;
use std::sync::mpsc::SyncSender;

use log::info;

use crate::config::Config;
use crate::error::BackendError;
use crate::output::OutputId;
use crate::wayland::WaylandBackend;
use crate::xrandr::XrandrBackend;

/// Events emitted by a backend through the channel given at construction.
#[derive(Debug)]
pub enum BackendEvent {
    /// A topology rebuild completed after the first ready state; carries the
    /// new snapshot.
    ConfigChanged(Box<Config>),
    /// The transport connection was lost. Terminal; construct a new backend
    /// to retry.
    ConnectionLost(String),
}

/// Capability contract implemented by every concrete backend.
///
/// Snapshots returned by [`config`](Backend::config) are handed out by
/// value; a consumer holding one never sees it mutate underneath it.
pub trait Backend: Send {
    /// Short static identity, e.g. "wayland".
    fn name(&self) -> &'static str;

    /// Service identity, e.g. "org.screentopo.Backend.Wayland".
    fn service_name(&self) -> &'static str;

    /// True once the backend has produced at least one ready snapshot.
    fn is_valid(&self) -> bool;

    /// Current configuration snapshot. Blocks the calling thread (not the
    /// event pump) until the topology is ready, the connection fails, or a
    /// timeout elapses.
    fn config(&self) -> Result<Config, BackendError>;

    /// Submit one atomic configuration-change batch. A config with no
    /// outputs is a no-op. Blocks until the display server reports the
    /// batch applied or failed.
    fn set_config(&self, config: &Config) -> Result<(), BackendError>;

    /// Raw EDID of the given output, empty when unknown.
    fn edid(&self, output: OutputId) -> Vec<u8>;
}

/// Environment variable naming the backend to load: "wayland" or "xrandr".
pub const BACKEND_ENV: &str = "SCREENTOPO_BACKEND";

/// Instantiate a backend based on the environment.
///
/// `SCREENTOPO_BACKEND` selects the implementation explicitly; otherwise a
/// Wayland session (`WAYLAND_DISPLAY` set) gets the Wayland backend and
/// anything else falls back to XRandR. `WAYLAND_DISPLAY` itself doubles as
/// the transport socket override, honored by the connection setup.
pub fn backend_from_env(
    emitter: SyncSender<BackendEvent>,
) -> Result<Box<dyn Backend>, BackendError> {
    let requested = env::var(BACKEND_ENV).ok();
    let name = match requested.as_deref() {
        Some(name) => name.to_string(),
        None if env::var("WAYLAND_DISPLAY").is_ok() => "wayland".to_string(),
        None => "xrandr".to_string(),
    };
    info!("loading {name} backend");
    match name.as_str() {
        "wayland" => Ok(Box::new(WaylandBackend::new(emitter)?)),
        "xrandr" => Ok(Box::new(XrandrBackend::new(emitter)?)),
        other => Err(BackendError::Unavailable(format!(
            "unknown backend {other:?}"
        ))),
    }
}
