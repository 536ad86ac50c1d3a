//! Polling backend over the X11 RandR extension.
//!
//! RandR is requested synchronously, so the full topology is queried up
//! front and re-queried whenever a screen-change notification arrives. A
//! watcher thread polls the connection on the same tick the Wayland pump
//! uses and republishes the snapshot on changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::protocol::randr::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{AtomEnum, ConnectionExt as _, Timestamp, Window};
use x11rb::rust_connection::RustConnection;

use crate::backend::{Backend, BackendEvent};
use crate::config::{Config, Features};
use crate::error::BackendError;
use crate::geometry::{Point, Size};
use crate::mode::Mode;
use crate::output::{Output, OutputId, OutputType, Rotation};

const POLL_TICK: Duration = Duration::from_millis(50);

const XRANDR_FEATURES: Features = Features::WRITABLE
    .union(Features::PRIMARY_DISPLAY)
    .union(Features::OUTPUT_REPLICATION);

fn conn_err(err: impl std::fmt::Display) -> BackendError {
    BackendError::ConnectionFailed(err.to_string())
}

struct SharedSnapshot {
    snapshot: Mutex<Config>,
    shutdown: AtomicBool,
}

pub struct XrandrBackend {
    conn: Arc<RustConnection>,
    root: Window,
    shared: Arc<SharedSnapshot>,
    watcher: Option<JoinHandle<()>>,
}

impl XrandrBackend {
    /// Connect to the X server named by `DISPLAY`, query the initial
    /// topology and start the change watcher.
    pub fn new(emitter: SyncSender<BackendEvent>) -> Result<Self, BackendError> {
        let (conn, screen_num) = RustConnection::connect(None).map_err(conn_err)?;
        let conn = Arc::new(conn);
        let root = conn.setup().roots[screen_num].root;

        let config = query_topology(&conn, screen_num)?;
        info!("xrandr topology ready with {} outputs", config.output_count());
        let shared = Arc::new(SharedSnapshot {
            snapshot: Mutex::new(config),
            shutdown: AtomicBool::new(false),
        });

        conn.randr_select_input(
            root,
            randr::NotifyMask::SCREEN_CHANGE
                | randr::NotifyMask::CRTC_CHANGE
                | randr::NotifyMask::OUTPUT_CHANGE,
        )
        .map_err(conn_err)?;
        conn.flush().map_err(conn_err)?;

        let watcher_conn = conn.clone();
        let watcher_shared = shared.clone();
        let watcher = std::thread::Builder::new()
            .name("screentopo-xrandr".into())
            .spawn(move || watch(watcher_conn, screen_num, watcher_shared, emitter))
            .map_err(conn_err)?;

        Ok(Self {
            conn,
            root,
            shared,
            watcher: Some(watcher),
        })
    }

    /// Pick the CRTC to drive an output: the one it already uses if any,
    /// otherwise the first of its candidates that is currently idle.
    fn pick_crtc(
        &self,
        info: &randr::GetOutputInfoReply,
        timestamp: Timestamp,
    ) -> Result<Option<randr::Crtc>, BackendError> {
        if info.crtc != 0 {
            return Ok(Some(info.crtc));
        }
        for &crtc in &info.crtcs {
            let crtc_info = self
                .conn
                .randr_get_crtc_info(crtc, timestamp)
                .map_err(conn_err)?
                .reply()
                .map_err(conn_err)?;
            if crtc_info.outputs.is_empty() {
                return Ok(Some(crtc));
            }
        }
        Ok(None)
    }
}

impl Backend for XrandrBackend {
    fn name(&self) -> &'static str {
        "xrandr"
    }

    fn service_name(&self) -> &'static str {
        "org.screentopo.Backend.XRandR"
    }

    fn is_valid(&self) -> bool {
        self.shared.snapshot.lock().unwrap().is_valid()
    }

    fn config(&self) -> Result<Config, BackendError> {
        Ok(self.shared.snapshot.lock().unwrap().clone())
    }

    fn set_config(&self, config: &Config) -> Result<(), BackendError> {
        if config.output_count() == 0 {
            return Ok(());
        }
        let current = self.shared.snapshot.lock().unwrap().clone();
        let resources = self
            .conn
            .randr_get_screen_resources_current(self.root)
            .map_err(conn_err)?
            .reply()
            .map_err(conn_err)?;

        // Changes are applied under a server grab so clients never observe
        // a half-switched topology.
        self.conn.grab_server().map_err(conn_err)?;
        let result = self.apply_outputs(config, &current, &resources);
        let ungrab = self.conn.ungrab_server().map_err(conn_err);
        self.conn.flush().map_err(conn_err)?;
        result?;
        ungrab?;

        if let Some(primary) = config.primary_output() {
            self.conn
                .randr_set_output_primary(self.root, primary.id)
                .map_err(conn_err)?;
            self.conn.flush().map_err(conn_err)?;
        }
        Ok(())
    }

    fn edid(&self, output: OutputId) -> Vec<u8> {
        self.shared
            .snapshot
            .lock()
            .unwrap()
            .output(output)
            .map(|o| o.edid.clone())
            .unwrap_or_default()
    }
}

impl XrandrBackend {
    fn apply_outputs(
        &self,
        desired: &Config,
        current: &Config,
        resources: &randr::GetScreenResourcesCurrentReply,
    ) -> Result<(), BackendError> {
        for output in desired.outputs() {
            let Some(live) = current.output(output.id) else {
                warn!("apply: unknown output {}, skipped", output.id);
                continue;
            };
            if !output_differs(live, output) {
                continue;
            }

            let info = self
                .conn
                .randr_get_output_info(output.id, resources.config_timestamp)
                .map_err(conn_err)?
                .reply()
                .map_err(conn_err)?;

            if !output.enabled {
                if info.crtc != 0 {
                    debug!("apply: disabling output {}", output.name);
                    self.conn
                        .randr_set_crtc_config(
                            info.crtc,
                            x11rb::CURRENT_TIME,
                            resources.config_timestamp,
                            0,
                            0,
                            0,
                            randr::Rotation::ROTATE0,
                            &[],
                        )
                        .map_err(conn_err)?
                        .reply()
                        .map_err(conn_err)?;
                }
                continue;
            }

            let Some(mode_id) = output.current_mode_id.as_deref() else {
                return Err(BackendError::ApplyFailed(format!(
                    "output {} enabled without a mode",
                    output.name
                )));
            };
            let mode_xid: randr::Mode = mode_id.parse().map_err(|_| {
                BackendError::ApplyFailed(format!(
                    "output {} has a malformed mode id {mode_id}",
                    output.name
                ))
            })?;
            let Some(crtc) = self.pick_crtc(&info, resources.config_timestamp)? else {
                return Err(BackendError::ApplyFailed(format!(
                    "no free crtc for output {}",
                    output.name
                )));
            };

            let (x, y) = crtc_position(output)?;

            debug!(
                "apply: output {} -> mode {mode_id} at {},{}",
                output.name, output.pos.x, output.pos.y
            );
            let reply = self
                .conn
                .randr_set_crtc_config(
                    crtc,
                    x11rb::CURRENT_TIME,
                    resources.config_timestamp,
                    x,
                    y,
                    mode_xid,
                    rotation_to_randr(output.rotation),
                    &[output.id],
                )
                .map_err(conn_err)?
                .reply()
                .map_err(conn_err)?;
            if reply.status != randr::SetConfig::SUCCESS {
                return Err(BackendError::ApplyFailed(format!(
                    "set_crtc_config for output {} returned {:?}",
                    output.name, reply.status
                )));
            }
        }
        Ok(())
    }
}

impl Drop for XrandrBackend {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(watcher) = self.watcher.take() {
            if watcher.join().is_err() {
                warn!("xrandr watcher thread panicked during shutdown");
            }
        }
    }
}

fn watch(
    conn: Arc<RustConnection>,
    screen_num: usize,
    shared: Arc<SharedSnapshot>,
    emitter: SyncSender<BackendEvent>,
) {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return;
        }

        let mut dirty = false;
        loop {
            match conn.poll_for_event() {
                Ok(Some(Event::RandrScreenChangeNotify(_)) | Some(Event::RandrNotify(_))) => {
                    dirty = true;
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    let reason = err.to_string();
                    log::error!("x connection lost: {reason}");
                    let _ = emitter.send(BackendEvent::ConnectionLost(reason));
                    return;
                }
            }
        }

        if dirty {
            match query_topology(&conn, screen_num) {
                Ok(config) => {
                    debug!("topology changed, republishing {} outputs", config.output_count());
                    *shared.snapshot.lock().unwrap() = config.clone();
                    let _ = emitter.send(BackendEvent::ConfigChanged(Box::new(config)));
                }
                Err(err) => warn!("topology requery failed: {err}"),
            }
        }

        std::thread::sleep(POLL_TICK);
    }
}

/// Query the whole live topology into a fresh snapshot.
fn query_topology(conn: &RustConnection, screen_num: usize) -> Result<Config, BackendError> {
    let screen = &conn.setup().roots[screen_num];
    let root = screen.root;

    let resources = conn
        .randr_get_screen_resources_current(root)
        .map_err(conn_err)?
        .reply()
        .map_err(conn_err)?;
    let primary = conn
        .randr_get_output_primary(root)
        .map_err(conn_err)?
        .reply()
        .map_err(conn_err)?
        .output;
    let size_range = conn
        .randr_get_screen_size_range(root)
        .map_err(conn_err)?
        .reply()
        .map_err(conn_err)?;
    let edid_atom = conn
        .intern_atom(false, b"EDID")
        .map_err(conn_err)?
        .reply()
        .map_err(conn_err)?
        .atom;

    let mut config = Config::new();
    config.screen.min_size = Size::new(size_range.min_width.into(), size_range.min_height.into());
    config.screen.max_size = Size::new(size_range.max_width.into(), size_range.max_height.into());
    config.screen.current_size = Size::new(
        screen.width_in_pixels.into(),
        screen.height_in_pixels.into(),
    );
    config.screen.max_active_outputs_count = resources.crtcs.len() as u32;

    // CRTC sharing determines replication; collect crtc assignments first.
    let mut crtc_users: Vec<(randr::Crtc, OutputId)> = Vec::new();
    let mut next_priority = 1u32;

    for &output_xid in &resources.outputs {
        let info = conn
            .randr_get_output_info(output_xid, resources.config_timestamp)
            .map_err(conn_err)?
            .reply()
            .map_err(conn_err)?;
        if info.connection == randr::Connection::DISCONNECTED {
            continue;
        }

        let mut output = Output::new(output_xid);
        output.name = String::from_utf8_lossy(&info.name).into_owned();
        output.output_type = OutputType::guess_from_name(&output.name);
        output.connected = true;
        output.size_mm = Size::new(info.mm_width as i32, info.mm_height as i32);
        output.edid = query_edid(conn, output_xid, edid_atom);

        for (index, &mode_xid) in info.modes.iter().enumerate() {
            let Some(mode_info) = resources.modes.iter().find(|m| m.id == mode_xid) else {
                continue;
            };
            let mode = mode_from_info(mode_info);
            if index < info.num_preferred as usize {
                output.preferred_mode_ids.push(mode.id().to_string());
            }
            output.modes.insert(mode.id().to_string(), mode);
        }

        if info.crtc != 0 {
            let crtc_info = conn
                .randr_get_crtc_info(info.crtc, resources.config_timestamp)
                .map_err(conn_err)?
                .reply()
                .map_err(conn_err)?;
            output.enabled = crtc_info.mode != 0;
            output.pos = Point::new(crtc_info.x.into(), crtc_info.y.into());
            output.rotation = rotation_from_randr(crtc_info.rotation);
            output.current_mode_id = resources
                .modes
                .iter()
                .find(|m| m.id == crtc_info.mode)
                .map(|m| m.id.to_string());
            output.size = output
                .current_mode_id
                .as_deref()
                .and_then(|id| output.mode(id))
                .map(|m| m.size())
                .unwrap_or_default();
            crtc_users.push((info.crtc, output_xid));
        }

        if output.enabled {
            output.priority = if output_xid == primary {
                1
            } else {
                next_priority += 1;
                next_priority
            };
        }
        config.add_output(output);
    }

    // Outputs driven by the same crtc replicate each other.
    for (crtc, id) in &crtc_users {
        let clones: Vec<OutputId> = crtc_users
            .iter()
            .filter(|(c, other)| c == crtc && other != id)
            .map(|(_, other)| *other)
            .collect();
        if let Some(output) = config.output_mut(*id) {
            output.clones = clones;
        }
    }

    if primary == 0 && config.output_count() > 1 {
        warn!("multiple outputs but no primary set, keeping enumeration order");
    }
    config.adjust_priorities((primary != 0).then_some(primary));
    config.set_supported_features(XRANDR_FEATURES);
    config.refresh_screen_size();
    config.set_valid(true);
    Ok(config)
}

fn query_edid(conn: &RustConnection, output: randr::Output, edid_atom: u32) -> Vec<u8> {
    let Ok(cookie) =
        conn.randr_get_output_property(output, edid_atom, AtomEnum::ANY, 0, 256, false, false)
    else {
        return Vec::new();
    };
    match cookie.reply() {
        Ok(prop) if prop.format == 8 => prop.data,
        _ => Vec::new(),
    }
}

/// CRTC coordinates are 16-bit on the wire; positions beyond that range
/// cannot be expressed and must be rejected, not truncated.
fn crtc_position(output: &Output) -> Result<(i16, i16), BackendError> {
    match (i16::try_from(output.pos.x), i16::try_from(output.pos.y)) {
        (Ok(x), Ok(y)) => Ok((x, y)),
        _ => Err(BackendError::ApplyFailed(format!(
            "output {} position {},{} is out of range",
            output.name, output.pos.x, output.pos.y
        ))),
    }
}

/// Mode ids on this backend are the decimal XID, unique server-wide.
fn mode_from_info(info: &randr::ModeInfo) -> Mode {
    let refresh = if info.htotal > 0 && info.vtotal > 0 {
        info.dot_clock as f32 / (info.htotal as f32 * info.vtotal as f32)
    } else {
        0.0
    };
    Mode::new(
        info.id.to_string(),
        Size::new(info.width.into(), info.height.into()),
        refresh,
    )
}

fn rotation_from_randr(rotation: randr::Rotation) -> Rotation {
    if rotation.contains(randr::Rotation::ROTATE90) {
        Rotation::Left
    } else if rotation.contains(randr::Rotation::ROTATE180) {
        Rotation::Inverted
    } else if rotation.contains(randr::Rotation::ROTATE270) {
        Rotation::Right
    } else {
        Rotation::None
    }
}

fn rotation_to_randr(rotation: Rotation) -> randr::Rotation {
    match rotation {
        Rotation::None => randr::Rotation::ROTATE0,
        Rotation::Left => randr::Rotation::ROTATE90,
        Rotation::Inverted => randr::Rotation::ROTATE180,
        Rotation::Right => randr::Rotation::ROTATE270,
    }
}

/// True when the desired output state diverges from the live snapshot.
fn output_differs(live: &Output, desired: &Output) -> bool {
    if live.enabled != desired.enabled {
        return true;
    }
    if !desired.enabled {
        return false;
    }
    live.pos != desired.pos
        || live.rotation != desired.rotation
        || live.current_mode_id != desired.current_mode_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_mapping_roundtrips() {
        for rotation in [
            Rotation::None,
            Rotation::Left,
            Rotation::Inverted,
            Rotation::Right,
        ] {
            assert_eq!(rotation_from_randr(rotation_to_randr(rotation)), rotation);
        }
    }

    #[test]
    fn refresh_rate_derives_from_timings() {
        let info = randr::ModeInfo {
            id: 42,
            width: 1920,
            height: 1080,
            dot_clock: 148_500_000,
            htotal: 2200,
            vtotal: 1125,
            ..Default::default()
        };
        let mode = mode_from_info(&info);
        assert_eq!(mode.id(), "42");
        assert_eq!(mode.size(), Size::new(1920, 1080));
        assert!((mode.refresh_rate() - 60.0).abs() < 0.01);
    }

    #[test]
    fn zero_timings_give_zero_refresh() {
        let info = randr::ModeInfo {
            id: 1,
            width: 800,
            height: 600,
            ..Default::default()
        };
        assert_eq!(mode_from_info(&info).refresh_rate(), 0.0);
    }

    #[test]
    fn out_of_range_position_is_rejected() {
        let mut output = Output::new(1);
        output.name = "DP-1".into();
        output.pos = Point::new(40_000, 0);
        assert!(matches!(
            crtc_position(&output),
            Err(BackendError::ApplyFailed(_))
        ));
        output.pos = Point::new(1920, -1080);
        assert_eq!(crtc_position(&output).unwrap(), (1920, -1080));
    }

    #[test]
    fn differs_ignores_fields_of_disabled_outputs() {
        let mut live = Output::new(1);
        live.enabled = false;
        live.pos = Point::new(100, 0);
        let mut desired = Output::new(1);
        desired.enabled = false;
        desired.pos = Point::new(0, 0);
        assert!(!output_differs(&live, &desired));
        desired.enabled = true;
        assert!(output_differs(&live, &desired));
    }
}
