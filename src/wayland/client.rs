use std::collections::HashMap;
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, error, info, warn};
use wayland_client::{
    Connection, Dispatch, EventQueue, Proxy, QueueHandle,
    backend::ObjectId,
    protocol::{wl_callback, wl_registry},
};

use crate::backend::BackendEvent;
use crate::config::Config;
use crate::error::BackendError;
use crate::geometry::{Point, Size};
use crate::output::{Output, OutputId};
use crate::wayland::device::{
    DeviceEvent, DeviceState, ModeHandle, RgbRange, VrrPolicy, rotation_from_transform,
    transform_from_rotation,
};
use crate::wayland::protocol::kde_output_configuration_v2::{self, KdeOutputConfigurationV2};
use crate::wayland::protocol::kde_output_device_mode_v2::{self, KdeOutputDeviceModeV2};
use crate::wayland::protocol::kde_output_device_v2::{self, KdeOutputDeviceV2};
use crate::wayland::protocol::kde_output_management_v2::{self, KdeOutputManagementV2};
use crate::wayland::protocol::kde_output_order_v1::{self, KdeOutputOrderV1};
use crate::wayland::topology::{SyncOutcome, Topology};

const DEVICE_VERSION: u32 = 2;
const MANAGEMENT_VERSION: u32 = 2;
const ORDER_VERSION: u32 = 1;

/// Requests marshaled from the caller's thread into the pump thread.
pub(crate) enum Request {
    Apply {
        config: Config,
        reply: SyncSender<Result<(), BackendError>>,
    },
    Shutdown,
}

/// Snapshot and failure state shared between the pump thread and callers.
#[derive(Default)]
pub(crate) struct SharedState {
    pub(crate) snapshot: Option<Config>,
    pub(crate) failure: Option<String>,
    pub(crate) shutdown: bool,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<SharedState>,
    pub(crate) ready: Condvar,
}

impl Shared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SharedState::default()),
            ready: Condvar::new(),
        })
    }
}

#[derive(Debug, PartialEq)]
enum ApplyResult {
    Idle,
    Applied,
    Failed,
}

/// Owns the transport connection state: the registry view, the per-device
/// proxies, and the topology synchronizer fed by decoded events.
pub(crate) struct WaylandClient {
    topology: Topology,
    emitter: SyncSender<BackendEvent>,
    shared: Arc<Shared>,
    management: Option<KdeOutputManagementV2>,
    device_ids: HashMap<ObjectId, OutputId>,
    device_proxies: HashMap<OutputId, KdeOutputDeviceV2>,
    device_globals: HashMap<u32, OutputId>,
    mode_ids: HashMap<ObjectId, (OutputId, ModeHandle)>,
    mode_proxies: HashMap<(OutputId, ModeHandle), KdeOutputDeviceModeV2>,
    next_mode_handle: ModeHandle,
    apply_result: ApplyResult,
}

/// Event pump entry point; runs on its own thread until shutdown or a
/// terminal connection failure. No callback fires after this returns.
pub(crate) fn run(
    shared: Arc<Shared>,
    emitter: SyncSender<BackendEvent>,
    requests: Receiver<Request>,
) {
    let conn = match Connection::connect_to_env() {
        Ok(conn) => conn,
        Err(err) => {
            fail(&shared, &emitter, err.to_string());
            return;
        }
    };

    let mut queue: EventQueue<WaylandClient> = conn.new_event_queue();
    let qh = queue.handle();
    let display = conn.display();
    display.get_registry(&qh, ());
    // The callback fires once the initial burst of globals is delivered.
    display.sync(&qh, ());

    let mut client = WaylandClient {
        topology: Topology::new(),
        emitter,
        shared,
        management: None,
        device_ids: HashMap::new(),
        device_proxies: HashMap::new(),
        device_globals: HashMap::new(),
        mode_ids: HashMap::new(),
        mode_proxies: HashMap::new(),
        next_mode_handle: 0,
        apply_result: ApplyResult::Idle,
    };
    client.topology.connected();

    loop {
        if let Err(reason) = pump_once(&mut queue, &mut client) {
            client.fail(reason);
            return;
        }

        match requests.try_recv() {
            Ok(Request::Apply { config, reply }) => {
                let result = client.apply_config(&config, &mut queue, &qh);
                let _ = reply.send(result);
            }
            Ok(Request::Shutdown) | Err(TryRecvError::Disconnected) => {
                debug!("wayland pump shutting down");
                return;
            }
            Err(TryRecvError::Empty) => {}
        }
    }
}

fn pump_once(
    queue: &mut EventQueue<WaylandClient>,
    client: &mut WaylandClient,
) -> Result<(), String> {
    queue.flush().map_err(|e| e.to_string())?;

    if let Some(guard) = queue.prepare_read() {
        let fd = guard.connection_fd();
        let mut poll_fd = [rustix::event::PollFd::new(
            &fd,
            rustix::event::PollFlags::IN,
        )];
        let timeout = rustix::time::Timespec {
            tv_sec: 0,
            tv_nsec: 50_000_000,
        };
        let _ = rustix::event::poll(&mut poll_fd, Some(&timeout));
        let _ = guard.read();
    }
    queue.dispatch_pending(client).map_err(|e| e.to_string())?;
    Ok(())
}

fn fail(shared: &Shared, emitter: &SyncSender<BackendEvent>, reason: String) {
    error!("wayland connection failed: {reason}");
    {
        let mut state = shared.state.lock().unwrap();
        state.failure = Some(reason.clone());
    }
    shared.ready.notify_all();
    let _ = emitter.send(BackendEvent::ConnectionLost(reason));
}

impl WaylandClient {
    fn fail(&self, reason: String) {
        fail(&self.shared, &self.emitter, reason);
    }

    fn publish(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Pending => {}
            SyncOutcome::BecameReady => {
                info!(
                    "topology ready with {} outputs",
                    self.topology.config().output_count()
                );
                self.store_snapshot();
            }
            SyncOutcome::Updated => {
                self.store_snapshot();
                let snapshot = self.topology.config().clone();
                let _ = self
                    .emitter
                    .send(BackendEvent::ConfigChanged(Box::new(snapshot)));
            }
        }
    }

    fn store_snapshot(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.snapshot = Some(self.topology.config().clone());
        }
        self.shared.ready.notify_all();
    }

    fn forget_device(&mut self, id: OutputId) {
        self.device_ids.retain(|_, device| *device != id);
        self.device_proxies.remove(&id);
        self.mode_ids.retain(|_, (device, _)| *device != id);
        self.mode_proxies.retain(|(device, _), _| *device != id);
    }

    /// Build and submit one atomic configuration batch, then wait for the
    /// compositor's verdict. An unchanged configuration is skipped and
    /// reported as a trivial success.
    fn apply_config(
        &mut self,
        config: &Config,
        queue: &mut EventQueue<Self>,
        qh: &QueueHandle<Self>,
    ) -> Result<(), BackendError> {
        let Some(management) = self.management.clone() else {
            return Err(BackendError::ApplyFailed(
                "compositor exposes no output management".into(),
            ));
        };

        let mut deltas: Vec<&Output> = Vec::new();
        for output in config.outputs() {
            let Some(device) = self.topology.device(output.id) else {
                warn!("apply: unknown output {}, skipped", output.id);
                continue;
            };
            if device_differs(device, output) {
                deltas.push(output);
            }
        }
        if deltas.is_empty() {
            debug!("apply: configuration unchanged, skipping submission");
            return Ok(());
        }

        let batch = management.create_configuration(qh, ());
        for output in deltas {
            let Some(device) = self.device_proxies.get(&output.id) else {
                continue;
            };
            if !output.enabled {
                batch.enable(device, 0);
                continue;
            }
            batch.enable(device, 1);
            if let Some(mode_id) = output.current_mode_id.as_deref() {
                let handle = self
                    .topology
                    .device(output.id)
                    .and_then(|d| d.mode_by_id(mode_id))
                    .map(|m| m.handle);
                match handle.and_then(|h| self.mode_proxies.get(&(output.id, h))) {
                    Some(mode) => batch.mode(device, mode),
                    None => warn!(
                        "apply: output {} requests unknown mode {mode_id}, mode left unchanged",
                        output.name
                    ),
                }
            }
            batch.position(device, output.pos.x, output.pos.y);
            batch.transform(device, transform_from_rotation(output.rotation));
            batch.scale(device, output.scale);
        }
        batch.apply();
        let result = self.wait_for_apply(queue);
        batch.destroy();
        result
    }

    fn wait_for_apply(&mut self, queue: &mut EventQueue<Self>) -> Result<(), BackendError> {
        self.apply_result = ApplyResult::Idle;
        while self.apply_result == ApplyResult::Idle {
            queue
                .blocking_dispatch(self)
                .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;
        }
        match self.apply_result {
            ApplyResult::Applied => Ok(()),
            ApplyResult::Failed => Err(BackendError::ApplyFailed(
                "compositor rejected the configuration".into(),
            )),
            ApplyResult::Idle => unreachable!(),
        }
    }
}

/// True when the desired output state diverges from the device's last
/// known state.
fn device_differs(device: &DeviceState, desired: &Output) -> bool {
    if device.enabled() != desired.enabled {
        return true;
    }
    if !desired.enabled {
        return false;
    }
    if device.pos() != desired.pos {
        return true;
    }
    if rotation_from_transform(device.transform()) != desired.rotation {
        return true;
    }
    if (device.scale() - desired.scale).abs() > 1e-6 {
        return true;
    }
    let current = device.current_mode().map(|m| m.id());
    current.as_deref() != desired.current_mode_id.as_deref()
}

impl Dispatch<wl_registry::WlRegistry, ()> for WaylandClient {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => {
                if interface == KdeOutputDeviceV2::interface().name {
                    let device = registry.bind::<KdeOutputDeviceV2, _, _>(
                        name,
                        version.min(DEVICE_VERSION),
                        qh,
                        (),
                    );
                    let id = state.topology.announce_device();
                    state.device_ids.insert(device.id(), id);
                    state.device_proxies.insert(id, device);
                    state.device_globals.insert(name, id);
                    debug!("output device {id} announced (global {name})");
                } else if interface == KdeOutputManagementV2::interface().name {
                    let management = registry.bind::<KdeOutputManagementV2, _, _>(
                        name,
                        version.min(MANAGEMENT_VERSION),
                        qh,
                        (),
                    );
                    state.management = Some(management);
                } else if interface == KdeOutputOrderV1::interface().name {
                    registry.bind::<KdeOutputOrderV1, _, _>(
                        name,
                        version.min(ORDER_VERSION),
                        qh,
                        (),
                    );
                }
            }
            wl_registry::Event::GlobalRemove { name } => {
                if let Some(id) = state.device_globals.remove(&name) {
                    debug!("output device {id} withdrawn (global {name})");
                    state.forget_device(id);
                    let outcome = state.topology.remove_device(id);
                    state.publish(outcome);
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_callback::WlCallback, ()> for WaylandClient {
    fn event(
        state: &mut Self,
        _: &wl_callback::WlCallback,
        event: wl_callback::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { .. } = event {
            debug!("registry sync complete");
            let outcome = state.topology.registry_synced();
            state.publish(outcome);
        }
    }
}

impl Dispatch<KdeOutputManagementV2, ()> for WaylandClient {
    fn event(
        _: &mut Self,
        _: &KdeOutputManagementV2,
        _: kde_output_management_v2::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<KdeOutputDeviceV2, ()> for WaylandClient {
    fn event(
        state: &mut Self,
        device: &KdeOutputDeviceV2,
        event: kde_output_device_v2::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(&id) = state.device_ids.get(&device.id()) else {
            return;
        };

        use kde_output_device_v2::Event;
        let decoded = match event {
            Event::Geometry {
                x,
                y,
                physical_width,
                physical_height,
                subpixel,
                make,
                model,
                transform,
            } => Some(DeviceEvent::Geometry {
                pos: Point::new(x, y),
                physical_size: Size::new(physical_width, physical_height),
                subpixel,
                make,
                model,
                transform,
            }),
            Event::Mode { mode } => {
                state.next_mode_handle += 1;
                let handle = state.next_mode_handle;
                state.mode_ids.insert(mode.id(), (id, handle));
                state.mode_proxies.insert((id, handle), mode);
                Some(DeviceEvent::ModeAnnounced(handle))
            }
            Event::CurrentMode { mode } => match state.mode_ids.get(&mode.id()) {
                Some(&(_, handle)) => Some(DeviceEvent::CurrentMode(handle)),
                None => {
                    warn!("output {id}: current mode references an unbound mode object");
                    None
                }
            },
            Event::Scale { factor } => Some(DeviceEvent::Scale(factor)),
            Event::Edid { raw } => Some(DeviceEvent::Edid(raw)),
            Event::Enabled { enabled } => Some(DeviceEvent::Enabled(enabled != 0)),
            Event::Uuid { uuid } => Some(DeviceEvent::Uuid(uuid)),
            Event::SerialNumber { serial_number } => Some(DeviceEvent::SerialNumber(serial_number)),
            Event::EisaId { eisa_id } => Some(DeviceEvent::EisaId(eisa_id)),
            Event::Capabilities { flags } => Some(DeviceEvent::Capabilities(flags)),
            Event::Overscan { overscan } => Some(DeviceEvent::Overscan(overscan)),
            Event::VrrPolicy { vrr_policy } => Some(DeviceEvent::VrrPolicy(match vrr_policy {
                1 => VrrPolicy::Always,
                2 => VrrPolicy::Automatic,
                _ => VrrPolicy::Never,
            })),
            Event::RgbRange { rgb_range } => Some(DeviceEvent::RgbRange(match rgb_range {
                1 => RgbRange::Full,
                2 => RgbRange::Limited,
                _ => RgbRange::Automatic,
            })),
            Event::Name { name } => Some(DeviceEvent::Name(name)),
            Event::HighDynamicRange { hdr_enabled } => {
                Some(DeviceEvent::HighDynamicRange(hdr_enabled != 0))
            }
            Event::SdrBrightness { sdr_brightness } => {
                Some(DeviceEvent::SdrBrightness(sdr_brightness))
            }
            Event::WideColorGamut { wcg_enabled } => {
                Some(DeviceEvent::WideColorGamut(wcg_enabled != 0))
            }
            Event::Done => Some(DeviceEvent::Done),
        };

        if let Some(event) = decoded {
            let outcome = state.topology.device_event(id, event);
            state.publish(outcome);
        }
    }

    fn event_created_child(
        _opcode: u16,
        qh: &QueueHandle<Self>,
    ) -> Arc<dyn wayland_client::backend::ObjectData> {
        // The only child interface a device creates is a mode.
        qh.make_data::<KdeOutputDeviceModeV2, _>(())
    }
}

impl Dispatch<KdeOutputDeviceModeV2, ()> for WaylandClient {
    fn event(
        state: &mut Self,
        mode: &KdeOutputDeviceModeV2,
        event: kde_output_device_mode_v2::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(&(device, handle)) = state.mode_ids.get(&mode.id()) else {
            warn!("event for unbound mode object, ignored");
            return;
        };

        use kde_output_device_mode_v2::Event;
        let decoded = match event {
            Event::Size { width, height } => Some(DeviceEvent::ModeSize {
                mode: handle,
                size: Size::new(width, height),
            }),
            Event::Refresh { refresh } => Some(DeviceEvent::ModeRefresh {
                mode: handle,
                millihertz: refresh,
            }),
            Event::Preferred => Some(DeviceEvent::ModePreferred(handle)),
            Event::Removed => {
                state.mode_ids.remove(&mode.id());
                state.mode_proxies.remove(&(device, handle));
                Some(DeviceEvent::ModeRemoved(handle))
            }
        };

        if let Some(event) = decoded {
            let outcome = state.topology.device_event(device, event);
            state.publish(outcome);
        }
    }
}

impl Dispatch<KdeOutputOrderV1, ()> for WaylandClient {
    fn event(
        state: &mut Self,
        _: &KdeOutputOrderV1,
        event: kde_output_order_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            kde_output_order_v1::Event::Output { output_name } => {
                state.topology.order_output(output_name);
            }
            kde_output_order_v1::Event::Done => {
                let outcome = state.topology.order_done();
                state.publish(outcome);
            }
        }
    }
}

impl Dispatch<KdeOutputConfigurationV2, ()> for WaylandClient {
    fn event(
        state: &mut Self,
        _: &KdeOutputConfigurationV2,
        event: kde_output_configuration_v2::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            kde_output_configuration_v2::Event::Applied => {
                state.apply_result = ApplyResult::Applied;
            }
            kde_output_configuration_v2::Event::Failed => {
                state.apply_result = ApplyResult::Failed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_device() -> DeviceState {
        let mut device = DeviceState::new(4);
        device.handle_event(DeviceEvent::Name("DP-1".into()));
        device.handle_event(DeviceEvent::Geometry {
            pos: Point::new(1920, 0),
            physical_size: Size::new(520, 290),
            subpixel: 0,
            make: "ACME".into(),
            model: "Panel".into(),
            transform: 0,
        });
        device.handle_event(DeviceEvent::ModeAnnounced(1));
        device.handle_event(DeviceEvent::ModeSize {
            mode: 1,
            size: Size::new(1920, 1080),
        });
        device.handle_event(DeviceEvent::ModeRefresh {
            mode: 1,
            millihertz: 60_000,
        });
        device.handle_event(DeviceEvent::CurrentMode(1));
        device.handle_event(DeviceEvent::Enabled(true));
        device.handle_event(DeviceEvent::Done);
        device
    }

    #[test]
    fn unchanged_projection_produces_no_delta() {
        let device = ready_device();
        let output = device.to_output();
        assert!(!device_differs(&device, &output));
    }

    #[test]
    fn position_change_is_a_delta() {
        let device = ready_device();
        let mut output = device.to_output();
        output.pos = Point::new(0, 0);
        assert!(device_differs(&device, &output));
    }

    #[test]
    fn mode_change_is_a_delta() {
        let device = ready_device();
        let mut output = device.to_output();
        output.current_mode_id = Some("1280x1024@75".into());
        assert!(device_differs(&device, &output));
    }

    #[test]
    fn disabled_desired_state_only_compares_enablement() {
        let mut device = DeviceState::new(4);
        device.handle_event(DeviceEvent::Enabled(false));
        let mut output = device.to_output();
        output.pos = Point::new(500, 500);
        assert!(!device_differs(&device, &output));
        output.enabled = true;
        assert!(device_differs(&device, &output));
    }
}
