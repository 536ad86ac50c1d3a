use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::warn;

use crate::geometry::{Point, Size};
use crate::mode::Mode;
use crate::output::{Output, OutputId, OutputType, Rotation};

/// Locally assigned handle for a mode announced on a device.
pub type ModeHandle = u32;

/// Variable-refresh-rate policy reported for a device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum VrrPolicy {
    #[default]
    Never,
    Always,
    Automatic,
}

/// RGB range mode reported for a device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RgbRange {
    #[default]
    Automatic,
    Full,
    Limited,
}

/// One decoded property-update event for a single output device.
///
/// The protocol dispatch layer translates wire messages into these; nothing
/// protocol-specific leaks past this point.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Geometry {
        pos: Point,
        physical_size: Size,
        subpixel: i32,
        make: String,
        model: String,
        transform: i32,
    },
    /// Repeatable; announces a mode under a locally assigned handle.
    ModeAnnounced(ModeHandle),
    ModeSize { mode: ModeHandle, size: Size },
    /// Refresh rate in millihertz.
    ModeRefresh { mode: ModeHandle, millihertz: i32 },
    ModePreferred(ModeHandle),
    ModeRemoved(ModeHandle),
    CurrentMode(ModeHandle),
    Scale(f64),
    /// Base64-encoded EDID, as delivered on the wire.
    Edid(String),
    Enabled(bool),
    Uuid(String),
    SerialNumber(String),
    EisaId(String),
    Capabilities(u32),
    Overscan(u32),
    VrrPolicy(VrrPolicy),
    RgbRange(RgbRange),
    Name(String),
    HighDynamicRange(bool),
    SdrBrightness(u32),
    WideColorGamut(bool),
    /// Terminal marker of a burst.
    Done,
}

#[derive(Debug, Default, Clone)]
pub struct DeviceMode {
    pub handle: ModeHandle,
    pub size: Size,
    /// Millihertz.
    pub refresh: i32,
    pub preferred: bool,
}

impl DeviceMode {
    /// Stable mode id within the owning output, e.g. "1920x1080@60".
    pub fn id(&self) -> String {
        format!(
            "{}x{}@{}",
            self.size.width,
            self.size.height,
            (self.refresh as f64 / 1000.0).round() as i64
        )
    }

    pub fn refresh_hz(&self) -> f32 {
        self.refresh as f32 / 1000.0
    }
}

/// Per-output draft state, accumulated from a burst of unordered property
/// events and frozen when the burst's done marker arrives.
///
/// Repeated bursts are full-state replacement: every event overwrites its
/// field, mode announcements with a known handle reset that mode.
#[derive(Debug, Default, Clone)]
pub struct DeviceState {
    id: OutputId,
    pos: Point,
    physical_size: Size,
    subpixel: i32,
    make: String,
    model: String,
    transform: i32,
    scale: f64,
    edid: Vec<u8>,
    enabled: bool,
    uuid: String,
    serial_number: String,
    eisa_id: String,
    capabilities: u32,
    overscan: u32,
    vrr_policy: VrrPolicy,
    rgb_range: RgbRange,
    name: String,
    hdr_enabled: bool,
    sdr_brightness: u32,
    wide_color_gamut: bool,
    modes: Vec<DeviceMode>,
    current_mode: Option<ModeHandle>,
}

impl DeviceState {
    pub fn new(id: OutputId) -> Self {
        Self {
            id,
            scale: 1.0,
            sdr_brightness: 200,
            ..Self::default()
        }
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn edid(&self) -> &[u8] {
        &self.edid
    }

    pub fn pos(&self) -> Point {
        self.pos
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn transform(&self) -> i32 {
        self.transform
    }

    pub fn modes(&self) -> &[DeviceMode] {
        &self.modes
    }

    pub fn current_mode(&self) -> Option<&DeviceMode> {
        self.current_mode.and_then(|handle| self.mode(handle))
    }

    pub fn mode(&self, handle: ModeHandle) -> Option<&DeviceMode> {
        self.modes.iter().find(|m| m.handle == handle)
    }

    /// Find the announced mode matching a data-model mode id.
    pub fn mode_by_id(&self, id: &str) -> Option<&DeviceMode> {
        self.modes.iter().find(|m| m.id() == id)
    }

    /// Absorb one event. Returns true when the event was the burst's done
    /// marker; the caller decides what completion means.
    pub fn handle_event(&mut self, event: DeviceEvent) -> bool {
        match event {
            DeviceEvent::Geometry {
                pos,
                physical_size,
                subpixel,
                make,
                model,
                transform,
            } => {
                self.pos = pos;
                self.physical_size = physical_size;
                self.subpixel = subpixel;
                self.make = make;
                self.model = model;
                self.transform = transform;
            }
            DeviceEvent::ModeAnnounced(handle) => {
                // Re-announcement resets the mode's draft.
                self.modes.retain(|m| m.handle != handle);
                self.modes.push(DeviceMode {
                    handle,
                    ..DeviceMode::default()
                });
            }
            DeviceEvent::ModeSize { mode, size } => {
                if let Some(m) = self.mode_mut(mode) {
                    m.size = size;
                }
            }
            DeviceEvent::ModeRefresh { mode, millihertz } => {
                if let Some(m) = self.mode_mut(mode) {
                    m.refresh = millihertz;
                }
            }
            DeviceEvent::ModePreferred(mode) => {
                if let Some(m) = self.mode_mut(mode) {
                    m.preferred = true;
                }
            }
            DeviceEvent::ModeRemoved(mode) => {
                self.modes.retain(|m| m.handle != mode);
                if self.current_mode == Some(mode) {
                    self.current_mode = None;
                }
            }
            DeviceEvent::CurrentMode(mode) => {
                if self.mode(mode).is_some() {
                    self.current_mode = Some(mode);
                } else {
                    warn!(
                        "output {}: current-mode event references unknown mode {mode}, ignored",
                        self.id
                    );
                }
            }
            DeviceEvent::Scale(factor) => self.scale = factor,
            DeviceEvent::Edid(raw) => match BASE64.decode(raw.as_bytes()) {
                Ok(bytes) => self.edid = bytes,
                Err(err) => {
                    warn!("output {}: undecodable EDID payload: {err}", self.id);
                }
            },
            DeviceEvent::Enabled(enabled) => self.enabled = enabled,
            DeviceEvent::Uuid(uuid) => self.uuid = uuid,
            DeviceEvent::SerialNumber(serial) => self.serial_number = serial,
            DeviceEvent::EisaId(eisa) => self.eisa_id = eisa,
            DeviceEvent::Capabilities(flags) => self.capabilities = flags,
            DeviceEvent::Overscan(overscan) => self.overscan = overscan,
            DeviceEvent::VrrPolicy(policy) => self.vrr_policy = policy,
            DeviceEvent::RgbRange(range) => self.rgb_range = range,
            DeviceEvent::Name(name) => self.name = name,
            DeviceEvent::HighDynamicRange(enabled) => self.hdr_enabled = enabled,
            DeviceEvent::SdrBrightness(brightness) => self.sdr_brightness = brightness,
            DeviceEvent::WideColorGamut(enabled) => self.wide_color_gamut = enabled,
            DeviceEvent::Done => return true,
        }
        false
    }

    fn mode_mut(&mut self, handle: ModeHandle) -> Option<&mut DeviceMode> {
        let found = self.modes.iter_mut().find(|m| m.handle == handle);
        if found.is_none() {
            warn!(
                "output {}: event references unknown mode {handle}, ignored",
                self.id
            );
        }
        found
    }

    /// Project this draft into the data model, creating a fresh output.
    pub fn to_output(&self) -> Output {
        let mut output = Output::new(self.id);
        self.update_output(&mut output);
        output
    }

    /// Project this draft into an existing output in place, preserving its
    /// identity and priority. Loss-free for every field the data model
    /// supports; fields with no equivalent (uuid, overscan, color state)
    /// stay local to the aggregator.
    pub fn update_output(&self, output: &mut Output) {
        output.name = self.name.clone();
        output.output_type = OutputType::guess_from_name(&self.name);
        output.pos = self.pos;
        output.size_mm = self.physical_size;
        output.rotation = rotation_from_transform(self.transform);
        output.scale = self.scale;
        output.connected = true;
        output.enabled = self.enabled;
        output.edid = self.edid.clone();

        output.modes.clear();
        output.preferred_mode_ids.clear();
        for mode in &self.modes {
            let id = mode.id();
            if mode.preferred {
                output.preferred_mode_ids.push(id.clone());
            }
            output
                .modes
                .insert(id.clone(), Mode::new(id, mode.size, mode.refresh_hz()));
        }
        output.current_mode_id = self.current_mode().map(|m| m.id());
        output.size = self.current_mode().map(|m| m.size).unwrap_or_default();
    }
}

/// Map a Wayland output transform to a rotation. Flipped variants collapse
/// onto their rotation, the data model has no flip axis.
pub fn rotation_from_transform(transform: i32) -> Rotation {
    match transform {
        1 | 5 => Rotation::Left,
        2 | 6 => Rotation::Inverted,
        3 | 7 => Rotation::Right,
        _ => Rotation::None,
    }
}

/// Inverse of [`rotation_from_transform`] for write-back requests.
pub fn transform_from_rotation(rotation: Rotation) -> i32 {
    match rotation {
        Rotation::None => 0,
        Rotation::Left => 1,
        Rotation::Inverted => 2,
        Rotation::Right => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce_mode(state: &mut DeviceState, handle: ModeHandle, w: i32, h: i32, mhz: i32) {
        state.handle_event(DeviceEvent::ModeAnnounced(handle));
        state.handle_event(DeviceEvent::ModeSize {
            mode: handle,
            size: Size::new(w, h),
        });
        state.handle_event(DeviceEvent::ModeRefresh {
            mode: handle,
            millihertz: mhz,
        });
    }

    #[test]
    fn burst_projects_into_output() {
        let mut state = DeviceState::new(7);
        state.handle_event(DeviceEvent::Geometry {
            pos: Point::new(0, 0),
            physical_size: Size::new(520, 290),
            subpixel: 0,
            make: "ACME".into(),
            model: "Panel".into(),
            transform: 0,
        });
        announce_mode(&mut state, 1, 1920, 1080, 60_000);
        state.handle_event(DeviceEvent::CurrentMode(1));
        state.handle_event(DeviceEvent::Enabled(true));
        assert!(state.handle_event(DeviceEvent::Done));

        let output = state.to_output();
        // The connector name may arrive in a later burst on real hardware.
        assert_eq!(output.modes.len(), 1);
        let mode = output.modes.get("1920x1080@60").unwrap();
        assert_eq!(mode.size(), Size::new(1920, 1080));
        assert!(mode.refresh_rate() > 0.0);
        assert_eq!(output.current_mode_id.as_deref(), Some("1920x1080@60"));
        assert_eq!(output.size, Size::new(1920, 1080));
        assert!(output.enabled);
        assert!(output.connected);
    }

    #[test]
    fn unknown_current_mode_is_ignored() {
        let mut state = DeviceState::new(1);
        announce_mode(&mut state, 1, 1280, 1024, 75_000);
        state.handle_event(DeviceEvent::CurrentMode(99));
        assert!(state.current_mode().is_none());
    }

    #[test]
    fn mode_removal_clears_current() {
        let mut state = DeviceState::new(1);
        announce_mode(&mut state, 1, 1280, 1024, 75_000);
        state.handle_event(DeviceEvent::CurrentMode(1));
        state.handle_event(DeviceEvent::ModeRemoved(1));
        assert!(state.current_mode().is_none());
        assert!(state.modes().is_empty());
    }

    #[test]
    fn update_preserves_priority() {
        let mut state = DeviceState::new(3);
        state.handle_event(DeviceEvent::Name("DP-1".into()));
        state.handle_event(DeviceEvent::Enabled(true));
        let mut output = state.to_output();
        output.priority = 2;
        state.handle_event(DeviceEvent::Name("DP-1".into()));
        state.update_output(&mut output);
        assert_eq!(output.priority, 2);
        assert_eq!(output.name, "DP-1");
    }

    #[test]
    fn preferred_modes_are_projected() {
        let mut state = DeviceState::new(1);
        announce_mode(&mut state, 1, 3840, 2160, 60_000);
        announce_mode(&mut state, 2, 1920, 1080, 60_000);
        state.handle_event(DeviceEvent::ModePreferred(1));
        let output = state.to_output();
        assert_eq!(output.preferred_mode_ids, vec!["3840x2160@60".to_string()]);
        assert_eq!(output.preferred_mode().unwrap().id(), "3840x2160@60");
    }

    #[test]
    fn transform_mapping_roundtrips() {
        for rotation in [Rotation::None, Rotation::Left, Rotation::Inverted, Rotation::Right] {
            assert_eq!(rotation_from_transform(transform_from_rotation(rotation)), rotation);
        }
        assert_eq!(rotation_from_transform(5), Rotation::Left);
    }
}
