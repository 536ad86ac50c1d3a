use std::collections::HashMap;
use std::hash::Hasher;

use rustc_hash::FxHasher;

use crate::geometry::{Point, Rect, Size, SizeF};
use crate::mode::Mode;

/// Backend-assigned output identifier, unique within a [`Config`](crate::Config).
///
/// Stable for the lifetime of a session, but not guaranteed stable across a
/// full reconnect if the transport reuses ids.
pub type OutputId = u32;

/// Output rotation.
///
/// `Left` is a 90 degree counter-clockwise rotation, matching the Wayland
/// transform and XRandR conventions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    None,
    Left,
    Inverted,
    Right,
}

impl Rotation {
    /// True when the rotation keeps width and height on their original axes.
    pub fn is_horizontal(self) -> bool {
        matches!(self, Rotation::None | Rotation::Inverted)
    }
}

/// Rough connector classification, guessed from the output name.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    #[default]
    Unknown,
    Panel,
    Vga,
    Dvi,
    Hdmi,
    DisplayPort,
    Tv,
}

impl OutputType {
    /// Classify a connector by its name prefix, e.g. "DP-1" or "eDP-1".
    pub fn guess_from_name(name: &str) -> Self {
        let upper = name.to_ascii_uppercase();
        if upper.starts_with("EDP") || upper.starts_with("LVDS") {
            OutputType::Panel
        } else if upper.starts_with("DP") || upper.starts_with("DISPLAYPORT") {
            OutputType::DisplayPort
        } else if upper.starts_with("HDMI") {
            OutputType::Hdmi
        } else if upper.starts_with("DVI") {
            OutputType::Dvi
        } else if upper.starts_with("VGA") {
            OutputType::Vga
        } else if upper.starts_with("TV") || upper.starts_with("S-VIDEO") {
            OutputType::Tv
        } else {
            OutputType::Unknown
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            OutputType::Panel => "video-display",
            OutputType::Tv => "video-television",
            _ => "video-display",
        }
    }
}

/// A logical display endpoint, usually mapping 1:1 to a physical monitor.
///
/// Owned exclusively by the [`Config`](crate::Config) that contains it;
/// `clone()` deep-copies, an output is never shared between two configs.
///
/// `priority` is maintained by [`Config::adjust_priorities`]
/// (crate::Config::adjust_priorities): enabled outputs are numbered densely
/// from 1 (the primary), disabled outputs hold 0. Code mutating `enabled` or
/// `priority` directly must re-run the adjustment afterwards.
#[derive(Debug, Default, Clone)]
pub struct Output {
    pub id: OutputId,
    /// Connector name, e.g. "DP-1". Never empty for a real output, but may
    /// be empty on a draft still mid-burst.
    pub name: String,
    pub output_type: OutputType,
    /// Position in the global coordinate space.
    pub pos: Point,
    /// Pixel size of the current mode.
    pub size: Size,
    /// Logical size override; when absent the logical size is derived from
    /// the pixel size, rotation and scale.
    pub explicit_logical_size: Option<SizeF>,
    /// Physical size in millimeters, zero when unknown.
    pub size_mm: Size,
    pub rotation: Rotation,
    /// Per-output scale factor, 1.0 when the backend has no scaling.
    pub scale: f64,
    pub connected: bool,
    pub enabled: bool,
    pub priority: u32,
    pub current_mode_id: Option<String>,
    pub preferred_mode_ids: Vec<String>,
    pub modes: HashMap<String, Mode>,
    /// Ids of outputs mirroring this one.
    pub clones: Vec<OutputId>,
    /// Raw EDID blob, empty when unavailable.
    pub edid: Vec<u8>,
}

impl Output {
    pub fn new(id: OutputId) -> Self {
        Self {
            id,
            scale: 1.0,
            ..Self::default()
        }
    }

    /// The primary output is the output with priority 1.
    pub fn is_primary(&self) -> bool {
        self.priority == 1
    }

    pub fn mode(&self, id: &str) -> Option<&Mode> {
        self.modes.get(id)
    }

    pub fn current_mode(&self) -> Option<&Mode> {
        self.current_mode_id.as_deref().and_then(|id| self.modes.get(id))
    }

    /// First announced preferred mode, falling back to the largest mode.
    pub fn preferred_mode(&self) -> Option<&Mode> {
        self.preferred_mode_ids
            .first()
            .and_then(|id| self.modes.get(id))
            .or_else(|| {
                self.modes.values().max_by_key(|m| {
                    (m.size().width as i64 * m.size().height as i64, m.refresh_rate() as i64)
                })
            })
    }

    /// Modes ordered largest-first, ties broken by refresh rate then id.
    pub fn sorted_modes(&self) -> Vec<&Mode> {
        let mut modes: Vec<&Mode> = self.modes.values().collect();
        modes.sort_by(|a, b| {
            let area = |m: &Mode| m.size().width as i64 * m.size().height as i64;
            area(b)
                .cmp(&area(a))
                .then(b.refresh_rate().total_cmp(&a.refresh_rate()))
                .then(a.id().cmp(b.id()))
        });
        modes
    }

    /// Identity hash for this output, a function of the EDID when present,
    /// of the connector name otherwise.
    pub fn identity_hash(&self) -> String {
        let mut hasher = FxHasher::default();
        if self.edid.is_empty() {
            hasher.write(self.name.as_bytes());
        } else {
            hasher.write(&self.edid);
        }
        format!("{:016x}", hasher.finish())
    }

    /// Logical size in the global coordinate space, honoring rotation and
    /// per-output scale.
    pub fn logical_size(&self) -> SizeF {
        if let Some(explicit) = self.explicit_logical_size {
            return explicit;
        }
        let pixels = if self.rotation.is_horizontal() {
            self.size
        } else {
            self.size.transposed()
        };
        let scale = if self.scale > 0.0 { self.scale } else { 1.0 };
        SizeF::new(pixels.width as f64 / scale, pixels.height as f64 / scale)
    }

    /// Rectangle this output covers in the global coordinate space.
    pub fn geometry(&self) -> Rect {
        let logical = self.logical_size();
        Rect::new(
            self.pos.x,
            self.pos.y,
            logical.width.round() as i32,
            logical.height.round() as i32,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Size;

    fn output_with_edid(name: &str, edid: &[u8]) -> Output {
        let mut output = Output::new(1);
        output.name = name.into();
        output.edid = edid.to_vec();
        output
    }

    #[test]
    fn identity_hash_prefers_edid() {
        let a = output_with_edid("DP-1", b"edid-bytes");
        let b = output_with_edid("DP-2", b"edid-bytes");
        assert_eq!(a.identity_hash(), b.identity_hash());
    }

    #[test]
    fn identity_hash_falls_back_to_name() {
        let a = output_with_edid("DP-1", b"");
        let b = output_with_edid("DP-2", b"");
        assert_ne!(a.identity_hash(), b.identity_hash());
    }

    #[test]
    fn identity_hash_changes_with_edid() {
        let a = output_with_edid("DP-1", b"one");
        let b = output_with_edid("DP-1", b"two");
        assert_ne!(a.identity_hash(), b.identity_hash());
    }

    #[test]
    fn logical_size_honors_rotation_and_scale() {
        let mut output = Output::new(1);
        output.size = Size::new(3840, 2160);
        output.scale = 2.0;
        output.rotation = Rotation::Left;
        let logical = output.logical_size();
        assert_eq!(logical.width, 1080.0);
        assert_eq!(logical.height, 1920.0);
    }

    #[test]
    fn connector_classification() {
        assert_eq!(OutputType::guess_from_name("eDP-1"), OutputType::Panel);
        assert_eq!(OutputType::guess_from_name("DP-3"), OutputType::DisplayPort);
        assert_eq!(OutputType::guess_from_name("HDMI-A-1"), OutputType::Hdmi);
        assert_eq!(OutputType::guess_from_name("weird-0"), OutputType::Unknown);
    }
}
