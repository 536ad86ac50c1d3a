use crate::geometry::Size;

/// A supported (resolution, refresh-rate) pairing for an output.
///
/// Modes are immutable once constructed and owned exclusively by the
/// [`Output`](crate::Output) that announced them. The `id` is a stable
/// string unique within that output.
#[derive(Debug, Clone, PartialEq)]
pub struct Mode {
    id: String,
    size: Size,
    refresh_rate: f32,
}

impl Mode {
    pub fn new(id: impl Into<String>, size: Size, refresh_rate: f32) -> Self {
        Self {
            id: id.into(),
            size,
            refresh_rate,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Nominal pixel size of this mode.
    pub fn size(&self) -> Size {
        self.size
    }

    /// Refresh rate in Hz. Always positive for a real mode.
    pub fn refresh_rate(&self) -> f32 {
        self.refresh_rate
    }

    /// Human-readable name, e.g. "1920x1080@60".
    pub fn name(&self) -> String {
        format!(
            "{}x{}@{}",
            self.size.width,
            self.size.height,
            self.refresh_rate.round() as i32
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_rounds_refresh() {
        let mode = Mode::new("m1", Size::new(1920, 1080), 59.951);
        assert_eq!(mode.name(), "1920x1080@60");
    }
}
