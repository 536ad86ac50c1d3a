use crate::geometry::Size;

/// The virtual screen: bounds and capacity of the whole output arrangement.
///
/// Invariant: `min_size <= current_size <= max_size` component-wise, and
/// `max_active_outputs_count > 0` once a backend has populated it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screen {
    pub min_size: Size,
    pub max_size: Size,
    /// Bounding box of all enabled outputs.
    pub current_size: Size,
    /// How many outputs the backend can drive at the same time.
    pub max_active_outputs_count: u32,
}

impl Default for Screen {
    fn default() -> Self {
        Self {
            min_size: Size::default(),
            max_size: Size::new(i32::MAX, i32::MAX),
            current_size: Size::default(),
            max_active_outputs_count: 1,
        }
    }
}
