/// Position in the global coordinate space.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    /// X coordinate
    pub x: i32,
    /// Y coordinate
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Size in whole pixels (or millimeters, for physical sizes).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    /// Width in pixels
    pub width: i32,
    /// Height in pixels
    pub height: i32,
}

impl Size {
    pub fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Swap width and height, for rotated outputs.
    pub fn transposed(&self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }
}

/// Fractional size, used for logical sizes under scaling.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SizeF {
    pub width: f64,
    pub height: f64,
}

impl SizeF {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

impl From<Size> for SizeF {
    fn from(size: Size) -> Self {
        Self {
            width: size.width as f64,
            height: size.height as f64,
        }
    }
}

/// Axis-aligned rectangle in the global coordinate space.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// Smallest rectangle containing both `self` and `other`.
    pub fn united(&self, other: &Rect) -> Rect {
        if other.width <= 0 && other.height <= 0 {
            return *self;
        }
        if self.width <= 0 && self.height <= 0 {
            return *other;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(x, y, right - x, bottom - y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn united_covers_both_rects() {
        let a = Rect::new(0, 0, 1920, 1080);
        let b = Rect::new(1920, 0, 1280, 1024);
        let u = a.united(&b);
        assert_eq!(u, Rect::new(0, 0, 3200, 1080));
    }

    #[test]
    fn united_with_empty_is_identity() {
        let a = Rect::new(10, 20, 800, 600);
        assert_eq!(a.united(&Rect::default()), a);
        assert_eq!(Rect::default().united(&a), a);
    }

    #[test]
    fn transposed_swaps_dimensions() {
        assert_eq!(Size::new(1920, 1080).transposed(), Size::new(1080, 1920));
    }
}
