use std::ops::{Add, Sub};

/// A point in 2D space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Point<N> {
    /// Horizontal coordinate
    pub x: N,
    /// Vertical coordinate
    pub y: N,
}

impl<N> Point<N> {
    /// Create a new point
    pub const fn new(x: N, y: N) -> Self {
        Point { x, y }
    }
}

impl Point<f64> {
    /// Round both coordinates to the nearest integer
    pub fn round(self) -> Point<i32> {
        Point::new(self.x.round() as i32, self.y.round() as i32)
    }
}

impl Point<i32> {
    /// Convert to floating point coordinates
    pub fn to_f64(self) -> Point<f64> {
        Point::new(self.x as f64, self.y as f64)
    }
}

impl<N> From<(N, N)> for Point<N> {
    fn from((x, y): (N, N)) -> Self {
        Point { x, y }
    }
}

impl<N: Add<Output = N>> Add for Point<N> {
    type Output = Point<N>;
    fn add(self, other: Point<N>) -> Point<N> {
        Point::new(self.x + other.x, self.y + other.y)
    }
}

impl<N: Sub<Output = N>> Sub for Point<N> {
    type Output = Point<N>;
    fn sub(self, other: Point<N>) -> Point<N> {
        Point::new(self.x - other.x, self.y - other.y)
    }
}

/// A two-dimensional extent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Size<N> {
    /// Width
    pub w: N,
    /// Height
    pub h: N,
}

impl<N> Size<N> {
    /// Create a new size
    pub const fn new(w: N, h: N) -> Self {
        Size { w, h }
    }
}

impl Size<u32> {
    /// Convert to signed coordinates
    pub fn to_i32(self) -> Size<i32> {
        Size::new(self.w as i32, self.h as i32)
    }
}

impl Size<i32> {
    /// Convert to floating point coordinates
    pub fn to_f64(self) -> Size<f64> {
        Size::new(self.w as f64, self.h as f64)
    }
}

impl<N> From<(N, N)> for Size<N> {
    fn from((w, h): (N, N)) -> Self {
        Size { w, h }
    }
}

/// An axis aligned rectangle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rectangle<N> {
    /// Location of the top left corner
    pub loc: Point<N>,
    /// Extent of the rectangle
    pub size: Size<N>,
}

impl<N> Rectangle<N> {
    /// Create a rectangle from location and size
    pub fn new(loc: impl Into<Point<N>>, size: impl Into<Size<N>>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }
}

impl Rectangle<i32> {
    /// Convert to floating point coordinates
    pub fn to_f64(self) -> Rectangle<f64> {
        Rectangle {
            loc: self.loc.to_f64(),
            size: self.size.to_f64(),
        }
    }

    /// Whether this rectangle and `other` share any area
    pub fn overlaps(self, other: Rectangle<i32>) -> bool {
        self.loc.x < other.loc.x + other.size.w
            && other.loc.x < self.loc.x + self.size.w
            && self.loc.y < other.loc.y + other.size.h
            && other.loc.y < self.loc.y + self.size.h
    }

    /// Intersection of two rectangles, if any
    pub fn intersection(self, other: Rectangle<i32>) -> Option<Rectangle<i32>> {
        if !self.overlaps(other) {
            return None;
        }
        let x = self.loc.x.max(other.loc.x);
        let y = self.loc.y.max(other.loc.y);
        let w = (self.loc.x + self.size.w).min(other.loc.x + other.size.w) - x;
        let h = (self.loc.y + self.size.h).min(other.loc.y + other.size.h) - y;
        Some(Rectangle::new((x, y), (w, h)))
    }

    /// Whether `other` is fully contained within this rectangle
    pub fn contains_rect(self, other: Rectangle<i32>) -> bool {
        other.loc.x >= self.loc.x
            && other.loc.y >= self.loc.y
            && other.loc.x + other.size.w <= self.loc.x + self.size.w
            && other.loc.y + other.size.h <= self.loc.y + self.size.h
    }
}

impl Rectangle<f64> {
    /// Whether this rectangle and `other` share any area
    pub fn overlaps_f64(self, other: Rectangle<f64>) -> bool {
        self.loc.x < other.loc.x + other.size.w
            && other.loc.x < self.loc.x + self.size.w
            && self.loc.y < other.loc.y + other.size.h
            && other.loc.y < self.loc.y + self.size.h
    }
}

/// Output/plane transforms, matching the rotations and reflections a
/// CRTC or plane can apply during scanout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Transform {
    /// Identity
    #[default]
    Normal,
    /// Counter-clockwise rotation by 90 degrees
    Rotate90,
    /// Rotation by 180 degrees
    Rotate180,
    /// Counter-clockwise rotation by 270 degrees
    Rotate270,
    /// Horizontal flip
    Flipped,
    /// Horizontal flip, then rotation by 90 degrees
    Flipped90,
    /// Horizontal flip, then rotation by 180 degrees
    Flipped180,
    /// Horizontal flip, then rotation by 270 degrees
    Flipped270,
}

impl Transform {
    /// Whether the transform swaps width and height
    pub fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            Transform::Rotate90 | Transform::Rotate270 | Transform::Flipped90 | Transform::Flipped270
        )
    }

    /// Size of an area after applying this transform
    pub fn transform_size(self, size: Size<i32>) -> Size<i32> {
        if self.swaps_dimensions() {
            Size::new(size.h, size.w)
        } else {
            size
        }
    }

    /// Map a point within `area` to its location after this transform.
    ///
    /// `area` is the untransformed extent the point lives in.
    pub fn transform_point(self, area: Size<i32>, p: Point<i32>) -> Point<i32> {
        match self {
            Transform::Normal => p,
            Transform::Rotate90 => Point::new(area.h - p.y, p.x),
            Transform::Rotate180 => Point::new(area.w - p.x, area.h - p.y),
            Transform::Rotate270 => Point::new(p.y, area.w - p.x),
            Transform::Flipped => Point::new(area.w - p.x, p.y),
            Transform::Flipped90 => Point::new(p.y, p.x),
            Transform::Flipped180 => Point::new(p.x, area.h - p.y),
            Transform::Flipped270 => Point::new(area.h - p.y, area.w - p.x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_intersection() {
        let a = Rectangle::new((0, 0), (100, 100));
        let b = Rectangle::new((50, 50), (100, 100));
        assert_eq!(a.intersection(b), Some(Rectangle::new((50, 50), (50, 50))));
        let c = Rectangle::new((200, 0), (10, 10));
        assert_eq!(a.intersection(c), None);
    }

    #[test]
    fn transform_swaps() {
        assert!(Transform::Rotate90.swaps_dimensions());
        assert!(!Transform::Flipped.swaps_dimensions());
        assert_eq!(
            Transform::Rotate90.transform_size(Size::new(1920, 1080)),
            Size::new(1080, 1920)
        );
    }
}
