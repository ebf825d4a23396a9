//! Integer rectangles, sizes and the affine draw matrix.
//!
//! Rectangles are half-open: a point `(x, y)` is inside when
//! `left <= x < right` and `top <= y < bottom`.

use std::fmt;

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Swap width and height (used for quarter-turn orientations).
    pub fn transposed(&self) -> Self {
        Self::new(self.height, self.width)
    }

    pub fn to_rect(&self) -> Rect {
        Rect::new(0, 0, self.width as i32, self.height as i32)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A point in floating point coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned integer rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const EMPTY: Rect = Rect {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };

    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_xywh(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self::new(x, y, x + width as i32, y + height as i32)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Size of the rectangle, zero for inverted rectangles.
    pub fn size(&self) -> Size {
        Size::new(self.width().max(0) as u32, self.height().max(0) as u32)
    }

    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    pub fn area(&self) -> u64 {
        self.size().area()
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.left as f32 && x < self.right as f32 && y >= self.top as f32 && y < self.bottom as f32
    }

    /// True when `other` lies entirely within `self`.
    pub fn contains(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.left <= other.left
            && self.top <= other.top
            && self.right >= other.right
            && self.bottom >= other.bottom
    }

    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let out = Rect::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        );
        (!out.is_empty()).then_some(out)
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.intersect(other).is_some()
    }

    pub fn offset(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.left + dx, self.top + dy, self.right + dx, self.bottom + dy)
    }

    /// Scale the rectangle, flooring the leading edges and ceiling the trailing
    /// ones so that adjacent rectangles never open a gap between them.
    pub fn scale_out(&self, sx: f64, sy: f64) -> Rect {
        Rect::new(
            (self.left as f64 * sx).floor() as i32,
            (self.top as f64 * sy).floor() as i32,
            (self.right as f64 * sx).ceil() as i32,
            (self.bottom as f64 * sy).ceil() as i32,
        )
    }

    pub fn to_rect_f(&self) -> RectF {
        RectF::new(
            self.left as f32,
            self.top as f32,
            self.right as f32,
            self.bottom as f32,
        )
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{} {}x{}]",
            self.left,
            self.top,
            self.width(),
            self.height()
        )
    }
}

/// Floating point rectangle, produced by mapping a [`Rect`] through a [`Matrix`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RectF {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl RectF {
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    /// Smallest integer rectangle containing this one.
    pub fn round_out(&self) -> Rect {
        Rect::new(
            self.left.floor() as i32,
            self.top.floor() as i32,
            self.right.ceil() as i32,
            self.bottom.ceil() as i32,
        )
    }
}

/// 2D affine transform mapping drawable space to view space.
///
/// ```text
/// | sx  kx  tx |
/// | ky  sy  ty |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix {
    pub sx: f32,
    pub kx: f32,
    pub tx: f32,
    pub ky: f32,
    pub sy: f32,
    pub ty: f32,
}

impl Default for Matrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Matrix {
    pub const IDENTITY: Matrix = Matrix {
        sx: 1.0,
        kx: 0.0,
        tx: 0.0,
        ky: 0.0,
        sy: 1.0,
        ty: 0.0,
    };

    pub fn scale(sx: f32, sy: f32) -> Self {
        Self {
            sx,
            sy,
            ..Self::IDENTITY
        }
    }

    pub fn translate(tx: f32, ty: f32) -> Self {
        Self {
            tx,
            ty,
            ..Self::IDENTITY
        }
    }

    /// Rotation about the origin. Quarter turns are exact.
    pub fn rotate(degrees: i32) -> Self {
        let (sin, cos) = match degrees.rem_euclid(360) {
            0 => (0.0, 1.0),
            90 => (1.0, 0.0),
            180 => (0.0, -1.0),
            270 => (-1.0, 0.0),
            other => (other as f32).to_radians().sin_cos(),
        };
        Self {
            sx: cos,
            kx: -sin,
            tx: 0.0,
            ky: sin,
            sy: cos,
            ty: 0.0,
        }
    }

    /// `self` followed by `next`.
    pub fn then(&self, next: &Matrix) -> Matrix {
        Matrix {
            sx: next.sx * self.sx + next.kx * self.ky,
            kx: next.sx * self.kx + next.kx * self.sy,
            tx: next.sx * self.tx + next.kx * self.ty + next.tx,
            ky: next.ky * self.sx + next.sy * self.ky,
            sy: next.ky * self.kx + next.sy * self.sy,
            ty: next.ky * self.tx + next.sy * self.ty + next.ty,
        }
    }

    pub fn invert(&self) -> Option<Matrix> {
        let det = self.sx * self.sy - self.kx * self.ky;
        if det.abs() < f32::EPSILON {
            return None;
        }
        let inv = 1.0 / det;
        Some(Matrix {
            sx: self.sy * inv,
            kx: -self.kx * inv,
            tx: (self.kx * self.ty - self.sy * self.tx) * inv,
            ky: -self.ky * inv,
            sy: self.sx * inv,
            ty: (self.ky * self.tx - self.sx * self.ty) * inv,
        })
    }

    pub fn map_point(&self, p: Point) -> Point {
        Point::new(
            self.sx * p.x + self.kx * p.y + self.tx,
            self.ky * p.x + self.sy * p.y + self.ty,
        )
    }

    /// Bounding box of the mapped rectangle.
    pub fn map_rect(&self, r: &RectF) -> RectF {
        let corners = [
            self.map_point(Point::new(r.left, r.top)),
            self.map_point(Point::new(r.right, r.top)),
            self.map_point(Point::new(r.left, r.bottom)),
            self.map_point(Point::new(r.right, r.bottom)),
        ];
        let mut out = RectF::new(f32::MAX, f32::MAX, f32::MIN, f32::MIN);
        for c in corners {
            out.left = out.left.min(c.x);
            out.top = out.top.min(c.y);
            out.right = out.right.max(c.x);
            out.bottom = out.bottom.max(c.y);
        }
        out
    }

    /// Uniform scale factor along the x axis, ignoring rotation.
    pub fn scale_x(&self) -> f32 {
        (self.sx * self.sx + self.ky * self.ky).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_empty_and_intersect() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(50, 50, 150, 150);
        assert_eq!(a.intersect(&b), Some(Rect::new(50, 50, 100, 100)));
        assert!(Rect::new(10, 10, 10, 20).is_empty());
        assert_eq!(a.intersect(&Rect::new(100, 0, 200, 100)), None);
    }

    #[test]
    fn test_rect_contains() {
        let outer = Rect::new(0, 0, 100, 100);
        assert!(outer.contains(&Rect::new(10, 10, 100, 100)));
        assert!(!outer.contains(&Rect::new(10, 10, 101, 100)));
        assert!(outer.contains_point(0.0, 99.5));
        assert!(!outer.contains_point(100.0, 50.0));
    }

    #[test]
    fn test_scale_out_never_opens_gaps() {
        let left = Rect::new(0, 0, 33, 10);
        let right = Rect::new(33, 0, 66, 10);
        let k = 4000.0 / 1000.0 * 0.77;
        let l = left.scale_out(k, k);
        let r = right.scale_out(k, k);
        assert!(l.right >= r.left);
    }

    #[test]
    fn test_matrix_invert_round_trip() {
        let m = Matrix::scale(2.0, 2.0).then(&Matrix::translate(-100.0, 40.0));
        let inv = m.invert().unwrap();
        let p = m.map_point(Point::new(12.0, 34.0));
        let back = inv.map_point(p);
        assert!((back.x - 12.0).abs() < 1e-4);
        assert!((back.y - 34.0).abs() < 1e-4);
    }

    #[test]
    fn test_matrix_quarter_turn_is_exact() {
        let m = Matrix::rotate(90);
        let p = m.map_point(Point::new(1.0, 0.0));
        assert_eq!(p, Point::new(0.0, 1.0));
    }

    #[test]
    fn test_map_rect_bounding_box() {
        let m = Matrix::scale(2.0, 3.0).then(&Matrix::translate(5.0, 5.0));
        let r = m.map_rect(&Rect::new(0, 0, 10, 10).to_rect_f());
        assert_eq!(r, RectF::new(5.0, 5.0, 25.0, 35.0));
    }
}
