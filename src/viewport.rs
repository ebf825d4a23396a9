//! The viewport collaborator: what part of the image is on screen, and how.
//!
//! Coordinates follow one convention throughout the engine. The *drawable* is
//! the image fitted into the view before any zoom or pan; `visible_rect` is in
//! drawable space, and the draw matrix maps drawable space to view space.

use crate::geometry::{Matrix, Point, Rect, Size};

/// State supplied by the host's zoom/pan engine.
pub trait Viewport {
    /// Visible part of the drawable, in drawable coordinates.
    fn visible_rect(&self) -> Rect;

    /// Drawable-to-view transform.
    fn draw_matrix(&self) -> Matrix;

    fn drawable_size(&self) -> Size;

    fn view_size(&self) -> Size;

    /// View pixels per drawable pixel.
    fn zoom_scale(&self) -> f32;

    /// True while a zoom gesture or animation is running.
    fn is_zooming(&self) -> bool {
        false
    }

    fn rotation_degrees(&self) -> i32 {
        0
    }
}

/// Viewport state captured for one change event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportSnapshot {
    pub visible_rect: Rect,
    pub drawable_size: Size,
    pub view_size: Size,
    pub matrix: Matrix,
    pub zoom_scale: f32,
    pub last_zoom_scale: f32,
    pub is_zooming: bool,
    pub rotation_degrees: i32,
}

impl ViewportSnapshot {
    pub fn capture(viewport: &dyn Viewport, last_zoom_scale: f32) -> Self {
        Self {
            visible_rect: viewport.visible_rect(),
            drawable_size: viewport.drawable_size(),
            view_size: viewport.view_size(),
            matrix: viewport.draw_matrix(),
            zoom_scale: viewport.zoom_scale(),
            last_zoom_scale,
            is_zooming: viewport.is_zooming(),
            rotation_degrees: viewport.rotation_degrees(),
        }
    }

    /// Nothing to display.
    pub fn has_empty_input(&self) -> bool {
        self.visible_rect.is_empty()
            || self.drawable_size.is_empty()
            || self.view_size.is_empty()
            || !(self.zoom_scale > 0.0)
    }

    /// The whole drawable is visible, so a single conventional decode suffices.
    pub fn is_fully_zoomed_out(&self) -> bool {
        self.visible_rect.contains(&self.drawable_size.to_rect())
    }

    pub fn has_valid_rotation(&self) -> bool {
        self.rotation_degrees % 90 == 0
    }

    /// Same tiling inputs; the matrix translation may differ.
    pub fn same_geometry(&self, other: &ViewportSnapshot) -> bool {
        self.visible_rect == other.visible_rect
            && self.drawable_size == other.drawable_size
            && self.view_size == other.view_size
            && self.zoom_scale == other.zoom_scale
    }
}

/// A fixed viewport described by plain data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StaticViewport {
    pub view_size: Size,
    pub drawable_size: Size,
    pub visible_rect: Rect,
    pub zoom_scale: f32,
    pub is_zooming: bool,
    pub rotation_degrees: i32,
}

impl StaticViewport {
    /// Fit `image` inside `view`, centred, fully zoomed out.
    pub fn fit(image: Size, view: Size) -> Self {
        let drawable = if image.is_empty() || view.is_empty() {
            Size::default()
        } else {
            let scale = (view.width as f64 / image.width as f64)
                .min(view.height as f64 / image.height as f64);
            Size::new(
                ((image.width as f64 * scale).round() as u32).clamp(1, view.width),
                ((image.height as f64 * scale).round() as u32).clamp(1, view.height),
            )
        };
        Self {
            view_size: view,
            drawable_size: drawable,
            visible_rect: drawable.to_rect(),
            zoom_scale: 1.0,
            is_zooming: false,
            rotation_degrees: 0,
        }
    }

    /// Zoom to `scale` around `focus`, given as a fraction of the drawable
    /// (`0.5, 0.5` is the centre). The visible rect is kept inside the drawable.
    pub fn zoomed(self, scale: f32, focus: Point) -> Self {
        let zoom = scale.max(1.0);
        let d = self.drawable_size;
        let vis_w = ((self.view_size.width as f32 / zoom).ceil() as u32).min(d.width);
        let vis_h = ((self.view_size.height as f32 / zoom).ceil() as u32).min(d.height);

        let center_x = focus.x.clamp(0.0, 1.0) * d.width as f32;
        let center_y = focus.y.clamp(0.0, 1.0) * d.height as f32;
        let max_left = d.width.saturating_sub(vis_w) as f32;
        let max_top = d.height.saturating_sub(vis_h) as f32;
        let left = (center_x - vis_w as f32 / 2.0).clamp(0.0, max_left).round() as i32;
        let top = (center_y - vis_h as f32 / 2.0).clamp(0.0, max_top).round() as i32;

        Self {
            visible_rect: Rect::from_xywh(left, top, vis_w, vis_h),
            zoom_scale: zoom,
            ..self
        }
    }

    /// Offset that centres the visible content when it is smaller than the view.
    fn padding(&self) -> Point {
        let content_w = self.visible_rect.width() as f32 * self.zoom_scale;
        let content_h = self.visible_rect.height() as f32 * self.zoom_scale;
        Point::new(
            ((self.view_size.width as f32 - content_w) / 2.0).max(0.0),
            ((self.view_size.height as f32 - content_h) / 2.0).max(0.0),
        )
    }
}

impl Viewport for StaticViewport {
    fn visible_rect(&self) -> Rect {
        self.visible_rect
    }

    fn draw_matrix(&self) -> Matrix {
        let pad = self.padding();
        Matrix::translate(-self.visible_rect.left as f32, -self.visible_rect.top as f32)
            .then(&Matrix::scale(self.zoom_scale, self.zoom_scale))
            .then(&Matrix::translate(pad.x, pad.y))
    }

    fn drawable_size(&self) -> Size {
        self.drawable_size
    }

    fn view_size(&self) -> Size {
        self.view_size
    }

    fn zoom_scale(&self) -> f32 {
        self.zoom_scale
    }

    fn is_zooming(&self) -> bool {
        self.is_zooming
    }

    fn rotation_degrees(&self) -> i32 {
        self.rotation_degrees
    }
}
