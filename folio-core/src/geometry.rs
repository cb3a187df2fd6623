//! Page geometry and the document/viewport coordinate mapper.
//!
//! Document space has its origin at the bottom-left corner of the page, is
//! unscaled (1 unit = 1 PDF point) and Y grows upward. Viewport space has its
//! origin at the top-left corner of the rendered page, is multiplied by the
//! current scale and Y grows downward. Device space is viewport space
//! multiplied by the device pixel ratio.

use serde::{Deserialize, Serialize};

use crate::{Quad, TextRun};

/// A 2D affine transform `[a, b, c, d, e, f]`.
pub type Matrix = [f64; 6];

pub const IDENTITY: Matrix = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Axis-aligned rectangle, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Normalised rectangle spanned by two arbitrary corners.
    pub fn from_corners(a: Point, b: Point) -> Self {
        let left = a.x.min(b.x);
        let top = a.y.min(b.y);
        Self {
            left,
            top,
            width: (a.x - b.x).abs(),
            height: (a.y - b.y).abs(),
        }
    }

    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    pub fn center(&self) -> Point {
        Point::new(self.left + self.width / 2.0, self.top + self.height / 2.0)
    }

    /// Strict overlap test; rectangles that only share an edge do not intersect.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.left < other.right()
            && self.right() > other.left
            && self.top < other.bottom()
            && self.bottom() > other.top
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.left
            && point.x <= self.right()
            && point.y >= self.top
            && point.y <= self.bottom()
    }

    pub fn union(&self, other: &Rect) -> Rect {
        let left = self.left.min(other.left);
        let top = self.top.min(other.top);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(left, top, right - left, bottom - top)
    }

    pub fn scaled(&self, factor: f64) -> Rect {
        Rect::new(
            self.left * factor,
            self.top * factor,
            self.width * factor,
            self.height * factor,
        )
    }

    pub fn translated(&self, dx: f64, dy: f64) -> Rect {
        Rect::new(self.left + dx, self.top + dy, self.width, self.height)
    }
}

/// Device pixel ratio to draw with; unusable ratios fall back to 1.
pub fn effective_ratio(device_pixel_ratio: f64) -> f64 {
    if device_pixel_ratio.is_finite() && device_pixel_ratio > 0.0 {
        device_pixel_ratio
    } else {
        1.0
    }
}

/// A page laid out at a given scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub scale: f64,
    pub width: f64,
    pub height: f64,
    /// Document-to-viewport transform, flip included.
    pub transform: Matrix,
}

impl Viewport {
    pub fn new(natural: Size, scale: f64) -> Self {
        let width = natural.width * scale;
        let height = natural.height * scale;
        Self {
            scale,
            width,
            height,
            transform: [scale, 0.0, 0.0, -scale, 0.0, height],
        }
    }

    pub fn natural_size(&self) -> Size {
        Size::new(self.width / self.scale, self.height / self.scale)
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0.0, 0.0, self.width, self.height)
    }

    pub fn to_viewport(&self, doc_x: f64, doc_y: f64) -> (f64, f64) {
        let x = doc_x * self.scale;
        let y_from_bottom = doc_y * self.scale;
        (x, self.height - y_from_bottom)
    }

    pub fn to_document(&self, screen_x: f64, screen_y: f64) -> (f64, f64) {
        let y_from_bottom = self.height - screen_y;
        (screen_x / self.scale, y_from_bottom / self.scale)
    }

    pub fn point_to_viewport(&self, point: Point) -> Point {
        let (x, y) = self.to_viewport(point.x, point.y);
        Point::new(x, y)
    }

    pub fn point_to_document(&self, point: Point) -> Point {
        let (x, y) = self.to_document(point.x, point.y);
        Point::new(x, y)
    }

    pub fn to_device(&self, screen_x: f64, screen_y: f64, device_pixel_ratio: f64) -> (f64, f64) {
        let ratio = effective_ratio(device_pixel_ratio);
        (screen_x * ratio, screen_y * ratio)
    }

    /// Backing-store size of a surface showing this viewport.
    pub fn device_size(&self, device_pixel_ratio: f64) -> (u32, u32) {
        let ratio = effective_ratio(device_pixel_ratio);
        (
            (self.width * ratio).ceil().max(1.0) as u32,
            (self.height * ratio).ceil().max(1.0) as u32,
        )
    }

    /// Viewport rectangle covered by a text run.
    ///
    /// The run transform's translation is the left end of the baseline in
    /// document space; the box extends `height` above it.
    pub fn project_run(&self, run: &TextRun) -> Rect {
        let [_, _, _, _, e, f] = run.transform;
        let (left, baseline) = self.to_viewport(e, f);
        let width = run.width * self.scale;
        let height = run.height * self.scale;
        Rect::new(left, baseline - height, width, height)
    }

    /// Drops the scale from a viewport rectangle.
    pub fn unscale(&self, rect: &Rect) -> Quad {
        Quad {
            x: rect.left / self.scale,
            y: rect.top / self.scale,
            w: rect.width / self.scale,
            h: rect.height / self.scale,
        }
    }
}
