//! Viewport math: aspect-preserving image fit, pan, and zoom.
//!
//! The scene engine is render-backend-agnostic; this module only does
//! the coordinate bookkeeping a backend needs — where the image sits in
//! the viewport and how screen points map to image pixels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::Point;

/// Zoom clamp range, as a multiple of the initial fit scale.
const ZOOM_MIN: f32 = 0.1;
const ZOOM_MAX: f32 = 50.0;

/// The background image a scene is anchored to.
///
/// Decoding is the rendering backend's job; the engine only needs the
/// identity and pixel dimensions. `validate` is the decode boundary:
/// a backend that failed to produce sane dimensions fails here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaseImage {
    pub id: Uuid,
    pub width: f32,
    pub height: f32,
}

impl BaseImage {
    pub fn new(id: Uuid, width: f32, height: f32) -> Self {
        Self { id, width, height }
    }

    /// Reject images the backend could not decode into usable dimensions.
    pub fn validate(&self) -> Result<(), RenderError> {
        if !self.width.is_finite() || !self.height.is_finite() || self.width <= 0.0 || self.height <= 0.0 {
            return Err(RenderError::InvalidImage {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

/// Viewport dimensions in screen pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    pub fn is_ready(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

/// Image placement within the viewport.
///
/// Tracks the current scale and top-left offset of the image in screen
/// space. Created by [`ViewTransform::fit`], then mutated by pan/zoom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewTransform {
    pub scale: f32,
    pub offset_x: f32,
    pub offset_y: f32,
    /// The scale chosen by the initial fit; zoom clamps are relative to it.
    fit_scale: f32,
    viewport: Viewport,
}

impl ViewTransform {
    /// Fit an image into a viewport: `scale = min(vw/iw, vh/ih)`,
    /// centered both ways.
    pub fn fit(image: &BaseImage, viewport: Viewport) -> Result<Self, RenderError> {
        image.validate()?;
        if !viewport.is_ready() {
            return Err(RenderError::ViewportNotReady);
        }
        let scale = (viewport.width / image.width).min(viewport.height / image.height);
        let offset_x = (viewport.width - image.width * scale) / 2.0;
        let offset_y = (viewport.height - image.height * scale) / 2.0;
        Ok(Self {
            scale,
            offset_x,
            offset_y,
            fit_scale: scale,
            viewport,
        })
    }

    /// Convert a screen point to image-pixel coordinates.
    pub fn screen_to_image(&self, screen: Point) -> Point {
        Point::new(
            (screen.x - self.offset_x) / self.scale,
            (screen.y - self.offset_y) / self.scale,
        )
    }

    /// Convert an image-pixel point to screen coordinates.
    pub fn image_to_screen(&self, image: Point) -> Point {
        Point::new(
            image.x * self.scale + self.offset_x,
            image.y * self.scale + self.offset_y,
        )
    }

    /// Pan by a screen-space delta.
    pub fn pan(&mut self, dx: f32, dy: f32) {
        self.offset_x += dx;
        self.offset_y += dy;
    }

    /// Zoom toward/away from a screen point, keeping the image point
    /// under the cursor fixed.
    pub fn zoom_at(&mut self, screen: Point, factor: f32) {
        let anchor = self.screen_to_image(screen);

        let min = self.fit_scale * ZOOM_MIN;
        let max = self.fit_scale * ZOOM_MAX;
        self.scale = (self.scale * factor).clamp(min, max);

        self.offset_x = screen.x - anchor.x * self.scale;
        self.offset_y = screen.y - anchor.y * self.scale;
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }
}

/// Failures while setting up the scene view.
///
/// These are fatal to initialization and surfaced to the user with a
/// retry affordance; the engine never retries on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderError {
    /// The image could not be decoded into usable pixel dimensions.
    InvalidImage { width: f32, height: f32 },
    /// The viewport has no area yet.
    ViewportNotReady,
    /// The engine was disposed.
    Disposed,
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::InvalidImage { width, height } => {
                write!(f, "Image has unusable dimensions {width}x{height}")
            }
            RenderError::ViewportNotReady => write!(f, "Viewport is not ready"),
            RenderError::Disposed => write!(f, "Scene engine was disposed"),
        }
    }
}

impl std::error::Error for RenderError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(w: f32, h: f32) -> BaseImage {
        BaseImage::new(Uuid::new_v4(), w, h)
    }

    #[test]
    fn test_fit_landscape_image() {
        // 2000x1000 image into 800x600: scale = min(0.4, 0.6) = 0.4.
        let t = ViewTransform::fit(&image(2000.0, 1000.0), Viewport::new(800.0, 600.0)).unwrap();
        assert!((t.scale - 0.4).abs() < f32::EPSILON);
        // Image becomes 800x400, centered vertically.
        assert!((t.offset_x - 0.0).abs() < f32::EPSILON);
        assert!((t.offset_y - 100.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_fit_portrait_image() {
        let t = ViewTransform::fit(&image(500.0, 1000.0), Viewport::new(800.0, 600.0)).unwrap();
        assert!((t.scale - 0.6).abs() < f32::EPSILON);
        // Image becomes 300x600, centered horizontally.
        assert!((t.offset_x - 250.0).abs() < f32::EPSILON);
        assert!((t.offset_y - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_invalid_image_rejected() {
        assert!(matches!(
            ViewTransform::fit(&image(0.0, 100.0), Viewport::new(800.0, 600.0)),
            Err(RenderError::InvalidImage { .. })
        ));
        assert!(matches!(
            ViewTransform::fit(&image(f32::NAN, 100.0), Viewport::new(800.0, 600.0)),
            Err(RenderError::InvalidImage { .. })
        ));
    }

    #[test]
    fn test_unready_viewport_rejected() {
        assert_eq!(
            ViewTransform::fit(&image(100.0, 100.0), Viewport::new(0.0, 600.0)),
            Err(RenderError::ViewportNotReady)
        );
    }

    #[test]
    fn test_screen_image_roundtrip() {
        let t = ViewTransform::fit(&image(2000.0, 1000.0), Viewport::new(800.0, 600.0)).unwrap();
        let screen = Point::new(400.0, 300.0);
        let img = t.screen_to_image(screen);
        let back = t.image_to_screen(img);
        assert!((back.x - screen.x).abs() < 1e-3);
        assert!((back.y - screen.y).abs() < 1e-3);
    }

    #[test]
    fn test_zoom_keeps_anchor_fixed() {
        let mut t = ViewTransform::fit(&image(1000.0, 1000.0), Viewport::new(600.0, 600.0)).unwrap();
        let cursor = Point::new(200.0, 150.0);
        let before = t.screen_to_image(cursor);
        t.zoom_at(cursor, 1.5);
        let after = t.screen_to_image(cursor);
        assert!((before.x - after.x).abs() < 1e-3);
        assert!((before.y - after.y).abs() < 1e-3);
    }

    #[test]
    fn test_zoom_clamped() {
        let mut t = ViewTransform::fit(&image(1000.0, 1000.0), Viewport::new(600.0, 600.0)).unwrap();
        let fit = t.scale;
        for _ in 0..200 {
            t.zoom_at(Point::new(300.0, 300.0), 2.0);
        }
        assert!(t.scale <= fit * ZOOM_MAX + f32::EPSILON);
        for _ in 0..400 {
            t.zoom_at(Point::new(300.0, 300.0), 0.5);
        }
        assert!(t.scale >= fit * ZOOM_MIN - f32::EPSILON);
    }

    #[test]
    fn test_pan_moves_offset() {
        let mut t = ViewTransform::fit(&image(1000.0, 1000.0), Viewport::new(600.0, 600.0)).unwrap();
        let ox = t.offset_x;
        t.pan(25.0, -10.0);
        assert!((t.offset_x - (ox + 25.0)).abs() < f32::EPSILON);
    }
}
