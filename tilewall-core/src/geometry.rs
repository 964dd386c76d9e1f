//! Rectangle arithmetic shared by the streamer, the downloader and the
//! bridge.
//!
//! Two coordinate spaces exist:
//! - **image space**: pixels of the producer's frame, origin top-left;
//! - **wall space**: pixels of the whole tiled display, origin top-left.
//!
//! A [`WindowLayout`] places an image on the wall, and
//! [`WindowLayout::image_region`] maps a visible wall rectangle back to
//! the image region it shows.

use serde::{Deserialize, Serialize};

// ── Rect ─────────────────────────────────────────────────────────

/// Axis-aligned rectangle. `x`/`y` may be negative (windows can hang
/// off the wall edge); empty rectangles have zero width or height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Overlap of two rectangles, `None` when they do not intersect.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let left = (self.x as i64).max(other.x as i64);
        let top = (self.y as i64).max(other.y as i64);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return None;
        }
        Some(Rect {
            x: left as i32,
            y: top as i32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        })
    }

    /// Whether `other` lies completely inside `self`.
    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Grow the rectangle outwards to multiples of the block grid.
    pub fn align_to(&self, block_w: u32, block_h: u32) -> Rect {
        let bw = block_w.max(1) as i64;
        let bh = block_h.max(1) as i64;
        let left = (self.x as i64).div_euclid(bw) * bw;
        let top = (self.y as i64).div_euclid(bh) * bh;
        let right = (self.right() + bw - 1).div_euclid(bw) * bw;
        let bottom = (self.bottom() + bh - 1).div_euclid(bh) * bh;
        Rect {
            x: left as i32,
            y: top as i32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        }
    }
}

// ── Rotation ─────────────────────────────────────────────────────

/// Clockwise rotation of an image on the wall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Portrait rotations swap image width and height on the wall.
    pub fn is_portrait(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

impl TryFrom<u32> for Rotation {
    type Error = crate::error::WallError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Rotation::Deg0),
            1 | 90 => Ok(Rotation::Deg90),
            2 | 180 => Ok(Rotation::Deg180),
            3 | 270 => Ok(Rotation::Deg270),
            _ => Err(crate::error::WallError::UnknownVariant {
                type_name: "Rotation",
                value: value as u64,
            }),
        }
    }
}

// ── WindowLayout ─────────────────────────────────────────────────

/// Where an application's image appears on the wall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WindowLayout {
    /// Window bounds in wall space.
    pub bounds: Rect,
    /// Image orientation inside the window.
    pub rotation: Rotation,
}

impl WindowLayout {
    pub fn new(bounds: Rect, rotation: Rotation) -> Self {
        Self { bounds, rotation }
    }

    pub fn is_hidden(&self) -> bool {
        self.bounds.is_empty()
    }

    /// Map the part of `tile` covered by this window back to the image
    /// region (in image space, clamped to the image) that it displays.
    ///
    /// Returns `None` when the window does not touch the tile.
    pub fn image_region(&self, tile: &Rect, image_w: u32, image_h: u32) -> Option<Rect> {
        if self.is_hidden() || image_w == 0 || image_h == 0 {
            return None;
        }
        let visible = tile.intersect(&self.bounds)?;
        let win = &self.bounds;

        // Fractions of the window covered by the visible part.
        let u0 = (visible.x as f64 - win.x as f64) / win.width as f64;
        let u1 = (visible.right() as f64 - win.x as f64) / win.width as f64;
        let v0 = (visible.y as f64 - win.y as f64) / win.height as f64;
        let v1 = (visible.bottom() as f64 - win.y as f64) / win.height as f64;

        let (fx0, fx1, fy0, fy1) = match self.rotation {
            Rotation::Deg0 => (u0, u1, v0, v1),
            Rotation::Deg90 => (v0, v1, 1.0 - u1, 1.0 - u0),
            Rotation::Deg180 => (1.0 - u1, 1.0 - u0, 1.0 - v1, 1.0 - v0),
            Rotation::Deg270 => (1.0 - v1, 1.0 - v0, u0, u1),
        };

        let w = image_w as f64;
        let h = image_h as f64;
        let x0 = (fx0 * w).floor().clamp(0.0, w) as u32;
        let x1 = (fx1 * w).ceil().clamp(0.0, w) as u32;
        let y0 = (fy0 * h).floor().clamp(0.0, h) as u32;
        let y1 = (fy1 * h).ceil().clamp(0.0, h) as u32;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect::new(x0 as i32, y0 as i32, x1 - x0, y1 - y0))
    }
}

// ── Tests ────────────────────────────────────────────────────────
