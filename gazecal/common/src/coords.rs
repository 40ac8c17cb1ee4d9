use glam::Vec2;

/// Maps between the tracker's Active Display Coordinate System (origin
/// top-left, both axes in [0, 1], y down) and window units (origin center,
/// y up). The half-extent supplies the window's aspect-ratio scaling:
/// `(1, 1)` yields the normalized [-1, 1] space, `(960, 540)` yields pixels
/// on a 1920x1080 window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayMap {
    half_extent: Vec2,
}

impl DisplayMap {
    pub fn new(half_extent: Vec2) -> Self {
        Self { half_extent }
    }

    /// Normalized [-1, 1] window space.
    pub fn normalized() -> Self {
        Self::new(Vec2::ONE)
    }

    /// Out-of-range input passes through unclamped; validity is a sampling
    /// concern, not a transform concern.
    pub fn adcs_to_window(&self, p: Vec2) -> Vec2 {
        Vec2::new(
            (p.x * 2.0 - 1.0) * self.half_extent.x,
            (1.0 - p.y * 2.0) * self.half_extent.y,
        )
    }

    pub fn window_to_adcs(&self, p: Vec2) -> Vec2 {
        Vec2::new(
            (p.x / self.half_extent.x + 1.0) * 0.5,
            (1.0 - p.y / self.half_extent.y) * 0.5,
        )
    }
}

impl Default for DisplayMap {
    fn default() -> Self {
        Self::normalized()
    }
}
