//! Planar geometry primitives for extents and clip boundaries.
//!
//! Everything is in drawing units on the XY plane; the host's Z is ignored.
//! Points are `glam::DVec2`.

use std::fmt;

use glam::{DVec2, dvec2};

/// Error type for invalid numeric values
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericError {
    /// Value is NaN
    NaN,
    /// Value is infinite
    Infinite,
    /// Minimum corner lies beyond the maximum corner
    Inverted,
}

impl fmt::Display for NumericError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumericError::NaN => write!(f, "value is NaN"),
            NumericError::Infinite => write!(f, "value is infinite"),
            NumericError::Inverted => write!(f, "minimum corner exceeds maximum corner"),
        }
    }
}

impl std::error::Error for NumericError {}

fn check_point(p: DVec2) -> Result<DVec2, NumericError> {
    if p.is_nan() {
        Err(NumericError::NaN)
    } else if !p.is_finite() {
        Err(NumericError::Infinite)
    } else {
        Ok(p)
    }
}

/// Axis-aligned geometric extents of an object, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extents {
    pub min: DVec2,
    pub max: DVec2,
}

impl Extents {
    /// Create extents without validation (const-friendly).
    pub const fn new(min: DVec2, max: DVec2) -> Self {
        Self { min, max }
    }

    /// Create extents from raw coordinates.
    pub fn from_coords(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self::new(dvec2(x1, y1), dvec2(x2, y2))
    }

    /// Validate host-supplied extents: finite corners, min <= max on both axes.
    pub fn try_new(min: DVec2, max: DVec2) -> Result<Self, NumericError> {
        let min = check_point(min)?;
        let max = check_point(max)?;
        if min.x > max.x || min.y > max.y {
            return Err(NumericError::Inverted);
        }
        Ok(Self { min, max })
    }

    #[inline]
    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    #[inline]
    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    #[inline]
    pub fn center(&self) -> DVec2 {
        (self.min + self.max) * 0.5
    }

    /// Shrink by `ratio` of the width on each x side and `ratio` of the height
    /// on each y side.
    pub fn inset(&self, ratio: f64) -> Extents {
        let margin = dvec2(self.width() * ratio, self.height() * ratio);
        Extents::new(self.min + margin, self.max - margin)
    }

    /// True when either side is shorter than `threshold`.
    pub fn is_degenerate(&self, threshold: f64) -> bool {
        self.width() < threshold || self.height() < threshold
    }
}

/// Rectangle handed to the host as the clip boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipBoundary {
    pub min: DVec2,
    pub max: DVec2,
    /// Whether the boundary came from the fixed-size fallback rather than the extents.
    pub fallback: bool,
}

impl ClipBoundary {
    /// Square of `half_size` on each side of `center`.
    pub fn around(center: DVec2, half_size: f64) -> Self {
        let half = DVec2::splat(half_size);
        Self {
            min: center - half,
            max: center + half,
            fallback: true,
        }
    }

    /// Inset the extents by `ratio`; if the result is thinner than `threshold`
    /// on either axis, fall back to a square around `insertion`.
    pub fn from_extents(
        extents: &Extents,
        ratio: f64,
        threshold: f64,
        insertion: DVec2,
        fallback_half_size: f64,
    ) -> Self {
        let shrunk = extents.inset(ratio);
        if shrunk.is_degenerate(threshold) {
            Self::around(insertion, fallback_half_size)
        } else {
            Self {
                min: shrunk.min,
                max: shrunk.max,
                fallback: false,
            }
        }
    }

    #[inline]
    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    #[inline]
    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }
}

impl fmt::Display for ClipBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.3},{:.3})-({:.3},{:.3})",
            self.min.x, self.min.y, self.max.x, self.max.y
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: DVec2, b: DVec2) -> bool {
        (a - b).abs().max_element() < 1e-9
    }

    #[test]
    fn extents_reject_nan_and_infinity() {
        assert_eq!(
            Extents::try_new(dvec2(f64::NAN, 0.0), dvec2(1.0, 1.0)),
            Err(NumericError::NaN)
        );
        assert_eq!(
            Extents::try_new(dvec2(0.0, 0.0), dvec2(f64::INFINITY, 1.0)),
            Err(NumericError::Infinite)
        );
    }

    #[test]
    fn extents_reject_inverted_corners() {
        assert_eq!(
            Extents::try_new(dvec2(2.0, 0.0), dvec2(1.0, 1.0)),
            Err(NumericError::Inverted)
        );
    }

    #[test]
    fn inset_is_five_percent_per_side() {
        let e = Extents::from_coords(0.0, 0.0, 10.0, 10.0);
        let b = ClipBoundary::from_extents(&e, 0.05, 1e-3, DVec2::ZERO, 5.0);
        assert!(approx(b.min, dvec2(0.5, 0.5)));
        assert!(approx(b.max, dvec2(9.5, 9.5)));
        assert!(!b.fallback);
    }

    #[test]
    fn inset_uses_each_axis_independently() {
        let e = Extents::from_coords(0.0, 0.0, 100.0, 20.0);
        let b = ClipBoundary::from_extents(&e, 0.05, 1e-3, DVec2::ZERO, 5.0);
        assert!(approx(b.min, dvec2(5.0, 1.0)));
        assert!(approx(b.max, dvec2(95.0, 19.0)));
    }

    #[test]
    fn zero_area_falls_back_to_insertion_square() {
        let e = Extents::from_coords(5.0, 5.0, 5.0, 5.0);
        let b = ClipBoundary::from_extents(&e, 0.05, 1e-3, dvec2(3.0, 4.0), 5.0);
        assert!(b.fallback);
        assert!(approx(b.min, dvec2(-2.0, -1.0)));
        assert!(approx(b.max, dvec2(8.0, 9.0)));
    }

    #[test]
    fn thin_sliver_falls_back() {
        // A line-like block: plenty of width, no height.
        let e = Extents::from_coords(0.0, 2.0, 50.0, 2.0005);
        let b = ClipBoundary::from_extents(&e, 0.05, 1e-3, dvec2(25.0, 2.0), 5.0);
        assert!(b.fallback);
        assert_eq!(b.width(), 10.0);
        assert_eq!(b.height(), 10.0);
    }

    #[test]
    fn boundary_display_is_compact() {
        let b = ClipBoundary::around(dvec2(0.0, 0.0), 1.0);
        assert_eq!(b.to_string(), "(-1.000,-1.000)-(1.000,1.000)");
    }
}
