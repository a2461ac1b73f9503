//! Canonical rotation handling.
//!
//! Regions are decoded in the native (pre-rotation) orientation and the decoded
//! buffer is rotated afterwards. Only the four quarter turns are representable, so
//! a decoder can never end up holding an arbitrary angle.

use image::metadata::Orientation;

use crate::geometry::Rect;

/// Clockwise rotation applied to decoded pixels before display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

/// Raised when a rotation angle is not a multiple of 90 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal rotation angle: {0} degrees")]
pub struct InvalidRotation(pub i32);

impl Rotation {
    /// Normalize an angle in degrees. Negative and >360 angles wrap.
    pub fn from_degrees(degrees: i32) -> Result<Self, InvalidRotation> {
        match degrees.rem_euclid(360) {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            _ => Err(InvalidRotation(degrees)),
        }
    }

    /// Map embedded orientation metadata to a canonical rotation.
    ///
    /// Mirrored orientations have no canonical rotation and fall back to `Deg0`.
    pub fn from_orientation(orientation: Orientation) -> Self {
        match orientation {
            Orientation::Rotate90 => Self::Deg90,
            Orientation::Rotate180 => Self::Deg180,
            Orientation::Rotate270 => Self::Deg270,
            _ => Self::Deg0,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Whether width and height trade places under this rotation.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }

    /// Size of the image once this rotation is applied.
    pub fn oriented_size(self, native_width: u32, native_height: u32) -> (u32, u32) {
        if self.swaps_axes() {
            (native_height, native_width)
        } else {
            (native_width, native_height)
        }
    }

    /// Map a rectangle in oriented coordinates back to native coordinates.
    ///
    /// `rect` must already be clamped to the oriented bounds.
    pub fn to_native_rect(self, rect: Rect, native_width: u32, native_height: u32) -> Rect {
        match self {
            Self::Deg0 => rect,
            Self::Deg90 => Rect::from_edges(
                rect.top(),
                native_height.saturating_sub(rect.right()),
                rect.bottom(),
                native_height.saturating_sub(rect.left()),
            ),
            Self::Deg180 => Rect::from_edges(
                native_width.saturating_sub(rect.right()),
                native_height.saturating_sub(rect.bottom()),
                native_width.saturating_sub(rect.left()),
                native_height.saturating_sub(rect.top()),
            ),
            Self::Deg270 => Rect::from_edges(
                native_width.saturating_sub(rect.bottom()),
                rect.left(),
                native_width.saturating_sub(rect.top()),
                rect.right(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_degrees_wraps() {
        assert_eq!(Rotation::from_degrees(-90), Ok(Rotation::Deg270));
        assert_eq!(Rotation::from_degrees(450), Ok(Rotation::Deg90));
        assert_eq!(Rotation::from_degrees(45), Err(InvalidRotation(45)));
    }

    #[test]
    fn test_from_orientation() {
        assert_eq!(
            Rotation::from_orientation(Orientation::Rotate90),
            Rotation::Deg90
        );
        assert_eq!(
            Rotation::from_orientation(Orientation::FlipHorizontal),
            Rotation::Deg0
        );
    }

    #[test]
    fn test_oriented_size_swaps() {
        assert_eq!(Rotation::Deg90.oriented_size(400, 300), (300, 400));
        assert_eq!(Rotation::Deg180.oriented_size(400, 300), (400, 300));
    }

    #[test]
    fn test_native_rect_quarter_turns() {
        // Native image 400x300; oriented (90/270) is 300x400.
        let rect = Rect::new(10, 20, 30, 40);

        let r90 = Rotation::Deg90.to_native_rect(rect, 400, 300);
        assert_eq!(r90, Rect::from_edges(20, 300 - 40, 60, 300 - 10));

        let r270 = Rotation::Deg270.to_native_rect(rect, 400, 300);
        assert_eq!(r270, Rect::from_edges(400 - 60, 10, 400 - 20, 40));

        let r180 = Rotation::Deg180.to_native_rect(rect, 400, 300);
        assert_eq!(r180, Rect::from_edges(400 - 40, 300 - 60, 400 - 10, 300 - 20));
    }

    #[test]
    fn test_native_rect_preserves_area() {
        let rect = Rect::new(5, 7, 11, 13);
        for rotation in [
            Rotation::Deg0,
            Rotation::Deg90,
            Rotation::Deg180,
            Rotation::Deg270,
        ] {
            let native = rotation.to_native_rect(rect, 100, 80);
            assert_eq!(native.width * native.height, rect.width * rect.height);
        }
    }
}
