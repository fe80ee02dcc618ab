//! Region-of-interest requests and the sensor's addressing granularity.
//!
//! Requests arrive as spans in sensor coordinates (typically the zoomed axis
//! range of a viewer). Offsets snap down to an even pixel, the span end snaps
//! up to an even pixel, and the resulting size is widened to a multiple of 4
//! with a minimum of 4.

use std::fmt;

use crate::capture::driver::{Region, SensorGeometry};
use crate::error::AcquisitionError;

const OFFSET_STEP: f64 = 2.0;
const SIZE_STEP: u32 = 4;
const MIN_SIZE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Span {
    pub lower: f64,
    pub upper: f64,
}

/// Pending width/height/offset change
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionRequest {
    pub x: Span,
    pub y: Span,
}

impl RegionRequest {
    pub fn from_span(x: (f64, f64), y: (f64, f64)) -> Self {
        Self {
            x: Span { lower: x.0, upper: x.1 },
            y: Span { lower: y.0, upper: y.1 },
        }
    }

    pub fn from_rect(offset_x: u32, offset_y: u32, width: u32, height: u32) -> Self {
        let span = |offset: u32, size: u32| Span {
            lower: f64::from(offset),
            upper: f64::from(offset) + f64::from(size),
        };
        Self {
            x: span(offset_x, width),
            y: span(offset_y, height),
        }
    }

    /// Snap the request to the sensor grid, rejecting anything outside it.
    pub fn align(&self, geometry: SensorGeometry) -> Result<Region, AcquisitionError> {
        let invalid = || AcquisitionError::InvalidRegion(self.to_string());

        let (offset_x, width) = align_axis(self.x, geometry.max_width).ok_or_else(invalid)?;
        let (offset_y, height) = align_axis(self.y, geometry.max_height).ok_or_else(invalid)?;

        Ok(Region {
            offset_x,
            offset_y,
            width,
            height,
        })
    }
}

impl fmt::Display for RegionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x [{}, {}] y [{}, {}]",
            self.x.lower, self.x.upper, self.y.lower, self.y.upper
        )
    }
}

/// Returns `(offset, size)` or `None` when the span leaves the sensor.
fn align_axis(span: Span, max: u32) -> Option<(u32, u32)> {
    let max_f = f64::from(max);
    if !(span.lower > 0.0 && span.upper < max_f && span.lower <= span.upper) {
        return None;
    }

    let offset = (OFFSET_STEP * (span.lower / OFFSET_STEP).floor()) as u32;
    let mut end = (OFFSET_STEP * (span.upper / OFFSET_STEP).ceil()) as u32;
    if (end - offset) % SIZE_STEP != 0 {
        end += 2;
    }
    let size = match end - offset {
        size if size > 2 => size,
        _ => MIN_SIZE,
    };

    (offset + size <= max).then_some((offset, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENSOR: SensorGeometry = SensorGeometry {
        max_width: 1936,
        max_height: 1216,
    };

    #[test]
    fn test_width_601_offset_7() {
        let region = RegionRequest::from_rect(7, 7, 601, 100).align(SENSOR).unwrap();
        assert_eq!(region.offset_x, 6);
        // end 608 is even, span 602 widens to 604
        assert_eq!(region.width, 604);
        assert_eq!(region.width % 4, 0);
        assert_eq!(region.height, 104);
    }

    #[test]
    fn test_lower_bound_zero_is_rejected() {
        let err = RegionRequest::from_rect(0, 10, 100, 100).align(SENSOR).unwrap_err();
        assert!(matches!(err, AcquisitionError::InvalidRegion(_)));
    }

    #[test]
    fn test_small_offsets_snap_even() {
        assert_eq!(align_axis(Span { lower: 2.0, upper: 10.0 }, 100), Some((2, 8)));
        assert_eq!(align_axis(Span { lower: 3.0, upper: 10.0 }, 100), Some((2, 8)));
    }

    #[test]
    fn test_tiny_spans_use_minimum_size() {
        assert_eq!(align_axis(Span { lower: 2.0, upper: 2.0 }, 100), Some((2, 4)));
        assert_eq!(align_axis(Span { lower: 3.0, upper: 3.0 }, 100), Some((2, 4)));
        assert_eq!(align_axis(Span { lower: 2.0, upper: 3.0 }, 100), Some((2, 4)));
    }

    #[test]
    fn test_upper_bound_at_sensor_max_is_rejected() {
        assert_eq!(align_axis(Span { lower: 10.0, upper: 100.0 }, 100), None);
        assert_eq!(align_axis(Span { lower: 10.0, upper: 99.0 }, 100), None);
        assert_eq!(align_axis(Span { lower: 10.0, upper: 97.0 }, 100), Some((10, 88)));
    }

    #[test]
    fn test_fractional_spans() {
        // zoomed axis ranges are not integral
        assert_eq!(align_axis(Span { lower: 5.5, upper: 20.2 }, 100), Some((4, 20)));
    }

    #[test]
    fn test_alignment_is_idempotent() {
        let first = RegionRequest::from_rect(7, 9, 601, 301).align(SENSOR).unwrap();
        let again = RegionRequest::from_rect(
            first.offset_x,
            first.offset_y,
            first.width,
            first.height,
        )
        .align(SENSOR)
        .unwrap();
        assert_eq!(first, again);
    }
}
