//! Bounding boxes and the box text codec.
//!
//! Annotation sources and the detector write the same region in different
//! textual encodings. Everything is normalized to the canonical tuple form
//! `(x1, y1, x2, y2)`, which doubles as the component identity key.
//!
//! ## Accepted Encodings
//!
//! | Encoding | Example |
//! |----------|---------|
//! | list     | `[10, 20, 110, 220]` |
//! | tuple    | `(10,20,110,220)` |
//! | tagged   | `<\|box_start\|>(10,20),(110,220)<\|box_end\|>` |
//!
//! Coordinates are non-negative integers. Corners must be ordered
//! (`x1 <= x2`, `y1 <= y2`); zero-area boxes parse but are reported by
//! [`BoundingBox::is_degenerate`].

#![allow(clippy::cast_precision_loss)]

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::BoxParseError;

const BOX_START: &str = "<|box_start|>";
const BOX_END: &str = "<|box_end|>";

/// Axis-aligned box in image pixel coordinates (origin top-left).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    /// Build a box, checking corner order.
    ///
    /// # Errors
    ///
    /// Returns [`BoxParseError::Unordered`] if `x1 > x2` or `y1 > y2`.
    pub const fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Result<Self, BoxParseError> {
        if x1 > x2 || y1 > y2 {
            return Err(BoxParseError::Unordered { x1, y1, x2, y2 });
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    #[inline]
    #[must_use = "returns box width"]
    pub const fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    #[inline]
    #[must_use = "returns box height"]
    pub const fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    /// Area in square pixels.
    #[inline]
    #[must_use = "returns bounding box area"]
    pub fn area(&self) -> f64 {
        f64::from(self.width()) * f64::from(self.height())
    }

    /// True when the box has zero area.
    #[inline]
    #[must_use = "returns whether the box has zero area"]
    pub const fn is_degenerate(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Intersection over union with another box.
    ///
    /// Touching edges do not count as overlap. Returns 0.0 when the union is
    /// empty (two degenerate boxes).
    #[must_use = "computes intersection over union"]
    pub fn iou(&self, other: &Self) -> f64 {
        let left = self.x1.max(other.x1);
        let top = self.y1.max(other.y1);
        let right = self.x2.min(other.x2);
        let bottom = self.y2.min(other.y2);

        if right <= left || bottom <= top {
            return 0.0;
        }

        let intersection = f64::from(right - left) * f64::from(bottom - top);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Canonical key string, `(x1, y1, x2, y2)`.
    #[inline]
    #[must_use = "returns the canonical key"]
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Region tag understood by region-scoped annotation requests.
    #[must_use = "returns the tagged region string"]
    pub fn to_tagged(&self) -> String {
        format!(
            "{BOX_START}({},{}),({},{}){BOX_END}",
            self.x1, self.y1, self.x2, self.y2
        )
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x1, self.y1, self.x2, self.y2)
    }
}

impl FromStr for BoundingBox {
    type Err = BoxParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_box(s)
    }
}

/// Parse any accepted box encoding.
///
/// # Errors
///
/// Returns a [`BoxParseError`] for unrecognized encodings, wrong coordinate
/// counts, non-integer coordinates and inverted corners.
pub fn parse_box(text: &str) -> Result<BoundingBox, BoxParseError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(BoxParseError::Empty);
    }

    let coords = if let Some(inner) = text
        .strip_prefix(BOX_START)
        .and_then(|rest| rest.strip_suffix(BOX_END))
    {
        parse_corner_pairs(inner, text)?
    } else if let Some(inner) = text.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        parse_coordinate_list(inner, text)?
    } else if let Some(inner) = text.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        parse_coordinate_list(inner, text)?
    } else {
        return Err(BoxParseError::UnknownEncoding(text.to_string()));
    };

    BoundingBox::new(coords[0], coords[1], coords[2], coords[3])
}

/// Parse box text and return its canonical key.
///
/// # Errors
///
/// Same as [`parse_box`].
pub fn canonicalize(text: &str) -> Result<String, BoxParseError> {
    parse_box(text).map(|b| b.key())
}

fn parse_coordinate_list(inner: &str, original: &str) -> Result<[u32; 4], BoxParseError> {
    let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        return Err(BoxParseError::WrongArity {
            text: original.to_string(),
            found: parts.iter().filter(|p| !p.is_empty()).count(),
        });
    }
    let mut coords = [0u32; 4];
    for (slot, part) in coords.iter_mut().zip(&parts) {
        *slot = parse_coordinate(part)?;
    }
    Ok(coords)
}

/// `(x1,y1),(x2,y2)`
fn parse_corner_pairs(inner: &str, original: &str) -> Result<[u32; 4], BoxParseError> {
    let inner = inner.trim();
    let unknown = || BoxParseError::UnknownEncoding(original.to_string());

    let first = inner.strip_prefix('(').ok_or_else(unknown)?;
    let (first, rest) = first.split_once(')').ok_or_else(unknown)?;
    let rest = rest.trim_start().strip_prefix(',').ok_or_else(unknown)?;
    let second = rest
        .trim_start()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(unknown)?;

    let mut parts: Vec<&str> = first.split(',').map(str::trim).collect();
    parts.extend(second.split(',').map(str::trim));
    if parts.len() != 4 {
        return Err(BoxParseError::WrongArity {
            text: original.to_string(),
            found: parts.len(),
        });
    }
    let mut coords = [0u32; 4];
    for (slot, part) in coords.iter_mut().zip(&parts) {
        *slot = parse_coordinate(part)?;
    }
    Ok(coords)
}

fn parse_coordinate(part: &str) -> Result<u32, BoxParseError> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BoxParseError::BadCoordinate(part.to_string()));
    }
    part.parse::<u32>()
        .map_err(|_| BoxParseError::BadCoordinate(part.to_string()))
}

impl Serialize for BoundingBox {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BoundingBox {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Array([u32; 4]),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => parse_box(&text).map_err(serde::de::Error::custom),
            Repr::Array([x1, y1, x2, y2]) => {
                BoundingBox::new(x1, y1, x2, y2).map_err(serde::de::Error::custom)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bx(x1: u32, y1: u32, x2: u32, y2: u32) -> BoundingBox {
        BoundingBox::new(x1, y1, x2, y2).unwrap()
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_iou_identity_and_disjoint() {
        let a = bx(10, 10, 50, 60);
        assert_eq!(a.iou(&a), 1.0);

        let b = bx(100, 100, 120, 140);
        assert_eq!(a.iou(&b), 0.0);
        assert_eq!(b.iou(&a), 0.0);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_iou_touching_edges_is_zero() {
        let a = bx(0, 0, 10, 10);
        let b = bx(10, 0, 20, 10);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = bx(0, 0, 10, 10);
        let b = bx(5, 0, 15, 10);
        // 50 / (100 + 100 - 50)
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_iou_degenerate_boxes() {
        let a = bx(5, 5, 5, 5);
        assert!(a.is_degenerate());
        assert_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn test_parse_all_encodings_to_same_key() {
        let expected = "(12, 34, 56, 78)";
        assert_eq!(canonicalize("[12, 34, 56, 78]").unwrap(), expected);
        assert_eq!(canonicalize("(12,34,56,78)").unwrap(), expected);
        assert_eq!(canonicalize("(12, 34, 56, 78)").unwrap(), expected);
        assert_eq!(
            canonicalize("<|box_start|>(12,34),(56,78)<|box_end|>").unwrap(),
            expected
        );
        assert_eq!(
            canonicalize("  <|box_start|>( 12 , 34 ), (56,78)<|box_end|> ").unwrap(),
            expected
        );
    }

    #[test]
    fn test_parse_rejects_malformed_text() {
        assert_eq!(parse_box(""), Err(BoxParseError::Empty));
        assert!(matches!(
            parse_box("12 34 56 78"),
            Err(BoxParseError::UnknownEncoding(_))
        ));
        assert!(matches!(
            parse_box("[1, 2, 3]"),
            Err(BoxParseError::WrongArity { found: 3, .. })
        ));
        assert!(matches!(
            parse_box("[1, 2, 3, x]"),
            Err(BoxParseError::BadCoordinate(_))
        ));
        assert!(matches!(
            parse_box("[1.5, 2, 3, 4]"),
            Err(BoxParseError::BadCoordinate(_))
        ));
        assert!(matches!(
            parse_box("[-1, 2, 3, 4]"),
            Err(BoxParseError::BadCoordinate(_))
        ));
        assert!(matches!(
            parse_box("<|box_start|>(1,2)<|box_end|>"),
            Err(BoxParseError::UnknownEncoding(_))
        ));
        assert!(matches!(
            parse_box("__import__('os')"),
            Err(BoxParseError::UnknownEncoding(_))
        ));
    }

    #[test]
    fn test_parse_rejects_inverted_corners() {
        assert!(matches!(
            parse_box("(50, 10, 20, 40)"),
            Err(BoxParseError::Unordered { .. })
        ));
    }

    #[test]
    fn test_tagged_output_parses_back() {
        let b = bx(1, 2, 3, 4);
        assert_eq!(parse_box(&b.to_tagged()).unwrap(), b);
    }

    #[test]
    fn test_serde_accepts_string_and_array() {
        let from_str: BoundingBox = serde_json::from_str("\"[1, 2, 3, 4]\"").unwrap();
        let from_arr: BoundingBox = serde_json::from_str("[1, 2, 3, 4]").unwrap();
        assert_eq!(from_str, from_arr);
        assert_eq!(
            serde_json::to_string(&from_arr).unwrap(),
            "\"(1, 2, 3, 4)\""
        );
    }
}
