//! Regions of interest, dirty regions and block tiling.
//!
//! A [`Roi`] is an axis-aligned box given by `start` (inclusive) and `stop`
//! (exclusive) coordinates. It is both the unit of data requests and the unit
//! of dirty notifications.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Axis-aligned region with non-negative integer bounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Roi {
    start: Vec<usize>,
    stop: Vec<usize>,
}

impl Roi {
    /// Creates a region from `start`/`stop` tuples.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRoi`] if the tuples differ in length or any
    /// `stop` coordinate precedes its `start`.
    pub fn new(start: Vec<usize>, stop: Vec<usize>) -> Result<Self> {
        if start.len() != stop.len() {
            return Err(Error::InvalidRoi(format!(
                "start has {} axes but stop has {}",
                start.len(),
                stop.len()
            )));
        }
        if start.iter().zip(&stop).any(|(a, b)| b < a) {
            return Err(Error::InvalidRoi(format!(
                "stop {stop:?} precedes start {start:?}"
            )));
        }
        Ok(Self { start, stop })
    }

    /// Region covering a whole volume of the given shape.
    #[must_use]
    pub fn from_shape(shape: &[usize]) -> Self {
        Self {
            start: vec![0; shape.len()],
            stop: shape.to_vec(),
        }
    }

    /// Zero-dimensional region used for whole-value slots.
    #[must_use]
    pub fn scalar() -> Self {
        Self {
            start: Vec::new(),
            stop: Vec::new(),
        }
    }

    #[must_use]
    pub fn start(&self) -> &[usize] {
        &self.start
    }

    #[must_use]
    pub fn stop(&self) -> &[usize] {
        &self.stop
    }

    /// Number of axes.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.start.len()
    }

    /// Extent per axis (`stop - start`).
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        self.start
            .iter()
            .zip(&self.stop)
            .map(|(a, b)| b - a)
            .collect()
    }

    /// Number of elements covered. A 0-d region covers one element.
    #[must_use]
    pub fn volume(&self) -> usize {
        self.shape().iter().product()
    }

    /// Returns true if any axis has zero extent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start.iter().zip(&self.stop).any(|(a, b)| a == b)
    }

    /// Overlap of two regions, or `None` if they are disjoint.
    #[must_use]
    pub fn intersection(&self, other: &Roi) -> Option<Roi> {
        if self.ndim() != other.ndim() {
            return None;
        }
        let start: Vec<usize> = self
            .start
            .iter()
            .zip(&other.start)
            .map(|(a, b)| *a.max(b))
            .collect();
        let stop: Vec<usize> = self
            .stop
            .iter()
            .zip(&other.stop)
            .map(|(a, b)| *a.min(b))
            .collect();
        if start.iter().zip(&stop).any(|(a, b)| a >= b) {
            return None;
        }
        Some(Roi { start, stop })
    }

    /// Smallest region containing both regions.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRoi`] if the dimensionalities differ.
    pub fn bounding_union(&self, other: &Roi) -> Result<Roi> {
        if self.ndim() != other.ndim() {
            return Err(Error::InvalidRoi(format!(
                "cannot unite {}-d and {}-d regions",
                self.ndim(),
                other.ndim()
            )));
        }
        Ok(Roi {
            start: self
                .start
                .iter()
                .zip(&other.start)
                .map(|(a, b)| *a.min(b))
                .collect(),
            stop: self
                .stop
                .iter()
                .zip(&other.stop)
                .map(|(a, b)| *a.max(b))
                .collect(),
        })
    }

    /// Returns true if `other` lies entirely inside this region.
    #[must_use]
    pub fn contains(&self, other: &Roi) -> bool {
        self.ndim() == other.ndim()
            && self.start.iter().zip(&other.start).all(|(a, b)| a <= b)
            && self.stop.iter().zip(&other.stop).all(|(a, b)| a >= b)
    }

    /// Checks that the region lies inside a volume of the given shape.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRoi`] on dimensionality mismatch or overflow.
    pub fn check_within(&self, shape: &[usize]) -> Result<()> {
        if self.ndim() != shape.len() {
            return Err(Error::InvalidRoi(format!(
                "{self} has {} axes, volume has {}",
                self.ndim(),
                shape.len()
            )));
        }
        if self.stop.iter().zip(shape).any(|(s, n)| s > n) {
            return Err(Error::InvalidRoi(format!(
                "{self} exceeds volume shape {shape:?}"
            )));
        }
        Ok(())
    }

    /// Part of the region inside a volume of the given shape.
    #[must_use]
    pub fn clip_to(&self, shape: &[usize]) -> Option<Roi> {
        self.intersection(&Roi::from_shape(shape))
    }

    /// Expresses the region in coordinates relative to `origin`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRoi`] if `origin` is not at or before `start`.
    pub fn relative_to(&self, origin: &[usize]) -> Result<Roi> {
        if origin.len() != self.ndim() || origin.iter().zip(&self.start).any(|(o, s)| o > s) {
            return Err(Error::InvalidRoi(format!(
                "origin {origin:?} does not precede {self}"
            )));
        }
        Ok(Roi {
            start: self.start.iter().zip(origin).map(|(s, o)| s - o).collect(),
            stop: self.stop.iter().zip(origin).map(|(s, o)| s - o).collect(),
        })
    }

    /// Translates the region by `offset`.
    #[must_use]
    pub fn shifted_by(&self, offset: &[usize]) -> Roi {
        Roi {
            start: self.start.iter().zip(offset).map(|(s, o)| s + o).collect(),
            stop: self.stop.iter().zip(offset).map(|(s, o)| s + o).collect(),
        }
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&slicing_to_string(self))
    }
}

impl FromStr for Roi {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        string_to_slicing(s)
    }
}

/// Formats a region as `[start:stop,start:stop,...]`.
#[must_use]
pub fn slicing_to_string(roi: &Roi) -> String {
    let axes: Vec<String> = roi
        .start
        .iter()
        .zip(&roi.stop)
        .map(|(a, b)| format!("{a}:{b}"))
        .collect();
    format!("[{}]", axes.join(","))
}

/// Parses a string produced by [`slicing_to_string`].
///
/// Whitespace around numbers is tolerated.
///
/// # Errors
/// Returns [`Error::InvalidSlicing`] for malformed text and
/// [`Error::InvalidRoi`] if a stop precedes its start.
pub fn string_to_slicing(text: &str) -> Result<Roi> {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| Error::InvalidSlicing(text.to_string()))?;

    if inner.trim().is_empty() {
        return Ok(Roi::scalar());
    }

    let mut start = Vec::new();
    let mut stop = Vec::new();
    for axis in inner.split(',') {
        let (a, b) = axis
            .split_once(':')
            .ok_or_else(|| Error::InvalidSlicing(text.to_string()))?;
        let a = a
            .trim()
            .parse::<usize>()
            .map_err(|_| Error::InvalidSlicing(text.to_string()))?;
        let b = b
            .trim()
            .parse::<usize>()
            .map_err(|_| Error::InvalidSlicing(text.to_string()))?;
        start.push(a);
        stop.push(b);
    }
    Roi::new(start, stop)
}

/// Extent of a dirty notification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Dirty {
    /// The entire domain of the slot.
    Whole,
    /// A bounded region.
    Region(Roi),
}

impl Dirty {
    #[must_use]
    pub fn is_whole(&self) -> bool {
        matches!(self, Self::Whole)
    }

    /// The bounded region, if any.
    #[must_use]
    pub fn region(&self) -> Option<&Roi> {
        match self {
            Self::Whole => None,
            Self::Region(roi) => Some(roi),
        }
    }

    /// Returns true if the dirty extent covers `roi`.
    #[must_use]
    pub fn contains(&self, roi: &Roi) -> bool {
        match self {
            Self::Whole => true,
            Self::Region(region) => region.contains(roi),
        }
    }

    /// Smallest dirty extent covering both.
    #[must_use]
    pub fn union(&self, other: &Dirty) -> Dirty {
        match (self, other) {
            (Self::Region(a), Self::Region(b)) => a
                .bounding_union(b)
                .map_or(Self::Whole, Self::Region),
            _ => Self::Whole,
        }
    }

    /// Concrete region within a volume of the given shape.
    #[must_use]
    pub fn to_roi(&self, shape: &[usize]) -> Roi {
        match self {
            Self::Whole => Roi::from_shape(shape),
            Self::Region(roi) => roi.clone(),
        }
    }

    /// Restricts a bounded region to the volume; `None` if nothing remains.
    #[must_use]
    pub fn clip_to(&self, shape: &[usize]) -> Option<Dirty> {
        match self {
            Self::Whole => Some(Self::Whole),
            Self::Region(roi) => roi.clip_to(shape).map(Self::Region),
        }
    }
}

impl From<Roi> for Dirty {
    fn from(roi: Roi) -> Self {
        Self::Region(roi)
    }
}

impl fmt::Display for Dirty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Whole => f.write_str("[...]"),
            Self::Region(roi) => roi.fmt(f),
        }
    }
}

fn check_block_shape(block_shape: &[usize], ndim: usize) -> Result<()> {
    if block_shape.len() != ndim {
        return Err(Error::InvalidRoi(format!(
            "block shape {block_shape:?} does not match {ndim} axes"
        )));
    }
    if block_shape.contains(&0) {
        return Err(Error::InvalidRoi(format!(
            "block shape {block_shape:?} has a zero extent"
        )));
    }
    Ok(())
}

/// Start coordinates of every block of a regular tiling that overlaps `roi`.
///
/// Blocks are aligned to multiples of `block_shape` and returned in
/// row-major order.
///
/// # Errors
/// Returns [`Error::InvalidRoi`] if `block_shape` is malformed.
pub fn intersecting_blocks(block_shape: &[usize], roi: &Roi) -> Result<Vec<Vec<usize>>> {
    check_block_shape(block_shape, roi.ndim())?;
    if roi.is_empty() {
        return Ok(Vec::new());
    }

    let first: Vec<usize> = roi
        .start
        .iter()
        .zip(block_shape)
        .map(|(s, b)| s / b * b)
        .collect();
    let last: Vec<usize> = roi
        .stop
        .iter()
        .zip(block_shape)
        .map(|(s, b)| (s - 1) / b * b)
        .collect();

    let mut blocks = Vec::new();
    let mut current = first.clone();
    loop {
        blocks.push(current.clone());

        // Odometer increment, last axis fastest.
        let mut axis = current.len();
        loop {
            if axis == 0 {
                return Ok(blocks);
            }
            axis -= 1;
            if current[axis] < last[axis] {
                current[axis] += block_shape[axis];
                break;
            }
            current[axis] = first[axis];
        }
    }
}

/// Bounds of the block starting at `block_start`, clipped to the volume.
///
/// # Errors
/// Returns [`Error::InvalidRoi`] if the block lies outside the volume.
pub fn block_bounds(
    volume_shape: &[usize],
    block_shape: &[usize],
    block_start: &[usize],
) -> Result<Roi> {
    check_block_shape(block_shape, volume_shape.len())?;
    if block_start.len() != volume_shape.len()
        || block_start.iter().zip(volume_shape).any(|(s, n)| s >= n)
    {
        return Err(Error::InvalidRoi(format!(
            "block start {block_start:?} outside volume {volume_shape:?}"
        )));
    }
    let stop = block_start
        .iter()
        .zip(block_shape)
        .zip(volume_shape)
        .map(|((s, b), n)| (s + b).min(*n))
        .collect();
    Roi::new(block_start.to_vec(), stop)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roi(start: &[usize], stop: &[usize]) -> Roi {
        Roi::new(start.to_vec(), stop.to_vec()).unwrap()
    }

    #[test]
    fn test_roi_rejects_inverted_bounds() {
        assert!(matches!(
            Roi::new(vec![5, 0], vec![4, 1]),
            Err(Error::InvalidRoi(_))
        ));
        assert!(Roi::new(vec![0], vec![1, 2]).is_err());
    }

    #[test]
    fn test_shape_and_volume() {
        let r = roi(&[2, 3, 0], &[10, 5, 1]);
        assert_eq!(r.shape(), vec![8, 2, 1]);
        assert_eq!(r.volume(), 16);
        assert!(!r.is_empty());
        assert_eq!(Roi::scalar().volume(), 1);
    }

    #[test]
    fn test_intersection_and_union() {
        let a = roi(&[0, 0], &[10, 10]);
        let b = roi(&[5, 8], &[20, 12]);
        assert_eq!(a.intersection(&b), Some(roi(&[5, 8], &[10, 10])));
        assert_eq!(a.bounding_union(&b).unwrap(), roi(&[0, 0], &[20, 12]));

        let c = roi(&[10, 0], &[12, 5]);
        assert_eq!(a.intersection(&c), None);
    }

    #[test]
    fn test_contains_and_check_within() {
        let outer = roi(&[0, 0], &[10, 10]);
        assert!(outer.contains(&roi(&[2, 2], &[10, 4])));
        assert!(!outer.contains(&roi(&[2, 2], &[11, 4])));
        assert!(roi(&[0, 0], &[4, 4]).check_within(&[4, 4]).is_ok());
        assert!(roi(&[0, 0], &[4, 5]).check_within(&[4, 4]).is_err());
        assert!(roi(&[0], &[4]).check_within(&[4, 4]).is_err());
    }

    #[test]
    fn test_relative_to() {
        let r = roi(&[5, 7], &[8, 9]);
        assert_eq!(r.relative_to(&[4, 4]).unwrap(), roi(&[1, 3], &[4, 5]));
        assert!(r.relative_to(&[6, 0]).is_err());
        assert_eq!(roi(&[1, 3], &[4, 5]).shifted_by(&[4, 4]), r);
    }

    #[test]
    fn test_slicing_format() {
        let r = roi(&[0, 0, 0], &[10, 5, 1]);
        assert_eq!(slicing_to_string(&r), "[0:10,0:5,0:1]");
        assert_eq!(string_to_slicing("[0:10,0:5,0:1]").unwrap(), r);
        assert_eq!(string_to_slicing(" [ 0 : 10 , 0:5,0:1 ] ").unwrap(), r);
        assert_eq!(string_to_slicing("[]").unwrap(), Roi::scalar());
    }

    #[test]
    fn test_slicing_rejects_garbage() {
        for bad in ["0:10", "[0:10", "[0-10]", "[a:b]", "[0:1,]", "[-1:3]"] {
            assert!(string_to_slicing(bad).is_err(), "accepted {bad}");
        }
        assert!(matches!(
            string_to_slicing("[5:1]"),
            Err(Error::InvalidRoi(_))
        ));
    }

    #[test]
    fn test_dirty_union() {
        let a = Dirty::from(roi(&[0, 0], &[2, 2]));
        let b = Dirty::from(roi(&[4, 4], &[6, 6]));
        assert_eq!(a.union(&b), Dirty::from(roi(&[0, 0], &[6, 6])));
        assert_eq!(a.union(&Dirty::Whole), Dirty::Whole);
        assert!(Dirty::Whole.contains(&roi(&[0], &[100])));
        assert_eq!(
            Dirty::from(roi(&[8, 8], &[12, 12])).clip_to(&[10, 10]),
            Some(Dirty::from(roi(&[8, 8], &[10, 10])))
        );
        assert_eq!(Dirty::from(roi(&[10, 0], &[12, 2])).clip_to(&[10, 10]), None);
    }

    #[test]
    fn test_intersecting_blocks() {
        let blocks = intersecting_blocks(&[4, 4], &roi(&[3, 0], &[9, 4])).unwrap();
        assert_eq!(blocks, vec![vec![0, 0], vec![4, 0], vec![8, 0]]);

        let blocks = intersecting_blocks(&[5, 5], &roi(&[0, 0], &[10, 10])).unwrap();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[1], vec![0, 5]);

        assert!(intersecting_blocks(&[4, 4], &roi(&[0, 0], &[0, 4]))
            .unwrap()
            .is_empty());
        assert!(intersecting_blocks(&[0, 4], &roi(&[0, 0], &[4, 4])).is_err());
    }

    #[test]
    fn test_block_bounds_clip_to_volume() {
        let b = block_bounds(&[10, 7], &[4, 4], &[8, 4]).unwrap();
        assert_eq!(b, roi(&[8, 4], &[10, 7]));
        assert!(block_bounds(&[10, 7], &[4, 4], &[12, 0]).is_err());
    }
}
