//! Typed n-dimensional buffers exchanged between slots.

use crate::roi::Roi;
use crate::{Error, Result};
use ndarray::{ArrayD, IxDyn, SliceInfoElem};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Element type of an array slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DType {
    U8,
    U32,
    F32,
}

impl DType {
    /// Size of one element in bytes.
    #[must_use]
    pub fn size_of(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::U32 | DType::F32 => 4,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::U8 => write!(f, "uint8"),
            DType::U32 => write!(f, "uint32"),
            DType::F32 => write!(f, "float32"),
        }
    }
}

/// An owned array tagged with its element type.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    U8(ArrayD<u8>),
    U32(ArrayD<u32>),
    F32(ArrayD<f32>),
}

macro_rules! with_array {
    ($value:expr, $array:ident => $body:expr) => {
        match $value {
            ArrayData::U8($array) => $body,
            ArrayData::U32($array) => $body,
            ArrayData::F32($array) => $body,
        }
    };
}

macro_rules! map_array {
    ($value:expr, $array:ident => $body:expr) => {
        match $value {
            ArrayData::U8($array) => ArrayData::U8($body),
            ArrayData::U32($array) => ArrayData::U32($body),
            ArrayData::F32($array) => ArrayData::F32($body),
        }
    };
}

fn slice_elems(roi: &Roi) -> Vec<SliceInfoElem> {
    roi.start()
        .iter()
        .zip(roi.stop())
        .map(|(&a, &b)| SliceInfoElem::from(a..b))
        .collect()
}

impl ArrayData {
    /// Zero-filled array of the given type and shape.
    #[must_use]
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        let dim = IxDyn(shape);
        match dtype {
            DType::U8 => ArrayData::U8(ArrayD::zeros(dim)),
            DType::U32 => ArrayData::U32(ArrayD::zeros(dim)),
            DType::F32 => ArrayData::F32(ArrayD::zeros(dim)),
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            ArrayData::U8(_) => DType::U8,
            ArrayData::U32(_) => DType::U32,
            ArrayData::F32(_) => DType::F32,
        }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        with_array!(self, a => a.shape())
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        with_array!(self, a => a.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate memory footprint in bytes.
    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.len() * self.dtype().size_of()
    }

    /// Copy of the sub-region `roi`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRoi`] if `roi` does not fit inside the array.
    pub fn region(&self, roi: &Roi) -> Result<ArrayData> {
        roi.check_within(self.shape())?;
        let elems = slice_elems(roi);
        Ok(map_array!(self, a => a.slice(elems.as_slice()).to_owned()))
    }

    /// Writes `src` into the sub-region `roi`, casting to this array's type.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRoi`] if `roi` does not fit and
    /// [`Error::ShapeMismatch`] if `src` does not have the region's shape.
    pub fn assign_region(&mut self, roi: &Roi, src: &ArrayData) -> Result<()> {
        roi.check_within(self.shape())?;
        let expected = roi.shape();
        if src.shape() != expected.as_slice() {
            return Err(Error::ShapeMismatch {
                expected,
                found: src.shape().to_vec(),
            });
        }
        let src = src.cast(self.dtype());
        let elems = slice_elems(roi);
        match (self, &src) {
            (ArrayData::U8(dst), ArrayData::U8(s)) => dst.slice_mut(elems.as_slice()).assign(s),
            (ArrayData::U32(dst), ArrayData::U32(s)) => dst.slice_mut(elems.as_slice()).assign(s),
            (ArrayData::F32(dst), ArrayData::F32(s)) => dst.slice_mut(elems.as_slice()).assign(s),
            (dst, s) => {
                return Err(Error::DTypeMismatch {
                    expected: dst.dtype().to_string(),
                    found: s.dtype().to_string(),
                })
            }
        }
        Ok(())
    }

    /// Converts to another element type. Float to integer conversion rounds
    /// and saturates; `u32` to `u8` saturates.
    #[must_use]
    pub fn cast(&self, dtype: DType) -> ArrayData {
        match dtype {
            DType::U8 => ArrayData::U8(self.to_u8()),
            DType::U32 => ArrayData::U32(self.to_u32()),
            DType::F32 => ArrayData::F32(self.to_f32()),
        }
    }

    /// Element values as `u8`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn to_u8(&self) -> ArrayD<u8> {
        match self {
            ArrayData::U8(a) => a.clone(),
            ArrayData::U32(a) => a.mapv(|v| v.min(255) as u8),
            ArrayData::F32(a) => a.mapv(|v| v.round().clamp(0.0, 255.0) as u8),
        }
    }

    /// Element values as `u32`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn to_u32(&self) -> ArrayD<u32> {
        match self {
            ArrayData::U8(a) => a.mapv(u32::from),
            ArrayData::U32(a) => a.clone(),
            ArrayData::F32(a) => a.mapv(|v| v.round().max(0.0) as u32),
        }
    }

    /// Element values as `f32`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_f32(&self) -> ArrayD<f32> {
        match self {
            ArrayData::U8(a) => a.mapv(f32::from),
            ArrayData::U32(a) => a.mapv(|v| v as f32),
            ArrayData::F32(a) => a.clone(),
        }
    }

    #[must_use]
    pub fn as_u8(&self) -> Option<&ArrayD<u8>> {
        match self {
            ArrayData::U8(a) => Some(a),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_u32(&self) -> Option<&ArrayD<u32>> {
        match self {
            ArrayData::U32(a) => Some(a),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            ArrayData::F32(a) => Some(a),
            _ => None,
        }
    }

    /// Returns true if any element is non-zero.
    #[must_use]
    pub fn any_nonzero(&self) -> bool {
        match self {
            ArrayData::U8(a) => a.iter().any(|&v| v != 0),
            ArrayData::U32(a) => a.iter().any(|&v| v != 0),
            ArrayData::F32(a) => a.iter().any(|&v| v != 0.0),
        }
    }
}

impl From<ArrayD<u8>> for ArrayData {
    fn from(a: ArrayD<u8>) -> Self {
        ArrayData::U8(a)
    }
}

impl From<ArrayD<u32>> for ArrayData {
    fn from(a: ArrayD<u32>) -> Self {
        ArrayData::U32(a)
    }
}

impl From<ArrayD<f32>> for ArrayData {
    fn from(a: ArrayD<f32>) -> Self {
        ArrayData::F32(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array;

    fn ramp(shape: &[usize]) -> ArrayData {
        let n: usize = shape.iter().product();
        let values: Vec<u32> = (0..n).map(|v| u32::try_from(v).unwrap()).collect();
        ArrayData::U32(Array::from_shape_vec(IxDyn(shape), values).unwrap())
    }

    #[test]
    fn test_region_has_roi_shape() {
        let data = ramp(&[4, 5]);
        let roi = Roi::new(vec![1, 2], vec![3, 5]).unwrap();
        let region = data.region(&roi).unwrap();
        assert_eq!(region.shape(), &[2, 3]);
        assert_eq!(region.as_u32().unwrap()[[0, 0]], 7);
        assert_eq!(region.as_u32().unwrap()[[1, 2]], 14);
    }

    #[test]
    fn test_region_out_of_bounds() {
        let data = ramp(&[4, 5]);
        let roi = Roi::new(vec![0, 0], vec![5, 5]).unwrap();
        assert!(matches!(data.region(&roi), Err(Error::InvalidRoi(_))));
    }

    #[test]
    fn test_assign_region_casts() {
        let mut data = ArrayData::zeros(DType::U32, &[3, 3]);
        let patch = ArrayData::U8(ArrayD::from_elem(IxDyn(&[2, 2]), 7));
        let roi = Roi::new(vec![1, 1], vec![3, 3]).unwrap();
        data.assign_region(&roi, &patch).unwrap();
        let a = data.as_u32().unwrap();
        assert_eq!(a[[0, 0]], 0);
        assert_eq!(a[[2, 2]], 7);
        assert_eq!(a.iter().filter(|&&v| v == 7).count(), 4);
    }

    #[test]
    fn test_assign_region_shape_mismatch() {
        let mut data = ArrayData::zeros(DType::U8, &[3, 3]);
        let patch = ArrayData::zeros(DType::U8, &[1, 2]);
        let roi = Roi::new(vec![0, 0], vec![2, 2]).unwrap();
        assert!(matches!(
            data.assign_region(&roi, &patch),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_cast_saturates() {
        let data = ArrayData::F32(ArrayD::from_shape_vec(IxDyn(&[3]), vec![-2.0, 3.6, 400.0]).unwrap());
        let bytes = data.cast(DType::U8);
        assert_eq!(bytes.as_u8().unwrap().as_slice().unwrap(), &[0, 4, 255]);
        let floats = bytes.to_f32();
        assert_relative_eq!(floats[[1]], 4.0);
        assert_eq!(data.nbytes(), 12);
    }
}
