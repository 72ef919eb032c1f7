//! roiflow-core: Core types for lazy region-of-interest dataflow.
//!
//! This crate provides the region algebra, slicing strings, typed array
//! buffers, slot values and metadata, and the error taxonomy shared by the
//! engine, its operators and the project serializers.
//!

pub mod array;
pub mod error;
pub mod roi;
pub mod value;

pub use array::{ArrayData, DType};
pub use error::{Error, Result};
pub use roi::{
    block_bounds, intersecting_blocks, slicing_to_string, string_to_slicing, Dirty, Roi,
};
pub use value::{Meta, Value};
