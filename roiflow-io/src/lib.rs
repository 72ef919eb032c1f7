//! roiflow-io: Project persistence.
//!
//! A project is an in-memory [`ProjectGroup`] tree filled by
//! [`AppletSerializer`]s, one per pipeline component. With the `hdf5`
//! feature the tree is stored in HDF5 files.

mod error;
#[cfg(feature = "hdf5")]
pub mod hdf5;
pub mod project;
pub mod serializer;
pub mod tree;

pub use error::{Error, Result};
pub use project::Project;
pub use serializer::{
    AppletSerializer, LegacyImportDeserializer, PixelClassificationSerializer, ProgressCallback,
    SerializerOptions, PROJECT_VERSION_KEY, STORAGE_VERSION,
};
pub use tree::{Dataset, DatasetData, ProjectGroup};

#[cfg(feature = "hdf5")]
pub use crate::hdf5::{read_project_hdf5, write_project_hdf5};
