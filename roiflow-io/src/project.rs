//! A project: the serializers of a pipeline plus the tree they share.

use crate::error::Result;
use crate::serializer::{AppletSerializer, PROJECT_VERSION_KEY};
use crate::tree::{DatasetData, ProjectGroup};

/// Saves and restores a pipeline through its serializers.
///
/// The tree survives between saves, so sections whose state did not change
/// keep the content of the previous save or load.
#[derive(Default)]
pub struct Project {
    serializers: Vec<Box<dyn AppletSerializer>>,
    tree: ProjectGroup,
}

impl Project {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a serializer; serializers run in the order they were added.
    pub fn add_serializer(&mut self, serializer: impl AppletSerializer + 'static) {
        self.serializers.push(Box::new(serializer));
    }

    #[must_use]
    pub fn serializers(&self) -> &[Box<dyn AppletSerializer>] {
        &self.serializers
    }

    /// The tree as of the last save or load.
    #[must_use]
    pub fn tree(&self) -> &ProjectGroup {
        &self.tree
    }

    /// Serializes every changed section into the tree.
    ///
    /// # Errors
    /// Propagates the first serializer error; earlier sections stay written.
    pub fn save(&mut self) -> Result<&ProjectGroup> {
        self.tree.insert_dataset(
            PROJECT_VERSION_KEY,
            DatasetData::Text(env!("CARGO_PKG_VERSION").to_string()),
        );
        for serializer in &self.serializers {
            log::debug!("serializing '{}'", serializer.top_group_name());
            serializer.serialize(&mut self.tree)?;
        }
        Ok(&self.tree)
    }

    /// Replaces the tree with `tree` and restores the pipeline from it.
    ///
    /// # Errors
    /// Propagates the first serializer error.
    pub fn load(&mut self, tree: ProjectGroup) -> Result<()> {
        self.tree = tree;
        for serializer in &self.serializers {
            log::debug!("deserializing '{}'", serializer.top_group_name());
            serializer.deserialize(&self.tree)?;
        }
        Ok(())
    }

    /// True if any serializer has unsaved changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.serializers.iter().any(|s| s.is_dirty())
    }

    /// Resets the pipeline state and forgets the tree.
    ///
    /// # Errors
    /// Propagates the first serializer error.
    pub fn unload(&mut self) -> Result<()> {
        for serializer in &self.serializers {
            serializer.unload()?;
        }
        self.tree = ProjectGroup::new();
        Ok(())
    }

    /// Saves and writes the tree to an HDF5 file.
    ///
    /// # Errors
    /// Returns serializer and HDF5 errors.
    #[cfg(feature = "hdf5")]
    pub fn save_hdf5<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<()> {
        self.save()?;
        crate::hdf5::write_project_hdf5(path, &self.tree)
    }

    /// Reads an HDF5 file and loads it.
    ///
    /// # Errors
    /// Returns HDF5 and serializer errors.
    #[cfg(feature = "hdf5")]
    pub fn load_hdf5<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<()> {
        let tree = crate::hdf5::read_project_hdf5(path)?;
        self.load(tree)
    }
}
