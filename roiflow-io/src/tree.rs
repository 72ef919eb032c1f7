//! In-memory project tree.
//!
//! A project is a hierarchy of named groups holding datasets, each with
//! string attributes. Serializers read and write this tree; storage
//! backends translate it to and from files.

use roiflow_core::ArrayData;
use std::collections::BTreeMap;
use std::fmt;

/// Content of a dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetData {
    Array(ArrayData),
    Text(String),
    Int(i64),
    Float(f64),
}

impl DatasetData {
    #[must_use]
    pub fn as_array(&self) -> Option<&ArrayData> {
        match self {
            Self::Array(array) => Some(array),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Numeric value of a scalar dataset.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(text) => text.trim().parse().ok(),
            Self::Array(_) => None,
        }
    }
}

/// A dataset with its attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub data: DatasetData,
    pub attrs: BTreeMap<String, String>,
}

impl Dataset {
    #[must_use]
    pub fn new(data: DatasetData) -> Self {
        Self {
            data,
            attrs: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        self.attrs.insert(name.to_string(), value.into());
    }
}

/// A group of sub-groups and datasets, ordered by name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProjectGroup {
    groups: BTreeMap<String, ProjectGroup>,
    datasets: BTreeMap<String, Dataset>,
    attrs: BTreeMap<String, String>,
}

impl ProjectGroup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.datasets.is_empty() && self.attrs.is_empty()
    }

    /// Number of direct members (groups and datasets).
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len() + self.datasets.len()
    }

    #[must_use]
    pub fn group(&self, name: &str) -> Option<&ProjectGroup> {
        self.groups.get(name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut ProjectGroup> {
        self.groups.get_mut(name)
    }

    /// Returns the sub-group `name`, creating it if needed.
    pub fn require_group(&mut self, name: &str) -> &mut ProjectGroup {
        self.groups.entry(name.to_string()).or_default()
    }

    /// Replaces the sub-group `name` with an empty one.
    pub fn create_group(&mut self, name: &str) -> &mut ProjectGroup {
        self.datasets.remove(name);
        let slot = self.groups.entry(name.to_string()).or_default();
        *slot = ProjectGroup::new();
        slot
    }

    /// Sub-groups in name order.
    pub fn groups(&self) -> impl Iterator<Item = (&str, &ProjectGroup)> {
        self.groups.iter().map(|(name, group)| (name.as_str(), group))
    }

    #[must_use]
    pub fn dataset(&self, name: &str) -> Option<&Dataset> {
        self.datasets.get(name)
    }

    /// Datasets in name order.
    pub fn datasets(&self) -> impl Iterator<Item = (&str, &Dataset)> {
        self.datasets.iter().map(|(name, dataset)| (name.as_str(), dataset))
    }

    /// Stores `data` under `name`, replacing any member of that name.
    pub fn insert_dataset(&mut self, name: &str, data: DatasetData) -> &mut Dataset {
        self.groups.remove(name);
        let slot = self
            .datasets
            .entry(name.to_string())
            .or_insert_with(|| Dataset::new(DatasetData::Int(0)));
        *slot = Dataset::new(data);
        slot
    }

    /// Deletes the member `name`; returns true if it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.groups.remove(name).is_some() || self.datasets.remove(name).is_some()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.groups.contains_key(name) || self.datasets.contains_key(name)
    }

    /// Looks up a dataset by a `/`-separated path.
    #[must_use]
    pub fn dataset_at(&self, path: &str) -> Option<&Dataset> {
        let (parents, name) = match path.rsplit_once('/') {
            Some((parents, name)) => (Some(parents), name),
            None => (None, path),
        };
        let mut group = self;
        for part in parents.into_iter().flat_map(|p| p.split('/')) {
            group = group.group(part)?;
        }
        group.dataset(name)
    }

    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        self.attrs.insert(name.to_string(), value.into());
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn write_tree(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        for (name, value) in &self.attrs {
            writeln!(f, "{indent}@{name} = {value:?}")?;
        }
        for (name, dataset) in &self.datasets {
            let summary = match &dataset.data {
                DatasetData::Array(array) => format!("{} {:?}", array.dtype(), array.shape()),
                DatasetData::Text(text) => format!("text ({} bytes)", text.len()),
                DatasetData::Int(v) => format!("int {v}"),
                DatasetData::Float(v) => format!("float {v}"),
            };
            writeln!(f, "{indent}{name}: {summary}")?;
            for (attr, value) in &dataset.attrs {
                writeln!(f, "{indent}  @{attr} = {value:?}")?;
            }
        }
        for (name, group) in &self.groups {
            writeln!(f, "{indent}{name}/")?;
            group.write_tree(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for ProjectGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_tree(f, 0)
    }
}
