//! HDF5 backend for project trees.
//!
//! Groups map to HDF5 groups, array datasets to typed datasets of the same
//! shape, scalar datasets to scalar datasets (text as variable-length
//! UTF-8), and attributes to variable-length UTF-8 string attributes.

use crate::tree::{DatasetData, ProjectGroup};
use crate::{Error, Result};
use hdf5::types::{FloatSize, IntSize, TypeDescriptor, VarLenUnicode};
use hdf5::{Dataset, File, Group, Location};
use roiflow_core::ArrayData;
use std::path::Path;
use std::str::FromStr;

/// Writes `tree` to a new HDF5 file at `path`, replacing any existing file.
///
/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn write_project_hdf5<P: AsRef<Path>>(path: P, tree: &ProjectGroup) -> Result<()> {
    let file = File::create(path.as_ref())?;
    write_group(&file, tree)?;
    log::debug!("wrote project to {}", path.as_ref().display());
    Ok(())
}

/// Reads the whole HDF5 file at `path` into a project tree.
///
/// # Errors
/// Returns an error if the file cannot be read or holds a dataset type the
/// tree cannot represent.
pub fn read_project_hdf5<P: AsRef<Path>>(path: P) -> Result<ProjectGroup> {
    let file = File::open(path.as_ref())?;
    read_group(&file)
}

fn write_group(target: &Group, group: &ProjectGroup) -> Result<()> {
    for (name, value) in group.attrs() {
        set_attr_str(target, name, value)?;
    }
    for (name, dataset) in group.datasets() {
        let written = write_dataset(target, name, &dataset.data)?;
        for (attr, value) in &dataset.attrs {
            set_attr_str(&written, attr, value)?;
        }
    }
    for (name, child) in group.groups() {
        let created = target.create_group(name)?;
        write_group(&created, child)?;
    }
    Ok(())
}

fn write_dataset(group: &Group, name: &str, data: &DatasetData) -> Result<Dataset> {
    let dataset = match data {
        DatasetData::Array(ArrayData::U8(array)) => {
            let ds = group.new_dataset::<u8>().shape(array.shape().to_vec()).create(name)?;
            ds.write(array)?;
            ds
        }
        DatasetData::Array(ArrayData::U32(array)) => {
            let ds = group.new_dataset::<u32>().shape(array.shape().to_vec()).create(name)?;
            ds.write(array)?;
            ds
        }
        DatasetData::Array(ArrayData::F32(array)) => {
            let ds = group.new_dataset::<f32>().shape(array.shape().to_vec()).create(name)?;
            ds.write(array)?;
            ds
        }
        DatasetData::Text(text) => {
            let ds = group.new_dataset::<VarLenUnicode>().shape(()).create(name)?;
            ds.write_scalar(&to_var_len_unicode(text)?)?;
            ds
        }
        DatasetData::Int(value) => {
            let ds = group.new_dataset::<i64>().shape(()).create(name)?;
            ds.write_scalar(value)?;
            ds
        }
        DatasetData::Float(value) => {
            let ds = group.new_dataset::<f64>().shape(()).create(name)?;
            ds.write_scalar(value)?;
            ds
        }
    };
    Ok(dataset)
}

fn read_group(source: &Group) -> Result<ProjectGroup> {
    let mut group = ProjectGroup::new();
    for (name, value) in read_attrs(source)? {
        group.set_attr(&name, value);
    }
    for ds in source.datasets()? {
        let name = base_name(&ds.name());
        let data = read_dataset(&ds, &name)?;
        let dataset = group.insert_dataset(&name, data);
        for (attr, value) in read_attrs(&ds)? {
            dataset.set_attr(&attr, value);
        }
    }
    for child in source.groups()? {
        let name = base_name(&child.name());
        *group.require_group(&name) = read_group(&child)?;
    }
    Ok(group)
}

fn read_dataset(ds: &Dataset, name: &str) -> Result<DatasetData> {
    let descriptor = ds.dtype()?.to_descriptor()?;
    let scalar = ds.ndim() == 0;
    let data = match descriptor {
        TypeDescriptor::Unsigned(IntSize::U1) if !scalar => {
            DatasetData::Array(ArrayData::U8(ds.read_dyn::<u8>()?))
        }
        TypeDescriptor::Unsigned(IntSize::U4) if !scalar => {
            DatasetData::Array(ArrayData::U32(ds.read_dyn::<u32>()?))
        }
        TypeDescriptor::Float(FloatSize::U4) if !scalar => {
            DatasetData::Array(ArrayData::F32(ds.read_dyn::<f32>()?))
        }
        TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) if scalar => {
            DatasetData::Int(ds.read_scalar::<i64>()?)
        }
        TypeDescriptor::Float(_) if scalar => DatasetData::Float(ds.read_scalar::<f64>()?),
        TypeDescriptor::VarLenUnicode if scalar => {
            DatasetData::Text(ds.read_scalar::<VarLenUnicode>()?.to_string())
        }
        other => {
            return Err(Error::InvalidFormat(format!(
                "dataset {name} has unsupported type {other:?} (ndim {})",
                ds.ndim()
            )))
        }
    };
    Ok(data)
}

fn read_attrs(location: &Location) -> Result<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    for name in location.attr_names()? {
        let attr = location.attr(&name)?;
        match attr.read_scalar::<VarLenUnicode>() {
            Ok(value) => attrs.push((name, value.to_string())),
            Err(e) => log::debug!("skipping non-text attribute {name}: {e}"),
        }
    }
    Ok(attrs)
}

fn set_attr_str(location: &Location, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    location
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn base_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn to_var_len_unicode(value: &str) -> Result<VarLenUnicode> {
    VarLenUnicode::from_str(value)
        .map_err(|e| Error::InvalidFormat(format!("invalid utf-8 text: {e}")))
}
