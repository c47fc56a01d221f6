//! On-disk form of a factory tree.
//!
//! Two sections keyed by group path: `values` holds the arrays, `types` records what each leaf
//! is. Floats are stored as raw bit patterns so a round trip is exact.
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::graph::{GraphError, ShapeError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArray {
    pub shape: Vec<usize>,
    pub bits: Vec<u32>,
}

impl StoredArray {
    pub fn from_array(array: &ArrayD<f32>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            bits: array.iter().map(|x| x.to_bits()).collect(),
        }
    }

    pub fn to_array(&self) -> Result<ArrayD<f32>, ShapeError> {
        let data = self.bits.iter().map(|x| f32::from_bits(*x)).collect();
        ArrayD::from_shape_vec(IxDyn(&self.shape), data).map_err(|_| {
            ShapeError::IncompatibleShapes {
                op: "archive".to_string(),
                lhs: self.shape.clone(),
                rhs: vec![self.bits.len()],
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredType {
    #[serde(rename = "renom.Variable")]
    Variable,
    #[serde(rename = "_auto_update")]
    AutoUpdate(bool),
    #[serde(rename = "attribute")]
    Attribute,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelArchive {
    values: BTreeMap<String, BTreeMap<String, StoredArray>>,
    types: BTreeMap<String, BTreeMap<String, StoredType>>,
}

impl ModelArchive {
    pub fn create_group(&mut self, group: &str) {
        self.values.entry(group.to_string()).or_default();
        self.types.entry(group.to_string()).or_default();
    }

    pub fn write_array(&mut self, group: &str, name: &str, array: &ArrayD<f32>, kind: StoredType) {
        self.values
            .entry(group.to_string())
            .or_default()
            .insert(name.to_string(), StoredArray::from_array(array));
        self.set_type(group, name, kind);
    }

    pub fn set_type(&mut self, group: &str, name: &str, kind: StoredType) {
        self.types
            .entry(group.to_string())
            .or_default()
            .insert(name.to_string(), kind);
    }

    pub fn read_array(&self, group: &str, name: &str) -> Result<ArrayD<f32>, GraphError> {
        let stored = self
            .values
            .get(group)
            .and_then(|x| x.get(name))
            .ok_or_else(|| GraphError::StructureMismatch {
                path: format!("{group}.{name}"),
            })?;
        Ok(stored.to_array()?)
    }

    pub fn stored_type(&self, group: &str, name: &str) -> Option<StoredType> {
        self.types.get(group).and_then(|x| x.get(name)).copied()
    }

    pub fn groups(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, StoredArray>)> {
        self.values.iter()
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn write_to(&self, path: &Path) -> Result<(), GraphError> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self, GraphError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}
