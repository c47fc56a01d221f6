//! The two-phase contract every node payload satisfies.
//!
//! `setup` negotiates shapes against the predecessors' published slots and allocates outputs.
//! `perform` computes into the already allocated outputs on every device of the operation.
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::device::{Device, ExecutionContext};
use crate::graph::{GraphError, ShapeError};
use crate::optimizer::Optimizer;
use crate::storage::{GraphStorage, StorageId};

#[derive(
    Debug,
    Clone,
    Copy,
    Hash,
    Ord,
    PartialOrd,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumIter,
)]
pub enum Phase {
    Forward,
    Backward,
    Gradient,
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum OpRole {
    Input,
    Loss,
    Variable,
}

/// Key of a published storage handle.
#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq)]
pub enum SlotKey {
    Output,
    Named(&'static str),
    /// Gradient with respect to the storage with this id.
    GradientOf(StorageId),
}

impl core::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SlotKey::Output => write!(f, "y"),
            SlotKey::Named(name) => write!(f, "{name}"),
            SlotKey::GradientOf(id) => write!(f, "d{id:?}"),
        }
    }
}

pub type Slots = BTreeMap<SlotKey, GraphStorage>;

pub trait Operation: Debug {
    fn name(&self) -> &str;

    fn roles(&self) -> &[OpRole] {
        &[]
    }

    /// `inputs` holds the published slots of each predecessor, in predecessor order.
    fn setup(&mut self, inputs: &[Slots], ctx: &ExecutionContext) -> Result<(), GraphError>;

    fn perform(&mut self) -> Result<(), GraphError>;

    /// Slots visible to successors.
    fn slots(&self) -> &Slots;

    /// Drops intermediates only needed by backward operations.
    fn release(&mut self) {}

    fn set_inference(&mut self, _inference: bool) {}

    /// Optimizer used for parameters that carry no optimizer of their own.
    fn set_default_optimizer(&mut self, _optimizer: Option<Optimizer>) {}

    fn as_dispatcher(&mut self) -> Option<&mut dyn Dispatcher> {
        None
    }
}

/// Fetches slot `key` from predecessor `index`.
pub fn input_slot(
    op: &str,
    inputs: &[Slots],
    index: usize,
    key: SlotKey,
) -> Result<GraphStorage, ShapeError> {
    inputs
        .get(index)
        .and_then(|slots| slots.get(&key))
        .cloned()
        .ok_or_else(|| ShapeError::MissingInput {
            op: op.to_string(),
            slot: format!("{key}@{index}"),
        })
}

/// Every storage published as the gradient of `target`.
pub fn gradient_sources(inputs: &[Slots], target: StorageId) -> Vec<GraphStorage> {
    inputs
        .iter()
        .filter_map(|slots| slots.get(&SlotKey::GradientOf(target)))
        .filter(|storage| storage.is_allocated())
        .cloned()
        .collect()
}

/// Sum of all gradient sources on `device`, zeros when none reach it.
pub fn sum_gradients(
    sources: &[GraphStorage],
    device: Device,
    shape: &[usize],
) -> Result<ArrayD<f32>, GraphError> {
    let mut total = ArrayD::zeros(IxDyn(shape));
    for source in sources {
        let grad = source.get(device)?;
        if grad.shape() != shape {
            return Err(ShapeError::IncompatibleShapes {
                op: "gradient".to_string(),
                lhs: shape.to_vec(),
                rhs: grad.shape().to_vec(),
            }
            .into());
        }
        total += &*grad;
    }
    Ok(total)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A batch with this many rows was published.
    Batch(usize),
    Exhausted,
}

/// Saved dispatcher state for temporary data swaps.
#[derive(Debug, Clone)]
pub struct DispatchSnapshot {
    pub value: ArrayD<f32>,
    pub position: usize,
    pub permutation: Vec<usize>,
}

/// Data-feeding operation driven by the executor.
pub trait Dispatcher {
    fn value(&self) -> &ArrayD<f32>;

    fn set_value(&mut self, value: ArrayD<f32>) -> Result<(), GraphError>;

    /// Rewinds to the first batch. Shuffled schedules draw a new permutation.
    fn reset(&mut self);

    fn next_batch(&mut self) -> Result<Dispatch, GraphError>;

    /// Publishes the whole bound value as one batch.
    fn load_all(&mut self) -> Result<(), GraphError>;

    /// Rows in the bound value.
    fn rows(&self) -> usize;

    /// Batches per pass over the bound value.
    fn batches(&self) -> usize;

    fn snapshot(&self) -> DispatchSnapshot;

    fn restore(&mut self, snapshot: DispatchSnapshot) -> Result<(), GraphError>;
}
