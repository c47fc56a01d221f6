//! Concrete operations and the factories that build them.
pub mod activation;
pub mod arithmetic;
pub mod bias;
pub mod dense;
pub mod distributor;
pub mod dropout;
pub mod embedding;
pub mod loss;
pub mod sequential;
pub mod variable;

use crate::device::Device;
use crate::graph::ShapeError;
use crate::graph::operation::{SlotKey, Slots, gradient_sources};
use crate::storage::GraphStorage;

pub(crate) fn slot(op: &str, slots: &Slots, key: SlotKey) -> Result<GraphStorage, ShapeError> {
    slots.get(&key).cloned().ok_or_else(|| ShapeError::MissingInput {
        op: op.to_string(),
        slot: key.to_string(),
    })
}

pub(crate) fn require_rank(
    op: &str,
    storage: &GraphStorage,
    rank: usize,
) -> Result<Vec<usize>, ShapeError> {
    let shape = storage.shape();
    if shape.len() != rank {
        return Err(ShapeError::UnexpectedRank {
            op: op.to_string(),
            expected: rank,
            shape,
        });
    }
    Ok(shape)
}

/// What a backward operation sees: its forward node's slots and every gradient published
/// for the forward output.
pub(crate) struct BackwardInputs {
    pub forward: Slots,
    pub y: GraphStorage,
    pub upstream: Vec<GraphStorage>,
}

pub(crate) fn backward_inputs(op: &str, inputs: &[Slots]) -> Result<BackwardInputs, ShapeError> {
    let forward = inputs.first().cloned().ok_or_else(|| ShapeError::MissingInput {
        op: op.to_string(),
        slot: "forward".to_string(),
    })?;
    let y = slot(op, &forward, SlotKey::Output)?;
    let upstream = gradient_sources(&inputs[1..], y.id());
    Ok(BackwardInputs {
        forward,
        y,
        upstream,
    })
}

/// Storage published as the gradient of one forward input.
#[derive(Debug, Default)]
pub(crate) struct GradientOutput {
    storage: GraphStorage,
    slots: Slots,
}

impl GradientOutput {
    pub fn bind(&mut self, target: &GraphStorage, devices: &[Device]) {
        self.storage.init(&target.shape(), devices);
        self.slots = Slots::from([(SlotKey::GradientOf(target.id()), self.storage.clone())]);
    }

    pub fn storage(&self) -> &GraphStorage {
        &self.storage
    }

    pub fn slots(&self) -> &Slots {
        &self.slots
    }
}
