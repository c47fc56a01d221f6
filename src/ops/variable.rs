use crate::device::ExecutionContext;
use crate::graph::GraphError;
use crate::graph::operation::{OpRole, Operation, SlotKey, Slots};
use crate::storage::GraphStorage;

/// Publishes a persistent parameter. Consumers allocate it lazily in their own `setup`.
#[derive(Debug)]
pub struct VariableInput {
    slots: Slots,
}

impl VariableInput {
    pub fn new(storage: GraphStorage) -> Self {
        Self {
            slots: Slots::from([(SlotKey::Output, storage)]),
        }
    }
}

impl Operation for VariableInput {
    fn name(&self) -> &str {
        "Variable"
    }

    fn roles(&self) -> &[OpRole] {
        &[OpRole::Variable]
    }

    fn setup(&mut self, _inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        Ok(())
    }

    fn slots(&self) -> &Slots {
        &self.slots
    }
}

/// Constant array bound by the caller, rebindable through
/// [`ComputationGraph::set_value`](crate::graph::element::ComputationGraph::set_value).
#[derive(Debug)]
pub struct StaticInput {
    slots: Slots,
}

impl StaticInput {
    pub fn new(storage: GraphStorage) -> Self {
        Self {
            slots: Slots::from([(SlotKey::Output, storage)]),
        }
    }
}

impl Operation for StaticInput {
    fn name(&self) -> &str {
        "StaticInput"
    }

    fn setup(&mut self, _inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        Ok(())
    }

    fn slots(&self) -> &Slots {
        &self.slots
    }
}
