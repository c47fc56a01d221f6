use crate::device::{Device, ExecutionContext, handles};
use crate::graph::element::{ComputationGraph, ElementId, GraphInput};
use crate::graph::factory::{FactoryState, GraphFactory};
use crate::graph::operation::{Operation, SlotKey, Slots, input_slot, sum_gradients};
use crate::graph::{ConfigurationError, GraphError, ShapeError};
use crate::ops::{GradientOutput, backward_inputs, slot};
use crate::storage::GraphStorage;

#[derive(Debug)]
pub struct AddForward {
    devices: Vec<Device>,
    lhs: GraphStorage,
    rhs: GraphStorage,
    y: GraphStorage,
    slots: Slots,
}

impl AddForward {
    pub fn new(ctx: &ExecutionContext) -> Self {
        let y = GraphStorage::new();
        Self {
            devices: ctx.devices(),
            lhs: GraphStorage::new(),
            rhs: GraphStorage::new(),
            slots: Slots::from([(SlotKey::Output, y.clone())]),
            y,
        }
    }
}

impl Operation for AddForward {
    fn name(&self) -> &str {
        "Add"
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        let lhs = input_slot("Add", inputs, 0, SlotKey::Output)?;
        let rhs = input_slot("Add", inputs, 1, SlotKey::Output)?;
        if lhs.shape() != rhs.shape() {
            return Err(ShapeError::IncompatibleShapes {
                op: "Add".to_string(),
                lhs: lhs.shape(),
                rhs: rhs.shape(),
            }
            .into());
        }
        self.y.init(&lhs.shape(), &self.devices);
        self.slots.insert(SlotKey::Named("a"), lhs.clone());
        self.slots.insert(SlotKey::Named("b"), rhs.clone());
        self.lhs = lhs;
        self.rhs = rhs;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        for (device, handle) in handles(&self.devices) {
            let out = handle.zip_map(
                "Add",
                &*self.lhs.get(device)?,
                &*self.rhs.get(device)?,
                |a, b| a + b,
            )?;
            self.y.write(device, out);
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        &self.slots
    }
}

/// Passes the upstream gradient through unchanged to the forward input published under `key`.
#[derive(Debug)]
pub struct IdentityBackward {
    op: &'static str,
    key: &'static str,
    devices: Vec<Device>,
    upstream: Vec<GraphStorage>,
    grad: GradientOutput,
}

impl IdentityBackward {
    pub fn new(ctx: &ExecutionContext, op: &'static str, key: &'static str) -> Self {
        Self {
            op,
            key,
            devices: ctx.devices(),
            upstream: Vec::new(),
            grad: GradientOutput::default(),
        }
    }
}

impl Operation for IdentityBackward {
    fn name(&self) -> &str {
        self.op
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        let bw = backward_inputs(self.op, inputs)?;
        let target = slot(self.op, &bw.forward, SlotKey::Named(self.key))?;
        self.grad.bind(&target, &self.devices);
        self.upstream = bw.upstream;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        let shape = self.grad.storage().shape();
        for device in &self.devices {
            let dy = sum_gradients(&self.upstream, *device, &shape)?;
            self.grad.storage().write(*device, dy);
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        self.grad.slots()
    }
}

/// Element-wise sum of two same-shaped inputs.
#[derive(Debug, Default)]
pub struct Add {
    state: FactoryState,
}

impl Add {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphFactory for Add {
    fn state(&self) -> &FactoryState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut FactoryState {
        &mut self.state
    }

    fn connect(
        &mut self,
        graph: &mut ComputationGraph,
        inputs: &[GraphInput],
    ) -> Result<ElementId, GraphError> {
        if inputs.len() != 2 {
            return Err(ConfigurationError::InputCount {
                op: "Add".to_string(),
                expected: 2,
                got: inputs.len(),
            }
            .into());
        }
        let ctx = graph.context().clone();
        graph.add_element(
            Box::new(AddForward::new(&ctx)),
            vec![
                Box::new(IdentityBackward::new(&ctx, "AddBackward", "a")),
                Box::new(IdentityBackward::new(&ctx, "AddBackward", "b")),
            ],
            inputs,
        )
    }
}
