use ndarray::Axis;

use crate::device::{Device, ExecutionContext, handles};
use crate::graph::element::{ComputationGraph, ElementId, GraphInput};
use crate::graph::factory::{FactoryState, GraphFactory};
use crate::graph::operation::{Operation, SlotKey, Slots, input_slot, sum_gradients};
use crate::graph::{ConfigurationError, GraphError};
use crate::initializer::Initializer;
use crate::ops::arithmetic::IdentityBackward;
use crate::ops::{GradientOutput, backward_inputs, require_rank, slot};
use crate::storage::GraphStorage;

/// `y = x + b` with `b` of shape `[1, cols]` broadcast over rows.
#[derive(Debug)]
pub struct BiasForward {
    devices: Vec<Device>,
    initializer: Initializer,
    x: GraphStorage,
    b: GraphStorage,
    y: GraphStorage,
    slots: Slots,
}

impl BiasForward {
    pub fn new(ctx: &ExecutionContext, initializer: Initializer) -> Self {
        let y = GraphStorage::new();
        Self {
            devices: ctx.devices(),
            initializer,
            x: GraphStorage::new(),
            b: GraphStorage::new(),
            slots: Slots::from([(SlotKey::Output, y.clone())]),
            y,
        }
    }
}

impl Operation for BiasForward {
    fn name(&self) -> &str {
        "Bias"
    }

    fn setup(&mut self, inputs: &[Slots], ctx: &ExecutionContext) -> Result<(), GraphError> {
        let x = input_slot("Bias", inputs, 0, SlotKey::Output)?;
        let b = input_slot("Bias", inputs, 1, SlotKey::Output)?;
        let shape = require_rank("Bias", &x, 2)?;
        b.init_parameter(&[1, shape[1]], &self.devices, &self.initializer, ctx)?;
        self.y.init(&shape, &self.devices);
        self.slots.insert(SlotKey::Named("x"), x.clone());
        self.slots.insert(SlotKey::Named("b"), b.clone());
        self.x = x;
        self.b = b;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        for (device, _) in handles(&self.devices) {
            let out = &*self.x.get(device)? + &*self.b.get(device)?;
            self.y.write(device, out);
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        &self.slots
    }
}

/// `db = Σ_rows dy`, kept as `[1, cols]`.
#[derive(Debug)]
pub struct BiasBackward {
    devices: Vec<Device>,
    upstream: Vec<GraphStorage>,
    y_shape: Vec<usize>,
    grad: GradientOutput,
}

impl BiasBackward {
    pub fn new(ctx: &ExecutionContext) -> Self {
        Self {
            devices: ctx.devices(),
            upstream: Vec::new(),
            y_shape: Vec::new(),
            grad: GradientOutput::default(),
        }
    }
}

impl Operation for BiasBackward {
    fn name(&self) -> &str {
        "BiasBackward"
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        let bw = backward_inputs("BiasBackward", inputs)?;
        let b = slot("BiasBackward", &bw.forward, SlotKey::Named("b"))?;
        self.grad.bind(&b, &self.devices);
        self.y_shape = bw.y.shape();
        self.upstream = bw.upstream;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        for device in &self.devices {
            let dy = sum_gradients(&self.upstream, *device, &self.y_shape)?;
            let db = dy.sum_axis(Axis(0)).insert_axis(Axis(0));
            self.grad.storage().write(*device, db);
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        self.grad.slots()
    }
}

/// Adds a trainable row vector `b` to a rank-2 input.
#[derive(Debug)]
pub struct Bias {
    state: FactoryState,
    initializer: Initializer,
}

impl Default for Bias {
    fn default() -> Self {
        Self::new(Initializer::Constant(0.0))
    }
}

impl Bias {
    pub fn new(initializer: Initializer) -> Self {
        let mut state = FactoryState::default();
        state.declare("b");
        Self { state, initializer }
    }
}

impl GraphFactory for Bias {
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
        let [input] = inputs else {
            return Err(ConfigurationError::InputCount {
                op: "Bias".to_string(),
                expected: 1,
                got: inputs.len(),
            }
            .into());
        };
        let ctx = graph.context().clone();
        let b = graph.variable(self.state.declare("b"))?;
        graph.add_element(
            Box::new(BiasForward::new(&ctx, self.initializer.clone())),
            vec![
                Box::new(IdentityBackward::new(&ctx, "BiasBackward", "x")),
                Box::new(BiasBackward::new(&ctx)),
            ],
            &[input.clone(), b.into()],
        )
    }
}
