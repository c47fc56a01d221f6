use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand::rngs::StdRng;

use crate::device::{Device, ExecutionContext};
use crate::graph::element::{ComputationGraph, ElementId, GraphInput};
use crate::graph::factory::{FactoryState, GraphFactory};
use crate::graph::operation::{Operation, SlotKey, Slots, input_slot, sum_gradients};
use crate::graph::{ConfigurationError, GraphError};
use crate::ops::{GradientOutput, backward_inputs, slot};
use crate::storage::GraphStorage;

/// Zeroes each input with probability `1 - keep` and rescales the rest by `1 / keep`.
/// Identity in inference mode.
#[derive(Debug)]
pub struct DropoutForward {
    keep: f32,
    inference: bool,
    rng: StdRng,
    devices: Vec<Device>,
    x: GraphStorage,
    y: GraphStorage,
    mask: GraphStorage,
    slots: Slots,
}

impl DropoutForward {
    pub fn new(ctx: &ExecutionContext, keep: f32) -> Self {
        let y = GraphStorage::new();
        let mask = GraphStorage::new();
        Self {
            keep,
            inference: false,
            rng: ctx.fork_rng(),
            devices: ctx.devices(),
            x: GraphStorage::new(),
            slots: Slots::from([
                (SlotKey::Output, y.clone()),
                (SlotKey::Named("mask"), mask.clone()),
            ]),
            y,
            mask,
        }
    }
}

impl Operation for DropoutForward {
    fn name(&self) -> &str {
        "Dropout"
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        let x = input_slot("Dropout", inputs, 0, SlotKey::Output)?;
        self.y.init(&x.shape(), &self.devices);
        self.mask.init(&x.shape(), &self.devices);
        self.slots.insert(SlotKey::Named("x"), x.clone());
        self.x = x;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        let shape = self.x.shape();
        let mask = if self.inference {
            ArrayD::ones(IxDyn(&shape))
        } else {
            let keep = self.keep;
            let rng = &mut self.rng;
            ArrayD::from_shape_fn(IxDyn(&shape), |_| {
                if rng.r#gen::<f32>() < keep { 1.0 / keep } else { 0.0 }
            })
        };
        for device in &self.devices {
            let out = &*self.x.get(*device)? * &mask;
            self.y.write(*device, out);
            self.mask.write(*device, mask.clone());
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        &self.slots
    }

    fn release(&mut self) {
        self.slots.remove(&SlotKey::Named("mask"));
        self.mask = GraphStorage::new();
    }

    fn set_inference(&mut self, inference: bool) {
        self.inference = inference;
    }
}

#[derive(Debug)]
pub struct DropoutBackward {
    devices: Vec<Device>,
    mask: GraphStorage,
    upstream: Vec<GraphStorage>,
    grad: GradientOutput,
}

impl DropoutBackward {
    pub fn new(ctx: &ExecutionContext) -> Self {
        Self {
            devices: ctx.devices(),
            mask: GraphStorage::new(),
            upstream: Vec::new(),
            grad: GradientOutput::default(),
        }
    }
}

impl Operation for DropoutBackward {
    fn name(&self) -> &str {
        "DropoutBackward"
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        let bw = backward_inputs("DropoutBackward", inputs)?;
        let x = slot("DropoutBackward", &bw.forward, SlotKey::Named("x"))?;
        self.mask = slot("DropoutBackward", &bw.forward, SlotKey::Named("mask"))?;
        self.grad.bind(&x, &self.devices);
        self.upstream = bw.upstream;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        let shape = self.mask.shape();
        for device in &self.devices {
            let dy = sum_gradients(&self.upstream, *device, &shape)?;
            let dx = dy * &*self.mask.get(*device)?;
            self.grad.storage().write(*device, dx);
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        self.grad.slots()
    }
}

#[derive(Debug)]
pub struct Dropout {
    state: FactoryState,
    keep: f32,
}

impl Default for Dropout {
    fn default() -> Self {
        Self {
            state: FactoryState::default(),
            keep: 0.5,
        }
    }
}

impl Dropout {
    /// `keep` is the probability of keeping each value, in `(0, 1]`.
    pub fn new(keep: f32) -> Result<Self, ConfigurationError> {
        if !(keep > 0.0 && keep <= 1.0) {
            return Err(ConfigurationError::InvalidHyperparameter {
                name: "keep".to_string(),
                value: keep,
            });
        }
        Ok(Self {
            state: FactoryState::default(),
            keep,
        })
    }
}

impl GraphFactory for Dropout {
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
        if inputs.len() != 1 {
            return Err(ConfigurationError::InputCount {
                op: "Dropout".to_string(),
                expected: 1,
                got: inputs.len(),
            }
            .into());
        }
        let ctx = graph.context().clone();
        graph.add_element(
            Box::new(DropoutForward::new(&ctx, self.keep)),
            vec![Box::new(DropoutBackward::new(&ctx))],
            inputs,
        )
    }
}
