//! Objectives. Their forward node carries the loss role and their output has shape `[1]`,
//! or the input shape when unreduced.
use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};

use crate::device::{Device, ExecutionContext};
use crate::graph::element::{ComputationGraph, ElementId, GraphInput};
use crate::graph::factory::{FactoryState, GraphFactory};
use crate::graph::operation::{OpRole, Operation, SlotKey, Slots, input_slot, sum_gradients};
use crate::graph::{ConfigurationError, GraphError, ShapeError};
use crate::ops::{GradientOutput, backward_inputs, slot};
use crate::storage::GraphStorage;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Reduction {
    /// Summed, then divided by the number of rows.
    #[default]
    Mean,
    Sum,
    /// One loss value per input element.
    #[strum(serialize = "none")]
    Unreduced,
}

impl Reduction {
    fn scale(self, shape: &[usize]) -> f32 {
        match self {
            Reduction::Mean => 1.0 / shape.first().copied().unwrap_or(1).max(1) as f32,
            Reduction::Sum | Reduction::Unreduced => 1.0,
        }
    }

    fn output_shape(self, shape: &[usize]) -> Vec<usize> {
        match self {
            Reduction::Unreduced => shape.to_vec(),
            Reduction::Mean | Reduction::Sum => vec![1],
        }
    }

    /// Reduces per-element losses into the output of a loss operation.
    fn reduce(self, losses: ArrayD<f32>) -> ArrayD<f32> {
        let scale = self.scale(losses.shape());
        match self {
            Reduction::Unreduced => losses,
            Reduction::Mean | Reduction::Sum => scalar(losses.sum() * scale),
        }
    }

    /// Applies the reduction's scale and the upstream gradient `dy` to per-element `dx`.
    fn backpropagate(self, dx: ArrayD<f32>, dy: &ArrayD<f32>) -> ArrayD<f32> {
        let scale = self.scale(dx.shape());
        match self {
            Reduction::Unreduced => dx * dy,
            Reduction::Mean | Reduction::Sum => dx * (dy.sum() * scale),
        }
    }
}

/// Upstream gradient of a loss output: ones when the loss is the root, the summed upstream
/// otherwise.
fn loss_upstream(
    upstream: &[GraphStorage],
    device: Device,
    shape: &[usize],
) -> Result<ArrayD<f32>, GraphError> {
    if upstream.is_empty() {
        return Ok(ArrayD::ones(IxDyn(shape)));
    }
    sum_gradients(upstream, device, shape)
}

fn check_target(op: &str, x: &GraphStorage, t: &GraphStorage) -> Result<(), ShapeError> {
    if x.shape() != t.shape() {
        return Err(ShapeError::IncompatibleShapes {
            op: op.to_string(),
            lhs: x.shape(),
            rhs: t.shape(),
        });
    }
    Ok(())
}

fn scalar(value: f32) -> ArrayD<f32> {
    ArrayD::from_elem(IxDyn(&[1]), value)
}

/// `(x - t)² / 2` per element, then reduced.
#[derive(Debug)]
pub struct MeanSquaredForward {
    reduction: Reduction,
    devices: Vec<Device>,
    x: GraphStorage,
    t: GraphStorage,
    y: GraphStorage,
    slots: Slots,
}

impl MeanSquaredForward {
    pub fn new(ctx: &ExecutionContext, reduction: Reduction) -> Self {
        let y = GraphStorage::new();
        Self {
            reduction,
            devices: ctx.devices(),
            x: GraphStorage::new(),
            t: GraphStorage::new(),
            slots: Slots::from([(SlotKey::Output, y.clone())]),
            y,
        }
    }
}

impl Operation for MeanSquaredForward {
    fn name(&self) -> &str {
        "MeanSquared"
    }

    fn roles(&self) -> &[OpRole] {
        &[OpRole::Loss]
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        let x = input_slot("MeanSquared", inputs, 0, SlotKey::Output)?;
        let t = input_slot("MeanSquared", inputs, 1, SlotKey::Output)?;
        check_target("MeanSquared", &x, &t)?;
        self.y.init(&self.reduction.output_shape(&x.shape()), &self.devices);
        self.slots.insert(SlotKey::Named("x"), x.clone());
        self.slots.insert(SlotKey::Named("t"), t.clone());
        self.x = x;
        self.t = t;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        for device in &self.devices {
            let losses = Zip::from(&*self.x.get(*device)?)
                .and(&*self.t.get(*device)?)
                .map_collect(|x, t| (x - t) * (x - t) * 0.5);
            self.y.write(*device, self.reduction.reduce(losses));
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        &self.slots
    }
}

/// `dx = (x - t) · dy`, scaled by the reduction.
#[derive(Debug)]
pub struct MeanSquaredBackward {
    reduction: Reduction,
    devices: Vec<Device>,
    x: GraphStorage,
    t: GraphStorage,
    upstream: Vec<GraphStorage>,
    grad: GradientOutput,
}

impl MeanSquaredBackward {
    pub fn new(ctx: &ExecutionContext, reduction: Reduction) -> Self {
        Self {
            reduction,
            devices: ctx.devices(),
            x: GraphStorage::new(),
            t: GraphStorage::new(),
            upstream: Vec::new(),
            grad: GradientOutput::default(),
        }
    }
}

impl Operation for MeanSquaredBackward {
    fn name(&self) -> &str {
        "MeanSquaredBackward"
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        let bw = backward_inputs("MeanSquaredBackward", inputs)?;
        self.x = slot("MeanSquaredBackward", &bw.forward, SlotKey::Named("x"))?;
        self.t = slot("MeanSquaredBackward", &bw.forward, SlotKey::Named("t"))?;
        self.grad.bind(&self.x, &self.devices);
        self.upstream = bw.upstream;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        let out_shape = self.reduction.output_shape(&self.x.shape());
        for device in &self.devices {
            let dy = loss_upstream(&self.upstream, *device, &out_shape)?;
            let dx = &*self.x.get(*device)? - &*self.t.get(*device)?;
            self.grad
                .storage()
                .write(*device, self.reduction.backpropagate(dx, &dy));
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        self.grad.slots()
    }
}

/// `y = Σ x`. Its gradient is all ones.
#[derive(Debug)]
pub struct ConstantLossForward {
    devices: Vec<Device>,
    x: GraphStorage,
    y: GraphStorage,
    slots: Slots,
}

impl ConstantLossForward {
    pub fn new(ctx: &ExecutionContext) -> Self {
        let y = GraphStorage::new();
        Self {
            devices: ctx.devices(),
            x: GraphStorage::new(),
            slots: Slots::from([(SlotKey::Output, y.clone())]),
            y,
        }
    }
}

impl Operation for ConstantLossForward {
    fn name(&self) -> &str {
        "ConstantLoss"
    }

    fn roles(&self) -> &[OpRole] {
        &[OpRole::Loss]
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        let x = input_slot("ConstantLoss", inputs, 0, SlotKey::Output)?;
        self.y.init(&[1], &self.devices);
        self.slots.insert(SlotKey::Named("x"), x.clone());
        self.x = x;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        for device in &self.devices {
            let total = self.x.get(*device)?.sum();
            self.y.write(*device, scalar(total));
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        &self.slots
    }
}

#[derive(Debug)]
pub struct ConstantLossBackward {
    devices: Vec<Device>,
    upstream: Vec<GraphStorage>,
    grad: GradientOutput,
}

impl ConstantLossBackward {
    pub fn new(ctx: &ExecutionContext) -> Self {
        Self {
            devices: ctx.devices(),
            upstream: Vec::new(),
            grad: GradientOutput::default(),
        }
    }
}

impl Operation for ConstantLossBackward {
    fn name(&self) -> &str {
        "ConstantLossBackward"
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        let bw = backward_inputs("ConstantLossBackward", inputs)?;
        let x = slot("ConstantLossBackward", &bw.forward, SlotKey::Named("x"))?;
        self.grad.bind(&x, &self.devices);
        self.upstream = bw.upstream;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        let shape = self.grad.storage().shape();
        for device in &self.devices {
            let seed = loss_upstream(&self.upstream, *device, &[1])?.sum();
            self.grad
                .storage()
                .write(*device, ArrayD::from_elem(IxDyn(&shape), seed));
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        self.grad.slots()
    }
}

/// Keeps `ln` finite at saturated probabilities.
const LOG_EPSILON: f32 = 1e-8;

/// Binary cross entropy of `sigmoid(x)` against targets `t` in `[0, 1]`.
#[derive(Debug)]
pub struct SigmoidCrossEntropyForward {
    reduction: Reduction,
    devices: Vec<Device>,
    x: GraphStorage,
    t: GraphStorage,
    z: GraphStorage,
    y: GraphStorage,
    slots: Slots,
}

impl SigmoidCrossEntropyForward {
    pub fn new(ctx: &ExecutionContext, reduction: Reduction) -> Self {
        let y = GraphStorage::new();
        let z = GraphStorage::new();
        Self {
            reduction,
            devices: ctx.devices(),
            x: GraphStorage::new(),
            t: GraphStorage::new(),
            slots: Slots::from([(SlotKey::Output, y.clone()), (SlotKey::Named("z"), z.clone())]),
            z,
            y,
        }
    }
}

impl Operation for SigmoidCrossEntropyForward {
    fn name(&self) -> &str {
        "SigmoidCrossEntropy"
    }

    fn roles(&self) -> &[OpRole] {
        &[OpRole::Loss]
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        let x = input_slot("SigmoidCrossEntropy", inputs, 0, SlotKey::Output)?;
        let t = input_slot("SigmoidCrossEntropy", inputs, 1, SlotKey::Output)?;
        check_target("SigmoidCrossEntropy", &x, &t)?;
        self.y.init(&self.reduction.output_shape(&x.shape()), &self.devices);
        self.z.init(&x.shape(), &self.devices);
        self.slots.insert(SlotKey::Named("x"), x.clone());
        self.slots.insert(SlotKey::Named("t"), t.clone());
        self.x = x;
        self.t = t;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        for device in &self.devices {
            let z = self.x.get(*device)?.mapv(|x| 1.0 / (1.0 + (-x).exp()));
            let losses = Zip::from(&z).and(&*self.t.get(*device)?).map_collect(|&z, &t| {
                -(t * (z + LOG_EPSILON).ln() + (1.0 - t) * (1.0 - z + LOG_EPSILON).ln())
            });
            self.z.write(*device, z);
            self.y.write(*device, self.reduction.reduce(losses));
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        &self.slots
    }
}

/// `dx = (sigmoid(x) - t) · dy`, scaled by the reduction.
#[derive(Debug)]
pub struct SigmoidCrossEntropyBackward {
    reduction: Reduction,
    devices: Vec<Device>,
    z: GraphStorage,
    t: GraphStorage,
    upstream: Vec<GraphStorage>,
    grad: GradientOutput,
}

impl SigmoidCrossEntropyBackward {
    pub fn new(ctx: &ExecutionContext, reduction: Reduction) -> Self {
        Self {
            reduction,
            devices: ctx.devices(),
            z: GraphStorage::new(),
            t: GraphStorage::new(),
            upstream: Vec::new(),
            grad: GradientOutput::default(),
        }
    }
}

impl Operation for SigmoidCrossEntropyBackward {
    fn name(&self) -> &str {
        "SigmoidCrossEntropyBackward"
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        let bw = backward_inputs("SigmoidCrossEntropyBackward", inputs)?;
        let x = slot("SigmoidCrossEntropyBackward", &bw.forward, SlotKey::Named("x"))?;
        self.z = slot("SigmoidCrossEntropyBackward", &bw.forward, SlotKey::Named("z"))?;
        self.t = slot("SigmoidCrossEntropyBackward", &bw.forward, SlotKey::Named("t"))?;
        self.grad.bind(&x, &self.devices);
        self.upstream = bw.upstream;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        let out_shape = self.reduction.output_shape(&self.z.shape());
        for device in &self.devices {
            let dy = loss_upstream(&self.upstream, *device, &out_shape)?;
            let dx = &*self.z.get(*device)? - &*self.t.get(*device)?;
            self.grad
                .storage()
                .write(*device, self.reduction.backpropagate(dx, &dy));
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        self.grad.slots()
    }
}

/// Mean squared error between a prediction and a target.
#[derive(Debug, Default)]
pub struct MeanSquared {
    state: FactoryState,
    reduction: Reduction,
}

impl MeanSquared {
    pub fn new(reduction: Reduction) -> Self {
        Self {
            state: FactoryState::default(),
            reduction,
        }
    }

    /// Parses `"mean"`, `"sum"` or `"none"`.
    pub fn with_reduction_name(name: &str) -> Result<Self, ConfigurationError> {
        let reduction = name
            .parse()
            .map_err(|_| ConfigurationError::UnknownReduction(name.to_string()))?;
        Ok(Self::new(reduction))
    }
}

impl GraphFactory for MeanSquared {
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
                op: "MeanSquared".to_string(),
                expected: 2,
                got: inputs.len(),
            }
            .into());
        }
        let ctx = graph.context().clone();
        graph.add_element(
            Box::new(MeanSquaredForward::new(&ctx, self.reduction)),
            vec![Box::new(MeanSquaredBackward::new(&ctx, self.reduction))],
            inputs,
        )
    }
}

/// Sums its input. Used to drive gradients of a whole subgraph.
#[derive(Debug, Default)]
pub struct ConstantLoss {
    state: FactoryState,
}

impl ConstantLoss {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphFactory for ConstantLoss {
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
                op: "ConstantLoss".to_string(),
                expected: 1,
                got: inputs.len(),
            }
            .into());
        }
        let ctx = graph.context().clone();
        graph.add_element(
            Box::new(ConstantLossForward::new(&ctx)),
            vec![Box::new(ConstantLossBackward::new(&ctx))],
            inputs,
        )
    }
}

/// Sigmoid cross entropy between logits and binary targets.
#[derive(Debug, Default)]
pub struct SigmoidCrossEntropy {
    state: FactoryState,
    reduction: Reduction,
}

impl SigmoidCrossEntropy {
    pub fn new(reduction: Reduction) -> Self {
        Self {
            state: FactoryState::default(),
            reduction,
        }
    }

    pub fn with_reduction_name(name: &str) -> Result<Self, ConfigurationError> {
        let reduction = name
            .parse()
            .map_err(|_| ConfigurationError::UnknownReduction(name.to_string()))?;
        Ok(Self::new(reduction))
    }
}

impl GraphFactory for SigmoidCrossEntropy {
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
                op: "SigmoidCrossEntropy".to_string(),
                expected: 2,
                got: inputs.len(),
            }
            .into());
        }
        let ctx = graph.context().clone();
        graph.add_element(
            Box::new(SigmoidCrossEntropyForward::new(&ctx, self.reduction)),
            vec![Box::new(SigmoidCrossEntropyBackward::new(&ctx, self.reduction))],
            inputs,
        )
    }
}
