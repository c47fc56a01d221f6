use serde::{Deserialize, Serialize};

use crate::device::{Device, ExecutionContext, handles};
use crate::graph::element::{ComputationGraph, ElementId, GraphInput};
use crate::graph::factory::{FactoryState, GraphFactory};
use crate::graph::operation::{Operation, SlotKey, Slots, input_slot, sum_gradients};
use crate::graph::{ConfigurationError, GraphError};
use crate::ops::{GradientOutput, backward_inputs, slot};
use crate::storage::GraphStorage;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ActivationKind {
    Relu,
    Sigmoid,
    Tanh,
    Selu,
}

const SELU_ALPHA: f32 = 1.673_263_2;
const SELU_LAMBDA: f32 = 1.050_701;

impl ActivationKind {
    fn apply(self, x: f32) -> f32 {
        match self {
            ActivationKind::Relu => x.max(0.0),
            ActivationKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActivationKind::Tanh => x.tanh(),
            ActivationKind::Selu => {
                if x > 0.0 {
                    SELU_LAMBDA * x
                } else {
                    SELU_LAMBDA * SELU_ALPHA * (x.exp() - 1.0)
                }
            }
        }
    }

    /// Derivative expressed through the forward output.
    fn derivative(self, y: f32) -> f32 {
        match self {
            ActivationKind::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            ActivationKind::Sigmoid => y * (1.0 - y),
            ActivationKind::Tanh => 1.0 - y * y,
            // y = λα(eˣ - 1) below zero, so dy/dx = λαeˣ = y + λα
            ActivationKind::Selu => {
                if y > 0.0 {
                    SELU_LAMBDA
                } else {
                    y + SELU_LAMBDA * SELU_ALPHA
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct ActivationForward {
    kind: ActivationKind,
    devices: Vec<Device>,
    x: GraphStorage,
    y: GraphStorage,
    slots: Slots,
}

impl ActivationForward {
    pub fn new(ctx: &ExecutionContext, kind: ActivationKind) -> Self {
        let y = GraphStorage::new();
        Self {
            kind,
            devices: ctx.devices(),
            x: GraphStorage::new(),
            slots: Slots::from([(SlotKey::Output, y.clone())]),
            y,
        }
    }
}

impl Operation for ActivationForward {
    fn name(&self) -> &str {
        "Activation"
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        let x = input_slot("Activation", inputs, 0, SlotKey::Output)?;
        self.y.init(&x.shape(), &self.devices);
        self.slots.insert(SlotKey::Named("x"), x.clone());
        self.x = x;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        let kind = self.kind;
        for (device, handle) in handles(&self.devices) {
            let out = handle.map(&*self.x.get(device)?, move |x| kind.apply(x));
            self.y.write(device, out);
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        &self.slots
    }
}

#[derive(Debug)]
pub struct ActivationBackward {
    kind: ActivationKind,
    devices: Vec<Device>,
    y: GraphStorage,
    upstream: Vec<GraphStorage>,
    grad: GradientOutput,
}

impl ActivationBackward {
    pub fn new(ctx: &ExecutionContext, kind: ActivationKind) -> Self {
        Self {
            kind,
            devices: ctx.devices(),
            y: GraphStorage::new(),
            upstream: Vec::new(),
            grad: GradientOutput::default(),
        }
    }
}

impl Operation for ActivationBackward {
    fn name(&self) -> &str {
        "ActivationBackward"
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        let bw = backward_inputs("ActivationBackward", inputs)?;
        let x = slot("ActivationBackward", &bw.forward, SlotKey::Named("x"))?;
        self.grad.bind(&x, &self.devices);
        self.y = bw.y;
        self.upstream = bw.upstream;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        let kind = self.kind;
        let shape = self.y.shape();
        for (device, handle) in handles(&self.devices) {
            let dy = sum_gradients(&self.upstream, device, &shape)?;
            let dx = handle.zip_map(
                "ActivationBackward",
                &dy,
                &*self.y.get(device)?,
                move |g, y| g * kind.derivative(y),
            )?;
            self.grad.storage().write(device, dx);
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        self.grad.slots()
    }
}

/// Element-wise non-linearity. Has no parameters.
#[derive(Debug)]
pub struct Activation {
    state: FactoryState,
    kind: ActivationKind,
}

impl Activation {
    pub fn new(kind: ActivationKind) -> Self {
        Self {
            state: FactoryState::default(),
            kind,
        }
    }

    pub fn kind(&self) -> ActivationKind {
        self.kind
    }
}

impl GraphFactory for Activation {
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
                op: self.kind.to_string(),
                expected: 1,
                got: inputs.len(),
            }
            .into());
        }
        let ctx = graph.context().clone();
        graph.add_element(
            Box::new(ActivationForward::new(&ctx, self.kind)),
            vec![Box::new(ActivationBackward::new(&ctx, self.kind))],
            inputs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse() {
        assert_eq!("ReLU".parse::<ActivationKind>().unwrap(), ActivationKind::Relu);
        assert_eq!("tanh".parse::<ActivationKind>().unwrap(), ActivationKind::Tanh);
        assert!("swish".parse::<ActivationKind>().is_err());
        assert_eq!(ActivationKind::Sigmoid.to_string(), "sigmoid");
    }

    #[test]
    fn test_derivatives_through_output() {
        let y = ActivationKind::Sigmoid.apply(0.0);
        assert_eq!(y, 0.5);
        assert_eq!(ActivationKind::Sigmoid.derivative(y), 0.25);
        assert_eq!(ActivationKind::Relu.derivative(ActivationKind::Relu.apply(-2.0)), 0.0);
        assert_eq!(ActivationKind::Tanh.derivative(ActivationKind::Tanh.apply(0.0)), 1.0);
    }

    #[test]
    fn test_selu_matches_finite_differences() {
        let kind = ActivationKind::Selu;
        assert_eq!("selu".parse::<ActivationKind>().unwrap(), kind);
        assert_eq!(kind.apply(2.0), 2.0 * SELU_LAMBDA);
        for x in [-2.0f32, -0.5, 0.5, 1.5] {
            let h = 1e-3;
            let numeric = (kind.apply(x + h) - kind.apply(x - h)) / (2.0 * h);
            let analytic = kind.derivative(kind.apply(x));
            assert!((numeric - analytic).abs() < 1e-2, "{x}: {numeric} vs {analytic}");
        }
    }

    #[test]
    fn test_selu_gradient_through_graph() -> anyhow::Result<()> {
        use crate::graph::factory::GraphFactoryExt;
        use crate::ops::loss::ConstantLoss;

        let mut graph = ComputationGraph::new(ExecutionContext::cpu().with_seed(3));
        let x = graph.static_input(ndarray::array![[-1.0f32, 0.0, 2.0]].into_dyn());
        let y = Activation::new(ActivationKind::Selu).call(&mut graph, &[x.into()])?;
        let out = graph.forward(y)?;
        let below = SELU_LAMBDA * SELU_ALPHA * ((-1.0f32).exp() - 1.0);
        assert!((out[[0, 0]] - below).abs() < 1e-6);
        assert_eq!(out[[0, 2]], 2.0 * SELU_LAMBDA);

        let loss = ConstantLoss::new().call(&mut graph, &[y.into()])?;
        let grad = graph.gradient(loss, &graph.storage(x)?)?;
        let slope = SELU_LAMBDA * SELU_ALPHA * (-1.0f32).exp();
        assert!((grad[[0, 0]] - slope).abs() < 1e-5);
        assert!((grad[[0, 2]] - SELU_LAMBDA).abs() < 1e-6);
        Ok(())
    }
}
