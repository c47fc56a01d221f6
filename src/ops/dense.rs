use ndarray::ArrayD;
use std::collections::BTreeMap;

use crate::device::{Device, ExecutionContext, handles};
use crate::graph::element::{ComputationGraph, ElementId, GraphInput};
use crate::graph::factory::{FactoryState, GraphFactory, GraphFactoryExt};
use crate::graph::operation::{Operation, SlotKey, Slots, input_slot, sum_gradients};
use crate::graph::{ConfigurationError, GraphError};
use crate::initializer::Initializer;
use crate::ops::bias::Bias;
use crate::ops::{GradientOutput, backward_inputs, require_rank, slot};
use crate::storage::GraphStorage;

/// `y = x · w` for `x: [rows, cols]`, allocating `w: [cols, units]` on first setup.
#[derive(Debug)]
pub struct DenseForward {
    devices: Vec<Device>,
    units: usize,
    initializer: Initializer,
    x: GraphStorage,
    w: GraphStorage,
    y: GraphStorage,
    slots: Slots,
}

impl DenseForward {
    pub fn new(ctx: &ExecutionContext, units: usize, initializer: Initializer) -> Self {
        let y = GraphStorage::new();
        Self {
            devices: ctx.devices(),
            units,
            initializer,
            x: GraphStorage::new(),
            w: GraphStorage::new(),
            slots: Slots::from([(SlotKey::Output, y.clone())]),
            y,
        }
    }
}

impl Operation for DenseForward {
    fn name(&self) -> &str {
        "Dense"
    }

    fn setup(&mut self, inputs: &[Slots], ctx: &ExecutionContext) -> Result<(), GraphError> {
        let x = input_slot("Dense", inputs, 0, SlotKey::Output)?;
        let w = input_slot("Dense", inputs, 1, SlotKey::Output)?;
        let shape = require_rank("Dense", &x, 2)?;
        w.init_parameter(&[shape[1], self.units], &self.devices, &self.initializer, ctx)?;
        if self.y.init(&[shape[0], self.units], &self.devices) {
            log::trace!("Dense output resized to {:?}", self.y.shape());
        }
        self.slots.insert(SlotKey::Named("x"), x.clone());
        self.slots.insert(SlotKey::Named("w"), w.clone());
        self.x = x;
        self.w = w;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        for (device, handle) in handles(&self.devices) {
            let out = handle.matmul(
                "Dense",
                &*self.x.get(device)?,
                false,
                &*self.w.get(device)?,
                false,
            )?;
            self.y.write(device, out);
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        &self.slots
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenseInput {
    X,
    W,
}

/// `dx = dy · wᵀ` or `dw = xᵀ · dy`.
#[derive(Debug)]
pub struct DenseBackward {
    wrt: DenseInput,
    devices: Vec<Device>,
    x: GraphStorage,
    w: GraphStorage,
    y_shape: Vec<usize>,
    upstream: Vec<GraphStorage>,
    grad: GradientOutput,
}

impl DenseBackward {
    pub fn new(ctx: &ExecutionContext, wrt: DenseInput) -> Self {
        Self {
            wrt,
            devices: ctx.devices(),
            x: GraphStorage::new(),
            w: GraphStorage::new(),
            y_shape: Vec::new(),
            upstream: Vec::new(),
            grad: GradientOutput::default(),
        }
    }
}

impl Operation for DenseBackward {
    fn name(&self) -> &str {
        "DenseBackward"
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        let bw = backward_inputs("DenseBackward", inputs)?;
        self.x = slot("DenseBackward", &bw.forward, SlotKey::Named("x"))?;
        self.w = slot("DenseBackward", &bw.forward, SlotKey::Named("w"))?;
        match self.wrt {
            DenseInput::X => self.grad.bind(&self.x, &self.devices),
            DenseInput::W => self.grad.bind(&self.w, &self.devices),
        }
        self.y_shape = bw.y.shape();
        self.upstream = bw.upstream;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        for (device, handle) in handles(&self.devices) {
            let dy = sum_gradients(&self.upstream, device, &self.y_shape)?;
            let grad: ArrayD<f32> = match self.wrt {
                DenseInput::X => {
                    handle.matmul("DenseBackward", &dy, false, &*self.w.get(device)?, true)?
                }
                DenseInput::W => {
                    handle.matmul("DenseBackward", &*self.x.get(device)?, true, &dy, false)?
                }
            };
            self.grad.storage().write(device, grad);
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        self.grad.slots()
    }
}

/// Fully connected layer with parameter `w` and an optional [`Bias`] child.
#[derive(Debug)]
pub struct Dense {
    state: FactoryState,
    units: usize,
    initializer: Initializer,
    bias: Option<Bias>,
}

impl Dense {
    pub fn new(units: usize) -> Self {
        let mut state = FactoryState::default();
        state.declare("w");
        Self {
            state,
            units,
            initializer: Initializer::default(),
            bias: Some(Bias::default()),
        }
    }

    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self
    }

    pub fn units(&self) -> usize {
        self.units
    }

    pub fn bias(&self) -> Option<&Bias> {
        self.bias.as_ref()
    }
}

impl GraphFactory for Dense {
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
                op: "Dense".to_string(),
                expected: 1,
                got: inputs.len(),
            }
            .into());
        };
        if self.units == 0 {
            return Err(ConfigurationError::InvalidHyperparameter {
                name: "units".to_string(),
                value: 0.0,
            }
            .into());
        }
        let ctx = graph.context().clone();
        let w = graph.variable(self.state.declare("w"))?;
        let element = graph.add_element(
            Box::new(DenseForward::new(&ctx, self.units, self.initializer.clone())),
            vec![
                Box::new(DenseBackward::new(&ctx, DenseInput::X)),
                Box::new(DenseBackward::new(&ctx, DenseInput::W)),
            ],
            &[input.clone(), w.into()],
        )?;
        match self.bias.as_mut() {
            Some(bias) => bias.call(graph, &[element.into()]),
            None => Ok(element),
        }
    }

    fn children(&self) -> Vec<(&str, &dyn GraphFactory)> {
        match &self.bias {
            Some(bias) => vec![("bias", bias as &dyn GraphFactory)],
            None => Vec::new(),
        }
    }

    fn children_mut(&mut self) -> Vec<(&str, &mut dyn GraphFactory)> {
        match &mut self.bias {
            Some(bias) => vec![("bias", bias as &mut dyn GraphFactory)],
            None => Vec::new(),
        }
    }

    fn serialized_attributes(&self) -> BTreeMap<String, ArrayD<f32>> {
        BTreeMap::from([(
            "units".to_string(),
            ndarray::arr1(&[self.units as f32]).into_dyn(),
        )])
    }

    fn load_attribute(&mut self, name: &str, value: ArrayD<f32>) -> Result<(), GraphError> {
        match (name, value.iter().next()) {
            ("units", Some(units)) => {
                self.units = *units as usize;
                Ok(())
            }
            _ => Err(GraphError::StructureMismatch {
                path: format!("{}{name}", crate::graph::factory::ATTRIBUTE_PREFIX),
            }),
        }
    }
}
