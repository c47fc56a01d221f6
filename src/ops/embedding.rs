use ndarray::{ArrayD, Axis, IxDyn};
use std::collections::BTreeMap;

use crate::device::{Device, ExecutionContext};
use crate::graph::element::{ComputationGraph, ElementId, ElementKind, GraphInput};
use crate::graph::factory::{FactoryState, GraphFactory, GraphFactoryExt};
use crate::graph::operation::{Operation, SlotKey, Slots, input_slot, sum_gradients};
use crate::graph::{ConfigurationError, GraphError, ShapeError};
use crate::initializer::Initializer;
use crate::ops::bias::Bias;
use crate::ops::{GradientOutput, backward_inputs, slot};
use crate::storage::GraphStorage;

/// Row indices held by a `[rows, 1]` array of integral floats.
fn indices(x: &ArrayD<f32>, size: usize) -> Result<Vec<usize>, ConfigurationError> {
    x.iter()
        .map(|value| {
            if value.fract() != 0.0 || *value < 0.0 {
                return Err(ConfigurationError::IntegerInputRequired {
                    op: "Embedding".to_string(),
                });
            }
            let index = *value as usize;
            if index >= size {
                return Err(ConfigurationError::IndexOutOfRange {
                    op: "Embedding".to_string(),
                    index,
                    size,
                });
            }
            Ok(index)
        })
        .collect()
}

/// Looks up row `x[i]` of `w: [input_size, output_size]` for every input row.
///
/// Inputs are `[w, x]` so that the single backward operation lines up with the weight.
#[derive(Debug)]
pub struct EmbeddingForward {
    input_size: usize,
    output_size: usize,
    initializer: Initializer,
    devices: Vec<Device>,
    x: GraphStorage,
    w: GraphStorage,
    y: GraphStorage,
    slots: Slots,
}

impl EmbeddingForward {
    pub fn new(
        ctx: &ExecutionContext,
        input_size: usize,
        output_size: usize,
        initializer: Initializer,
    ) -> Self {
        let y = GraphStorage::new();
        Self {
            input_size,
            output_size,
            initializer,
            devices: ctx.devices(),
            x: GraphStorage::new(),
            w: GraphStorage::new(),
            slots: Slots::from([(SlotKey::Output, y.clone())]),
            y,
        }
    }
}

impl Operation for EmbeddingForward {
    fn name(&self) -> &str {
        "Embedding"
    }

    fn setup(&mut self, inputs: &[Slots], ctx: &ExecutionContext) -> Result<(), GraphError> {
        let w = input_slot("Embedding", inputs, 0, SlotKey::Output)?;
        let x = input_slot("Embedding", inputs, 1, SlotKey::Output)?;
        let shape = x.shape();
        if shape.len() != 2 || shape[1] != 1 {
            return Err(ShapeError::FeatureColumns {
                op: "Embedding".to_string(),
                expected: 1,
                shape,
            }
            .into());
        }
        if x.is_allocated() {
            indices(&x.to_array()?, self.input_size)?;
        }
        w.init_parameter(
            &[self.input_size, self.output_size],
            &self.devices,
            &self.initializer,
            ctx,
        )?;
        self.y.init(&[shape[0], self.output_size], &self.devices);
        self.slots.insert(SlotKey::Named("x"), x.clone());
        self.slots.insert(SlotKey::Named("w"), w.clone());
        self.x = x;
        self.w = w;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        for device in &self.devices {
            let rows = indices(&*self.x.get(*device)?, self.input_size)?;
            let out = self.w.get(*device)?.select(Axis(0), &rows);
            self.y.write(*device, out);
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        &self.slots
    }
}

/// Scatter-adds each output gradient row into the weight row it was looked up from.
#[derive(Debug)]
pub struct EmbeddingBackward {
    input_size: usize,
    devices: Vec<Device>,
    x: GraphStorage,
    y_shape: Vec<usize>,
    upstream: Vec<GraphStorage>,
    grad: GradientOutput,
}

impl EmbeddingBackward {
    pub fn new(ctx: &ExecutionContext, input_size: usize) -> Self {
        Self {
            input_size,
            devices: ctx.devices(),
            x: GraphStorage::new(),
            y_shape: Vec::new(),
            upstream: Vec::new(),
            grad: GradientOutput::default(),
        }
    }
}

impl Operation for EmbeddingBackward {
    fn name(&self) -> &str {
        "EmbeddingBackward"
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        let bw = backward_inputs("EmbeddingBackward", inputs)?;
        let w = slot("EmbeddingBackward", &bw.forward, SlotKey::Named("w"))?;
        self.x = slot("EmbeddingBackward", &bw.forward, SlotKey::Named("x"))?;
        self.grad.bind(&w, &self.devices);
        self.y_shape = bw.y.shape();
        self.upstream = bw.upstream;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        let shape = self.grad.storage().shape();
        for device in &self.devices {
            let dy = sum_gradients(&self.upstream, *device, &self.y_shape)?;
            let rows = indices(&*self.x.get(*device)?, self.input_size)?;
            let mut dw = ArrayD::zeros(IxDyn(&shape));
            for (row, index) in rows.into_iter().enumerate() {
                let mut target = dw.index_axis_mut(Axis(0), index);
                target += &dy.index_axis(Axis(0), row);
            }
            self.grad.storage().write(*device, dw);
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        self.grad.slots()
    }
}

/// Maps integer ids to learned vectors, followed by a [`Bias`] child sharing the output width.
#[derive(Debug)]
pub struct Embedding {
    state: FactoryState,
    input_size: usize,
    output_size: usize,
    initializer: Initializer,
    bias: Bias,
}

impl Embedding {
    pub fn new(input_size: usize, output_size: usize) -> Self {
        let mut state = FactoryState::default();
        state.declare("w");
        Self {
            state,
            input_size,
            output_size,
            initializer: Initializer::default(),
            bias: Bias::default(),
        }
    }

    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }
}

impl GraphFactory for Embedding {
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
                op: "Embedding".to_string(),
                expected: 1,
                got: inputs.len(),
            }
            .into());
        };
        for (name, size) in [("input_size", self.input_size), ("output_size", self.output_size)] {
            if size == 0 {
                return Err(ConfigurationError::InvalidHyperparameter {
                    name: name.to_string(),
                    value: 0.0,
                }
                .into());
            }
        }
        // Values known at build time are checked now; dispatched data is checked in setup.
        match input {
            GraphInput::Array(array) => {
                indices(array, self.input_size)?;
            }
            GraphInput::Element(id) => {
                if graph.element(*id)?.kind() == ElementKind::StaticInput {
                    indices(&graph.value(*id)?, self.input_size)?;
                }
            }
        }
        let ctx = graph.context().clone();
        let w = graph.variable(self.state.declare("w"))?;
        let element = graph.add_element(
            Box::new(EmbeddingForward::new(
                &ctx,
                self.input_size,
                self.output_size,
                self.initializer.clone(),
            )),
            vec![Box::new(EmbeddingBackward::new(&ctx, self.input_size))],
            &[w.into(), input.clone()],
        )?;
        self.bias.call(graph, &[element.into()])
    }

    fn children(&self) -> Vec<(&str, &dyn GraphFactory)> {
        vec![("bias", &self.bias as &dyn GraphFactory)]
    }

    fn children_mut(&mut self) -> Vec<(&str, &mut dyn GraphFactory)> {
        vec![("bias", &mut self.bias as &mut dyn GraphFactory)]
    }

    fn serialized_attributes(&self) -> BTreeMap<String, ArrayD<f32>> {
        BTreeMap::from([(
            "sizes".to_string(),
            ndarray::arr1(&[self.input_size as f32, self.output_size as f32]).into_dyn(),
        )])
    }

    fn load_attribute(&mut self, name: &str, value: ArrayD<f32>) -> Result<(), GraphError> {
        match (name, value.as_slice()) {
            ("sizes", Some(&[input_size, output_size])) => {
                self.input_size = input_size as usize;
                self.output_size = output_size as usize;
                Ok(())
            }
            _ => Err(GraphError::StructureMismatch {
                path: format!("{}{name}", crate::graph::factory::ATTRIBUTE_PREFIX),
            }),
        }
    }
}
