use crate::graph::element::{ComputationGraph, ElementId, GraphInput};
use crate::graph::factory::{FactoryState, GraphFactory, GraphFactoryExt};
use crate::graph::{ConfigurationError, GraphError};

/// Chains factories, feeding each one's output into the next. Children are named `"0"`, `"1"`, ...
#[derive(Debug, Default)]
pub struct Sequential {
    state: FactoryState,
    names: Vec<String>,
    layers: Vec<Box<dyn GraphFactory>>,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn GraphFactory>>) -> Self {
        let mut sequential = Self::default();
        for layer in layers {
            sequential.push(layer);
        }
        sequential
    }

    pub fn push(&mut self, layer: Box<dyn GraphFactory>) {
        self.names.push(self.layers.len().to_string());
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, index: usize) -> Option<&dyn GraphFactory> {
        self.layers.get(index).map(|x| x.as_ref())
    }
}

impl GraphFactory for Sequential {
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
        if self.layers.is_empty() {
            return Err(ConfigurationError::InputCount {
                op: "Sequential".to_string(),
                expected: 1,
                got: 0,
            }
            .into());
        }
        let mut current = inputs.to_vec();
        let mut last = None;
        for layer in self.layers.iter_mut() {
            let element = layer.call(graph, &current)?;
            current = vec![element.into()];
            last = Some(element);
        }
        last.ok_or_else(|| {
            ConfigurationError::InputCount {
                op: "Sequential".to_string(),
                expected: 1,
                got: 0,
            }
            .into()
        })
    }

    fn children(&self) -> Vec<(&str, &dyn GraphFactory)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.layers.iter().map(|x| x.as_ref()))
            .collect()
    }

    fn children_mut(&mut self) -> Vec<(&str, &mut dyn GraphFactory)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.layers.iter_mut().map(|x| x.as_mut() as &mut dyn GraphFactory))
            .collect()
    }
}
