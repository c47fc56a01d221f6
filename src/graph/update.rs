use crate::device::ExecutionContext;
use crate::graph::GraphError;
use crate::graph::operation::{Operation, Slots, gradient_sources, sum_gradients};
use crate::optimizer::Optimizer;
use crate::storage::GraphStorage;

/// Gradient-phase operation that applies one optimizer step to a parameter.
///
/// The optimizer is chosen per step: the parameter's own tag, then the default handed in by
/// the caller, then plain SGD. Optimizer moments are kept on the parameter storage.
#[derive(Debug)]
pub struct UpdateOperation {
    param: GraphStorage,
    default_optimizer: Option<Optimizer>,
    grads: Vec<GraphStorage>,
    slots: Slots,
}

impl UpdateOperation {
    pub fn new(param: GraphStorage) -> Self {
        Self {
            param,
            default_optimizer: None,
            grads: Vec::new(),
            slots: Slots::new(),
        }
    }

    pub fn param(&self) -> &GraphStorage {
        &self.param
    }
}

impl Operation for UpdateOperation {
    fn name(&self) -> &str {
        "Update"
    }

    fn setup(&mut self, inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        self.grads = gradient_sources(inputs, self.param.id());
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        if !self.param.updatable() || self.grads.is_empty() {
            return Ok(());
        }
        let optimizer = self
            .param
            .optimizer()
            .or(self.default_optimizer)
            .unwrap_or_default();
        let decay = self.param.decay();
        let shape = self.param.shape();
        for device in self.param.devices() {
            let mut grad = sum_gradients(&self.grads, device, &shape)?;
            self.param.update_with(device, |value, state| {
                if let Some(decay) = decay {
                    decay.apply(value, &mut grad);
                }
                *value -= &optimizer.delta(state, &grad);
            })?;
        }
        Ok(())
    }

    fn slots(&self) -> &Slots {
        &self.slots
    }

    fn set_default_optimizer(&mut self, optimizer: Option<Optimizer>) {
        self.default_optimizer = optimizer;
    }
}
