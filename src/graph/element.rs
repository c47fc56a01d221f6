//! Graph elements: a forward node, its backward nodes and the gradient-update nodes for the
//! parameters it consumes, all living in one [`ComputationGraph`] arena.
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use crate::device::{Device, ExecutionContext};
use crate::graph::executor::{CallList, ExecutionMode, Executor};
use crate::graph::node::{DependencyGraph, NodeId};
use crate::graph::operation::{Dispatcher, OpRole, Operation, Phase, SlotKey, Slots};
use crate::graph::update::UpdateOperation;
use crate::graph::{GraphError, ShapeError};
use crate::ops::variable::{StaticInput, VariableInput};
use crate::optimizer::Optimizer;
use crate::storage::GraphStorage;

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct ElementId {
    inner: usize,
}

/// Ownership marker carried by nodes. Factories build under a pending tag and retag to the
/// element they produced once wiring is complete.
#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq)]
pub enum OwnerTag {
    Pending(u64),
    Element(ElementId),
}

#[derive(Debug)]
pub struct OperationalNode {
    pub op: Box<dyn Operation>,
    pub phase: Phase,
    pub tags: BTreeSet<OwnerTag>,
    /// Upstream forward nodes in argument order, repeats kept. Arena edges are deduplicated,
    /// so forward `setup` reads its inputs from here.
    pub operands: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Operation,
    Variable,
    StaticInput,
    Dispatcher,
}

#[derive(Debug, Clone)]
pub struct UserGraph {
    fwd: NodeId,
    bwd: Vec<NodeId>,
    updates: Vec<(usize, NodeId)>,
    inputs: Vec<ElementId>,
    kind: ElementKind,
    finalized: bool,
}

impl UserGraph {
    pub fn forward_node(&self) -> NodeId {
        self.fwd
    }

    /// Backward node `k` produces the gradient for input `k`.
    pub fn backward_nodes(&self) -> &[NodeId] {
        &self.bwd
    }

    pub fn update_nodes(&self) -> &[(usize, NodeId)] {
        &self.updates
    }

    pub fn inputs(&self) -> &[ElementId] {
        &self.inputs
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

#[derive(Debug, Clone)]
pub enum GraphInput {
    Element(ElementId),
    Array(ArrayD<f32>),
}

impl From<ElementId> for GraphInput {
    fn from(value: ElementId) -> Self {
        GraphInput::Element(value)
    }
}

impl From<&ElementId> for GraphInput {
    fn from(value: &ElementId) -> Self {
        GraphInput::Element(*value)
    }
}

impl From<ArrayD<f32>> for GraphInput {
    fn from(value: ArrayD<f32>) -> Self {
        GraphInput::Array(value)
    }
}

#[derive(Debug)]
pub struct ComputationGraph {
    ctx: ExecutionContext,
    nodes: DependencyGraph<OperationalNode>,
    elements: HashMap<ElementId, UserGraph>,
    next_element_id: usize,
    next_pending_tag: u64,
    tag_stack: Vec<OwnerTag>,
}

impl Default for ComputationGraph {
    fn default() -> Self {
        Self::new(ExecutionContext::default())
    }
}

struct BackwardPlan {
    forward: Vec<NodeId>,
    backward: Vec<NodeId>,
    updates: Vec<NodeId>,
}

impl ComputationGraph {
    pub fn new(ctx: ExecutionContext) -> Self {
        Self {
            ctx,
            nodes: DependencyGraph::new(),
            elements: HashMap::new(),
            next_element_id: 0,
            next_pending_tag: 0,
            tag_stack: Vec::new(),
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn devices(&self) -> Vec<Device> {
        self.ctx.devices()
    }

    pub fn nodes(&self) -> &DependencyGraph<OperationalNode> {
        &self.nodes
    }

    pub fn element(&self, id: ElementId) -> Result<&UserGraph, GraphError> {
        self.elements.get(&id).ok_or(GraphError::UnknownElement(id))
    }

    /// Element ids in creation order.
    pub fn element_ids(&self) -> Vec<ElementId> {
        let mut ids: Vec<_> = self.elements.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Starts a construction scope: every node added until [`Self::pop_tag`] carries the tag.
    pub fn push_pending_tag(&mut self) -> OwnerTag {
        let tag = OwnerTag::Pending(self.next_pending_tag);
        self.next_pending_tag += 1;
        self.tag_stack.push(tag);
        tag
    }

    pub fn pop_tag(&mut self, tag: OwnerTag) {
        if let Some(position) = self.tag_stack.iter().rposition(|x| *x == tag) {
            self.tag_stack.remove(position);
        }
    }

    /// Drops every node still carrying `tag` along with the elements built on them. Used when
    /// a construction scope fails half way.
    pub fn discard_pending(&mut self, tag: OwnerTag) -> Result<usize, GraphError> {
        let mut doomed = HashSet::new();
        for id in self.nodes.node_ids() {
            if self.nodes.get(id)?.tags.contains(&tag) {
                doomed.insert(id);
            }
        }
        for id in &doomed {
            self.nodes.remove_node(*id)?;
        }
        self.elements.retain(|_, element| !doomed.contains(&element.fwd));
        log::debug!("Discarded {} node(s) left by a failed build under {tag:?}", doomed.len());
        Ok(doomed.len())
    }

    fn add_op_node(&mut self, op: Box<dyn Operation>, phase: Phase) -> NodeId {
        let tags = self.tag_stack.iter().copied().collect();
        self.nodes.add_node(OperationalNode {
            op,
            phase,
            tags,
            operands: Vec::new(),
        })
    }

    fn resolve_inputs(&mut self, inputs: &[GraphInput]) -> Result<Vec<ElementId>, GraphError> {
        inputs
            .iter()
            .map(|input| match input {
                GraphInput::Element(id) => self.element(*id).map(|_| *id),
                GraphInput::Array(array) => Ok(self.static_input(array.clone())),
            })
            .collect()
    }

    /// Wires a new element behind `inputs`. Arrays become static inputs.
    pub fn add_element(
        &mut self,
        forward: Box<dyn Operation>,
        backward: Vec<Box<dyn Operation>>,
        inputs: &[GraphInput],
    ) -> Result<ElementId, GraphError> {
        let inputs = self.resolve_inputs(inputs)?;
        self.insert_element(forward, backward, inputs, ElementKind::Operation)
    }

    pub(crate) fn insert_element(
        &mut self,
        forward: Box<dyn Operation>,
        backward: Vec<Box<dyn Operation>>,
        inputs: Vec<ElementId>,
        kind: ElementKind,
    ) -> Result<ElementId, GraphError> {
        let name = forward.name().to_string();
        let fwd = self.add_op_node(forward, Phase::Forward);
        let mut operands = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let upstream = self.element(*input)?.fwd;
            self.nodes.add_input(fwd, upstream)?;
            operands.push(upstream);
        }
        self.nodes.get_mut(fwd)?.operands = operands;
        let bwd: Vec<NodeId> = backward
            .into_iter()
            .map(|op| self.add_op_node(op, Phase::Backward))
            .collect();
        for node in &bwd {
            self.nodes.add_input(*node, fwd)?;
        }
        let mut updates: Vec<(usize, NodeId)> = Vec::new();
        let mut update_of: HashMap<ElementId, NodeId> = HashMap::new();
        for (k, input) in inputs.iter().enumerate() {
            let Some(&grad_node) = bwd.get(k) else {
                continue;
            };
            let upstream = self.element(*input)?.clone();
            for upstream_bwd in &upstream.bwd {
                self.nodes.add_input(*upstream_bwd, grad_node)?;
            }
            if upstream.kind != ElementKind::Variable {
                continue;
            }
            // A parameter passed more than once gets one update summing every contribution.
            if let Some(&update) = update_of.get(input) {
                self.nodes.add_input(update, grad_node)?;
            } else {
                let param = self.output_storage(upstream.fwd)?;
                let update =
                    self.add_op_node(Box::new(UpdateOperation::new(param)), Phase::Gradient);
                self.nodes.add_input(update, grad_node)?;
                update_of.insert(*input, update);
                updates.push((k, update));
            }
        }
        let id = ElementId {
            inner: self.next_element_id,
        };
        self.next_element_id += 1;
        log::debug!(
            "Added {name} element {id:?}: {} input(s), {} backward node(s), {} update node(s)",
            inputs.len(),
            bwd.len(),
            updates.len()
        );
        self.elements.insert(
            id,
            UserGraph {
                fwd,
                bwd,
                updates,
                inputs,
                kind,
                finalized: false,
            },
        );
        Ok(id)
    }

    /// Exposes a persistent parameter storage as a trainable leaf.
    pub fn variable(&mut self, storage: GraphStorage) -> Result<ElementId, GraphError> {
        self.insert_element(
            Box::new(VariableInput::new(storage)),
            Vec::new(),
            Vec::new(),
            ElementKind::Variable,
        )
    }

    pub fn static_input(&mut self, array: ArrayD<f32>) -> ElementId {
        let op = StaticInput::new(GraphStorage::from_array(array, &self.ctx.devices()));
        let fwd = self.add_op_node(Box::new(op), Phase::Forward);
        let id = ElementId {
            inner: self.next_element_id,
        };
        self.next_element_id += 1;
        self.elements.insert(
            id,
            UserGraph {
                fwd,
                bwd: Vec::new(),
                updates: Vec::new(),
                inputs: Vec::new(),
                kind: ElementKind::StaticInput,
                finalized: false,
            },
        );
        id
    }

    pub fn output_storage(&self, node: NodeId) -> Result<GraphStorage, GraphError> {
        let node_ref = self.nodes.get(node)?;
        node_ref
            .op
            .slots()
            .get(&SlotKey::Output)
            .cloned()
            .ok_or_else(|| {
                ShapeError::MissingInput {
                    op: node_ref.op.name().to_string(),
                    slot: SlotKey::Output.to_string(),
                }
                .into()
            })
    }

    /// Runs `setup` on `node` against its predecessors' slots. Predecessors outside `active`
    /// contribute nothing.
    pub fn setup_node(
        &mut self,
        node: NodeId,
        active: Option<&HashSet<NodeId>>,
    ) -> Result<(), GraphError> {
        let entry = self.nodes.get(node)?;
        let sources = match entry.phase {
            Phase::Forward => entry.operands.clone(),
            _ => self.nodes.inputs(node)?.to_vec(),
        };
        let mut inputs = Vec::with_capacity(sources.len());
        for input in &sources {
            if active.is_some_and(|active| !active.contains(input)) {
                inputs.push(Slots::new());
            } else {
                inputs.push(self.nodes.get(*input)?.op.slots().clone());
            }
        }
        self.nodes.get_mut(node)?.op.setup(&inputs, &self.ctx)
    }

    pub fn perform_node(&mut self, node: NodeId) -> Result<(), GraphError> {
        let entry = self.nodes.get_mut(node)?;
        let start = Instant::now();
        entry.op.perform()?;
        log::trace!(
            "{} {:?} ({}) performed in {:?}",
            entry.op.name(),
            node,
            entry.phase,
            start.elapsed()
        );
        Ok(())
    }

    fn run_nodes(&mut self, order: &[NodeId], active: &HashSet<NodeId>) -> Result<(), GraphError> {
        for node in order {
            self.setup_node(*node, Some(active))?;
            self.perform_node(*node)?;
        }
        Ok(())
    }

    /// Evaluates `element` and everything it depends on, returning its output.
    pub fn forward(&mut self, element: ElementId) -> Result<ArrayD<f32>, GraphError> {
        let order = self.nodes.ancestors(self.element(element)?.fwd)?;
        let active = order.iter().copied().collect();
        self.run_nodes(&order, &active)?;
        self.value(element)
    }

    /// Current output of `element` without recomputing it.
    pub fn value(&self, element: ElementId) -> Result<ArrayD<f32>, GraphError> {
        Ok(self.output_storage(self.element(element)?.fwd)?.to_array()?)
    }

    pub fn storage(&self, element: ElementId) -> Result<GraphStorage, GraphError> {
        self.output_storage(self.element(element)?.fwd)
    }

    /// Rebinds the value of a static input or variable. Takes effect on the next forward.
    pub fn set_value(&mut self, element: ElementId, array: ArrayD<f32>) -> Result<(), GraphError> {
        let entry = self.element(element)?;
        if !matches!(entry.kind, ElementKind::StaticInput | ElementKind::Variable) {
            return Err(GraphError::NotAStaticInput(element));
        }
        self.output_storage(entry.fwd)?
            .set_value(array, &self.ctx.devices());
        Ok(())
    }

    fn forward_closure(&self, element: ElementId) -> Result<Vec<ElementId>, GraphError> {
        let forward: HashSet<_> = self
            .nodes
            .ancestors(self.element(element)?.fwd)?
            .into_iter()
            .collect();
        Ok(self
            .element_ids()
            .into_iter()
            .filter(|id| forward.contains(&self.elements[id].fwd))
            .collect())
    }

    fn sorted_by_depth(&self, mut nodes: Vec<NodeId>) -> Result<Vec<NodeId>, GraphError> {
        let mut keyed = Vec::with_capacity(nodes.len());
        for node in nodes.drain(..) {
            keyed.push((self.nodes.depth(node)?, node));
        }
        keyed.sort();
        Ok(keyed.into_iter().map(|(_, node)| node).collect())
    }

    fn backward_plan(&self, loss: ElementId) -> Result<BackwardPlan, GraphError> {
        let root = self.element(loss)?;
        if root.finalized {
            return Err(GraphError::Finalized(loss));
        }
        let forward = self.nodes.ancestors(root.fwd)?;
        let mut backward = Vec::new();
        let mut updates = Vec::new();
        for id in self.forward_closure(loss)? {
            let element = &self.elements[&id];
            backward.extend(element.bwd.iter().copied());
            updates.extend(element.updates.iter().map(|(_, node)| *node));
        }
        Ok(BackwardPlan {
            forward,
            backward: self.sorted_by_depth(backward)?,
            updates: self.sorted_by_depth(updates)?,
        })
    }

    fn run_backward(&mut self, plan: &BackwardPlan) -> Result<HashSet<NodeId>, GraphError> {
        let mut active: HashSet<NodeId> = plan.forward.iter().copied().collect();
        active.extend(plan.backward.iter().copied());
        self.run_nodes(&plan.forward, &active)?;
        self.run_nodes(&plan.backward, &active)?;
        Ok(active)
    }

    /// Runs forward then every backward node feeding gradients towards the inputs of `loss`.
    pub fn backward(&mut self, loss: ElementId) -> Result<(), GraphError> {
        let plan = self.backward_plan(loss)?;
        self.run_backward(&plan)?;
        Ok(())
    }

    /// Backward followed by one optimizer step on every parameter reached.
    pub fn update(
        &mut self,
        loss: ElementId,
        optimizer: Option<Optimizer>,
    ) -> Result<(), GraphError> {
        let plan = self.backward_plan(loss)?;
        let mut active = self.run_backward(&plan)?;
        active.extend(plan.updates.iter().copied());
        for node in &plan.updates {
            self.nodes.get_mut(*node)?.op.set_default_optimizer(optimizer);
        }
        self.run_nodes(&plan.updates, &active)
    }

    /// Gradient of `loss` with respect to `storage`, summed over every consumer.
    pub fn gradient(
        &mut self,
        loss: ElementId,
        storage: &GraphStorage,
    ) -> Result<ArrayD<f32>, GraphError> {
        let plan = self.backward_plan(loss)?;
        self.run_backward(&plan)?;
        let key = SlotKey::GradientOf(storage.id());
        let mut total: Option<ArrayD<f32>> = None;
        for node in &plan.backward {
            if let Some(grad) = self.nodes.get(*node)?.op.slots().get(&key) {
                let grad = grad.to_array()?;
                total = Some(match total {
                    Some(total) => total + grad,
                    None => grad,
                });
            }
        }
        total.ok_or(GraphError::NoGradient(storage.id()))
    }

    /// Moves every node reachable from `element` from tag `old` to tag `new`.
    pub fn replace_tags(
        &mut self,
        element: ElementId,
        old: OwnerTag,
        new: OwnerTag,
    ) -> Result<(), GraphError> {
        let entry = self.element(element)?;
        let mut starts = vec![entry.fwd];
        starts.extend(entry.bwd.iter().copied());
        for start in starts {
            self.nodes.walk(start, true, |_, node| {
                if node.tags.remove(&old) {
                    node.tags.insert(new);
                }
            })?;
        }
        Ok(())
    }

    pub fn set_inference(&mut self, tag: OwnerTag, inference: bool) -> Result<(), GraphError> {
        for id in self.nodes.node_ids() {
            let node = self.nodes.get_mut(id)?;
            if node.tags.contains(&tag) {
                node.op.set_inference(inference);
            }
        }
        Ok(())
    }

    /// Removes the gradient-update nodes carrying `tag`. Returns how many were removed.
    pub fn detach_updates(&mut self, tag: OwnerTag) -> Result<usize, GraphError> {
        let mut removed = HashSet::new();
        for id in self.nodes.node_ids() {
            let node = self.nodes.get(id)?;
            if node.phase == Phase::Gradient && node.tags.contains(&tag) {
                removed.insert(id);
            }
        }
        for id in &removed {
            self.nodes.remove_node(*id)?;
        }
        for element in self.elements.values_mut() {
            element.updates.retain(|(_, node)| !removed.contains(node));
        }
        log::debug!("Detached {} update node(s) tagged {tag:?}", removed.len());
        Ok(removed.len())
    }

    /// Drops the backward and update graphs of `element` and everything feeding it.
    /// Irreversible: a later backward through it fails with [`GraphError::Finalized`].
    pub fn finalize(&mut self, element: ElementId) -> Result<(), GraphError> {
        let closure = self.forward_closure(element)?;
        for id in closure {
            let Some(entry) = self.elements.get_mut(&id) else {
                continue;
            };
            let doomed: Vec<NodeId> = entry
                .bwd
                .drain(..)
                .chain(entry.updates.drain(..).map(|(_, node)| node))
                .collect();
            entry.finalized = true;
            let fwd = entry.fwd;
            for node in doomed {
                if self.nodes.contains(node) {
                    self.nodes.remove_node(node)?;
                }
            }
            self.nodes.get_mut(fwd)?.op.release();
        }
        log::debug!("Finalized {element:?}");
        Ok(())
    }

    pub fn dispatcher_mut(&mut self, node: NodeId) -> Result<&mut dyn Dispatcher, GraphError> {
        self.nodes
            .get_mut(node)?
            .op
            .as_dispatcher()
            .ok_or(GraphError::NotADispatcher(node))
    }

    /// Sum of the loss node's output.
    pub fn loss_value(&self, node: NodeId) -> Result<f32, GraphError> {
        Ok(self.output_storage(node)?.to_array()?.sum())
    }

    pub fn inference_executor(&mut self, target: ElementId) -> Result<Executor<'_>, GraphError> {
        self.executor(target, ExecutionMode::Inference, None)
    }

    /// Executor running forward, backward and gradient-update phases.
    /// `optimizer` applies to parameters without an optimizer of their own.
    pub fn training_executor(
        &mut self,
        loss: ElementId,
        optimizer: Option<Optimizer>,
    ) -> Result<Executor<'_>, GraphError> {
        self.executor(loss, ExecutionMode::Training, optimizer)
    }

    fn executor(
        &mut self,
        target: ElementId,
        mode: ExecutionMode,
        optimizer: Option<Optimizer>,
    ) -> Result<Executor<'_>, GraphError> {
        let root = self.element(target)?.clone();
        let mut members: HashSet<NodeId>;
        if mode == ExecutionMode::Training {
            let plan = self.backward_plan(target)?;
            members = plan.forward.iter().copied().collect();
            members.extend(plan.backward.iter().copied());
            members.extend(plan.updates.iter().copied());
            for node in &plan.updates {
                self.nodes.get_mut(*node)?.op.set_default_optimizer(optimizer);
            }
        } else {
            members = self.nodes.ancestors(root.fwd)?.into_iter().collect();
        }

        let mut calls = CallList::default();
        let visited = self
            .nodes
            .walk(root.fwd, true, |id, node| (id, node.phase))?
            .into_vec();
        for (id, phase) in visited {
            if members.contains(&id) {
                calls.push(phase, self.nodes.depth(id)?, id);
            }
        }
        for id in &members {
            if !calls.contains(*id) {
                let node = self.nodes.get(*id)?;
                log::debug!("{id:?} not reached by the walk, scheduling by recorded depth");
                calls.push(node.phase, self.nodes.depth(*id)?, *id);
            }
        }

        let mut dispatchers = Vec::new();
        let mut losses = Vec::new();
        for id in calls.phase_nodes(Phase::Forward) {
            let roles = self.nodes.get(id)?.op.roles();
            if roles.contains(&OpRole::Input) {
                dispatchers.push(id);
            }
            if roles.contains(&OpRole::Loss) {
                losses.push(id);
            }
        }
        dispatchers.sort();
        losses.sort_by_key(|id| (*id != root.fwd, *id));
        if dispatchers.is_empty() {
            log::warn!("Executor for {target:?} has no dispatchers, every epoch runs one step");
        }

        for phase in [Phase::Forward, Phase::Backward, Phase::Gradient] {
            for node in calls.phase_nodes(phase) {
                self.setup_node(node, Some(&members))?;
            }
        }
        log::debug!(
            "{mode:?} executor for {target:?}: {} call(s), {} dispatcher(s), {} loss(es)",
            calls.len(),
            dispatchers.len(),
            losses.len()
        );
        Ok(Executor::new(
            self,
            calls,
            members,
            dispatchers,
            losses,
            mode,
            target,
        ))
    }
}
