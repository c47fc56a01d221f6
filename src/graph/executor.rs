//! Epoch / step scheduling over a flattened call list.
//!
//! An [`Executor`] mutably borrows its [`ComputationGraph`] for its whole lifetime. Every step
//! runs the active phases in order, and within a phase every depth level in ascending order.
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::ArrayD;
use std::collections::{BTreeMap, HashSet};

use crate::graph::element::{ComputationGraph, ElementId};
use crate::graph::node::NodeId;
use crate::graph::operation::{Dispatch, DispatchSnapshot, Phase};
use crate::graph::{ConfigurationError, GraphError};

#[derive(
    Debug,
    Clone,
    Copy,
    Hash,
    Ord,
    PartialOrd,
    Eq,
    PartialEq,
    strum_macros::Display,
    strum_macros::EnumIter,
    strum_macros::EnumString,
)]
pub enum Event {
    #[strum(serialize = "Initialize")]
    Initialize,
    #[strum(serialize = "Epoch-Start")]
    EpochStart,
    #[strum(serialize = "Step-Start")]
    StepStart,
    #[strum(serialize = "Step-Finish")]
    StepFinish,
    #[strum(serialize = "Epoch-Finish")]
    EpochFinish,
    #[strum(serialize = "Teardown")]
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    Inference,
    Training,
    /// Out-of-band single step, forward only.
    Step,
}

impl ExecutionMode {
    pub fn phases(&self) -> &'static [Phase] {
        match self {
            ExecutionMode::Inference | ExecutionMode::Step => &[Phase::Forward],
            ExecutionMode::Training => &[Phase::Forward, Phase::Backward, Phase::Gradient],
        }
    }
}

/// Node ids partitioned by phase, then by depth.
#[derive(Debug, Clone, Default)]
pub struct CallList {
    calls: BTreeMap<Phase, BTreeMap<usize, Vec<NodeId>>>,
}

impl CallList {
    pub fn push(&mut self, phase: Phase, depth: usize, node: NodeId) {
        self.calls
            .entry(phase)
            .or_default()
            .entry(depth)
            .or_default()
            .push(node);
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.calls
            .values()
            .flat_map(|depths| depths.values())
            .any(|nodes| nodes.contains(&node))
    }

    pub fn len(&self) -> usize {
        self.calls
            .values()
            .flat_map(|depths| depths.values())
            .map(|nodes| nodes.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn depths(&self, phase: Phase) -> Option<&BTreeMap<usize, Vec<NodeId>>> {
        self.calls.get(&phase)
    }

    /// Nodes of `phase` in execution order.
    pub fn phase_nodes(&self, phase: Phase) -> Vec<NodeId> {
        self.calls
            .get(&phase)
            .map(|depths| depths.values().flatten().copied().collect())
            .unwrap_or_default()
    }
}

/// Shared state handed to every hook.
pub struct ExecutionInfo {
    pub mode: ExecutionMode,
    pub progress: bool,
    /// Current epoch, counted from 0. Advances once every Epoch-Finish hook has run.
    pub epoch: usize,
    /// Steps completed in the current epoch.
    pub step: usize,
    pub step_loss: Option<f32>,
    /// Loss of every step of the current epoch.
    pub epoch_losses: Vec<f32>,
    /// Summed loss per finished epoch.
    pub all_losses: Vec<f32>,
    pub validation_losses: Vec<f32>,
    pub batches_per_epoch: usize,
    pub bar: Option<ProgressBar>,
}

impl core::fmt::Debug for ExecutionInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecutionInfo")
            .field("mode", &self.mode)
            .field("epoch", &self.epoch)
            .field("step", &self.step)
            .field("step_loss", &self.step_loss)
            .field("all_losses", &self.all_losses)
            .field("validation_losses", &self.validation_losses)
            .finish_non_exhaustive()
    }
}

impl ExecutionInfo {
    fn new(mode: ExecutionMode, progress: bool) -> Self {
        Self {
            mode,
            progress,
            epoch: 0,
            step: 0,
            step_loss: None,
            epoch_losses: Vec::new(),
            all_losses: Vec::new(),
            validation_losses: Vec::new(),
            batches_per_epoch: 0,
            bar: None,
        }
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        let template = "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}";
        if let Ok(style) = ProgressStyle::default_bar().template(template) {
            bar.set_style(style.progress_chars("##-"));
        }
        bar
    }
}

/// What hooks may touch while the executor runs.
pub struct ExecutionScope<'a> {
    graph: &'a mut ComputationGraph,
    calls: &'a CallList,
    members: &'a HashSet<NodeId>,
    dispatchers: &'a [NodeId],
    losses: &'a [NodeId],
}

impl<'a> ExecutionScope<'a> {
    pub fn graph(&mut self) -> &mut ComputationGraph {
        &mut *self.graph
    }

    pub fn dispatcher_count(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn batches(&mut self) -> Result<usize, GraphError> {
        match self.dispatchers.first() {
            Some(node) => Ok(self.graph.dispatcher_mut(*node)?.batches()),
            None => Ok(1),
        }
    }

    pub fn reset_dispatchers(&mut self) -> Result<(), GraphError> {
        for node in self.dispatchers {
            self.graph.dispatcher_mut(*node)?.reset();
        }
        Ok(())
    }

    /// Publishes the next batch on every dispatcher. `false` once any of them is exhausted.
    pub fn advance(&mut self) -> Result<bool, GraphError> {
        let mut exhausted = false;
        for node in self.dispatchers {
            if self.graph.dispatcher_mut(*node)?.next_batch()? == Dispatch::Exhausted {
                exhausted = true;
            }
        }
        Ok(!exhausted)
    }

    pub fn perform(&mut self, phases: &[Phase]) -> Result<(), GraphError> {
        for phase in phases {
            let Some(depths) = self.calls.depths(*phase) else {
                continue;
            };
            for nodes in depths.values() {
                for node in nodes {
                    self.graph.setup_node(*node, Some(self.members))?;
                    self.graph.perform_node(*node)?;
                }
            }
        }
        Ok(())
    }

    /// Value of the first loss, if the executor has one.
    pub fn loss(&self) -> Result<Option<f32>, GraphError> {
        self.losses
            .first()
            .map(|node| self.graph.loss_value(*node))
            .transpose()
    }

    /// Binds one array per dispatcher, returning what was bound before.
    pub fn swap_inputs(
        &mut self,
        data: Vec<ArrayD<f32>>,
    ) -> Result<Vec<DispatchSnapshot>, GraphError> {
        check_inputs(self.dispatchers.len(), &data)?;
        // Dispatchers share one schedule, so capture all of them before rebinding any.
        let mut snapshots = Vec::with_capacity(data.len());
        for node in self.dispatchers {
            snapshots.push(self.graph.dispatcher_mut(*node)?.snapshot());
        }
        for (node, value) in self.dispatchers.iter().zip(data) {
            self.graph.dispatcher_mut(*node)?.set_value(value)?;
        }
        Ok(snapshots)
    }

    pub fn restore_inputs(&mut self, snapshots: Vec<DispatchSnapshot>) -> Result<(), GraphError> {
        for (node, snapshot) in self.dispatchers.iter().zip(snapshots) {
            self.graph.dispatcher_mut(*node)?.restore(snapshot)?;
        }
        Ok(())
    }
}

fn check_inputs(dispatchers: usize, data: &[ArrayD<f32>]) -> Result<(), ConfigurationError> {
    if data.len() != dispatchers {
        return Err(ConfigurationError::DispatcherCount {
            expected: dispatchers,
            got: data.len(),
        });
    }
    let rows: Vec<usize> = data
        .iter()
        .map(|array| array.shape().first().copied().unwrap_or(0))
        .collect();
    if rows.windows(2).any(|pair| pair[0] != pair[1]) {
        return Err(ConfigurationError::DispatcherLengthMismatch(rows));
    }
    Ok(())
}

pub type EventHook =
    Box<dyn FnMut(&mut ExecutionInfo, &mut ExecutionScope<'_>) -> Result<(), GraphError>>;

fn norm_init(info: &mut ExecutionInfo, _scope: &mut ExecutionScope<'_>) -> Result<(), GraphError> {
    info.epoch = 0;
    info.all_losses.clear();
    Ok(())
}

fn norm_epoch_start(
    info: &mut ExecutionInfo,
    scope: &mut ExecutionScope<'_>,
) -> Result<(), GraphError> {
    info.epoch_losses.clear();
    info.step_loss = None;
    info.batches_per_epoch = scope.batches()?;
    info.bar = Some(info.progress_bar(info.batches_per_epoch));
    scope.reset_dispatchers()
}

fn norm_step_finish(
    info: &mut ExecutionInfo,
    scope: &mut ExecutionScope<'_>,
) -> Result<(), GraphError> {
    let Some(loss) = scope.loss()? else {
        return Ok(());
    };
    info.step_loss = Some(loss);
    if info.mode == ExecutionMode::Step {
        return Ok(());
    }
    info.epoch_losses.push(loss);
    if let Some(bar) = &info.bar {
        bar.set_message(format!("epoch={:03} cur-loss={loss:5.3}", info.epoch));
        bar.inc(1);
    }
    Ok(())
}

fn norm_epoch_finish(
    info: &mut ExecutionInfo,
    _scope: &mut ExecutionScope<'_>,
) -> Result<(), GraphError> {
    let total: f32 = info.epoch_losses.iter().sum();
    let mean = if info.epoch_losses.is_empty() {
        0.0
    } else {
        total / info.epoch_losses.len() as f32
    };
    info.all_losses.push(total);
    if let Some(bar) = info.bar.take() {
        bar.finish_with_message(format!("epoch={:03} avg-loss={mean:5.3}", info.epoch));
    }
    log::info!("epoch={:03} avg-loss={mean:.5} total-loss={total:.5}", info.epoch);
    Ok(())
}

fn validation_hook(data: Vec<ArrayD<f32>>) -> EventHook {
    Box::new(move |info, scope| {
        let snapshots = scope.swap_inputs(data.clone())?;
        let bar = info.progress_bar(scope.batches()?);
        scope.reset_dispatchers()?;
        let mut losses = Vec::new();
        let result = (|| {
            while scope.advance()? {
                scope.perform(&[Phase::Forward])?;
                if let Some(loss) = scope.loss()? {
                    bar.set_message(format!("validation cur-loss={loss:5.3}"));
                    losses.push(loss);
                }
                bar.inc(1);
            }
            Ok::<(), GraphError>(())
        })();
        scope.restore_inputs(snapshots)?;
        result?;
        let total: f32 = losses.iter().sum();
        if !losses.is_empty() {
            bar.finish_with_message(format!(
                "validation avg-loss={:5.3}",
                total / losses.len() as f32
            ));
        }
        log::info!("epoch={:03} validation-loss={total:.5}", info.epoch);
        info.validation_losses.push(total);
        Ok(())
    })
}

pub struct Executor<'g> {
    graph: &'g mut ComputationGraph,
    calls: CallList,
    members: HashSet<NodeId>,
    dispatchers: Vec<NodeId>,
    losses: Vec<NodeId>,
    mode: ExecutionMode,
    target: ElementId,
    progress: bool,
    hooks: BTreeMap<Event, Vec<EventHook>>,
    last_info: Option<ExecutionInfo>,
}

impl<'g> Executor<'g> {
    pub(crate) fn new(
        graph: &'g mut ComputationGraph,
        calls: CallList,
        members: HashSet<NodeId>,
        dispatchers: Vec<NodeId>,
        losses: Vec<NodeId>,
        mode: ExecutionMode,
        target: ElementId,
    ) -> Self {
        let mut executor = Self {
            graph,
            calls,
            members,
            dispatchers,
            losses,
            mode,
            target,
            progress: true,
            hooks: BTreeMap::new(),
            last_info: None,
        };
        executor.register_event(Event::Initialize, norm_init);
        executor.register_event(Event::EpochStart, norm_epoch_start);
        executor.register_event(Event::StepFinish, norm_step_finish);
        executor.register_event(Event::EpochFinish, norm_epoch_finish);
        executor
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn call_list(&self) -> &CallList {
        &self.calls
    }

    pub fn dispatchers(&self) -> &[NodeId] {
        &self.dispatchers
    }

    pub fn losses(&self) -> &[NodeId] {
        &self.losses
    }

    /// State left by the most recent [`Self::execute`].
    pub fn last_info(&self) -> Option<&ExecutionInfo> {
        self.last_info.as_ref()
    }

    pub fn graph(&mut self) -> &mut ComputationGraph {
        &mut *self.graph
    }

    pub fn register_event(
        &mut self,
        event: Event,
        hook: impl FnMut(&mut ExecutionInfo, &mut ExecutionScope<'_>) -> Result<(), GraphError>
        + 'static,
    ) {
        self.hooks.entry(event).or_default().push(Box::new(hook));
    }

    /// Drops every hook of `event`, defaults included.
    pub fn unregister_events(&mut self, event: Event) {
        self.hooks.remove(&event);
    }

    /// Runs a forward pass over `data` (one array per dispatcher) after every epoch and
    /// records its summed loss in [`ExecutionInfo::validation_losses`].
    pub fn with_validation(&mut self, data: Vec<ArrayD<f32>>) -> Result<(), GraphError> {
        check_inputs(self.dispatchers.len(), &data)?;
        self.hooks
            .entry(Event::EpochFinish)
            .or_default()
            .push(validation_hook(data));
        Ok(())
    }

    /// Rebinds the training data, one array per dispatcher in creation order.
    pub fn set_input_data(&mut self, data: Vec<ArrayD<f32>>) -> Result<(), GraphError> {
        check_inputs(self.dispatchers.len(), &data)?;
        for (node, value) in self.dispatchers.iter().zip(data) {
            self.graph.dispatcher_mut(*node)?.set_value(value)?;
        }
        Ok(())
    }

    fn fire(&mut self, event: Event, info: &mut ExecutionInfo) -> Result<(), GraphError> {
        let Executor {
            graph,
            calls,
            members,
            dispatchers,
            losses,
            hooks,
            ..
        } = self;
        let Some(hooks) = hooks.get_mut(&event) else {
            return Ok(());
        };
        let mut scope = ExecutionScope {
            graph: &mut **graph,
            calls: &*calls,
            members: &*members,
            dispatchers: dispatchers.as_slice(),
            losses: losses.as_slice(),
        };
        for hook in hooks.iter_mut() {
            hook(info, &mut scope)?;
        }
        Ok(())
    }

    fn scope(&mut self) -> ExecutionScope<'_> {
        ExecutionScope {
            graph: &mut *self.graph,
            calls: &self.calls,
            members: &self.members,
            dispatchers: &self.dispatchers,
            losses: &self.losses,
        }
    }

    fn perform_step(&mut self, info: &mut ExecutionInfo) -> Result<(), GraphError> {
        self.fire(Event::StepStart, info)?;
        let phases = info.mode.phases();
        self.scope().perform(phases)?;
        info.step += 1;
        self.fire(Event::StepFinish, info)
    }

    fn perform_epoch(&mut self, info: &mut ExecutionInfo) -> Result<(), GraphError> {
        self.fire(Event::EpochStart, info)?;
        info.step = 0;
        if self.dispatchers.is_empty() {
            self.perform_step(info)?;
        } else {
            while self.scope().advance()? {
                self.perform_step(info)?;
            }
        }
        log::debug!("Epoch {} finished after {} step(s)", info.epoch, info.step);
        self.fire(Event::EpochFinish, info)?;
        info.epoch += 1;
        Ok(())
    }

    /// Runs `epochs` epochs and returns the loss recorded for each of them.
    pub fn execute(&mut self, epochs: usize) -> Result<Vec<f32>, GraphError> {
        let mut info = ExecutionInfo::new(self.mode, self.progress);
        let result = self.run(epochs, &mut info);
        let losses = info.all_losses.clone();
        self.last_info = Some(info);
        result.map(|_| losses)
    }

    fn run(&mut self, epochs: usize, info: &mut ExecutionInfo) -> Result<(), GraphError> {
        log::debug!("Executing {epochs} epoch(s) in {:?} mode", self.mode);
        self.fire(Event::Initialize, info)?;
        for _ in 0..epochs {
            self.perform_epoch(info)?;
        }
        self.fire(Event::Teardown, info)
    }

    /// Runs one forward step on `data` (one array per dispatcher, used whole) and restores the
    /// previously bound data afterwards.
    pub fn step(&mut self, data: Vec<ArrayD<f32>>) -> Result<f32, GraphError> {
        let snapshots = self.scope().swap_inputs(data)?;
        let mut info = ExecutionInfo::new(ExecutionMode::Step, false);
        let result = self.step_with_bound_data(&mut info);
        self.scope().restore_inputs(snapshots)?;
        result?;
        info.step_loss.ok_or(GraphError::NotALoss(self.target))
    }

    fn step_with_bound_data(&mut self, info: &mut ExecutionInfo) -> Result<(), GraphError> {
        for node in &self.dispatchers {
            self.graph.dispatcher_mut(*node)?.load_all()?;
        }
        self.perform_step(info)?;
        if info.step_loss.is_none() {
            info.step_loss = self.scope().loss()?;
        }
        Ok(())
    }
}
