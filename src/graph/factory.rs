//! Reusable builders of graph elements.
//!
//! A factory owns the persistent parameters of a layer and produces a fresh element every time
//! it is called, always wiring the same parameter storages. Factories nest: children are
//! visited by the recursive configuration helpers and by persistence under dotted paths
//! (`root`, `root.bias`, `root.0`, ...).
use ndarray::ArrayD;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;

use crate::device::Device;
use crate::graph::archive::{ModelArchive, StoredType};
use crate::graph::element::{ComputationGraph, ElementId, GraphInput, OwnerTag};
use crate::graph::{ConfigurationError, GraphError};
use crate::ops::activation::{Activation, ActivationKind};
use crate::optimizer::{Optimizer, WeightDecay};
use crate::storage::GraphStorage;

pub const ROOT_PATH: &str = "root";
pub const ATTRIBUTE_PREFIX: &str = "__dict__.";

/// A policy applied either to every parameter or to parameters by name.
#[derive(Debug, Clone, PartialEq)]
pub enum PerParam<T> {
    All(T),
    ByName(BTreeMap<String, T>),
}

impl<T: Clone> PerParam<T> {
    pub fn for_param(&self, name: &str) -> Option<T> {
        match self {
            PerParam::All(value) => Some(value.clone()),
            PerParam::ByName(values) => values.get(name).cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FactorySetting {
    MakeUpdates(bool),
    Inference(Option<bool>),
    Optimizer(Option<PerParam<Optimizer>>),
    Decay(Option<PerParam<WeightDecay>>),
}

#[derive(Debug)]
pub struct FactoryState {
    pub params: BTreeMap<String, GraphStorage>,
    pub optimizer: Option<PerParam<Optimizer>>,
    pub decay: Option<PerParam<WeightDecay>>,
    pub activation: Option<Box<dyn GraphFactory>>,
    pub inference: Option<bool>,
    pub make_update_graphs: bool,
    pub last: Option<ElementId>,
}

impl Default for FactoryState {
    fn default() -> Self {
        Self {
            params: BTreeMap::new(),
            optimizer: None,
            decay: None,
            activation: None,
            inference: None,
            make_update_graphs: true,
            last: None,
        }
    }
}

impl FactoryState {
    /// Declares parameter `name`, allocated lazily by the first operation consuming it.
    pub fn declare(&mut self, name: &str) -> GraphStorage {
        self.params.entry(name.to_string()).or_default().clone()
    }

    fn apply(&mut self, setting: &FactorySetting) {
        match setting {
            FactorySetting::MakeUpdates(value) => self.make_update_graphs = *value,
            FactorySetting::Inference(value) => self.inference = *value,
            FactorySetting::Optimizer(value) => self.optimizer = value.clone(),
            FactorySetting::Decay(value) => self.decay = value.clone(),
        }
    }

    fn tag_params(&self) {
        for (name, param) in &self.params {
            if let Some(optimizer) = self.optimizer.as_ref().and_then(|x| x.for_param(name)) {
                param.set_optimizer(Some(optimizer));
            }
            if let Some(decay) = self.decay.as_ref().and_then(|x| x.for_param(name)) {
                param.set_decay(Some(decay));
            }
        }
    }
}

pub trait GraphFactory: Debug {
    fn state(&self) -> &FactoryState;

    fn state_mut(&mut self) -> &mut FactoryState;

    /// Wires a new element from `inputs`, reusing the parameters in [`FactoryState::params`].
    fn connect(
        &mut self,
        graph: &mut ComputationGraph,
        inputs: &[GraphInput],
    ) -> Result<ElementId, GraphError>;

    fn children(&self) -> Vec<(&str, &dyn GraphFactory)> {
        Vec::new()
    }

    fn children_mut(&mut self) -> Vec<(&str, &mut dyn GraphFactory)> {
        Vec::new()
    }

    /// Plain attributes persisted next to the parameters.
    fn serialized_attributes(&self) -> BTreeMap<String, ArrayD<f32>> {
        BTreeMap::new()
    }

    fn load_attribute(&mut self, name: &str, _value: ArrayD<f32>) -> Result<(), GraphError> {
        Err(GraphError::StructureMismatch {
            path: format!("{ATTRIBUTE_PREFIX}{name}"),
        })
    }
}

pub trait GraphFactoryExt: GraphFactory {
    /// Builds a new element and applies every policy of this factory to it.
    fn call(
        &mut self,
        graph: &mut ComputationGraph,
        inputs: &[GraphInput],
    ) -> Result<ElementId, GraphError> {
        let tag = graph.push_pending_tag();
        let built = build(self, graph, inputs);
        graph.pop_tag(tag);
        let element = match built {
            Ok(element) => element,
            Err(err) => {
                graph.discard_pending(tag)?;
                return Err(err);
            }
        };
        graph.replace_tags(element, tag, OwnerTag::Element(element))?;
        let owner = OwnerTag::Element(element);

        let state = self.state();
        if !state.make_update_graphs {
            graph.detach_updates(owner)?;
        }
        if let Some(inference) = state.inference {
            graph.set_inference(owner, inference)?;
        }
        state.tag_params();
        self.state_mut().last = Some(element);
        Ok(element)
    }

    /// Applies `setting` to this factory and every descendant.
    fn apply_setting(&mut self, setting: &FactorySetting) {
        self.state_mut().apply(setting);
        for (_, child) in self.children_mut() {
            child.apply_setting(setting);
        }
    }

    /// Runs `f` with update graphs disabled for this factory tree, then restores each
    /// factory's previous setting.
    fn without_updates<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let read = |state: &FactoryState| state.make_update_graphs;
        let mut previous = Vec::new();
        snapshot(&*self, &read, &mut previous);
        self.apply_setting(&FactorySetting::MakeUpdates(false));
        let result = f(self);
        let write = |state: &mut FactoryState, value: bool| state.make_update_graphs = value;
        restore(self, &write, &mut previous.into_iter());
        result
    }

    /// Runs `f` with every element built by this factory tree in inference mode, then
    /// restores each factory's previous setting.
    fn with_inference<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let read = |state: &FactoryState| state.inference;
        let mut previous = Vec::new();
        snapshot(&*self, &read, &mut previous);
        self.apply_setting(&FactorySetting::Inference(Some(true)));
        let result = f(self);
        let write = |state: &mut FactoryState, value: Option<bool>| state.inference = value;
        restore(self, &write, &mut previous.into_iter());
        result
    }

    fn set_optimizer(&mut self, optimizer: PerParam<Optimizer>) -> Result<(), ConfigurationError> {
        match &optimizer {
            PerParam::All(x) => x.validate()?,
            PerParam::ByName(all) => {
                for x in all.values() {
                    x.validate()?;
                }
            }
        }
        self.apply_setting(&FactorySetting::Optimizer(Some(optimizer)));
        Ok(())
    }

    /// Parses an optimizer by name (`"sgd"`, `"adam"`, ...) and applies it to the whole tree.
    fn set_optimizer_by_name(&mut self, name: &str) -> Result<(), ConfigurationError> {
        let optimizer: Optimizer = name.parse()?;
        self.set_optimizer(PerParam::All(optimizer))
    }

    fn set_decay(&mut self, decay: PerParam<WeightDecay>) {
        self.apply_setting(&FactorySetting::Decay(Some(decay)));
    }

    fn set_decay_by_name(&mut self, name: &str) -> Result<(), ConfigurationError> {
        let decay: WeightDecay = name.parse()?;
        self.set_decay(PerParam::All(decay));
        Ok(())
    }

    /// Applies an activation (`"relu"`, `"sigmoid"`, `"tanh"`, `"selu"`) to every element built
    /// from now on.
    fn set_activation(&mut self, name: &str) -> Result<(), ConfigurationError> {
        let kind: ActivationKind = name
            .parse()
            .map_err(|_| ConfigurationError::UnknownActivation(name.to_string()))?;
        self.state_mut().activation = Some(Box::new(Activation::new(kind)));
        Ok(())
    }

    fn param(&self, name: &str) -> Result<GraphStorage, GraphError> {
        self.state()
            .params
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::UnknownParameter(name.to_string()))
    }

    /// Replaces parameter `name`. Elements built afterwards use the new storage.
    fn set_param(&mut self, name: &str, storage: GraphStorage) {
        self.state_mut().params.insert(name.to_string(), storage);
    }

    /// Copies the values of identically named, allocated parameters from `other`.
    /// Returns how many were copied.
    fn load_params(
        &mut self,
        other: &BTreeMap<String, GraphStorage>,
        devices: &[Device],
    ) -> Result<usize, GraphError> {
        let mut copied = 0;
        for (name, param) in &self.state().params {
            let Some(source) = other.get(name).filter(|x| x.is_allocated()) else {
                continue;
            };
            param.set_value(source.to_array()?, devices);
            copied += 1;
        }
        Ok(copied)
    }

    /// Every allocated parameter and serialized attribute of the tree, keyed by dotted path.
    fn archive(&self) -> Result<ModelArchive, GraphError> {
        let mut archive = ModelArchive::default();
        collect(self, ROOT_PATH.to_string(), &mut archive)?;
        Ok(archive)
    }

    fn save(&self, path: impl AsRef<Path>) -> Result<(), GraphError> {
        let archive = self.archive()?;
        archive.write_to(path.as_ref())?;
        log::debug!("Saved {} group(s) to {}", archive.len(), path.as_ref().display());
        Ok(())
    }

    /// Loads an archive written by [`Self::save`]. Every stored path is resolved before
    /// anything is written, so a mismatch leaves the tree untouched.
    fn load(&mut self, path: impl AsRef<Path>, devices: &[Device]) -> Result<(), GraphError> {
        let archive = ModelArchive::read_from(path.as_ref())?;
        self.load_archive(&archive, devices)
    }

    fn load_archive(
        &mut self,
        archive: &ModelArchive,
        devices: &[Device],
    ) -> Result<(), GraphError> {
        let mut staged = Vec::new();
        for (path, group) in archive.groups() {
            let names = child_names(path)?;
            let entries = stage_group(self, &names, path, group.keys(), archive)?;
            staged.push((names, entries));
        }
        for (names, entries) in staged {
            apply_entries(self, &names, entries, devices)?;
        }
        Ok(())
    }
}

impl<T: GraphFactory + ?Sized> GraphFactoryExt for T {}

fn build<F: GraphFactory + ?Sized>(
    factory: &mut F,
    graph: &mut ComputationGraph,
    inputs: &[GraphInput],
) -> Result<ElementId, GraphError> {
    let element = factory.connect(graph, inputs)?;
    match factory.state_mut().activation.as_mut() {
        Some(activation) => activation.call(graph, &[element.into()]),
        None => Ok(element),
    }
}

/// Pre-order read of one state field over the factory tree.
fn snapshot<F, T>(factory: &F, read: &impl Fn(&FactoryState) -> T, out: &mut Vec<T>)
where
    F: GraphFactory + ?Sized,
{
    out.push(read(factory.state()));
    for (_, child) in factory.children() {
        snapshot(child, read, &mut *out);
    }
}

/// Writes back values taken by [`snapshot`], in the same order.
fn restore<F, T>(
    factory: &mut F,
    write: &impl Fn(&mut FactoryState, T),
    values: &mut impl Iterator<Item = T>,
) where
    F: GraphFactory + ?Sized,
{
    if let Some(value) = values.next() {
        write(factory.state_mut(), value);
    }
    for (_, child) in factory.children_mut() {
        restore(child, write, &mut *values);
    }
}

fn child_names(path: &str) -> Result<Vec<&str>, GraphError> {
    let mut parts = path.split('.');
    if parts.next() != Some(ROOT_PATH) {
        return Err(GraphError::StructureMismatch {
            path: path.to_string(),
        });
    }
    Ok(parts.collect())
}

fn stage_group<'k, F: GraphFactory + ?Sized>(
    factory: &F,
    names: &[&str],
    path: &str,
    keys: impl Iterator<Item = &'k String>,
    archive: &ModelArchive,
) -> Result<Vec<StagedEntry>, GraphError> {
    if let Some((first, rest)) = names.split_first() {
        let child = factory
            .children()
            .into_iter()
            .find(|(name, _)| name == first)
            .map(|(_, child)| child)
            .ok_or_else(|| GraphError::StructureMismatch {
                path: path.to_string(),
            })?;
        return stage_group(child, rest, path, keys, archive);
    }
    let attributes = factory.serialized_attributes();
    let mut entries = Vec::new();
    for name in keys {
        let known = match name.strip_prefix(ATTRIBUTE_PREFIX) {
            Some(attribute) => attributes.contains_key(attribute),
            None => factory.state().params.contains_key(name),
        };
        if !known {
            return Err(GraphError::StructureMismatch {
                path: format!("{path}.{name}"),
            });
        }
        let updatable = match archive.stored_type(path, &format!("{name}._auto_update")) {
            Some(StoredType::AutoUpdate(value)) => Some(value),
            _ => None,
        };
        entries.push((name.clone(), archive.read_array(path, name)?, updatable));
    }
    Ok(entries)
}

type StagedEntry = (String, ArrayD<f32>, Option<bool>);

fn apply_entries<F: GraphFactory + ?Sized>(
    factory: &mut F,
    names: &[&str],
    entries: Vec<StagedEntry>,
    devices: &[Device],
) -> Result<(), GraphError> {
    if let Some((first, rest)) = names.split_first() {
        let child = factory
            .children_mut()
            .into_iter()
            .find(|(name, _)| name == first)
            .map(|(_, child)| child)
            .ok_or_else(|| GraphError::StructureMismatch {
                path: first.to_string(),
            })?;
        return apply_entries(child, rest, entries, devices);
    }
    for (name, value, updatable) in entries {
        match name.strip_prefix(ATTRIBUTE_PREFIX) {
            Some(attribute) => factory.load_attribute(attribute, value)?,
            None => {
                let param = factory.state_mut().declare(&name);
                param.set_value(value, devices);
                if let Some(updatable) = updatable {
                    param.set_updatable(updatable);
                }
            }
        }
    }
    Ok(())
}

fn collect<F: GraphFactory + ?Sized>(
    factory: &F,
    path: String,
    archive: &mut ModelArchive,
) -> Result<(), GraphError> {
    archive.create_group(&path);
    for (name, param) in &factory.state().params {
        if !param.is_allocated() {
            continue;
        }
        archive.write_array(&path, name, &param.to_array()?, StoredType::Variable);
        archive.set_type(
            &path,
            &format!("{name}._auto_update"),
            StoredType::AutoUpdate(param.updatable()),
        );
    }
    for (name, value) in factory.serialized_attributes() {
        archive.write_array(
            &path,
            &format!("{ATTRIBUTE_PREFIX}{name}"),
            &value,
            StoredType::Attribute,
        );
    }
    for (name, child) in factory.children() {
        collect(child, format!("{path}.{name}"), archive)?;
    }
    Ok(())
}
