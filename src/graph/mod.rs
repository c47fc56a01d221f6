pub mod archive;
pub mod element;
pub mod executor;
pub mod factory;
pub mod node;
pub mod operation;
pub mod update;

use crate::storage::StorageError;
use element::ElementId;
use node::{NodeError, NodeId};

#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("{op}: expected rank {expected}, got shape {shape:?}")]
    UnexpectedRank {
        op: String,
        expected: usize,
        shape: Vec<usize>,
    },
    #[error("{op}: incompatible shapes {lhs:?} and {rhs:?}")]
    IncompatibleShapes {
        op: String,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    #[error("{op}: expected {expected} feature column(s), got shape {shape:?}")]
    FeatureColumns {
        op: String,
        expected: usize,
        shape: Vec<usize>,
    },
    #[error("Parameter already allocated with shape {existing:?}, requested {requested:?}")]
    ParameterShapeChanged {
        existing: Vec<usize>,
        requested: Vec<usize>,
    },
    #[error("{op}: missing input slot {slot}")]
    MissingInput { op: String, slot: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Unknown optimizer: {0}")]
    UnknownOptimizer(String),
    #[error("Unknown weight decay: {0}")]
    UnknownDecay(String),
    #[error("Unknown activation: {0}")]
    UnknownActivation(String),
    #[error("Unknown reduction: {0}")]
    UnknownReduction(String),
    #[error("Invalid value {value} for {name}")]
    InvalidHyperparameter { name: String, value: f32 },
    #[error("{op} requires integer valued input")]
    IntegerInputRequired { op: String },
    #[error("{op}: index {index} out of range for {size} entries")]
    IndexOutOfRange { op: String, index: usize, size: usize },
    #[error("{op} expects {expected} input(s), got {got}")]
    InputCount {
        op: String,
        expected: usize,
        got: usize,
    },
    #[error("Dispatched arrays must share their first dimension, got {0:?}")]
    DispatcherLengthMismatch(Vec<usize>),
    #[error("Expected one array per dispatcher ({expected}), got {got}")]
    DispatcherCount { expected: usize, got: usize },
    #[error("Invalid batch size {0}")]
    InvalidBatchSize(usize),
    #[error("Invalid device mode: {0}")]
    InvalidDeviceMode(String),
    #[error("Invalid random seed: {0}")]
    InvalidSeed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("No live attribute for stored path {path}")]
    StructureMismatch { path: String },
    #[error("Unknown element {0:?}")]
    UnknownElement(ElementId),
    #[error("Element {0:?} has been finalized, its backward graph is gone")]
    Finalized(ElementId),
    #[error("Element {0:?} is not a loss")]
    NotALoss(ElementId),
    #[error("Element {0:?} is not a static input")]
    NotAStaticInput(ElementId),
    #[error("Node {0:?} is not a dispatcher")]
    NotADispatcher(NodeId),
    #[error("Unknown parameter {0}")]
    UnknownParameter(String),
    #[error("No gradient reaches storage {0:?}")]
    NoGradient(crate::storage::StorageId),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Archive(#[from] serde_json::Error),
}
