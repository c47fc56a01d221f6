//! Computational graph core: dependency-ordered operations with forward, backward and
//! gradient-update phases, reusable layer factories and an epoch/step executor.
pub mod device;
pub mod graph;
pub mod initializer;
pub mod ops;
pub mod optimizer;
pub mod storage;

pub use device::{Device, DeviceMode, ExecutionContext};
pub use graph::element::{ComputationGraph, ElementId, GraphInput};
pub use graph::executor::{Event, ExecutionInfo, ExecutionMode, Executor};
pub use graph::factory::{FactorySetting, GraphFactory, GraphFactoryExt, PerParam};
pub use graph::{ConfigurationError, GraphError, ShapeError};
pub use initializer::Initializer;
pub use optimizer::{Optimizer, WeightDecay};
pub use storage::{GraphStorage, StorageId};
