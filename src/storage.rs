//! Multi-device array storage shared between operations.
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::{Device, ExecutionContext};
use crate::graph::{GraphError, ShapeError};
use crate::initializer::Initializer;
use crate::optimizer::{Optimizer, OptimizerState, WeightDecay};

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage {id:?} has no buffer on {device}")]
    MissingBuffer { id: StorageId, device: Device },
    #[error("Storage {0:?} has not been allocated")]
    Unallocated(StorageId),
}

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct StorageId(u64);

impl StorageId {
    fn mint() -> Self {
        Self(NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct StorageInner {
    shape: Vec<usize>,
    buffers: BTreeMap<Device, ArrayD<f32>>,
    generation: u64,
    optimizer: Option<Optimizer>,
    decay: Option<WeightDecay>,
    updatable: bool,
    moments: BTreeMap<Device, OptimizerState>,
}

/// Shared handle onto one buffer per device.
///
/// Clones alias the same buffers; identity is the [`StorageId`].
#[derive(Debug, Clone)]
pub struct GraphStorage {
    id: StorageId,
    inner: Rc<RefCell<StorageInner>>,
}

impl Default for GraphStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStorage {
    pub fn new() -> Self {
        Self {
            id: StorageId::mint(),
            inner: Rc::new(RefCell::new(StorageInner {
                shape: Vec::new(),
                buffers: BTreeMap::new(),
                generation: 0,
                optimizer: None,
                decay: None,
                updatable: true,
                moments: BTreeMap::new(),
            })),
        }
    }

    pub fn from_array(array: ArrayD<f32>, devices: &[Device]) -> Self {
        let storage = Self::new();
        storage.set_value(array, devices);
        storage
    }

    pub fn id(&self) -> StorageId {
        self.id
    }

    pub fn shape(&self) -> Vec<usize> {
        self.inner.borrow().shape.clone()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.inner.borrow().buffers.keys().copied().collect()
    }

    pub fn is_allocated(&self) -> bool {
        !self.inner.borrow().buffers.is_empty()
    }

    /// Bumped on every reallocation.
    pub fn generation(&self) -> u64 {
        self.inner.borrow().generation
    }

    /// Allocates zeroed buffers. Returns `false` when shape and devices are already as requested.
    pub fn init(&self, shape: &[usize], devices: &[Device]) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.shape == shape && inner.buffers.keys().copied().eq(sorted(devices)) {
            return false;
        }
        inner.shape = shape.to_vec();
        inner.buffers = devices
            .iter()
            .map(|device| (*device, ArrayD::zeros(IxDyn(shape))))
            .collect();
        inner.generation += 1;
        true
    }

    /// Allocates a trainable parameter the first time, and refuses to change its shape afterwards.
    pub fn init_parameter(
        &self,
        shape: &[usize],
        devices: &[Device],
        initializer: &Initializer,
        ctx: &ExecutionContext,
    ) -> Result<bool, GraphError> {
        if self.is_allocated() {
            let existing = self.shape();
            if existing != shape {
                return Err(ShapeError::ParameterShapeChanged {
                    existing,
                    requested: shape.to_vec(),
                }
                .into());
            }
            let mut inner = self.inner.borrow_mut();
            let Some(value) = inner.buffers.values().next().cloned() else {
                return Ok(false);
            };
            let mut changed = false;
            for device in devices {
                if !inner.buffers.contains_key(device) {
                    inner.buffers.insert(*device, value.clone());
                    changed = true;
                }
            }
            return Ok(changed);
        }
        let value = initializer.fill(shape, &mut *ctx.rng())?;
        self.set_value(value, devices);
        Ok(true)
    }

    /// Replaces the contents on every listed device with copies of `array`.
    pub fn set_value(&self, array: ArrayD<f32>, devices: &[Device]) {
        let mut inner = self.inner.borrow_mut();
        if inner.shape != array.shape() || !inner.buffers.keys().copied().eq(sorted(devices)) {
            inner.generation += 1;
        }
        inner.shape = array.shape().to_vec();
        inner.buffers = devices
            .iter()
            .map(|device| (*device, array.clone()))
            .collect();
    }

    /// Overwrites one device buffer, keeping the recorded shape in sync.
    pub fn write(&self, device: Device, array: ArrayD<f32>) {
        let mut inner = self.inner.borrow_mut();
        if inner.shape != array.shape() {
            inner.shape = array.shape().to_vec();
            inner.generation += 1;
        }
        inner.buffers.insert(device, array);
    }

    pub fn get(&self, device: Device) -> Result<Ref<'_, ArrayD<f32>>, StorageError> {
        Ref::filter_map(self.inner.borrow(), |inner| inner.buffers.get(&device)).map_err(|_| {
            StorageError::MissingBuffer {
                id: self.id,
                device,
            }
        })
    }

    pub fn get_mut(&self, device: Device) -> Result<RefMut<'_, ArrayD<f32>>, StorageError> {
        RefMut::filter_map(self.inner.borrow_mut(), |inner| inner.buffers.get_mut(&device))
            .map_err(|_| StorageError::MissingBuffer {
                id: self.id,
                device,
            })
    }

    /// Runs `f` over one device buffer and the optimizer moments kept for it. The moments live
    /// as long as the storage, so every element built on this parameter continues them.
    pub fn update_with<R>(
        &self,
        device: Device,
        f: impl FnOnce(&mut ArrayD<f32>, &mut OptimizerState) -> R,
    ) -> Result<R, StorageError> {
        let mut inner = self.inner.borrow_mut();
        let StorageInner {
            buffers, moments, ..
        } = &mut *inner;
        let value = buffers
            .get_mut(&device)
            .ok_or(StorageError::MissingBuffer {
                id: self.id,
                device,
            })?;
        Ok(f(value, moments.entry(device).or_default()))
    }

    /// Copy of the first device's buffer.
    pub fn to_array(&self) -> Result<ArrayD<f32>, StorageError> {
        self.inner
            .borrow()
            .buffers
            .values()
            .next()
            .cloned()
            .ok_or(StorageError::Unallocated(self.id))
    }

    pub fn optimizer(&self) -> Option<Optimizer> {
        self.inner.borrow().optimizer.clone()
    }

    pub fn set_optimizer(&self, optimizer: Option<Optimizer>) {
        self.inner.borrow_mut().optimizer = optimizer;
    }

    pub fn decay(&self) -> Option<WeightDecay> {
        self.inner.borrow().decay
    }

    pub fn set_decay(&self, decay: Option<WeightDecay>) {
        self.inner.borrow_mut().decay = decay;
    }

    pub fn updatable(&self) -> bool {
        self.inner.borrow().updatable
    }

    pub fn set_updatable(&self, updatable: bool) {
        self.inner.borrow_mut().updatable = updatable;
    }
}

fn sorted(devices: &[Device]) -> Vec<Device> {
    let mut devices = devices.to_vec();
    devices.sort();
    devices.dedup();
    devices
}
