//! Batch dispatchers feeding training data into a graph.
//!
//! Arrays distributed together share one [`BatchSchedule`]: the first dispatcher leads and
//! draws the permutation, the others follow it so rows stay aligned across inputs.
use ndarray::{ArrayD, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::cell::RefCell;
use std::rc::Rc;

use crate::device::{Device, ExecutionContext};
use crate::graph::element::{ComputationGraph, ElementId, ElementKind};
use crate::graph::operation::{
    Dispatch, DispatchSnapshot, Dispatcher, OpRole, Operation, SlotKey, Slots,
};
use crate::graph::{ConfigurationError, GraphError};
use crate::storage::GraphStorage;

#[derive(Debug)]
pub struct BatchSchedule {
    rows: usize,
    batch_size: usize,
    shuffle: bool,
    permutation: Vec<usize>,
    rng: StdRng,
}

impl BatchSchedule {
    pub fn new(rows: usize, batch_size: usize, shuffle: bool, rng: StdRng) -> Self {
        let mut schedule = Self {
            rows,
            batch_size,
            shuffle,
            permutation: Vec::new(),
            rng,
        };
        schedule.redraw();
        schedule
    }

    fn redraw(&mut self) {
        self.permutation = (0..self.rows).collect();
        if self.shuffle {
            self.permutation.shuffle(&mut self.rng);
        }
    }

    fn resize(&mut self, rows: usize) {
        if rows != self.rows {
            self.rows = rows;
            self.redraw();
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batches(&self) -> usize {
        self.rows.div_ceil(self.batch_size)
    }

    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }
}

#[derive(Debug)]
pub struct DispatchOperation {
    leader: bool,
    schedule: Rc<RefCell<BatchSchedule>>,
    value: ArrayD<f32>,
    position: usize,
    devices: Vec<Device>,
    y: GraphStorage,
    slots: Slots,
}

impl DispatchOperation {
    pub fn new(
        ctx: &ExecutionContext,
        value: ArrayD<f32>,
        schedule: Rc<RefCell<BatchSchedule>>,
        leader: bool,
    ) -> Self {
        let y = GraphStorage::new();
        Self {
            leader,
            schedule,
            value,
            position: 0,
            devices: ctx.devices(),
            slots: Slots::from([(SlotKey::Output, y.clone())]),
            y,
        }
    }

    fn publish(&self, rows: &[usize]) {
        let batch = self.value.select(Axis(0), rows);
        self.y.set_value(batch, &self.devices);
    }

    fn check_rows(&self) -> Result<(), ConfigurationError> {
        let scheduled = self.schedule.borrow().rows;
        if scheduled != self.rows() {
            return Err(ConfigurationError::DispatcherLengthMismatch(vec![
                scheduled,
                self.rows(),
            ]));
        }
        Ok(())
    }
}

impl Operation for DispatchOperation {
    fn name(&self) -> &str {
        "Dispatch"
    }

    fn roles(&self) -> &[OpRole] {
        &[OpRole::Input]
    }

    /// Previews the first batch so downstream shapes are known before the first step.
    fn setup(&mut self, _inputs: &[Slots], _ctx: &ExecutionContext) -> Result<(), GraphError> {
        if !self.y.is_allocated() {
            self.check_rows()?;
            let schedule = self.schedule.borrow();
            let end = schedule.batch_size.min(schedule.rows);
            let rows = schedule.permutation[..end].to_vec();
            drop(schedule);
            self.publish(&rows);
        }
        Ok(())
    }

    fn perform(&mut self) -> Result<(), GraphError> {
        Ok(())
    }

    fn slots(&self) -> &Slots {
        &self.slots
    }

    fn as_dispatcher(&mut self) -> Option<&mut dyn Dispatcher> {
        Some(self)
    }
}

impl Dispatcher for DispatchOperation {
    fn value(&self) -> &ArrayD<f32> {
        &self.value
    }

    fn set_value(&mut self, value: ArrayD<f32>) -> Result<(), GraphError> {
        self.schedule.borrow_mut().resize(value.len_of(Axis(0)));
        self.value = value;
        self.position = 0;
        Ok(())
    }

    fn reset(&mut self) {
        if self.leader {
            self.schedule.borrow_mut().redraw();
        }
        self.position = 0;
    }

    fn next_batch(&mut self) -> Result<Dispatch, GraphError> {
        self.check_rows()?;
        let schedule = self.schedule.borrow();
        if self.position >= schedule.rows {
            return Ok(Dispatch::Exhausted);
        }
        let end = (self.position + schedule.batch_size).min(schedule.rows);
        let rows = schedule.permutation[self.position..end].to_vec();
        drop(schedule);
        self.publish(&rows);
        self.position = end;
        Ok(Dispatch::Batch(rows.len()))
    }

    fn load_all(&mut self) -> Result<(), GraphError> {
        self.y.set_value(self.value.clone(), &self.devices);
        self.position = self.rows();
        Ok(())
    }

    fn rows(&self) -> usize {
        self.value.len_of(Axis(0))
    }

    fn batches(&self) -> usize {
        self.schedule.borrow().batches()
    }

    fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            value: self.value.clone(),
            position: self.position,
            permutation: self.schedule.borrow().permutation.clone(),
        }
    }

    fn restore(&mut self, snapshot: DispatchSnapshot) -> Result<(), GraphError> {
        {
            let mut schedule = self.schedule.borrow_mut();
            schedule.rows = snapshot.permutation.len();
            schedule.permutation = snapshot.permutation;
        }
        self.value = snapshot.value;
        self.position = snapshot.position;
        Ok(())
    }
}

impl ComputationGraph {
    /// Distributes `arrays` in batches of `batch_size` rows, one dispatcher element per array.
    /// All arrays must share their first dimension; shuffling permutes them identically.
    pub fn distributor(
        &mut self,
        arrays: Vec<ArrayD<f32>>,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Vec<ElementId>, GraphError> {
        if batch_size == 0 {
            return Err(ConfigurationError::InvalidBatchSize(batch_size).into());
        }
        let lengths: Vec<usize> = arrays.iter().map(|x| x.len_of(Axis(0))).collect();
        if lengths.is_empty() || lengths.iter().any(|x| *x != lengths[0]) {
            return Err(ConfigurationError::DispatcherLengthMismatch(lengths).into());
        }
        let ctx = self.context().clone();
        let schedule = Rc::new(RefCell::new(BatchSchedule::new(
            lengths[0],
            batch_size,
            shuffle,
            ctx.fork_rng(),
        )));
        let mut elements = Vec::with_capacity(arrays.len());
        for (i, array) in arrays.into_iter().enumerate() {
            let op = DispatchOperation::new(&ctx, array, schedule.clone(), i == 0);
            elements.push(self.insert_element(
                Box::new(op),
                Vec::new(),
                Vec::new(),
                ElementKind::Dispatcher,
            )?);
        }
        log::debug!(
            "Distributor over {} row(s), batch size {batch_size}, shuffle={shuffle}: {:?}",
            lengths[0],
            elements
        );
        Ok(elements)
    }
}
