use ndarray::{Array2, ArrayD};
use renom_graph::graph::operation::{Dispatcher, Phase};
use renom_graph::ops::arithmetic::Add;
use renom_graph::ops::dense::Dense;
use renom_graph::ops::loss::{ConstantLoss, MeanSquared, Reduction};
use renom_graph::ops::sequential::Sequential;
use renom_graph::{
    ComputationGraph, ConfigurationError, ElementId, Event, ExecutionContext, GraphError,
    GraphFactory, GraphFactoryExt, Optimizer,
};
use std::cell::RefCell;
use std::rc::Rc;

use crate::graph_tests::{assert_close, matrix};

/// Rows of `x · [1, -2, 0.5] + 0.3` over a fixed, well spread grid.
fn regression_data(rows: usize) -> (ArrayD<f32>, ArrayD<f32>) {
    let x = Array2::from_shape_fn((rows, 3), |(i, j)| match j {
        0 => i as f32 * 0.25 - 1.0,
        1 => ((i * 7) % 5) as f32 * 0.3 - 0.6,
        _ => (i % 3) as f32 - 1.0,
    });
    let t = Array2::from_shape_fn((rows, 1), |(i, _)| {
        x[[i, 0]] - 2.0 * x[[i, 1]] + 0.5 * x[[i, 2]] + 0.3
    });
    (x.into_dyn(), t.into_dyn())
}

/// Dense regression fed by a distributor over `(x, t)`.
fn regression_graph(
    graph: &mut ComputationGraph,
    x: ArrayD<f32>,
    t: ArrayD<f32>,
    batch_size: usize,
) -> (Dense, ElementId) {
    let inputs = graph.distributor(vec![x, t], batch_size, false).unwrap();
    let mut dense = Dense::new(1);
    let y = dense.call(graph, &[inputs[0].into()]).unwrap();
    let loss = MeanSquared::new(Reduction::Mean)
        .call(graph, &[y.into(), inputs[1].into()])
        .unwrap();
    (dense, loss)
}

pub fn test_epoch_step_events(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let (x, t) = regression_data(10);
    let (_, loss) = regression_graph(&mut graph, x, t, 3);
    let mut executor = graph
        .training_executor(loss, None)
        .unwrap()
        .with_progress(false);
    assert_eq!(executor.dispatchers().len(), 2);
    assert_eq!(executor.losses().len(), 1);

    let events = Rc::new(RefCell::new(Vec::new()));
    for event in [
        Event::Initialize,
        Event::EpochStart,
        Event::StepFinish,
        Event::EpochFinish,
        Event::Teardown,
    ] {
        let events = events.clone();
        executor.register_event(event, move |_, _| {
            events.borrow_mut().push(event);
            Ok(())
        });
    }
    let losses = executor.execute(2).unwrap();
    assert_eq!(losses.len(), 2);

    let mut expected = vec![Event::Initialize];
    for _ in 0..2 {
        expected.push(Event::EpochStart);
        expected.extend([Event::StepFinish; 4]);
        expected.push(Event::EpochFinish);
    }
    expected.push(Event::Teardown);
    assert_eq!(*events.borrow(), expected);

    let info = executor.last_info().unwrap();
    assert_eq!(info.epoch, 2);
    assert_eq!(info.step, 4);
    assert_eq!(info.all_losses, losses);
    assert_eq!(Event::EpochFinish.to_string(), "Epoch-Finish");
}

pub fn test_dense_regression_decreases(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let (x, t) = regression_data(8);
    let (_, loss) = regression_graph(&mut graph, x, t, 8);
    let mut executor = graph
        .training_executor(loss, Some(Optimizer::sgd(0.1, 0.0)))
        .unwrap()
        .with_progress(false);
    let losses = executor.execute(5).unwrap();
    assert_eq!(losses.len(), 5);
    for pair in losses.windows(2) {
        assert!(pair[1] < pair[0], "losses not strictly decreasing: {losses:?}");
    }
}

pub fn test_executor_without_dispatchers(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let sum = Add::new()
        .call(
            &mut graph,
            &[matrix(&[[1.0, 2.0]]).into(), matrix(&[[3.0, 4.0]]).into()],
        )
        .unwrap();
    let loss = ConstantLoss::new().call(&mut graph, &[sum.into()]).unwrap();
    let mut executor = graph
        .inference_executor(loss)
        .unwrap()
        .with_progress(false);
    assert!(executor.dispatchers().is_empty());
    assert_eq!(executor.execute(3).unwrap(), vec![10.0, 10.0, 10.0]);
    assert!(matches!(
        executor.set_input_data(vec![matrix(&[[1.0]])]),
        Err(GraphError::Configuration(
            ConfigurationError::DispatcherCount { expected: 0, got: 1 }
        ))
    ));
}

pub fn test_validation_restores_data(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let (x, t) = regression_data(9);
    let (vx, vt) = regression_data(4);
    let (_, loss) = regression_graph(&mut graph, x.clone(), t, 4);
    let mut executor = graph
        .training_executor(loss, None)
        .unwrap()
        .with_progress(false);
    executor.with_validation(vec![vx, vt]).unwrap();
    let epochs = Rc::new(RefCell::new(Vec::new()));
    let seen = epochs.clone();
    executor.register_event(Event::EpochFinish, move |info, _| {
        seen.borrow_mut().push(info.epoch);
        Ok(())
    });
    executor.execute(3).unwrap();
    // Validation and later hooks see the epoch that just finished.
    assert_eq!(*epochs.borrow(), vec![0, 1, 2]);
    let info = executor.last_info().unwrap();
    assert_eq!(info.epoch, 3);
    assert_eq!(info.validation_losses.len(), 3);
    assert!(info.validation_losses.iter().all(|v| v.is_finite() && *v >= 0.0));

    let node = executor.dispatchers()[0];
    let dispatcher = executor.graph().dispatcher_mut(node).unwrap();
    assert_eq!(dispatcher.value(), &x);
    assert_eq!(dispatcher.batches(), 3);
}

pub fn test_out_of_band_step(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let (x, t) = regression_data(6);
    let (dense, loss) = regression_graph(&mut graph, x.clone(), t, 2);
    let w = dense.param("w").unwrap();
    let b = dense.bias().unwrap().param("b").unwrap();
    let mut executor = graph
        .training_executor(loss, None)
        .unwrap()
        .with_progress(false);

    let sx = matrix(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
    let st = matrix(&[[0.0], [0.0]]);
    let w_before = w.to_array().unwrap();
    let value = executor.step(vec![sx.clone(), st.clone()]).unwrap();

    let pred = sx
        .into_dimensionality::<ndarray::Ix2>()
        .unwrap()
        .dot(&w_before.clone().into_dimensionality::<ndarray::Ix2>().unwrap())
        + &b.to_array().unwrap().into_dimensionality::<ndarray::Ix2>().unwrap();
    let expected = pred.mapv(|v| v * v).sum() / 2.0 / 2.0;
    assert!((value - expected).abs() < 1e-5, "{value} != {expected}");
    // A step is forward only and leaves the bound data in place.
    assert_close(&w.to_array().unwrap(), &w_before, 0.0);
    let node = executor.dispatchers()[0];
    assert_eq!(executor.graph().dispatcher_mut(node).unwrap().value(), &x);
    assert!(matches!(
        executor.step(vec![st]),
        Err(GraphError::Configuration(
            ConfigurationError::DispatcherCount { expected: 2, got: 1 }
        ))
    ));
}

pub fn test_input_data_count(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let (x, t) = regression_data(6);
    let (_, loss) = regression_graph(&mut graph, x, t, 4);
    let mut executor = graph
        .training_executor(loss, None)
        .unwrap()
        .with_progress(false);
    let (x, t) = regression_data(12);
    executor.set_input_data(vec![x, t]).unwrap();
    let node = executor.dispatchers()[1];
    assert_eq!(executor.graph().dispatcher_mut(node).unwrap().rows(), 12);
    executor.execute(1).unwrap();
    assert_eq!(executor.last_info().unwrap().step, 3);

    let (x, _) = regression_data(5);
    let (_, t) = regression_data(7);
    assert!(matches!(
        executor.set_input_data(vec![x, t]),
        Err(GraphError::Configuration(
            ConfigurationError::DispatcherLengthMismatch(_)
        ))
    ));
}

pub fn test_sequential_call_order(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut model = Sequential::new(vec![
        Box::new(Dense::new(4)) as Box<dyn GraphFactory>,
        Box::new(Dense::new(3)),
        Box::new(Dense::new(1)),
    ]);
    let y = model
        .call(&mut graph, &[matrix(&[[1.0, 2.0], [3.0, 4.0]]).into()])
        .unwrap();
    let layers: Vec<_> = (0..3)
        .map(|i| {
            let element = model.layer(i).unwrap().state().last.unwrap();
            graph.element(element).unwrap().forward_node()
        })
        .collect();

    let mut executor = graph.inference_executor(y).unwrap();
    let order = executor.call_list().phase_nodes(Phase::Forward);
    let depths: Vec<usize> = order
        .iter()
        .map(|node| executor.graph().nodes().depth(*node).unwrap())
        .collect();
    assert!(depths.windows(2).all(|pair| pair[0] <= pair[1]), "{depths:?}");

    let positions: Vec<usize> = layers
        .iter()
        .map(|node| order.iter().position(|x| x == node).unwrap())
        .collect();
    let layer_depths: Vec<usize> = layers
        .iter()
        .map(|node| executor.graph().nodes().depth(*node).unwrap())
        .collect();
    assert!(positions.windows(2).all(|pair| pair[0] < pair[1]), "{positions:?}");
    assert!(layer_depths.windows(2).all(|pair| pair[0] < pair[1]), "{layer_depths:?}");
}

pub fn test_repeated_steps_agree(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let (x, t) = regression_data(6);
    let (_, loss) = regression_graph(&mut graph, x.clone(), t.clone(), 2);
    let mut executor = graph
        .training_executor(loss, Some(Optimizer::sgd(0.1, 0.0)))
        .unwrap()
        .with_progress(false);
    let first = executor.step(vec![x.clone(), t.clone()]).unwrap();
    for _ in 0..3 {
        let again = executor.step(vec![x.clone(), t.clone()]).unwrap();
        assert_eq!(again.to_bits(), first.to_bits());
    }
}
