use renom_graph::graph::operation::Phase;
use renom_graph::ops::dense::Dense;
use renom_graph::ops::dropout::Dropout;
use renom_graph::ops::loss::ConstantLoss;
use renom_graph::ops::sequential::Sequential;
use renom_graph::{
    ComputationGraph, ConfigurationError, ExecutionContext, FactorySetting, GraphFactory,
    GraphFactoryExt, Optimizer,
};

use crate::graph_tests::{assert_close, matrix};

fn gradient_nodes(graph: &ComputationGraph) -> usize {
    graph
        .nodes()
        .node_ids()
        .into_iter()
        .filter(|id| graph.nodes().get(*id).unwrap().phase == Phase::Gradient)
        .count()
}

pub fn test_weights_persist_across_batch_sizes(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut dense = Dense::new(2);
    let small = dense
        .call(&mut graph, &[ndarray::ArrayD::<f32>::ones(vec![4, 3]).into()])
        .unwrap();
    assert_eq!(graph.forward(small).unwrap().shape(), &[4, 2]);
    let w = dense.param("w").unwrap();
    let before = w.to_array().unwrap();
    assert_eq!(before.shape(), &[3, 2]);

    let large = dense
        .call(&mut graph, &[ndarray::ArrayD::<f32>::ones(vec![7, 3]).into()])
        .unwrap();
    assert_eq!(graph.forward(large).unwrap().shape(), &[7, 2]);
    assert_eq!(dense.param("w").unwrap().id(), w.id());
    assert_eq!(w.to_array().unwrap(), before);
    assert_eq!(dense.state().last, Some(large));
}

pub fn test_sequential_shapes(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut model = Sequential::new(vec![
        Box::new(Dense::new(4)) as Box<dyn GraphFactory>,
        Box::new(Dense::new(5)),
    ]);
    let y = model
        .call(&mut graph, &[matrix(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).into()])
        .unwrap();
    assert_eq!(graph.forward(y).unwrap().shape(), &[2, 5]);
    let names: Vec<&str> = model.children().into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["0", "1"]);
    assert_eq!(
        model.layer(1).unwrap().state().params["w"].shape(),
        vec![4, 5]
    );
}

pub fn test_without_updates_detaches(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut dense = Dense::new(2);
    let x = matrix(&[[1.0, 2.0, 3.0]]);
    dense
        .without_updates(|dense| dense.call(&mut graph, &[x.clone().into()]))
        .unwrap();
    assert_eq!(gradient_nodes(&graph), 0);
    assert!(dense.state().make_update_graphs);
    assert!(dense.bias().unwrap().state().make_update_graphs);

    dense.call(&mut graph, &[x.into()]).unwrap();
    // One update for `w`, one for the bias child's `b`.
    assert_eq!(gradient_nodes(&graph), 2);
}

pub fn test_dropout_inference(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut dropout = Dropout::new(0.5).unwrap();
    let x = ndarray::ArrayD::<f32>::ones(vec![10, 10]);

    let eval = dropout
        .with_inference(|dropout| dropout.call(&mut graph, &[x.clone().into()]))
        .unwrap();
    assert_eq!(graph.forward(eval).unwrap(), x);

    let train = dropout.call(&mut graph, &[x.into()]).unwrap();
    let y = graph.forward(train).unwrap();
    assert!(y.iter().all(|v| *v == 0.0 || *v == 2.0));
    assert!(y.iter().any(|v| *v == 0.0));
    assert!(matches!(
        Dropout::new(0.0),
        Err(ConfigurationError::InvalidHyperparameter { .. })
    ));
}

pub fn test_policy_names(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut dense = Dense::new(1);
    assert!(matches!(
        dense.set_optimizer_by_name("nadam"),
        Err(ConfigurationError::UnknownOptimizer(_))
    ));
    assert!(matches!(
        dense.set_decay_by_name("l1"),
        Err(ConfigurationError::UnknownDecay(_))
    ));
    assert!(matches!(
        dense.set_activation("swish"),
        Err(ConfigurationError::UnknownActivation(_))
    ));

    dense.set_optimizer_by_name("Adam").unwrap();
    dense.set_decay_by_name("l2").unwrap();
    dense.call(&mut graph, &[matrix(&[[1.0, 2.0]]).into()]).unwrap();
    assert_eq!(dense.param("w").unwrap().optimizer(), Some(Optimizer::adam()));
    let b = dense.bias().unwrap().param("b").unwrap();
    assert_eq!(b.optimizer(), Some(Optimizer::adam()));
    assert!(b.decay().is_some());
}

pub fn test_activation_policy(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut dense = Dense::new(8);
    dense.set_activation("relu").unwrap();
    let y = dense
        .call(&mut graph, &[matrix(&[[1.0, -2.0, 3.0], [-4.0, 5.0, -6.0]]).into()])
        .unwrap();
    let out = graph.forward(y).unwrap();
    assert_eq!(out.shape(), &[2, 8]);
    assert!(out.iter().all(|v| *v >= 0.0));
}

pub fn test_updated_weights_reach_next_connect(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut dense = Dense::new(2);
    let x = matrix(&[[1.0, 2.0, 3.0]]);
    let first = dense.call(&mut graph, &[x.clone().into()]).unwrap();
    let before = graph.forward(first).unwrap();
    let loss = ConstantLoss::new().call(&mut graph, &[first.into()]).unwrap();
    graph
        .update(loss, Some(Optimizer::sgd(0.1, 0.0)))
        .unwrap();

    let second = dense.call(&mut graph, &[x.into()]).unwrap();
    let after = graph.forward(second).unwrap();
    assert_ne!(after, before);
    // Each output moves by 0.1 · (1 + 4 + 9) through `w` and 0.1 through the bias.
    assert_close(&after, &before.mapv(|v| v - 1.5), 1e-5);
}

pub fn test_scoped_settings_are_restored(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let x = ndarray::ArrayD::<f32>::ones(vec![10, 10]);
    let mut dropout = Dropout::new(0.5).unwrap();
    dropout.apply_setting(&FactorySetting::Inference(Some(false)));
    let eval = dropout
        .with_inference(|dropout| dropout.call(&mut graph, &[x.clone().into()]))
        .unwrap();
    assert_eq!(graph.forward(eval).unwrap(), x);
    assert_eq!(dropout.state().inference, Some(false));
    let train = dropout.call(&mut graph, &[x.into()]).unwrap();
    assert!(graph.forward(train).unwrap().iter().any(|v| *v == 0.0));

    let mut dense = Dense::new(2);
    dense.apply_setting(&FactorySetting::MakeUpdates(false));
    dense
        .without_updates(|dense| dense.call(&mut graph, &[matrix(&[[1.0]]).into()]))
        .unwrap();
    assert!(!dense.state().make_update_graphs);
    assert!(!dense.bias().unwrap().state().make_update_graphs);
    dense.with_inference(|_| ());
    assert_eq!(dense.state().inference, None);
    assert_eq!(dense.bias().unwrap().state().inference, None);
}
