use ndarray::ArrayD;
use renom_graph::graph::operation::Phase;
use renom_graph::ops::activation::{Activation, ActivationKind};
use renom_graph::ops::arithmetic::Add;
use renom_graph::ops::dense::Dense;
use renom_graph::ops::embedding::Embedding;
use renom_graph::ops::loss::ConstantLoss;
use renom_graph::ops::sequential::Sequential;
use renom_graph::{
    ComputationGraph, ConfigurationError, ExecutionContext, GraphError, GraphFactory,
    GraphFactoryExt, GraphStorage, Initializer, Optimizer, ShapeError,
};

use crate::graph_tests::{assert_close, matrix};

pub fn test_static_add_reforward(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let a = graph.static_input(matrix(&[[1.0, 2.0]]));
    let b = graph.static_input(matrix(&[[3.0, 4.0]]));
    let sum = Add::new().call(&mut graph, &[a.into(), b.into()]).unwrap();
    assert_eq!(graph.forward(sum).unwrap(), matrix(&[[4.0, 6.0]]));

    graph.set_value(a, matrix(&[[10.0, 20.0]])).unwrap();
    assert_eq!(graph.forward(sum).unwrap(), matrix(&[[13.0, 24.0]]));
    assert!(matches!(
        graph.set_value(sum, matrix(&[[0.0, 0.0]])),
        Err(GraphError::NotAStaticInput(_))
    ));
}

pub fn test_diamond_call_list(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let x = graph.static_input(matrix(&[[-1.0, 0.5]]));
    let left = Activation::new(ActivationKind::Relu)
        .call(&mut graph, &[x.into()])
        .unwrap();
    let right = Activation::new(ActivationKind::Tanh)
        .call(&mut graph, &[x.into()])
        .unwrap();
    let joined = Add::new()
        .call(&mut graph, &[left.into(), right.into()])
        .unwrap();
    let fwd = graph.element(joined).unwrap().forward_node();
    assert_eq!(graph.nodes().depth(fwd).unwrap(), 2);

    let expected = graph.forward(joined).unwrap();
    let executor = graph.inference_executor(joined).unwrap();
    let depths = executor.call_list().depths(Phase::Forward).unwrap();
    let sizes: Vec<(usize, usize)> = depths.iter().map(|(d, nodes)| (*d, nodes.len())).collect();
    assert_eq!(sizes, vec![(0, 1), (1, 2), (2, 1)]);
    assert!(executor.call_list().depths(Phase::Backward).is_none());
    assert_eq!(executor.call_list().len(), 4);
    assert_close(
        &expected,
        &matrix(&[[(-1.0f32).tanh(), 0.5 + 0.5f32.tanh()]]),
        1e-6,
    );
}

pub fn test_dense_weight_gradient(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut dense = Dense::new(1)
        .without_bias()
        .with_initializer(Initializer::Constant(0.5));
    let y = dense
        .call(&mut graph, &[matrix(&[[1.0, 2.0, 3.0]]).into()])
        .unwrap();
    let loss = ConstantLoss::new().call(&mut graph, &[y.into()]).unwrap();
    assert_eq!(graph.forward(loss).unwrap().sum(), 3.0);

    let w = dense.param("w").unwrap();
    let grad = graph.gradient(loss, &w).unwrap();
    assert_eq!(grad, matrix(&[[1.0], [2.0], [3.0]]));
    assert!(matches!(
        graph.gradient(loss, &GraphStorage::new()),
        Err(GraphError::NoGradient(_))
    ));
}

pub fn test_shared_parameter_gradient_and_update(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let p = GraphStorage::from_array(matrix(&[[1.0, 2.0]]), &graph.devices());
    let v = graph.variable(p.clone()).unwrap();
    let first = Activation::new(ActivationKind::Relu)
        .call(&mut graph, &[v.into()])
        .unwrap();
    let second = Activation::new(ActivationKind::Relu)
        .call(&mut graph, &[v.into()])
        .unwrap();
    let sum = Add::new()
        .call(&mut graph, &[first.into(), second.into()])
        .unwrap();
    let loss = ConstantLoss::new().call(&mut graph, &[sum.into()]).unwrap();

    assert_eq!(graph.gradient(loss, &p).unwrap(), matrix(&[[2.0, 2.0]]));
    graph
        .update(loss, Some(Optimizer::sgd(0.1, 0.0)))
        .unwrap();
    assert_close(&p.to_array().unwrap(), &matrix(&[[0.8, 1.8]]), 1e-6);

    p.set_updatable(false);
    graph.update(loss, None).unwrap();
    assert_close(&p.to_array().unwrap(), &matrix(&[[0.8, 1.8]]), 1e-6);
}

pub fn test_finalized_backward_fails(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut dense = Dense::new(2);
    let y = dense
        .call(&mut graph, &[matrix(&[[1.0, 2.0, 3.0]]).into()])
        .unwrap();
    let loss = ConstantLoss::new().call(&mut graph, &[y.into()]).unwrap();
    graph.backward(loss).unwrap();
    let before = graph.nodes().len();

    graph.finalize(loss).unwrap();
    assert!(graph.nodes().len() < before);
    assert!(graph.element(loss).unwrap().is_finalized());
    assert!(matches!(graph.backward(loss), Err(GraphError::Finalized(_))));
    // Forward evaluation survives finalization.
    assert_eq!(graph.forward(y).unwrap().shape(), &[1, 2]);
}

pub fn test_embedding_lookup_and_gradient(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut embedding = Embedding::new(3, 2);
    let w = embedding.param("w").unwrap();
    w.set_value(
        matrix(&[[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]]),
        &graph.devices(),
    );
    let y = embedding
        .call(&mut graph, &[matrix(&[[2.0], [0.0], [2.0]]).into()])
        .unwrap();
    assert_eq!(
        graph.forward(y).unwrap(),
        matrix(&[[2.0, 2.0], [0.0, 0.0], [2.0, 2.0]])
    );
    let loss = ConstantLoss::new().call(&mut graph, &[y.into()]).unwrap();
    assert_eq!(
        graph.gradient(loss, &w).unwrap(),
        matrix(&[[1.0, 1.0], [0.0, 0.0], [2.0, 2.0]])
    );
}

pub fn test_embedding_rejects_bad_input(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut embedding = Embedding::new(4, 2);
    let wide = embedding
        .call(&mut graph, &[matrix(&[[1.0, 2.0]]).into()])
        .unwrap();
    assert!(matches!(
        graph.forward(wide),
        Err(GraphError::Shape(ShapeError::FeatureColumns { expected: 1, .. }))
    ));

    let before = graph.nodes().len();
    assert!(matches!(
        embedding.call(&mut graph, &[matrix(&[[1.5]]).into()]),
        Err(GraphError::Configuration(
            ConfigurationError::IntegerInputRequired { .. }
        ))
    ));
    assert!(matches!(
        embedding.call(&mut graph, &[ArrayD::from_elem(vec![2, 1], 9.0f32).into()]),
        Err(GraphError::Configuration(
            ConfigurationError::IndexOutOfRange { index: 9, size: 4, .. }
        ))
    ));
    assert_eq!(graph.nodes().len(), before);

    // A static input rebound after construction is caught when the graph runs.
    let x = graph.static_input(matrix(&[[3.0]]));
    let y = embedding.call(&mut graph, &[x.into()]).unwrap();
    graph.set_value(x, matrix(&[[1.5]])).unwrap();
    assert!(matches!(
        graph.forward(y),
        Err(GraphError::Configuration(
            ConfigurationError::IntegerInputRequired { .. }
        ))
    ));
}

pub fn test_repeated_operand(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let a = graph.static_input(matrix(&[[1.0, 2.0]]));
    let doubled = Add::new().call(&mut graph, &[a.into(), a.into()]).unwrap();
    assert_eq!(graph.forward(doubled).unwrap(), matrix(&[[2.0, 4.0]]));

    let p = GraphStorage::from_array(matrix(&[[1.0, 2.0]]), &graph.devices());
    let v = graph.variable(p.clone()).unwrap();
    let sum = Add::new().call(&mut graph, &[v.into(), v.into()]).unwrap();
    assert_eq!(graph.element(sum).unwrap().update_nodes().len(), 1);
    let loss = ConstantLoss::new().call(&mut graph, &[sum.into()]).unwrap();
    assert_eq!(graph.forward(loss).unwrap().sum(), 6.0);
    assert_eq!(graph.gradient(loss, &p).unwrap(), matrix(&[[2.0, 2.0]]));

    graph
        .update(loss, Some(Optimizer::sgd(0.1, 0.0)))
        .unwrap();
    assert_close(&p.to_array().unwrap(), &matrix(&[[0.8, 1.8]]), 1e-6);
}

pub fn test_failed_call_leaves_no_nodes(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut model = Sequential::new(vec![
        Box::new(Dense::new(3)) as Box<dyn GraphFactory>,
        Box::new(Add::new()),
    ]);
    assert!(matches!(
        model.call(&mut graph, &[matrix(&[[1.0, 2.0]]).into()]),
        Err(GraphError::Configuration(ConfigurationError::InputCount { .. }))
    ));
    assert_eq!(graph.nodes().len(), 0);
    assert!(graph.element_ids().is_empty());
    assert_eq!(model.state().last, None);

    // The graph stays usable after the failed build.
    let x = graph.static_input(matrix(&[[1.0, 2.0]]));
    let y = Dense::new(3).call(&mut graph, &[x.into()]).unwrap();
    assert_eq!(graph.forward(y).unwrap().shape(), &[1, 3]);
}

pub fn test_momentum_survives_rebuild(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let p = GraphStorage::from_array(matrix(&[[1.0]]), &graph.devices());
    let v = graph.variable(p.clone()).unwrap();
    let optimizer = Some(Optimizer::sgd(0.1, 0.5));

    let first = ConstantLoss::new().call(&mut graph, &[v.into()]).unwrap();
    graph.update(first, optimizer).unwrap();
    assert_close(&p.to_array().unwrap(), &matrix(&[[0.9]]), 1e-6);

    // velocity = 0.5 * 0.1 + 0.1
    let second = ConstantLoss::new().call(&mut graph, &[v.into()]).unwrap();
    graph.update(second, optimizer).unwrap();
    assert_close(&p.to_array().unwrap(), &matrix(&[[0.75]]), 1e-6);
}
