use renom_graph::ops::dense::Dense;
use renom_graph::ops::embedding::Embedding;
use renom_graph::ops::sequential::Sequential;
use renom_graph::{
    ComputationGraph, ExecutionContext, GraphError, GraphFactory, GraphFactoryExt,
};

use crate::graph_tests::matrix;

fn bits(array: &ndarray::ArrayD<f32>) -> Vec<u32> {
    array.iter().map(|x| x.to_bits()).collect()
}

pub fn test_save_load_bit_exact(ctx: &ExecutionContext) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dense.json");
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut dense = Dense::new(3);
    let y = dense
        .call(&mut graph, &[matrix(&[[0.1, 0.2, 0.3, 0.4], [1.0, -1.0, 0.5, 2.0]]).into()])
        .unwrap();
    let expected = graph.forward(y).unwrap();
    dense.param("w").unwrap().set_updatable(false);
    dense.save(&path).unwrap();

    let mut restored = Dense::new(7);
    restored.load(&path, &graph.devices()).unwrap();
    assert_eq!(restored.units(), 3);
    let w = restored.param("w").unwrap();
    assert_eq!(bits(&w.to_array().unwrap()), bits(&dense.param("w").unwrap().to_array().unwrap()));
    assert!(!w.updatable());
    let b = restored.bias().unwrap().param("b").unwrap();
    assert_eq!(b.shape(), vec![1, 3]);

    let y = restored
        .call(&mut graph, &[matrix(&[[0.1, 0.2, 0.3, 0.4], [1.0, -1.0, 0.5, 2.0]]).into()])
        .unwrap();
    assert_eq!(bits(&graph.forward(y).unwrap()), bits(&expected));

    let mut embedding = Embedding::new(5, 2);
    let e = embedding.call(&mut graph, &[matrix(&[[4.0]]).into()]).unwrap();
    graph.forward(e).unwrap();
    let path = dir.path().join("embedding.json");
    embedding.save(&path).unwrap();
    let mut reloaded = Embedding::new(1, 1);
    reloaded.load(&path, &graph.devices()).unwrap();
    assert_eq!(
        bits(&reloaded.param("w").unwrap().to_array().unwrap()),
        bits(&embedding.param("w").unwrap().to_array().unwrap())
    );
}

pub fn test_load_structure_mismatch(ctx: &ExecutionContext) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dense.json");
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut dense = Dense::new(2);
    let y = dense.call(&mut graph, &[matrix(&[[1.0, 2.0]]).into()]).unwrap();
    graph.forward(y).unwrap();
    dense.save(&path).unwrap();

    let mut bare = Dense::new(2).without_bias();
    let result = bare.load(&path, &graph.devices());
    match result {
        Err(GraphError::StructureMismatch { path }) => assert_eq!(path, "root.bias"),
        other => panic!("expected a structure mismatch, got {other:?}"),
    }
    // Nothing was written before the mismatch was found.
    assert!(!bare.param("w").unwrap().is_allocated());
}

pub fn test_load_params(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut source = Dense::new(2);
    let y = source.call(&mut graph, &[matrix(&[[1.0, 2.0, 3.0]]).into()]).unwrap();
    graph.forward(y).unwrap();

    let mut target = Dense::new(2);
    let copied = target
        .load_params(&source.state().params, &graph.devices())
        .unwrap();
    assert_eq!(copied, 1);
    assert_eq!(
        target.param("w").unwrap().to_array().unwrap(),
        source.param("w").unwrap().to_array().unwrap()
    );
    assert_ne!(target.param("w").unwrap().id(), source.param("w").unwrap().id());
    assert!(matches!(
        target.param("v"),
        Err(GraphError::UnknownParameter(_))
    ));
}

pub fn test_sequential_archive_paths(ctx: &ExecutionContext) {
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut model = Sequential::new(vec![
        Box::new(Dense::new(3)) as Box<dyn GraphFactory>,
        Box::new(Dense::new(1).without_bias()),
    ]);
    let y = model.call(&mut graph, &[matrix(&[[1.0, 2.0]]).into()]).unwrap();
    graph.forward(y).unwrap();

    let archive = model.archive().unwrap();
    let paths: Vec<&str> = archive.groups().map(|(path, _)| path.as_str()).collect();
    assert_eq!(paths, vec!["root", "root.0", "root.0.bias", "root.1"]);
    let (_, first) = archive.groups().find(|(path, _)| *path == "root.0").unwrap();
    assert!(first.contains_key("w"));
    assert!(first.contains_key("__dict__.units"));
}

pub fn test_reload_into_same_factory(ctx: &ExecutionContext) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dense.json");
    let mut graph = ComputationGraph::new(ctx.clone());
    let mut dense = Dense::new(2);
    let x = matrix(&[[0.5, -1.5, 2.0]]);
    let y = dense.call(&mut graph, &[x.clone().into()]).unwrap();
    let expected = graph.forward(y).unwrap();
    let w = dense.param("w").unwrap();
    let saved = w.to_array().unwrap();
    dense.save(&path).unwrap();

    w.set_value(saved.mapv(|v| v + 1.0), &graph.devices());
    assert_ne!(bits(&graph.forward(y).unwrap()), bits(&expected));

    dense.load(&path, &graph.devices()).unwrap();
    assert_eq!(dense.param("w").unwrap().id(), w.id());
    assert_eq!(bits(&w.to_array().unwrap()), bits(&saved));
    assert_eq!(bits(&graph.forward(y).unwrap()), bits(&expected));
    let again = dense.call(&mut graph, &[x.into()]).unwrap();
    assert_eq!(bits(&graph.forward(again).unwrap()), bits(&expected));
}
