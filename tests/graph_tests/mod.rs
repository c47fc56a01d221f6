use ndarray::{Array2, ArrayD};

pub mod basics;
pub mod executor;
pub mod factory;
pub mod persistence;

pub fn matrix<const N: usize>(rows: &[[f32; N]]) -> ArrayD<f32> {
    let data: Vec<f32> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), N), data)
        .unwrap()
        .into_dyn()
}

pub fn assert_close(value: &ArrayD<f32>, correct: &ArrayD<f32>, atol: f32) {
    assert_eq!(value.shape(), correct.shape());
    for (a, b) in value.iter().zip(correct.iter()) {
        let err = (a - b).abs();
        assert!(err <= atol, "{a} != {b}: {err} > {atol}");
    }
}
