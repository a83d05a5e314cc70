use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::prelude::*;

use merge_lib::{Linear, Module, MultiplyMerge, Sigmoid};

fn build(children: usize, dim: usize) -> MultiplyMerge<f32> {
    let mut merge = MultiplyMerge::new(true, false);
    for _ in 0..children {
        merge.add(Linear::new(dim, dim));
    }
    merge.add(Sigmoid::new());
    merge
}

pub fn merge_forward(c: &mut Criterion) {
    let dim = black_box(64);
    let x = Array2::<f32>::ones((dim, 32));
    for children in [1, 4] {
        let mut merge = build(children, dim);
        c.bench_function(&format!("forward {} linear", children), |b| {
            b.iter(|| merge.forward(&x).unwrap());
        });
    }
}

pub fn merge_backward(c: &mut Criterion) {
    let dim = black_box(64);
    let x = Array2::<f32>::ones((dim, 32));
    let gy = Array2::<f32>::ones((dim, 32));
    let mut merge = build(4, dim);
    merge.forward(&x).unwrap();
    c.bench_function("backward 4 linear", |b| {
        b.iter(|| merge.backward(&gy).unwrap());
    });
    c.bench_function("gradient 4 linear", |b| {
        b.iter(|| merge.gradient(&x, &gy).unwrap());
    });
}

criterion_group!(benches, merge_forward, merge_backward);
criterion_main!(benches);
