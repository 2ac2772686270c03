//! Benchmark for the view-fusion hot path

use cereb_seg_fusion::{fuse, PlaneLogits};
use cereb_seg_core::LabelMap;
use criterion::{criterion_group, criterion_main, Criterion};
use ndarray::Array4;

fn plane_stack(slabs: usize, classes: usize, h: usize, w: usize) -> Vec<Array4<f32>> {
    vec![Array4::from_shape_fn((slabs, classes, h, w), |(n, c, y, x)| {
        ((n * 31 + c * 17 + y * 7 + x) % 97) as f32 / 97.0
    })]
}

fn bench_fuse(criterion: &mut Criterion) {
    let classes = 28i64;
    let side = 64usize;
    let identity = LabelMap::from_pairs((0..classes).map(|id| (id, id))).unwrap();

    criterion.bench_function("fuse_64cube_28class", |bencher| {
        bencher.iter(|| {
            let logits = PlaneLogits {
                axial: plane_stack(side, classes as usize, side, side),
                coronal: plane_stack(side, classes as usize, side, side),
                sagittal: plane_stack(side, classes as usize, side, side),
            };
            fuse(logits, &identity, &identity).unwrap()
        });
    });
}

criterion_group!(benches, bench_fuse);
criterion_main!(benches);
