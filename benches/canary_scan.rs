// CLASSIFICATION: COMMUNITY
// Filename: canary_scan.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use clcanary::canary::{first_corrupted_byte, poison_region, ImageGeometry, POISON_FILL_LENGTH};
use clcanary::runtime::image::{ChannelOrder, ChannelType, ImageDesc, ImageFormat};

fn bench_linear_scan(c: &mut Criterion) {
    let clean = poison_region(POISON_FILL_LENGTH);
    let mut dirty = clean.clone();
    dirty[POISON_FILL_LENGTH - 5] = 0;
    c.bench_function("scan_clean_canary", |b| b.iter(|| first_corrupted_byte(black_box(&clean))));
    c.bench_function("scan_late_corruption", |b| b.iter(|| first_corrupted_byte(black_box(&dirty))));
}

fn bench_image_gather(c: &mut Criterion) {
    let format = ImageFormat::new(ChannelOrder::Rgba, ChannelType::UnormInt8);
    let geom = ImageGeometry::from_data(&ImageDesc::image_3d(64, 64, 8), &format);
    let image = poison_region(geom.total_bytes());
    c.bench_function("gather_image_canary", |b| {
        b.iter(|| {
            let canary = geom.gather_canary(black_box(&image));
            first_corrupted_byte(&canary)
        })
    });
}

criterion_group!(benches, bench_linear_scan, bench_image_gather);
criterion_main!(benches);
