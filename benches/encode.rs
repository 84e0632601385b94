// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use edgefirst_capture::{
    buffer::PixelFormat,
    encoder::{Compressor, TurboJpeg},
};

fn gradient(width: u32, height: u32) -> Vec<u8> {
    let mut yuv = vec![128; PixelFormat::Yuv420.frame_size(width, height)];
    let (w, h) = (width as usize, height as usize);
    for (i, luma) in yuv[..w * h].iter_mut().enumerate() {
        *luma = ((i % w + i / w) & 0xff) as u8;
    }
    yuv
}

pub fn benchmark_encode(c: &mut Criterion) {
    let mut codec = TurboJpeg::new().unwrap();
    let mut group = c.benchmark_group("jpeg");
    for (width, height) in [
        (320, 240),
        (640, 480),
        (960, 540),
        (1280, 720),
        (1920, 1080),
        (3840, 2160),
    ] {
        let yuv = gradient(width, height);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{width}x{height}")),
            &yuv,
            |b, yuv| b.iter(|| codec.compress(yuv, width, height, 85).unwrap()),
        );
    }
    group.finish();
}

criterion_group!(benches, benchmark_encode);
criterion_main!(benches);
