use criterion::{criterion_group, criterion_main, Criterion};
use sixelkit::encoder::{Encoder, EncoderConfig};
use sixelkit::frame::Frame;
use sixelkit::options::{DiffusionMethod, FinalMerge, QuantizeModel};
use sixelkit::pixelformat::PixelFormat;
use std::hint::black_box;

fn generate_gradient_rgb(width: usize, height: usize) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        for x in 0..width {
            let r = ((x * 255) / width.max(1)) as u8;
            let g = ((y * 255) / height.max(1)) as u8;
            let b = 128;
            pixels.push(r);
            pixels.push(g);
            pixels.push(b);
        }
    }
    pixels
}

fn generate_noise_rgb(width: usize, height: usize) -> Vec<u8> {
    // Deterministic pseudo-noise so runs are comparable.
    let mut state = 0x2545f4914f6cdd1du64;
    let mut pixels = Vec::with_capacity(width * height * 3);
    for _ in 0..width * height * 3 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        pixels.push((state >> 56) as u8);
    }
    pixels
}

fn encode_with(frame: &Frame, config: EncoderConfig) -> Vec<u8> {
    let mut encoder = Encoder::with_config(config);
    let mut out = Vec::new();
    encoder.encode_frame(frame, &mut out).expect("encode failed");
    out
}

fn bench_encode_gradient(c: &mut Criterion) {
    let width = 640;
    let height = 480;
    let frame = Frame::new(
        generate_gradient_rgb(width, height),
        width,
        height,
        PixelFormat::Rgb888,
    )
    .unwrap();

    c.bench_function(&format!("encode_gradient_{}x{}", width, height), |b| {
        b.iter(|| encode_with(black_box(&frame), EncoderConfig::default()))
    });
}

fn bench_encode_noise(c: &mut Criterion) {
    let width = 640;
    let height = 480;
    let frame = Frame::new(
        generate_noise_rgb(width, height),
        width,
        height,
        PixelFormat::Rgb888,
    )
    .unwrap();

    c.bench_function("encode_noise_default", |b| {
        b.iter(|| encode_with(black_box(&frame), EncoderConfig::default()))
    });
}

fn bench_quantizer_heckbert(c: &mut Criterion) {
    let frame = Frame::new(
        generate_noise_rgb(320, 240),
        320,
        240,
        PixelFormat::Rgb888,
    )
    .unwrap();

    let mut config = EncoderConfig::default();
    config.quantize_model = QuantizeModel::Heckbert;
    config.reqcolors = 256;

    c.bench_function("quantizer_heckbert_256colors", |b| {
        b.iter(|| encode_with(black_box(&frame), config.clone()))
    });
}

fn bench_quantizer_kmeans_ward(c: &mut Criterion) {
    let frame = Frame::new(
        generate_noise_rgb(320, 240),
        320,
        240,
        PixelFormat::Rgb888,
    )
    .unwrap();

    let mut config = EncoderConfig::default();
    config.quantize_model = QuantizeModel::Kmeans;
    config.final_merge = FinalMerge::Ward;
    config.reqcolors = 64;

    c.bench_function("quantizer_kmeans_ward_64colors", |b| {
        b.iter(|| encode_with(black_box(&frame), config.clone()))
    });
}

fn bench_diffusion_kernels(c: &mut Criterion) {
    let frame = Frame::new(
        generate_gradient_rgb(320, 240),
        320,
        240,
        PixelFormat::Rgb888,
    )
    .unwrap();

    for method in [
        DiffusionMethod::Fs,
        DiffusionMethod::JaJuNi,
        DiffusionMethod::ADither,
        DiffusionMethod::Lso2,
    ] {
        let mut config = EncoderConfig::default();
        config.method_for_diffuse = method;
        config.reqcolors = 16;
        c.bench_function(&format!("diffusion_{:?}_16colors", method), |b| {
            b.iter(|| encode_with(black_box(&frame), config.clone()))
        });
    }
}

criterion_group!(
    benches,
    bench_encode_gradient,
    bench_encode_noise,
    bench_quantizer_heckbert,
    bench_quantizer_kmeans_ward,
    bench_diffusion_kernels
);
criterion_main!(benches);
