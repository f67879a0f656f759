//! Integration tests for the answer token sampler.

use std::collections::HashSet;

use candle_core::{Device, Tensor};
use fid::{Sampler, SamplingConfig};

fn test_device() -> Device {
    Device::Cpu
}

fn config(temperature: f32, top_k: usize, top_p: f32, seed: u64) -> SamplingConfig {
    SamplingConfig {
        temperature,
        top_k,
        top_p,
        seed: Some(seed),
        ..SamplingConfig::default()
    }
}

#[test]
fn test_default_is_greedy() {
    let mut sampler = Sampler::greedy();
    assert!(sampler.is_greedy());

    let logits = Tensor::new(&[0.1f32, 0.2, 0.3, 10.0, 0.4], &test_device()).unwrap();
    assert_eq!(sampler.sample(&logits).unwrap(), vec![3]);
}

#[test]
fn test_batch_sampling() {
    let mut sampler = Sampler::greedy();
    let logits = Tensor::new(&[[5.0f32, 0.0, 0.0], [0.0, 0.0, 5.0]], &test_device()).unwrap();
    assert_eq!(sampler.sample(&logits).unwrap(), vec![0, 2]);
}

#[test]
fn test_rejects_3d_logits() {
    let mut sampler = Sampler::greedy();
    let logits = Tensor::zeros((1, 1, 4), candle_core::DType::F32, &test_device()).unwrap();
    assert!(sampler.sample(&logits).is_err());
}

#[test]
fn test_temperature_sampling_explores() {
    let mut sampler = Sampler::new(&config(1.0, 0, 1.0, 42));
    let logits = Tensor::new(&[1.0f32, 1.0, 1.0, 1.0, 1.0], &test_device()).unwrap();

    let seen: HashSet<u32> = (0..100)
        .map(|_| sampler.sample(&logits).unwrap()[0])
        .collect();
    assert!(seen.len() > 1, "uniform logits should yield different tokens");
}

#[test]
fn test_top_k_restricts_candidates() {
    let mut sampler = Sampler::new(&config(1.0, 2, 1.0, 7));
    let logits = Tensor::new(&[0.1f32, 0.2, 0.3, 10.0, 9.0], &test_device()).unwrap();

    for _ in 0..50 {
        let token = sampler.sample(&logits).unwrap()[0];
        assert!(token == 3 || token == 4, "sampled {token}");
    }
}

#[test]
fn test_top_p_restricts_candidates() {
    let mut sampler = Sampler::new(&config(1.0, 0, 0.9, 11));
    // Token 0 carries ~88% of the mass, token 1 most of the rest.
    let logits = Tensor::new(&[4.0f32, 2.0, -5.0, -5.0], &test_device()).unwrap();

    for _ in 0..50 {
        let token = sampler.sample(&logits).unwrap()[0];
        assert!(token == 0 || token == 1, "sampled {token}");
    }
}

#[test]
fn test_seed_is_reproducible() {
    let logits = Tensor::new(&[[1.0f32, 1.2, 0.8, 1.1, 0.9, 1.0]], &test_device()).unwrap();
    let draw = |seed| {
        let mut sampler = Sampler::new(&config(1.0, 0, 1.0, seed));
        (0..20)
            .map(|_| sampler.sample(&logits).unwrap()[0])
            .collect::<Vec<_>>()
    };
    assert_eq!(draw(123), draw(123));
}
