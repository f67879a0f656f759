//! Integration tests for the FiD reader model.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use fid::model::{load_weights, FidT5, ModelFiles, IGNORE_INDEX};
use fid::ReaderConfig;

fn test_device() -> Device {
    Device::Cpu
}

fn tiny_config() -> ReaderConfig {
    ReaderConfig {
        vocab_size: 40,
        d_model: 16,
        d_kv: 4,
        d_ff: 32,
        num_layers: 2,
        num_decoder_layers: Some(2),
        num_heads: 4,
        relative_attention_num_buckets: 8,
        relative_attention_max_distance: 16,
        ..ReaderConfig::default()
    }
}

fn random_model(config: &ReaderConfig) -> FidT5 {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &test_device());
    FidT5::new(config, vb).unwrap()
}

/// batch=2, n_passages=3, passage_length=4; the last passage of each example is padded.
fn inputs() -> (Tensor, Tensor) {
    let device = test_device();
    let ids = Tensor::new(
        &[
            [[5u32, 6, 7, 1], [8, 9, 1, 0], [10, 1, 0, 0]],
            [[11u32, 12, 13, 1], [14, 15, 16, 1], [17, 1, 0, 0]],
        ],
        &device,
    )
    .unwrap();
    let mask = ids.gt(&ids.zeros_like().unwrap()).unwrap().to_dtype(DType::U32).unwrap();
    (ids, mask)
}

fn flatten(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

#[test]
fn test_forward_shapes_and_loss() {
    let config = tiny_config();
    let mut model = random_model(&config);
    let (ids, mask) = inputs();

    let labels = Tensor::new(&[[20i64, 21, 1], [22, 1, IGNORE_INDEX]], &test_device()).unwrap();
    let output = model.forward(&ids, Some(&mask), None, Some(&labels)).unwrap();

    assert_eq!(output.logits.dims(), &[2, 3, 40]);
    assert_eq!(model.n_passages(), 3);
    let loss: f32 = output.loss.unwrap().to_scalar().unwrap();
    assert!(loss.is_finite());
    assert!(loss > 0.0);
}

#[test]
fn test_forward_requires_decoder_inputs_or_labels() {
    let mut model = random_model(&tiny_config());
    let (ids, mask) = inputs();
    assert!(model.forward(&ids, Some(&mask), None, None).is_err());
}

#[test]
fn test_flattened_input_reuses_passage_count() {
    let mut model = random_model(&tiny_config());
    let (ids, mask) = inputs();
    let decoder_ids = Tensor::new(&[[0u32, 20], [0, 22]], &test_device()).unwrap();

    let nested = model
        .forward(&ids, Some(&mask), Some(&decoder_ids), None)
        .unwrap();

    let flat_ids = ids.reshape((2, 12)).unwrap();
    let flat_mask = mask.reshape((2, 12)).unwrap();
    let flat = model
        .forward(&flat_ids, Some(&flat_mask), Some(&decoder_ids), None)
        .unwrap();

    assert_eq!(model.n_passages(), 3);
    for (a, b) in flatten(&nested.logits).iter().zip(flatten(&flat.logits).iter()) {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn test_checkpoint_mode_does_not_change_logits() {
    let mut model = random_model(&tiny_config());
    let (ids, mask) = inputs();
    let decoder_ids = Tensor::new(&[[0u32, 20], [0, 22]], &test_device()).unwrap();

    let plain = model
        .forward(&ids, Some(&mask), Some(&decoder_ids), None)
        .unwrap();
    model.set_checkpoint(true);
    assert!(model.encoder().stack().uses_checkpoint());
    let checkpointed = model
        .forward(&ids, Some(&mask), Some(&decoder_ids), None)
        .unwrap();

    assert_eq!(flatten(&plain.logits), flatten(&checkpointed.logits));
}

#[test]
fn test_generate_respects_max_length() {
    let mut model = random_model(&tiny_config());
    let (ids, mask) = inputs();

    let generated = model.generate(&ids, &mask, 5).unwrap();
    assert_eq!(generated.len(), 2);
    for tokens in &generated {
        assert!(tokens.len() <= 4);
        assert!(!tokens.contains(&1), "EOS must not be returned");
    }
    // Caches are dropped after generation.
    assert_eq!(model.decoder().cached_len(), 0);

    let again = model.generate(&ids, &mask, 5).unwrap();
    assert_eq!(generated, again);
}

#[test]
fn test_max_length_counts_start_token() {
    let mut model = random_model(&tiny_config());
    let (ids, mask) = inputs();

    let mut steps = 0;
    let generated = model
        .generate_with(&ids, &mask, 4, |logits| {
            steps += 1;
            Ok(vec![7; logits.dim(0)?])
        })
        .unwrap();
    assert_eq!(steps, 3);
    assert_eq!(generated, vec![vec![7, 7, 7], vec![7, 7, 7]]);

    let nothing = model.generate(&ids, &mask, 1).unwrap();
    assert_eq!(nothing, vec![Vec::<u32>::new(), Vec::new()]);
}

#[test]
fn test_generate_stops_on_eos() {
    let mut model = random_model(&tiny_config());
    let (ids, mask) = inputs();
    let eos = model.config().eos_token_id;

    let mut steps = 0;
    let generated = model
        .generate_with(&ids, &mask, 10, |logits| {
            steps += 1;
            let batch = logits.dim(0)?;
            Ok(if steps < 3 { vec![7; batch] } else { vec![eos; batch] })
        })
        .unwrap();

    assert_eq!(steps, 3);
    assert_eq!(generated, vec![vec![7, 7], vec![7, 7]]);
}

#[test]
fn test_generate_matches_forward_on_first_step() {
    let mut model = random_model(&tiny_config());
    let (ids, mask) = inputs();

    let generated = model.generate(&ids, &mask, 2).unwrap();

    let start = Tensor::new(&[[0u32], [0]], &test_device()).unwrap();
    let logits = model
        .forward(&ids, Some(&mask), Some(&start), None)
        .unwrap()
        .logits;
    let greedy: Vec<u32> = logits.squeeze(1).unwrap().argmax(1).unwrap().to_vec1().unwrap();

    for (tokens, expected) in generated.iter().zip(greedy) {
        if expected == 1 {
            assert!(tokens.is_empty());
        } else {
            assert_eq!(tokens, &vec![expected]);
        }
    }
}

#[test]
fn test_crossattention_scores_per_passage() {
    let mut model = random_model(&tiny_config());
    let (ids, mask) = inputs();

    // Nothing stored yet.
    assert!(model.get_crossattention_scores(&mask).is_err());

    model.enable_score_storage();
    model.reset_score_storage();
    model.generate(&ids, &mask, 3).unwrap();

    let scores = model.get_crossattention_scores(&mask).unwrap();
    assert_eq!(scores.dims(), &[2, 3]);
    let values: Vec<Vec<f32>> = scores.to_vec2().unwrap();
    assert!(values.iter().flatten().all(|v| v.is_finite()));

    model.reset_score_storage();
    assert!(model.get_crossattention_scores(&mask).is_err());
}

#[test]
fn test_scores_only_record_first_decoding_call() {
    let mut model = random_model(&tiny_config());
    let (ids, mask) = inputs();
    model.enable_score_storage();

    let decoder_ids = Tensor::new(&[[0u32, 20, 21], [0, 22, 23]], &test_device()).unwrap();
    model.forward(&ids, Some(&mask), Some(&decoder_ids), None).unwrap();
    let first = flatten(&model.get_crossattention_scores(&mask).unwrap());

    // A different input does not overwrite the stored scores until reset.
    let other = Tensor::new(&[[0u32, 30, 31], [0, 32, 33]], &test_device()).unwrap();
    let shifted_ids = (ids.clone() + 2.0).unwrap();
    model.forward(&shifted_ids, Some(&mask), Some(&other), None).unwrap();
    assert_eq!(first, flatten(&model.get_crossattention_scores(&mask).unwrap()));
}

#[test]
fn test_untied_lm_head() {
    let config = ReaderConfig {
        tie_word_embeddings: false,
        feed_forward_proj: "gated-gelu".to_string(),
        ..tiny_config()
    };
    let mut model = random_model(&config);
    let (ids, mask) = inputs();
    let decoder_ids = Tensor::new(&[[0u32], [0]], &test_device()).unwrap();

    let logits = model
        .forward(&ids, Some(&mask), Some(&decoder_ids), None)
        .unwrap()
        .logits;
    assert_eq!(logits.dims(), &[2, 1, 40]);
}

#[test]
fn test_passage_position_embedding_can_be_disabled() {
    let config = ReaderConfig {
        passage_position_embedding: false,
        ..tiny_config()
    };
    let model = FidT5::new(&config, VarBuilder::zeros(DType::F32, &test_device())).unwrap();
    assert!(!model.encoder().uses_passage_position());
    assert!(random_model(&tiny_config()).encoder().uses_passage_position());
}

/// Renames plain T5 encoder tensors the way a wrapped FiD encoder saves them.
fn fid_saved_name(name: &str) -> String {
    match name.strip_prefix("encoder.") {
        Some(rest) => match rest.strip_prefix("block.").and_then(|b| b.split_once('.')) {
            Some((i, tail)) => format!("encoder.encoder.block.{i}.module.{tail}"),
            None => format!("encoder.encoder.{rest}"),
        },
        None => name.to_string(),
    }
}

#[test]
fn test_loads_checkpoint_saved_with_fid_wrappers() {
    let config = tiny_config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &test_device());
    let mut model = FidT5::new(&config, vb).unwrap();
    let (ids, mask) = inputs();
    let decoder_ids = Tensor::new(&[[0u32, 20], [0, 22]], &test_device()).unwrap();
    let expected = model
        .forward(&ids, Some(&mask), Some(&decoder_ids), None)
        .unwrap()
        .logits;

    let mut tensors: HashMap<String, Tensor> = varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(name, var)| (fid_saved_name(name), var.as_tensor().clone()))
        .collect();
    // The wrapped encoder also saves its own handle on the shared embedding.
    let shared = tensors["shared.weight"].clone();
    tensors.insert("encoder.encoder.embed_tokens.weight".to_string(), shared);
    assert!(tensors.contains_key("encoder.encoder.block.0.module.layer.0.SelfAttention.q.weight"));
    assert!(!tensors.contains_key("encoder.block.0.layer.0.SelfAttention.q.weight"));

    let dir = tempfile::tempdir().unwrap();
    candle_core::safetensors::save(&tensors, dir.path().join("model.safetensors")).unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        serde_json::to_string(&config).unwrap(),
    )
    .unwrap();

    let files = ModelFiles::from_dir(dir.path()).unwrap();
    let vb = load_weights(&files, DType::F32, &test_device()).unwrap();
    let mut loaded = FidT5::new(&config, vb).unwrap();
    let logits = loaded
        .forward(&ids, Some(&mask), Some(&decoder_ids), None)
        .unwrap()
        .logits;

    assert_eq!(flatten(&expected), flatten(&logits));
}

#[test]
fn test_loads_plain_t5_checkpoint() {
    let config = tiny_config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &test_device());
    let mut model = FidT5::new(&config, vb).unwrap();
    let (ids, mask) = inputs();
    let decoder_ids = Tensor::new(&[[0u32], [0]], &test_device()).unwrap();
    let expected = model
        .forward(&ids, Some(&mask), Some(&decoder_ids), None)
        .unwrap()
        .logits;

    let dir = tempfile::tempdir().unwrap();
    varmap.save(dir.path().join("model.safetensors")).unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        serde_json::to_string(&config).unwrap(),
    )
    .unwrap();

    let files = ModelFiles::from_dir(dir.path()).unwrap();
    let vb = load_weights(&files, DType::F32, &test_device()).unwrap();
    let mut loaded = FidT5::new(&config, vb).unwrap();
    let logits = loaded
        .forward(&ids, Some(&mask), Some(&decoder_ids), None)
        .unwrap()
        .logits;
    assert_eq!(flatten(&expected), flatten(&logits));
}
