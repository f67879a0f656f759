//! Checkpointable block wrapper.
//!
//! candle has no recompute-on-backward hook, so `use_checkpoint` is a
//! compatibility toggle mirroring the FiD `set_checkpoint` API: it changes
//! neither outputs nor memory use. The only effect is that a block in
//! checkpoint mode ignores `use_cache`. Encoder blocks, the only ones
//! `FidT5::set_checkpoint` reaches, never cache anyway.

use candle_core::{Result, Tensor};

use super::block::{BlockInputs, T5Block};

/// Wraps a [`T5Block`] with a checkpointing toggle.
#[derive(Debug, Clone)]
pub struct CheckpointWrapper {
    module: T5Block,
    use_checkpoint: bool,
}

impl CheckpointWrapper {
    /// Wraps a block.
    pub fn new(module: T5Block, use_checkpoint: bool) -> Self {
        Self {
            module,
            use_checkpoint,
        }
    }

    /// Whether checkpoint mode is on.
    pub fn use_checkpoint(&self) -> bool {
        self.use_checkpoint
    }

    /// Enables or disables checkpoint mode.
    pub fn set_checkpoint(&mut self, use_checkpoint: bool) {
        self.use_checkpoint = use_checkpoint;
    }

    /// The wrapped block.
    pub fn module(&self) -> &T5Block {
        &self.module
    }

    /// The wrapped block, mutably.
    pub fn module_mut(&mut self) -> &mut T5Block {
        &mut self.module
    }

    /// Unwraps the block.
    pub fn into_inner(self) -> T5Block {
        self.module
    }

    /// Runs the wrapped block.
    pub fn forward(
        &mut self,
        hidden_states: &Tensor,
        inputs: BlockInputs<'_>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let inputs = BlockInputs {
            use_cache: inputs.use_cache && !self.use_checkpoint,
            ..inputs
        };
        self.module.forward(hidden_states, inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReaderConfig;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    fn decoder_block() -> T5Block {
        let config = ReaderConfig {
            vocab_size: 64,
            d_model: 16,
            d_kv: 4,
            d_ff: 32,
            num_layers: 1,
            num_heads: 4,
            relative_attention_num_buckets: 8,
            relative_attention_max_distance: 16,
            ..ReaderConfig::default()
        };
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        T5Block::new(&config, true, true, vb).unwrap()
    }

    #[test]
    fn test_checkpoint_mode_only_disables_cache() {
        let device = Device::Cpu;
        let x = Tensor::randn(0.0f32, 1.0, (1, 2, 16), &device).unwrap();
        let encoder = Tensor::randn(0.0f32, 1.0, (1, 5, 16), &device).unwrap();
        let inputs = BlockInputs {
            encoder_hidden_states: Some(&encoder),
            use_cache: true,
            ..BlockInputs::default()
        };

        let mut plain = CheckpointWrapper::new(decoder_block(), false);
        let (expected, _) = plain.forward(&x, inputs).unwrap();
        assert_eq!(plain.module().self_attention().cached_len(), 2);

        let mut wrapped = CheckpointWrapper::new(decoder_block(), true);
        let (actual, _) = wrapped.forward(&x, inputs).unwrap();
        assert_eq!(wrapped.module().self_attention().cached_len(), 0);

        let expected: Vec<f32> = expected.flatten_all().unwrap().to_vec1().unwrap();
        let actual: Vec<f32> = actual.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(expected, actual);
    }
}
