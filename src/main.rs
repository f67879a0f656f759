use std::path::PathBuf;

use anyhow::Context;
use candle_core::{DType, Device};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use fid::logging::{self, LogFormat};
use fid::{load_examples, save_examples, FidReader, PassageRanker, ReaderOptions, SamplingConfig};

#[derive(Parser, Debug)]
#[command(name = "fid")]
#[command(about = "Fusion-in-Decoder question answering", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer questions with a FiD reader
    Answer(AnswerArgs),
    /// Score and rank passages with a retriever
    Rank(RankArgs),
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Checkpoint directory or HuggingFace model ID
    #[arg(short, long)]
    model: String,

    /// Hub revision
    #[arg(long, default_value = "main")]
    revision: String,

    /// tokenizer.json to use when the checkpoint ships none
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Weight dtype
    #[arg(long, value_enum, default_value = "f32")]
    dtype: WeightDType,

    /// Run on CPU even when a GPU is available
    #[arg(long)]
    cpu: bool,
}

#[derive(Args, Debug)]
struct AnswerArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// FiD JSON (or JSON lines) file with questions and passages
    #[arg(short, long)]
    data: PathBuf,

    /// Write the examples back with cross-attention scores in ctxs[].score
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of passages per question
    #[arg(long)]
    n_context: Option<usize>,

    /// Maximum tokens per question + passage
    #[arg(long, default_value = "200")]
    text_maxlength: usize,

    /// Maximum decoder length (start token included)
    #[arg(long, default_value = "50")]
    max_length: usize,

    /// Sampling temperature (0 = greedy)
    #[arg(long, default_value = "0.0")]
    temperature: f32,

    /// Top-k sampling (0 = disabled)
    #[arg(long, default_value = "0")]
    top_k: usize,

    /// Top-p sampling (1.0 = disabled)
    #[arg(long, default_value = "1.0")]
    top_p: f32,

    /// Sampling seed
    #[arg(long)]
    seed: Option<u64>,

    /// Questions per forward pass
    #[arg(long, default_value = "1")]
    batch_size: usize,

    /// Compute cross-attention passage scores
    #[arg(long)]
    passage_scores: bool,
}

#[derive(Args, Debug)]
struct RankArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// FiD JSON (or JSON lines) file with questions and passages
    #[arg(short, long)]
    data: PathBuf,

    /// Write the examples back with passages reordered by retriever score
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of passages per question
    #[arg(long)]
    n_context: Option<usize>,

    /// Treat the model as a plain BERT checkpoint and start a fresh projection head
    #[arg(long)]
    init_from_bert: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum WeightDType {
    F32,
    F16,
    Bf16,
}

impl From<WeightDType> for DType {
    fn from(value: WeightDType) -> Self {
        match value {
            WeightDType::F32 => DType::F32,
            WeightDType::F16 => DType::F16,
            WeightDType::Bf16 => DType::BF16,
        }
    }
}

impl ModelArgs {
    fn device(&self) -> anyhow::Result<Device> {
        if self.cpu {
            Ok(Device::Cpu)
        } else {
            Ok(Device::cuda_if_available(0)?)
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, LogFormat::from_env())?;
    info!("fid v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Answer(args) => answer(args),
        Command::Rank(args) => rank(args),
    }
}

fn answer(args: AnswerArgs) -> anyhow::Result<()> {
    let device = args.model.device()?;
    let options = ReaderOptions {
        n_context: args.n_context,
        text_maxlength: args.text_maxlength,
        with_passage_scores: args.passage_scores,
        ..ReaderOptions::default()
    };
    let sampling = SamplingConfig {
        temperature: args.temperature,
        top_k: args.top_k,
        top_p: args.top_p,
        max_length: args.max_length,
        seed: args.seed,
    };
    let mut reader = FidReader::from_pretrained(
        &args.model.model,
        &args.model.revision,
        args.model.tokenizer.as_deref(),
        &device,
        args.model.dtype.into(),
        options,
        &sampling,
    )?;

    let mut examples = load_examples(&args.data)
        .with_context(|| format!("reading {}", args.data.display()))?;
    info!(examples = examples.len(), "answering");

    for batch in examples.chunks_mut(args.batch_size.max(1)) {
        let answers = reader.answer_batch(batch)?;
        for (example, answer) in batch.iter_mut().zip(answers) {
            let record = serde_json::json!({
                "id": example.id,
                "question": example.question,
                "answer": answer.text,
                "passage_scores": answer.passage_scores,
            });
            println!("{record}");

            if let Some(scores) = answer.passage_scores {
                for (passage, score) in example.ctxs.iter_mut().zip(scores) {
                    passage.score = Some(score);
                }
            }
        }
    }

    if let Some(output) = &args.output {
        save_examples(output, &examples)?;
        info!(path = %output.display(), "wrote examples");
    }
    Ok(())
}

fn rank(args: RankArgs) -> anyhow::Result<()> {
    let device = args.model.device()?;
    let load = if args.init_from_bert {
        PassageRanker::from_bert
    } else {
        PassageRanker::from_pretrained
    };
    let ranker = load(
        &args.model.model,
        &args.model.revision,
        args.model.tokenizer.as_deref(),
        &device,
        args.model.dtype.into(),
    )?;

    let mut examples = load_examples(&args.data)
        .with_context(|| format!("reading {}", args.data.display()))?;
    info!(examples = examples.len(), "ranking");

    for example in &mut examples {
        ranker.rerank(example, args.n_context)?;
        let record = serde_json::json!({
            "id": example.id,
            "question": example.question,
            "ranking": example
                .ctxs
                .iter()
                .map(|p| serde_json::json!({"title": p.title, "score": p.score}))
                .collect::<Vec<_>>(),
        });
        println!("{record}");
    }

    if let Some(output) = &args.output {
        save_examples(output, &examples)?;
        info!(path = %output.display(), "wrote examples");
    }
    Ok(())
}
