//! Parrot CLI - watermarked voice-cloning speech generation from the command line.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use parrot_core::capabilities::Watermarker;
use parrot_core::pipeline::DEFAULT_CHUNK_CHARS;
use parrot_core::watermark::DEFAULT_WATERMARK_KEY;
use parrot_core::{
    audio::read_wav, CancelFlag, ChunkEvent, Config, Device, ModelDtype, Pipeline,
    ReferenceRecording, SamplingConfig, SpreadSpectrumWatermarker, VoiceRef,
};

#[derive(Parser)]
#[command(name = "parrot")]
#[command(about = "Parrot - watermarked zero-shot voice cloning")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ModelArgs {
    /// Model precision: fp32, fp16, q8
    #[arg(long, default_value = "fp32")]
    dtype: String,

    /// Use CPU instead of CUDA
    #[arg(long)]
    cpu: bool,

    /// Directory for downloaded model files
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Watermark key
    #[arg(long, default_value_t = DEFAULT_WATERMARK_KEY)]
    watermark_key: u64,
}

#[derive(Args)]
struct SamplingArgs {
    /// Sampling temperature, 0 for greedy decoding
    #[arg(long, default_value = "0.8")]
    temperature: f32,

    /// Nucleus sampling mass
    #[arg(long, default_value = "1.0")]
    top_p: f32,

    /// Minimum probability relative to the most likely token
    #[arg(long, default_value = "0.05")]
    min_p: f32,

    /// Repetition penalty
    #[arg(long, default_value = "1.2")]
    repetition_penalty: f32,

    /// Guidance weight (lower slows fast speakers down)
    #[arg(long, default_value = "0.5")]
    cfg_weight: f32,

    /// Expressiveness (higher is more dramatic and faster)
    #[arg(long, default_value = "0.5")]
    exaggeration: f32,

    /// Maximum tokens to generate
    #[arg(long, default_value = "1000")]
    max_tokens: usize,

    /// Seed for the sampling RNG
    #[arg(long, default_value = "0")]
    seed: u64,
}

impl SamplingArgs {
    fn to_config(&self) -> SamplingConfig {
        SamplingConfig {
            temperature: self.temperature,
            top_p: self.top_p,
            min_p: self.min_p,
            repetition_penalty: self.repetition_penalty,
            cfg_weight: self.cfg_weight,
            max_tokens: self.max_tokens,
            exaggeration: self.exaggeration,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate speech from text
    Generate {
        /// Text to synthesize
        #[arg(short, long)]
        text: String,

        /// Language tag (en, fr, ja, ...)
        #[arg(short, long, default_value = "en")]
        language: String,

        /// Path to voice reference audio (WAV, 5+ seconds)
        #[arg(short, long)]
        voice: Option<PathBuf>,

        /// Voice used when --voice is missing or unusable
        #[arg(long)]
        default_voice: Option<PathBuf>,

        /// Output WAV file path
        #[arg(short, long, default_value = "output.wav")]
        output: PathBuf,

        /// Split long text into sentence chunks
        #[arg(long)]
        chunked: bool,

        #[command(flatten)]
        sampling: SamplingArgs,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Re-voice a recording as another speaker
    Convert {
        /// Speech to convert (WAV)
        #[arg(short, long)]
        source: PathBuf,

        /// Target voice reference (WAV)
        #[arg(short, long)]
        target: PathBuf,

        /// Output WAV file path
        #[arg(short, long, default_value = "converted.wav")]
        output: PathBuf,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Check a WAV file for the provenance watermark
    Detect {
        /// WAV file to check
        path: PathBuf,

        /// Watermark key
        #[arg(long, default_value_t = DEFAULT_WATERMARK_KEY)]
        watermark_key: u64,
    },

    /// Process multiple texts from a JSON file
    Batch {
        /// Input JSON file with batch items
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory for generated WAV files
        #[arg(short, long)]
        output_dir: PathBuf,

        #[command(flatten)]
        sampling: SamplingArgs,

        #[command(flatten)]
        model: ModelArgs,
    },
}

#[derive(serde::Deserialize)]
struct BatchItem {
    text: String,
    #[serde(default = "default_language")]
    language: String,
    voice_id: String,
    voice_path: PathBuf,
    output_file: String,
}

fn default_language() -> String {
    "en".to_string()
}

fn load_pipeline(args: &ModelArgs) -> Result<Pipeline> {
    let device = if args.cpu { Device::Cpu } else { Device::default() };
    let mut builder = Config::builder()
        .device(device)
        .dtype(ModelDtype::parse(&args.dtype)?)
        .watermark_key(args.watermark_key);
    if let Some(dir) = &args.cache_dir {
        builder = builder.cache_dir(dir);
    }
    Ok(Pipeline::from_pretrained(builder.build())?)
}

fn load_recording(path: &Path) -> Result<ReferenceRecording> {
    ReferenceRecording::from_wav(path).with_context(|| format!("reading {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            text,
            language,
            voice,
            default_voice,
            output,
            chunked,
            sampling,
            model,
        } => {
            let config = sampling.to_config();
            config.validate()?;
            let reference = voice.as_deref().map(load_recording).transpose()?;

            let pipeline = load_pipeline(&model)?;
            if let Some(path) = &default_voice {
                pipeline.set_default_voice(&load_recording(path)?)?;
            }

            let mut rng = StdRng::seed_from_u64(sampling.seed);
            let audio = if chunked {
                pipeline.synthesize_chunked(
                    &text,
                    &language,
                    VoiceRef::from(reference.as_ref()),
                    &config,
                    DEFAULT_CHUNK_CHARS,
                    &mut rng,
                    &CancelFlag::new(),
                    &mut |event| {
                        if let ChunkEvent::ChunkStarted { index, total, text } = event {
                            println!(
                                "[{}/{}] {}",
                                index + 1,
                                total,
                                text.chars().take(50).collect::<String>()
                            );
                        }
                    },
                )?
            } else {
                pipeline.generate(&text, &language, reference.as_ref(), &config, &mut rng)?
            };

            audio.write_wav(&output)?;
            println!(
                "Generated {:.2}s of audio -> {}",
                audio.duration_secs(),
                output.display()
            );
        }

        Commands::Convert {
            source,
            target,
            output,
            model,
        } => {
            let source = load_recording(&source)?;
            let target = load_recording(&target)?;

            let pipeline = load_pipeline(&model)?;
            let audio = pipeline.convert_voice(&source, Some(&target))?;

            audio.write_wav(&output)?;
            println!(
                "Converted {:.2}s of audio -> {}",
                audio.duration_secs(),
                output.display()
            );
        }

        Commands::Detect {
            path,
            watermark_key,
        } => {
            let (samples, sample_rate) = read_wav(&path)?;
            let detector = SpreadSpectrumWatermarker::new(watermark_key);
            let found = detector.detect(&samples, sample_rate)?;
            info!(z = detector.score(&samples), "watermark z-score");
            if found {
                println!("{}: watermarked", path.display());
            } else {
                println!("{}: no watermark found", path.display());
            }
        }

        Commands::Batch {
            input,
            output_dir,
            sampling,
            model,
        } => {
            std::fs::create_dir_all(&output_dir)?;

            let content = std::fs::read_to_string(&input)?;
            let items: Vec<BatchItem> = serde_json::from_str(&content)?;
            let config = sampling.to_config();
            config.validate()?;

            let pipeline = load_pipeline(&model)?;
            println!("Processing {} items...", items.len());

            let mut rng = StdRng::seed_from_u64(sampling.seed);
            for (i, item) in items.iter().enumerate() {
                println!(
                    "[{}/{}] {}",
                    i + 1,
                    items.len(),
                    item.text.chars().take(50).collect::<String>()
                );

                if !pipeline.has_voice(&item.voice_id) {
                    pipeline.add_voice(
                        item.voice_id.as_str(),
                        &load_recording(&item.voice_path)?,
                        config.exaggeration,
                    )?;
                }

                let audio = pipeline.synthesize(
                    &item.text,
                    &item.language,
                    VoiceRef::Cached(&item.voice_id),
                    &config,
                    &mut rng,
                    &CancelFlag::new(),
                    &mut |_| {},
                )?;
                audio.write_wav(output_dir.join(&item.output_file))?;
            }

            println!("Batch complete");
        }
    }

    Ok(())
}
