//! # Parrot Core
//!
//! Voice-cloning speech generation with a mandatory provenance watermark.
//!
//! A request flows through four stages:
//!
//! - **Conditioning**: the first ten seconds of a reference recording become a
//!   [`ConditioningBundle`] (speaker embedding, prompt tokens, acoustic window).
//! - **Decoding**: a guided autoregressive loop asks the token predictor for conditioned and
//!   unconditioned logits, blends them, applies repetition penalty, temperature, min-p and
//!   top-p, and samples until the stop token or `max_tokens`.
//! - **Vocoding**: speech tokens become a waveform.
//! - **Watermarking**: every waveform passes the [`WatermarkGate`] before it is returned.
//!
//! The neural networks are opaque [`capabilities`]. [`onnx::OnnxBackend`] implements them on
//! ONNX Runtime; tests implement them with small deterministic mocks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use parrot_core::{Config, Pipeline, ReferenceRecording, SamplingConfig};
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let pipeline = Pipeline::from_pretrained(Config::default())?;
//! let reference = ReferenceRecording::from_wav("narrator.wav")?;
//!
//! let mut rng = StdRng::seed_from_u64(0);
//! let audio = pipeline.generate(
//!     "Hello world!",
//!     "en",
//!     Some(&reference),
//!     &SamplingConfig::default(),
//!     &mut rng,
//! )?;
//! audio.write_wav("hello.wav")?;
//! # Ok::<(), parrot_core::Error>(())
//! ```

pub mod audio;
pub mod capabilities;
pub mod conditioning;
pub mod config;
pub mod decoder;
pub mod error;
pub mod guidance;
pub mod models;
pub mod onnx;
pub mod pipeline;
pub mod render;
pub mod sampling;
pub mod text;
pub mod voices;
pub mod watermark;

// Re-exports for convenience
pub use audio::ReferenceRecording;
pub use capabilities::TokenId;
pub use conditioning::{ConditioningBuilder, ConditioningBundle};
pub use config::{Config, ConfigBuilder, Device, ModelDtype, PipelineConfig, SamplingConfig};
pub use decoder::{CancelFlag, Decoder, StopReason, StreamEvent, TokenSequence};
pub use error::{Error, Result};
pub use pipeline::{Capabilities, ChunkEvent, Pipeline, VoiceRef};
pub use render::{WatermarkGate, WatermarkedWaveform};
pub use watermark::SpreadSpectrumWatermarker;
