//! Model downloading and ONNX session management.

use crate::config::{Config, Device, ModelDtype};
use crate::{Error, Result};
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use ort::session::Session;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

/// HuggingFace model repository ID.
pub const MODEL_REPO: &str = "ResembleAI/chatterbox-turbo-ONNX";

/// Paths to downloaded ONNX model files.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub speech_encoder: PathBuf,
    pub embed_tokens: PathBuf,
    pub language_model: PathBuf,
    pub conditional_decoder: PathBuf,
    pub tokenizer: PathBuf,
}

/// Download models from HuggingFace Hub.
///
/// Models are cached locally after first download.
pub fn download_models(dtype: ModelDtype, cache_dir: Option<&Path>) -> Result<ModelPaths> {
    let mut builder = ApiBuilder::new();
    if let Some(dir) = cache_dir {
        builder = builder.with_cache_dir(dir.to_path_buf());
    }
    let api = builder
        .build()
        .map_err(|e| Error::Model(format!("Failed to create HF API: {}", e)))?;
    let repo = api.repo(Repo::new(MODEL_REPO.to_string(), RepoType::Model));

    let suffix = dtype.suffix();

    let get_model = |name: &str| -> Result<PathBuf> {
        let filename = format!("{}{}.onnx", name, suffix);
        info!(file = %filename, "fetching model");

        let model_path = repo
            .get(&format!("onnx/{}", filename))
            .map_err(|e| Error::Model(format!("Failed to download {}: {}", filename, e)))?;

        // Not every export has an external data file.
        let data_filename = format!("onnx/{}_data", filename);
        if repo.get(&data_filename).is_err() {
            debug!(file = %data_filename, "no external weights file");
        }

        Ok(model_path)
    };

    let tokenizer = repo
        .get("tokenizer.json")
        .map_err(|e| Error::Model(format!("Failed to download tokenizer: {}", e)))?;

    Ok(ModelPaths {
        speech_encoder: get_model("speech_encoder")?,
        embed_tokens: get_model("embed_tokens")?,
        language_model: get_model("language_model")?,
        conditional_decoder: get_model("conditional_decoder")?,
        tokenizer,
    })
}

/// ONNX sessions for every model component.
///
/// Weights are read-only after loading. `ort` needs `&mut Session` to run, so each session
/// sits behind its own lock and independent components never contend.
pub struct ModelSessions {
    pub speech_encoder: Mutex<Session>,
    pub embed_tokens: Mutex<Session>,
    pub language_model: Mutex<Session>,
    pub conditional_decoder: Mutex<Session>,
    /// Language model input name -> expects f16
    pub lm_input_f16: HashMap<String, bool>,
}

impl ModelSessions {
    /// Initialise ONNX Runtime and load every session.
    pub fn load(paths: &ModelPaths, config: &Config) -> Result<Self> {
        ort::init().with_name("parrot").commit()?;

        let language_model = build_session(&paths.language_model, config)?;
        let lm_input_f16 = language_model
            .inputs
            .iter()
            .map(|input| {
                let type_str = format!("{:?}", input.input_type);
                (input.name.clone(), type_str.contains("Float16"))
            })
            .collect();

        Ok(Self {
            speech_encoder: Mutex::new(build_session(&paths.speech_encoder, config)?),
            embed_tokens: Mutex::new(build_session(&paths.embed_tokens, config)?),
            language_model: Mutex::new(language_model),
            conditional_decoder: Mutex::new(build_session(&paths.conditional_decoder, config)?),
            lm_input_f16,
        })
    }

    /// Whether the language model input `name` expects f16 data.
    pub fn lm_input_is_f16(&self, name: &str) -> bool {
        self.lm_input_f16.get(name).copied().unwrap_or(false)
    }

    /// Names of the language model's KV cache inputs.
    pub fn past_key_value_inputs(&self) -> impl Iterator<Item = &str> {
        self.lm_input_f16
            .keys()
            .map(String::as_str)
            .filter(|name| name.contains("past_key_values"))
    }

    pub fn lm_has_input(&self, name: &str) -> bool {
        self.lm_input_f16.contains_key(name)
    }
}

/// Build a session for the given path with current config.
fn build_session(path: &Path, config: &Config) -> Result<Session> {
    info!(model = %path.display(), device = ?config.device, "loading session");
    let session_builder = Session::builder()?;

    match config.device {
        Device::Cpu => Ok(session_builder.commit_from_file(path)?),
        #[cfg(feature = "cuda")]
        Device::Cuda(_device_id) => {
            let builder = session_builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?;
            Ok(builder.commit_from_file(path)?)
        }
    }
}
