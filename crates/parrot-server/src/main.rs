//! Parrot Server - HTTP API for watermarked speech generation.

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use parrot_core::pipeline::DEFAULT_CHUNK_CHARS;
use parrot_core::{
    CancelFlag, Config, Device, ModelDtype, Pipeline, ReferenceRecording, SamplingConfig,
    VoiceRef, WatermarkedWaveform,
};

type AppState = Arc<Pipeline>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dtype = std::env::var("PARROT_DTYPE").unwrap_or_else(|_| "fp32".to_string());
    let device = if std::env::var("PARROT_CPU").is_ok() {
        Device::Cpu
    } else {
        Device::default()
    };

    let config = Config::builder()
        .device(device)
        .dtype(ModelDtype::parse(&dtype)?)
        .build();
    info!(device = ?config.device, dtype = ?config.dtype, "loading pipeline");
    let pipeline = tokio::task::spawn_blocking(move || Pipeline::from_pretrained(config)).await??;

    if let Ok(path) = std::env::var("PARROT_DEFAULT_VOICE") {
        pipeline.set_default_voice(&ReferenceRecording::from_wav(&path)?)?;
        info!(path = %path, "default voice registered");
    }

    let state: AppState = Arc::new(pipeline);

    let app = Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/convert", post(convert))
        .route("/voices", get(list_voices))
        .route("/voices", post(add_voice))
        .route("/voices/:id", delete(remove_voice))
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct GenerateRequest {
    text: String,
    #[serde(default = "default_language")]
    language: String,
    /// Cached voice; the default voice when absent
    #[serde(default)]
    voice_id: Option<String>,
    #[serde(default)]
    sampling: SamplingConfig,
    #[serde(default)]
    seed: u64,
    #[serde(default)]
    chunked: bool,
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Serialize)]
struct AudioResponse {
    sample_rate: u32,
    samples: Vec<f32>,
    duration_secs: f32,
}

impl From<WatermarkedWaveform> for AudioResponse {
    fn from(waveform: WatermarkedWaveform) -> Self {
        Self {
            sample_rate: waveform.sample_rate(),
            duration_secs: waveform.duration_secs(),
            samples: waveform.into_samples(),
        }
    }
}

/// Cancels the request's decoding when the handler future is dropped.
struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

async fn generate(
    State(pipeline): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<AudioResponse>, AppError> {
    let cancel = CancelFlag::new();
    let _guard = CancelOnDrop(cancel.clone());

    let waveform = tokio::task::spawn_blocking(move || {
        let voice = match &req.voice_id {
            Some(id) => VoiceRef::Cached(id),
            None => VoiceRef::Default,
        };
        let mut rng = StdRng::seed_from_u64(req.seed);
        if req.chunked {
            pipeline.synthesize_chunked(
                &req.text,
                &req.language,
                voice,
                &req.sampling,
                DEFAULT_CHUNK_CHARS,
                &mut rng,
                &cancel,
                &mut |_| {},
            )
        } else {
            pipeline.synthesize(
                &req.text,
                &req.language,
                voice,
                &req.sampling,
                &mut rng,
                &cancel,
                &mut |_| {},
            )
        }
    })
    .await??;

    Ok(Json(waveform.into()))
}

/// Multipart fields: `source` (WAV), then either `target` (WAV) or `voice_id`.
async fn convert(
    State(pipeline): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<AudioResponse>, AppError> {
    let mut source: Option<Vec<u8>> = None;
    let mut target: Option<Vec<u8>> = None;
    let mut voice_id: Option<String> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "source" => source = Some(field.bytes().await?.to_vec()),
            "target" => target = Some(field.bytes().await?.to_vec()),
            "voice_id" => voice_id = Some(field.text().await?),
            _ => {}
        }
    }

    let source = source.ok_or_else(|| AppError::bad_request("Missing 'source' field"))?;
    let source = decode_wav(&source)?;
    let target = target.map(|data| decode_wav(&data)).transpose()?;

    let cancel = CancelFlag::new();
    let _guard = CancelOnDrop(cancel.clone());

    let waveform = tokio::task::spawn_blocking(move || {
        let voice = match (&target, &voice_id) {
            (Some(recording), _) => VoiceRef::Recording(recording),
            (None, Some(id)) => VoiceRef::Cached(id),
            (None, None) => VoiceRef::Default,
        };
        pipeline.convert_voice_with(&source, voice, &cancel)
    })
    .await??;

    Ok(Json(waveform.into()))
}

async fn list_voices(State(pipeline): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "voices": pipeline.list_voices() }))
}

#[derive(Deserialize)]
struct AddVoiceQuery {
    exaggeration: Option<f32>,
}

async fn add_voice(
    State(pipeline): State<AppState>,
    query: axum::extract::Query<AddVoiceQuery>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut voice_id: Option<String> = None;
    let mut audio_data: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "id" => voice_id = Some(field.text().await?),
            "audio" => audio_data = Some(field.bytes().await?.to_vec()),
            _ => {}
        }
    }

    let id = voice_id.ok_or_else(|| AppError::bad_request("Missing 'id' field"))?;
    let data = audio_data.ok_or_else(|| AppError::bad_request("Missing 'audio' field"))?;
    let recording = decode_wav(&data)?;
    let exaggeration = query
        .exaggeration
        .unwrap_or(SamplingConfig::default().exaggeration);

    let response_id = id.clone();
    tokio::task::spawn_blocking(move || pipeline.add_voice(id, &recording, exaggeration))
        .await??;

    Ok(Json(
        serde_json::json!({ "id": response_id, "status": "added" }),
    ))
}

async fn remove_voice(State(pipeline): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let removed = pipeline.remove_voice(&id);
    Json(serde_json::json!({ "id": id, "removed": removed }))
}

/// Decode an uploaded WAV through a scratch file.
fn decode_wav(data: &[u8]) -> Result<ReferenceRecording, AppError> {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let temp_path = std::env::temp_dir().join(format!(
        "parrot_upload_{}_{}.wav",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::write(&temp_path, data)?;
    let recording = ReferenceRecording::from_wav(&temp_path);
    if let Err(e) = std::fs::remove_file(&temp_path) {
        warn!(path = %temp_path.display(), error = %e, "failed to remove upload");
    }
    Ok(recording?)
}

// Error handling
enum AppError {
    Pipeline(parrot_core::Error),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl AppError {
    fn bad_request(msg: &str) -> Self {
        AppError::BadRequest(msg.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Pipeline(e @ parrot_core::Error::VoiceNotFound(_)) => {
                (StatusCode::NOT_FOUND, e.to_string())
            }
            AppError::Pipeline(e) if e.is_caller_error() => (StatusCode::BAD_REQUEST, e.to_string()),
            AppError::Pipeline(e) => {
                error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Internal(e) => {
                error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<parrot_core::Error> for AppError {
    fn from(err: parrot_core::Error) -> Self {
        AppError::Pipeline(err)
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(err.into())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.into())
    }
}
