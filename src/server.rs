use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::AppConfig,
    error::ServiceError,
    jobs::{JobId, TaskRecord},
    model::{ModelKey, SeparationEngine},
    orchestrator::{SeparationJob, Separator, TimeWindow},
    staging,
};

pub struct AppState<E: SeparationEngine> {
    pub config: Arc<AppConfig>,
    pub separator: Arc<Separator<E>>,
    pub http: reqwest::Client,
}

impl<E: SeparationEngine> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            separator: self.separator.clone(),
            http: self.http.clone(),
        }
    }
}

#[derive(Serialize)]
struct SubmitResponse {
    task_id: JobId,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    gpu_available: bool,
    gpu_name: Option<String>,
    device: String,
    loaded_models: Vec<ModelKey>,
}

pub fn build_router<E: SeparationEngine>(
    config: Arc<AppConfig>,
    separator: Arc<Separator<E>>,
) -> anyhow::Result<Router> {
    let http = reqwest::Client::builder()
        .timeout(config.fetch_timeout)
        .build()?;
    let body_limit = config.max_upload_bytes;
    let state = AppState {
        config,
        separator,
        http,
    };

    let routes = Router::new()
        .route("/health", get(health::<E>))
        .route("/separate", post(submit::<E>))
        .route("/separate/status/:task_id", get(status::<E>))
        .route("/files/:task_id/:filename", get(download::<E>));

    Ok(Router::new()
        .merge(routes.clone())
        .nest("/api", routes)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http()))
}

async fn health<E: SeparationEngine>(State(state): State<AppState<E>>) -> Json<HealthResponse> {
    let gpu_name = state.separator.accelerator_name();
    Json(HealthResponse {
        status: "ok",
        gpu_available: gpu_name.is_some(),
        gpu_name,
        device: state.separator.device().to_string(),
        loaded_models: state.separator.models().loaded_keys(),
    })
}

/// Form fields accepted by the submission route.
#[derive(Default)]
struct SubmitForm {
    file: Option<(Option<String>, Vec<u8>)>,
    audio_url: Option<String>,
    model: Option<String>,
    start_time: Option<f64>,
    end_time: Option<f64>,
}

impl SubmitForm {
    async fn read(multipart: &mut Multipart) -> Result<Self, ServiceError> {
        let mut form = SubmitForm::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => {
                    let filename = field.file_name().map(str::to_string);
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
                    form.file = Some((filename, bytes.to_vec()));
                }
                "audio_url" => form.audio_url = non_empty(read_text(field).await?),
                "model" => form.model = non_empty(read_text(field).await?),
                "start_time" => form.start_time = parse_seconds("start_time", read_text(field).await?)?,
                "end_time" => form.end_time = parse_seconds("end_time", read_text(field).await?)?,
                _ => {}
            }
        }
        Ok(form)
    }
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ServiceError> {
    field
        .text()
        .await
        .map_err(|e| ServiceError::InvalidRequest(e.to_string()))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_seconds(field: &str, raw: String) -> Result<Option<f64>, ServiceError> {
    let Some(value) = non_empty(raw) else {
        return Ok(None);
    };
    value
        .parse::<f64>()
        .map(Some)
        .map_err(|_| ServiceError::InvalidRequest(format!("{field} must be a number of seconds")))
}

async fn submit<E: SeparationEngine>(
    State(state): State<AppState<E>>,
    mut multipart: Multipart,
) -> Result<Json<SubmitResponse>, ServiceError> {
    let form = SubmitForm::read(&mut multipart).await?;

    let model: ModelKey = form
        .model
        .as_deref()
        .unwrap_or(ModelKey::Official.as_str())
        .parse()
        .map_err(ServiceError::InvalidRequest)?;
    let window = TimeWindow {
        start: form.start_time,
        end: form.end_time,
    };

    let task_id = JobId::new();
    let upload_dir = state.config.upload_dir.as_path();
    let input = match (form.file, form.audio_url) {
        (Some((filename, bytes)), None) => {
            staging::stage_upload(upload_dir, task_id, filename.as_deref(), &bytes).await?
        }
        (None, Some(url)) => staging::fetch_url(&state.http, upload_dir, task_id, &url).await?,
        (None, None) => {
            return Err(ServiceError::InvalidRequest(
                "either file or audio_url is required".into(),
            ));
        }
        (Some(_), Some(_)) => {
            return Err(ServiceError::InvalidRequest(
                "provide only one of file or audio_url".into(),
            ));
        }
    };

    let record = state.separator.submit(SeparationJob {
        task_id,
        model,
        input,
        window,
    });
    info!(%task_id, %model, "separation task accepted");

    Ok(Json(SubmitResponse {
        task_id: record.task_id,
    }))
}

async fn status<E: SeparationEngine>(
    State(state): State<AppState<E>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>, ServiceError> {
    JobId::parse(&task_id)
        .and_then(|id| state.separator.registry().get(id))
        .map(Json)
        .ok_or(ServiceError::UnknownJob(task_id))
}

async fn download<E: SeparationEngine>(
    State(state): State<AppState<E>>,
    Path((task_id, filename)): Path<(String, String)>,
) -> Result<Response, ServiceError> {
    if !is_plain_component(&task_id) || !is_plain_component(&filename) {
        return Err(ServiceError::InvalidRequest("invalid file path".into()));
    }

    let path = state.config.output_dir.join(&task_id).join(&filename);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ServiceError::FileNotFound(format!("{task_id}/{filename}")));
        }
        Err(err) => return Err(err.into()),
    };
    let length = file.metadata().await?.len();

    let headers = [
        (header::CONTENT_TYPE, "audio/wav".to_string()),
        (header::CONTENT_LENGTH, length.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

fn is_plain_component(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\'])
        && !value.contains('\0')
}
