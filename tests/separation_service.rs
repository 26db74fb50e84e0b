use std::{
    collections::HashMap,
    io::Cursor,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        Arc, mpsc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use axum::{
    Router,
    body::{Body, Bytes},
    http::{Request, StatusCode, header},
    routing::get,
};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use tempfile::TempDir;
use tower::ServiceExt;

use stem_separation_service::{
    AppConfig, DeviceSetting, JobId, JobRegistry, JobStatus, ModelKey, SeparationJob, Separator,
    TaskRecord, TimeWindow, build_router,
    audio::AudioBuffer,
    error::EngineError,
    model::{Checkpoint, Device, ModelSpec, SeparationEngine, StemMap, WeightLoadReport},
    staging::StagedInput,
};

const BOUNDARY: &str = "stem-test-boundary";
const SAMPLE_RATE: u32 = 44_100;

/// Counts overlapping `demix` calls.
#[derive(Default)]
struct Occupancy {
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl Occupancy {
    fn occupy(&self, hold: Duration) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(hold);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Splits the mix into four fixed-gain stems so reconciliation is checkable.
#[derive(Default)]
struct FakeEngine {
    fail_inference: bool,
    /// Returns a two-stem result whose accompaniment has one short channel.
    ragged_output: bool,
    gate: Option<Mutex<mpsc::Receiver<()>>>,
    occupancy: Option<Arc<Occupancy>>,
}

impl SeparationEngine for FakeEngine {
    type Model = ();
    type Config = ();
    type Tensor = f32;

    fn build_model(&self, _model_type: &str, _config_path: &Path) -> Result<((), ()), EngineError> {
        Ok(((), ()))
    }

    fn read_checkpoint(&self, _path: &Path, _device: Device) -> Result<Checkpoint<f32>, EngineError> {
        Ok(Checkpoint::new(vec![("state_dict.gain".into(), 1.0)]))
    }

    fn apply_weights(
        &self,
        _model: &mut (),
        weights: Vec<(String, f32)>,
    ) -> Result<WeightLoadReport, EngineError> {
        Ok(WeightLoadReport {
            applied: weights.len(),
            ..Default::default()
        })
    }

    fn prepare(&self, _model: &mut (), _device: Device) -> Result<(), EngineError> {
        Ok(())
    }

    fn demix(
        &self,
        _config: &(),
        _model: &(),
        mix: &AudioBuffer,
        _device: Device,
        _model_type: &str,
    ) -> Result<StemMap, EngineError> {
        if let Some(gate) = &self.gate {
            let _ = gate.lock().recv_timeout(Duration::from_secs(10));
        }
        if let Some(occupancy) = &self.occupancy {
            occupancy.occupy(Duration::from_millis(40));
        }
        if self.fail_inference {
            return Err(EngineError::new("CUDA out of memory"));
        }
        if self.ragged_output {
            let frames = mix.num_frames();
            return Ok(StemMap::from([
                ("vocals".to_string(), mix.clone()),
                (
                    "accompaniment".to_string(),
                    AudioBuffer::new(mix.sample_rate, vec![vec![0.0; frames], vec![0.0; frames - 1]]),
                ),
            ]));
        }
        let scaled = |gain: f32| AudioBuffer {
            sample_rate: mix.sample_rate,
            channels: mix
                .channels
                .iter()
                .map(|c| c.iter().map(|s| s * gain).collect())
                .collect(),
        };
        Ok(StemMap::from([
            ("vocals".to_string(), scaled(0.5)),
            ("drums".to_string(), scaled(0.25)),
            ("bass".to_string(), scaled(0.125)),
            ("other".to_string(), scaled(0.125)),
        ]))
    }

    fn resolve_device(&self, _setting: &DeviceSetting) -> Device {
        Device::Cpu
    }

    fn accelerator_name(&self) -> Option<String> {
        None
    }
}

struct Harness {
    _root: TempDir,
    config: Arc<AppConfig>,
    separator: Arc<Separator<FakeEngine>>,
    router: Router,
}

fn spec(name: &str) -> ModelSpec {
    ModelSpec {
        model_type: "htdemucs".into(),
        config_path: PathBuf::from(format!("{name}.yaml")),
        checkpoint_path: PathBuf::from(format!("{name}.ckpt")),
    }
}

impl Harness {
    fn new(engine: FakeEngine) -> Self {
        Self::with_config(engine, |_| {})
    }

    fn with_config(engine: FakeEngine, adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = AppConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            engine_source_path: root.path().to_path_buf(),
            models: HashMap::from([(ModelKey::Official, spec("official"))]),
            upload_dir: root.path().join("uploads"),
            output_dir: root.path().join("outputs"),
            device: DeviceSetting::Auto,
            max_concurrent_inferences: 1,
            max_upload_bytes: 64 * 1024 * 1024,
            fetch_timeout: Duration::from_secs(5),
        };
        adjust(&mut config);
        config.ensure_directories().unwrap();
        let config = Arc::new(config);

        let registry = Arc::new(JobRegistry::new());
        let separator = Arc::new(Separator::new(&config, Arc::new(engine), registry));
        let router = build_router(config.clone(), separator.clone()).unwrap();

        Self {
            _root: root,
            config,
            separator,
            router,
        }
    }

    fn registry(&self) -> &JobRegistry {
        self.separator.registry()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    async fn submit(&self, parts: &[Part<'_>]) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/separate")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap();
        let (status, body) = self.send(request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>) {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn wait_for_terminal(&self, task_id: &str) -> TaskRecord {
        for _ in 0..500 {
            let (status, body) = self.get(&format!("/separate/status/{task_id}")).await;
            assert_eq!(status, StatusCode::OK);
            let record: TaskRecord = serde_json::from_slice(&body).unwrap();
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached a terminal state");
    }

    async fn submit_sine(&self, model: &str) -> String {
        let wav = sine_wav(0.1, 2);
        let (status, body) = self
            .submit(&[Part::File("file", "sine.wav", &wav), Part::Text("model", model)])
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["task_id"].as_str().unwrap().to_string()
    }

    fn upload_dir_is_empty(&self) -> bool {
        std::fs::read_dir(&self.config.upload_dir).unwrap().next().is_none()
    }
}

enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a str, &'a [u8]),
}

fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File(name, filename, bytes) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// Stereo 16-bit sine WAV.
fn sine_wav(seconds: f32, channels: u16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let frames = (seconds * SAMPLE_RATE as f32) as usize;
        for i in 0..frames {
            let t = i as f32 / SAMPLE_RATE as f32;
            let sample = (t * 440.0 * std::f32::consts::TAU).sin() * 0.5;
            for _ in 0..channels {
                writer.write_sample((sample * i16::MAX as f32) as i16).unwrap();
            }
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Serves `wav` at `/audio/song.wav` on an ephemeral local port.
async fn serve_remote_audio(wav: Vec<u8>) -> SocketAddr {
    let wav = Bytes::from(wav);
    let app = Router::new().route(
        "/audio/song.wav",
        get(move || {
            let wav = wav.clone();
            async move { wav }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

fn wav_shape(bytes: &[u8]) -> (u16, usize) {
    let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
    (reader.spec().channels, reader.duration() as usize)
}

#[tokio::test]
async fn sine_wave_separates_into_two_downloadable_stems() {
    let harness = Harness::new(FakeEngine::default());
    let wav = sine_wav(2.0, 2);

    let (status, body) = harness
        .submit(&[
            Part::File("file", "sine.wav", &wav),
            Part::Text("model", "official"),
        ])
        .await;
    assert_eq!(status, StatusCode::OK);
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let record = harness.wait_for_terminal(&task_id).await;
    assert_eq!(record.status, JobStatus::Completed, "{:?}", record.error);
    assert_eq!(record.model, ModelKey::Official);
    let vocals_url = record.vocals_url.unwrap();
    let accompaniment_url = record.accompaniment_url.unwrap();
    assert_eq!(vocals_url, format!("/files/{task_id}/vocals.wav"));
    assert_eq!(accompaniment_url, format!("/files/{task_id}/accompaniment.wav"));

    for url in [vocals_url, accompaniment_url] {
        let (status, bytes) = harness.get(&url).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(wav_shape(&bytes), (2, 2 * SAMPLE_RATE as usize));
    }
    assert!(harness.upload_dir_is_empty());
}

#[tokio::test]
async fn four_stem_output_is_collapsed_on_disk() {
    let harness = Harness::new(FakeEngine::default());
    let wav = sine_wav(0.1, 1);

    let (_, body) = harness
        .submit(&[Part::File("file", "mono.wav", &wav)])
        .await;
    let task_id = body["task_id"].as_str().unwrap().to_string();
    let record = harness.wait_for_terminal(&task_id).await;
    assert_eq!(record.status, JobStatus::Completed);

    let dir = harness.config.output_dir.join(&task_id);
    let read = |name: &str| {
        let mut reader = hound::WavReader::open(dir.join(name)).unwrap();
        let spec = reader.spec();
        let samples: Vec<f32> = reader.samples::<f32>().map(Result::unwrap).collect();
        (spec.channels, samples)
    };
    let (vocal_channels, vocals) = read("vocals.wav");
    let (_, accompaniment) = read("accompaniment.wav");

    // Mono input is duplicated to stereo, and drums+bass+other = 0.5 * mix = vocals.
    assert_eq!(vocal_channels, 2);
    assert_eq!(vocals.len(), accompaniment.len());
    for (v, a) in vocals.iter().zip(&accompaniment) {
        assert!((v - a).abs() < 1e-6);
    }
    assert!(vocals.iter().any(|s| s.abs() > 0.1));
}

#[tokio::test]
async fn time_window_trims_the_output() {
    let harness = Harness::new(FakeEngine::default());
    let wav = sine_wav(2.0, 2);

    let (_, body) = harness
        .submit(&[
            Part::File("file", "sine.wav", &wav),
            Part::Text("start_time", "0.5"),
            Part::Text("end_time", "1.5"),
        ])
        .await;
    let task_id = body["task_id"].as_str().unwrap().to_string();
    let record = harness.wait_for_terminal(&task_id).await;
    assert_eq!(record.status, JobStatus::Completed);

    let (_, bytes) = harness.get(&record.vocals_url.unwrap()).await;
    assert_eq!(wav_shape(&bytes), (2, SAMPLE_RATE as usize));
}

#[tokio::test]
async fn missing_source_is_rejected_without_a_record() {
    let harness = Harness::new(FakeEngine::default());

    let (status, body) = harness.submit(&[Part::Text("model", "official")]).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("file or audio_url"));
    assert!(harness.registry().is_empty());
}

#[tokio::test]
async fn both_sources_are_rejected_without_a_record() {
    let harness = Harness::new(FakeEngine::default());
    let wav = sine_wav(0.1, 2);

    let (status, _) = harness
        .submit(&[
            Part::File("file", "sine.wav", &wav),
            Part::Text("audio_url", "https://example.com/a.wav"),
        ])
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(harness.registry().is_empty());
    assert!(harness.upload_dir_is_empty());
}

#[tokio::test]
async fn unknown_model_key_is_rejected_without_a_record() {
    let harness = Harness::new(FakeEngine::default());
    let wav = sine_wav(0.1, 2);

    let (status, body) = harness
        .submit(&[
            Part::File("file", "sine.wav", &wav),
            Part::Text("model", "mdx23c"),
        ])
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("official"));
    assert!(harness.registry().is_empty());
    assert!(harness.upload_dir_is_empty());
}

#[tokio::test]
async fn malformed_time_field_is_rejected() {
    let harness = Harness::new(FakeEngine::default());
    let wav = sine_wav(0.1, 2);

    let (status, _) = harness
        .submit(&[
            Part::File("file", "sine.wav", &wav),
            Part::Text("start_time", "soon"),
        ])
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(harness.registry().is_empty());
}

#[tokio::test]
async fn unknown_task_ids_are_not_found() {
    let harness = Harness::new(FakeEngine::default());

    let (status, _) = harness
        .get(&format!("/separate/status/{}", JobId::new()))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = harness.get("/separate/status/not-a-task").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn file_route_rejects_missing_and_escaping_paths() {
    let harness = Harness::new(FakeEngine::default());

    let (status, _) = harness
        .get(&format!("/files/{}/vocals.wav", JobId::new()))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = harness.get("/files/../vocals.wav").await;
    assert_ne!(status, StatusCode::OK);

    let (status, _) = harness.get("/files/x/..").await;
    assert_ne!(status, StatusCode::OK);
}

#[tokio::test]
async fn inference_failure_marks_task_failed_and_cleans_up() {
    let harness = Harness::new(FakeEngine {
        fail_inference: true,
        ..Default::default()
    });
    let wav = sine_wav(0.2, 2);

    let (_, body) = harness
        .submit(&[Part::File("file", "sine.wav", &wav)])
        .await;
    let task_id = body["task_id"].as_str().unwrap().to_string();
    let record = harness.wait_for_terminal(&task_id).await;

    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.unwrap().contains("CUDA out of memory"));
    assert!(record.vocals_url.is_none());
    assert!(!harness.config.output_dir.join(&task_id).exists());
    assert!(harness.upload_dir_is_empty());
}

#[tokio::test]
async fn corrupt_upload_fails_with_decode_error() {
    let harness = Harness::new(FakeEngine::default());

    let (_, body) = harness
        .submit(&[Part::File("file", "broken.wav", b"RIFF....not really")])
        .await;
    let task_id = body["task_id"].as_str().unwrap().to_string();
    let record = harness.wait_for_terminal(&task_id).await;

    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.unwrap().contains("decode"));
    assert!(harness.upload_dir_is_empty());
}

#[tokio::test]
async fn unconfigured_model_fails_the_job() {
    let harness = Harness::new(FakeEngine::default());
    let wav = sine_wav(0.1, 2);

    let (status, body) = harness
        .submit(&[
            Part::File("file", "sine.wav", &wav),
            Part::Text("model", "finetuned"),
        ])
        .await;
    assert_eq!(status, StatusCode::OK);
    let task_id = body["task_id"].as_str().unwrap().to_string();
    let record = harness.wait_for_terminal(&task_id).await;

    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.unwrap().contains("unknown model key"));
}

#[tokio::test]
async fn window_past_the_end_fails_at_slicing_time() {
    let harness = Harness::new(FakeEngine::default());
    let wav = sine_wav(0.5, 2);

    let (_, body) = harness
        .submit(&[
            Part::File("file", "sine.wav", &wav),
            Part::Text("start_time", "3"),
            Part::Text("end_time", "4"),
        ])
        .await;
    let task_id = body["task_id"].as_str().unwrap().to_string();
    let record = harness.wait_for_terminal(&task_id).await;

    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.unwrap().contains("invalid time window"));
}

#[tokio::test]
async fn lifecycle_is_observed_in_order() {
    let (release, gate) = mpsc::channel();
    let harness = Harness::new(FakeEngine {
        gate: Some(Mutex::new(gate)),
        ..Default::default()
    });

    let input_path = harness.config.upload_dir.join("staged.wav");
    std::fs::write(&input_path, sine_wav(0.2, 2)).unwrap();
    let task_id = JobId::new();

    // The current-thread runtime has not polled the job yet.
    let record = harness.separator.submit(SeparationJob {
        task_id,
        model: ModelKey::Official,
        input: StagedInput::new(input_path.clone()),
        window: TimeWindow::default(),
    });
    let mut observed = vec![record.status];
    assert_eq!(harness.registry().get(task_id).unwrap().status, JobStatus::Pending);

    let mut released = false;
    for _ in 0..1_000 {
        let status = harness.registry().get(task_id).unwrap().status;
        if observed.last() != Some(&status) {
            observed.push(status);
        }
        if status == JobStatus::Processing && !released {
            release.send(()).unwrap();
            released = true;
        }
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(
        observed,
        vec![JobStatus::Pending, JobStatus::Processing, JobStatus::Completed]
    );
    assert!(!input_path.exists());
}

#[tokio::test]
async fn health_reports_cpu_and_is_mirrored_under_api() {
    let harness = Harness::new(FakeEngine::default());

    for uri in ["/health", "/api/health"] {
        let (status, body) = harness.get(uri).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["gpu_available"], false);
        assert!(json["gpu_name"].is_null());
        assert_eq!(json["device"], "cpu");
    }
}

#[tokio::test]
async fn ragged_stems_fail_without_leaving_output() {
    let harness = Harness::new(FakeEngine {
        ragged_output: true,
        ..Default::default()
    });

    let task_id = harness.submit_sine("official").await;
    let record = harness.wait_for_terminal(&task_id).await;

    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.unwrap().contains("audio encode failed"));
    assert!(record.vocals_url.is_none());
    assert!(!harness.config.output_dir.join(&task_id).exists());
    let (status, _) = harness.get(&format!("/files/{task_id}/vocals.wav")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(harness.upload_dir_is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inference_cap_serialises_jobs_across_models() {
    let occupancy = Arc::new(Occupancy::default());
    let harness = Harness::with_config(
        FakeEngine {
            occupancy: Some(occupancy.clone()),
            ..Default::default()
        },
        |config| {
            config.max_concurrent_inferences = 1;
            config.models.insert(ModelKey::Finetuned, spec("finetuned"));
        },
    );

    let mut task_ids = Vec::new();
    for model in ["official", "finetuned", "official", "finetuned"] {
        task_ids.push(harness.submit_sine(model).await);
    }
    for task_id in &task_ids {
        let record = harness.wait_for_terminal(task_id).await;
        assert_eq!(record.status, JobStatus::Completed, "{:?}", record.error);
    }

    assert_eq!(occupancy.calls(), 4);
    assert_eq!(occupancy.peak(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_model_runs_one_inference_at_a_time() {
    let occupancy = Arc::new(Occupancy::default());
    let harness = Harness::with_config(
        FakeEngine {
            occupancy: Some(occupancy.clone()),
            ..Default::default()
        },
        |config| config.max_concurrent_inferences = 3,
    );

    let mut task_ids = Vec::new();
    for _ in 0..3 {
        task_ids.push(harness.submit_sine("official").await);
    }
    for task_id in &task_ids {
        let record = harness.wait_for_terminal(task_id).await;
        assert_eq!(record.status, JobStatus::Completed, "{:?}", record.error);
    }

    assert_eq!(occupancy.calls(), 3);
    assert_eq!(occupancy.peak(), 1);
}

#[tokio::test]
async fn audio_url_is_fetched_staged_and_removed() {
    let (release, gate) = mpsc::channel();
    let harness = Harness::new(FakeEngine {
        gate: Some(Mutex::new(gate)),
        ..Default::default()
    });
    let addr = serve_remote_audio(sine_wav(0.5, 2)).await;

    let url = format!("http://{addr}/audio/song.wav");
    let (status, body) = harness.submit(&[Part::Text("audio_url", &url)]).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let task_id = body["task_id"].as_str().unwrap().to_string();

    // The job is held in demix, so the fetched input is still staged.
    assert!(harness.config.upload_dir.join(format!("{task_id}.wav")).exists());
    release.send(()).unwrap();

    let record = harness.wait_for_terminal(&task_id).await;
    assert_eq!(record.status, JobStatus::Completed, "{:?}", record.error);
    let (status, bytes) = harness.get(&record.vocals_url.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(wav_shape(&bytes), (2, SAMPLE_RATE as usize / 2));
    assert!(harness.upload_dir_is_empty());
}

#[tokio::test]
async fn remote_error_status_is_a_bad_gateway() {
    let harness = Harness::new(FakeEngine::default());
    let addr = serve_remote_audio(sine_wav(0.1, 2)).await;

    let url = format!("http://{addr}/audio/missing.wav");
    let (status, body) = harness.submit(&[Part::Text("audio_url", &url)]).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].is_string());
    assert!(harness.registry().is_empty());
    assert!(harness.upload_dir_is_empty());
}
