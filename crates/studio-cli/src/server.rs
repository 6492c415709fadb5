use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use studio_contracts::credentials::{CredentialStore, Credentials};
use studio_contracts::notification::Notification;
use studio_contracts::progress::{ProgressSignal, ProgressSink};
use studio_contracts::{ErrorKind, StudioError};
use studio_engine::{
    imaging, settings, EngineConfig, GeminiTransport, InteractionController, RequestAdapter,
};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt as _;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Request bodies carry a base64 photo, so the default 2 MB cap is far too small.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub bind: SocketAddr,
    pub queue_size: usize,
}

pub struct AppState {
    config: EngineConfig,
    store: CredentialStore,
    credentials: RwLock<Credentials>,
    admission: Arc<Semaphore>,
    waiting: AtomicUsize,
    queue_size: usize,
}

impl AppState {
    pub fn new(
        config: EngineConfig,
        store: CredentialStore,
        credentials: Credentials,
        queue_size: usize,
    ) -> Self {
        Self {
            config,
            store,
            credentials: RwLock::new(credentials),
            admission: Arc::new(Semaphore::new(1)),
            waiting: AtomicUsize::new(0),
            queue_size,
        }
    }

    fn current_credentials(&self) -> Credentials {
        self.credentials
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|_| Credentials::missing())
    }

    fn replace_credentials(&self, next: Credentials) {
        if let Ok(mut guard) = self.credentials.write() {
            *guard = next;
        }
    }

    /// Takes the single run slot right away when it is free; otherwise waits
    /// for it, with at most `queue_size` requests waiting at once.
    async fn admit(&self) -> Result<OwnedSemaphorePermit, Response> {
        if let Ok(permit) = Arc::clone(&self.admission).try_acquire_owned() {
            return Ok(permit);
        }
        let Some(ticket) = self.enqueue() else {
            warn!(queue_size = self.queue_size, "queue full, rejecting request");
            return Err(notify(
                StatusCode::SERVICE_UNAVAILABLE,
                Notification::error("too many requests are waiting, try again shortly"),
            ));
        };
        let permit = Arc::clone(&self.admission)
            .acquire_owned()
            .await
            .map_err(|err| notify(StatusCode::SERVICE_UNAVAILABLE, Notification::error(err)))?;
        drop(ticket);
        Ok(permit)
    }

    fn enqueue(&self) -> Option<QueueTicket<'_>> {
        let ahead = self.waiting.fetch_add(1, Ordering::SeqCst);
        if ahead >= self.queue_size {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(QueueTicket {
            waiting: &self.waiting,
        })
    }
}

/// Holds a slot in the waiting queue until the request is admitted.
struct QueueTicket<'a> {
    waiting: &'a AtomicUsize,
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Deserialize)]
pub struct TransformBody {
    /// Base64 image bytes, optionally as a `data:` URL.
    image: String,
    prompt: String,
}

#[derive(Debug, Serialize)]
pub struct TransformReply {
    /// Base64 PNG, present only when Gemini returned an image.
    image: Option<String>,
    text: String,
}

#[derive(Debug, Deserialize)]
pub struct KeyBody {
    api_key: String,
}

#[derive(Debug, Serialize)]
pub struct StatusReply {
    status: String,
}

#[derive(Debug, Serialize)]
struct ErrorReply {
    error: String,
    duration_secs: u64,
}

impl From<Notification> for ErrorReply {
    fn from(notification: Notification) -> Self {
        Self {
            error: notification.message,
            duration_secs: notification.duration.as_secs(),
        }
    }
}

/// What `/api/transform/stream` sends: progress milestones, then exactly one
/// `result` or `error` event.
#[derive(Debug)]
enum TransformEvent {
    Progress(ProgressSignal),
    Done(TransformReply),
    Failed(ErrorReply),
}

impl TransformEvent {
    fn into_sse(self) -> Event {
        let (name, data) = match &self {
            Self::Progress(signal) => ("progress", serde_json::to_string(signal)),
            Self::Done(reply) => ("result", serde_json::to_string(reply)),
            Self::Failed(reply) => ("error", serde_json::to_string(reply)),
        };
        Event::default().event(name).data(data.unwrap_or_default())
    }
}

pub fn serve(options: ServeOptions, config: EngineConfig, store: CredentialStore) -> anyhow::Result<i32> {
    let credentials = store
        .load()
        .with_context(|| format!("failed to load {}", store.path().display()))?;
    info!(source = ?credentials.source(), model = %config.model, "credentials loaded");
    let state = Arc::new(AppState::new(config, store, credentials, options.queue_size));

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(options.bind)
            .await
            .with_context(|| format!("failed to bind {}", options.bind))?;
        info!(addr = %options.bind, "serving web UI");
        axum::serve(listener, router(state))
            .await
            .context("web server stopped")?;
        Ok(0)
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/transform", post(transform))
        .route("/api/transform/stream", post(transform_stream))
        .route("/api/key", post(save_key))
        .route("/api/refresh", post(refresh))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn transform(State(state): State<Arc<AppState>>, Json(body): Json<TransformBody>) -> Response {
    let span = info_span!("transform", request_id = %Uuid::new_v4());
    async move {
        let permit = match state.admit().await {
            Ok(permit) => permit,
            Err(rejection) => return rejection,
        };
        let log_progress = |signal: ProgressSignal| {
            debug!(fraction = signal.fraction, label = %signal.label, "progress");
        };

        match spawn_transform(&state, permit, body, log_progress).await {
            Ok(Ok(reply)) => Json(reply).into_response(),
            Ok(Err(err)) => {
                let (status, reply) = failure(err);
                (status, Json(reply)).into_response()
            }
            Err(err) => notify(StatusCode::INTERNAL_SERVER_ERROR, Notification::error(err)),
        }
    }
    .instrument(span)
    .await
}

async fn transform_stream(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TransformBody>,
) -> Response {
    let span = info_span!("transform", request_id = %Uuid::new_v4(), stream = true);
    async move {
        let permit = match state.admit().await {
            Ok(permit) => permit,
            Err(rejection) => return rejection,
        };
        let (events, receiver) = mpsc::unbounded_channel();
        let progress_events = events.clone();
        let forward = move |signal: ProgressSignal| {
            let _ = progress_events.send(TransformEvent::Progress(signal));
        };

        let work = spawn_transform(&state, permit, body, forward);
        tokio::spawn(
            async move {
                let last = match work.await {
                    Ok(Ok(reply)) => TransformEvent::Done(reply),
                    Ok(Err(err)) => TransformEvent::Failed(failure(err).1),
                    Err(err) => TransformEvent::Failed(Notification::error(err).into()),
                };
                let _ = events.send(last);
            }
            .in_current_span(),
        );

        let stream = UnboundedReceiverStream::new(receiver)
            .map(|event| Ok::<_, Infallible>(event.into_sse()));
        Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
    }
    .instrument(span)
    .await
}

/// Runs one transformation on the blocking pool. The permit travels with the
/// work, so the run slot stays taken until Gemini is done even if the client
/// has disconnected.
fn spawn_transform<P>(
    state: &AppState,
    permit: OwnedSemaphorePermit,
    body: TransformBody,
    progress: P,
) -> JoinHandle<studio_contracts::Result<TransformReply>>
where
    P: ProgressSink + Send + 'static,
{
    let credentials = state.current_credentials();
    let config = state.config.clone();
    let span = Span::current();
    tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        let _permit = permit;
        run_transform(&config, credentials, &body, &progress)
    })
}

fn run_transform(
    config: &EngineConfig,
    credentials: Credentials,
    body: &TransformBody,
    progress: &dyn ProgressSink,
) -> studio_contracts::Result<TransformReply> {
    let bytes = decode_image_payload(&body.image)?;
    let image = imaging::decode(&bytes)?;
    let transport = GeminiTransport::new(config.api_base.clone())?;
    let controller = InteractionController::new(RequestAdapter::new(credentials, transport), config);

    let outcome = controller.process(&image, &body.prompt, progress)?;
    let image = outcome
        .download
        .as_ref()
        .map(imaging::encode_png)
        .transpose()?
        .map(|png| BASE64.encode(png));
    Ok(TransformReply {
        image,
        text: outcome.text,
    })
}

fn decode_image_payload(raw: &str) -> studio_contracts::Result<Vec<u8>> {
    let data = raw
        .split_once(";base64,")
        .map(|(_, data)| data)
        .unwrap_or(raw);
    BASE64
        .decode(data.trim())
        .map_err(|err| StudioError::Image(format!("invalid base64 image payload: {err}")))
}

fn failure(err: StudioError) -> (StatusCode, ErrorReply) {
    warn!(kind = ?err.kind(), error = %err, "transformation failed");
    (status_for(&err), Notification::error(err).into())
}

fn status_for(err: &StudioError) -> StatusCode {
    match err.kind() {
        ErrorKind::Configuration => StatusCode::BAD_REQUEST,
        ErrorKind::Transport => StatusCode::BAD_GATEWAY,
        ErrorKind::Filesystem => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Image => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

async fn save_key(State(state): State<Arc<AppState>>, Json(body): Json<KeyBody>) -> Response {
    let store = state.store.clone();
    let result =
        tokio::task::spawn_blocking(move || settings::save_and_refresh(&store, &body.api_key)).await;
    match result {
        Ok((status, credentials)) => {
            if let Some(credentials) = credentials {
                state.replace_credentials(credentials);
            }
            Json(StatusReply { status }).into_response()
        }
        Err(err) => notify(StatusCode::INTERNAL_SERVER_ERROR, Notification::error(err)),
    }
}

async fn refresh(State(state): State<Arc<AppState>>) -> Response {
    let store = state.store.clone();
    let result = tokio::task::spawn_blocking(move || settings::refresh_credentials(&store)).await;
    match result {
        Ok((status, credentials)) => {
            if let Some(credentials) = credentials {
                state.replace_credentials(credentials);
            }
            Json(StatusReply { status }).into_response()
        }
        Err(err) => notify(StatusCode::INTERNAL_SERVER_ERROR, Notification::error(err)),
    }
}

fn notify(status: StatusCode, notification: Notification) -> Response {
    (status, Json(ErrorReply::from(notification))).into_response()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use image::{DynamicImage, Rgb, RgbImage, Rgba, RgbaImage};
    use serde_json::{json, Value};
    use studio_contracts::credentials::{ApiKey, CredentialSource};
    use studio_contracts::progress::{
        LABEL_COMPLETE, LABEL_IMAGE_RECEIVED, LABEL_PROCESSING_RESULT, LABEL_RECEIVING,
        LABEL_SAVING_INPUT, LABEL_STARTING, LABEL_STREAM_DONE, LABEL_UPLOADING, LABEL_WAITING,
    };
    use tokio::sync::Notify;
    use tower::ServiceExt;

    use super::*;

    fn state_with(
        dir: &Path,
        api_base: String,
        credentials: Credentials,
        queue_size: usize,
    ) -> Arc<AppState> {
        let config = EngineConfig {
            api_base,
            scratch_dir: Some(dir.join("scratch")),
            ..EngineConfig::default()
        };
        Arc::new(AppState::new(
            config,
            CredentialStore::new(dir.join(".env")),
            credentials,
            queue_size,
        ))
    }

    fn state(dir: &Path, credentials: Credentials, queue_size: usize) -> Arc<AppState> {
        // Nothing listens here; these tests never get as far as the network.
        state_with(dir, "http://127.0.0.1:9/v1beta".to_string(), credentials, queue_size)
    }

    fn test_key() -> Credentials {
        Credentials::from_key(ApiKey::new("test-key").unwrap(), CredentialSource::File)
    }

    fn png(image: DynamicImage) -> anyhow::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        image.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)?;
        Ok(bytes)
    }

    fn png_base64() -> anyhow::Result<String> {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 4])));
        Ok(format!("data:image/png;base64,{}", BASE64.encode(png(image)?)))
    }

    /// A photo-sized PNG that does not compress well.
    fn noisy_png_base64(width: u32, height: u32) -> anyhow::Result<String> {
        let mut seed = 0x2545_f491_u32;
        let image = RgbImage::from_fn(width, height, |_, _| {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let [r, g, b, _] = seed.to_le_bytes();
            Rgb([r, g, b])
        });
        Ok(format!(
            "data:image/png;base64,{}",
            BASE64.encode(png(DynamicImage::ImageRgb8(image))?)
        ))
    }

    fn post_json(uri: &str, body: Value) -> anyhow::Result<Request<Body>> {
        Ok(Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))?)
    }

    async fn json_body(response: Response) -> anyhow::Result<Value> {
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn sse_events(response: Response) -> anyhow::Result<Vec<(String, Value)>> {
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let raw = String::from_utf8(bytes.to_vec())?;
        let mut events = Vec::new();
        for block in raw.split("\n\n") {
            let mut name = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    name = Some(value.trim().to_string());
                } else if let Some(value) = line.strip_prefix("data:") {
                    data = Some(serde_json::from_str::<Value>(value.trim())?);
                }
            }
            if let (Some(name), Some(data)) = (name, data) {
                events.push((name, data));
            }
        }
        Ok(events)
    }

    /// Minimal Gemini stand-in: resumable upload plus a one-event stream that
    /// returns `image`. With `hold` set, the stream waits for `release`.
    struct FakeGemini {
        api_base: String,
        release: Arc<Notify>,
    }

    async fn fake_gemini(image: Vec<u8>, hold: bool) -> anyhow::Result<FakeGemini> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let origin = format!("http://{}", listener.local_addr()?);
        let release = Arc::new(Notify::new());

        let session_url = format!("{origin}/upload-session");
        let event = json!({
            "candidates": [{
                "content": {
                    "parts": [{ "inlineData": { "mimeType": "image/png", "data": BASE64.encode(image) } }]
                }
            }]
        });
        let stream_body = format!("data: {event}\n\n");
        let gate = hold.then(|| Arc::clone(&release));

        let app = Router::new()
            .route(
                "/upload/v1beta/files",
                post(move || {
                    let url = session_url.clone();
                    async move { ([("x-goog-upload-url", url)], "{}") }
                }),
            )
            .route(
                "/upload-session",
                post(|| async {
                    Json(json!({
                        "file": {
                            "name": "files/fake",
                            "uri": "https://files.test/fake",
                            "mimeType": "image/jpeg"
                        }
                    }))
                }),
            )
            .fallback(move || {
                let body = stream_body.clone();
                let gate = gate.clone();
                async move {
                    if let Some(gate) = gate {
                        gate.notified().await;
                    }
                    ([(header::CONTENT_TYPE, "text/event-stream")], body)
                }
            });
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(FakeGemini {
            api_base: format!("{origin}/v1beta"),
            release,
        })
    }

    #[tokio::test]
    async fn index_serves_single_page() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let app = router(state(temp.path(), Credentials::missing(), 50));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty())?)
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        assert!(String::from_utf8_lossy(&bytes).contains("Gemini AI Image Studio"));
        Ok(())
    }

    #[tokio::test]
    async fn saving_a_key_activates_it() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let shared = state(temp.path(), Credentials::missing(), 50);

        let response = router(Arc::clone(&shared))
            .oneshot(post_json("/api/key", json!({ "api_key": "AIza-web" }))?)
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await?;
        assert_eq!(
            body["status"],
            json!(format!("{}\n{}", settings::SAVE_OK, settings::REFRESH_LOADED))
        );
        assert_eq!(
            shared.current_credentials().api_key().map(ApiKey::expose),
            Some("AIza-web")
        );
        assert_eq!(
            fs::read_to_string(temp.path().join(".env"))?,
            "GEMINI_API_KEY=AIza-web\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn refresh_picks_up_file_changes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let shared = state(temp.path(), Credentials::missing(), 50);
        fs::write(temp.path().join(".env"), "GEMINI_API_KEY=from-disk\n")?;

        let response = router(Arc::clone(&shared))
            .oneshot(post_json("/api/refresh", json!({}))?)
            .await?;

        let body = json_body(response).await?;
        assert_eq!(body["status"], json!(settings::REFRESH_LOADED));
        assert_eq!(
            shared.current_credentials().api_key().map(ApiKey::expose),
            Some("from-disk")
        );
        Ok(())
    }

    #[tokio::test]
    async fn transform_without_key_returns_notification() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::create_dir(temp.path().join("scratch"))?;
        let app = router(state(temp.path(), Credentials::missing(), 50));

        let response = app
            .oneshot(post_json(
                "/api/transform",
                json!({ "image": png_base64()?, "prompt": "make it blue" }),
            )?)
            .await?;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await?;
        assert_eq!(
            body,
            json!({ "error": "Error: GEMINI_API_KEY not found in .env file", "duration_secs": 5 })
        );
        assert_eq!(fs::read_dir(temp.path().join("scratch"))?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn photo_sized_upload_is_accepted() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::create_dir(temp.path().join("scratch"))?;
        let app = router(state(temp.path(), Credentials::missing(), 50));
        let image = noisy_png_base64(1000, 700)?;
        let payload = json!({ "image": image, "prompt": "make it blue" });
        assert!(payload.to_string().len() > 2 * 1024 * 1024);

        let response = app.oneshot(post_json("/api/transform", payload)?).await?;

        // The request got past body extraction and failed on the missing key.
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await?;
        assert_eq!(body["duration_secs"], json!(5));
        Ok(())
    }

    #[tokio::test]
    async fn transform_rejects_undecodable_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let app = router(state(temp.path(), Credentials::missing(), 50));

        let response = app
            .oneshot(post_json(
                "/api/transform",
                json!({ "image": "data:image/png;base64,bm90IGFuIGltYWdl", "prompt": "x" }),
            )?)
            .await?;

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await?;
        assert!(body["error"]
            .as_str()
            .is_some_and(|message| message.starts_with("Error: image processing failed")));
        Ok(())
    }

    #[tokio::test]
    async fn idle_server_runs_request_with_empty_queue() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::create_dir(temp.path().join("scratch"))?;
        let app = router(state(temp.path(), Credentials::missing(), 0));

        let response = app
            .oneshot(post_json(
                "/api/transform",
                json!({ "image": png_base64()?, "prompt": "x" }),
            )?)
            .await?;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn busy_server_with_empty_queue_rejects() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let shared = state(temp.path(), Credentials::missing(), 0);
        let _running = Arc::clone(&shared.admission).try_acquire_owned()?;

        let response = router(Arc::clone(&shared))
            .oneshot(post_json(
                "/api/transform",
                json!({ "image": png_base64()?, "prompt": "x" }),
            )?)
            .await?;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await?;
        assert_eq!(body["duration_secs"], json!(5));
        Ok(())
    }

    #[tokio::test]
    async fn waiting_requests_are_bounded_by_queue_size() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let shared = state(temp.path(), Credentials::missing(), 1);
        let running = Arc::clone(&shared.admission).try_acquire_owned()?;

        let waiter = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move { shared.admit().await.is_ok() }
        });
        while shared.waiting.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let overflow = shared.admit().await;
        assert!(overflow.is_err_and(|response| response.status() == StatusCode::SERVICE_UNAVAILABLE));

        drop(running);
        assert!(waiter.await?);
        assert_eq!(shared.waiting.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_request_keeps_slot_until_gemini_finishes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::create_dir(temp.path().join("scratch"))?;
        let output = png(DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([9, 9, 9]))))?;
        let gemini = fake_gemini(output, true).await?;
        let shared = state_with(temp.path(), gemini.api_base.clone(), test_key(), 50);

        let request = router(Arc::clone(&shared)).oneshot(post_json(
            "/api/transform",
            json!({ "image": png_base64()?, "prompt": "x" }),
        )?);
        let abandoned = tokio::time::timeout(Duration::from_millis(300), request).await;
        assert!(abandoned.is_err());

        assert_eq!(shared.admission.available_permits(), 0);

        gemini.release.notify_one();
        for _ in 0..200 {
            if shared.admission.available_permits() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(shared.admission.available_permits(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stream_reports_milestones_then_result() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::create_dir(temp.path().join("scratch"))?;
        let output = png(DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb([0, 0, 255]))))?;
        let gemini = fake_gemini(output, false).await?;
        let app = router(state_with(temp.path(), gemini.api_base, test_key(), 50));

        let response = app
            .oneshot(post_json(
                "/api/transform/stream",
                json!({ "image": png_base64()?, "prompt": "make it blue" }),
            )?)
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        let events = sse_events(response).await?;
        let labels: Vec<&str> = events
            .iter()
            .filter(|(name, _)| name == "progress")
            .filter_map(|(_, data)| data["label"].as_str())
            .collect();
        assert_eq!(
            labels,
            vec![
                LABEL_SAVING_INPUT,
                LABEL_STARTING,
                LABEL_UPLOADING,
                LABEL_WAITING,
                LABEL_RECEIVING,
                LABEL_IMAGE_RECEIVED,
                LABEL_STREAM_DONE,
                LABEL_PROCESSING_RESULT,
                LABEL_COMPLETE,
            ]
        );

        let (name, result) = events.last().ok_or_else(|| anyhow::anyhow!("no events"))?;
        assert_eq!(name, "result");
        assert_eq!(result["text"], json!(""));
        let image = result["image"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("no image"))?;
        let decoded = image::load_from_memory(&BASE64.decode(image)?)?;
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
        assert_eq!(fs::read_dir(temp.path().join("scratch"))?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn stream_reports_failure_as_error_event() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::create_dir(temp.path().join("scratch"))?;
        let app = router(state(temp.path(), Credentials::missing(), 50));

        let response = app
            .oneshot(post_json(
                "/api/transform/stream",
                json!({ "image": png_base64()?, "prompt": "make it blue" }),
            )?)
            .await?;

        let events = sse_events(response).await?;
        let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["progress", "progress", "error"]);
        assert_eq!(
            events[2].1,
            json!({ "error": "Error: GEMINI_API_KEY not found in .env file", "duration_secs": 5 })
        );
        Ok(())
    }

    #[test]
    fn data_url_prefix_is_optional() -> anyhow::Result<()> {
        assert_eq!(decode_image_payload("aGk=")?, b"hi");
        assert_eq!(decode_image_payload("data:image/png;base64,aGk=")?, b"hi");
        Ok(())
    }
}
