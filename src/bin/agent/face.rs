use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use webpilot::{ChromeSession, Controller, LoopResult, OllamaClient, PlanResult, ProgressEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Plan,
    #[default]
    Autonomous,
}

#[derive(Debug, Deserialize)]
struct TaskPayload {
    #[serde(default)]
    task: String,
    #[serde(default)]
    mode: Mode,
    max_iterations: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum TaskOutcome {
    Plan(PlanResult),
    Autonomous(LoopResult),
}

/// The task currently driving the browser.
struct RunningTask {
    mode: Mode,
    cancel: CancellationToken,
}

/// Shared between handlers. The browser session is single-owner: whoever
/// holds its lock is the only task driving it.
pub struct AppState {
    controller: Controller<OllamaClient>,
    session: Arc<tokio::sync::Mutex<Option<ChromeSession>>>,
    browser_ready: AtomicBool,
    current: Mutex<Option<RunningTask>>,
    events: broadcast::Sender<ProgressEvent>,
    default_iterations: NonZeroU32,
}

impl AppState {
    pub fn new(
        controller: Controller<OllamaClient>,
        events: broadcast::Sender<ProgressEvent>,
        default_iterations: NonZeroU32,
    ) -> Self {
        Self {
            controller,
            session: Arc::new(tokio::sync::Mutex::new(None)),
            browser_ready: AtomicBool::new(false),
            current: Mutex::new(None),
            events,
            default_iterations,
        }
    }

    pub async fn install_session(&self, session: ChromeSession) {
        *self.session.lock().await = Some(session);
        self.browser_ready.store(true, Ordering::SeqCst);
        info!("browser session ready");
    }

    /// Take the session back for release; waits for a running task to end.
    pub async fn take_session(&self) -> Option<ChromeSession> {
        self.browser_ready.store(false, Ordering::SeqCst);
        self.session.lock().await.take()
    }

    fn current(&self) -> std::sync::MutexGuard<'_, Option<RunningTask>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/execute-task", post(execute_task_handler))
        .route("/api/status", get(status_handler))
        .route("/api/stop", post(stop_handler))
        .route("/events", get(sse_handler))
        .route(
            "/favicon.ico",
            get(|| async { StatusCode::NO_CONTENT }),
        )
        .with_state(state)
}

fn failure(status: StatusCode, error: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "success": false, "error": error })))
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn execute_task_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TaskPayload>,
) -> (StatusCode, Json<Value>) {
    let task = payload.task.trim().to_string();
    if task.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "No task provided");
    }
    let max_iterations = match payload.max_iterations {
        None => state.default_iterations,
        Some(n) => match NonZeroU32::new(n) {
            Some(n) => n,
            None => return failure(StatusCode::BAD_REQUEST, "max_iterations must be at least 1"),
        },
    };

    let Ok(mut guard) = state.session.clone().try_lock_owned() else {
        return failure(StatusCode::CONFLICT, "A task is already running");
    };
    if guard.is_none() {
        return failure(StatusCode::SERVICE_UNAVAILABLE, "Browser agent not initialized");
    }

    info!(mode = ?payload.mode, %task, "executing task");
    let cancel = CancellationToken::new();
    *state.current() = Some(RunningTask {
        mode: payload.mode,
        cancel: cancel.clone(),
    });

    // Run detached so a client hanging up cannot cut an action short.
    let runner = state.clone();
    let mode = payload.mode;
    let task_text = task.clone();
    let run = tokio::spawn(async move {
        let outcome = match guard.as_mut() {
            Some(session) => Some(match mode {
                Mode::Plan => {
                    TaskOutcome::Plan(runner.controller.run_plan(session, &task_text).await)
                }
                Mode::Autonomous => TaskOutcome::Autonomous(
                    runner
                        .controller
                        .run_autonomous(session, &task_text, max_iterations, &cancel)
                        .await,
                ),
            }),
            None => None,
        };
        *runner.current() = None;
        outcome
    });

    match run.await {
        Ok(Some(outcome)) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "task": task,
                "mode": mode,
                "result": outcome,
            })),
        ),
        Ok(None) => failure(StatusCode::SERVICE_UNAVAILABLE, "Browser agent not initialized"),
        Err(e) => {
            *state.current() = None;
            warn!(error = %e, "task runner crashed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "browser_ready": state.browser_ready.load(Ordering::SeqCst),
        "busy": state.current().is_some(),
        "model": state.controller.inference().model(),
    }))
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    request_stop(state.current().as_ref())
}

/// Only autonomous runs observe a stop; plan runs always run to the end.
fn request_stop(running: Option<&RunningTask>) -> (StatusCode, Json<Value>) {
    match running {
        Some(RunningTask {
            mode: Mode::Autonomous,
            cancel,
        }) => {
            cancel.cancel();
            info!("stop requested");
            (
                StatusCode::OK,
                Json(json!({ "success": true, "message": "Stop requested" })),
            )
        }
        Some(RunningTask {
            mode: Mode::Plan, ..
        }) => failure(StatusCode::CONFLICT, "Plan runs cannot be stopped"),
        None => failure(StatusCode::CONFLICT, "No task is running"),
    }
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(Ok::<_, Infallible>(to_sse_event(&event))),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &ProgressEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event_name(event)).data(data)
}

fn event_name(event: &ProgressEvent) -> &'static str {
    match event {
        ProgressEvent::Thinking { .. } => "thinking",
        ProgressEvent::Step { .. } => "step",
        ProgressEvent::StepError { .. } => "step_error",
        ProgressEvent::InvalidOutput { .. } => "invalid_output",
        ProgressEvent::TaskComplete { .. } => "task_complete",
        ProgressEvent::TaskError { .. } => "task_error",
    }
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>webpilot</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body { background: #0a0a0f; color: #e0e0e0; font-family: system-ui, sans-serif; }
  main { max-width: 800px; margin: 0 auto; padding: 24px 32px; display: flex; flex-direction: column; gap: 12px; }
  h1 { font-size: 20px; color: #fff; }
  textarea { background: #111118; color: #e0e0e0; border: 1px solid #1a1a2e; border-radius: 8px; padding: 10px; min-height: 80px; }
  .row { display: flex; gap: 8px; }
  button, select { background: #1a1a2e; color: #e0e0e0; border: 1px solid #333; border-radius: 6px; padding: 6px 14px; }
  #log { display: flex; flex-direction: column; gap: 6px; }
  .entry { padding: 8px 12px; border-radius: 6px; font-size: 13px; background: #111118; border-left: 3px solid #3b82f6; }
  .entry.step_error, .entry.task_error, .entry.invalid_output { border-color: #ef4444; color: #fca5a5; }
  .entry.task_complete { border-color: #22c55e; color: #86efac; }
  .entry.thinking { border-color: #f59e0b; }
</style>
</head>
<body>
<main>
  <h1>webpilot</h1>
  <textarea id="task" placeholder="Describe the goal..."></textarea>
  <div class="row">
    <select id="mode"><option value="autonomous">autonomous</option><option value="plan">plan</option></select>
    <button id="run">Run</button>
    <button id="stop">Stop</button>
  </div>
  <div id="log"></div>
</main>
<script>
  const log = document.getElementById('log');
  function add(kind, text) {
    const el = document.createElement('div');
    el.className = 'entry ' + kind;
    el.textContent = text;
    log.prepend(el);
  }
  const events = new EventSource('/events');
  for (const kind of ['thinking', 'step', 'step_error', 'invalid_output', 'task_complete', 'task_error']) {
    events.addEventListener(kind, e => add(kind, kind + ' ' + e.data));
  }
  document.getElementById('run').onclick = async () => {
    const body = { task: document.getElementById('task').value, mode: document.getElementById('mode').value };
    const res = await fetch('/api/execute-task', { method: 'POST', headers: { 'Content-Type': 'application/json' }, body: JSON.stringify(body) });
    add(res.ok ? 'task_complete' : 'task_error', JSON.stringify(await res.json()));
  };
  document.getElementById('stop').onclick = () => fetch('/api/stop', { method: 'POST' });
</script>
</body>
</html>
"##;
