use std::{
    collections::HashMap,
    convert::Infallible,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crockpot_common::{
    datalog::export_file_name_now, handle_command, program::ProgramStatus, status_line,
    string_to_state, CookSession, CookingProgram, Crockpot, CrockpotStatus, LogEntry, LogStats,
    OperatingState, ProgramLibrary, RelayBank, RelayPin, RuntimeConfig, SafetyShutoff,
    SessionError, Supervisor, TemperatureReading, TemperatureSource, ThermalModel,
    TOPIC_CMD_PROGRAM, TOPIC_CMD_STATE, TOPIC_EVENT_SAFETY, TOPIC_STATUS,
};

type HostRelay = RelayBank<SimulatedPin>;
type HostCrockpot = Crockpot<HostRelay>;

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const STATUS_PUBLISH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
struct SimulatedPin {
    level: Arc<AtomicBool>,
}

impl RelayPin for SimulatedPin {
    type Error = Infallible;

    fn set_level(&mut self, high: bool) -> Result<(), Self::Error> {
        self.level.store(high, Ordering::Relaxed);
        Ok(())
    }
}

struct SimulatedSensor {
    model: Arc<std::sync::Mutex<ThermalModel>>,
    crockpot: Arc<HostCrockpot>,
    last_sample: Instant,
}

impl TemperatureSource for SimulatedSensor {
    fn read(&mut self) -> TemperatureReading {
        let dt = self.last_sample.elapsed().as_secs_f32();
        self.last_sample = Instant::now();

        let state = self.crockpot.get_status().state;
        let relay_on = self.crockpot.relay_main();
        self.model
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .step(state, relay_on, dt)
    }
}

#[derive(Clone)]
struct AppState {
    crockpot: Arc<HostCrockpot>,
    session: Arc<Mutex<CookSession>>,
    model: Arc<std::sync::Mutex<ThermalModel>>,
    mqtt: AsyncClient,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    programs_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    #[serde(flatten)]
    status: CrockpotStatus,
    relay_main: bool,
    program: Option<ProgramStatus>,
    program_text: String,
}

#[derive(Debug, Serialize)]
struct StateChangeResponse {
    success: bool,
    state: OperatingState,
}

#[derive(Debug, Serialize)]
struct ProgramListView {
    programs: Vec<CookingProgram>,
    custom: Vec<String>,
}

#[derive(Debug, Serialize)]
struct LogView {
    log_interval_seconds: u64,
    stats: LogStats,
    entries: Vec<LogEntry>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let custom_programs = store.load_programs().await.unwrap_or_else(|err| {
        warn!("failed to load custom programs from store: {err:#}");
        Vec::new()
    });

    let relay = RelayBank::new([SimulatedPin::default()], runtime.relay.active_high)
        .context("failed to initialize simulated relay")?;
    let crockpot = Arc::new(
        Crockpot::new(relay, runtime.crockpot.lock_timeout())
            .context("failed to initialize control core")?,
    );

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("crockpot-controller", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        crockpot: Arc::clone(&crockpot),
        session: Arc::new(Mutex::new(CookSession::new(
            ProgramLibrary::new(custom_programs),
            &runtime.datalog,
        ))),
        model: Arc::new(std::sync::Mutex::new(ThermalModel::default())),
        mqtt,
        store,
    };

    // The host has no WiFi radio; broker reachability stands in for it.
    let broker_connected = Arc::new(AtomicBool::new(false));

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop, Arc::clone(&broker_connected));
    let safety_rx = spawn_supervisor(app_state.clone(), &runtime, broker_connected)?;
    spawn_safety_publisher(app_state.clone(), safety_rx);
    spawn_status_publish_loop(app_state.clone());

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/state/{state}", post(handle_set_state))
        .route("/api/command", post(handle_command_text))
        .route("/api/help", get(handle_help))
        .route(
            "/api/programs",
            get(handle_get_programs).put(handle_put_program),
        )
        .route("/api/programs/{name}", delete(handle_delete_program))
        .route("/api/program/start", post(handle_start_program))
        .route("/api/program/stop", post(handle_stop_program))
        .route("/api/log", get(handle_get_log))
        .route("/api/log/csv", get(handle_get_log_csv))
        .route("/api/log/stats", get(handle_get_log_stats))
        .route("/api/log/clear", post(handle_clear_log))
        .route("/api/sim/sensor-fault", post(handle_sensor_fault))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let port = std::env::var("CROCKPOT_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_supervisor(
    app_state: AppState,
    runtime: &RuntimeConfig,
    broker_connected: Arc<AtomicBool>,
) -> anyhow::Result<mpsc::UnboundedReceiver<SafetyShutoff>> {
    let config = runtime.crockpot.clone();
    let sensor = SimulatedSensor {
        model: Arc::clone(&app_state.model),
        crockpot: Arc::clone(&app_state.crockpot),
        last_sample: Instant::now(),
    };
    let supervisor = Supervisor::new(
        Arc::clone(&app_state.crockpot),
        sensor,
        broker_connected,
        config.clone(),
    );

    let (safety_tx, safety_rx) = mpsc::unbounded_channel();
    let status_log_interval = Duration::from_millis(config.status_log_interval_ms);

    thread::Builder::new()
        .name("control".into())
        .spawn(move || {
            let mut last_status_log = Instant::now();
            supervisor.run(move |report, elapsed| {
                if let Some(shutoff) = report.and_then(|report| report.shutoff) {
                    warn!("SAFETY SHUTOFF: {shutoff}");
                    let _ = safety_tx.send(shutoff);
                }

                app_state
                    .session
                    .blocking_lock()
                    .after_cycle(&app_state.crockpot, report, elapsed);

                if last_status_log.elapsed() >= status_log_interval {
                    last_status_log = Instant::now();
                    info!("{}", status_line(&app_state.crockpot.get_status()));
                }
            })
        })
        .context("failed to spawn control thread")?;

    Ok(safety_rx)
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in [TOPIC_CMD_STATE, TOPIC_CMD_PROGRAM] {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(
    app_state: AppState,
    mut eventloop: rumqttc::EventLoop,
    broker_connected: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    broker_connected.store(true, Ordering::Relaxed);
                }
                Ok(_) => {}
                Err(err) => {
                    if broker_connected.swap(false, Ordering::Relaxed) {
                        warn!("mqtt connection lost");
                    }
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_safety_publisher(app_state: AppState, mut safety_rx: mpsc::UnboundedReceiver<SafetyShutoff>) {
    tokio::spawn(async move {
        while let Some(shutoff) = safety_rx.recv().await {
            let body = match serde_json::to_vec(&shutoff) {
                Ok(body) => body,
                Err(err) => {
                    warn!("safety event serialization failed: {err}");
                    continue;
                }
            };

            if let Err(err) = app_state
                .mqtt
                .publish(TOPIC_EVENT_SAFETY, QoS::AtLeastOnce, false, body)
                .await
            {
                warn!("safety event publish failed: {err}");
            }
        }
    });
}

fn spawn_status_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_PUBLISH_INTERVAL);
        loop {
            interval.tick().await;

            let payload = match build_status_view(&app_state).await {
                Ok(view) => serde_json::to_vec(&view),
                Err(err) => {
                    warn!("status snapshot failed: {err:#}");
                    continue;
                }
            };

            match payload {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_STATUS, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("status publish failed: {err}");
                    }
                }
                Err(err) => warn!("status serialization failed: {err}"),
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let message = message.trim().to_string();

    match topic.as_str() {
        TOPIC_CMD_STATE => {
            let Some(state) = string_to_state(&message) else {
                warn!("ignoring unknown state `{message}` on {topic}");
                return Ok(());
            };
            on_blocking(app_state, move |app| app.crockpot.set_state(state))
                .await?
                .context("state command rejected")?;
        }
        TOPIC_CMD_PROGRAM => {
            if message.eq_ignore_ascii_case("stop") {
                app_state.session.lock().await.stop_program();
            } else {
                on_blocking(app_state, move |app| {
                    app.session
                        .blocking_lock()
                        .start_program(&app.crockpot, &message)
                })
                .await?
                .context("program command rejected")?;
            }
        }
        _ => {}
    }
    Ok(())
}

async fn on_blocking<T, F>(app_state: &AppState, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&AppState) -> T + Send + 'static,
{
    let app_state = app_state.clone();
    tokio::task::spawn_blocking(move || f(&app_state))
        .await
        .context("blocking task failed")
}

async fn build_status_view(app_state: &AppState) -> anyhow::Result<StatusView> {
    let (status, relay_main) = on_blocking(app_state, |app| {
        (app.crockpot.get_status(), app.crockpot.relay_main())
    })
    .await?;

    let session = app_state.session.lock().await;
    Ok(StatusView {
        status,
        relay_main,
        program: session.runner.status(),
        program_text: session.runner.status_text(),
    })
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    match build_status_view(&state).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => {
            error!("status request failed: {err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read status")
        }
    }
}

async fn handle_set_state(
    State(state): State<AppState>,
    Path(requested): Path<String>,
) -> impl IntoResponse {
    let Some(target) = string_to_state(&requested) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("Invalid state: {}", requested.to_ascii_uppercase()),
        );
    };

    match on_blocking(&state, move |app| app.crockpot.set_state(target)).await {
        Ok(Ok(())) => Json(StateChangeResponse {
            success: true,
            state: target,
        })
        .into_response(),
        Ok(Err(err)) => error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string()),
        Err(err) => {
            error!("state request failed: {err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to set state")
        }
    }
}

async fn handle_command_text(State(state): State<AppState>, body: String) -> impl IntoResponse {
    match on_blocking(&state, move |app| handle_command(&app.crockpot, &body)).await {
        Ok(reply) => reply.into_response(),
        Err(err) => {
            error!("command failed: {err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to run command")
        }
    }
}

async fn handle_help() -> impl IntoResponse {
    let endpoints: HashMap<&str, &str> = HashMap::from([
        ("GET /", "Web UI"),
        ("GET /api/status", "Get current status"),
        ("POST /api/state/{off|warm|low|high}", "Set state"),
        ("POST /api/command", "Run a chat command such as /status"),
        ("GET /api/help", "This help message"),
        ("GET /api/programs", "List cooking programs"),
        ("PUT /api/programs", "Add or replace a custom program"),
        ("DELETE /api/programs/{name}", "Remove a custom program"),
        ("POST /api/program/start?name=...", "Start a program"),
        ("POST /api/program/stop", "Stop the running program"),
        ("GET /api/log", "Logged history with statistics"),
        ("GET /api/log/csv", "Download the log as CSV"),
        ("GET /api/log/stats", "Log statistics"),
        ("POST /api/log/clear", "Clear the log"),
        ("POST /api/sim/sensor-fault?value=on|off", "Simulate a sensor fault"),
    ]);
    Json(serde_json::json!({ "endpoints": endpoints }))
}

async fn handle_get_programs(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.session.lock().await;
    Json(ProgramListView {
        programs: session.library.all(),
        custom: session
            .library
            .custom()
            .iter()
            .map(|program| program.name.clone())
            .collect(),
    })
}

async fn handle_put_program(
    State(state): State<AppState>,
    Json(program): Json<CookingProgram>,
) -> impl IntoResponse {
    let custom = {
        let mut session = state.session.lock().await;
        if let Err(err) = session.library.upsert(program) {
            return error_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
        session.library.custom().to_vec()
    };

    if let Err(err) = state.store.save_programs(&custom).await {
        warn!("failed to persist programs: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist programs",
        );
    }

    handle_get_programs(State(state)).await.into_response()
}

async fn handle_delete_program(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let custom = {
        let mut session = state.session.lock().await;
        if !session.library.remove(&name) {
            return error_response(
                StatusCode::NOT_FOUND,
                &format!("No custom program named '{name}'"),
            );
        }
        session.library.custom().to_vec()
    };

    if let Err(err) = state.store.save_programs(&custom).await {
        warn!("failed to persist programs: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist programs",
        );
    }

    handle_get_programs(State(state)).await.into_response()
}

async fn handle_start_program(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(name) = params.get("name").cloned() else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'name' parameter");
    };

    let started = on_blocking(&state, move |app| {
        app.session
            .blocking_lock()
            .start_program(&app.crockpot, &name)
    })
    .await;

    match started {
        Ok(Ok(_)) => handle_get_status(State(state)).await.into_response(),
        Ok(Err(err @ SessionError::Program(_))) => {
            error_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
        Ok(Err(err @ SessionError::Control(_))) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string())
        }
        Err(err) => {
            error!("program start failed: {err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to start program")
        }
    }
}

async fn handle_stop_program(State(state): State<AppState>) -> impl IntoResponse {
    state.session.lock().await.stop_program();
    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_log(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.session.lock().await;
    Json(LogView {
        log_interval_seconds: session.datalog.interval_secs(),
        stats: session.datalog.stats(),
        entries: session.datalog.entries().cloned().collect(),
    })
}

async fn handle_get_log_csv(State(state): State<AppState>) -> impl IntoResponse {
    let csv = state.session.lock().await.datalog.to_csv();
    let disposition = format!("attachment; filename=\"{}\"", export_file_name_now("csv"));
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        csv,
    )
}

async fn handle_get_log_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.session.lock().await.datalog.stats())
}

async fn handle_clear_log(State(state): State<AppState>) -> impl IntoResponse {
    state.session.lock().await.datalog.clear();
    StatusCode::NO_CONTENT
}

async fn handle_sensor_fault(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let fault = match params.get("value").map(|value| value.to_ascii_lowercase()) {
        Some(value) if value == "on" => true,
        Some(value) if value == "off" => false,
        _ => return error_response(StatusCode::BAD_REQUEST, "Use value=on or value=off"),
    };

    let (sensor_fault, model_temperature_f) = {
        let mut model = state
            .model
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        model.inject_fault(fault);
        (model.fault_injected(), model.temperature_f())
    };
    info!("simulated sensor fault {}", if fault { "injected" } else { "cleared" });

    Json(serde_json::json!({
        "sensor_fault": sensor_fault,
        "model_temperature_f": model_temperature_f,
    }))
    .into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("CROCKPOT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.crockpot"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            programs_path: Arc::new(data_dir.join("programs.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_programs(&self) -> anyhow::Result<Vec<CookingProgram>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.programs_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<Vec<CookingProgram>>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_programs(&self, programs: &[CookingProgram]) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.programs_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(programs)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
