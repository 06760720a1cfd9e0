use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::Method,
    io::Write,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use crockpot_common::{
    datalog::export_file_name, program::ProgramStatus, status_line, CookSession,
    CookingProgram, Connectivity, Crockpot, CrockpotStatus, NetworkConfig, OperatingState,
    ProgramLibrary, RelayBank, RuntimeConfig, SessionError, Supervisor, TemperatureSource,
};

use crate::drivers::{GpioRelayPin, Max31855};

type BoardCrockpot = Crockpot<RelayBank<GpioRelayPin>>;

const NVS_NAMESPACE: &str = "crockpot";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_PROGRAMS_KEY: &str = "programs_json";
const WATCHDOG_TIMEOUT_SEC: u32 = 10;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

const INDEX_HTML: &str = include_str!("../web/index.html");

#[derive(Clone)]
struct SharedState {
    crockpot: Arc<BoardCrockpot>,
    session: Arc<Mutex<CookSession>>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Clone, Copy)]
struct StationLink;

impl Connectivity for StationLink {
    fn is_connected(&self) -> bool {
        is_wifi_station_connected()
    }
}

#[derive(Debug, Serialize)]
struct StatusView {
    #[serde(flatten)]
    status: CrockpotStatus,
    relay_main: bool,
    program: Option<ProgramStatus>,
    program_text: String,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_network_defaults(&mut runtime.network);

    let Peripherals { modem, spi2, .. } = Peripherals::take()?;

    let relay_pin = GpioRelayPin::new(&runtime.relay).context("failed to claim relay GPIO")?;
    let relay = RelayBank::new([relay_pin], runtime.relay.active_high)
        .context("failed to initialize relay")?;
    let crockpot = Arc::new(
        Crockpot::new(relay, runtime.crockpot.lock_timeout())
            .context("failed to initialize control core")?,
    );

    let mut thermocouple =
        Max31855::new(spi2, &runtime.sensor).context("failed to initialize MAX31855")?;
    let initial = thermocouple.read();
    if initial.valid {
        info!(
            "initial reading: {:.1} C ({:.1} F)",
            initial.temperature_c, initial.temperature_f
        );
    } else {
        warn!(
            "initial reading failed ({}); check thermocouple connection",
            thermocouple
                .last_fault()
                .map_or_else(|| "bus error".to_string(), |fault| fault.to_string())
        );
    }

    let custom_programs = nvs_store.load_programs().unwrap_or_else(|err| {
        warn!("failed to load custom programs from NVS: {err:#}");
        Vec::new()
    });
    let shared_state = SharedState {
        crockpot: Arc::clone(&crockpot),
        session: Arc::new(Mutex::new(CookSession::new(
            ProgramLibrary::new(custom_programs),
            &runtime.datalog,
        ))),
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    spawn_supervisor(shared_state.clone(), thermocouple, &runtime)?;

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    if runtime.network.telegram_enabled() {
        let token = runtime.network.telegram_bot_token.clone();
        let crockpot = Arc::clone(&crockpot);
        thread::Builder::new()
            .name("telegram".into())
            .stack_size(12 * 1024)
            .spawn(move || crate::telegram::run_bot(token, crockpot, StationLink))
            .context("failed to spawn telegram thread")?;
    } else {
        warn!("telegram bot token not configured; bot disabled");
    }

    let server = create_http_server(shared_state)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_network_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }

    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }

    if network.telegram_bot_token.is_empty() {
        if let Some(token) = option_env!("TELEGRAM_BOT_TOKEN") {
            network.telegram_bot_token = token.to_string();
        }
    }
}

// The supervisor is started before WiFi so the shutoff policy runs even
// when the network never comes up.
fn spawn_supervisor(
    state: SharedState,
    thermocouple: Max31855,
    runtime: &RuntimeConfig,
) -> anyhow::Result<()> {
    let config = runtime.crockpot.clone();
    let status_log_interval = Duration::from_millis(config.status_log_interval_ms);
    let supervisor = Supervisor::new(Arc::clone(&state.crockpot), thermocouple, StationLink, config);

    thread::Builder::new()
        .name("control".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut last_status_log = Instant::now();
            supervisor.run(move |report, elapsed| {
                feed_watchdog();

                if let Some(shutoff) = report.and_then(|report| report.shutoff) {
                    warn!("SAFETY SHUTOFF: {shutoff}");
                }

                lock_session(&state.session).after_cycle(&state.crockpot, report, elapsed);

                if last_status_log.elapsed() >= status_log_interval {
                    last_status_log = Instant::now();
                    info!("{}", status_line(&state.crockpot.get_status()));
                }
            })
        })
        .context("failed to spawn control thread")?;

    Ok(())
}

fn lock_session(session: &Mutex<CookSession>) -> MutexGuard<'_, CookSession> {
    session
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 12 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let view = build_status_view(&state);
            write_json(req, &view)
        })?;
    }

    for target in OperatingState::ALL {
        let state = state.clone();
        let uri = format!("/api/state/{}", target.as_str().to_ascii_lowercase());
        server.fn_handler(&uri, Method::Post, move |req| {
            match state.crockpot.set_state(target) {
                Ok(()) => write_json(req, &build_status_view(&state)),
                Err(err) => write_error(req, 503, &err.to_string()),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/program/start", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(name) = query_param(&uri, "name") else {
                return write_error(req, 400, "Missing 'name' parameter");
            };

            let started = lock_session(&state.session).start_program(&state.crockpot, &name);
            match started {
                Ok(_) => write_json(req, &build_status_view(&state)),
                Err(err @ SessionError::Program(_)) => write_error(req, 400, &err.to_string()),
                Err(err @ SessionError::Control(_)) => write_error(req, 503, &err.to_string()),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/program/stop", Method::Post, move |req| {
            lock_session(&state.session).stop_program();
            write_json(req, &build_status_view(&state))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/programs", Method::Get, move |req| {
            let programs: Vec<CookingProgram> = lock_session(&state.session).library.all();
            write_json(req, &programs)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/log/stats", Method::Get, move |req| {
            let stats = lock_session(&state.session).datalog.stats();
            write_json(req, &stats)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/log/csv", Method::Get, move |req| {
            let csv = lock_session(&state.session).datalog.to_csv();
            // No wall clock without SNTP; name the export after uptime.
            let uptime = chrono::DateTime::from_timestamp(
                i64::from(state.crockpot.get_status().uptime_seconds),
                0,
            )
            .ok_or_else(|| anyhow!("uptime out of range"))?
            .naive_utc();
            let disposition = format!(
                "attachment; filename=\"{}\"",
                export_file_name(uptime, "csv")
            );
            req.into_response(
                200,
                Some("OK"),
                &[
                    ("Content-Type", "text/csv; charset=utf-8"),
                    ("Content-Disposition", disposition.as_str()),
                ],
            )?
            .write_all(csv.as_bytes())?;
            Ok(())
        })?;
    }

    Ok(server)
}

fn build_status_view(state: &SharedState) -> StatusView {
    let status = state.crockpot.get_status();
    let relay_main = state.crockpot.relay_main();
    let session = lock_session(&state.session);
    StatusView {
        status,
        relay_main,
        program: session.runner.status(),
        program_text: session.runner.status_text(),
    }
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        (name == key).then(|| value.replace('+', " ").replace("%20", " "))
    })
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if !network.has_station_credentials() {
        warn!("wifi credentials missing; running offline");
        return Ok(esp_wifi);
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let deadline = Instant::now() + network.wifi_connect_timeout();
    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if Instant::now() >= deadline {
            warn!(
                "wifi connect timeout of {}ms reached after {attempt} attempts",
                network.wifi_connect_timeout_ms
            );
            break;
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => disable_wifi_power_save(),
        Some(err) => {
            warn!("wifi connection failed, running offline; last error: {err:#}");
        }
    }

    Ok(esp_wifi)
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn load_programs(&self) -> anyhow::Result<Vec<CookingProgram>> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_PROGRAMS_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<Vec<CookingProgram>>(value)?),
            None => Ok(Vec::new()),
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}
