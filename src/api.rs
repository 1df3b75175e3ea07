use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, UdpSocket};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use serde::{Deserialize, Serialize};
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, info, warn};

use crate::bed::board::BedBoard;
use crate::bed::model::{Bed, BedId, FlagKind, PatientVisit, StatusFlags, TreatmentStep};
use crate::bed::store::BoardError;
use crate::sync::SyncStatus;
use crate::sync::bridge::RealtimeEvent;
use crate::time_provider::to_local_datetime;

pub const MDNS_SERVICE_TYPE: &str = "_bedboard._tcp.local.";
const MAX_BODY_BYTES: u64 = 256 * 1024;

/// Operator command accepted on `POST /v1/commands`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BedCommand {
    SelectPreset {
        bed_id: BedId,
        preset_id: String,
        #[serde(default)]
        flags: StatusFlags,
    },
    StartCustomPreset {
        bed_id: BedId,
        name: String,
        steps: Vec<TreatmentStep>,
        #[serde(default)]
        flags: StatusFlags,
    },
    StartQuickTreatment {
        bed_id: BedId,
        quick_id: String,
        #[serde(default)]
        flags: StatusFlags,
    },
    StartTraction {
        bed_id: BedId,
        #[serde(default)]
        minutes: u32,
        #[serde(default)]
        flags: StatusFlags,
    },
    NextStep {
        bed_id: BedId,
    },
    PrevStep {
        bed_id: BedId,
    },
    TogglePause {
        bed_id: BedId,
    },
    SwapSteps {
        bed_id: BedId,
        first: usize,
        second: usize,
    },
    ToggleFlag {
        bed_id: BedId,
        flag: FlagKind,
    },
    UpdateMemo {
        bed_id: BedId,
        step_index: usize,
        #[serde(default)]
        text: Option<String>,
    },
    UpdateBedDuration {
        bed_id: BedId,
        seconds: i64,
    },
    ClearBed {
        bed_id: BedId,
    },
    ResetAll,
    OverrideBedFromLog {
        bed_id: BedId,
        visit: PatientVisit,
        #[serde(default)]
        force_restart: bool,
    },
    MoveBedState {
        from: BedId,
        to: BedId,
    },
    UpdateBedSteps {
        bed_id: BedId,
        steps: Vec<TreatmentStep>,
    },
}

impl BedCommand {
    /// Runs the command; `Ok(false)` means it was a valid no-op.
    pub fn dispatch(self, board: &mut BedBoard) -> Result<bool, BoardError> {
        let applied = match self {
            BedCommand::SelectPreset {
                bed_id,
                preset_id,
                flags,
            } => board.select_preset(bed_id, &preset_id, flags),
            BedCommand::StartCustomPreset {
                bed_id,
                name,
                steps,
                flags,
            } => board.start_custom_preset(bed_id, &name, steps, flags),
            BedCommand::StartQuickTreatment {
                bed_id,
                quick_id,
                flags,
            } => {
                let template = board
                    .catalog()
                    .quick_treatments
                    .iter()
                    .find(|quick| quick.id == quick_id)
                    .cloned();
                match template {
                    Some(template) => board.start_quick_treatment(bed_id, &template, flags),
                    None => false,
                }
            }
            BedCommand::StartTraction {
                bed_id,
                minutes,
                flags,
            } => board.start_traction(bed_id, minutes, flags),
            BedCommand::NextStep { bed_id } => board.next_step(bed_id),
            BedCommand::PrevStep { bed_id } => board.prev_step(bed_id),
            BedCommand::TogglePause { bed_id } => board.toggle_pause(bed_id),
            BedCommand::SwapSteps {
                bed_id,
                first,
                second,
            } => board.swap_steps(bed_id, first, second),
            BedCommand::ToggleFlag { bed_id, flag } => board.toggle_flag(bed_id, flag),
            BedCommand::UpdateMemo {
                bed_id,
                step_index,
                text,
            } => board.update_memo(bed_id, step_index, text.as_deref()),
            BedCommand::UpdateBedDuration { bed_id, seconds } => {
                board.update_bed_duration(bed_id, seconds)
            }
            BedCommand::ClearBed { bed_id } => board.clear_bed(bed_id),
            BedCommand::ResetAll => board.reset_all() > 0,
            BedCommand::OverrideBedFromLog {
                bed_id,
                visit,
                force_restart,
            } => board.override_bed_from_log(bed_id, &visit, force_restart),
            BedCommand::MoveBedState { from, to } => return board.move_bed_state(from, to),
            BedCommand::UpdateBedSteps { bed_id, steps } => board.update_bed_steps(bed_id, steps),
        };
        Ok(applied)
    }
}

#[derive(Debug, Serialize)]
pub struct BoardSnapshot {
    pub beds: Vec<Bed>,
    pub sync_status: SyncStatus,
    pub keep_awake: bool,
    pub server_time_unix_ms: i64,
    pub server_time_local: String,
}

impl BoardSnapshot {
    pub fn capture(board: &BedBoard) -> Self {
        let now = board.now_ms();
        Self {
            beds: board.beds().to_vec(),
            sync_status: board.sync_status(),
            keep_awake: board.keep_awake_asserted(),
            server_time_unix_ms: now,
            server_time_local: to_local_datetime(now)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub mdns_enabled: bool,
    pub mdns_instance: String,
}

pub struct ApiServer {
    stop: Arc<AtomicBool>,
    http_join: Option<JoinHandle<()>>,
    mdns: Option<ServiceDaemon>,
}

impl ApiServer {
    pub fn start(
        config: ApiServerConfig,
        board: Arc<Mutex<BedBoard>>,
        realtime: Sender<RealtimeEvent>,
    ) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let server = Server::http(&bind)
            .map_err(|err| anyhow::anyhow!("failed to start API server on {bind}: {err}"))?;
        info!(%bind, "bed API listening");
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let http_join =
            thread::spawn(move || run_server_loop(server, board, realtime, stop_for_thread));

        let mdns = if config.mdns_enabled {
            match start_mdns_advertisement(config.port, &config.mdns_instance) {
                Ok(daemon) => Some(daemon),
                Err(err) => {
                    warn!(error = %err, "mDNS advertisement disabled");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            stop,
            http_join: Some(http_join),
            mdns,
        })
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
        if let Some(mdns) = self.mdns.take() {
            let _ = mdns.shutdown();
        }
    }
}

fn run_server_loop(
    server: Server,
    board: Arc<Mutex<BedBoard>>,
    realtime: Sender<RealtimeEvent>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => handle_request(request, &board, &realtime),
            Ok(None) => continue,
            Err(_) => continue,
        }
    }
}

fn start_mdns_advertisement(api_port: u16, instance_prefix: &str) -> Result<ServiceDaemon> {
    let daemon = ServiceDaemon::new()
        .map_err(|err| anyhow::anyhow!("could not create mDNS daemon: {err}"))?;

    let hostname = detect_hostname();
    let instance = if instance_prefix.trim().is_empty() {
        hostname.clone()
    } else {
        format!("{}-{}", instance_prefix.trim(), hostname)
    };
    let host_name = format!("{hostname}.local.");
    let mut addresses = detect_mdns_addresses();
    if addresses.is_empty() {
        addresses.push(Ipv4Addr::LOCALHOST.into());
    }

    let service = ServiceInfo::new(
        MDNS_SERVICE_TYPE,
        &instance,
        &host_name,
        addresses.as_slice(),
        api_port,
        None,
    )
    .map_err(|err| anyhow::anyhow!("could not create mDNS service info: {err}"))?;
    daemon
        .register(service)
        .map_err(|err| anyhow::anyhow!("could not register mDNS service: {err}"))?;
    info!(%instance, port = api_port, "advertising bed API over mDNS");
    Ok(daemon)
}

fn detect_hostname() -> String {
    let candidate = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_default();
    sanitize_hostname(&candidate)
}

fn sanitize_hostname(candidate: &str) -> String {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return "bedboard".to_string();
    }
    trimmed
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' {
                ch.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

fn detect_mdns_addresses() -> Vec<IpAddr> {
    let mut addresses = Vec::<IpAddr>::new();
    if let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        && socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).is_ok()
        && let Ok(local) = socket.local_addr()
    {
        let ip = local.ip();
        if ip.is_ipv4() && !ip.is_loopback() {
            addresses.push(ip);
        }
    }
    addresses
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Health,
    ListBeds,
    GetBed(BedId),
    Commands,
    Realtime,
    MethodNotAllowed,
    NotFound,
}

fn route(method: &Method, path: &str) -> Route {
    let wanted = match path {
        "/healthz" => Some((Method::Get, Route::Health)),
        "/v1/beds" => Some((Method::Get, Route::ListBeds)),
        "/v1/commands" => Some((Method::Post, Route::Commands)),
        "/v1/realtime" => Some((Method::Post, Route::Realtime)),
        _ => path
            .strip_prefix("/v1/beds/")
            .and_then(|id| id.parse::<BedId>().ok())
            .map(|id| (Method::Get, Route::GetBed(id))),
    };
    match wanted {
        Some((expected, route)) if &expected == method => route,
        Some(_) => Route::MethodNotAllowed,
        None => Route::NotFound,
    }
}

#[derive(Serialize)]
struct CommandResponse {
    applied: bool,
}

#[derive(Serialize)]
struct RealtimeResponse {
    accepted: bool,
}

fn handle_request(
    mut request: tiny_http::Request,
    board: &Arc<Mutex<BedBoard>>,
    realtime: &Sender<RealtimeEvent>,
) {
    let Some(remote_addr) = request.remote_addr() else {
        let _ = send_text(request, StatusCode(400), "missing remote address");
        return;
    };
    if !is_local_network_ip(remote_addr.ip()) {
        let _ = send_text(request, StatusCode(403), "forbidden: local network only");
        return;
    }

    let url = request.url().to_string();
    let (path, _query) = split_path_query(&url);
    let route = route(request.method(), path);
    debug!(method = %request.method(), path, "api request");

    match route {
        Route::Health => {
            let _ = send_text(request, StatusCode(200), "ok");
        }
        Route::ListBeds => {
            let Ok(guard) = board.lock() else {
                let _ = send_text(request, StatusCode(500), "internal state lock error");
                return;
            };
            let snapshot = BoardSnapshot::capture(&guard);
            drop(guard);
            let _ = send_json(request, StatusCode(200), &snapshot);
        }
        Route::GetBed(id) => {
            let Ok(guard) = board.lock() else {
                let _ = send_text(request, StatusCode(500), "internal state lock error");
                return;
            };
            let bed = guard.bed(id).cloned();
            drop(guard);
            match bed {
                Some(bed) => {
                    let _ = send_json(request, StatusCode(200), &bed);
                }
                None => {
                    let _ = send_text(request, StatusCode(404), "unknown bed");
                }
            }
        }
        Route::Commands => {
            let command = match read_json_body::<BedCommand>(&mut request) {
                Ok(command) => command,
                Err(err) => {
                    let _ = send_text(request, StatusCode(400), &format!("bad command: {err}"));
                    return;
                }
            };
            let Ok(mut guard) = board.lock() else {
                let _ = send_text(request, StatusCode(500), "internal state lock error");
                return;
            };
            let outcome = command.dispatch(&mut guard);
            drop(guard);
            match outcome {
                Ok(applied) => {
                    let _ = send_json(request, StatusCode(200), &CommandResponse { applied });
                }
                Err(err @ BoardError::UnknownBed(_)) => {
                    let _ = send_text(request, StatusCode(404), &err.to_string());
                }
                Err(err) => {
                    let _ = send_text(request, StatusCode(500), &err.to_string());
                }
            }
        }
        Route::Realtime => {
            let event = match read_json_body::<RealtimeEvent>(&mut request) {
                Ok(event) => event,
                Err(err) => {
                    let _ = send_text(request, StatusCode(400), &format!("bad event: {err}"));
                    return;
                }
            };
            if realtime.send(event).is_err() {
                let _ = send_text(request, StatusCode(503), "realtime feed closed");
                return;
            }
            let _ = send_json(request, StatusCode(200), &RealtimeResponse { accepted: true });
        }
        Route::MethodNotAllowed => {
            let _ = send_text(request, StatusCode(405), "method not allowed");
        }
        Route::NotFound => {
            let _ = send_text(request, StatusCode(404), "not found");
        }
    }
}

fn read_json_body<T: for<'de> Deserialize<'de>>(request: &mut tiny_http::Request) -> Result<T> {
    let mut body = String::new();
    request
        .as_reader()
        .take(MAX_BODY_BYTES)
        .read_to_string(&mut body)?;
    Ok(serde_json::from_str(&body)?)
}

fn send_json<T: Serialize>(
    request: tiny_http::Request,
    status: StatusCode,
    body: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    let content_type = Header::from_str("Content-Type: application/json; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_data(payload)
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn send_text(request: tiny_http::Request, status: StatusCode, body: &str) -> Result<()> {
    let content_type = Header::from_str("Content-Type: text/plain; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_string(body.to_string())
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn split_path_query(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    }
}

fn is_local_network_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || is_ipv4_mapped_local(v6)
        }
    }
}

fn is_ipv4_mapped_local(v6: Ipv6Addr) -> bool {
    match v6.to_ipv4_mapped() {
        Some(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        None => false,
    }
}
