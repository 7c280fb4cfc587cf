use crate::{validate_area_name, AreaOrder, Monitor, MonitorConfig};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const MAX_REQUEST_BYTES: usize = 8192;
/// Bytes of an oversized body read and thrown away before answering 413,
/// so the client sees the response instead of a reset.
const MAX_DISCARD_BYTES: usize = 64 * 1024;
const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    monitor_cfg: MonitorConfig,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, monitor_cfg: MonitorConfig) -> Self {
        Self { cfg, monitor_cfg }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        // Creates the schema and fails fast on an unusable database path.
        drop(Monitor::open(&self.monitor_cfg)?);

        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let monitor_cfg = self.monitor_cfg;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, monitor_cfg, shutdown_thread) {
                log::error!("status api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    monitor_cfg: MonitorConfig,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut last_prune = Instant::now();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if last_prune.elapsed() >= PRUNE_INTERVAL {
            prune_reading_log(&monitor_cfg);
            last_prune = Instant::now();
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &monitor_cfg) {
                    log::warn!("status api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn prune_reading_log(monitor_cfg: &MonitorConfig) {
    let pruned = Monitor::open(monitor_cfg).and_then(|mut monitor| monitor.enforce_retention());
    match pruned {
        Ok(0) => {}
        Ok(removed) => log::debug!("pruned {} readings past retention", removed),
        Err(err) => log::error!("reading log retention failed: {:#}", err),
    }
}

fn handle_connection(mut stream: TcpStream, monitor_cfg: &MonitorConfig) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        let response = ApiResponse::error(403, "forbidden");
        write_response(&mut stream, response.status, "application/json", &response.body)?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            if let Some(response) = err.response() {
                write_response(&mut stream, response.status, "application/json", &response.body)?;
            }
            return Err(err.into());
        }
    };
    let response = route(&request, monitor_cfg);
    write_response(&mut stream, response.status, "application/json", &response.body)?;
    Ok(())
}

fn route(request: &HttpRequest, monitor_cfg: &MonitorConfig) -> ApiResponse {
    let allowed_method = match request.path.as_str() {
        "/health" | "/areas" | "/history" => "GET",
        "/update_status" => "POST",
        _ => return ApiResponse::error(404, "not_found"),
    };
    if request.method != allowed_method {
        return ApiResponse::error(405, "method_not_allowed");
    }

    let result = match request.path.as_str() {
        "/health" => Ok(ApiResponse::raw(200, r#"{"status":"ok"}"#)),
        "/update_status" => update_status(request, monitor_cfg),
        "/areas" => areas(request, monitor_cfg),
        _ => history(request, monitor_cfg),
    };
    match result {
        Ok(response) => response,
        Err(err) => {
            log::error!("{} {} failed: {:#}", request.method, request.path, err);
            ApiResponse::error(500, "storage_error")
        }
    }
}

// -------------------- Ingest --------------------

/// Why an ingest payload was refused. Both variants map to HTTP 400.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadingError {
    /// body absent, not JSON, or not a non-empty JSON object
    NoJson,
    Invalid(String),
}

impl fmt::Display for ReadingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingError::NoJson => f.write_str("No JSON received"),
            ReadingError::Invalid(reason) => write!(f, "invalid reading: {}", reason),
        }
    }
}

impl std::error::Error for ReadingError {}

#[derive(Debug, Deserialize)]
struct ReadingPayload {
    area: String,
    people_count: i64,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestRequest {
    pub area: String,
    pub people_count: u32,
    pub timestamp: Option<i64>,
}

pub fn parse_reading(body: &[u8]) -> std::result::Result<IngestRequest, ReadingError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| ReadingError::NoJson)?;
    if value.as_object().map_or(true, |fields| fields.is_empty()) {
        return Err(ReadingError::NoJson);
    }
    let payload: ReadingPayload =
        serde_json::from_value(value).map_err(|e| ReadingError::Invalid(e.to_string()))?;
    validate_area_name(&payload.area).map_err(|e| ReadingError::Invalid(e.to_string()))?;
    let people_count = u32::try_from(payload.people_count).map_err(|_| {
        ReadingError::Invalid(format!(
            "people_count must be a non-negative 32-bit integer, got {}",
            payload.people_count
        ))
    })?;
    Ok(IngestRequest {
        area: payload.area,
        people_count,
        timestamp: payload.timestamp,
    })
}

fn update_status(request: &HttpRequest, monitor_cfg: &MonitorConfig) -> Result<ApiResponse> {
    let reading = match parse_reading(&request.body) {
        Ok(reading) => reading,
        Err(err) => {
            log::warn!("ingest rejected: {}", err);
            return Ok(ApiResponse::error(400, &err.to_string()));
        }
    };

    let mut monitor = Monitor::open(monitor_cfg)?;
    let stored = monitor.ingest(&reading.area, reading.people_count, reading.timestamp)?;
    log::info!(
        "reading accepted: area={} people_count={} status={} updated_at={}",
        stored.area,
        stored.people_count,
        stored.status,
        stored.updated_at
    );
    ApiResponse::json(
        200,
        &Message {
            message: "Data updated successfully",
        },
    )
}

// -------------------- Queries --------------------

fn areas(request: &HttpRequest, monitor_cfg: &MonitorConfig) -> Result<ApiResponse> {
    let query = request.query();
    let order = match query.get("order") {
        Some(value) => match AreaOrder::from_query(value) {
            Ok(order) => order,
            Err(err) => return Ok(ApiResponse::error(400, &err.to_string())),
        },
        None => AreaOrder::Name,
    };
    let mut monitor = Monitor::open(monitor_cfg)?;
    let views = monitor.areas(order)?;
    ApiResponse::json(200, &views)
}

fn history(request: &HttpRequest, monitor_cfg: &MonitorConfig) -> Result<ApiResponse> {
    let query = request.query();
    let Some(area) = query.get("area") else {
        return Ok(ApiResponse::error(400, "missing area"));
    };
    let limit = match query.get("limit") {
        Some(raw) => match raw.parse::<usize>() {
            Ok(limit) => limit.min(MAX_HISTORY_LIMIT),
            Err(_) => return Ok(ApiResponse::error(400, "limit must be a non-negative integer")),
        },
        None => DEFAULT_HISTORY_LIMIT,
    };
    let mut monitor = Monitor::open(monitor_cfg)?;
    let records = monitor.history(area, limit)?;
    ApiResponse::json(200, &records)
}

// -------------------- HTTP plumbing --------------------

#[derive(Serialize)]
struct Message<'a> {
    message: &'a str,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

struct ApiResponse {
    status: u16,
    body: Vec<u8>,
}

impl ApiResponse {
    fn raw(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.as_bytes().to_vec(),
        }
    }

    fn json<T: Serialize + ?Sized>(status: u16, value: &T) -> Result<Self> {
        Ok(Self {
            status,
            body: serde_json::to_vec(value)?,
        })
    }

    fn error(status: u16, error: &str) -> Self {
        let body = serde_json::to_vec(&ErrorBody { error })
            .unwrap_or_else(|_| br#"{"error":"internal"}"#.to_vec());
        Self { status, body }
    }
}

/// Why a request could not be read off the socket.
#[derive(Debug)]
enum RequestError {
    /// headers or declared body exceed `MAX_REQUEST_BYTES`
    TooLarge,
    Malformed(String),
    /// peer went away before sending a full request head
    Closed,
    Io(std::io::Error),
}

impl RequestError {
    /// Response owed to the client, if the connection is still usable.
    fn response(&self) -> Option<ApiResponse> {
        match self {
            RequestError::TooLarge => Some(ApiResponse::error(413, "request too large")),
            RequestError::Malformed(reason) => Some(ApiResponse::error(400, reason)),
            RequestError::Closed | RequestError::Io(_) => None,
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::TooLarge => f.write_str("request too large"),
            RequestError::Malformed(reason) => write!(f, "malformed request: {}", reason),
            RequestError::Closed => f.write_str("connection closed before request headers"),
            RequestError::Io(err) => write!(f, "request read failed: {}", err),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Io(err)
    }
}

fn discard(stream: &mut TcpStream, mut remaining: usize) {
    let mut buf = [0u8; 1024];
    while remaining > 0 {
        match stream.read(&mut buf[..remaining.min(1024)]) {
            Ok(0) | Err(_) => break,
            Ok(n) => remaining -= n,
        }
    }
}

fn read_request(stream: &mut TcpStream) -> std::result::Result<HttpRequest, RequestError> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(RequestError::Closed);
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(RequestError::TooLarge);
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(raw_path)) = (parts.next(), parts.next()) else {
        return Err(RequestError::Malformed(format!(
            "bad request line '{}'",
            request_line
        )));
    };
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value.parse::<usize>().map_err(|_| {
            RequestError::Malformed(format!("invalid content-length '{}'", value))
        })?,
        None => 0,
    };
    let body_start = header_end + 4;
    if body_start.saturating_add(content_length) > MAX_REQUEST_BYTES {
        let buffered = data.len() - body_start;
        discard(
            stream,
            content_length
                .saturating_sub(buffered)
                .min(MAX_DISCARD_BYTES),
        );
        return Err(RequestError::TooLarge);
    }
    let mut body = data.split_off(body_start);
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
    body: Vec<u8>,
}

impl HttpRequest {
    fn query(&self) -> HashMap<String, String> {
        match self.raw_path.split_once('?') {
            Some((_, query)) => url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
            None => HashMap::new(),
        }
    }
}
