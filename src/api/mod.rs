//! Mirror HTTP API.
//!
//! Plain HTTP/1.1 over `std::net`, one thread per connection. Every response
//! closes the connection except `/events`, which streams until the client
//! goes away or the server stops.

use crate::config::MirrorConfig;
use crate::emotion::EmotionPipeline;
use crate::news::NewsService;
use crate::settings::{UserSettings, UserSettingsStore};
use crate::state::{ScreenState, StateKey, StateStore};
use crate::weather::WeatherService;
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const MAX_REQUEST_BYTES: usize = 64 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const EVENTS_KEEPALIVE: Duration = Duration::from_secs(15);
const EVENTS_POLL: Duration = Duration::from_secs(1);
const INDEX_HTML: &str = include_str!("index.html");

const ROUTES: [&str; 9] = [
    "/",
    "/setup",
    "/data",
    "/weather",
    "/events",
    "/emotion",
    "/happy_news",
    "/screen",
    "/health",
];

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
        }
    }
}

/// Everything a request handler can reach.
pub struct AppState {
    pub pipeline: Arc<EmotionPipeline>,
    pub settings: UserSettingsStore,
    pub news: NewsService,
    pub weather: WeatherService,
    pub default_city: String,
    pub default_country: String,
}

impl AppState {
    pub fn from_config(cfg: &MirrorConfig, pipeline: Arc<EmotionPipeline>) -> Self {
        let paths = cfg.data_paths();
        Self {
            pipeline,
            settings: UserSettingsStore::new(paths.user_settings()),
            news: NewsService::new(paths.happy_news()),
            weather: WeatherService::new(&cfg.weather),
            default_city: cfg.weather.default_city.clone(),
            default_country: cfg.weather.default_country.clone(),
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
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: Arc<AppState>) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let state = self.state;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, state, shutdown_thread) {
                log::error!("mirror api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, state: Arc<AppState>, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = state.clone();
                let shutdown = shutdown.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &state, &shutdown) {
                        log::warn!("mirror api request from {} failed: {:#}", peer, err);
                    }
                });
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

fn handle_connection(mut stream: TcpStream, state: &AppState, shutdown: &AtomicBool) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) if err.is::<RequestTooLarge>() => {
            return write_error(&mut stream, 413, "Request too large");
        }
        Err(err) => {
            write_error(&mut stream, 400, "Malformed request")?;
            return Err(err);
        }
    };
    log::debug!("{} {}", request.method, request.path);

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => write_response(
            &mut stream,
            200,
            "text/html; charset=utf-8",
            INDEX_HTML.as_bytes(),
        ),
        ("POST", "/setup") => setup(&mut stream, state, &request),
        ("GET", "/data") => data(&mut stream, state),
        ("GET", "/weather") => weather(&mut stream, state),
        ("GET", "/events") => events(&mut stream, state, shutdown),
        ("GET", "/emotion") => emotion(&mut stream, state),
        ("GET", "/happy_news") => happy_news(&mut stream, state),
        ("GET", "/screen") => screen_status(&mut stream, state),
        ("POST", "/screen") => set_screen(&mut stream, state, &request),
        ("GET", "/health") => write_json(
            &mut stream,
            200,
            &json!({
                "status": "healthy",
                "version": crate::VERSION,
                "timestamp": unix_timestamp(),
            }),
        ),
        (_, path) if ROUTES.contains(&path) => write_error(&mut stream, 405, "Method not allowed"),
        _ => write_error(&mut stream, 404, "Not found"),
    }
}

fn setup(stream: &mut TcpStream, state: &AppState, request: &HttpRequest) -> Result<()> {
    let update: UserSettings = match serde_json::from_slice::<Value>(&request.body) {
        Ok(Value::Object(map)) if !map.is_empty() => map,
        _ => {
            log::warn!("no data received in setup request");
            return write_error(stream, 400, "Data is missing");
        }
    };
    match state.settings.merge(&update) {
        Ok(written) => {
            log::info!("user settings updated: {}", written.join(", "));
            write_json(stream, 200, &json!({"status": "success"}))
        }
        Err(err) => {
            log::error!("error saving user settings: {:#}", err);
            write_error(stream, 500, &format!("{:#}", err))
        }
    }
}

fn data(stream: &mut TcpStream, state: &AppState) -> Result<()> {
    match state.settings.raw() {
        Ok(body) => write_response(stream, 200, "application/json", &body),
        Err(err) => {
            log::error!("error reading user settings: {:#}", err);
            write_error(stream, 500, &format!("{:#}", err))
        }
    }
}

fn weather(stream: &mut TcpStream, state: &AppState) -> Result<()> {
    let settings = state.settings.load();
    let city = setting_str(&settings, "city").unwrap_or(state.default_city.as_str());
    let country = setting_str(&settings, "country").unwrap_or(state.default_country.as_str());
    let Some(api_key) = setting_str(&settings, "openWeatherApiKey") else {
        log::error!("OpenWeather API key is missing");
        return write_error(stream, 400, "OpenWeather API key is missing");
    };

    match state.weather.weather_for_location(city, country, api_key) {
        Ok(body) => write_json(stream, 200, &body),
        Err(err) => write_error(stream, 502, &err.to_string()),
    }
}

/// The settings that make the mirror page reload.
#[derive(Clone, Debug, PartialEq, Eq)]
struct WatchedSettings {
    city: String,
    country: String,
    news_source: String,
}

impl WatchedSettings {
    fn from_settings(settings: &UserSettings) -> Self {
        let field = |key| setting_str(settings, key).unwrap_or_default().to_string();
        Self {
            city: field("city"),
            country: field("country"),
            news_source: field("newsSource"),
        }
    }
}

fn events(stream: &mut TcpStream, state: &AppState, shutdown: &AtomicBool) -> Result<()> {
    stream.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n\r\n",
    )?;
    let feed = state.settings.changes().clone();
    let mut seen = feed.current();
    let mut last: Option<WatchedSettings> = None;
    let mut last_write = Instant::now();

    loop {
        let message = match state.settings.try_load() {
            Ok(settings) => {
                let current = WatchedSettings::from_settings(&settings);
                if last.as_ref() == Some(&current) {
                    None
                } else {
                    log::info!(
                        "settings changed: location={}, {} news={}",
                        current.city,
                        current.country,
                        current.news_source
                    );
                    last = Some(current);
                    Some("data: update\n\n")
                }
            }
            Err(err) => {
                log::warn!("events stream cannot read settings: {:#}", err);
                last = None;
                Some("data: error\n\n")
            }
        };
        if let Some(message) = message {
            if stream.write_all(message.as_bytes()).is_err() {
                return Ok(());
            }
            last_write = Instant::now();
        }

        loop {
            if shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            let generation = feed.wait_for_change(seen, EVENTS_POLL);
            if generation != seen {
                seen = generation;
                break;
            }
            if last.is_none() {
                break;
            }
            if last_write.elapsed() >= EVENTS_KEEPALIVE {
                if stream.write_all(b": keep-alive\n\n").is_err() {
                    return Ok(());
                }
                last_write = Instant::now();
            }
        }
    }
}

fn emotion(stream: &mut TcpStream, state: &AppState) -> Result<()> {
    let outcome = state.pipeline.run_once();
    log::info!("emotion request completed: {}", outcome);
    match state.pipeline.results().load_result() {
        Ok(result) => write_json(stream, 200, &json!({ "emotion": result })),
        Err(err) => {
            log::error!("error reading emotion result: {:#}", err);
            write_error(stream, 500, &format!("{:#}", err))
        }
    }
}

fn happy_news(stream: &mut TcpStream, state: &AppState) -> Result<()> {
    match state.news.random_happy_news() {
        Some(entry) => write_json(stream, 200, &serde_json::to_value(entry)?),
        None => write_error(stream, 404, "No happy news available"),
    }
}

fn screen_status(stream: &mut TcpStream, state: &AppState) -> Result<()> {
    match state.pipeline.state().get(StateKey::ScreenState) {
        Ok(raw) => {
            let screen = raw
                .as_deref()
                .map(ScreenState::parse)
                .unwrap_or(ScreenState::Off);
            write_json(stream, 200, &json!({ "state": screen.as_str() }))
        }
        Err(err) => {
            log::error!("error reading screen state: {:#}", err);
            write_error(stream, 500, &format!("{:#}", err))
        }
    }
}

fn set_screen(stream: &mut TcpStream, state: &AppState, request: &HttpRequest) -> Result<()> {
    let requested = serde_json::from_slice::<Value>(&request.body)
        .ok()
        .and_then(|body| body.get("state").and_then(Value::as_str).map(str::to_lowercase));
    let screen = match requested.as_deref() {
        Some("on") => ScreenState::On,
        Some("off") => ScreenState::Off,
        _ => return write_error(stream, 400, "state must be \"on\" or \"off\""),
    };
    match state
        .pipeline
        .state()
        .set(StateKey::ScreenState, screen.as_str())
    {
        Ok(()) => {
            log::info!("screen operation set to {}", screen.as_str());
            write_json(
                stream,
                200,
                &json!({ "status": "success", "state": screen.as_str() }),
            )
        }
        Err(err) => {
            log::error!("error writing screen state: {:#}", err);
            write_error(stream, 500, &format!("{:#}", err))
        }
    }
}

fn setting_str<'a>(settings: &'a UserSettings, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug)]
struct RequestTooLarge;

impl fmt::Display for RequestTooLarge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request exceeds {} bytes", MAX_REQUEST_BYTES)
    }
}

impl std::error::Error for RequestTooLarge {}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(RequestTooLarge.into());
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if header_end
        .checked_add(content_length)
        .map_or(true, |total| total > MAX_REQUEST_BYTES)
    {
        return Err(RequestTooLarge.into());
    }
    let mut body = data.split_off(header_end);
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_json(stream: &mut TcpStream, status: u16, body: &Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_error(stream: &mut TcpStream, status: u16, message: &str) -> Result<()> {
    write_json(
        stream,
        status,
        &json!({ "status": "error", "message": message }),
    )
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
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        502 => "HTTP/1.1 502 Bad Gateway",
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
    body: Vec<u8>,
}
