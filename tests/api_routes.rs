use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use mirror_companion::api::{ApiConfig, ApiHandle, ApiServer, AppState};
use mirror_companion::config::WeatherSettings;
use mirror_companion::{
    ensure_data_files, ClassifierAdapter, DataPaths, EmotionPipeline, FileStateStore,
    JpegFileSink, NewsService, PipelineSettings, StubBackend, StubCamera, UserSettingsStore,
    WeatherService,
};

fn weather_settings() -> WeatherSettings {
    WeatherSettings {
        opencage_api_key: None,
        units: "metric".to_string(),
        timeout: Duration::from_secs(2),
        default_city: "London".to_string(),
        default_country: "UK".to_string(),
        geocode_url: None,
        onecall_url: None,
    }
}

fn send(addr: SocketAddr, method: &str, path: &str, body: Option<&str>) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let body = body.unwrap_or("");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {len}\r\n\r\n{body}",
        len = body.len()
    );
    stream.write_all(request.as_bytes())?;
    Ok(stream)
}

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

fn read_until(stream: &mut TcpStream, needle: &str, seen: &mut String) -> Result<()> {
    let mut buf = [0u8; 512];
    while !seen.contains(needle) {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            anyhow::bail!("stream closed before '{}'", needle);
        }
        seen.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    Ok(())
}

struct TestApi {
    dir: tempfile::TempDir,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        let dir = tempdir()?;
        let paths = DataPaths::new(dir.path());
        ensure_data_files(&paths)?;

        let pipeline = EmotionPipeline::new(
            Arc::new(FileStateStore::new(paths.clone())),
            Box::new(StubCamera::new("stub://api", 32, 24)),
            Box::new(JpegFileSink::new(paths.captured_image())),
            ClassifierAdapter::new(Arc::new(StubBackend::default()), Duration::from_secs(5)),
            PipelineSettings::default(),
        );
        let state = AppState {
            pipeline: Arc::new(pipeline),
            settings: UserSettingsStore::new(paths.user_settings()),
            news: NewsService::new(paths.happy_news()),
            weather: WeatherService::new(&weather_settings()),
            default_city: "London".to_string(),
            default_country: "UK".to_string(),
        };
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        };
        let api_handle = ApiServer::new(api_config, Arc::new(state)).spawn()?;
        Ok(Self {
            dir,
            api_handle: Some(api_handle),
        })
    }

    fn addr(&self) -> SocketAddr {
        self.api_handle
            .as_ref()
            .map(|handle| handle.addr)
            .expect("api running")
    }

    fn paths(&self) -> DataPaths {
        DataPaths::new(self.dir.path())
    }

    fn call(&self, method: &str, path: &str, body: Option<&str>) -> Result<(String, String)> {
        let mut stream = send(self.addr(), method, path, body)?;
        read_response(&mut stream)
    }

    fn call_json(&self, method: &str, path: &str, body: Option<&str>) -> Result<(String, Value)> {
        let (headers, body) = self.call(method, path, body)?;
        Ok((headers, serde_json::from_str(&body)?))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            let _ = handle.stop();
        }
    }
}

#[test]
fn health_reports_version() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.call_json("GET", "/health", None)?;
    assert!(headers.starts_with("HTTP/1.1 200"));
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], mirror_companion::VERSION);
    assert!(body["timestamp"].as_f64().unwrap_or(0.0) > 0.0);
    Ok(())
}

#[test]
fn index_serves_the_mirror_page() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.call("GET", "/", None)?;
    assert!(headers.starts_with("HTTP/1.1 200"));
    assert!(headers.contains("text/html"));
    assert!(body.contains("EventSource(\"/events\")"));
    Ok(())
}

#[test]
fn setup_merges_settings_and_data_returns_them() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, body) = api.call_json(
        "POST",
        "/setup",
        Some(r#"{"city":"Oslo","country":"NO","openWeatherApiKey":"abc"}"#),
    )?;
    assert!(headers.starts_with("HTTP/1.1 200"));
    assert_eq!(body["status"], "success");

    let (_, body) = api.call_json("POST", "/setup", Some(r#"{"city":"","newsSource":"BBC"}"#))?;
    assert_eq!(body["status"], "success");

    let (headers, data) = api.call_json("GET", "/data", None)?;
    assert!(headers.starts_with("HTTP/1.1 200"));
    assert_eq!(data["city"], "Oslo");
    assert_eq!(data["country"], "NO");
    assert_eq!(data["newsSource"], "BBC");
    Ok(())
}

#[test]
fn setup_without_data_is_rejected() -> Result<()> {
    let api = TestApi::new()?;
    for body in [None, Some("{}"), Some("not json"), Some("[1,2]")] {
        let (headers, response) = api.call_json("POST", "/setup", body)?;
        assert!(headers.starts_with("HTTP/1.1 400"), "{:?}", body);
        assert_eq!(response["status"], "error");
        assert_eq!(response["message"], "Data is missing");
    }
    Ok(())
}

#[test]
fn emotion_runs_the_pipeline() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.call_json("GET", "/emotion", None)?;
    assert!(headers.starts_with("HTTP/1.1 200"));
    assert_eq!(body["emotion"], "neutral");
    assert!(api.paths().captured_image().exists());
    Ok(())
}

#[test]
fn emotion_respects_screen_state() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, body) = api.call_json("POST", "/screen", Some(r#"{"state":"off"}"#))?;
    assert!(headers.starts_with("HTTP/1.1 200"));
    assert_eq!(body["state"], "off");
    assert_eq!(
        std::fs::read_to_string(api.paths().screen_operation())?,
        "off"
    );

    let (_, body) = api.call_json("GET", "/screen", None)?;
    assert_eq!(body["state"], "off");

    let (_, body) = api.call_json("GET", "/emotion", None)?;
    assert_eq!(body["emotion"], "Screen operation is off");
    assert!(!api.paths().captured_image().exists());

    let (_, body) = api.call_json("POST", "/screen", Some(r#"{"state":"ON"}"#))?;
    assert_eq!(body["state"], "on");
    let (_, body) = api.call_json("GET", "/emotion", None)?;
    assert_eq!(body["emotion"], "neutral");
    Ok(())
}

#[test]
fn screen_rejects_unknown_states() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, _) = api.call_json("POST", "/screen", Some(r#"{"state":"dim"}"#))?;
    assert!(headers.starts_with("HTTP/1.1 400"));
    Ok(())
}

#[test]
fn happy_news_is_404_until_entries_exist() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.call_json("GET", "/happy_news", None)?;
    assert!(headers.starts_with("HTTP/1.1 404"));
    assert_eq!(body["message"], "No happy news available");

    std::fs::write(
        api.paths().happy_news(),
        "Title: Otter adopts duckling\nDescription: Friends at last.\nDate: 2024-05-01\n",
    )?;
    let (headers, body) = api.call_json("GET", "/happy_news", None)?;
    assert!(headers.starts_with("HTTP/1.1 200"));
    assert_eq!(body["title"], "Otter adopts duckling");
    assert_eq!(body["description"], "Friends at last.");
    assert_eq!(body["date"], "2024-05-01");
    Ok(())
}

#[test]
fn weather_requires_an_api_key() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.call_json("GET", "/weather", None)?;
    assert!(headers.starts_with("HTTP/1.1 400"));
    assert_eq!(body["message"], "OpenWeather API key is missing");
    Ok(())
}

#[test]
fn unknown_routes_and_methods() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, _) = api.call("GET", "/nope", None)?;
    assert!(headers.starts_with("HTTP/1.1 404"));
    let (headers, _) = api.call("DELETE", "/data", None)?;
    assert!(headers.starts_with("HTTP/1.1 405"));
    let (headers, _) = api.call("GET", "/setup", None)?;
    assert!(headers.starts_with("HTTP/1.1 405"));
    Ok(())
}

#[test]
fn oversized_requests_are_rejected() -> Result<()> {
    let api = TestApi::new()?;
    let mut stream = TcpStream::connect(api.addr())?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.write_all(
        b"POST /setup HTTP/1.1\r\nHost: localhost\r\nContent-Length: 1048576\r\n\r\n",
    )?;
    let (headers, _) = read_response(&mut stream)?;
    assert!(headers.starts_with("HTTP/1.1 413"));
    Ok(())
}

#[test]
fn overflowing_content_length_is_rejected() -> Result<()> {
    let api = TestApi::new()?;
    let mut stream = TcpStream::connect(api.addr())?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.write_all(
        format!(
            "POST /setup HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
            usize::MAX
        )
        .as_bytes(),
    )?;
    let (headers, _) = read_response(&mut stream)?;
    assert!(headers.starts_with("HTTP/1.1 413"));

    let (headers, _) = api.call_json("GET", "/health", None)?;
    assert!(headers.starts_with("HTTP/1.1 200"));
    Ok(())
}

#[test]
fn events_stream_announces_location_changes() -> Result<()> {
    let api = TestApi::new()?;
    let mut events = send(api.addr(), "GET", "/events", None)?;
    let mut seen = String::new();

    read_until(&mut events, "data: update\n\n", &mut seen)?;
    assert!(seen.starts_with("HTTP/1.1 200"));
    assert!(seen.contains("text/event-stream"));
    seen.clear();

    let (_, body) = api.call_json("POST", "/setup", Some(r#"{"city":"Lisbon","country":"PT"}"#))?;
    assert_eq!(body["status"], "success");

    read_until(&mut events, "data: update\n\n", &mut seen)?;
    Ok(())
}
