use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::emotion::{PipelineSettings, DEFAULT_SAD_THRESHOLD};
use crate::state::DataPaths;

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_API_HOST: &str = "0.0.0.0";
const DEFAULT_API_PORT: u16 = 8000;
const DEFAULT_CAMERA_DEVICE: &str = "/dev/video0";
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_CLASSIFIER: &str = "stub";
const DEFAULT_CLASSIFIER_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MODEL_INPUT_SIZE: u32 = 224;
const DEFAULT_WEATHER_UNITS: &str = "metric";
const DEFAULT_WEATHER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CITY: &str = "London";
const DEFAULT_COUNTRY: &str = "UK";
const WEATHER_UNITS: [&str; 3] = ["metric", "imperial", "standard"];

#[derive(Debug, Deserialize, Default)]
struct MirrorConfigFile {
    data_dir: Option<PathBuf>,
    api: Option<ApiConfigFile>,
    camera: Option<CameraConfigFile>,
    classifier: Option<ClassifierConfigFile>,
    emotion: Option<EmotionConfigFile>,
    weather: Option<WeatherConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ClassifierConfigFile {
    backend: Option<String>,
    command: Option<Vec<String>>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct EmotionConfigFile {
    sad_threshold: Option<f32>,
    abort_on_persist_failure: Option<bool>,
    detection_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct WeatherConfigFile {
    opencage_api_key: Option<String>,
    units: Option<String>,
    timeout_secs: Option<u64>,
    default_city: Option<String>,
    default_country: Option<String>,
    geocode_url: Option<String>,
    onecall_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub data_dir: PathBuf,
    pub api_addr: String,
    pub camera: CameraSettings,
    pub classifier: ClassifierSettings,
    pub emotion: EmotionSettings,
    pub weather: WeatherSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    /// `stub`, `command` or `tract`.
    pub backend: String,
    /// Program and arguments for the `command` backend.
    pub command: Vec<String>,
    /// ONNX model for the `tract` backend.
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub timeout: Duration,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_CLASSIFIER.to_string(),
            command: Vec::new(),
            model_path: None,
            input_size: DEFAULT_MODEL_INPUT_SIZE,
            timeout: Duration::from_secs(DEFAULT_CLASSIFIER_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmotionSettings {
    pub sad_threshold: f32,
    pub abort_on_persist_failure: bool,
    /// Background detection period for `mirrord`; `None` leaves detection
    /// to `/emotion` requests.
    pub detection_interval: Option<Duration>,
}

impl EmotionSettings {
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            sad_threshold: self.sad_threshold,
            abort_on_persist_failure: self.abort_on_persist_failure,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WeatherSettings {
    pub opencage_api_key: Option<String>,
    pub units: String,
    pub timeout: Duration,
    pub default_city: String,
    pub default_country: String,
    pub geocode_url: Option<String>,
    pub onecall_url: Option<String>,
}

impl MirrorConfig {
    /// Loads `MIRROR_CONFIG` (if set), then applies environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MIRROR_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => read_config_file(path)?,
            None => MirrorConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn data_paths(&self) -> DataPaths {
        DataPaths::new(&self.data_dir)
    }

    fn from_file(file: MirrorConfigFile) -> Self {
        let data_dir = file
            .data_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| format!("{}:{}", DEFAULT_API_HOST, DEFAULT_API_PORT));

        let camera = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            device: camera
                .device
                .unwrap_or_else(|| DEFAULT_CAMERA_DEVICE.to_string()),
            width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
            height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
        };

        let classifier = file.classifier.unwrap_or_default();
        let defaults = ClassifierSettings::default();
        let classifier = ClassifierSettings {
            backend: classifier.backend.unwrap_or(defaults.backend),
            command: classifier.command.unwrap_or(defaults.command),
            model_path: classifier.model_path,
            input_size: classifier.input_size.unwrap_or(defaults.input_size),
            timeout: classifier
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        };

        let emotion = file.emotion.unwrap_or_default();
        let emotion = EmotionSettings {
            sad_threshold: emotion.sad_threshold.unwrap_or(DEFAULT_SAD_THRESHOLD),
            abort_on_persist_failure: emotion.abort_on_persist_failure.unwrap_or(false),
            detection_interval: emotion
                .detection_interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        };

        let weather = file.weather.unwrap_or_default();
        let weather = WeatherSettings {
            opencage_api_key: weather.opencage_api_key,
            units: weather
                .units
                .unwrap_or_else(|| DEFAULT_WEATHER_UNITS.to_string()),
            timeout: Duration::from_secs(
                weather.timeout_secs.unwrap_or(DEFAULT_WEATHER_TIMEOUT_SECS),
            ),
            default_city: weather
                .default_city
                .unwrap_or_else(|| DEFAULT_CITY.to_string()),
            default_country: weather
                .default_country
                .unwrap_or_else(|| DEFAULT_COUNTRY.to_string()),
            geocode_url: weather.geocode_url,
            onecall_url: weather.onecall_url,
        };

        Self {
            data_dir,
            api_addr,
            camera,
            classifier,
            emotion,
            weather,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = non_empty_env("MIRROR_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(addr) = non_empty_env("MIRROR_API_ADDR") {
            self.api_addr = addr;
        } else if non_empty_env("HOST").is_some() || non_empty_env("PORT").is_some() {
            let (current_host, current_port) = split_host_port(&self.api_addr);
            let host = non_empty_env("HOST").unwrap_or(current_host);
            let port = match non_empty_env("PORT") {
                Some(port) => port
                    .parse::<u16>()
                    .map_err(|_| anyhow!("PORT must be an integer between 0 and 65535"))?
                    .to_string(),
                None => current_port,
            };
            self.api_addr = format!("{}:{}", host, port);
        }
        if let Some(device) = non_empty_env("MIRROR_CAMERA_DEVICE") {
            self.camera.device = device;
        }
        if let Some(backend) = non_empty_env("MIRROR_CLASSIFIER") {
            self.classifier.backend = backend;
        }
        if let Some(threshold) = non_empty_env("MIRROR_SAD_THRESHOLD") {
            self.emotion.sad_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("MIRROR_SAD_THRESHOLD must be a number"))?;
        }
        if let Some(interval) = non_empty_env("MIRROR_DETECTION_INTERVAL_SECS") {
            let seconds: u64 = interval.parse().map_err(|_| {
                anyhow!("MIRROR_DETECTION_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.emotion.detection_interval =
                (seconds > 0).then(|| Duration::from_secs(seconds));
        }
        if let Some(key) = non_empty_env("OPENCAGE_API_KEY") {
            self.weather.opencage_api_key = Some(key);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.emotion.sad_threshold) {
            return Err(anyhow!("sad_threshold must be within 0..=100"));
        }
        if self.classifier.timeout.is_zero() {
            return Err(anyhow!("classifier timeout must be greater than zero"));
        }
        if self.classifier.input_size == 0 {
            return Err(anyhow!("classifier input_size must be greater than zero"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera dimensions must be greater than zero"));
        }
        self.weather.units = self.weather.units.to_lowercase();
        if !WEATHER_UNITS.contains(&self.weather.units.as_str()) {
            return Err(anyhow!(
                "weather units must be one of {}",
                WEATHER_UNITS.join(", ")
            ));
        }
        if self.weather.timeout.is_zero() {
            return Err(anyhow!("weather timeout must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<MirrorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn split_host_port(addr: &str) -> (String, String) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.to_string()),
        None => (addr.to_string(), DEFAULT_API_PORT.to_string()),
    }
}
