//! Weather proxy: OpenCage geocoding followed by an OpenWeather One Call.
//!
//! Upstream bodies are passed through untouched; this module only decides
//! whether a usable answer came back.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::fmt;
use url::Url;

use crate::config::WeatherSettings;

pub const OPENCAGE_GEOCODE_URL: &str = "https://api.opencagedata.com/geocode/v1/json";
pub const OPENWEATHER_ONECALL_URL: &str = "https://api.openweathermap.org/data/3.0/onecall";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeatherError {
    LocationNotFound,
    Unavailable,
}

impl fmt::Display for WeatherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeatherError::LocationNotFound => f.write_str("Location not found"),
            WeatherError::Unavailable => f.write_str("Weather data not available"),
        }
    }
}

impl std::error::Error for WeatherError {}

pub struct WeatherService {
    agent: ureq::Agent,
    opencage_api_key: Option<String>,
    units: String,
    geocode_url: String,
    onecall_url: String,
}

impl WeatherService {
    pub fn new(settings: &WeatherSettings) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(settings.timeout).build();
        Self {
            agent,
            opencage_api_key: settings.opencage_api_key.clone(),
            units: settings.units.clone(),
            geocode_url: settings
                .geocode_url
                .clone()
                .unwrap_or_else(|| OPENCAGE_GEOCODE_URL.to_string()),
            onecall_url: settings
                .onecall_url
                .clone()
                .unwrap_or_else(|| OPENWEATHER_ONECALL_URL.to_string()),
        }
    }

    /// Latitude and longitude of the first geocoding match.
    pub fn get_coordinates(&self, city: &str, country: &str) -> Option<(f64, f64)> {
        log::info!("fetching coordinates for {}, {}", city, country);
        match self.fetch_coordinates(city, country) {
            Ok(Some(coords)) => {
                log::info!("coordinates found: {}, {}", coords.0, coords.1);
                Some(coords)
            }
            Ok(None) => {
                log::warn!("no results found for location: {}, {}", city, country);
                None
            }
            Err(err) => {
                log::error!("error fetching coordinates: {:#}", err);
                None
            }
        }
    }

    /// Current conditions for a coordinate pair; `None` unless the response
    /// carries a `current` section.
    pub fn get_weather(&self, latitude: f64, longitude: f64, api_key: &str) -> Option<Value> {
        log::info!(
            "fetching weather data for coordinates: {}, {}",
            latitude,
            longitude
        );
        match self.fetch_weather(latitude, longitude, api_key) {
            Ok(data) if data.get("current").is_some() => {
                log::info!("weather data retrieved successfully");
                Some(data)
            }
            Ok(_) => {
                log::warn!("weather data missing 'current' section");
                None
            }
            Err(err) => {
                log::error!("error fetching weather: {:#}", err);
                None
            }
        }
    }

    pub fn weather_for_location(
        &self,
        city: &str,
        country: &str,
        api_key: &str,
    ) -> Result<Value, WeatherError> {
        let (latitude, longitude) = self
            .get_coordinates(city, country)
            .ok_or(WeatherError::LocationNotFound)?;
        self.get_weather(latitude, longitude, api_key)
            .ok_or(WeatherError::Unavailable)
    }

    fn fetch_coordinates(&self, city: &str, country: &str) -> Result<Option<(f64, f64)>> {
        let key = self
            .opencage_api_key
            .as_deref()
            .ok_or_else(|| anyhow!("OPENCAGE_API_KEY is not configured"))?;
        let query = format!("{}, {}", city, country);
        let url = Url::parse_with_params(&self.geocode_url, [("q", query.as_str()), ("key", key)])
            .context("build geocoding url")?;
        let data = self.get_json(&url)?;

        let Some(first) = data
            .get("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
        else {
            return Ok(None);
        };
        let geometry = first
            .get("geometry")
            .ok_or_else(|| anyhow!("geocoding result has no geometry"))?;
        let lat = geometry
            .get("lat")
            .and_then(Value::as_f64)
            .ok_or_else(|| anyhow!("geocoding result has no latitude"))?;
        let lng = geometry
            .get("lng")
            .and_then(Value::as_f64)
            .ok_or_else(|| anyhow!("geocoding result has no longitude"))?;
        Ok(Some((lat, lng)))
    }

    fn fetch_weather(&self, latitude: f64, longitude: f64, api_key: &str) -> Result<Value> {
        let lat = latitude.to_string();
        let lon = longitude.to_string();
        let url = Url::parse_with_params(
            &self.onecall_url,
            [
                ("lat", lat.as_str()),
                ("lon", lon.as_str()),
                ("exclude", "minutely,hourly,daily,alerts"),
                ("appid", api_key),
                ("units", self.units.as_str()),
            ],
        )
        .context("build weather url")?;
        self.get_json(&url)
    }

    fn get_json(&self, url: &Url) -> Result<Value> {
        let response = self.agent.get(url.as_str()).call().map_err(|err| match err {
            ureq::Error::Status(code, _) => anyhow!("upstream returned HTTP {}", code),
            ureq::Error::Transport(transport) => anyhow!("request failed: {}", transport),
        })?;
        let body = response.into_string().context("read upstream body")?;
        serde_json::from_str(&body).context("parse upstream JSON")
    }
}
