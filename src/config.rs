//! Process-wide configuration, built once at startup from the environment
//! (§6, §9 "global state"). Validates all required config before any
//! poller spawns — no partial starts.

use std::collections::HashMap;
use std::env;

use crate::error::TriageError;

#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: String,
    pub api_keys: Vec<String>,
    pub redis_url: String,
    pub poll_interval_secs: u64,
    pub cities: HashMap<String, String>,
    pub models: Vec<String>,
}

impl Config {
    pub const DEFAULT_REDIS_URL: &'static str = "redis://redis:6379/0";
    pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

    pub fn from_env() -> Result<Self, TriageError> {
        let openai_api_key = require_var("OPENAI_API_KEY")?;

        let api_keys = require_var("API_KEYS")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if api_keys.is_empty() {
            return Err(TriageError::Config("API_KEYS must list at least one key".into()));
        }

        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| Self::DEFAULT_REDIS_URL.to_string());

        let poll_interval_secs = env::var("POLL_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Self::DEFAULT_POLL_INTERVAL_SECS);

        let cities = parse_cities(&require_var("CITIES")?)?;
        if cities.is_empty() {
            return Err(TriageError::Config("CITIES must map at least one city".into()));
        }

        let models = env::var("MODELS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if models.is_empty() {
            tracing::warn!("MODELS not set — classifier has no fallback chain configured");
        }

        Ok(Config {
            openai_api_key,
            api_keys,
            redis_url,
            poll_interval_secs,
            cities,
            models,
        })
    }

    pub fn base_url_for(&self, city: &str) -> Result<&str, TriageError> {
        self.cities
            .get(city)
            .map(String::as_str)
            .ok_or_else(|| TriageError::UnknownCity(city.to_string()))
    }
}

fn require_var(name: &str) -> Result<String, TriageError> {
    env::var(name).map_err(|_| TriageError::Config(format!("{name} must be set")))
}

/// Parses `CITIES` either as `city=url,city2=url2` or as a JSON object
/// `{"city": "url", ...}` — both are unambiguous and either form covers the
/// env-var mapping described in §6.
fn parse_cities(raw: &str) -> Result<HashMap<String, String>, TriageError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|e| TriageError::Config(format!("CITIES is not valid JSON: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| TriageError::Config("CITIES JSON must be an object".into()))?;
        obj.iter()
            .map(|(k, v)| {
                v.as_str()
                    .map(|s| (k.clone(), s.to_string()))
                    .ok_or_else(|| TriageError::Config(format!("CITIES.{k} must be a string")))
            })
            .collect()
    } else {
        trimmed
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| {
                entry
                    .split_once('=')
                    .map(|(city, url)| (city.trim().to_string(), url.trim().to_string()))
                    .ok_or_else(|| {
                        TriageError::Config(format!("CITIES entry '{entry}' is not city=url"))
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_form() {
        let cities = parse_cities("springfield=https://a.example,shelbyville=https://b.example").unwrap();
        assert_eq!(cities.get("springfield").unwrap(), "https://a.example");
        assert_eq!(cities.get("shelbyville").unwrap(), "https://b.example");
    }

    #[test]
    fn parses_json_object_form() {
        let cities = parse_cities(r#"{"springfield": "https://a.example"}"#).unwrap();
        assert_eq!(cities.get("springfield").unwrap(), "https://a.example");
    }

    #[test]
    fn rejects_malformed_comma_form() {
        assert!(parse_cities("springfield").is_err());
    }
}
