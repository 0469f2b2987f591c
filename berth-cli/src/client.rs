//! Blocking HTTP client for the daemon API.

use std::time::Duration;

use berth::Settings;
use serde_json::Value;

use crate::error::CliError;
use crate::utils::GlobalOptions;

/// A client bound to one daemon instance.
pub struct DaemonClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::blocking::Client,
}

impl DaemonClient {
    /// Build a client from the resolved settings.
    ///
    /// The bearer token comes from `BERTH_AUTH_TOKEN` or the persisted
    /// `auth.token`; it may be absent when the daemon has never run, in
    /// which case only unauthenticated requests can succeed.
    pub fn new(global: &GlobalOptions) -> Result<Self, CliError> {
        let settings = global.settings()?;
        Ok(Self::from_settings(&settings))
    }

    /// Build a client directly from settings.
    pub fn from_settings(settings: &Settings) -> Self {
        let token = std::env::var("BERTH_AUTH_TOKEN").ok().or_else(|| {
            std::fs::read_to_string(settings.token_path())
                .ok()
                .map(|raw| raw.trim().to_string())
        });
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            base_url: format!("http://127.0.0.1:{}", settings.listen_port),
            token,
            http,
        }
    }

    /// The daemon base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET` a path and decode the JSON body.
    pub fn get(&self, path: &str) -> Result<Value, CliError> {
        let request = self.http.get(format!("{}{path}", self.base_url));
        self.send(request)
    }

    /// `POST` a path with a JSON body.
    pub fn post(&self, path: &str, body: &Value) -> Result<Value, CliError> {
        let request = self.http.post(format!("{}{path}", self.base_url)).json(body);
        self.send(request)
    }

    /// `PUT` a path with no body.
    pub fn put(&self, path: &str) -> Result<Value, CliError> {
        let request = self.http.put(format!("{}{path}", self.base_url));
        self.send(request)
    }

    /// `DELETE` a path.
    pub fn delete(&self, path: &str) -> Result<Value, CliError> {
        let request = self.http.delete(format!("{}{path}", self.base_url));
        self.send(request)
    }

    fn send(&self, mut request: reqwest::blocking::RequestBuilder) -> Result<Value, CliError> {
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().map_err(|_| CliError::DaemonUnavailable {
            url: self.base_url.clone(),
        })?;

        let status = response.status();
        let body: Value = response.json().unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(body);
        }

        let code = body
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string();
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string();
        Err(CliError::Api { code, message })
    }
}
