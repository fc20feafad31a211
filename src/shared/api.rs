//! Remote REST contract: greenhouse data, field settings/control and auth

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::ClientConfig;
use crate::domain::{
    Analytics, DeviceConfig, DeviceKind, FieldSettings, Greenhouse, HistoryQuery, ListQuery,
    Reading,
};
use crate::error::{ApiEnvelope, ClientError, Result};
use crate::http::{HttpClient, HttpResponse};
use crate::validators::{
    validate_email, validate_greenhouse_id, validate_intensity, validate_password,
    validate_time_range,
};

/// Greenhouse data, settings and control endpoints
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait GreenhouseApi: Send + Sync {
    async fn list_greenhouses(&self, query: &ListQuery) -> Result<Vec<Greenhouse>>;

    async fn get_greenhouse(&self, greenhouse_id: &str) -> Result<Greenhouse>;

    async fn analyze_greenhouse(&self, greenhouse_id: &str) -> Result<Analytics>;

    async fn field_history(
        &self,
        greenhouse_id: &str,
        field_index: usize,
        query: &HistoryQuery,
    ) -> Result<Vec<Reading>>;

    async fn field_settings(&self, greenhouse_id: &str, field_index: usize) -> Result<FieldSettings>;

    /// Persist one device's configuration (`{"config_<device>": {...}}`)
    async fn update_device_config(
        &self,
        greenhouse_id: &str,
        field_index: usize,
        device: DeviceKind,
        config: &DeviceConfig,
    ) -> Result<()>;

    /// Set a device's live intensity (0..=100)
    async fn control_device(
        &self,
        greenhouse_id: &str,
        field_index: usize,
        device: DeviceKind,
        value: u8,
    ) -> Result<()>;
}

/// HTTP implementation of [`GreenhouseApi`]
///
/// List/get/analyze/history go to the mobile backend (`API_BASE_URL`) and are
/// wrapped in [`ApiEnvelope`]; settings and control go straight to the
/// greenhouse service (`API_GREENHOUSE_URL`) and answer with bare JSON.
pub struct HttpGreenhouseApi {
    http: Arc<dyn HttpClient>,
    base_url: String,
    greenhouse_url: String,
}

impl HttpGreenhouseApi {
    pub fn new(http: Arc<dyn HttpClient>, config: &ClientConfig) -> Self {
        Self {
            http,
            base_url: config.api_base_url.clone(),
            greenhouse_url: config.api_greenhouse_url.clone(),
        }
    }

    fn field_url(&self, greenhouse_id: &str, field_index: usize) -> String {
        format!("{}/{}/fields/{}", self.greenhouse_url, greenhouse_id, field_index)
    }

    async fn get_envelope<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.http.get(url).await?.error_for_status()?;
        let envelope: ApiEnvelope<T> = serde_json::from_str(&response.body)?;
        envelope.into_data()
    }
}

fn with_params(url: &str, params: &[(&str, String)]) -> Result<String> {
    Url::parse_with_params(url, params)
        .map(String::from)
        .map_err(|e| ClientError::Http(format!("Invalid URL {}: {}", url, e)))
}

fn decode<T: DeserializeOwned>(response: HttpResponse) -> Result<T> {
    let response = response.error_for_status()?;
    Ok(serde_json::from_str(&response.body)?)
}

#[async_trait]
impl GreenhouseApi for HttpGreenhouseApi {
    async fn list_greenhouses(&self, query: &ListQuery) -> Result<Vec<Greenhouse>> {
        let url = with_params(
            &format!("{}/greenhouses/ds-get", self.base_url),
            &[
                ("owner", query.owner.clone().unwrap_or_default()),
                ("location", query.location.clone().unwrap_or_default()),
                ("offset", query.offset.to_string()),
                ("limit", query.limit.to_string()),
            ],
        )?;
        let greenhouses: Vec<Greenhouse> = self.get_envelope(&url).await?;
        debug!(count = greenhouses.len(), "Listed greenhouses");
        Ok(greenhouses)
    }

    async fn get_greenhouse(&self, greenhouse_id: &str) -> Result<Greenhouse> {
        validate_greenhouse_id(greenhouse_id)?;
        let url = format!("{}/greenhouses/ds-get/{}", self.base_url, greenhouse_id);
        self.get_envelope(&url).await
    }

    async fn analyze_greenhouse(&self, greenhouse_id: &str) -> Result<Analytics> {
        validate_greenhouse_id(greenhouse_id)?;
        let url = format!("{}/greenhouses/ds-get-analyze/{}", self.base_url, greenhouse_id);
        self.get_envelope(&url).await
    }

    async fn field_history(
        &self,
        greenhouse_id: &str,
        field_index: usize,
        query: &HistoryQuery,
    ) -> Result<Vec<Reading>> {
        validate_greenhouse_id(greenhouse_id)?;
        validate_time_range(&query.start_time, &query.end_time)?;
        let url = with_params(
            &format!(
                "{}/greenhouses/ds-get-field-history/{}/field/{}",
                self.base_url, greenhouse_id, field_index
            ),
            &[
                ("sensor_type", query.series.key().to_string()),
                ("start_time", query.start_time.clone()),
                ("end_time", query.end_time.clone()),
            ],
        )?;
        self.get_envelope(&url).await
    }

    async fn field_settings(&self, greenhouse_id: &str, field_index: usize) -> Result<FieldSettings> {
        validate_greenhouse_id(greenhouse_id)?;
        let response = self.http.get(&self.field_url(greenhouse_id, field_index)).await?;
        decode(response)
    }

    async fn update_device_config(
        &self,
        greenhouse_id: &str,
        field_index: usize,
        device: DeviceKind,
        config: &DeviceConfig,
    ) -> Result<()> {
        validate_greenhouse_id(greenhouse_id)?;
        let mut body = serde_json::Map::new();
        body.insert(device.config_key(), serde_json::to_value(config)?);
        let body = serde_json::Value::Object(body).to_string();

        self.http
            .patch_json(&self.field_url(greenhouse_id, field_index), body)
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn control_device(
        &self,
        greenhouse_id: &str,
        field_index: usize,
        device: DeviceKind,
        value: u8,
    ) -> Result<()> {
        validate_greenhouse_id(greenhouse_id)?;
        validate_intensity(value)?;
        let url = with_params(
            &format!("{}/control", self.field_url(greenhouse_id, field_index)),
            &[
                ("device", device.as_str().to_string()),
                ("value", value.to_string()),
            ],
        )?;
        self.http.post_json(&url, None).await?.error_for_status()?;
        Ok(())
    }
}

/// Successful login answer of the auth service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    #[serde(default)]
    pub message: String,
}

/// Auth service endpoints
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait AuthApi: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse>;

    /// Create an account; returns the service's confirmation message
    async fn register(&self, email: &str, password: &str) -> Result<String>;
}

#[derive(Serialize)]
struct Credentials<'a> {
    username: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct RegisterResponse {
    #[serde(default)]
    message: Option<String>,
}

/// HTTP implementation of [`AuthApi`]
pub struct HttpAuthApi {
    http: Arc<dyn HttpClient>,
    auth_url: String,
}

impl HttpAuthApi {
    pub fn new(http: Arc<dyn HttpClient>, config: &ClientConfig) -> Self {
        Self {
            http,
            auth_url: config.auth_url.clone(),
        }
    }

    async fn post_credentials(&self, path: &str, email: &str, password: &str) -> Result<HttpResponse> {
        validate_email(email)?;
        validate_password(password)?;
        let body = serde_json::to_string(&Credentials {
            username: email,
            email,
            password,
        })?;
        self.http
            .post_json(&format!("{}/{}", self.auth_url, path), Some(body))
            .await?
            .error_for_status()
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse> {
        let response = self.post_credentials("login", email, password).await?;
        let login: LoginResponse = serde_json::from_str(&response.body)?;
        if login.token.is_empty() {
            return Err(ClientError::Decode("Login response has an empty token".to_string()));
        }
        Ok(login)
    }

    async fn register(&self, email: &str, password: &str) -> Result<String> {
        let response = self.post_credentials("register", email, password).await?;
        let message = serde_json::from_str::<RegisterResponse>(&response.body)
            .ok()
            .and_then(|r| r.message)
            .unwrap_or_else(|| "Registered".to_string());
        Ok(message)
    }
}
