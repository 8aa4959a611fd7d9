//! HTTP API codec binding
//!
//! Each read issues the configured request and extracts the point from the
//! JSON body by the dotted path in its address (`data.items.0.power`).
//! Writes POST `{ "address", "value" }` to the same endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgelink_model::{ApiAuth, HttpMethod, InterfaceConfig, Protocol};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tracing::debug;

use super::registry::{DriverFactory, DriverRegistry};
use super::{Driver, LinkSettings, ProtocolDriver, RawValue, ReadRequest, TransportStrategy, WriteRequest};
use crate::error::{CollectError, ErrorExt, Result};

fn map_http_error(err: reqwest::Error) -> CollectError {
    if err.is_connect() || err.is_timeout() {
        CollectError::connection(err.to_string())
    } else {
        CollectError::protocol(err.to_string())
    }
}

/// Walk a dotted path; numeric segments index arrays
pub fn extract_path<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(body, |node, segment| match node {
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            Value::Object(map) => map.get(segment),
            _ => None,
        })
}

fn to_raw(value: &Value, path: &str) -> Result<RawValue> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(RawValue::Scalar)
            .ok_or_else(|| CollectError::protocol(format!("Value at '{}' is not a finite number", path))),
        Value::Bool(b) => Ok(RawValue::Scalar(if *b { 1.0 } else { 0.0 })),
        Value::String(s) => Ok(RawValue::Text(s.clone())),
        other => Err(CollectError::protocol(format!(
            "Value at '{}' is not a scalar: {}",
            path, other
        ))),
    }
}

struct Endpoint {
    url: String,
    method: HttpMethod,
    auth: Option<ApiAuth>,
}

impl Endpoint {
    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some(ApiAuth::Bearer { token }) => builder.bearer_auth(token),
            Some(ApiAuth::Basic { username, password }) => builder.basic_auth(username, Some(password)),
            None => builder,
        }
    }
}

#[derive(Default)]
pub struct HttpApiTransport {
    client: Option<Client>,
    endpoint: Option<Endpoint>,
}

impl HttpApiTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn ready(&self) -> Result<(&Client, &Endpoint)> {
        match (&self.client, &self.endpoint) {
            (Some(client), Some(endpoint)) => Ok((client, endpoint)),
            _ => Err(CollectError::NullTransport("http api".to_string())),
        }
    }
}

#[async_trait]
impl TransportStrategy for HttpApiTransport {
    async fn open(&mut self, protocol: &Protocol) -> Result<()> {
        let InterfaceConfig::Api { url, method, auth } = &protocol.interface else {
            return Err(CollectError::config(format!(
                "HttpApi needs an Api interface, got {}",
                protocol.interface.kind()
            )));
        };
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(protocol.connect_timeout_ms))
            .timeout(Duration::from_millis(protocol.receive_timeout_ms))
            .build()
            .config_error("HTTP client")?;

        self.endpoint = Some(Endpoint {
            url: url.clone(),
            method: method.parse()?,
            auth: auth.clone(),
        });
        self.client = Some(client);
        debug!("Proto{} HTTP endpoint {}", protocol.id, url);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        self.endpoint = None;
        Ok(())
    }

    fn configure(&mut self, _settings: LinkSettings) {}

    async fn read(&mut self, request: ReadRequest<'_>) -> Result<RawValue> {
        let (client, endpoint) = self.ready()?;
        let builder = match endpoint.method {
            HttpMethod::Get => client.get(&endpoint.url),
            HttpMethod::Post => client
                .post(&endpoint.url)
                .json(&json!({ "equipment_id": request.equipment_id })),
        };
        let response = endpoint
            .authorize(builder)
            .send()
            .await
            .map_err(map_http_error)?
            .error_for_status()
            .map_err(map_http_error)?;
        let body: Value = response.json().await.map_err(map_http_error)?;

        let value = extract_path(&body, request.address).ok_or_else(|| {
            CollectError::protocol(format!("Path '{}' not found in response", request.address))
        })?;
        to_raw(value, request.address)
    }

    async fn write(&mut self, request: WriteRequest<'_>) -> Result<()> {
        let (client, endpoint) = self.ready()?;
        let payload = json!({
            "address": request.address,
            "value": request.value.to_json(),
        });
        endpoint
            .authorize(client.post(&endpoint.url).json(&payload))
            .send()
            .await
            .map_err(map_http_error)?
            .error_for_status()
            .map_err(map_http_error)?;
        Ok(())
    }
}

struct HttpApiFactory;

impl DriverFactory for HttpApiFactory {
    fn protocol_types(&self) -> &'static [&'static str] {
        &["HttpApi", "Api", "http"]
    }

    fn create(&self, protocol: Arc<Protocol>) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(ProtocolDriver::new(
            protocol,
            Arc::new(|_: &Protocol| Ok(HttpApiTransport::new())),
        )))
    }
}

pub fn register(registry: &DriverRegistry) {
    registry.register(Arc::new(HttpApiFactory));
}
