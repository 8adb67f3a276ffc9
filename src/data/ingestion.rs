use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::model::{RawPricePoint, RawRecord};
use super::pacing::RequestPacer;
use super::retry::AttemptOutcome;
use crate::config::ClientConfig;
use crate::error::FetchError;

/// GET request envelope handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// The request never produced an HTTP status (connect, timeout, body read).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Seam between the client and the network.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, request: &HttpRequest) -> Result<TransportResponse, TransportError>;
}

/// Production transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: &HttpRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        Ok(TransportResponse { status, body })
    }
}

/// Replays queued responses in order and records every request.
///
/// Used for deterministic offline tests; an exhausted script answers with a
/// transport error.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, status: u16, body: impl Into<String>) -> &Self {
        self.lock_responses().push_back(Ok(TransportResponse {
            status,
            body: body.into(),
        }));
        self
    }

    pub fn push_error(&self, message: impl Into<String>) -> &Self {
        self.lock_responses()
            .push_back(Err(TransportError(message.into())));
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn lock_responses(
        &self,
    ) -> std::sync::MutexGuard<'_, VecDeque<Result<TransportResponse, TransportError>>> {
        self.responses.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(&self, request: &HttpRequest) -> Result<TransportResponse, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        self.lock_responses()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError("no scripted response left".to_string())))
    }
}

/// Fetches market data from the public API.
///
/// Every request goes through the retry loop: rate limiting (429), server
/// errors and transport failures are retried with backoff up to the
/// configured ceiling, other 4xx responses fail immediately. Historical
/// requests are additionally paced to stay under the per-minute budget.
///
/// # Key Features
/// * Top assets by market capitalisation in one request
/// * Historical price, market cap and volume series per asset
/// * Single asset detail lookup
pub struct MarketDataClient {
    config: ClientConfig,
    transport: Arc<dyn HttpTransport>,
    history_pacer: RequestPacer,
}

impl MarketDataClient {
    /// Creates a client that talks to the network through `reqwest`.
    pub fn new(config: ClientConfig) -> Self {
        let transport = Arc::new(ReqwestTransport::new(config.timeout, &config.user_agent));
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let history_pacer = RequestPacer::per_minute(config.history_requests_per_minute);
        Self {
            config,
            transport,
            history_pacer,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Fetches the top `limit` assets by market capitalisation.
    ///
    /// # Arguments
    /// * `limit`: Number of assets, between 1 and the configured page size
    /// * `currency`: Quote currency code, e.g. "usd"
    ///
    /// # Errors
    /// * [`FetchError::InvalidParameter`] before any network call when the
    ///   arguments are out of range
    /// * [`FetchError::MalformedResponse`] when the body is not a list of objects
    /// * Retry and client errors from the request loop
    pub async fn fetch_top_assets(
        &self,
        limit: u32,
        currency: &str,
    ) -> Result<Vec<RawRecord>, FetchError> {
        if limit == 0 || limit > self.config.max_page_size {
            return Err(FetchError::InvalidParameter(format!(
                "limit must be between 1 and {}, got {limit}",
                self.config.max_page_size
            )));
        }
        let currency = currency.trim().to_ascii_lowercase();
        if currency.is_empty() {
            return Err(FetchError::InvalidParameter(
                "currency must not be empty".to_string(),
            ));
        }

        let request = self
            .request("coins/markets")
            .with_query("vs_currency", &currency)
            .with_query("order", "market_cap_desc")
            .with_query("per_page", limit)
            .with_query("page", 1)
            .with_query("sparkline", false)
            .with_query("price_change_percentage", "24h");

        let body = self.execute(request).await?;
        let records = parse_market_list(&body)?;

        info!(count = records.len(), limit, currency = %currency, "fetched market data");
        Ok(records)
    }

    /// Fetches `days_back` days of history for one asset.
    ///
    /// Waits for the history pacer before issuing the request. Points are
    /// merged from the price, market cap and volume series and returned in
    /// chronological order.
    ///
    /// # Errors
    /// * [`FetchError::InvalidParameter`] for an empty id or zero days
    /// * [`FetchError::MalformedResponse`] when the series are missing or malformed
    pub async fn fetch_history(
        &self,
        asset_id: &str,
        days_back: u32,
    ) -> Result<Vec<RawPricePoint>, FetchError> {
        let asset_id = asset_id.trim();
        if asset_id.is_empty() {
            return Err(FetchError::InvalidParameter(
                "asset id must not be empty".to_string(),
            ));
        }
        if days_back == 0 {
            return Err(FetchError::InvalidParameter(
                "days_back must be at least 1".to_string(),
            ));
        }

        self.history_pacer.pace().await;

        let request = self
            .request(&format!("coins/{asset_id}/market_chart"))
            .with_query("vs_currency", &self.config.vs_currency)
            .with_query("days", days_back);

        let body = self.execute(request).await?;
        let points = parse_market_chart(&body)?;

        debug!(asset_id, days_back, points = points.len(), "fetched history");
        Ok(points)
    }

    /// Fetches the detail document of a single asset.
    ///
    /// # Errors
    /// Same as [`Self::fetch_top_assets`]; the body must be a JSON object.
    pub async fn fetch_asset(&self, asset_id: &str) -> Result<Value, FetchError> {
        let asset_id = asset_id.trim();
        if asset_id.is_empty() {
            return Err(FetchError::InvalidParameter(
                "asset id must not be empty".to_string(),
            ));
        }

        let request = self
            .request(&format!("coins/{asset_id}"))
            .with_query("localization", false)
            .with_query("tickers", false)
            .with_query("community_data", false)
            .with_query("developer_data", false);

        let body = self.execute(request).await?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| FetchError::MalformedResponse(e.to_string()))?;
        if !value.is_object() {
            return Err(FetchError::MalformedResponse(format!(
                "expected an object for {asset_id}"
            )));
        }
        Ok(value)
    }

    fn request(&self, path: &str) -> HttpRequest {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        let request = HttpRequest::get(url).with_header("accept", "application/json");
        match &self.config.api_key {
            Some(key) => request.with_header("x-cg-demo-api-key", key.clone()),
            None => request,
        }
    }

    /// Runs one request through the retry loop and returns the body of the
    /// first successful attempt.
    async fn execute(&self, request: HttpRequest) -> Result<String, FetchError> {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts();
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            let outcome = match self.transport.get(&request).await {
                Ok(response) => policy.classify(response.status, response.body),
                Err(err) => AttemptOutcome::Retryable(err.to_string()),
            };

            match outcome {
                AttemptOutcome::Success(body) => return Ok(body),
                AttemptOutcome::Fatal(err) => {
                    warn!(url = %request.url, error = %err, "request rejected");
                    return Err(err);
                }
                AttemptOutcome::Retryable(reason) => {
                    last_error = reason;
                    if attempt + 1 < max_attempts {
                        let delay = policy.delay_for_attempt(attempt);
                        warn!(
                            url = %request.url,
                            attempt = attempt + 1,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %last_error,
                            "request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(FetchError::TransientFetchFailure {
            attempts: max_attempts,
            last_error,
        })
    }
}

fn parse_market_list(body: &str) -> Result<Vec<RawRecord>, FetchError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| FetchError::MalformedResponse(e.to_string()))?;
    let Value::Array(items) = value else {
        return Err(FetchError::MalformedResponse(
            "expected a JSON array of market records".to_string(),
        ));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(record) => Ok(record),
            _ => Err(FetchError::MalformedResponse(format!(
                "element {index} is not an object"
            ))),
        })
        .collect()
}

fn parse_market_chart(body: &str) -> Result<Vec<RawPricePoint>, FetchError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| FetchError::MalformedResponse(e.to_string()))?;
    let prices = series(&value, "prices")?;
    let market_caps = series(&value, "market_caps")?;
    let volumes = series(&value, "total_volumes")?;

    let mut merged: BTreeMap<i64, RawPricePoint> = BTreeMap::new();
    for (timestamp_ms, price) in prices {
        point_at(&mut merged, timestamp_ms).price = price;
    }
    for (timestamp_ms, market_cap) in market_caps {
        point_at(&mut merged, timestamp_ms).market_cap = market_cap;
    }
    for (timestamp_ms, volume) in volumes {
        point_at(&mut merged, timestamp_ms).total_volume = volume;
    }

    Ok(merged.into_values().collect())
}

fn point_at(merged: &mut BTreeMap<i64, RawPricePoint>, timestamp_ms: i64) -> &mut RawPricePoint {
    merged.entry(timestamp_ms).or_insert(RawPricePoint {
        timestamp_ms,
        price: None,
        market_cap: None,
        total_volume: None,
    })
}

/// Reads one `[[timestamp_ms, value], ...]` series. A missing series is empty.
fn series(value: &Value, key: &str) -> Result<Vec<(i64, Option<f64>)>, FetchError> {
    let Some(raw) = value.get(key) else {
        return Ok(Vec::new());
    };
    let pairs = raw
        .as_array()
        .ok_or_else(|| FetchError::MalformedResponse(format!("{key} is not an array")))?;

    pairs
        .iter()
        .map(|pair| {
            let timestamp_ms = pair
                .get(0)
                .and_then(|ts| ts.as_i64().or_else(|| ts.as_f64().map(|f| f as i64)))
                .ok_or_else(|| {
                    FetchError::MalformedResponse(format!("{key} entry without a timestamp"))
                })?;
            Ok((timestamp_ms, pair.get(1).and_then(Value::as_f64)))
        })
        .collect()
}
