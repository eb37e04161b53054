//! Signed REST client for the perpetual-futures exchange.
//!
//! One client per account. Requests that touch account state are signed with
//! HMAC-SHA256 over the canonical query string; the timestamp (and therefore
//! the signature) is regenerated on every attempt, including retries.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, error, info, warn};

use crate::constants::exchange::{ORDER_MAX_ATTEMPTS, REST_TIMEOUT};
use crate::error::ExchangeError;
use crate::exchange::types::{
    BalanceInfo, Kline, OrderAck, OrderSubmission, PlaceOrderRequest, SubmitFailure,
};

const MAINNET_REST: &str = "https://fapi.binance.com";
const MAINNET_WS: &str = "wss://fstream.binance.com";
const TESTNET_REST: &str = "https://testnet.binancefuture.com";
const TESTNET_WS: &str = "wss://stream.binancefuture.com";

/// The REST surface the data engine depends on. A trait so tests can inject
/// doubles instead of a live exchange.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn get_historical_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, ExchangeError>;

    async fn get_account_balance(&self, asset: &str) -> Result<BalanceInfo, ExchangeError>;

    async fn place_order(
        &self,
        request: &PlaceOrderRequest,
    ) -> Result<OrderSubmission, SubmitFailure>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, ExchangeError>;

    async fn create_listen_key(&self) -> Result<String, ExchangeError>;

    async fn keepalive_listen_key(&self, listen_key: &str) -> Result<(), ExchangeError>;

    async fn close_listen_key(&self, listen_key: &str) -> Result<(), ExchangeError>;

    /// Base URL of the matching WebSocket endpoint.
    fn ws_url(&self) -> &str;
}

#[derive(Clone)]
pub struct FuturesClient {
    user_id: String,
    client: Client,
    base_url: String,
    ws_url: String,
    api_key: String,
    api_secret: String,
}

impl FuturesClient {
    pub fn new(user_id: &str, api_key: &str, api_secret: &str, testnet: bool) -> Self {
        let (base_url, ws_url) = if testnet {
            (TESTNET_REST, TESTNET_WS)
        } else {
            (MAINNET_REST, MAINNET_WS)
        };
        info!(
            "[DE] FuturesClient created: user_id={} base_url={}",
            user_id, base_url
        );
        Self {
            user_id: user_id.to_string(),
            client: Client::builder()
                .timeout(REST_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            base_url: base_url.to_string(),
            ws_url: ws_url.to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build the query string, appending a fresh timestamp and, when signing,
    /// the signature over everything before it.
    fn build_query(&self, params: &BTreeMap<String, String>, sign: bool) -> String {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let mut query: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", timestamp));
        if sign {
            let signature = self.sign(&query);
            query.push_str(&format!("&signature={}", signature));
        }
        query
    }

    async fn read_response(resp: reqwest::Response) -> Result<Value, ExchangeError> {
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        if !(200..300).contains(&status) {
            return Err(ExchangeError::from_status(status, body));
        }
        Ok(serde_json::from_str(&body)?)
    }

    fn order_params(request: &PlaceOrderRequest) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), request.symbol.clone());
        params.insert("side".to_string(), request.side.as_str().to_string());
        params.insert("quantity".to_string(), format!("{}", request.quantity));
        match request.order_type {
            crate::exchange::types::OrderType::Market => {
                params.insert("type".to_string(), "MARKET".to_string());
            }
            crate::exchange::types::OrderType::Limit => {
                params.insert("type".to_string(), "LIMIT".to_string());
                params.insert("timeInForce".to_string(), "GTC".to_string());
            }
            // Post-only maps to a limit order that may only make liquidity
            crate::exchange::types::OrderType::PostOnly => {
                params.insert("type".to_string(), "LIMIT".to_string());
                params.insert("timeInForce".to_string(), "GTX".to_string());
            }
            other => {
                params.insert("type".to_string(), other.as_str().to_string());
            }
        }
        if let Some(price) = request.price {
            params.insert("price".to_string(), format!("{}", price));
        }
        if request.reduce_only {
            params.insert("reduceOnly".to_string(), "true".to_string());
        }
        if let Some(client_order_id) = &request.client_order_id {
            params.insert("newClientOrderId".to_string(), client_order_id.clone());
        }
        params
    }
}

#[async_trait]
impl ExchangeApi for FuturesClient {
    async fn get_historical_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("interval".to_string(), interval.to_string());
        params.insert("limit".to_string(), limit.to_string());
        let query = self.build_query(&params, false);
        let url = format!("{}/fapi/v1/klines?{}", self.base_url, query);

        debug!(
            "[DE] Fetching klines: user_id={} symbol={} interval={} limit={}",
            self.user_id, symbol, interval, limit
        );
        let resp = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        let data = Self::read_response(resp).await?;
        let klines = Kline::from_exchange_rows(&data)?;
        debug!(
            "[DE] Klines fetched: user_id={} symbol={} count={}",
            self.user_id,
            symbol,
            klines.len()
        );
        Ok(klines)
    }

    async fn get_account_balance(&self, asset: &str) -> Result<BalanceInfo, ExchangeError> {
        let query = self.build_query(&BTreeMap::new(), true);
        let url = format!("{}/fapi/v2/balance?{}", self.base_url, query);

        let resp = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        let data = Self::read_response(resp).await?;

        let entries = data.as_array().cloned().unwrap_or_default();
        for entry in &entries {
            if entry.get("asset").and_then(|v| v.as_str()) == Some(asset) {
                let num = |key: &str| {
                    entry
                        .get(key)
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse::<f64>().ok())
                        .unwrap_or(0.0)
                };
                return Ok(BalanceInfo {
                    asset: asset.to_string(),
                    balance: num("balance"),
                    available_balance: num("availableBalance"),
                });
            }
        }
        warn!(
            "[DE] Asset not found in balance response: user_id={} asset={}",
            self.user_id, asset
        );
        Ok(BalanceInfo {
            asset: asset.to_string(),
            balance: 0.0,
            available_balance: 0.0,
        })
    }

    async fn place_order(
        &self,
        request: &PlaceOrderRequest,
    ) -> Result<OrderSubmission, SubmitFailure> {
        let params = Self::order_params(request);
        submit_with_retries(&self.user_id, &request.symbol, |_attempt| {
            // Fresh timestamp and signature on every attempt.
            let query = self.build_query(&params, true);
            let url = format!("{}/fapi/v1/order?{}", self.base_url, query);
            async move {
                let resp = self
                    .client
                    .post(&url)
                    .header("X-MBX-APIKEY", &self.api_key)
                    .send()
                    .await?;
                let raw = Self::read_response(resp).await?;
                Ok(OrderAck::from_response(raw))
            }
        })
        .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, ExchangeError> {
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("orderId".to_string(), order_id.to_string());
        let query = self.build_query(&params, true);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, query);

        let resp = self
            .client
            .delete(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        let raw = Self::read_response(resp).await?;
        let ack = OrderAck::from_response(raw);
        info!(
            "[DE] Order cancelled: user_id={} order_id={} symbol={}",
            self.user_id, ack.order_id, symbol
        );
        Ok(ack)
    }

    async fn create_listen_key(&self) -> Result<String, ExchangeError> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        let data = Self::read_response(resp).await?;
        let key = data
            .get("listenKey")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExchangeError::WebSocket("listenKey missing in response".to_string()))?
            .to_string();
        info!("[DE] Listen key created: user_id={}", self.user_id);
        Ok(key)
    }

    async fn keepalive_listen_key(&self, listen_key: &str) -> Result<(), ExchangeError> {
        let url = format!(
            "{}/fapi/v1/listenKey?listenKey={}",
            self.base_url, listen_key
        );
        let resp = self
            .client
            .put(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::read_response(resp).await?;
        debug!("[DE] Listen key keepalive sent: user_id={}", self.user_id);
        Ok(())
    }

    async fn close_listen_key(&self, listen_key: &str) -> Result<(), ExchangeError> {
        let url = format!(
            "{}/fapi/v1/listenKey?listenKey={}",
            self.base_url, listen_key
        );
        let resp = self
            .client
            .delete(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::read_response(resp).await?;
        Ok(())
    }

    fn ws_url(&self) -> &str {
        &self.ws_url
    }
}

/// The submission retry loop, independent of the transport so it can be
/// driven by scripted attempts. `attempt` runs one submission; retryable
/// errors (5xx, transport) get up to `ORDER_MAX_ATTEMPTS` tries in total,
/// 4xx/auth errors fail on the spot. `retries` counts the extra attempts a
/// success needed; `attempts` counts everything a terminal failure burned.
pub(crate) async fn submit_with_retries<F, Fut>(
    user_id: &str,
    symbol: &str,
    mut attempt: F,
) -> Result<OrderSubmission, SubmitFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<OrderAck, ExchangeError>>,
{
    let mut last_error: Option<ExchangeError> = None;

    for n in 0..ORDER_MAX_ATTEMPTS {
        match attempt(n).await {
            Ok(ack) => {
                if n > 0 {
                    info!(
                        "[DE] Order accepted after {} retr{}: user_id={} order_id={} symbol={}",
                        n,
                        if n == 1 { "y" } else { "ies" },
                        user_id,
                        ack.order_id,
                        symbol
                    );
                } else {
                    info!(
                        "[DE] Order accepted: user_id={} order_id={} symbol={}",
                        user_id, ack.order_id, symbol
                    );
                }
                return Ok(OrderSubmission { ack, retries: n });
            }
            Err(e) if e.is_retryable() && n + 1 < ORDER_MAX_ATTEMPTS => {
                warn!(
                    "[DE] Order submit failed (attempt {}/{}), retrying: user_id={} symbol={} error={}",
                    n + 1,
                    ORDER_MAX_ATTEMPTS,
                    user_id,
                    symbol,
                    e
                );
                last_error = Some(e);
            }
            Err(e) if !e.is_retryable() => {
                error!(
                    "[DE] Order rejected (not retryable): user_id={} symbol={} error={}",
                    user_id, symbol, e
                );
                return Err(SubmitFailure {
                    error: e,
                    attempts: n + 1,
                });
            }
            Err(e) => {
                last_error = Some(e);
            }
        }
    }

    error!(
        "[DE] Order submit failed after {} attempts: user_id={} symbol={}",
        ORDER_MAX_ATTEMPTS, user_id, symbol
    );
    Err(SubmitFailure {
        error: last_error.unwrap_or(ExchangeError::Server {
            status: 0,
            body: "order submission failed".to_string(),
        }),
        attempts: ORDER_MAX_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    fn ack(order_id: u64) -> OrderAck {
        OrderAck::from_response(json!({
            "orderId": order_id,
            "symbol": "XRPUSDC",
            "status": "NEW",
            "side": "BUY",
            "type": "MARKET",
            "origQty": "100",
            "price": "0",
        }))
    }

    fn server_error(status: u16) -> ExchangeError {
        ExchangeError::Server {
            status,
            body: "upstream busy".to_string(),
        }
    }

    /// Drives the loop from a scripted attempt sequence and records how many
    /// attempts actually ran.
    async fn run_script(
        script: Vec<Result<OrderAck, ExchangeError>>,
    ) -> (Result<OrderSubmission, SubmitFailure>, u32) {
        let script = Mutex::new(VecDeque::from(script));
        let calls = Mutex::new(0u32);
        let result = submit_with_retries("u1", "XRPUSDC", |_attempt| {
            *calls.lock().unwrap() += 1;
            let next = script
                .lock()
                .unwrap()
                .pop_front()
                .expect("loop attempted more times than scripted");
            async move { next }
        })
        .await;
        let calls = *calls.lock().unwrap();
        (result, calls)
    }

    #[tokio::test]
    async fn two_server_errors_then_success_reports_two_retries() {
        let (result, calls) = run_script(vec![
            Err(server_error(503)),
            Err(server_error(502)),
            Ok(ack(7)),
        ])
        .await;

        let submission = result.expect("third attempt should succeed");
        assert_eq!(submission.retries, 2);
        assert_eq!(submission.ack.order_id, "7");
        // Exactly one submission result from exactly three attempts
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn three_server_errors_exhaust_the_attempt_budget() {
        let (result, calls) = run_script(vec![
            Err(server_error(503)),
            Err(server_error(503)),
            Err(server_error(500)),
        ])
        .await;

        let failure = result.expect_err("all attempts should fail");
        assert_eq!(failure.attempts, 3);
        assert!(matches!(failure.error, ExchangeError::Server { status: 500, .. }));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn client_error_fails_immediately_without_retry() {
        let (result, calls) = run_script(vec![
            Err(ExchangeError::Client {
                status: 400,
                body: "bad params".to_string(),
            }),
            Ok(ack(8)),
        ])
        .await;

        let failure = result.expect_err("4xx must not be retried");
        assert_eq!(failure.attempts, 1);
        assert_eq!(calls, 1, "no second attempt after a client error");
    }

    #[tokio::test]
    async fn first_try_success_needs_no_retries() {
        let (result, calls) = run_script(vec![Ok(ack(9))]).await;
        assert_eq!(result.unwrap().retries, 0);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn auth_failure_is_terminal_on_first_attempt() {
        let (result, calls) = run_script(vec![
            Err(ExchangeError::AuthFailed {
                reason: "bad signature".to_string(),
            }),
            Ok(ack(10)),
        ])
        .await;

        let failure = result.expect_err("auth errors must not be retried");
        assert_eq!(failure.attempts, 1);
        assert!(matches!(failure.error, ExchangeError::AuthFailed { .. }));
        assert_eq!(calls, 1);
    }
}
