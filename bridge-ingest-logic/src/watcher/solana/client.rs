use std::{collections::HashMap, time::Duration};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt, stream::BoxStream};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogsNotification {
    /// Program whose subscription produced the notification.
    pub program_id: String,
    pub signature: String,
    pub slot: u64,
    pub logs: Vec<String>,
    /// The transaction failed; its logs describe reverted state.
    pub failed: bool,
}

pub type LogsStream = BoxStream<'static, anyhow::Result<LogsNotification>>;

#[async_trait]
pub trait SolanaClient: Send + Sync {
    async fn get_slot(&self) -> anyhow::Result<u64>;

    /// Opens a log subscription mentioning each of `program_ids`. The stream
    /// ends with an error when the connection is lost.
    async fn subscribe_logs(&self, program_ids: &[String]) -> anyhow::Result<LogsStream>;
}

/// JSON-RPC over HTTP for `getSlot`, websocket `logsSubscribe` for logs.
pub struct RpcSolanaClient {
    http: reqwest::Client,
    rpc_url: Url,
    ws_url: Url,
    commitment: String,
}

impl RpcSolanaClient {
    pub fn new(rpc_url: Url, ws_url: Url, commitment: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            rpc_url,
            ws_url,
            commitment: commitment.into(),
        })
    }
}

#[async_trait]
impl SolanaClient for RpcSolanaClient {
    async fn get_slot(&self) -> anyhow::Result<u64> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getSlot",
            "params": [{"commitment": self.commitment}],
        });
        let response: Value = self
            .http
            .post(self.rpc_url.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(error) = response.get("error") {
            return Err(anyhow!("getSlot failed: {error}"));
        }
        response
            .get("result")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("getSlot returned no slot: {response}"))
    }

    async fn subscribe_logs(&self, program_ids: &[String]) -> anyhow::Result<LogsStream> {
        let (mut ws, _response) = connect_async(self.ws_url.as_str())
            .await
            .with_context(|| format!("failed connecting to {}", self.ws_url))?;

        let mut requests = HashMap::new();
        for (i, program_id) in program_ids.iter().enumerate() {
            let id = i as u64 + 1;
            let request = json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": "logsSubscribe",
                "params": [
                    {"mentions": [program_id]},
                    {"commitment": self.commitment},
                ],
            });
            ws.send(Message::Text(request.to_string()))
                .await
                .with_context(|| format!("failed sending logsSubscribe for {program_id}"))?;
            requests.insert(id, program_id.clone());
        }
        tracing::info!(ws_url = %self.ws_url, programs = program_ids.len(), "log subscriptions sent");

        let stream = async_stream::stream! {
            let mut subscriptions = HashMap::new();
            loop {
                match read_notification(&mut ws, &requests, &mut subscriptions).await {
                    Ok(Some(notification)) => yield Ok(notification),
                    Ok(None) => {}
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

async fn read_notification(
    ws: &mut WsStream,
    requests: &HashMap<u64, String>,
    subscriptions: &mut HashMap<u64, String>,
) -> anyhow::Result<Option<LogsNotification>> {
    let message = match tokio::time::timeout(IDLE_TIMEOUT, ws.next()).await {
        Err(_) => return Err(anyhow!("websocket idle for {IDLE_TIMEOUT:?}")),
        Ok(None) => return Err(anyhow!("websocket stream ended")),
        Ok(Some(message)) => message?,
    };
    match message {
        Message::Text(text) => parse_message(&serde_json::from_str(&text)?, requests, subscriptions),
        Message::Ping(payload) => {
            ws.send(Message::Pong(payload)).await?;
            Ok(None)
        }
        Message::Close(frame) => Err(anyhow!("websocket closed: {frame:?}")),
        _ => Ok(None),
    }
}

/// Handles subscription acks and turns `logsNotification` messages into
/// [`LogsNotification`]s.
fn parse_message(
    value: &Value,
    requests: &HashMap<u64, String>,
    subscriptions: &mut HashMap<u64, String>,
) -> anyhow::Result<Option<LogsNotification>> {
    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        if let Some(error) = value.get("error") {
            return Err(anyhow!("logsSubscribe {id} rejected: {error}"));
        }
        if let (Some(subscription), Some(program_id)) =
            (value.get("result").and_then(Value::as_u64), requests.get(&id))
        {
            tracing::debug!(subscription, program_id, "logsSubscribe acknowledged");
            subscriptions.insert(subscription, program_id.clone());
        }
        return Ok(None);
    }

    if value.get("method").and_then(Value::as_str) != Some("logsNotification") {
        return Ok(None);
    }
    let params = &value["params"];
    let result = &params["result"];
    let event = &result["value"];
    let Some(signature) = event["signature"].as_str() else {
        return Ok(None);
    };
    let program_id = params["subscription"]
        .as_u64()
        .and_then(|s| subscriptions.get(&s))
        .cloned()
        .unwrap_or_default();

    Ok(Some(LogsNotification {
        program_id,
        signature: signature.to_string(),
        slot: result["context"]["slot"].as_u64().unwrap_or_default(),
        logs: event["logs"]
            .as_array()
            .map(|logs| {
                logs.iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        failed: !event["err"].is_null(),
    }))
}
