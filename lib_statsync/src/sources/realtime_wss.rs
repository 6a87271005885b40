//! # Realtime WSS Feed
//!
//! Row-level change notifications over the backend's Phoenix-channel
//! websocket. One `open` equals one socket joined to one channel; the socket
//! is left (and closed) when the cancellation token fires or the receiver is
//! dropped. There is no reconnect: a lost socket simply ends the stream.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::collaborator::ChangeFeed;
use crate::core::error::SyncError;
use crate::core::model::RawChangeEvent;
use crate::sources::postgrest::ColumnMap;

/// Configuration for the realtime websocket.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Project base URL (`https://<ref>.supabase.co`).
    pub base_url: String,
    /// Anonymous API key.
    pub api_key: String,
    /// Watched schema.
    pub schema: String,
    /// Watched table.
    pub table: String,
    /// Remote column names.
    pub columns: ColumnMap,
    /// Interval between `phoenix` heartbeats; clamped to `MIN_HEARTBEAT`.
    pub heartbeat_interval: Duration,
    /// Buffered events per open channel.
    pub channel_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            schema: "public".to_string(),
            table: "demo_stats".to_string(),
            columns: ColumnMap::default(),
            heartbeat_interval: Duration::from_secs(25),
            channel_capacity: 256,
        }
    }
}

impl RealtimeConfig {
    /// Shortest heartbeat interval ever used.
    pub const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

    /// The heartbeat interval actually used.
    pub fn effective_heartbeat(&self) -> Duration {
        self.heartbeat_interval.max(Self::MIN_HEARTBEAT)
    }

    /// The websocket endpoint derived from `base_url`.
    pub fn websocket_url(&self) -> Result<Url, SyncError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| SyncError::Config(format!("invalid realtime url '{}': {}", self.base_url, e)))?;

        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => return Err(SyncError::Config(format!("unsupported realtime scheme '{}'", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::Config(format!("cannot switch '{}' to {}", self.base_url, scheme)))?;
        url.set_path("/realtime/v1/websocket");
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    fn join_message(&self, topic: &str) -> Value {
        json!({
            "topic": channel_topic(topic),
            "event": "phx_join",
            "payload": {
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [
                        { "event": "*", "schema": self.schema, "table": self.table }
                    ]
                },
                "access_token": self.api_key
            },
            "ref": "1",
            "join_ref": "1"
        })
    }
}

fn channel_topic(topic: &str) -> String {
    format!("realtime:{}", topic)
}

/// Converts one `postgres_changes` payload into a raw event.
///
/// Returns `None` for frames that are not row changes.
pub fn translate(payload: &Value, columns: &ColumnMap) -> Option<RawChangeEvent> {
    let data = payload.get("data")?;
    let event_type = data.get("type")?.as_str()?.to_lowercase();

    let image = |key: &str| -> Option<Map<String, Value>> {
        data.get(key)
            .and_then(Value::as_object)
            .filter(|record| !record.is_empty())
            .map(|record| columns.to_canonical(record))
    };

    Some(RawChangeEvent {
        event_type,
        new: image("record"),
        old: image("old_record"),
    })
}

/// # Realtime Feed
///
/// `ChangeFeed` over the hosted realtime service.
pub struct RealtimeFeed {
    config: RealtimeConfig,
}

impl RealtimeFeed {
    /// Creates a feed; nothing connects until `open`.
    pub fn new(config: RealtimeConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }
}

impl ChangeFeed for RealtimeFeed {
    async fn open(&self, topic: &str, token: CancellationToken) -> Result<mpsc::Receiver<RawChangeEvent>, SyncError> {
        let url = self.config.websocket_url()?;
        log::info!("Connecting realtime feed '{}' to {}://{}", topic, url.scheme(), url.host_str().unwrap_or_default());

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::Feed(format!("connect failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        let join = self.config.join_message(topic).to_string();
        write
            .send(Message::Text(join.into()))
            .await
            .map_err(|e| SyncError::Feed(format!("join failed: {}", e)))?;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let columns = self.config.columns.clone();
        let heartbeat_every = self.config.effective_heartbeat();
        let channel = channel_topic(topic);

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_every);
            heartbeat.tick().await;
            let mut next_ref: u64 = 2;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        log::info!("Realtime feed '{}' cancelled, leaving channel.", channel);
                        break;
                    }
                    _ = tx.closed() => {
                        log::info!("Realtime feed '{}' receiver dropped, leaving channel.", channel);
                        break;
                    }
                    _ = heartbeat.tick() => {
                        let beat = json!({"topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": next_ref.to_string()});
                        next_ref += 1;
                        if let Err(e) = write.send(Message::Text(beat.to_string().into())).await {
                            log::error!("Realtime heartbeat failed: {}", e);
                            return;
                        }
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                                    log::warn!("Unparseable realtime frame: {}", text);
                                    continue;
                                };
                                match frame.get("event").and_then(Value::as_str) {
                                    Some("postgres_changes") => {
                                        let Some(event) = frame.get("payload").and_then(|p| translate(p, &columns)) else {
                                            log::debug!("Ignoring non-row postgres_changes frame.");
                                            continue;
                                        };
                                        log::trace!("Realtime event on '{}': {:?}", channel, event);
                                        if tx.send(event).await.is_err() {
                                            break;
                                        }
                                    }
                                    Some("phx_reply") => {
                                        let status = frame.pointer("/payload/status").and_then(Value::as_str).unwrap_or("unknown");
                                        if status == "ok" {
                                            log::debug!("Realtime reply ok on '{}'.", channel);
                                        } else {
                                            log::warn!("Realtime reply '{}' on '{}': {}", status, channel, frame["payload"]);
                                        }
                                    }
                                    Some("phx_error") | Some("phx_close") => {
                                        log::warn!("Realtime channel '{}' closed by server.", channel);
                                        return;
                                    }
                                    _ => log::trace!("Realtime frame: {}", text),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::warn!("Realtime socket for '{}' closed by remote host.", channel);
                                return;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                log::error!("Realtime read error on '{}': {}", channel, e);
                                return;
                            }
                        }
                    }
                }
            }

            let leave = json!({"topic": channel, "event": "phx_leave", "payload": {}, "ref": next_ref.to_string()});
            let _ = write.send(Message::Text(leave.to_string().into())).await;
            let _ = write.close().await;
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{FIELD_ENTITY_ID, FIELD_METRIC_VALUE};
    use crate::core::normalizer::normalize;
    use crate::core::model::ChangeDelta;

    fn config(base_url: &str) -> RealtimeConfig {
        RealtimeConfig {
            base_url: base_url.to_string(),
            api_key: "anon-key".to_string(),
            ..RealtimeConfig::default()
        }
    }

    #[test]
    fn test_websocket_url_from_https_project() {
        let url = config("https://abc.supabase.co").websocket_url().unwrap();
        assert_eq!(url.as_str(), "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0");
    }

    #[test]
    fn test_websocket_url_from_local_http() {
        let url = config("http://127.0.0.1:54321/").websocket_url().unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(54321));
    }

    #[test]
    fn test_websocket_url_rejects_other_schemes() {
        assert!(matches!(config("ftp://abc").websocket_url(), Err(SyncError::Config(_))));
        assert!(matches!(config("").websocket_url(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_heartbeat_is_clamped() {
        let zero = RealtimeConfig {
            heartbeat_interval: Duration::ZERO,
            ..config("https://abc.supabase.co")
        };
        assert_eq!(zero.effective_heartbeat(), RealtimeConfig::MIN_HEARTBEAT);
        assert_eq!(config("https://abc.supabase.co").effective_heartbeat(), Duration::from_secs(25));
    }

    #[test]
    fn test_join_message_watches_table() {
        let join = config("https://abc.supabase.co").join_message("demo-stats");
        assert_eq!(join["topic"], "realtime:demo-stats");
        assert_eq!(join["event"], "phx_join");
        assert_eq!(join["payload"]["config"]["postgres_changes"][0]["table"], "demo_stats");
        assert_eq!(join["payload"]["config"]["postgres_changes"][0]["event"], "*");
    }

    #[test]
    fn test_translate_update() {
        let payload = json!({
            "data": {
                "type": "UPDATE",
                "schema": "public",
                "table": "demo_stats",
                "record": {"id": 1, "demo_id": "analytics", "metric_name": "queries", "metric_value": "2M/day"},
                "old_record": {"id": 1}
            },
            "ids": [1]
        });
        let event = translate(&payload, &ColumnMap::default()).unwrap();
        assert_eq!(event.event_type, "update");
        assert_eq!(event.new.as_ref().unwrap()[FIELD_ENTITY_ID], "analytics");
        assert_eq!(event.new.as_ref().unwrap()[FIELD_METRIC_VALUE], "2M/day");
        assert_eq!(normalize(&event), ChangeDelta::upsert("analytics", "queries", "2M/day"));
    }

    #[test]
    fn test_translate_key_only_delete_becomes_resync() {
        let payload = json!({"data": {"type": "DELETE", "record": {}, "old_record": {"id": 1}}});
        let event = translate(&payload, &ColumnMap::default()).unwrap();
        assert!(event.new.is_none());
        assert_eq!(normalize(&event), ChangeDelta::Resync);
    }

    #[test]
    fn test_translate_ignores_non_row_payloads() {
        assert!(translate(&json!({"status": "ok"}), &ColumnMap::default()).is_none());
    }
}
