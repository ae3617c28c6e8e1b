//! Single-relay WebSocket round-trips.
//!
//! Each call opens its own connection, runs one exchange and closes it again;
//! nothing outlives the call.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ClientError, Result};
use crate::event::Event;
use crate::filter::Filter;

/// Connection parameters shared by every relay in a pool.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Optional SOCKS5 proxy (host:port).
    pub tor_socks: Option<String>,
    /// Deadline for one complete round-trip, connection included.
    pub timeout: Duration,
    /// Verify Schnorr signatures on received events.
    pub verify_sig: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            tor_socks: None,
            timeout: Duration::from_millis(4000),
            verify_sig: false,
        }
    }
}

/// Issue one `REQ` with all `filters` and collect events until `EOSE`.
///
/// Reaching the deadline after the connection is up returns whatever arrived
/// so far. Events whose id does not hash correctly are dropped.
pub async fn fetch(url: &str, filters: &[Filter], opts: &RelayOptions) -> Result<Vec<Event>> {
    let deadline = Instant::now() + opts.timeout;
    let mut ws = timeout_at(deadline, connect_ws(url, opts.tor_socks.as_deref()))
        .await
        .map_err(|_| ClientError::Transport(format!("{url}: connect timed out")))??;

    let sub_id = subscription_id();
    let mut req = vec![Value::String("REQ".into()), Value::String(sub_id.clone())];
    req.extend(filters.iter().map(|f| Value::Object(f.to_json())));
    ws.send(Message::Text(Value::Array(req).to_string()))
        .await
        .map_err(|e| ClientError::Transport(format!("{url}: {e}")))?;

    let mut events = Vec::new();
    loop {
        let msg = match timeout_at(deadline, ws.next()).await {
            Ok(Some(msg)) => msg.map_err(|e| ClientError::Transport(format!("{url}: {e}")))?,
            Ok(None) => break,
            Err(_) => {
                warn!(relay = url, received = events.len(), "relay did not finish before deadline");
                break;
            }
        };
        let txt = match msg {
            Message::Text(txt) => txt,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(val) = serde_json::from_str::<Value>(&txt) else {
            continue;
        };
        let Some(arr) = val.as_array() else {
            continue;
        };
        match arr.first().and_then(|v| v.as_str()) {
            Some("EVENT") if arr.len() >= 3 => {
                if arr[1].as_str() != Some(sub_id.as_str()) {
                    continue;
                }
                match accept_event(arr[2].clone(), opts.verify_sig) {
                    Ok(ev) => events.push(ev),
                    Err(e) => warn!(relay = url, "dropping event: {e}"),
                }
            }
            Some("EOSE") => {
                if arr.get(1).and_then(|v| v.as_str()) == Some(sub_id.as_str()) {
                    let close = serde_json::json!(["CLOSE", sub_id]);
                    let _ = ws.send(Message::Text(close.to_string())).await;
                    break;
                }
            }
            Some("CLOSED") => break,
            Some("NOTICE") => debug!(relay = url, "notice: {}", arr.get(1).unwrap_or(&serde_json::Value::Null)),
            _ => {}
        }
    }
    let _ = ws.close(None).await;
    Ok(events)
}

/// Send one signed event and wait for the relay's `OK`.
pub async fn publish(url: &str, event: &Event, opts: &RelayOptions) -> Result<()> {
    let deadline = Instant::now() + opts.timeout;
    let mut ws = timeout_at(deadline, connect_ws(url, opts.tor_socks.as_deref()))
        .await
        .map_err(|_| ClientError::Transport(format!("{url}: connect timed out")))??;
    let msg = serde_json::json!(["EVENT", event]);
    ws.send(Message::Text(msg.to_string()))
        .await
        .map_err(|e| ClientError::Transport(format!("{url}: {e}")))?;

    let outcome = loop {
        let msg = match timeout_at(deadline, ws.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => break Err(ClientError::Transport(format!("{url}: {e}"))),
            Ok(None) => break Err(ClientError::Transport(format!("{url}: connection closed"))),
            Err(_) => break Err(ClientError::Transport(format!("{url}: no OK before deadline"))),
        };
        let Message::Text(txt) = msg else {
            continue;
        };
        let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(&txt) else {
            continue;
        };
        if arr.first().and_then(|v| v.as_str()) != Some("OK") {
            continue;
        }
        if arr.get(1).and_then(|v| v.as_str()) != Some(event.id.as_str()) {
            continue;
        }
        if arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false) {
            break Ok(());
        }
        let reason = arr.get(3).and_then(|v| v.as_str()).unwrap_or_default();
        break Err(ClientError::Publish(format!("{url} rejected event: {reason}")));
    };
    let _ = ws.close(None).await;
    outcome
}

fn accept_event(raw: Value, verify_sig: bool) -> Result<Event> {
    let ev = Event::from_wire(raw)?;
    if verify_sig {
        ev.verify(true)?;
    }
    Ok(ev)
}

fn subscription_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(
    relay: &str,
    tor_socks: Option<&str>,
) -> Result<WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>> {
    let transport = |e: String| ClientError::Transport(format!("{relay}: {e}"));
    let url = Url::parse(relay).map_err(|e| transport(e.to_string()))?;
    let host = url.host_str().ok_or_else(|| transport("missing host".into()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| transport("missing port".into()))?;
    let req = relay
        .into_client_request()
        .map_err(|e| transport(e.to_string()))?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| transport(e.to_string()))?,
        )
    } else {
        Box::new(
            TcpStream::connect((host, port))
                .await
                .map_err(|e| transport(e.to_string()))?,
        )
    };
    let (ws, _) = client_async(req, stream)
        .await
        .map_err(|e| transport(e.to_string()))?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::event::{kind, UnsignedEvent};
    use crate::identity::Identity;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    /// Relay that answers every `REQ` with `events` then `EOSE`, and every
    /// `EVENT` with `OK true`. Serves `connections` connections then stops.
    pub(crate) async fn spawn_relay(events: Vec<Value>, connections: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for _ in 0..connections {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                while let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                    let val: Value = serde_json::from_str(&txt).unwrap();
                    let arr = val.as_array().unwrap();
                    match arr[0].as_str().unwrap() {
                        "REQ" => {
                            let sub = arr[1].as_str().unwrap().to_string();
                            for ev in &events {
                                let msg = serde_json::json!(["EVENT", sub, ev]);
                                ws.send(TMsg::Text(msg.to_string())).await.unwrap();
                            }
                            let eose = serde_json::json!(["EOSE", sub]);
                            ws.send(TMsg::Text(eose.to_string())).await.unwrap();
                        }
                        "EVENT" => {
                            let id = arr[1]["id"].as_str().unwrap().to_string();
                            let ok = serde_json::json!(["OK", id, true, ""]);
                            ws.send(TMsg::Text(ok.to_string())).await.unwrap();
                        }
                        _ => break,
                    }
                }
            }
        });
        format!("ws://{addr}")
    }

    fn signed(content: &str) -> Event {
        Identity::generate()
            .sign(UnsignedEvent::new(kind::CHANNEL_MESSAGE, content))
            .unwrap()
    }

    #[tokio::test]
    async fn fetch_collects_until_eose_and_drops_forged_ids() {
        let good = signed("hello");
        let mut forged = serde_json::to_value(signed("x")).unwrap();
        forged["content"] = Value::String("changed".into());
        let url = spawn_relay(vec![serde_json::to_value(&good).unwrap(), forged], 1).await;

        let events = fetch(&url, &[Filter::new().kinds([42])], &RelayOptions::default())
            .await
            .unwrap();
        assert_eq!(events, vec![good]);
    }

    #[tokio::test]
    async fn publish_waits_for_ok() {
        let url = spawn_relay(vec![], 1).await;
        publish(&url, &signed("hi"), &RelayOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unreachable_relay_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = fetch(&format!("ws://{addr}"), &[Filter::new()], &RelayOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
    }

    #[tokio::test]
    async fn silent_relay_returns_partial_results_at_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ev = signed("early");
        let sent = ev.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            if let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                let val: Value = serde_json::from_str(&txt).unwrap();
                let sub = val[1].as_str().unwrap().to_string();
                let msg = serde_json::json!(["EVENT", sub, sent]);
                ws.send(TMsg::Text(msg.to_string())).await.unwrap();
            }
            // never send EOSE
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let opts = RelayOptions {
            timeout: Duration::from_millis(300),
            ..RelayOptions::default()
        };
        let events = fetch(&format!("ws://{addr}"), &[Filter::new()], &opts)
            .await
            .unwrap();
        assert_eq!(events, vec![ev]);
    }
}
