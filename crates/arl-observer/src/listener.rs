use std::sync::Arc;
use std::time::Duration;

use arl_core::gateway::{decode_frame, ClientInfo, ConnectRequest, GatewayFrame};
use arl_tracker::ActivityTracker;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub url: Url,
    pub token: Option<String>,
}

enum SessionEnd {
    Shutdown,
    NeverConnected,
    Dropped,
}

pub async fn run(
    config: ListenerConfig,
    tracker: Arc<ActivityTracker>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *shutdown.borrow() {
            break;
        }
        match connect_once(&config, &tracker, &mut shutdown).await {
            SessionEnd::Shutdown => break,
            SessionEnd::Dropped => backoff = INITIAL_BACKOFF,
            SessionEnd::NeverConnected => {}
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
        backoff = next_backoff(backoff);
    }
    info!(event = "gateway_listener_stopped");
}

async fn connect_once(
    config: &ListenerConfig,
    tracker: &ActivityTracker,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let request = match build_ws_request(&config.url) {
        Ok(request) => request,
        Err(err) => {
            warn!(event = "gateway_request_invalid", url = %config.url, error = %err);
            return SessionEnd::NeverConnected;
        }
    };
    let (mut ws, _) = match connect_async(request).await {
        Ok(connected) => connected,
        Err(err) => {
            warn!(event = "gateway_connect_error", url = %config.url, error = %err);
            return SessionEnd::NeverConnected;
        }
    };

    let connect_id = Uuid::new_v4().to_string();
    let connect =
        ConnectRequest::connect(connect_id.clone(), observer_client(), config.token.clone());
    let payload = match serde_json::to_string(&connect) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(event = "gateway_handshake_encode_failed", error = %err);
            return SessionEnd::NeverConnected;
        }
    };
    if let Err(err) = ws.send(Message::Text(payload)).await {
        warn!(event = "gateway_handshake_send_failed", error = %err);
        return SessionEnd::NeverConnected;
    }

    let ack_deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
    let mut acked = false;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = ws.close(None).await;
                    return SessionEnd::Shutdown;
                }
            }
            _ = tokio::time::sleep_until(ack_deadline), if !acked => {
                warn!(event = "gateway_connect_timeout", url = %config.url);
                let _ = ws.close(None).await;
                return SessionEnd::NeverConnected;
            }
            next = ws.next() => {
                let message = match next {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        warn!(event = "gateway_socket_error", error = %err);
                        break;
                    }
                    None => break,
                };
                match message {
                    Message::Text(raw) => match decode_frame(&raw) {
                        Some(GatewayFrame::Res(res)) if res.id == connect_id => {
                            if res.ok == Some(false) {
                                warn!(event = "gateway_connect_rejected", error = ?res.error);
                                let _ = ws.close(None).await;
                                return SessionEnd::NeverConnected;
                            }
                            acked = true;
                            info!(event = "gateway_connected", url = %config.url);
                        }
                        Some(GatewayFrame::Event(frame)) => {
                            tracker.process_event(&frame, Utc::now());
                        }
                        _ => {}
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    if acked {
        warn!(event = "gateway_disconnected", url = %config.url);
        SessionEnd::Dropped
    } else {
        SessionEnd::NeverConnected
    }
}

fn build_ws_request(url: &Url) -> Result<Request, tungstenite::Error> {
    let mut request = url.as_str().into_client_request()?;
    let origin = resolve_origin(url);
    let value = http::HeaderValue::from_str(&origin).map_err(http::Error::from)?;
    request.headers_mut().insert(http::header::ORIGIN, value);
    Ok(request)
}

// The gateway's origin check expects localhost for loopback and wildcard hosts.
fn resolve_origin(url: &Url) -> String {
    let scheme = if url.scheme() == "wss" { "https" } else { "http" };
    let host = match url.host_str() {
        Some("127.0.0.1") | Some("::1") | Some("[::1]") | Some("0.0.0.0") => "localhost",
        Some(host) => host,
        None => "localhost",
    };
    match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    }
}

fn observer_client() -> ClientInfo {
    ClientInfo {
        id: "arl-observer".to_string(),
        version: "1.0".to_string(),
        platform: "rust".to_string(),
        mode: "observer".to_string(),
    }
}

fn next_backoff(current: Duration) -> Duration {
    let next = current + current / 2;
    if next > MAX_BACKOFF {
        MAX_BACKOFF
    } else {
        next
    }
}
