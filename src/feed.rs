//! Sources of location reports for the tracker: store polling or websocket push.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};
use crate::report::LocationReport;
use crate::session::{self, SessionId, SessionManager};

#[async_trait]
pub trait ReportFeed: Send {
    /// Waits for the next delivery. `Ok(None)` means no fix has arrived yet.
    async fn next(&mut self) -> Result<Option<LocationReport>>;
}

/// Reads the session's location record once per period. The first read
/// happens one full period after creation.
pub struct PollFeed {
    sessions: SessionManager,
    session_id: SessionId,
    ticker: Interval,
}

impl PollFeed {
    pub fn new(sessions: SessionManager, session_id: SessionId, period: Duration) -> Self {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            sessions,
            session_id,
            ticker,
        }
    }
}

#[async_trait]
impl ReportFeed for PollFeed {
    async fn next(&mut self) -> Result<Option<LocationReport>> {
        self.ticker.tick().await;
        self.sessions.read_report(&self.session_id).await
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Subscribes to `/kv/<location key>/watch` on the store service and yields
/// every value written there. Reconnects after `retry` on failure.
pub struct PushFeed {
    url: Url,
    session_id: SessionId,
    retry: Duration,
    stream: Option<WsStream>,
}

impl PushFeed {
    pub fn new(store_url: &str, session_id: SessionId, retry: Duration) -> Result<Self> {
        let url = watch_url(store_url, &session_id)?;
        Ok(Self {
            url,
            session_id,
            retry,
            stream: None,
        })
    }

    async fn fail(&mut self, reason: String) -> Error {
        self.stream = None;
        sleep(self.retry).await;
        Error::Feed(reason)
    }
}

/// `http(s)://host/...` → `ws(s)://host/kv/<key>/watch`.
pub fn watch_url(store_url: &str, session_id: &SessionId) -> Result<Url> {
    let mut url = Url::parse(store_url).map_err(|e| Error::Feed(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(Error::Feed(format!("unsupported store scheme {:?}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::Feed(format!("cannot switch {} to {}", store_url, scheme)))?;
    url.set_path(&format!("/kv/{}/watch", session_id.location_key()));
    url.set_query(None);
    Ok(url)
}

#[async_trait]
impl ReportFeed for PushFeed {
    async fn next(&mut self) -> Result<Option<LocationReport>> {
        if self.stream.is_none() {
            match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    info!(url = %self.url, "Subscribed to location updates");
                    self.stream = Some(stream);
                }
                Err(e) => return Err(self.fail(e.to_string()).await),
            }
        }

        let message = match self.stream.as_mut() {
            Some(stream) => stream.next().await,
            None => None,
        };

        match message {
            Some(Ok(Message::Text(text))) => Ok(session::parse_report(&self.session_id, &text)),
            Some(Ok(Message::Close(_))) | None => {
                Err(self.fail("watch stream closed".to_string()).await)
            }
            Some(Ok(other)) => {
                debug!(?other, "Ignoring non-text frame");
                Ok(None)
            }
            Some(Err(e)) => Err(self.fail(e.to_string()).await),
        }
    }
}
