//! Tracker side: link generation and the per-session update loop.
//!
//! All state of one tracked session (id, map, view, loop task) lives in a
//! [`TrackingSession`]. [`Tracker`] holds at most one; generating a new link
//! tears the previous one down before the next is created.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};
use url::Url;

use crate::clock::Clock;
use crate::config::{FeedMode, TrackerConfig};
use crate::error::Result;
use crate::feed::{PollFeed, PushFeed, ReportFeed};
use crate::map::{MapRenderer, MapView};
use crate::report::LocationReport;
use crate::session::{InvalidReason, Session, SessionId, SessionManager, SessionMeta};

/// Delay before reconnecting a dropped push subscription.
const PUSH_RETRY: Duration = Duration::from_secs(5);

/// Builds the map for a newly created session.
pub type MapFactory = Arc<dyn Fn(&SessionId) -> Box<dyn MapRenderer> + Send + Sync>;

pub struct TrackingSession {
    session: Session,
    link: Url,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TrackingSession {
    fn start(
        session: Session,
        link: Url,
        sessions: SessionManager,
        feed: Box<dyn ReportFeed>,
        map: Box<dyn MapRenderer>,
    ) -> Self {
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(update_loop(session.clone(), sessions, feed, map, stopped));
        Self {
            session,
            link,
            stop: Some(stop),
            task: Some(task),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn link(&self) -> &Url {
        &self.link
    }

    /// Stops the loop and waits for it to release the map.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(session_id = %self.session.id, error = %e, "Update loop ended abnormally");
            }
        }
        info!(session_id = %self.session.id, "Tracking session closed");
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Time left before `meta` expires by `now`, plus the strict-expiry millisecond.
fn until_expiry(meta: &SessionMeta, now: i64) -> Duration {
    Duration::from_millis((meta.expires - now + 1).max(0) as u64)
}

async fn update_loop(
    session: Session,
    sessions: SessionManager,
    mut feed: Box<dyn ReportFeed>,
    mut map: Box<dyn MapRenderer>,
    mut stopped: oneshot::Receiver<()>,
) {
    let session_id = session.id.clone();
    let mut view = MapView::default();
    let mut last: Option<LocationReport> = None;

    map.render(&view);
    map.set_status(&format!(
        "Session {} started. Waiting for data from the target device...",
        session_id
    ));

    let expiry = sleep(until_expiry(&session.meta, sessions.clock().now_ms()));
    tokio::pin!(expiry);

    loop {
        if session.meta.is_expired_at(sessions.clock().now_ms()) {
            // Removes both records.
            if let Err(e) = sessions.check_validity(&session_id).await {
                warn!(session_id = %session_id, error = %e, "Expiry cleanup failed");
            }
            info!(session_id = %session_id, "Session expired, tracking stopped");
            map.set_status(&format!(
                "{} Generate a new link to keep tracking.",
                InvalidReason::Expired.message()
            ));
            break;
        }

        tokio::select! {
            biased;
            _ = &mut stopped => break,
            _ = &mut expiry => {
                let now = sessions.clock().now_ms();
                expiry.as_mut().reset(Instant::now() + until_expiry(&session.meta, now));
            }
            next = feed.next() => match next {
                Ok(Some(report)) => {
                    if report.session_id != session_id {
                        warn!(session_id = %session_id, other = %report.session_id, "Ignoring report for another session");
                        continue;
                    }
                    if last.as_ref() == Some(&report) {
                        continue;
                    }
                    info!(
                        session_id = %session_id,
                        latitude = report.latitude,
                        longitude = report.longitude,
                        accuracy = report.accuracy,
                        "Location received"
                    );
                    view.focus(report.coordinates(), report.popup_text());
                    map.render(&view);
                    map.set_status(&report.status_line());
                    last = Some(report);
                }
                Ok(None) => {}
                Err(e) => warn!(session_id = %session_id, error = %e, "Failed to fetch location"),
            },
        }
    }

    map.release();
}

pub struct Tracker {
    sessions: SessionManager,
    config: TrackerConfig,
    maps: MapFactory,
    current: Option<TrackingSession>,
}

impl Tracker {
    pub fn new(sessions: SessionManager, config: TrackerConfig, maps: MapFactory) -> Self {
        Self {
            sessions,
            config,
            maps,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&TrackingSession> {
        self.current.as_ref()
    }

    /// Creates a session and starts tracking it, replacing any active one.
    pub async fn generate_link(&mut self) -> Result<Url> {
        self.shutdown().await;

        let session = self.sessions.create().await?;
        let link = session.link(&self.config.base_url)?;
        let feed = self.open_feed(&session.id)?;
        let map = (self.maps)(&session.id);

        info!(session_id = %session.id, link = %link, "Tracking link generated");
        self.current = Some(TrackingSession::start(
            session,
            link.clone(),
            self.sessions.clone(),
            feed,
            map,
        ));
        Ok(link)
    }

    /// Tears down the active session, if any.
    pub async fn shutdown(&mut self) {
        if let Some(previous) = self.current.take() {
            previous.shutdown().await;
        }
    }

    fn open_feed(&self, session_id: &SessionId) -> Result<Box<dyn ReportFeed>> {
        let feed: Box<dyn ReportFeed> = match &self.config.feed {
            FeedMode::Poll { interval } => Box::new(PollFeed::new(
                self.sessions.clone(),
                session_id.clone(),
                *interval,
            )),
            FeedMode::Push { store_url } => Box::new(PushFeed::new(
                store_url,
                session_id.clone(),
                PUSH_RETRY,
            )?),
        };
        Ok(feed)
    }
}
