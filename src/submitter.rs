//! Submitter side: consent, continuous location watch, and one report write per fix.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::geocode::Geocoder;
use crate::position::{self, LocationError, PositionSource, WatchOptions};
use crate::report::{Fix, LocationReport};
use crate::session::{InvalidReason, SessionId, SessionManager, WriteOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitterState {
    AwaitingUserConsent,
    AwaitingBrowserPermission,
    Tracking,
    /// Last write failed; the watch keeps running and the next fix retries.
    ReportingFailure(String),
    PermissionDenied,
    PositionUnavailable,
    TimedOut,
    /// The session expired or vanished while sharing; nothing more can be written.
    LinkInvalid(InvalidReason),
    /// Consent withheld or the page went away.
    Stopped,
}

impl SubmitterState {
    fn from_location_error(e: LocationError) -> Self {
        match e {
            LocationError::PermissionDenied => SubmitterState::PermissionDenied,
            LocationError::PositionUnavailable => SubmitterState::PositionUnavailable,
            LocationError::Timeout => SubmitterState::TimedOut,
        }
    }
}

/// What the user sees: the current state, a one-line message and an optional detail block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitterStatus {
    pub state: SubmitterState,
    pub message: String,
    pub detail: Option<String>,
}

impl SubmitterStatus {
    fn new(state: SubmitterState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Counters for one run of the flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitterSummary {
    pub final_state: SubmitterState,
    pub fixes: usize,
    pub written: usize,
    /// Fixes dropped because the store already held a later one.
    pub stale: usize,
    pub failed_writes: usize,
}

pub struct Submitter {
    session_id: SessionId,
    sessions: SessionManager,
    geocoder: Arc<dyn Geocoder>,
    options: WatchOptions,
    status: watch::Sender<SubmitterStatus>,
}

impl Submitter {
    pub fn new(
        session_id: SessionId,
        sessions: SessionManager,
        geocoder: Arc<dyn Geocoder>,
        options: WatchOptions,
    ) -> Self {
        let (status, _) = watch::channel(SubmitterStatus::new(
            SubmitterState::AwaitingUserConsent,
            "Confirm to start sharing your location.",
        ));
        Self {
            session_id,
            sessions,
            geocoder,
            options,
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SubmitterStatus> {
        self.status.subscribe()
    }

    fn set(&self, status: SubmitterStatus) {
        self.status.send_replace(status);
    }

    fn state(&self) -> SubmitterState {
        self.status.borrow().state.clone()
    }

    /// Runs the flow. Nothing touches the location source before `consent`
    /// resolves to `true`; `shutdown` resolving cancels the watch.
    pub async fn run<S, C, D>(self, source: S, consent: C, shutdown: D) -> SubmitterSummary
    where
        S: PositionSource,
        C: Future<Output = bool>,
        D: Future<Output = ()>,
    {
        let mut summary = SubmitterSummary {
            final_state: SubmitterState::AwaitingUserConsent,
            fixes: 0,
            written: 0,
            stale: 0,
            failed_writes: 0,
        };

        tokio::pin!(shutdown);

        let consented = tokio::select! {
            granted = consent => granted,
            _ = &mut shutdown => false,
        };
        if !consented {
            info!(session_id = %self.session_id, "Consent not given");
            self.set(SubmitterStatus::new(SubmitterState::Stopped, "Location sharing not started."));
            summary.final_state = SubmitterState::Stopped;
            return summary;
        }

        self.set(SubmitterStatus::new(
            SubmitterState::AwaitingBrowserPermission,
            "Waiting for your response to the location permission request...",
        ));
        let mut watch = position::watch(source, self.options);

        loop {
            let update = tokio::select! {
                update = watch.next() => update,
                _ = &mut shutdown => {
                    self.stop();
                    break;
                }
            };

            match update {
                Some(Ok(fix)) => {
                    summary.fixes += 1;
                    if self.state() != SubmitterState::Tracking {
                        self.set(SubmitterStatus::new(
                            SubmitterState::Tracking,
                            "Sharing location in real time.",
                        ));
                    }
                    let outcome = tokio::select! {
                        outcome = self.submit(fix) => outcome,
                        _ = &mut shutdown => {
                            self.stop();
                            break;
                        }
                    };
                    match outcome {
                        Ok(WriteOutcome::Written) => summary.written += 1,
                        Ok(WriteOutcome::Stale) => summary.stale += 1,
                        Err(e) => {
                            summary.failed_writes += 1;
                            if InvalidReason::of(&e).is_some() {
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(session_id = %self.session_id, error = %e, "Location error");
                    self.set(
                        SubmitterStatus::new(
                            SubmitterState::from_location_error(e),
                            "Error getting location.",
                        )
                        .with_detail(format!("ERROR: {}", e.user_message())),
                    );
                    if e == LocationError::PermissionDenied {
                        // Without permission no later attempt can succeed.
                        break;
                    }
                }
                None => {
                    info!(session_id = %self.session_id, "Location source finished");
                    break;
                }
            }
        }

        watch.cancel();
        summary.final_state = self.state();
        summary
    }

    fn stop(&self) {
        info!(session_id = %self.session_id, "Shutting down location watch");
        self.set(SubmitterStatus::new(SubmitterState::Stopped, "Location sharing stopped."));
    }

    /// Geocodes (best effort) and writes one report for `fix`.
    async fn submit(&self, fix: Fix) -> Result<WriteOutcome, Error> {
        self.set(SubmitterStatus::new(SubmitterState::Tracking, "Resolving address..."));
        let address = self.geocoder.reverse(fix.latitude, fix.longitude).await;
        let report = LocationReport::new(self.session_id.clone(), fix, address);

        self.set(SubmitterStatus::new(SubmitterState::Tracking, "Sending location data..."));
        match self.sessions.write_report(&report).await {
            Ok(WriteOutcome::Written) => {
                info!(
                    session_id = %self.session_id,
                    latitude = fix.latitude,
                    longitude = fix.longitude,
                    "Location submitted"
                );
                self.set(
                    SubmitterStatus::new(SubmitterState::Tracking, "Sharing location in real time.")
                        .with_detail(report.submitted_summary()),
                );
                Ok(WriteOutcome::Written)
            }
            Ok(WriteOutcome::Stale) => {
                debug!(session_id = %self.session_id, timestamp = fix.timestamp, "Fix older than stored report");
                self.set(SubmitterStatus::new(
                    SubmitterState::Tracking,
                    "A newer location was already shared; this one was skipped.",
                ));
                Ok(WriteOutcome::Stale)
            }
            Err(e) => {
                match InvalidReason::of(&e) {
                    Some(reason) => {
                        warn!(session_id = %self.session_id, reason = reason.as_str(), "Session no longer valid");
                        self.set(
                            SubmitterStatus::new(
                                SubmitterState::LinkInvalid(reason),
                                "Link expired or invalid",
                            )
                            .with_detail(reason.message()),
                        );
                    }
                    None => {
                        error!(session_id = %self.session_id, error = %e, "Failed to submit location");
                        self.set(
                            SubmitterStatus::new(
                                SubmitterState::ReportingFailure(e.to_string()),
                                "Failed to send location.",
                            )
                            .with_detail(e.to_string()),
                        );
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::SESSION_TTL_MS;
    use crate::geocode::NoGeocoder;
    use crate::position::{FixedSource, ReplaySource};
    use crate::report::AddressDetails;
    use crate::session::Validity;
    use crate::store::{KvStore, MemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_000;

    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn get(&self, key: &str) -> crate::Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> crate::Result<()> {
            if key.starts_with("location_") {
                let left = self.failures_left.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                    return Err(Error::StoreWriteFailed("simulated outage".to_string()));
                }
            }
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> crate::Result<()> {
            self.inner.delete(key).await
        }
    }

    /// Location writes never complete.
    struct HungStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl KvStore for HungStore {
        async fn get(&self, key: &str) -> crate::Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> crate::Result<()> {
            if key.starts_with("location_") {
                std::future::pending::<()>().await;
            }
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> crate::Result<()> {
            self.inner.delete(key).await
        }
    }

    struct FixedAddress;

    #[async_trait]
    impl Geocoder for FixedAddress {
        async fn reverse(&self, _latitude: f64, _longitude: f64) -> Option<AddressDetails> {
            Some(AddressDetails {
                street: Some("Rua Augusta".into()),
                ..Default::default()
            })
        }
    }

    struct Harness {
        submitter: Submitter,
        sessions: SessionManager,
        id: SessionId,
        clock: ManualClock,
    }

    async fn harness(store: Arc<dyn KvStore>, geocoder: Arc<dyn Geocoder>) -> Harness {
        let clock = ManualClock::new(T0);
        let sessions = SessionManager::new(store, Arc::new(clock.clone()));
        let id = sessions.create().await.unwrap().id;
        let submitter = Submitter::new(id.clone(), sessions.clone(), geocoder, WatchOptions::default());
        Harness {
            submitter,
            sessions,
            id,
            clock,
        }
    }

    fn replay(track: &str) -> ReplaySource {
        ReplaySource::parse(track, Arc::new(ManualClock::new(T0))).unwrap()
    }

    const ONE_FIX_THEN_DENIED: &str = "\
        {\"latitude\": -23.55, \"longitude\": -46.63, \"accuracy\": 10, \"timestamp\": 1700000001000}\n\
        {\"error\": \"permission_denied\"}\n";

    const ONE_FIX: &str =
        "{\"latitude\": -23.55, \"longitude\": -46.63, \"accuracy\": 10, \"timestamp\": 1700000001000}\n";

    #[tokio::test(start_paused = true)]
    async fn does_not_touch_location_before_consent() {
        let h = harness(Arc::new(MemoryStore::new()), Arc::new(NoGeocoder)).await;
        let status = h.submitter.subscribe();
        let source = replay(ONE_FIX_THEN_DENIED);

        let (consent_tx, consent_rx) = tokio::sync::oneshot::channel::<bool>();
        let run = tokio::spawn(h.submitter.run(
            source,
            async move { consent_rx.await.unwrap_or(false) },
            std::future::pending(),
        ));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(status.borrow().state, SubmitterState::AwaitingUserConsent);

        consent_tx.send(true).unwrap();
        let summary = run.await.unwrap();
        assert_eq!(summary.fixes, 1);
        assert_eq!(summary.final_state, SubmitterState::PermissionDenied);
    }

    #[tokio::test(start_paused = true)]
    async fn withheld_consent_stops_without_fixes() {
        let h = harness(Arc::new(MemoryStore::new()), Arc::new(NoGeocoder)).await;
        let summary = h
            .submitter
            .run(replay(ONE_FIX_THEN_DENIED), async { false }, std::future::pending())
            .await;
        assert_eq!(summary.final_state, SubmitterState::Stopped);
        assert_eq!(summary.fixes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn geocoding_failure_still_writes_report() {
        let h = harness(Arc::new(MemoryStore::new()), Arc::new(NoGeocoder)).await;
        let summary = h
            .submitter
            .run(replay(ONE_FIX_THEN_DENIED), async { true }, std::future::pending())
            .await;

        assert_eq!(summary.written, 1);
        let stored = h.sessions.read_report(&h.id).await.unwrap().unwrap();
        assert!(stored.address.is_empty());
        assert_eq!(stored.timestamp, 1_700_000_001_000);
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_address_is_stored_with_fix() {
        let h = harness(Arc::new(MemoryStore::new()), Arc::new(FixedAddress)).await;
        h.submitter
            .run(replay(ONE_FIX_THEN_DENIED), async { true }, std::future::pending())
            .await;
        let stored = h.sessions.read_report(&h.id).await.unwrap().unwrap();
        assert_eq!(stored.address.street.as_deref(), Some("Rua Augusta"));
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_is_retried_by_next_fix() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures_left: AtomicUsize::new(1),
        });
        let h = harness(store, Arc::new(NoGeocoder)).await;
        let track = "\
            {\"latitude\": 1.0, \"longitude\": 1.0, \"accuracy\": 5, \"timestamp\": 1}\n\
            {\"latitude\": 2.0, \"longitude\": 2.0, \"accuracy\": 5, \"timestamp\": 2}\n\
            {\"error\": \"permission_denied\"}\n";

        let summary = h.submitter.run(replay(track), async { true }, std::future::pending()).await;
        assert_eq!(summary.fixes, 2);
        assert_eq!(summary.failed_writes, 1);
        assert_eq!(summary.written, 1);

        let stored = h.sessions.read_report(&h.id).await.unwrap().unwrap();
        assert_eq!(stored.latitude, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_and_timeout_do_not_stop_the_watch() {
        let h = harness(Arc::new(MemoryStore::new()), Arc::new(NoGeocoder)).await;
        let track = "\
            {\"error\": \"position_unavailable\"}\n\
            {\"error\": \"timeout\"}\n\
            {\"latitude\": 2.0, \"longitude\": 2.0, \"accuracy\": 5, \"timestamp\": 2}\n\
            {\"error\": \"permission_denied\"}\n";

        let summary = h.submitter.run(replay(track), async { true }, std::future::pending()).await;
        assert_eq!(summary.fixes, 1);
        assert_eq!(summary.written, 1);
        assert_eq!(summary.final_state, SubmitterState::PermissionDenied);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_watch() {
        let h = harness(Arc::new(MemoryStore::new()), Arc::new(NoGeocoder)).await;
        let status = h.submitter.subscribe();
        let source = FixedSource::new(1.0, 1.0, 5.0, Arc::new(h.clock.clone()));

        let summary = h
            .submitter
            .run(source, async { true }, tokio::time::sleep(Duration::from_secs(3)))
            .await;
        assert_eq!(summary.final_state, SubmitterState::Stopped);
        assert!(summary.fixes >= 1);
        assert_eq!(status.borrow().state, SubmitterState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_write_that_never_completes() {
        let store = Arc::new(HungStore {
            inner: MemoryStore::new(),
        });
        let h = harness(store, Arc::new(NoGeocoder)).await;
        let source = FixedSource::new(1.0, 1.0, 5.0, Arc::new(h.clock.clone()));

        let summary = tokio::time::timeout(
            Duration::from_secs(3600),
            h.submitter
                .run(source, async { true }, tokio::time::sleep(Duration::from_secs(3))),
        )
        .await
        .expect("run must return once shutdown fires");

        assert_eq!(summary.final_state, SubmitterState::Stopped);
        assert_eq!(summary.fixes, 1);
        assert_eq!(summary.written, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_removed_while_sharing_stops_without_orphan() {
        let store = MemoryStore::new();
        let h = harness(Arc::new(store.clone()), Arc::new(NoGeocoder)).await;

        h.clock.advance_ms(SESSION_TTL_MS + 1000);
        assert_eq!(
            h.sessions.check_validity(&h.id).await.unwrap(),
            Validity::Invalid(InvalidReason::Expired)
        );

        let status = h.submitter.subscribe();
        let summary = h.submitter.run(replay(ONE_FIX), async { true }, std::future::pending()).await;

        assert_eq!(
            summary.final_state,
            SubmitterState::LinkInvalid(InvalidReason::NotFound)
        );
        assert_eq!(summary.written, 0);
        assert_eq!(
            status.borrow().detail.as_deref(),
            Some(InvalidReason::NotFound.message())
        );
        assert!(!store.contains(&h.id.location_key()).await);
        assert!(!store.contains(&h.id.metadata_key()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_during_sharing_stops_and_cleans_up() {
        let store = MemoryStore::new();
        let h = harness(Arc::new(store.clone()), Arc::new(NoGeocoder)).await;
        h.clock.advance_ms(SESSION_TTL_MS + 1);

        let summary = h.submitter.run(replay(ONE_FIX), async { true }, std::future::pending()).await;
        assert_eq!(
            summary.final_state,
            SubmitterState::LinkInvalid(InvalidReason::Expired)
        );
        assert!(!store.contains(&h.id.location_key()).await);
        assert!(!store.contains(&h.id.metadata_key()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_fix_is_not_reported_as_sent() {
        let h = harness(Arc::new(MemoryStore::new()), Arc::new(NoGeocoder)).await;
        let newer = LocationReport::new(
            h.id.clone(),
            Fix {
                latitude: 9.0,
                longitude: 9.0,
                accuracy: 1.0,
                timestamp: h.clock.now_ms() + 60_000,
            },
            None,
        );
        h.sessions.write_report(&newer).await.unwrap();

        let status = h.submitter.subscribe();
        let summary = h.submitter.run(replay(ONE_FIX), async { true }, std::future::pending()).await;

        assert_eq!(summary.stale, 1);
        assert_eq!(summary.written, 0);
        assert_eq!(status.borrow().detail, None);
        assert!(status.borrow().message.contains("skipped"));
        assert_eq!(h.sessions.read_report(&h.id).await.unwrap(), Some(newer));
    }

    #[tokio::test(start_paused = true)]
    async fn finished_replay_ends_the_run() {
        let h = harness(Arc::new(MemoryStore::new()), Arc::new(NoGeocoder)).await;
        let summary = tokio::time::timeout(
            Duration::from_secs(3600),
            h.submitter.run(replay(ONE_FIX), async { true }, std::future::pending()),
        )
        .await
        .expect("run must end when the track is exhausted");

        assert_eq!(summary.fixes, 1);
        assert_eq!(summary.written, 1);
        assert_eq!(summary.final_state, SubmitterState::Tracking);
    }
}
