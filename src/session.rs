//! Session lifecycle over the shared store: creation, lazy expiry, and the
//! location report read/write contract.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::clock::Clock;
use crate::config::SESSION_TTL_MS;
use crate::error::{Error, Result};
use crate::link;
use crate::report::LocationReport;
use crate::store::KvStore;

const METADATA_PREFIX: &str = "session_metadata_";
const LOCATION_PREFIX: &str = "location_session_";

/// Opaque, URL-safe session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Accepts non-empty ids made of ASCII alphanumerics, `-` and `_`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::InvalidLink("empty session id".to_string()));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidLink(format!("session id {:?} is not token-safe", raw)));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn metadata_key(&self) -> String {
        format!("{}{}", METADATA_PREFIX, self.0)
    }

    pub fn location_key(&self) -> String {
        format!("{}{}", LOCATION_PREFIX, self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored metadata; both instants are epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub created: i64,
    pub expires: i64,
}

impl SessionMeta {
    pub fn starting_at(created: i64) -> Self {
        Self {
            created,
            expires: created + SESSION_TTL_MS,
        }
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires < now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub meta: SessionMeta,
}

impl Session {
    pub fn link(&self, base_url: &str) -> Result<Url> {
        link::build(base_url, &self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    NotFound,
    Expired,
    MalformedMetadata,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::NotFound => "not_found",
            InvalidReason::Expired => "expired",
            InvalidReason::MalformedMetadata => "malformed_metadata",
        }
    }

    /// Text for the "link invalid" view.
    pub fn message(&self) -> &'static str {
        match self {
            InvalidReason::NotFound => "Tracking session not found.",
            InvalidReason::Expired => "The tracking link has expired (3 hour limit).",
            InvalidReason::MalformedMetadata => "Error processing session data.",
        }
    }
}

impl From<InvalidReason> for Error {
    fn from(reason: InvalidReason) -> Self {
        match reason {
            InvalidReason::NotFound => Error::SessionNotFound,
            InvalidReason::Expired => Error::SessionExpired,
            InvalidReason::MalformedMetadata => {
                Error::MalformedMetadata(reason.message().to_string())
            }
        }
    }
}

impl InvalidReason {
    /// The reason behind a session error, if `error` is one.
    pub fn of(error: &Error) -> Option<Self> {
        match error {
            Error::SessionNotFound => Some(InvalidReason::NotFound),
            Error::SessionExpired => Some(InvalidReason::Expired),
            Error::MalformedMetadata(_) => Some(InvalidReason::MalformedMetadata),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid(SessionMeta),
    Invalid(InvalidReason),
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid(_))
    }
}

/// Result of a report write under last-fix-wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The store already holds a report captured later than this one.
    Stale,
}

/// Owns session creation and validity over any [`KvStore`].
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Creates a fresh session expiring one TTL from now.
    pub async fn create(&self) -> Result<Session> {
        let id = SessionId::generate();
        let meta = SessionMeta::starting_at(self.clock.now_ms());
        let value = serde_json::to_string(&meta)
            .map_err(|e| Error::StoreWriteFailed(e.to_string()))?;

        self.store.set(&id.metadata_key(), value).await?;
        info!(session_id = %id, expires = meta.expires, "Created session");

        Ok(Session { id, meta })
    }

    /// Classifies a session. The expired path deletes the metadata and the
    /// location record before returning.
    pub async fn check_validity(&self, id: &SessionId) -> Result<Validity> {
        let raw = match self.store.get(&id.metadata_key()).await? {
            Some(raw) => raw,
            None => {
                debug!(session_id = %id, "Session not found");
                return Ok(Validity::Invalid(InvalidReason::NotFound));
            }
        };

        let meta: SessionMeta = match serde_json::from_str(&raw) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Malformed session metadata");
                return Ok(Validity::Invalid(InvalidReason::MalformedMetadata));
            }
        };

        if meta.is_expired_at(self.clock.now_ms()) {
            info!(session_id = %id, expires = meta.expires, "Session expired, cleaning up");
            self.remove(id).await;
            return Ok(Validity::Invalid(InvalidReason::Expired));
        }

        Ok(Validity::Valid(meta))
    }

    /// Deletes both records of a session. Failures are logged only.
    pub async fn remove(&self, id: &SessionId) {
        for key in [id.metadata_key(), id.location_key()] {
            if let Err(e) = self.store.delete(&key).await {
                warn!(session_id = %id, key = %key, error = %e, "Failed to delete session record");
            }
        }
    }

    /// Writes a report unless the store already holds a later fix for the
    /// session. Fails with the session error when the session is missing,
    /// expired or unreadable, so no location record outlives its metadata.
    pub async fn write_report(&self, report: &LocationReport) -> Result<WriteOutcome> {
        if let Validity::Invalid(reason) = self.check_validity(&report.session_id).await? {
            warn!(session_id = %report.session_id, reason = reason.as_str(), "Refusing report for invalid session");
            return Err(reason.into());
        }

        let key = report.session_id.location_key();

        if let Some(current) = self.read_report(&report.session_id).await? {
            if current.timestamp > report.timestamp {
                debug!(
                    session_id = %report.session_id,
                    stored = current.timestamp,
                    incoming = report.timestamp,
                    "Skipping stale report"
                );
                return Ok(WriteOutcome::Stale);
            }
        }

        let value = serde_json::to_string(report)
            .map_err(|e| Error::StoreWriteFailed(e.to_string()))?;
        self.store.set(&key, value).await?;
        debug!(session_id = %report.session_id, "Report stored");
        Ok(WriteOutcome::Written)
    }

    /// Latest report for a session. An unparseable record reads as absent.
    pub async fn read_report(&self, id: &SessionId) -> Result<Option<LocationReport>> {
        let raw = match self.store.get(&id.location_key()).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        Ok(parse_report(id, &raw))
    }
}

pub(crate) fn parse_report(id: &SessionId, raw: &str) -> Option<LocationReport> {
    match serde_json::from_str(raw) {
        Ok(report) => Some(report),
        Err(e) => {
            warn!(session_id = %id, error = %e, "Ignoring unparseable location record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::report::{AddressDetails, Fix};
    use crate::store::MemoryStore;

    const T0: i64 = 1_700_000_000_000;

    fn manager() -> (SessionManager, MemoryStore, ManualClock) {
        let store = MemoryStore::new();
        let clock = ManualClock::new(T0);
        let manager = SessionManager::new(Arc::new(store.clone()), Arc::new(clock.clone()));
        (manager, store, clock)
    }

    fn fix_at(timestamp: i64) -> Fix {
        Fix {
            latitude: -23.55,
            longitude: -46.63,
            accuracy: 10.0,
            timestamp,
        }
    }

    #[tokio::test]
    async fn fresh_session_is_valid() {
        let (manager, store, _) = manager();
        let session = manager.create().await.unwrap();

        assert_eq!(session.meta.expires - session.meta.created, SESSION_TTL_MS);
        assert!(store.contains(&session.id.metadata_key()).await);
        assert_eq!(
            manager.check_validity(&session.id).await.unwrap(),
            Validity::Valid(session.meta)
        );
    }

    #[tokio::test]
    async fn session_ids_do_not_collide() {
        let (manager, _, _) = manager();
        let a = manager.create().await.unwrap();
        let b = manager.create().await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (manager, _, _) = manager();
        let id = SessionId::parse("never-created").unwrap();
        assert_eq!(
            manager.check_validity(&id).await.unwrap(),
            Validity::Invalid(InvalidReason::NotFound)
        );
    }

    #[tokio::test]
    async fn expiry_is_strictly_after_ttl() {
        let (manager, _, clock) = manager();
        let session = manager.create().await.unwrap();

        clock.set_ms(session.meta.expires);
        assert!(manager.check_validity(&session.id).await.unwrap().is_valid());

        clock.advance_ms(1);
        assert_eq!(
            manager.check_validity(&session.id).await.unwrap(),
            Validity::Invalid(InvalidReason::Expired)
        );
    }

    #[tokio::test]
    async fn expired_session_cleans_up_both_records() {
        let (manager, store, clock) = manager();
        let session = manager.create().await.unwrap();
        let report = LocationReport::new(session.id.clone(), fix_at(T0 + 1000), None);
        manager.write_report(&report).await.unwrap();

        clock.advance_ms(SESSION_TTL_MS + 1000);
        assert_eq!(
            manager.check_validity(&session.id).await.unwrap(),
            Validity::Invalid(InvalidReason::Expired)
        );
        assert!(!store.contains(&session.id.metadata_key()).await);
        assert!(!store.contains(&session.id.location_key()).await);

        // With the metadata gone the session is indistinguishable from a missing one.
        assert_eq!(
            manager.check_validity(&session.id).await.unwrap(),
            Validity::Invalid(InvalidReason::NotFound)
        );
    }

    #[tokio::test]
    async fn malformed_metadata_is_invalid_and_kept() {
        let (manager, store, _) = manager();
        let id = SessionId::parse("broken").unwrap();
        store.set(&id.metadata_key(), "{not json".to_string()).await.unwrap();
        assert_eq!(
            manager.check_validity(&id).await.unwrap(),
            Validity::Invalid(InvalidReason::MalformedMetadata)
        );

        store
            .set(&id.metadata_key(), r#"{"created": 1}"#.to_string())
            .await
            .unwrap();
        assert_eq!(
            manager.check_validity(&id).await.unwrap(),
            Validity::Invalid(InvalidReason::MalformedMetadata)
        );
        assert!(store.contains(&id.metadata_key()).await);
    }

    #[tokio::test]
    async fn written_report_reads_back_equal() {
        let (manager, _, _) = manager();
        let session = manager.create().await.unwrap();
        let address = AddressDetails {
            street: Some("Rua Augusta".into()),
            city: Some("São Paulo".into()),
            ..Default::default()
        };
        let report = LocationReport::new(session.id.clone(), fix_at(T0 + 1000), Some(address));

        assert_eq!(manager.write_report(&report).await.unwrap(), WriteOutcome::Written);
        assert_eq!(manager.read_report(&session.id).await.unwrap(), Some(report));
    }

    #[tokio::test]
    async fn older_fix_does_not_replace_newer_one() {
        let (manager, _, _) = manager();
        let session = manager.create().await.unwrap();
        let newer = LocationReport::new(session.id.clone(), fix_at(T0 + 2000), None);
        let older = LocationReport::new(session.id.clone(), fix_at(T0 + 1000), None);

        manager.write_report(&newer).await.unwrap();
        assert_eq!(manager.write_report(&older).await.unwrap(), WriteOutcome::Stale);
        assert_eq!(manager.read_report(&session.id).await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn write_after_expiry_leaves_no_orphaned_record() {
        let (manager, store, clock) = manager();
        let session = manager.create().await.unwrap();

        clock.advance_ms(SESSION_TTL_MS + 1000);
        assert_eq!(
            manager.check_validity(&session.id).await.unwrap(),
            Validity::Invalid(InvalidReason::Expired)
        );

        let late = LocationReport::new(session.id.clone(), fix_at(clock.now_ms()), None);
        assert!(matches!(
            manager.write_report(&late).await,
            Err(Error::SessionNotFound)
        ));
        assert!(!store.contains(&session.id.location_key()).await);
        assert!(!store.contains(&session.id.metadata_key()).await);
    }

    #[tokio::test]
    async fn write_to_expired_session_cleans_up_and_fails() {
        let (manager, store, clock) = manager();
        let session = manager.create().await.unwrap();
        let report = LocationReport::new(session.id.clone(), fix_at(T0 + 1000), None);
        manager.write_report(&report).await.unwrap();

        clock.advance_ms(SESSION_TTL_MS + 1000);
        let late = LocationReport::new(session.id.clone(), fix_at(clock.now_ms()), None);
        assert!(matches!(
            manager.write_report(&late).await,
            Err(Error::SessionExpired)
        ));
        assert!(!store.contains(&session.id.location_key()).await);
    }

    #[tokio::test]
    async fn garbage_location_record_reads_as_absent() {
        let (manager, store, _) = manager();
        let id = SessionId::parse("s1").unwrap();
        store.set(&id.location_key(), "garbage".to_string()).await.unwrap();
        assert_eq!(manager.read_report(&id).await.unwrap(), None);
    }

    #[test]
    fn session_id_rejects_unsafe_input() {
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("a b").is_err());
        assert!(SessionId::parse("../x").is_err());
        assert_eq!(SessionId::parse(" ok_1-2 ").unwrap().as_str(), "ok_1-2");
    }

    #[test]
    fn invalid_reasons_map_to_errors() {
        assert!(matches!(Error::from(InvalidReason::NotFound), Error::SessionNotFound));
        assert!(matches!(Error::from(InvalidReason::Expired), Error::SessionExpired));
        assert_eq!(
            InvalidReason::of(&Error::from(InvalidReason::MalformedMetadata)),
            Some(InvalidReason::MalformedMetadata)
        );
        assert_eq!(InvalidReason::of(&Error::Feed("x".into())), None);
        assert_eq!(InvalidReason::MalformedMetadata.as_str(), "malformed_metadata");
    }
}
