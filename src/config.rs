//! Contract constants and runtime configuration for each role.

use std::time::Duration;

/// Session time-to-live in milliseconds (3 hours).
pub const SESSION_TTL_MS: i64 = 3 * 60 * 60 * 1000;

/// Tracker poll cadence.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Per-fix acquisition timeout for the location watch.
pub const FIX_TIMEOUT: Duration = Duration::from_secs(10);

/// A cached fix younger than this is reused instead of re-acquired.
pub const FIX_MAX_AGE: Duration = Duration::from_secs(5);

/// Query parameter carrying the session id in a shareable link.
pub const SESSION_PARAM: &str = "session";

/// Public Nominatim reverse endpoint.
pub const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/reverse";

/// Initial map centre (São Paulo) and zoom levels.
pub const DEFAULT_CENTER: (f64, f64) = (-23.5505, -46.6333);
pub const DEFAULT_ZOOM: u8 = 13;
pub const FOCUS_ZOOM: u8 = 15;

pub const DEFAULT_STORE_URL: &str = "http://127.0.0.1:8080";

/// Upper bound on one request to the store service.
pub const STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// How the tracker learns about new reports.
#[derive(Debug, Clone)]
pub enum FeedMode {
    /// Read the location record on a fixed cadence.
    Poll { interval: Duration },
    /// Subscribe to the store's websocket watch endpoint.
    Push { store_url: String },
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Origin and path the shareable link is built on.
    pub base_url: String,
    pub feed: FeedMode,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_STORE_URL.to_string(),
            feed: FeedMode::Poll {
                interval: POLL_INTERVAL,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}
