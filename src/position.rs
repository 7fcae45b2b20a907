//! Platform location API: position sources and the continuous watch over them.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{FIX_MAX_AGE, FIX_TIMEOUT};
use crate::report::Fix;

/// Errors reported by the location platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    PositionUnavailable,
    #[error("location request timed out")]
    Timeout,
}

impl LocationError {
    pub fn user_message(&self) -> &'static str {
        match self {
            LocationError::PermissionDenied => {
                "Location permission denied. Reload the page and accept the permission."
            }
            LocationError::PositionUnavailable => "Location information is unavailable.",
            LocationError::Timeout => "The request to get the location timed out.",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    /// Upper bound on a single acquisition.
    pub timeout: Duration,
    /// A cached fix younger than this is reused instead of re-acquired.
    pub maximum_age: Duration,
    /// Delay between checks of the cache.
    pub sample_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: FIX_TIMEOUT,
            maximum_age: FIX_MAX_AGE,
            sample_interval: Duration::from_secs(1),
        }
    }
}

#[async_trait]
pub trait PositionSource: Send + 'static {
    async fn acquire(&mut self, high_accuracy: bool) -> Result<Fix, LocationError>;

    /// A finished source ends the watch instead of being polled again.
    fn is_exhausted(&self) -> bool {
        false
    }
}

#[async_trait]
impl PositionSource for Box<dyn PositionSource> {
    async fn acquire(&mut self, high_accuracy: bool) -> Result<Fix, LocationError> {
        (**self).acquire(high_accuracy).await
    }

    fn is_exhausted(&self) -> bool {
        (**self).is_exhausted()
    }
}

/// A live subscription. Dropping it cancels the underlying watch.
pub struct PositionWatch {
    updates: mpsc::Receiver<Result<Fix, LocationError>>,
    task: JoinHandle<()>,
}

impl PositionWatch {
    pub async fn next(&mut self) -> Option<Result<Fix, LocationError>> {
        self.updates.recv().await
    }

    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for PositionWatch {
    fn drop(&mut self) {
        self.task.abort();
        debug!("Location watch cancelled");
    }
}

/// Starts a continuous watch on `source`.
pub fn watch<S: PositionSource>(mut source: S, options: WatchOptions) -> PositionWatch {
    let (tx, updates) = mpsc::channel(8);

    let task = tokio::spawn(async move {
        let mut cached: Option<Instant> = None;
        info!(
            high_accuracy = options.high_accuracy,
            timeout_ms = options.timeout.as_millis() as u64,
            maximum_age_ms = options.maximum_age.as_millis() as u64,
            "Location watch started"
        );

        loop {
            let fresh = cached.is_some_and(|at| at.elapsed() < options.maximum_age);
            if !fresh {
                if source.is_exhausted() {
                    debug!("Location source exhausted");
                    break;
                }
                let update = match timeout(options.timeout, source.acquire(options.high_accuracy)).await {
                    Ok(Ok(fix)) => {
                        cached = Some(Instant::now());
                        Ok(fix)
                    }
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(LocationError::Timeout),
                };
                if tx.send(update).await.is_err() {
                    break;
                }
            }
            sleep(options.sample_interval).await;
        }
    });

    PositionWatch { updates, task }
}

/// Reports the same coordinates on every acquisition.
pub struct FixedSource {
    latitude: f64,
    longitude: f64,
    accuracy: f64,
    clock: Arc<dyn Clock>,
}

impl FixedSource {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            clock,
        }
    }
}

#[async_trait]
impl PositionSource for FixedSource {
    async fn acquire(&mut self, _high_accuracy: bool) -> Result<Fix, LocationError> {
        Ok(Fix {
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy: self.accuracy,
            timestamp: self.clock.now_ms(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ReplayStep {
    Fix {
        latitude: f64,
        longitude: f64,
        accuracy: f64,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Error {
        error: String,
    },
}

/// Plays back a recorded track, one JSON object per line:
/// `{"latitude":..,"longitude":..,"accuracy":..}` or
/// `{"error":"permission_denied"|"position_unavailable"|"timeout"}`.
/// The watch ends once every step has been played.
pub struct ReplaySource {
    steps: VecDeque<ReplayStep>,
    clock: Arc<dyn Clock>,
}

impl ReplaySource {
    pub fn from_file(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents, clock)
    }

    pub fn parse(contents: &str, clock: Arc<dyn Clock>) -> crate::Result<Self> {
        let mut steps = VecDeque::new();
        for (n, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let step: ReplayStep = serde_json::from_str(line).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("line {}: {}", n + 1, e))
            })?;
            if let ReplayStep::Error { error } = &step {
                parse_error_kind(error).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("line {}: unknown error kind {:?}", n + 1, error),
                    )
                })?;
            }
            steps.push_back(step);
        }
        Ok(Self { steps, clock })
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

fn parse_error_kind(raw: &str) -> Option<LocationError> {
    match raw {
        "permission_denied" => Some(LocationError::PermissionDenied),
        "position_unavailable" => Some(LocationError::PositionUnavailable),
        "timeout" => Some(LocationError::Timeout),
        _ => None,
    }
}

#[async_trait]
impl PositionSource for ReplaySource {
    async fn acquire(&mut self, _high_accuracy: bool) -> Result<Fix, LocationError> {
        match self.steps.pop_front() {
            Some(ReplayStep::Fix {
                latitude,
                longitude,
                accuracy,
                timestamp,
            }) => Ok(Fix {
                latitude,
                longitude,
                accuracy,
                timestamp: timestamp.unwrap_or_else(|| self.clock.now_ms()),
            }),
            Some(ReplayStep::Error { error }) => {
                Err(parse_error_kind(&error).unwrap_or(LocationError::PositionUnavailable))
            }
            None => Err(LocationError::PositionUnavailable),
        }
    }

    fn is_exhausted(&self) -> bool {
        self.steps.is_empty()
    }
}
