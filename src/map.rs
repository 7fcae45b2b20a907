//! Map-rendering collaborator used by the tracker.

use tracing::debug;

use crate::config::{DEFAULT_CENTER, DEFAULT_ZOOM, FOCUS_ZOOM};
use crate::session::SessionId;

/// Marker, viewport and popup state of one tracking session's map.
#[derive(Debug, Clone, PartialEq)]
pub struct MapView {
    pub center: (f64, f64),
    pub zoom: u8,
    pub marker: (f64, f64),
    pub popup: String,
}

impl Default for MapView {
    fn default() -> Self {
        Self {
            center: DEFAULT_CENTER,
            zoom: DEFAULT_ZOOM,
            marker: DEFAULT_CENTER,
            popup: "Waiting for location...".to_string(),
        }
    }
}

impl MapView {
    /// Moves the marker, recentres, and zooms in to at least street level.
    pub fn focus(&mut self, coordinates: (f64, f64), popup: String) {
        self.marker = coordinates;
        self.center = coordinates;
        self.zoom = self.zoom.max(FOCUS_ZOOM);
        self.popup = popup;
    }
}

/// Draws a [`MapView`]. Calls are synchronous from the tracker's side.
pub trait MapRenderer: Send {
    fn render(&mut self, view: &MapView);
    fn set_status(&mut self, status: &str);
    /// Frees rendering resources; no further calls follow.
    fn release(&mut self);
}

/// Prints the map state to stdout.
pub struct ConsoleMap {
    session_id: SessionId,
}

impl ConsoleMap {
    pub fn new(session_id: SessionId) -> Self {
        println!("[map {}] ready", session_id);
        Self { session_id }
    }
}

impl MapRenderer for ConsoleMap {
    fn render(&mut self, view: &MapView) {
        println!(
            "[map {}] marker at ({:.6}, {:.6}), zoom {}\n{}",
            self.session_id, view.marker.0, view.marker.1, view.zoom, view.popup
        );
    }

    fn set_status(&mut self, status: &str) {
        println!("[status] {}", status);
    }

    fn release(&mut self) {
        debug!(session_id = %self.session_id, "Map released");
        println!("[map {}] closed", self.session_id);
    }
}
