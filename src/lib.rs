//! Locshare - time-limited location sharing between a tracker and a submitter.
//!
//! The tracker creates a session and hands out a link carrying its id. The
//! submitter opens the link, consents, and reports each location fix to a
//! shared key-value store, which the tracker reads back onto a map. The store
//! is the only rendezvous point between the two.

pub mod clock;
pub mod config;
pub mod error;
pub mod feed;
pub mod geocode;
pub mod http_server;
pub mod link;
pub mod map;
pub mod position;
pub mod report;
pub mod session;
pub mod state;
pub mod store;
pub mod submitter;
pub mod tracker;

pub use error::{Error, Result};
