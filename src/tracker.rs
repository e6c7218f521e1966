//! Tracker announces over HTTP.
//!
//! The session talks to its tracker through the [`Announce`] trait so tests
//! can substitute a scripted tracker for [`HttpTracker`].

mod announce;
mod error;
mod http;
mod response;

pub use announce::{Announce, AnnounceRequest};
pub use error::TrackerError;
pub use http::HttpTracker;
pub use response::{parse_announce_response, parse_compact_peers, AnnounceResponse, TrackerEvent};
