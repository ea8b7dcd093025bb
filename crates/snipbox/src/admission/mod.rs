//! Admission control in front of the execution engine
//!
//! Requests pass the per-client [`RateLimiter`] first; streaming requests then
//! pass the per-session [`SessionGuard`], which also bounds how many
//! executions run at once.

use std::time::Duration;

use thiserror::Error;

pub use crate::admission::rate_limit::{RateLimiter, client_identity};
pub use crate::admission::session::{INTERNAL_ERROR, SessionGuard, SessionKey, SessionLease};

mod rate_limit;
mod session;

use crate::types::ValidationError;

/// Reasons a request never reached the engine
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Rate limit exceeded. Max {limit} requests per {}.", describe_window(.window))]
    RateLimited { limit: usize, window: Duration },

    #[error("Execution already in progress")]
    SessionBusy,

    #[error("invalid request: {0}")]
    Invalid(#[from] ValidationError),
}

fn describe_window(window: &Duration) -> String {
    match window.as_secs() {
        60 => "minute".to_owned(),
        3600 => "hour".to_owned(),
        _ => format!("{}s", window.as_secs_f64()),
    }
}
