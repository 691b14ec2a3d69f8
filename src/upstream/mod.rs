//! Upstream storage service client (admin task API)
//!
//! Only the handful of routes the task tracker needs: listing pending and
//! finished background jobs, deleting finished ones, and checking the token.

mod client;

pub use client::{Envelope, UpstreamClient, UpstreamError, UpstreamTask, UserInfo};
