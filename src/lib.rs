//! statiko — small-cluster orchestration for static websites.
//!
//! One controller owns the versioned cluster state; agents (one per edge
//! node) subscribe over a bidirectional channel and reconcile their local
//! filesystem and proxy configuration to match.

pub mod agent;
pub mod apps;
pub mod certs;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod etcd;
pub mod metrics;
pub mod notify;
pub mod runtime;
pub mod secrets;
pub mod state;
pub mod web;

pub use error::StatikoError;
