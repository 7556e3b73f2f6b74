//! Consolidated test modules.
//!
//! `support` holds the shared mock-Prometheus fixtures; `proxy_e2e` runs the
//! full proxy against live mock backends.

pub(crate) mod support;
