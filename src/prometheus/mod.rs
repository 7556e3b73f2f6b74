//! Backend-facing Prometheus plumbing: the instant-query client used to
//! probe candidates and the line-oriented `/metrics` scraper.

pub mod query;
pub mod scrape;
