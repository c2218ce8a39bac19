//! HTTP layer: health and metrics endpoints for operators and scrapers.
//! Only started when `server.http_listen` is configured.

pub mod handler;
