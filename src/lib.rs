//! Image crop service
//!
//! Accepts uploaded images over HTTP, crops and resizes them asynchronously
//! on worker processes, and lets clients poll progress and download the
//! result. Job state lives in a shared job store; tasks travel over a
//! Redis-backed queue.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
