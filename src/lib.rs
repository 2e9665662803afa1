//! NSM storage server library.
//!
//! Streaming file uploads into object storage with upload progress
//! propagated to browsers over server-sent events, either through a
//! message queue or by polling the progress store.

pub mod api;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod middleware;
pub mod migration;
pub mod models;
pub mod services;
