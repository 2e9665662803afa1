//! HTTP integration tests.
//!
//! Drive the actix app through `actix_web::test` with the in-memory progress
//! store, queue, blob store and file repository. No external services needed.
//!
//! Run with: cargo test --test integration

mod helpers;

mod events_tests;
mod files_tests;
mod upload_tests;
