//! API endpoint modules.

pub mod events;
pub mod files;
pub mod health;
pub mod openapi;
pub mod upload;

pub use events::configure_routes as configure_event_routes;
pub use files::configure_routes as configure_file_routes;
pub use health::configure_health_routes;
pub use openapi::ApiDoc;
pub use upload::configure_routes as configure_upload_routes;
