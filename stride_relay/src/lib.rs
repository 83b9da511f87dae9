mod routes;

pub mod app;
pub mod calibration;
pub mod config;
pub mod connections;
pub mod distance;
pub mod frame;
pub mod handler;
pub mod inference;
pub mod publisher;
pub mod server;
pub mod telemetry;

pub use app::start_app;
