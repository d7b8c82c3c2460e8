pub mod api;
pub mod codec;
pub mod config;
pub mod history;
pub mod model;
pub mod stations;
pub mod store;
pub mod telemetry;
