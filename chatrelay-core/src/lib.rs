pub mod config;
pub mod error;
pub mod frame;
pub mod http_client;
pub mod model;
pub mod ocr;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod session;
pub mod stream;
pub mod task;
pub mod telemetry;
pub mod upstream;
