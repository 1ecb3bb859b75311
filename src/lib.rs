#![allow(clippy::result_large_err)]

pub mod agent;
pub mod app;
pub mod app_context;
pub mod clock;
pub mod codec;
pub mod compression;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod pmode;
pub mod pull;
pub mod reliability;
pub mod security;
pub mod store;
pub mod telemetry;
pub mod transformer;
pub mod transport;
