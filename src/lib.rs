pub mod api;
pub mod app;
pub mod config;
pub mod internal;
pub mod utils;
