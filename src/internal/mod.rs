pub mod auth;
pub mod models;
pub mod notification;
pub mod persist;
pub mod query_cache;
pub mod redirect;
pub mod search;
pub mod status;
pub mod tracked;
