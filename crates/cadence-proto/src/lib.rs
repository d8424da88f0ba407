pub mod config;
pub mod model;
pub mod platform;
pub mod protocol;
pub mod state;
pub mod timeline;
