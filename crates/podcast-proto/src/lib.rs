pub mod config;
pub mod episode;
pub mod platform;
