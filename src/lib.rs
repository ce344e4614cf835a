pub mod analysis;
pub mod config;
pub mod data;
pub mod export;
