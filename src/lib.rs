pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod quality;
pub mod retrieval;
pub mod terminology;
pub mod textutil;
