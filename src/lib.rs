pub mod app;
pub mod config;
pub mod db;
pub mod errors;
pub mod generate;
pub mod jobs;
pub mod logging;
pub mod persist;
pub mod server;
pub mod util;
