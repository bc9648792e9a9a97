pub mod config;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod research;
pub mod util;
pub mod web;
