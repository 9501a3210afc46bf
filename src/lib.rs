pub mod cli;
pub mod config;
pub mod engine;
pub mod log;
pub mod monitor;
pub mod paths;
pub mod process;
pub mod supervisor;
