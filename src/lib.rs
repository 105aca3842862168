#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod accumulator;
pub mod client;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod dispatcher;
pub mod framer;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod server;
pub mod specs;
pub mod str_utils;
pub mod streaming;
pub mod tools;
pub mod types;
pub mod upstream;

pub use types::*;

pub use main_helper::{AppState, Args};
