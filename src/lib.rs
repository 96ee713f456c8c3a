#![recursion_limit = "256"]

pub mod config;
pub mod debug;
pub mod error;
pub mod layers;
pub mod models;
