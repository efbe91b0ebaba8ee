#![doc = include_str!("../README.md")]

pub mod cli;
pub mod config;
pub mod nws;
pub mod render;
pub mod server;
pub mod stores;
