pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod importers;
pub mod logging;
pub mod model;
pub mod output;
pub mod reactor;
pub mod remote;
pub mod store;
