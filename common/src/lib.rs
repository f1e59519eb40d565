pub mod config;
pub mod error;
pub mod event;
pub mod grouping;
pub mod module;
pub mod network;
pub mod store;
