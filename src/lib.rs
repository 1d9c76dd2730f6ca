pub mod api;
pub mod app;
pub mod clients;
pub mod commit_tracker;
pub mod config;
pub mod engine;
pub mod errors;
pub mod ingress;
pub mod logging;
pub mod porting;
pub mod runner;
pub mod server;
pub mod store;
pub mod webhooks;
