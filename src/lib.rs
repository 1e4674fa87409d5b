pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod server;
pub mod services;
pub mod steps;
pub mod store;

#[cfg(test)]
mod test_support;
