pub mod config;
pub mod database;
pub mod error;
pub mod jobs;
pub mod repositories;
pub mod services;
pub mod state;
pub mod workflows;

pub use error::{AutomationError, AutomationResult};
pub use state::AppState;

#[cfg(test)]
mod tests;
