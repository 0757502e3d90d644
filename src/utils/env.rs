// src/utils/env.rs
use log::{debug, info};
use std::env;
use std::str::FromStr;

/// Loads variables from a `.env` file if one exists. Variables already set in the process win.
pub fn load_env() {
    match dotenv::dotenv() {
        Ok(path) => info!("Loaded environment variables from {}", path.display()),
        Err(e) => debug!("No .env file loaded ({}); using process environment", e),
    }
}

/// Parses `key` from the environment, falling back to `default` when unset or unparsable.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub fn env_string_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
