pub mod config;
pub mod events;
pub mod hooks;
pub mod logging;
pub mod models;
pub mod routing;
pub mod types;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
