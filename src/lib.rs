pub mod auth;
pub mod client;
pub mod cmd_args;
pub mod config;
pub mod constants;
pub mod errors;
pub mod keepalive;
pub mod listener;
pub mod logger;
pub mod messages;
pub mod pool;
pub mod server;

#[cfg(test)]
pub mod test_backend;

/// Format a duration as HH:MM:SS for the connection log lines.
pub fn format_duration(duration: &chrono::Duration) -> String {
    let seconds = duration.num_seconds() % 60;
    let minutes = duration.num_minutes() % 60;
    let hours = duration.num_hours();
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
