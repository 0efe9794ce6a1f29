use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::Utc;

/// Log a message to console and append to the log file.
pub fn log(level: &str, message: &str, log_file: &Path) {
    let timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let log_message = format!("[{}] [{}] {}", timestamp, level, message);
    println!("{}", log_message);

    if let Some(dir) = log_file.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(log_file) {
        let _ = writeln!(f, "{}", log_message);
    }
}
