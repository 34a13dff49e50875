use std::time::Duration;
use chrono::Utc;
use crate::core::{UploadItem, UploadStatus};

/// Human-readable size, e.g. `1.50 MB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const UNIT_SIZE: f64 = 1024.0;

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= UNIT_SIZE && unit_index < UNITS.len() - 1 {
        size /= UNIT_SIZE;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Compact duration, e.g. `1m 5s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// One status line: `uploading  42%  clip.mp4 (12.00 MB) 1m 3s`
pub fn format_item(item: &UploadItem) -> String {
    let mut line = format!(
        "{:<10} {:>3}%  {} ({})",
        item.status,
        item.progress,
        item.file_name,
        format_bytes(item.file_size)
    );

    if let Some(start) = item.start_time {
        let end = item.completed_at.unwrap_or_else(Utc::now);
        let elapsed = (end - start).to_std().unwrap_or_default();
        line.push(' ');
        line.push_str(&format_duration(elapsed));
    }

    match item.status {
        UploadStatus::Failed => {
            if let Some(error) = &item.error {
                line.push_str(&format!(" [{}]", error));
            }
        }
        UploadStatus::Completed => {
            if let Some(path) = &item.asset_path {
                line.push_str(&format!(" -> {}", path));
            }
        }
        _ => {}
    }

    line
}
