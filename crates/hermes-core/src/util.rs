use chrono::TimeDelta;

/// Format a duration as a compact human-readable string.
///
/// Example: `TimeDelta::seconds(3725)` → `"1h 2m 5s"`
pub fn format_elapsed(delta: TimeDelta) -> String {
    let total = delta.num_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
