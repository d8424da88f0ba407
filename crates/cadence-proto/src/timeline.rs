//! Time display and seek-bar arithmetic shared by the daemon and clients.

/// `m:ss`, with zero, negative, non-finite or unknown input shown as `0:00`.
pub fn format_time(secs: Option<f64>) -> String {
    let secs = match secs {
        Some(s) if s.is_finite() && s > 0.0 => s as u64,
        _ => return "0:00".to_string(),
    };
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// Played fraction in `[0, 1]`, or `None` while the duration is unknown.
pub fn progress_fraction(time_pos: Option<f64>, duration: Option<f64>) -> Option<f64> {
    let duration = duration.filter(|d| d.is_finite() && *d > 0.0)?;
    let pos = time_pos.unwrap_or(0.0);
    Some((pos / duration).clamp(0.0, 1.0))
}

/// Pointer offset across a bar of `width` units as a clamped fraction.
pub fn pointer_fraction(offset: f64, width: f64) -> f64 {
    if !(width > 0.0) {
        return 0.0;
    }
    clamp_fraction(offset / width)
}

pub fn clamp_fraction(fraction: f64) -> f64 {
    if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    }
}

/// Absolute seek target for a fraction of the duration.
pub fn seek_target(fraction: f64, duration: Option<f64>) -> Option<f64> {
    let duration = duration.filter(|d| d.is_finite() && *d > 0.0)?;
    Some(clamp_fraction(fraction) * duration)
}
