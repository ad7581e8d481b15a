//! Progress values carried by `status` frames.

use crate::{AppError, Result};

/// Validate a fractional progress value reported by an agent.
///
/// # Errors
///
/// Returns `AppError::Protocol` if `value` is not finite or lies outside
/// `0..=1`.
pub fn validate_progress(value: f64) -> Result<f64> {
    if !value.is_finite() {
        return Err(AppError::Protocol("progress must be a finite number".into()));
    }
    if !(0.0..=1.0).contains(&value) {
        return Err(AppError::Protocol(format!(
            "progress {value} is outside 0..=1"
        )));
    }
    Ok(value)
}
