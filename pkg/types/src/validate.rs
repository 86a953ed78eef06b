use anyhow::{Result, bail};

use crate::duration::parse_duration;
use crate::reservation::ReservationSpec;

/// Validate a cluster or requester identifier.
///
/// The broker couples cluster identity and requester identity into one
/// string space, so both follow the same rule: lowercase `[a-z0-9-]`,
/// max 63 chars, no leading or trailing hyphen.
pub fn validate_identifier(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("identifier must not be empty");
    }
    if id.len() > 63 {
        bail!("identifier '{}' exceeds 63 characters", id);
    }
    if id.starts_with('-') || id.ends_with('-') {
        bail!("identifier '{}' must not start or end with a hyphen", id);
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "identifier '{}' must match [a-z0-9-] (lowercase letters, digits, hyphens)",
            id
        );
    }
    Ok(())
}

/// Check a reservation spec before any capacity work happens.
/// A failure here is terminal for the reservation.
pub fn validate_reservation_spec(spec: &ReservationSpec) -> Result<()> {
    if spec.requester_id.is_empty() {
        bail!("spec.requesterID must be set");
    }
    validate_identifier(&spec.requester_id)?;
    if spec.requested_resources.cpu.sign() <= 0 {
        bail!("requested CPU must be greater than zero");
    }
    if spec.requested_resources.memory.sign() <= 0 {
        bail!("requested memory must be greater than zero");
    }
    if let Some(duration) = &spec.duration {
        let parsed = parse_duration(duration)?;
        if parsed <= chrono::Duration::zero() {
            bail!("duration '{}' must be greater than zero", duration);
        }
    }
    Ok(())
}
