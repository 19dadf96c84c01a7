//! Subdomain generation and validation

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of generated subdomain tokens
pub const GENERATED_LEN: usize = 8;

/// Random DNS-safe label of [`GENERATED_LEN`] lowercase alphanumerics
pub fn generate_subdomain() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Canonical form used for storage and lookup
pub fn normalize_subdomain(subdomain: &str) -> String {
    subdomain.trim().to_ascii_lowercase()
}

/// Check a requested subdomain against DNS label rules:
/// 3-63 characters, ASCII alphanumerics and hyphens, no leading/trailing hyphen.
pub fn validate_subdomain(subdomain: &str) -> Result<(), String> {
    if subdomain.is_empty() {
        return Err("Subdomain cannot be empty".to_string());
    }

    if subdomain.len() > 63 {
        return Err(format!(
            "Subdomain too long (max 63 characters): {}",
            subdomain.len()
        ));
    }

    if subdomain.len() < 3 {
        return Err("Subdomain too short (minimum 3 characters)".to_string());
    }

    if subdomain.starts_with('-') || subdomain.ends_with('-') {
        return Err("Subdomain cannot start or end with hyphen".to_string());
    }

    if let Some(ch) = subdomain
        .chars()
        .find(|ch| !ch.is_ascii_alphanumeric() && *ch != '-')
    {
        return Err(format!(
            "Subdomain contains invalid character '{}' (only alphanumeric and hyphens allowed)",
            ch
        ));
    }

    Ok(())
}
