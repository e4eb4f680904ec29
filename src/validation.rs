use crate::error::{AppError, Result};
use crate::instance::{InstanceId, Variant};

/// Resolve a variant name against the fixed allow-list.
pub fn parse_variant(name: &str) -> Result<Variant> {
    let name = name.trim();
    Variant::ALL
        .into_iter()
        .find(|variant| variant.as_str() == name)
        .ok_or_else(|| AppError::invalid_variant(name))
}

/// Accept `instance_<n>` or a bare `<n>`.
pub fn parse_instance_id(raw: &str) -> Result<InstanceId> {
    let raw = raw.trim();
    let digits = raw.strip_prefix("instance_").unwrap_or(raw);
    let is_numeric = !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit());
    if !is_numeric {
        return Err(AppError::invalid_argument(format!(
            "Invalid instance id: {}",
            raw
        )));
    }
    digits
        .parse::<u64>()
        .map(InstanceId)
        .map_err(|_| AppError::invalid_argument(format!("Invalid instance id: {}", raw)))
}
