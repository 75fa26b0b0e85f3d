use alloy::primitives::Address;
use anyhow::anyhow;
use std::str::FromStr;

pub fn parse_address(s: &str) -> anyhow::Result<Address> {
    Address::from_str(s.trim()).map_err(|e| anyhow!("invalid address {s}: {e}"))
}

/// Returns the trimmed value, or `None` when it is blank.
pub fn normalize_env(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(normalize_env)
}
