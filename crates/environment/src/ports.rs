/// Check the environment port-mapping invariant: at least one port, and
/// the i-th internal port maps to the i-th published port.
pub fn validate_mapping(internal: &[u16], published: &[u16]) -> Result<(), String> {
    if internal.is_empty() {
        return Err("at least one port is required".to_string());
    }
    if internal.len() != published.len() {
        return Err(format!(
            "{} internal ports but {} published ports",
            internal.len(),
            published.len()
        ));
    }
    Ok(())
}

/// Zip internal and published ports into ordered pairs.
pub fn pairs(internal: &[u16], published: &[u16]) -> Vec<(u16, u16)> {
    internal
        .iter()
        .copied()
        .zip(published.iter().copied())
        .collect()
}
