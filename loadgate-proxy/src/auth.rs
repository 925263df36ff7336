use loadgate_core::GatewayError;
use loadgate_core::crypto::constant_time_eq;
use loadgate_core::group::Group;

/// Match the presented proxy credential against the group's set.
/// Every candidate is compared in constant time and the loop never
/// exits early, so neither the match position nor the configured key
/// count leaks through timing.
pub fn authorize(group: &Group, presented: Option<&str>) -> Result<(), GatewayError> {
    let Some(presented) = presented else {
        return Err(GatewayError::AuthFailed("missing proxy key".into()));
    };
    let mut matched = false;
    for candidate in group.proxy_key_set() {
        matched |= constant_time_eq(candidate, presented);
    }
    if matched {
        Ok(())
    } else {
        Err(GatewayError::AuthFailed("invalid proxy key".into()))
    }
}
