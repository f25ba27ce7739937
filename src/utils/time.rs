use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Wall-clock milliseconds since the unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Absolute expiry deadline for a TTL given in seconds.
pub(crate) fn expiry_from_ttl(
    ttl_secs: Option<u64>,
    now_ms: u64,
) -> Option<u64> {
    ttl_secs.filter(|ttl| *ttl > 0).map(|ttl| now_ms.saturating_add(ttl.saturating_mul(1000)))
}

/// Remaining whole seconds until `expires_at`, never negative.
pub(crate) fn remaining_ttl_secs(
    expires_at: Option<u64>,
    now_ms: u64,
) -> Option<i64> {
    expires_at.map(|deadline| (deadline.saturating_sub(now_ms) / 1000) as i64)
}
