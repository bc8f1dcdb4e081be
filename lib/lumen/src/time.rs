use std::time::SystemTime;

/// Returns the current unix timestamp in nanoseconds. Used to derive unique
/// temp file names.
#[inline]
pub fn timestamp_nanos() -> u128 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_nanos()
}
