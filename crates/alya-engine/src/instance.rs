use std::time::{SystemTime, UNIX_EPOCH};

/// `{hostname}-{pid}-{nanos}` (§4.F), unique enough across a fleet without a
/// coordination round-trip.
pub fn new_instance_id() -> String {
    let hostname = hostname_or_unknown();
    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{hostname}-{pid}-{nanos}")
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_include_the_current_pid() {
        let id = new_instance_id();
        assert!(id.contains(&std::process::id().to_string()));
    }

    #[test]
    fn consecutive_instance_ids_differ() {
        let a = new_instance_id();
        let b = new_instance_id();
        assert_ne!(a, b);
    }
}
