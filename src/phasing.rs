// Phasing & scheduling policy (spec §4.11): deterministic per-device
// rollout percentage, derived the same way `io::HashingReader` derives a
// download's checksum -- one `openssl::sha::Sha256` pass, no allocation
// beyond the input itself.

use openssl::sha::Sha256;

/// Maps `(machine_id, channel, target_build)` onto `0..101`, stable across
/// runs and hosts.  A candidate is eligible for this device iff its
/// `phased_percentage >= stable_hash(...)`.
pub fn stable_hash(machine_id: &str, channel: &str, target_build: &str) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(machine_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(channel.as_bytes());
    hasher.update(b"\0");
    hasher.update(target_build.as_bytes());
    let digest = hasher.finish();
    let mut first8 = [0u8; 8];
    first8.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(first8) % 101) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_hash_is_deterministic() {
        let a = stable_hash("machine-1", "stable", "150");
        let b = stable_hash("machine-1", "stable", "150");
        assert_eq!(a, b);
    }

    #[test]
    fn test_stable_hash_in_range() {
        for i in 0..200 {
            let h = stable_hash(&format!("m{i}"), "stable", "150");
            assert!(h <= 100);
        }
    }

    #[test]
    fn test_stable_hash_varies_by_input() {
        let a = stable_hash("machine-1", "stable", "150");
        let b = stable_hash("machine-2", "stable", "150");
        let c = stable_hash("machine-1", "daily", "150");
        // not strictly guaranteed to differ, but extraordinarily likely
        assert!(a != b || a != c);
    }
}
