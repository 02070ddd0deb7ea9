use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const MAX_K8S_NAME_LENGTH: usize = 63;

pub struct ActionNaming;

impl ActionNaming {
    /// Deterministic name for the (action, node) pair, e.g. `reboot-gpu-a-001`.
    ///
    /// The name doubles as the mutual-exclusion key for that pair: at most one live
    /// instance exists because every run deletes its predecessor first.
    pub fn name(action: &str, node: &str) -> String {
        let name = format!("{action}-{node}").to_lowercase();
        if name.len() <= MAX_K8S_NAME_LENGTH {
            return name;
        }

        // keep it unique per node when truncating
        let mut hasher = DefaultHasher::new();
        node.hash(&mut hasher);
        let hash = format!("{:08x}", hasher.finish() & 0xffff_ffff);
        let keep = MAX_K8S_NAME_LENGTH - hash.len() - 1;
        let head = name[..keep].trim_end_matches('-');
        format!("{head}-{hash}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_are_action_dash_node() {
        assert_eq!(ActionNaming::name("reboot", "gpu-a-001"), "reboot-gpu-a-001");
        assert_eq!(ActionNaming::name("diagnose", "GPU-B-7"), "diagnose-gpu-b-7");
    }

    #[test]
    fn long_names_are_truncated_but_distinct() {
        let a = ActionNaming::name("healthcheck", &format!("{}-1", "x".repeat(70)));
        let b = ActionNaming::name("healthcheck", &format!("{}-2", "x".repeat(70)));
        assert!(a.len() <= MAX_K8S_NAME_LENGTH);
        assert!(a.starts_with("healthcheck-xxx"));
        assert_ne!(a, b);
    }
}
