//! Opaque identifier generation.
//!
//! Wire identifiers carry a stable type prefix (`run_`, `ses_`, `lnch_`)
//! followed by a random suffix. Consumers must treat them as opaque.

const ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

const SUFFIX_LEN: usize = 20;

fn prefixed(prefix: &str) -> String {
    format!("{}_{}", prefix, nanoid::nanoid!(SUFFIX_LEN, &ALPHABET))
}

pub fn run_id() -> String {
    prefixed("run")
}

pub fn session_id() -> String {
    prefixed("ses")
}

/// Runner registration ID ("launcher").
pub fn runner_id() -> String {
    prefixed("lnch")
}

pub fn callback_id() -> String {
    prefixed("cb")
}

pub fn hook_record_id() -> String {
    prefixed("hk")
}

/// Correlation ID attached to internal-error responses.
pub fn correlation_id() -> String {
    prefixed("corr")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes_are_stable() {
        assert!(run_id().starts_with("run_"));
        assert!(session_id().starts_with("ses_"));
        assert!(runner_id().starts_with("lnch_"));
        assert!(callback_id().starts_with("cb_"));
        assert!(hook_record_id().starts_with("hk_"));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = run_id();
        let b = run_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), "run_".len() + SUFFIX_LEN);
    }
}
