//! Alert identity: message normalization and dedup key derivation.
//!
//! Two occurrences fold into the same record when service, exception kind,
//! environment and *normalized* message agree. Normalization strips the parts of a
//! message that vary between occurrences of one fault (ids, counters, addresses).

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("valid uuid pattern")
});
static HEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b0x[0-9a-f]+\b").expect("valid hex pattern"));
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("valid number pattern"));
static SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// Lowercases, masks ids and numbers, and collapses whitespace.
pub fn normalize_message(message: &str) -> String {
    let lowered = message.trim().to_lowercase();
    let masked = UUID_RE.replace_all(&lowered, "<uuid>");
    let masked = HEX_RE.replace_all(&masked, "<hex>");
    let masked = NUMBER_RE.replace_all(&masked, "<n>");
    SPACE_RE.replace_all(&masked, " ").into_owned()
}

/// Stable hex digest of (service, exception kind, normalized message, environment).
pub fn dedup_key(service: &str, exception_kind: &str, message: &str, environment: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [
        service.trim().to_lowercase(),
        exception_kind.trim().to_string(),
        normalize_message(message),
        environment.trim().to_lowercase(),
    ] {
        hasher.update(part.as_bytes());
        // unit separator keeps ("ab", "c") and ("a", "bc") apart
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_and_ids_are_masked() {
        assert_eq!(normalize_message("dup id 42"), "dup id <n>");
        assert_eq!(
            normalize_message("User 3f2b9c1e-8d4a-4b7e-9c2d-1a2b3c4d5e6f not found"),
            "user <uuid> not found"
        );
        assert_eq!(normalize_message("bad ptr 0xDEADBEEF"), "bad ptr <hex>");
        assert_eq!(normalize_message("  too   many\tspaces "), "too many spaces");
    }

    #[test]
    fn equivalent_occurrences_share_a_key() {
        let a = dedup_key("api", "KeyError", "dup id 42", "production");
        let b = dedup_key("API", "KeyError", "dup id 43", "Production");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn distinct_faults_get_distinct_keys() {
        let base = dedup_key("api", "KeyError", "dup id 42", "production");
        assert_ne!(base, dedup_key("worker", "KeyError", "dup id 42", "production"));
        assert_ne!(base, dedup_key("api", "ValueError", "dup id 42", "production"));
        assert_ne!(base, dedup_key("api", "KeyError", "missing id 42", "production"));
        assert_ne!(base, dedup_key("api", "KeyError", "dup id 42", "staging"));
    }

    #[test]
    fn field_boundaries_matter() {
        assert_ne!(dedup_key("ab", "c", "m", "e"), dedup_key("a", "bc", "m", "e"));
    }
}
