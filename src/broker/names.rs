//! Topic and channel name rules.
//!
//! A valid name is 1 to 64 characters of `[.a-zA-Z0-9_-]`, optionally
//! followed by the `#ephemeral` suffix (which counts toward the length).

pub const MAX_NAME_LENGTH: usize = 64;
pub const EPHEMERAL_SUFFIX: &str = "#ephemeral";

pub fn is_valid_topic_name(name: &str) -> bool {
    is_valid_name(name)
}

pub fn is_valid_channel_name(name: &str) -> bool {
    is_valid_name(name)
}

pub fn is_ephemeral(name: &str) -> bool {
    name.ends_with(EPHEMERAL_SUFFIX)
}

fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_and_ephemeral_names() {
        assert!(is_valid_topic_name("orders"));
        assert!(is_valid_topic_name("orders.v2_eu-west"));
        assert!(is_valid_channel_name("scratch#ephemeral"));
        assert!(is_ephemeral("scratch#ephemeral"));
        assert!(!is_ephemeral("scratch"));
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(!is_valid_topic_name(""));
        assert!(!is_valid_topic_name("#ephemeral"));
        assert!(!is_valid_topic_name("has space"));
        assert!(!is_valid_topic_name("slash/name"));
        assert!(!is_valid_topic_name("a#b"));
        assert!(!is_valid_topic_name(&"x".repeat(MAX_NAME_LENGTH + 1)));
        assert!(is_valid_topic_name(&"x".repeat(MAX_NAME_LENGTH)));
    }
}
