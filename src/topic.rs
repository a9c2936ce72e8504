//! AMQP topic routing-key matching: `*` matches exactly one dot-separated
//! segment, `#` matches zero or more segments. Pure logic, no broker
//! dependency, per spec.md §4.6 and the testable property in §8.

/// Returns true if `routing_key` matches `pattern` under AMQP topic rules.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let key_segments: Vec<&str> = routing_key.split('.').collect();
    match_segments(&pattern_segments, &key_segments)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some(&"#") => {
            if pattern.len() == 1 {
                return true;
            }
            // `#` can consume zero or more segments; try every split point.
            for i in 0..=key.len() {
                if match_segments(&pattern[1..], &key[i..]) {
                    return true;
                }
            }
            false
        }
        Some(&"*") => {
            if key.is_empty() {
                return false;
            }
            match_segments(&pattern[1..], &key[1..])
        }
        Some(seg) => match key.first() {
            Some(k) if k == seg => match_segments(&pattern[1..], &key[1..]),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_single_segment() {
        assert!(matches("a.*", "a.b"));
        assert!(!matches("a.*", "a.b.c"));
    }

    #[test]
    fn hash_matches_zero_or_more() {
        assert!(matches("a.#", "a"));
        assert!(matches("a.#", "a.b"));
        assert!(matches("a.#", "a.b.c"));
    }

    #[test]
    fn literal_segments_must_match_exactly() {
        assert!(matches("user.created", "user.created"));
        assert!(!matches("user.created", "user.updated"));
    }

    #[test]
    fn bare_hash_matches_everything() {
        assert!(matches("#", "a.b.c"));
        assert!(matches("#", "anything"));
    }

    #[test]
    fn mixed_wildcards() {
        assert!(matches("*.orders.#", "eu.orders.created.v2"));
        assert!(!matches("*.orders.#", "orders.created"));
    }
}
