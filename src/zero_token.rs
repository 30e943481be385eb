//! Zero-token defense.
//!
//! Providers occasionally "succeed" with nothing usable: an empty stream, a
//! run of whitespace or punctuation, or an instant finish that smells like
//! a dropped connection. A completed attempt is classified here before it
//! is allowed to count as success. Short but alphanumeric responses ("4",
//! "No") are accepted.

use crate::error::ZeroTokenCategory;

/// Tunables for the classifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZeroTokenConfig {
    /// Minimum alphanumeric characters per token before content counts as
    /// meaningful. Default: 0.5.
    pub min_meaningful_ratio: f64,
    /// Instant-finish heuristic: fewer than this many tokens... Default: 3.
    pub instant_finish_tokens: usize,
    /// ...in under this many milliseconds. Default: 100.
    pub instant_finish_ms: u64,
}

impl Default for ZeroTokenConfig {
    fn default() -> Self {
        Self {
            min_meaningful_ratio: 0.5,
            instant_finish_tokens: 3,
            instant_finish_ms: 100,
        }
    }
}

/// Classify a completed attempt, or `None` when the content is acceptable.
pub fn classify(
    content: &str,
    token_count: usize,
    elapsed_ms: u64,
    config: &ZeroTokenConfig,
) -> Option<ZeroTokenCategory> {
    if token_count == 0 {
        return Some(ZeroTokenCategory::Network);
    }

    let meaningful = content.chars().filter(|c| c.is_alphanumeric()).count();

    if meaningful == 0
        && token_count < config.instant_finish_tokens
        && elapsed_ms < config.instant_finish_ms
    {
        return Some(ZeroTokenCategory::Transport);
    }

    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Some(ZeroTokenCategory::Encoding);
    }
    if meaningful == 0 {
        return Some(ZeroTokenCategory::Encoding);
    }
    if is_single_repeated_char(trimmed) {
        return Some(ZeroTokenCategory::Encoding);
    }
    if (meaningful as f64) / (token_count as f64) < config.min_meaningful_ratio {
        return Some(ZeroTokenCategory::Encoding);
    }

    None
}

/// Three or more copies of one character and nothing else.
fn is_single_repeated_char(content: &str) -> bool {
    let mut chars = content.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    content.chars().count() >= 3 && chars.all(|c| c == first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(content: &str, tokens: usize, elapsed: u64) -> Option<ZeroTokenCategory> {
        classify(content, tokens, elapsed, &ZeroTokenConfig::default())
    }

    #[test]
    fn test_zero_tokens_is_network() {
        assert_eq!(check("", 0, 500), Some(ZeroTokenCategory::Network));
    }

    #[test]
    fn test_whitespace_only_is_encoding() {
        assert_eq!(check("   \n\t  ", 4, 500), Some(ZeroTokenCategory::Encoding));
    }

    #[test]
    fn test_punctuation_only_is_encoding() {
        assert_eq!(check("...!?,;", 5, 500), Some(ZeroTokenCategory::Encoding));
    }

    #[test]
    fn test_single_repeated_char_is_encoding() {
        assert_eq!(check("aaaaaaa", 7, 500), Some(ZeroTokenCategory::Encoding));
    }

    #[test]
    fn test_low_meaningful_ratio_is_encoding() {
        // 2 alphanumeric characters over 10 tokens.
        assert_eq!(
            check("- - - - ok", 10, 500),
            Some(ZeroTokenCategory::Encoding)
        );
    }

    #[test]
    fn test_instant_garbage_is_transport() {
        assert_eq!(check("!", 1, 10), Some(ZeroTokenCategory::Transport));
    }

    #[test]
    fn test_slow_garbage_is_encoding_not_transport() {
        assert_eq!(check("!", 1, 500), Some(ZeroTokenCategory::Encoding));
    }

    #[test]
    fn test_short_alphanumeric_accepted() {
        assert_eq!(check("4", 1, 5), None);
        assert_eq!(check("No", 1, 5), None);
        assert_eq!(check("ok", 2, 20), None);
    }

    #[test]
    fn test_normal_content_accepted() {
        assert_eq!(check("Hello World", 5, 800), None);
    }

    #[test]
    fn test_repeated_char_needs_three() {
        // "aa" is short but not a degenerate repetition run.
        assert_eq!(check("aa", 1, 500), None);
    }
}
