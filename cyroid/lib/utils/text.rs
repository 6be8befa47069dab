//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Maximum length of a persisted range error message.
pub const RANGE_ERROR_MAX_LEN: usize = 1000;

/// Maximum length of a persisted router error message.
pub const ROUTER_ERROR_MAX_LEN: usize = 500;

/// Maximum length of a persisted VM error message.
pub const VM_ERROR_MAX_LEN: usize = 1000;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Truncates `message` to at most `max_chars` characters, respecting char boundaries.
///
/// ## Examples
///
/// ```
/// use cyroid::utils::truncate_message;
///
/// assert_eq!(truncate_message("abcdef", 3), "abc");
/// assert_eq!(truncate_message("ab", 3), "ab");
/// ```
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    message.chars().take(max_chars).collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_message_multibyte() {
        let message = "é".repeat(600);
        let truncated = truncate_message(&message, ROUTER_ERROR_MAX_LEN);
        assert_eq!(truncated.chars().count(), 500);
    }
}
