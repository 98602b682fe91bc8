/// Separator used by legacy list columns.
pub const LIST_SEPARATOR: &str = " | ";

/// Replaces every token exactly equal to `target` in a separator-delimited
/// list, preserving order and all other tokens. Substring matches are left
/// alone: masking "abc" must not touch "abc2".
pub fn mask_token_list(value: &str, target: &str, sentinel: &str) -> String {
    value
        .split(LIST_SEPARATOR)
        .map(|token| if token == target { sentinel } else { token })
        .collect::<Vec<_>>()
        .join(LIST_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_exact_tokens_only() {
        assert_eq!(
            mask_token_list("id1 | id2 | id3", "id2", "DELETED_USER"),
            "id1 | DELETED_USER | id3"
        );
    }

    #[test]
    fn substring_tokens_are_untouched() {
        assert_eq!(
            mask_token_list("id2 | id2x | xid2", "id2", "DELETED_USER"),
            "DELETED_USER | id2x | xid2"
        );
    }

    #[test]
    fn single_token_list() {
        assert_eq!(mask_token_list("id2", "id2", "X"), "X");
        assert_eq!(mask_token_list("id9", "id2", "X"), "id9");
    }

    #[test]
    fn repeated_tokens_are_all_masked() {
        assert_eq!(mask_token_list("a | b | a", "a", "X"), "X | b | X");
    }
}
