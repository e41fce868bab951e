use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

fn encoder() -> Option<&'static CoreBPE> {
    static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODER
        .get_or_init(|| tiktoken_rs::cl100k_base().ok())
        .as_ref()
}

/// Count tokens with the cl100k_base encoding. Falls back to the usual
/// ~4-characters-per-token estimate if the encoder cannot be constructed.
///
/// Every threshold decision in the system goes through this one function so
/// prompt reality and budget checks agree.
pub fn count_tokens(text: &str) -> usize {
    match encoder() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.len() / 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_tokens_nonzero() {
        assert!(count_tokens("hello world") > 0);
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn test_count_tokens_monotonic_in_length() {
        let short = count_tokens("fn main() {}");
        let long = count_tokens(&"fn main() {}\n".repeat(50));
        assert!(long > short);
    }

    #[test]
    fn test_count_is_deterministic() {
        let text = "pub struct Component { id: ComponentId }";
        assert_eq!(count_tokens(text), count_tokens(text));
    }
}
