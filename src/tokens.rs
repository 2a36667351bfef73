/// Deterministic token estimation (1 token ≈ 4 characters).
///
/// Used only for budgeting — no tokenizer dependency, no model calls.
/// `chars().count()` instead of `len()` avoids overestimating multi-byte
/// Unicode.
pub fn estimate(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        assert_eq!(estimate(""), 0);
    }

    #[test]
    fn test_basic() {
        assert_eq!(estimate("abcd"), 1);
        assert_eq!(estimate("abcde"), 2);
    }

    #[test]
    fn test_deterministic() {
        let s = "fn main() { println!(\"hello\"); }";
        assert_eq!(estimate(s), estimate(s));
    }

    #[test]
    fn test_additive_over_concatenation() {
        // Concatenation must stay within ±5% of the sum of parts.
        let a = "let x = 1;\n".repeat(40);
        let b = "return x * 2;\n".repeat(25);
        let sum = estimate(&a) + estimate(&b);
        let whole = estimate(&format!("{a}{b}"));
        let tolerance = sum / 20 + 1;
        assert!(whole.abs_diff(sum) <= tolerance, "whole={whole} sum={sum}");
    }

    #[test]
    fn test_multibyte_counts_chars_not_bytes() {
        // Four three-byte chars are still one estimated token.
        assert_eq!(estimate("日本語字"), 1);
    }
}
