//! Display helpers.

/// Shortens `text` to at most `length` characters.
///
/// Longer text is cut to `length - 3` characters and `...` is appended.
/// Below five characters there is no room for the ellipsis, so the text is
/// simply cut. A zero `length` yields an empty string.
pub fn trim(text: &str, length: usize) -> String {
    if length < 5 {
        return text.chars().take(length).collect();
    }
    if text.chars().count() <= length {
        return text.to_owned();
    }
    let mut short: String = text.chars().take(length - 3).collect();
    short.push_str("...");
    short
}

#[cfg(test)]
mod tests {
    use super::trim;
    use rstest::rstest;

    #[rstest]
    #[case("short", 40, "short")]
    #[case("abcdefghij", 8, "abcde...")]
    #[case("abcdefghij", 10, "abcdefghij")]
    #[case("abcdefghij", 4, "abcd")]
    #[case("abcdefghij", 0, "")]
    #[case("Ünïcödé title", 8, "Ünïcö...")]
    fn trims_to_length(#[case] text: &str, #[case] length: usize, #[case] expected: &str) {
        assert_eq!(trim(text, length), expected);
    }
}
