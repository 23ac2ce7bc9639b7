/// Normalize raw text into lowercase alphanumeric tokens joined by single
/// spaces.
///
/// Punctuation attached to either end of a word is split off and dropped;
/// tokens that still contain non-alphanumeric characters after that are
/// discarded entirely.
///
/// # Examples
///
/// ```
/// use streamrank::normalizer::normalize;
///
/// assert_eq!(normalize("Foo bar!"), "foo bar");
/// assert_eq!(normalize("  (Hello),   WORLD  "), "hello world");
/// assert_eq!(normalize("e-mail me"), "me");
/// ```
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for raw in text.split_whitespace() {
        let lowered = raw.to_lowercase();
        let token = lowered.trim_matches(|c: char| !c.is_alphanumeric());
        if token.is_empty() || !token.chars().all(char::is_alphanumeric) {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(token);
    }
    out
}

/// Normalize every non-blank line of a raw batch.
///
/// Blank lines are dropped. Lines that contain text but normalize to nothing
/// (punctuation only) are kept as empty documents so that document counts
/// follow the non-blank line count of the source.
pub fn normalize_batch(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(normalize)
        .collect()
}
