/// Strips every character outside `[A-Za-z0-9_ -]`.
///
/// Titles and descriptions end up in the container runtime's argument list, so
/// this runs before anything leaves the process.
pub fn sanitize_label(input: &str) -> String {
    input.chars().filter(|c| is_allowed(*c)).collect()
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn strips_punctuation() {
        assert_eq!(sanitize_label("Jam #1!"), "Jam 1");
        assert_eq!(sanitize_label("a-b_c"), "a-b_c");
    }

    #[test_timeout::timeout]
    fn strips_shell_metacharacters() {
        assert_eq!(
            sanitize_label("x\"; rm -rf / $(id) `uname`"),
            "x rm -rf  id uname"
        );
    }

    #[test_timeout::timeout]
    fn strips_non_ascii_word_characters() {
        assert_eq!(sanitize_label("café\ttime\n"), "caftime");
    }

    #[test_timeout::timeout]
    fn output_only_contains_allowed_characters() {
        let input: String = (0u8..=127).map(char::from).collect::<String>() + "ünï¢ødé";
        let output = sanitize_label(&input);
        assert!(output.chars().all(is_allowed));
        assert_eq!(output.len(), 26 * 2 + 10 + 3);
    }
}
