use syntect::easy::HighlightLines;
use syntect::highlighting::{Theme, ThemeSet};
use syntect::parsing::SyntaxSet;
use syntect::util::{as_24_bit_terminal_escaped, LinesWithEndings};

/// Terminal SQL highlighting for the editor buffer and assistant code blocks
pub struct SqlHighlighter {
    syntax_set: SyntaxSet,
    theme: Theme,
}

impl SqlHighlighter {
    pub fn new() -> Self {
        let syntax_set = SyntaxSet::load_defaults_newlines();
        let mut theme_set = ThemeSet::load_defaults();
        // Dark theme suits most terminals
        let theme = theme_set
            .themes
            .remove("base16-ocean.dark")
            .unwrap_or_default();
        Self { syntax_set, theme }
    }

    /// Returns the text with 24-bit ANSI escapes, one input line per output line.
    /// Lines that fail to highlight are passed through untouched.
    pub fn highlight(&self, text: &str) -> String {
        let syntax = self
            .syntax_set
            .find_syntax_by_extension("sql")
            .unwrap_or_else(|| self.syntax_set.find_syntax_plain_text());
        let mut highlighter = HighlightLines::new(syntax, &self.theme);

        let mut out = String::with_capacity(text.len() * 2);
        for line in LinesWithEndings::from(text) {
            match highlighter.highlight_line(line, &self.syntax_set) {
                Ok(ranges) => out.push_str(&as_24_bit_terminal_escaped(&ranges[..], false)),
                Err(_) => out.push_str(line),
            }
        }
        // Reset so trailing output is not tinted
        out.push_str("\x1b[0m");
        out
    }
}

impl Default for SqlHighlighter {
    fn default() -> Self {
        Self::new()
    }
}
