use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

fn formatting_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)§[0-9A-FK-OR]").expect("formatting code regex is valid"))
}

/// Remove in-game colour and formatting codes (`§` followed by a code char).
///
/// A trailing `§` or one followed by an unknown code is kept.
pub fn strip_markup(text: &str) -> Cow<'_, str> {
    formatting_code_regex().replace_all(text, "")
}

/// A message template with a single `%s` slot for a display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template(String);

impl Template {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn render(&self, name: &str) -> String {
        self.0.replace("%s", name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Template {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}
