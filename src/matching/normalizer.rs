use lazy_static::lazy_static;
use std::collections::HashSet;
use unicode_normalization::UnicodeNormalization;

/// Organizational and legal words that carry no identifying signal.
pub const DEFAULT_STOPWORDS: &[&str] = &[
    "INC",
    "INCORPORATED",
    "LLC",
    "CORP",
    "CORPORATION",
    "FOUNDATION",
    "FDN",
    "FUND",
    "TRUST",
    "CHARITABLE",
    "CHARITY",
    "ASSOCIATION",
    "THE",
    "AND",
    "OF",
    "FOR",
];

lazy_static! {
    static ref DEFAULT_STOPWORD_SET: HashSet<String> =
        DEFAULT_STOPWORDS.iter().map(|w| w.to_string()).collect();
}

/// Canonicalizes organization names so registry entries and grant recipients
/// can be compared token by token.
///
/// The same instance (and therefore the same vocabulary) must be used for
/// both sides of a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalizer {
    stopwords: HashSet<String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            stopwords: DEFAULT_STOPWORD_SET.clone(),
        }
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stopword vocabulary. Words are canonicalized the same way
    /// names are, so "Inc." and "inc" both remove the `INC` token.
    pub fn with_stopwords<I, S>(stopwords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let stopwords = stopwords
            .into_iter()
            .flat_map(|word| tokens(word.as_ref()))
            .collect();
        Self { stopwords }
    }

    pub fn is_stopword(&self, token: &str) -> bool {
        self.stopwords.contains(token)
    }

    pub fn stopword_count(&self) -> usize {
        self.stopwords.len()
    }

    /// Normalize a raw organization name.
    ///
    /// Total and deterministic: any input, including the empty string,
    /// produces a (possibly empty) string. Applying it twice gives the same
    /// result as applying it once.
    pub fn normalize(&self, raw: &str) -> String {
        tokens(raw)
            .into_iter()
            .filter(|token| !self.stopwords.contains(token))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Normalize an optional name; absent names become the empty string.
    pub fn normalize_opt(&self, raw: Option<&str>) -> String {
        raw.map(|name| self.normalize(name)).unwrap_or_default()
    }
}

/// Upper-case, expand `&`, drop punctuation and split on whitespace.
fn tokens(raw: &str) -> Vec<String> {
    let cleaned: String = raw
        .replace('&', " AND ")
        .nfkd()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .flat_map(char::to_uppercase)
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();

    cleaned.split_whitespace().map(str::to_string).collect()
}
