use std::collections::BTreeSet;
use strsim::normalized_levenshtein;

/// Token-based scores are discounted slightly so that only an identical
/// string can reach a perfect score.
const TOKEN_SCALE: f64 = 0.95;

/// Similarity between two normalized names on a 0-100 scale.
///
/// Takes the best of a plain edit ratio, a token-sort ratio (word order
/// ignored) and a token-set ratio (shared words compared separately from the
/// leftovers). Symmetric, deterministic and 100 only for identical inputs.
pub fn token_score(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 100.0;
    }

    let base = ratio(a, b);
    let sorted = token_sort_ratio(a, b) * TOKEN_SCALE;
    let set = token_set_ratio(a, b) * TOKEN_SCALE;

    base.max(sorted).max(set).clamp(0.0, 100.0)
}

/// Edit-distance ratio of two strings, scaled to 0-100.
pub fn ratio(a: &str, b: &str) -> f64 {
    normalized_levenshtein(a, b) * 100.0
}

/// Ratio after sorting each side's tokens, so word order does not matter.
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    ratio(&sorted_tokens(a), &sorted_tokens(b))
}

/// Ratio that rewards one name's tokens being contained in the other's.
///
/// The shared tokens form a common stem; each side's remaining tokens are
/// appended to it and the best pairwise ratio among the three strings wins.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let left: BTreeSet<&str> = a.split_whitespace().collect();
    let right: BTreeSet<&str> = b.split_whitespace().collect();

    let common = join(left.intersection(&right));
    let left_only = join(left.difference(&right));
    let right_only = join(right.difference(&left));

    let with_left = combine(&common, &left_only);
    let with_right = combine(&common, &right_only);

    let mut best = ratio(&with_left, &with_right);
    if !common.is_empty() {
        best = best
            .max(ratio(&common, &with_left))
            .max(ratio(&common, &with_right));
    }
    best
}

fn sorted_tokens(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

fn join<'a>(tokens: impl Iterator<Item = &'a &'a str>) -> String {
    tokens.copied().collect::<Vec<_>>().join(" ")
}

fn combine(stem: &str, rest: &str) -> String {
    match (stem.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (false, true) => stem.to_string(),
        (false, false) => format!("{} {}", stem, rest),
    }
}
