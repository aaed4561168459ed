// SPDX-License-Identifier: MIT OR Apache-2.0
//! Text analysis shared by indexing and query evaluation.

/// Extract lowercase alphanumeric tokens from text.
///
/// Punctuation splits tokens, so `"Einleitung."` and `"Einleitung"` analyze
/// identically.
#[must_use]
pub fn analyze(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Bounded Levenshtein distance: returns `None` when the distance exceeds
/// `max`, otherwise the distance.
#[must_use]
pub fn bounded_edit_distance(a: &str, b: &str, max: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max {
        return None;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        let mut row_min = current[0];
        for (j, &cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(current[j] + 1);
            row_min = row_min.min(current[j + 1]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut prev, &mut current);
    }
    (prev[b.len()] <= max).then_some(prev[b.len()])
}

/// The AUTO fuzziness ladder: no edits for short tokens, one edit for
/// mid-length tokens, two for long ones.
#[must_use]
pub fn auto_fuzziness(token: &str) -> usize {
    match token.chars().count() {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyze_lowercases_and_splits_on_punctuation() {
        assert_eq!(analyze("Hello, World!"), vec!["hello", "world"]);
        assert_eq!(analyze("Einleitung."), vec!["einleitung"]);
        assert!(analyze("").is_empty());
    }

    #[test]
    fn edit_distance_respects_bound() {
        assert_eq!(bounded_edit_distance("health", "health", 2), Some(0));
        assert_eq!(bounded_edit_distance("health", "helath", 2), Some(2));
        assert_eq!(bounded_edit_distance("health", "xyzzyx", 2), None);
    }

    #[test]
    fn fuzziness_ladder() {
        assert_eq!(auto_fuzziness("of"), 0);
        assert_eq!(auto_fuzziness("cats"), 1);
        assert_eq!(auto_fuzziness("climate"), 2);
    }
}
