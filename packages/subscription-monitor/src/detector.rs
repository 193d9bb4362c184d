//! Change detection over extracted field sets.
//!
//! The detector is pure: it receives the prior fingerprint as input and never
//! touches the store. Callers look the prior fingerprint up and hold the
//! per-subscription lock while they do.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::types::{FieldSet, FieldValue, Fingerprint};

/// Outcome of classifying one successful extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub fingerprint: Fingerprint,
    pub is_new: bool,
}

/// Normalized value used as digest input.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum NormalizedValue {
    Text(String),
    List(Vec<String>),
}

/// Fingerprints field sets and decides whether content is new.
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    /// Fields excluded from the digest (e.g. extraction-time metadata)
    ignored_fields: BTreeSet<String>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignored_field(mut self, name: impl Into<String>) -> Self {
        self.ignored_fields.insert(name.into());
        self
    }

    pub fn with_ignored_fields<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_fields.extend(names.into_iter().map(Into::into));
        self
    }

    /// Normalize a field set into sorted pairs.
    ///
    /// Whitespace runs collapse to a single space and are trimmed. Fields and
    /// list items that normalize to nothing are dropped. List order is kept.
    /// Names that collide after normalization are ordered by value.
    pub fn normalize(&self, fields: &FieldSet) -> Vec<(String, NormalizedValue)> {
        let mut normalized: Vec<(String, NormalizedValue)> = fields
            .iter()
            .filter_map(|(name, value)| {
                let name = collapse_whitespace(name);
                if name.is_empty() || self.ignored_fields.contains(&name) {
                    return None;
                }

                let value = match value {
                    FieldValue::Text(text) => {
                        let text = collapse_whitespace(text);
                        if text.is_empty() {
                            return None;
                        }
                        NormalizedValue::Text(text)
                    }
                    FieldValue::List(items) => {
                        let items: Vec<String> = items
                            .iter()
                            .map(|item| collapse_whitespace(item))
                            .filter(|item| !item.is_empty())
                            .collect();
                        if items.is_empty() {
                            return None;
                        }
                        NormalizedValue::List(items)
                    }
                };

                Some((name, value))
            })
            .collect();

        normalized.sort();
        normalized
    }

    /// Deterministic digest of the normalized field set.
    pub fn fingerprint(&self, fields: &FieldSet) -> Fingerprint {
        let mut hasher = Sha256::new();

        for (name, value) in self.normalize(fields) {
            hasher.update(b"f");
            write_str(&mut hasher, &name);
            match value {
                NormalizedValue::Text(text) => {
                    hasher.update(b"s");
                    write_str(&mut hasher, &text);
                }
                NormalizedValue::List(items) => {
                    hasher.update(b"l");
                    hasher.update((items.len() as u64).to_be_bytes());
                    for item in &items {
                        write_str(&mut hasher, item);
                    }
                }
            }
        }

        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Classify against the most recent prior successful fingerprint.
    pub fn classify(&self, fields: &FieldSet, prior: Option<&Fingerprint>) -> Detection {
        let fingerprint = self.fingerprint(fields);
        let is_new = is_new_content(&fingerprint, prior);

        tracing::trace!(
            fingerprint = %fingerprint,
            prior = ?prior.map(Fingerprint::as_str),
            is_new,
            "Classified extraction"
        );

        Detection {
            fingerprint,
            is_new,
        }
    }
}

/// Fingerprint with the default detector (no ignored fields).
pub fn fingerprint(fields: &FieldSet) -> Fingerprint {
    ChangeDetector::default().fingerprint(fields)
}

/// New when there is no prior successful fingerprint or it differs.
pub fn is_new_content(fingerprint: &Fingerprint, prior: Option<&Fingerprint>) -> bool {
    prior.map_or(true, |prior| prior != fingerprint)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Length-prefixed so that field boundaries cannot be forged by content.
fn write_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn list(items: &[&str]) -> FieldValue {
        FieldValue::List(items.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_first_extraction_is_new() {
        let detector = ChangeDetector::new();
        let fields = FieldSet::new().with("title", "X");

        let detection = detector.classify(&fields, None);

        assert!(detection.is_new);
        assert_eq!(detection.fingerprint, fingerprint(&fields));
    }

    #[test]
    fn test_identical_content_is_not_new() {
        let detector = ChangeDetector::new();
        let fields = FieldSet::new().with("title", "X");
        let d1 = detector.fingerprint(&fields);

        let detection = detector.classify(&FieldSet::new().with("title", "X"), Some(&d1));

        assert!(!detection.is_new);
        assert_eq!(detection.fingerprint, d1);
    }

    #[test]
    fn test_changed_content_is_new() {
        let detector = ChangeDetector::new();
        let d1 = detector.fingerprint(&FieldSet::new().with("title", "X"));

        let detection = detector.classify(&FieldSet::new().with("title", "Y"), Some(&d1));

        assert!(detection.is_new);
        assert_ne!(detection.fingerprint, d1);
    }

    #[test]
    fn test_whitespace_variance_is_ignored() {
        let a = FieldSet::new().with("title", "Hello   world");
        let b = FieldSet::new().with("title", "  Hello\n\tworld ");
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_case_is_significant() {
        let a = FieldSet::new().with("title", "Live");
        let b = FieldSet::new().with("title", "live");
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_sequence_order_is_significant() {
        let a = FieldSet::new().with("rows", list(&["a", "b"]));
        let b = FieldSet::new().with("rows", list(&["b", "a"]));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_text_and_single_item_list_differ() {
        let a = FieldSet::new().with("rows", "a");
        let b = FieldSet::new().with("rows", list(&["a"]));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_empty_fields_are_dropped() {
        let a = FieldSet::new().with("title", "X");
        let b = FieldSet::new()
            .with("title", "X")
            .with("subtitle", "   ")
            .with("rows", list(&["", " "]));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_ignored_fields_do_not_affect_fingerprint() {
        let detector = ChangeDetector::new().with_ignored_field("scraped_at");
        let a = FieldSet::new()
            .with("title", "X")
            .with("scraped_at", "2024-01-01T00:00:00Z");
        let b = FieldSet::new()
            .with("title", "X")
            .with("scraped_at", "2024-06-01T12:00:00Z");
        assert_eq!(detector.fingerprint(&a), detector.fingerprint(&b));
    }

    #[test]
    fn test_colliding_names_fingerprint_deterministically() {
        let fields = FieldSet::new().with("title", "A").with("title ", "B");
        let swapped = FieldSet::new().with(" title", "B").with("title", "A");
        let expected = fingerprint(&fields);

        for _ in 0..200 {
            assert_eq!(fingerprint(&fields.clone()), expected);
        }
        assert_eq!(fingerprint(&swapped), expected);
    }

    #[test]
    fn test_colliding_names_keep_both_values() {
        let both = FieldSet::new().with("title", "A").with("title ", "B");
        let one = FieldSet::new().with("title", "A");
        assert_ne!(fingerprint(&both), fingerprint(&one));
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let a = FieldSet::new().with("ab", "c");
        let b = FieldSet::new().with("a", "bc");
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    fn field_entries() -> impl Strategy<Value = Vec<(String, Vec<String>)>> {
        // Names may differ only by surrounding whitespace
        prop::collection::btree_map(
            "[ ]{0,1}[a-z]{1,3}[ \t]{0,1}",
            prop::collection::vec("[A-Za-z0-9]{1,6}", 0..4),
            0..6,
        )
        .prop_map(|map| map.into_iter().collect())
    }

    fn to_field_set(entries: &[(String, Vec<String>)]) -> FieldSet {
        entries
            .iter()
            .map(|(name, items)| {
                let value = if items.len() == 1 {
                    FieldValue::Text(items[0].clone())
                } else {
                    FieldValue::List(items.clone())
                };
                (name.clone(), value)
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_fingerprint_is_deterministic(entries in field_entries()) {
            let fields = to_field_set(&entries);
            let expected = fingerprint(&fields);
            for _ in 0..8 {
                // Rebuilding the map reshuffles its iteration order
                prop_assert_eq!(fingerprint(&to_field_set(&entries)), expected.clone());
            }
        }

        #[test]
        fn prop_field_order_does_not_matter(entries in field_entries()) {
            let forward = to_field_set(&entries);
            let mut reversed_entries = entries.clone();
            reversed_entries.reverse();
            let reversed = to_field_set(&reversed_entries);

            prop_assert_eq!(fingerprint(&forward), fingerprint(&reversed));
        }

        #[test]
        fn prop_reordering_a_sequence_changes_fingerprint(
            a in "[a-z]{1,6}",
            b in "[a-z]{1,6}",
        ) {
            prop_assume!(a != b);
            let forward = FieldSet::new().with("rows", vec![a.clone(), b.clone()]);
            let swapped = FieldSet::new().with("rows", vec![b, a]);

            prop_assert_ne!(fingerprint(&forward), fingerprint(&swapped));
        }
    }
}
