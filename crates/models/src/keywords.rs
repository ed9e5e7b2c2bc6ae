use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::hash::{ContentHasher, KEYWORD_DIGITS};
use crate::Id;

/// A bag of program-option key/value pairs. Keyword sets are immutable and
/// content-addressed by [`KeywordSet::canonical_hash`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordSet {
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl KeywordSet {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Normalized copy: keyword names lowercased and trimmed. Applied before
    /// storage so the stored form and the hash agree.
    pub fn normalized(&self) -> Self {
        let values = self
            .values
            .iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v.clone()))
            .collect();
        Self { values }
    }

    /// Canonical hash: sorted, lowercased keys; floats rounded to 1e-10.
    pub fn canonical_hash(&self) -> String {
        let mut h = ContentHasher::new();
        let normalized = self.normalized();
        h.int(normalized.values.len() as i64);
        for (k, v) in &normalized.values {
            h.str(k);
            h.json(v, KEYWORD_DIGITS);
        }
        h.finish()
    }
}

/// A keyword set reference in a specification input: an existing row id or
/// an inline payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeywordsUpload {
    Id(Id),
    New(KeywordSet),
}

impl Default for KeywordsUpload {
    fn default() -> Self {
        KeywordsUpload::New(KeywordSet::default())
    }
}

impl From<KeywordSet> for KeywordsUpload {
    fn from(k: KeywordSet) -> Self {
        KeywordsUpload::New(k)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn kws(pairs: &[(&str, Value)]) -> KeywordSet {
        KeywordSet {
            values: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn hash_case_folds_names() {
        let a = kws(&[("Scf_Type", json!("df")), ("e_convergence", json!(1e-7))]);
        let b = kws(&[("scf_type", json!("df")), ("E_CONVERGENCE", json!(1e-7))]);
        assert_eq!(a.canonical_hash(), b.canonical_hash());
    }

    #[test]
    fn hash_rounds_float_values() {
        let a = kws(&[("thresh", json!(1.00000000001e-4))]);
        let b = kws(&[("thresh", json!(1e-4))]);
        assert_eq!(a.canonical_hash(), b.canonical_hash());

        let c = kws(&[("thresh", json!(2e-4))]);
        assert_ne!(a.canonical_hash(), c.canonical_hash());
    }

    #[test]
    fn hash_distinguishes_values() {
        let a = kws(&[("maxiter", json!(100))]);
        let b = kws(&[("maxiter", json!(200))]);
        assert_ne!(a.canonical_hash(), b.canonical_hash());
    }
}
