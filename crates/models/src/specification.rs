use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hash::{ContentHasher, KEYWORD_DIGITS};
use crate::{Driver, Id, KeywordsUpload, ServerError};

fn default_protocols() -> Value {
    Value::Object(Default::default())
}

/// Input form of a leaf (single-point) specification. Keywords may be given
/// inline or by id; `basis` is normalized so that the empty string means
/// "no basis".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcSpecificationInput {
    pub program: String,
    pub driver: Driver,
    pub method: String,
    #[serde(default)]
    pub basis: Option<String>,
    #[serde(default)]
    pub keywords: KeywordsUpload,
    #[serde(default = "default_protocols")]
    pub protocols: Value,
}

impl QcSpecificationInput {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.program.trim().is_empty() {
            return Err(ServerError::InvalidPayload(
                "specification program must not be empty".to_string(),
            ));
        }
        if self.method.trim().is_empty() {
            return Err(ServerError::InvalidPayload(
                "specification method must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// The stored, deduplicated form of a leaf specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcSpecification {
    pub id: Id,
    pub program: String,
    pub driver: Driver,
    pub method: String,
    pub basis: Option<String>,
    pub keywords_id: Id,
    pub protocols: Value,
}

impl QcSpecification {
    /// The dedup hash over the full normalized tuple (with keywords already
    /// resolved to an id).
    pub fn tuple_hash(
        program: &str,
        driver: Driver,
        method: &str,
        basis: Option<&str>,
        keywords_id: Id,
        protocols: &Value,
    ) -> String {
        let mut h = ContentHasher::new();
        h.str(program)
            .str(&format!("{driver:?}").to_lowercase())
            .str(method)
            .str(basis.unwrap_or(""))
            .int(keywords_id.0);
        h.json(protocols, KEYWORD_DIGITS);
        h.finish()
    }
}

/// Lowercase + trim a program/method/basis/tag-like field.
pub fn normalize_name(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Normalize a basis: lowercased, trimmed; empty becomes None.
pub fn normalize_basis(basis: Option<&str>) -> Option<String> {
    match basis {
        None => None,
        Some(b) => {
            let b = normalize_name(b);
            if b.is_empty() {
                None
            } else {
                Some(b)
            }
        }
    }
}

/// Input form of an optimization specification, wrapping the QC
/// specification that evaluates gradients for the optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationSpecificationInput {
    pub program: String,
    pub qc_specification: QcSpecificationInput,
    #[serde(default)]
    pub keywords: Value,
    #[serde(default = "default_protocols")]
    pub protocols: Value,
}

impl OptimizationSpecificationInput {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.program.trim().is_empty() {
            return Err(ServerError::InvalidPayload(
                "optimization program must not be empty".to_string(),
            ));
        }
        self.qc_specification.validate()
    }
}

/// Stored form of an optimization specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSpecification {
    pub id: Id,
    pub program: String,
    pub qc_specification_id: Id,
    pub keywords: Value,
    pub protocols: Value,
}

impl OptimizationSpecification {
    pub fn tuple_hash(
        program: &str,
        qc_specification_id: Id,
        keywords: &Value,
        protocols: &Value,
    ) -> String {
        let mut h = ContentHasher::new();
        h.str(program).int(qc_specification_id.0);
        h.json(keywords, KEYWORD_DIGITS);
        h.json(protocols, KEYWORD_DIGITS);
        h.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn basis_normalization() {
        assert_eq!(normalize_basis(Some("6-31G")), Some("6-31g".to_string()));
        assert_eq!(normalize_basis(Some("")), None);
        assert_eq!(normalize_basis(Some("  ")), None);
        assert_eq!(normalize_basis(None), None);
    }

    #[test]
    fn tuple_hash_separates_fields() {
        let p = json!({});
        let a = QcSpecification::tuple_hash("psi4", Driver::Energy, "b3lyp", Some("6-31g"), Id(1), &p);
        let b = QcSpecification::tuple_hash("psi4", Driver::Energy, "b3lyp", None, Id(1), &p);
        let c =
            QcSpecification::tuple_hash("psi4", Driver::Gradient, "b3lyp", Some("6-31g"), Id(1), &p);
        assert_ne!(a, b);
        assert_ne!(a, c);

        let a2 =
            QcSpecification::tuple_hash("psi4", Driver::Energy, "b3lyp", Some("6-31g"), Id(1), &p);
        assert_eq!(a, a2);
    }
}
