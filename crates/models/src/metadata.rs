use serde::{Deserialize, Serialize};

/// Result of a batch insertion: for each input index, whether it was newly
/// inserted, matched an existing row, or failed. Indices correlate with the
/// input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsertMetadata {
    pub inserted_idx: Vec<usize>,
    pub existing_idx: Vec<usize>,
    /// (input index, error message) pairs.
    pub errors: Vec<(usize, String)>,
}

impl InsertMetadata {
    pub fn inserted(idx: usize) -> Self {
        Self {
            inserted_idx: vec![idx],
            ..Default::default()
        }
    }

    pub fn n_inserted(&self) -> usize {
        self.inserted_idx.len()
    }
    pub fn n_existing(&self) -> usize {
        self.existing_idx.len()
    }
    pub fn n_errors(&self) -> usize {
        self.errors.len()
    }

    pub fn error_idx(&self) -> Vec<usize> {
        self.errors.iter().map(|(i, _)| *i).collect()
    }

    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error_string(&self) -> String {
        self.errors
            .iter()
            .map(|(i, msg)| format!("[{i}] {msg}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn mark_inserted(&mut self, idx: usize) {
        self.inserted_idx.push(idx);
    }
    pub fn mark_existing(&mut self, idx: usize) {
        self.existing_idx.push(idx);
    }
    pub fn mark_error(&mut self, idx: usize, msg: impl Into<String>) {
        self.errors.push((idx, msg.into()));
    }
}

/// Result of a batch status-changing operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateMetadata {
    pub updated_idx: Vec<usize>,
    pub errors: Vec<(usize, String)>,
}

impl UpdateMetadata {
    pub fn n_updated(&self) -> usize {
        self.updated_idx.len()
    }

    pub fn error_idx(&self) -> Vec<usize> {
        self.errors.iter().map(|(i, _)| *i).collect()
    }

    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn mark_updated(&mut self, idx: usize) {
        self.updated_idx.push(idx);
    }
    pub fn mark_error(&mut self, idx: usize, msg: impl Into<String>) {
        self.errors.push((idx, msg.into()));
    }
}

/// Pagination envelope for query operations: how many rows matched overall
/// versus how many this page returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub n_found: usize,
    pub n_returned: usize,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_metadata_counts() {
        let mut meta = InsertMetadata::default();
        meta.mark_inserted(0);
        meta.mark_existing(1);
        meta.mark_error(2, "bad molecule");

        assert_eq!(meta.n_inserted(), 1);
        assert_eq!(meta.n_existing(), 1);
        assert_eq!(meta.error_idx(), vec![2]);
        assert!(!meta.success());
        assert_eq!(meta.error_string(), "[2] bad molecule");
    }

    #[test]
    fn metadata_serializes_stably() {
        let mut meta = InsertMetadata::default();
        meta.mark_inserted(0);
        meta.mark_existing(1);

        insta::assert_json_snapshot!(meta, @r#"
        {
          "inserted_idx": [
            0
          ],
          "existing_idx": [
            1
          ],
          "errors": []
        }"#);
    }
}
