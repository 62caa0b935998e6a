//! Generic wrapper for chunked producer responses.
//!
//! Chunking happens because of LLM context limits, not business requirements,
//! so business schemas never declare a chunking field. The envelope wraps an
//! ordered list of parts of one schema type; whether storage is wrapped is
//! recorded in [`RunMetadata`], never sniffed from payload shape. There is no
//! default merge: merge semantics differ per schema and are supplied by the
//! calling context.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PolicywatchError;

/// Metadata attached to every stored output. `schema_version` is recorded
/// once and never mutated, which is what makes replay deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub schema_version: String,
    pub prompt_version: String,
    pub is_chunked: bool,
    pub part_count: usize,
}

impl RunMetadata {
    pub fn new(schema_version: impl Into<String>, prompt_version: impl Into<String>, part_count: usize) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            schema_version: schema_version.into(),
            prompt_version: prompt_version.into(),
            is_chunked: part_count > 1,
            part_count,
        }
    }
}

// Wire shape for multi-part storage.
#[derive(Deserialize)]
struct ChunkedWire<T> {
    chunks: Vec<T>,
}

#[derive(Serialize)]
struct ChunkedWireRef<'a, T> {
    chunks: &'a [T],
}

/// Ordered parts of one business schema type. Always holds at least one part.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEnvelope<T> {
    parts: Vec<T>,
}

impl<T> ChunkEnvelope<T> {
    pub fn wrap(parts: Vec<T>) -> Result<Self, PolicywatchError> {
        if parts.is_empty() {
            return Err(PolicywatchError::Validation(
                "chunk envelope requires at least one part".to_string(),
            ));
        }
        Ok(Self { parts })
    }

    pub fn single(part: T) -> Self {
        Self { parts: vec![part] }
    }

    pub fn is_chunked(&self) -> bool {
        self.parts.len() > 1
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn parts(&self) -> &[T] {
        &self.parts
    }

    /// Unwrap a single-part envelope. Errors on multi-part: the caller must
    /// choose a merge strategy instead.
    pub fn into_single(self) -> Result<T, PolicywatchError> {
        if self.parts.len() != 1 {
            return Err(PolicywatchError::Validation(format!(
                "expected single part but got {}; supply a merge strategy",
                self.parts.len()
            )));
        }
        let mut parts = self.parts;
        Ok(parts.remove(0))
    }

    /// Fold the parts with a caller-supplied merge function.
    pub fn merge_with(self, f: impl FnMut(T, T) -> T) -> T {
        let mut iter = self.parts.into_iter();
        let first = iter.next().expect("envelope holds at least one part");
        iter.fold(first, f)
    }
}

impl<T: Serialize> ChunkEnvelope<T> {
    /// Serialize for storage: a single part is stored bare, multiple parts
    /// as `{"chunks": [...]}`.
    pub fn to_wire(&self) -> Result<String, PolicywatchError> {
        if self.parts.len() == 1 {
            Ok(serde_json::to_string(&self.parts[0])?)
        } else {
            Ok(serde_json::to_string(&ChunkedWireRef { chunks: &self.parts })?)
        }
    }
}

impl<T: DeserializeOwned> ChunkEnvelope<T> {
    /// Parse stored payload back into an envelope. The `is_chunked` flag comes
    /// from the stored metadata, so consumers never inspect payload shape.
    pub fn from_wire(raw: &str, is_chunked: bool) -> Result<Self, PolicywatchError> {
        if is_chunked {
            let wire: ChunkedWire<T> = serde_json::from_str(raw)?;
            Self::wrap(wire.chunks)
        } else {
            Ok(Self::single(serde_json::from_str(raw)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn wrap_rejects_empty() {
        let result = ChunkEnvelope::<Value>::wrap(vec![]);
        assert!(matches!(result, Err(PolicywatchError::Validation(_))));
    }

    #[test]
    fn single_part_round_trip() {
        let original = json!({"rating": true, "explanation": "clause removed"});
        let env = ChunkEnvelope::single(original.clone());
        assert!(!env.is_chunked());

        let wire = env.to_wire().unwrap();
        // Bare object on the wire, no chunks wrapper.
        assert!(!wire.contains("chunks"));

        let back = ChunkEnvelope::<Value>::from_wire(&wire, false).unwrap();
        assert_eq!(back.into_single().unwrap(), original);
    }

    #[test]
    fn multi_part_wire_shape() {
        let env = ChunkEnvelope::wrap(vec![json!({"a": 1}), json!({"a": 2})]).unwrap();
        assert!(env.is_chunked());
        assert_eq!(env.part_count(), 2);

        let wire = env.to_wire().unwrap();
        let back = ChunkEnvelope::<Value>::from_wire(&wire, true).unwrap();
        assert_eq!(back.parts().len(), 2);
        // Order preserved.
        assert_eq!(back.parts()[0], json!({"a": 1}));
    }

    #[test]
    fn into_single_rejects_multi_part() {
        let env = ChunkEnvelope::wrap(vec![json!(1), json!(2)]).unwrap();
        assert!(env.into_single().is_err());
    }

    #[test]
    fn merge_with_folds_in_order() {
        let env = ChunkEnvelope::wrap(vec![json!("a"), json!("b"), json!("c")]).unwrap();
        let merged = env.merge_with(|a, b| {
            json!(format!(
                "{}{}",
                a.as_str().unwrap_or_default(),
                b.as_str().unwrap_or_default()
            ))
        });
        assert_eq!(merged, json!("abc"));
    }

    #[test]
    fn metadata_flags_follow_part_count() {
        let single = RunMetadata::new("v1", "p3", 1);
        assert!(!single.is_chunked);
        let multi = RunMetadata::new("v1", "p3", 3);
        assert!(multi.is_chunked);
        assert_eq!(multi.part_count, 3);
        assert_ne!(single.run_id, multi.run_id);
    }
}
