//! The differ contract and the bundled JSON reference differ.
//!
//! The differ supplies every document-type-specific algorithm: diffing,
//! patching, three-way merging, content addressing, and migration of
//! older persisted documents. It is pure — no I/O, no concurrency — and
//! its failures never cross the engine boundary unclassified.

use deltasync_types::CommitRef;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Failures inside differ calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DifferError {
    /// A delta could not be applied.
    #[error("patch failed: {0}")]
    Patch(String),

    /// A three-way merge could not be computed.
    #[error("merge failed: {0}")]
    Merge(String),
}

/// A document together with the metadata of the commit that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitDoc<D> {
    /// The materialized document.
    pub doc: D,
    /// The commit's opaque edit metadata.
    pub metadata: Vec<u8>,
}

/// The outcome of a three-way merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult<D> {
    /// The merged document.
    pub doc: D,
    /// Metadata for the merge commit.
    pub metadata: Vec<u8>,
    /// When true the merge is advisory: shown to the user while
    /// disconnected but never committed.
    pub temp: bool,
}

/// Document-type-specific algorithms supplied by the host.
///
/// All methods are pure functions. `compute_ref` must be deterministic
/// and collision-resistant over the inputs observed in practice; every
/// client must derive the same ref from the same commit fields so that
/// independently computed merges converge on a single commit.
pub trait Differ: Send + Sync + 'static {
    /// The in-memory document type. The sync core never constrains it.
    type Doc: Clone + PartialEq + Send + Sync + 'static;

    /// Rewrite an older persisted document on load.
    fn migrate(&self, doc: Self::Doc, metadata: Vec<u8>) -> (Self::Doc, Vec<u8>);

    /// Compute the delta between two documents. `None` means no change.
    fn diff(&self, old: Option<&Self::Doc>, new: &Self::Doc) -> Option<Vec<u8>>;

    /// Apply a delta. `base` is `None` for root commits.
    fn patch(&self, base: Option<&Self::Doc>, delta: &[u8]) -> Result<Self::Doc, DifferError>;

    /// Derive the content-addressed ref of a commit from its fields.
    fn compute_ref(
        &self,
        base_ref: Option<&CommitRef>,
        merge_ref: Option<&CommitRef>,
        merge_base_ref: Option<&CommitRef>,
        delta: Option<&[u8]>,
        metadata: &[u8],
    ) -> CommitRef;

    /// Three-way merge. `base` is `None` when the heads share no
    /// ancestor.
    fn merge(
        &self,
        base: Option<&CommitDoc<Self::Doc>>,
        left: &CommitDoc<Self::Doc>,
        right: &CommitDoc<Self::Doc>,
    ) -> Result<MergeResult<Self::Doc>, DifferError>;
}

/// Length of the hex-encoded refs produced by [`JsonDiffer`].
pub const JSON_REF_LEN: usize = 16;

/// Reference differ over JSON documents.
///
/// Deltas are whole-document replacements encoded as MessagePack; merge
/// is a key-wise three-way union over object maps (a key changed on one
/// side wins over the base; changed on both sides, the right head
/// wins). Refs are SHA-256 over the commit fields, truncated to
/// [`JSON_REF_LEN`] hex characters.
///
/// Intended for tests and small documents; real applications plug in a
/// structural differ for their own document type.
#[derive(Debug, Clone, Default)]
pub struct JsonDiffer {
    advisory_merges: bool,
}

impl JsonDiffer {
    /// Create the standard differ: merges produce real merge commits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a differ whose merges are advisory (`temp = true`),
    /// modeling an application that only displays merged state while
    /// disconnected and commits nothing.
    pub fn advisory() -> Self {
        Self {
            advisory_merges: true,
        }
    }

    fn merge_values(base: Option<&Value>, left: &Value, right: &Value) -> Value {
        match (left, right) {
            (Value::Object(l), Value::Object(r)) => {
                let empty = serde_json::Map::new();
                let b = match base {
                    Some(Value::Object(b)) => b,
                    _ => &empty,
                };
                let mut out = serde_json::Map::new();
                let mut keys: Vec<&String> = l.keys().chain(r.keys()).collect();
                keys.sort();
                keys.dedup();
                for key in keys {
                    let bv = b.get(key);
                    let lv = l.get(key);
                    let rv = r.get(key);
                    let merged = match (lv, rv) {
                        (Some(lv), Some(rv)) => {
                            if lv == rv {
                                Some(lv.clone())
                            } else if Some(lv) == bv {
                                Some(rv.clone())
                            } else if Some(rv) == bv {
                                Some(lv.clone())
                            } else {
                                Some(Self::merge_values(bv, lv, rv))
                            }
                        }
                        // Present on one side only: kept unless that is
                        // exactly the base value and the other side
                        // deleted it.
                        (Some(lv), None) => {
                            if Some(lv) == bv {
                                None
                            } else {
                                Some(lv.clone())
                            }
                        }
                        (None, Some(rv)) => {
                            if Some(rv) == bv {
                                None
                            } else {
                                Some(rv.clone())
                            }
                        }
                        (None, None) => None,
                    };
                    if let Some(v) = merged {
                        out.insert(key.clone(), v);
                    }
                }
                Value::Object(out)
            }
            // Non-object conflict: right head wins, mirroring the
            // key-level rule.
            _ => right.clone(),
        }
    }
}

impl Differ for JsonDiffer {
    type Doc = Value;

    fn migrate(&self, doc: Value, metadata: Vec<u8>) -> (Value, Vec<u8>) {
        (doc, metadata)
    }

    fn diff(&self, old: Option<&Value>, new: &Value) -> Option<Vec<u8>> {
        if old == Some(new) {
            return None;
        }
        Some(rmp_serde::to_vec(new).expect("JSON value always encodes"))
    }

    fn patch(&self, _base: Option<&Value>, delta: &[u8]) -> Result<Value, DifferError> {
        rmp_serde::from_slice(delta).map_err(|e| DifferError::Patch(e.to_string()))
    }

    fn compute_ref(
        &self,
        base_ref: Option<&CommitRef>,
        merge_ref: Option<&CommitRef>,
        merge_base_ref: Option<&CommitRef>,
        delta: Option<&[u8]>,
        metadata: &[u8],
    ) -> CommitRef {
        let mut hasher = Sha256::new();
        hasher.update(b"deltasync-commit-v1");
        for field in [base_ref, merge_ref, merge_base_ref] {
            match field {
                Some(r) => {
                    hasher.update([1]);
                    hasher.update((r.as_str().len() as u64).to_le_bytes());
                    hasher.update(r.as_str().as_bytes());
                }
                None => hasher.update([0]),
            }
        }
        match delta {
            Some(d) => {
                hasher.update([1]);
                hasher.update((d.len() as u64).to_le_bytes());
                hasher.update(d);
            }
            None => hasher.update([0]),
        }
        hasher.update((metadata.len() as u64).to_le_bytes());
        hasher.update(metadata);

        let digest = hasher.finalize();
        let mut hex = String::with_capacity(JSON_REF_LEN);
        for byte in digest.iter().take(JSON_REF_LEN / 2) {
            hex.push_str(&format!("{:02x}", byte));
        }
        CommitRef::new(hex)
    }

    fn merge(
        &self,
        base: Option<&CommitDoc<Value>>,
        left: &CommitDoc<Value>,
        right: &CommitDoc<Value>,
    ) -> Result<MergeResult<Value>, DifferError> {
        let merged = Self::merge_values(base.map(|b| &b.doc), &left.doc, &right.doc);
        Ok(MergeResult {
            doc: merged,
            metadata: b"merge".to_vec(),
            temp: self.advisory_merges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> CommitDoc<Value> {
        CommitDoc {
            doc: v,
            metadata: vec![],
        }
    }

    #[test]
    fn diff_of_identical_docs_is_none() {
        let differ = JsonDiffer::new();
        let d = json!({"hello": "world"});
        assert!(differ.diff(Some(&d), &d).is_none());
    }

    #[test]
    fn patch_roundtrips_diff() {
        let differ = JsonDiffer::new();
        let old = json!({"hello": "world"});
        let new = json!({"hello": "world", "n": 1});
        let delta = differ.diff(Some(&old), &new).unwrap();
        let patched = differ.patch(Some(&old), &delta).unwrap();
        assert_eq!(patched, new);
    }

    #[test]
    fn patch_from_nothing_yields_root_doc() {
        let differ = JsonDiffer::new();
        let new = json!({"a": 1});
        let delta = differ.diff(None, &new).unwrap();
        assert_eq!(differ.patch(None, &delta).unwrap(), new);
    }

    #[test]
    fn patch_rejects_garbage() {
        let differ = JsonDiffer::new();
        assert!(matches!(
            differ.patch(None, &[0xC1]),
            Err(DifferError::Patch(_))
        ));
    }

    #[test]
    fn compute_ref_is_deterministic() {
        let differ = JsonDiffer::new();
        let base = CommitRef::new("base");
        let r1 = differ.compute_ref(Some(&base), None, None, Some(&[1, 2]), &[3]);
        let r2 = differ.compute_ref(Some(&base), None, None, Some(&[1, 2]), &[3]);
        assert_eq!(r1, r2);
        assert_eq!(r1.as_str().len(), JSON_REF_LEN);
    }

    #[test]
    fn compute_ref_depends_on_every_field() {
        let differ = JsonDiffer::new();
        let base = CommitRef::new("base");
        let merge = CommitRef::new("merge");
        let reference = differ.compute_ref(Some(&base), None, None, Some(&[1]), &[]);

        assert_ne!(
            reference,
            differ.compute_ref(None, None, None, Some(&[1]), &[])
        );
        assert_ne!(
            reference,
            differ.compute_ref(Some(&base), Some(&merge), None, Some(&[1]), &[])
        );
        assert_ne!(
            reference,
            differ.compute_ref(Some(&base), None, Some(&merge), Some(&[1]), &[])
        );
        assert_ne!(
            reference,
            differ.compute_ref(Some(&base), None, None, Some(&[2]), &[])
        );
        assert_ne!(
            reference,
            differ.compute_ref(Some(&base), None, None, Some(&[1]), &[9])
        );
    }

    #[test]
    fn compute_ref_field_boundaries_do_not_collide() {
        // ("ab", "c") must not hash like ("a", "bc").
        let differ = JsonDiffer::new();
        let r1 = differ.compute_ref(Some(&CommitRef::new("ab")), Some(&CommitRef::new("c")), None, None, &[]);
        let r2 = differ.compute_ref(Some(&CommitRef::new("a")), Some(&CommitRef::new("bc")), None, None, &[]);
        assert_ne!(r1, r2);
    }

    #[test]
    fn merge_unions_disjoint_keys() {
        let differ = JsonDiffer::new();
        let base = doc(json!({"hello": "world"}));
        let left = doc(json!({"hello": "world", "a": 1}));
        let right = doc(json!({"hello": "world", "b": 2}));

        let merged = differ.merge(Some(&base), &left, &right).unwrap();
        assert_eq!(merged.doc, json!({"hello": "world", "a": 1, "b": 2}));
        assert!(!merged.temp);
    }

    #[test]
    fn merge_conflicting_key_prefers_right() {
        let differ = JsonDiffer::new();
        let base = doc(json!({"k": 0}));
        let left = doc(json!({"k": 1}));
        let right = doc(json!({"k": 2}));

        let merged = differ.merge(Some(&base), &left, &right).unwrap();
        assert_eq!(merged.doc, json!({"k": 2}));
    }

    #[test]
    fn merge_respects_one_sided_delete() {
        let differ = JsonDiffer::new();
        let base = doc(json!({"keep": 1, "drop": 2}));
        let left = doc(json!({"keep": 1}));
        let right = doc(json!({"keep": 1, "drop": 2, "new": 3}));

        let merged = differ.merge(Some(&base), &left, &right).unwrap();
        assert_eq!(merged.doc, json!({"keep": 1, "new": 3}));
    }

    #[test]
    fn merge_without_base_unions_keys() {
        let differ = JsonDiffer::new();
        let left = doc(json!({"a": 1}));
        let right = doc(json!({"b": 2}));

        let merged = differ.merge(None, &left, &right).unwrap();
        assert_eq!(merged.doc, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merge_recurses_into_nested_objects() {
        let differ = JsonDiffer::new();
        let base = doc(json!({"o": {"x": 1}}));
        let left = doc(json!({"o": {"x": 1, "l": true}}));
        let right = doc(json!({"o": {"x": 1, "r": true}}));

        let merged = differ.merge(Some(&base), &left, &right).unwrap();
        assert_eq!(merged.doc, json!({"o": {"x": 1, "l": true, "r": true}}));
    }

    #[test]
    fn advisory_differ_marks_merges_temp() {
        let differ = JsonDiffer::advisory();
        let merged = differ
            .merge(None, &doc(json!({"a": 1})), &doc(json!({"b": 2})))
            .unwrap();
        assert!(merged.temp);
    }

    #[test]
    fn migrate_is_identity_for_json() {
        let differ = JsonDiffer::new();
        let (doc, meta) = differ.migrate(json!({"v": 1}), b"m".to_vec());
        assert_eq!(doc, json!({"v": 1}));
        assert_eq!(meta, b"m");
    }
}
