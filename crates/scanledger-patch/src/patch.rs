//! The patch algebra: structural diff and application.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Map;

use crate::{Error, Result};

/// An arbitrarily nested key-value document.
///
/// Cloning a `Document` is a deep copy: the clone shares no mutable
/// substructure with the original.
pub type Document = serde_json::Value;

/// A structural patch over a [`Document`].
///
/// On the wire a patch is plain JSON where `null` means "delete this key".
/// In memory the tombstone is its own variant, so code handling patches can
/// never confuse a deletion marker with data.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    /// Replace the target with this value wholesale.
    Value(Document),
    /// Delete the target key.
    Delete,
    /// Merge field patches into the target document.
    Object(BTreeMap<String, Patch>),
}

impl Patch {
    /// The identity patch: applying it returns the input unchanged.
    #[must_use]
    pub fn empty() -> Self {
        Self::Object(BTreeMap::new())
    }

    /// Returns true if applying this patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Object(fields) if fields.is_empty())
    }

    /// Parses a patch from its JSON wire form.
    ///
    /// `null` becomes [`Patch::Delete`], objects become nested field patches,
    /// everything else becomes a wholesale replacement.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmbeddedTombstone`] if a replacement value carries a
    /// `null` below a non-document position (inside a list, for example),
    /// where it could not be consumed as a deletion marker.
    pub fn from_value(value: &Document) -> Result<Self> {
        Self::from_value_at(value, "")
    }

    fn from_value_at(value: &Document, path: &str) -> Result<Self> {
        match value {
            Document::Null => Ok(Self::Delete),
            Document::Object(map) => {
                let mut fields = BTreeMap::new();
                for (key, nested) in map {
                    let parsed = Self::from_value_at(nested, &join_path(path, key))?;
                    fields.insert(key.clone(), parsed);
                }
                Ok(Self::Object(fields))
            }
            other => match find_tombstone_at(other, path) {
                Some(path) => Err(Error::EmbeddedTombstone { path }),
                None => Ok(Self::Value(other.clone())),
            },
        }
    }

    /// Renders the patch back into its JSON wire form.
    #[must_use]
    pub fn to_value(&self) -> Document {
        match self {
            Self::Delete => Document::Null,
            Self::Value(value) => value.clone(),
            Self::Object(fields) => Document::Object(
                fields
                    .iter()
                    .map(|(key, field)| (key.clone(), field.to_value()))
                    .collect(),
            ),
        }
    }

    /// Applies the patch to `doc`, returning a new document.
    ///
    /// The input is never mutated. Keys patched with [`Patch::Delete`] are
    /// removed from the result; missing keys targeted by a nested patch are
    /// merged into an empty document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TopLevelTombstone`] if the patch is a bare tombstone,
    /// and [`Error::TombstoneLeak`] if any `null` survives into the result at
    /// any depth. A leak means the patch or the input was corrupt; the result
    /// must be discarded.
    pub fn apply(&self, doc: &Document) -> Result<Document> {
        let result = match self {
            Self::Delete => return Err(Error::TopLevelTombstone),
            Self::Value(value) => value.clone(),
            Self::Object(fields) => merge(fields, doc),
        };
        match find_tombstone(&result) {
            Some(path) => Err(Error::TombstoneLeak { path }),
            None => Ok(result),
        }
    }
}

impl Serialize for Patch {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Patch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Document::deserialize(deserializer)?;
        Self::from_value(&value).map_err(D::Error::custom)
    }
}

fn merge(fields: &BTreeMap<String, Patch>, doc: &Document) -> Document {
    if fields.is_empty() {
        return doc.clone();
    }
    let mut map = match doc {
        Document::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for (key, field) in fields {
        match field {
            Patch::Delete => {
                map.remove(key);
            }
            Patch::Value(value) => {
                map.insert(key.clone(), value.clone());
            }
            Patch::Object(nested) => {
                let current = map
                    .remove(key)
                    .unwrap_or_else(|| Document::Object(Map::new()));
                map.insert(key.clone(), merge(nested, &current));
            }
        }
    }
    Document::Object(map)
}

/// Computes the minimal patch transforming `a` into `b`.
///
/// Returns `None` when the documents are deep-equal — the empty sentinel is
/// the absence of a patch, never a tombstone. Keys present in `a` but absent
/// from `b` map to [`Patch::Delete`]; nested documents recurse, embedding
/// only the differing fields; lists and scalars are replaced wholesale.
#[must_use]
pub fn diff(a: &Document, b: &Document) -> Option<Patch> {
    if a == b {
        return None;
    }
    match (a, b) {
        (Document::Object(from), Document::Object(to)) => {
            let mut fields = BTreeMap::new();
            for (key, old) in from {
                match to.get(key) {
                    None => {
                        fields.insert(key.clone(), Patch::Delete);
                    }
                    Some(new) => {
                        if let Some(nested) = diff(old, new) {
                            fields.insert(key.clone(), nested);
                        }
                    }
                }
            }
            for (key, new) in to {
                if !from.contains_key(key) {
                    fields.insert(key.clone(), Patch::Value(new.clone()));
                }
            }
            Some(Patch::Object(fields))
        }
        _ => Some(Patch::Value(b.clone())),
    }
}

/// Returns the dotted path of the first `null` literal in `doc`, if any.
///
/// Documents are tombstone-free by construction; a hit signals corruption.
#[must_use]
pub fn find_tombstone(doc: &Document) -> Option<String> {
    find_tombstone_at(doc, "")
}

fn find_tombstone_at(doc: &Document, path: &str) -> Option<String> {
    match doc {
        Document::Null => Some(if path.is_empty() {
            "$".to_string()
        } else {
            path.to_string()
        }),
        Document::Object(map) => map
            .iter()
            .find_map(|(key, nested)| find_tombstone_at(nested, &join_path(path, key))),
        Document::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, nested)| find_tombstone_at(nested, &join_path(path, &i.to_string()))),
        _ => None,
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn diff_of_equal_documents_is_empty() {
        let doc = json!({"tick": 4, "stars": {"0": {"name": "Sol"}}});
        assert!(diff(&doc, &doc).is_none());
    }

    #[test]
    fn diff_embeds_only_changed_fields() {
        let a = json!({"tick": 1, "stars": {"0": {"name": "Sol", "st": 50}}});
        let b = json!({"tick": 2, "stars": {"0": {"name": "Sol", "st": 55}}});

        let patch = diff(&a, &b).unwrap();
        let Patch::Object(fields) = &patch else {
            panic!("expected object patch");
        };
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["tick"], Patch::Value(json!(2)));
        // The nested star diff carries only `st`, not the whole star.
        let Patch::Object(stars) = &fields["stars"] else {
            panic!("expected nested patch");
        };
        let Patch::Object(star) = &stars["0"] else {
            panic!("expected nested patch");
        };
        assert_eq!(star.len(), 1);
        assert_eq!(star["st"], Patch::Value(json!(55)));
    }

    #[test]
    fn removed_keys_become_tombstones() {
        let a = json!({"fleets": {"7": {"name": "Alpha"}}, "tick": 1});
        let b = json!({"tick": 1});

        let patch = diff(&a, &b).unwrap();
        assert_eq!(patch.apply(&a).unwrap(), b);
        let Patch::Object(fields) = patch else {
            panic!("expected object patch");
        };
        assert_eq!(fields["fleets"], Patch::Delete);
    }

    #[test]
    fn round_trips_through_application() {
        let a = json!({"tick": 1, "stars": {"0": {"st": 50}, "1": {"st": 10}}});
        let b = json!({"tick": 2, "stars": {"0": {"st": 55}}, "now": 99});

        let forward = diff(&a, &b).unwrap();
        let back = diff(&b, &a).unwrap();
        assert_eq!(forward.apply(&a).unwrap(), b);
        assert_eq!(back.apply(&b).unwrap(), a);
    }

    #[test]
    fn apply_does_not_mutate_input() {
        let a = json!({"tick": 1});
        let patch = diff(&a, &json!({"tick": 2})).unwrap();
        let _ = patch.apply(&a).unwrap();
        assert_eq!(a, json!({"tick": 1}));
    }

    #[test]
    fn lists_replace_wholesale() {
        let a = json!({"order": [1, 2, 3]});
        let b = json!({"order": [3, 1]});
        let patch = diff(&a, &b).unwrap();
        let Patch::Object(fields) = &patch else {
            panic!("expected object patch");
        };
        assert_eq!(fields["order"], Patch::Value(json!([3, 1])));
        assert_eq!(patch.apply(&a).unwrap(), b);
    }

    #[test]
    fn empty_patch_is_identity() {
        let doc = json!({"tick": 9});
        assert!(Patch::empty().is_empty());
        assert_eq!(Patch::empty().apply(&doc).unwrap(), doc);
    }

    #[test]
    fn leaked_tombstone_aborts_application() {
        let patch = Patch::Value(json!({"stars": {"0": null}}));
        let err = patch.apply(&json!({})).unwrap_err();
        assert!(matches!(err, Error::TombstoneLeak { path } if path == "stars.0"));
    }

    #[test]
    fn top_level_tombstone_is_rejected() {
        let err = Patch::Delete.apply(&json!({"tick": 1})).unwrap_err();
        assert!(matches!(err, Error::TopLevelTombstone));
    }

    #[test]
    fn wire_form_round_trips() {
        let a = json!({"tick": 1, "stars": {"0": {"st": 50}}, "gone": true});
        let b = json!({"tick": 2, "stars": {"0": {"st": 55}, "1": {"st": 5}}});

        let patch = diff(&a, &b).unwrap();
        let wire = patch.to_value();
        assert_eq!(wire["gone"], json!(null));

        let reparsed = Patch::from_value(&wire).unwrap();
        assert_eq!(reparsed.apply(&a).unwrap(), b);
    }

    #[test]
    fn wire_form_rejects_tombstones_inside_lists() {
        let err = Patch::from_value(&json!({"order": [1, null]})).unwrap_err();
        assert!(matches!(err, Error::EmbeddedTombstone { path } if path == "order.1"));
    }

    #[test]
    fn serde_round_trip() {
        let patch = diff(
            &json!({"tick": 1, "old": 0}),
            &json!({"tick": 2, "fresh": {"a": 1}}),
        )
        .unwrap();
        let encoded = serde_json::to_string(&patch).unwrap();
        let decoded: Patch = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            decoded.apply(&json!({"tick": 1, "old": 0})).unwrap(),
            json!({"tick": 2, "fresh": {"a": 1}})
        );
    }
}
