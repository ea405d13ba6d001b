//! Property tests for the patch round-trip law.

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use scanledger_patch::{Document, Patch, diff};

/// Tombstone-free JSON documents, a few levels deep.
///
/// Nested maps are non-empty: on the wire an empty replacement object is
/// indistinguishable from the empty patch.
fn document() -> impl Strategy<Value = Document> {
    let leaf = prop_oneof![
        any::<bool>().prop_map(Document::Bool),
        any::<i32>().prop_map(Document::from),
        "[a-z]{0,8}".prop_map(Document::from),
    ];
    leaf.prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Document::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 1..5)
                .prop_map(|map| Document::Object(map.into_iter().collect())),
        ]
    })
}

proptest! {
    #[test]
    fn diff_of_identical_documents_is_empty(a in document()) {
        prop_assert!(diff(&a, &a).is_none());
    }

    #[test]
    fn patch_of_diff_reproduces_target(a in document(), b in document()) {
        match diff(&a, &b) {
            None => prop_assert_eq!(a, b),
            Some(patch) => prop_assert_eq!(patch.apply(&a).unwrap(), b),
        }
    }

    #[test]
    fn back_patch_reproduces_source(a in document(), b in document()) {
        if let Some(back) = diff(&b, &a) {
            prop_assert_eq!(back.apply(&b).unwrap(), a);
        }
    }

    #[test]
    fn wire_form_preserves_application(a in document(), b in document()) {
        if let Some(patch) = diff(&a, &b) {
            let reparsed = Patch::from_value(&patch.to_value()).unwrap();
            prop_assert_eq!(reparsed.apply(&a).unwrap(), b);
        }
    }
}
