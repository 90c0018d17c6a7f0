//! Row model invariants: projection, concatenation, hashing.

use tabflow::row::{Field, Selection, concat, hash_row};
use tabflow::row;

#[test]
fn projection_has_selection_length() {
    let r = row!["a", 1.0, 2.0, "b"];
    for sel in [
        Selection::cols(vec![1]),
        Selection::cols(vec![2, 3]),
        Selection::cols(vec![4, 1, 2]),
        Selection::empty(),
    ] {
        assert_eq!(sel.project(&r).len(), sel.len());
    }
}

#[test]
fn identity_over_concat_is_concat() {
    let r1 = row!["a", 1.0];
    let r2 = row![2.0, "b"];
    let cat = concat(&r1, &r2);
    let id = Selection::identity(cat.len());
    assert_eq!(id.project(&cat), cat);
}

#[test]
fn projection_respects_order() {
    let r = row![10.0, 20.0, 30.0];
    let sel = Selection::cols(vec![3, 1]);
    assert_eq!(sel.project(&r), row![30.0, 10.0]);
}

#[test]
fn mask_and_indices_agree() {
    let r = row!["x", 1.0, 2.0];
    let as_mask = Selection::from_spec(&[1, 0, 1], 3);
    let as_cols = Selection::from_spec(&[1, 3], 3);
    assert_eq!(as_mask.project(&r), as_cols.project(&r));
}

#[test]
fn insane_selections_are_rejected() {
    assert!(Selection::cols(vec![0]).check(2).is_err());
    assert!(Selection::cols(vec![3]).check(2).is_err());
    assert!(Selection::cols(vec![2, 2]).check(2).is_err());
    assert!(Selection::cols(vec![1, 2]).check(2).is_ok());
}

#[test]
fn empty_subrows_hash_and_compare_equal() {
    let a = Selection::empty().project(&row!["a", 1.0]);
    let b = Selection::empty().project(&row![9.0]);
    assert_eq!(a, b);
    assert_eq!(hash_row(&a), hash_row(&b));
}

#[test]
fn complement_selects_the_rest() {
    let sel = Selection::cols(vec![2]);
    assert_eq!(sel.complement(4).indices(), &[1, 3, 4]);
}

#[test]
fn numeric_fields_key_by_value() {
    assert_eq!(Field::Num(1.5), Field::Num(1.5));
    assert_ne!(Field::Num(1.5), Field::Num(2.5));
    assert_eq!(
        hash_row(&row![1.5, "k"]),
        hash_row(&row![1.5, "k"])
    );
}
