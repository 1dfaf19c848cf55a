//! Wire-safety filtering of attribute values.
//!
//! Strips values unsafe to transmit over the bus: time values and
//! non-finite floats are dropped from maps and removed from lists (an
//! all-unsupported list becomes empty, the key stays), nested maps are
//! filtered recursively, and non-text map keys are normalized to text.
//!
//! Untouched substructures come back as `Cow::Borrowed`, so filtering costs
//! allocations only for the substructures actually rewritten, never in
//! proportion to how deep safe data nests.

use crate::{
    value::{RawKey, RawValue},
    RawRow,
};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Whether a value can cross the wire without any rewriting.
fn is_clean(value: &RawValue) -> bool {
    match value {
        RawValue::Null | RawValue::Bool(_) | RawValue::Int(_) | RawValue::Text(_) => true,
        RawValue::Float(f) => f.is_finite(),
        RawValue::Time(_) => false,
        RawValue::List(items) => items.iter().all(is_clean),
        RawValue::Map(entries) => entries
            .iter()
            .all(|(key, value)| matches!(key, RawKey::Text(_)) && is_clean(value)),
    }
}

/// Filter one value. `None` means the value is unsupported and must be
/// dropped by its container; `Some(Borrowed)` means it passed untouched.
pub fn scrub(value: &RawValue) -> Option<Cow<'_, RawValue>> {
    match value {
        RawValue::Time(_) => None,
        RawValue::Float(f) if !f.is_finite() => None,
        RawValue::List(items) => {
            if items.iter().all(is_clean) {
                return Some(Cow::Borrowed(value));
            }
            let kept = items
                .iter()
                .filter_map(|item| scrub(item).map(Cow::into_owned))
                .collect();
            Some(Cow::Owned(RawValue::List(kept)))
        }
        RawValue::Map(_) if is_clean(value) => Some(Cow::Borrowed(value)),
        RawValue::Map(entries) => {
            let kept = entries
                .iter()
                .filter_map(|(key, value)| {
                    scrub(value).map(|clean| {
                        (RawKey::Text(key.as_text().into_owned()), clean.into_owned())
                    })
                })
                .collect();
            Some(Cow::Owned(RawValue::Map(kept)))
        }
        _ => Some(Cow::Borrowed(value)),
    }
}

/// Filter a whole attribute row. Unsupported top-level values are dropped
/// like map entries; everything kept serializes cleanly to JSON.
pub fn scrub_row(row: &RawRow) -> BTreeMap<&str, Cow<'_, RawValue>> {
    row.iter()
        .filter_map(|(field, value)| scrub(value).map(|clean| (field.as_str(), clean)))
        .collect()
}
