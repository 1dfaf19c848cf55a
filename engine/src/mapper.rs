//! Wire-to-storage attribute mapping.
//!
//! Pure functions, no side effects. Overrides rename fields; values pass
//! through untouched; unmapped fields keep their original name. A missing
//! key field in an incoming row is a handling error reported by
//! [`extract_key`], never a mapping error.

use crate::{error::HandlingError, storage::RowKey, target::TargetSpec, Attributes};

/// Apply the spec's mapping overrides to one wire row.
pub fn map_row(row: &Attributes, spec: &TargetSpec) -> Attributes {
    let overrides = spec.mapping_overrides();
    row.iter()
        .map(|(field, value)| {
            let column = overrides.get(field).cloned().unwrap_or_else(|| field.clone());
            (column, value.clone())
        })
        .collect()
}

/// Pull the natural key out of a mapped row.
pub fn extract_key(mapped: &Attributes, spec: &TargetSpec) -> Result<RowKey, HandlingError> {
    let mut key = RowKey::new();
    for column in spec.target_keys() {
        let value = mapped
            .get(column)
            .ok_or_else(|| HandlingError::MissingKeyField {
                model: spec.model_name().to_string(),
                field: column.clone(),
            })?;
        key.insert(column.clone(), value.clone());
    }
    Ok(key)
}
