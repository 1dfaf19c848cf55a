//! Per-model receiving configuration.
//!
//! A [`TargetSpec`] declares, once at startup, how a source-side model lands
//! in local storage: destination table, natural key, field renames, and
//! hooks. Specs are validated eagerly while being built and are read-only
//! for the lifetime of the process.

use crate::{
    error::{ConfigError, HookError},
    hooks::{GroupedRows, HookRegistry},
    FieldName, ModelName, TableName,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Read-only configuration for one model.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    model_name: ModelName,
    to_table: TableName,
    target_keys: Vec<FieldName>,
    mapping_overrides: HashMap<FieldName, FieldName>,
    version_column: FieldName,
    hooks: HookRegistry,
}

impl TargetSpec {
    /// Start building a spec for `model_name`.
    pub fn builder(model_name: impl Into<ModelName>) -> TargetSpecBuilder {
        TargetSpecBuilder::new(model_name)
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn to_table(&self) -> &str {
        &self.to_table
    }

    /// Ordered storage-column names forming the natural key.
    pub fn target_keys(&self) -> &[FieldName] {
        &self.target_keys
    }

    /// Wire-field to storage-column renames.
    pub fn mapping_overrides(&self) -> &HashMap<FieldName, FieldName> {
        &self.mapping_overrides
    }

    /// Storage column holding the applied version stamp.
    pub fn version_column(&self) -> &str {
        &self.version_column
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }
}

/// Builder for [`TargetSpec`]. All validation happens in [`build`].
///
/// [`build`]: TargetSpecBuilder::build
pub struct TargetSpecBuilder {
    model_name: ModelName,
    to_table: Option<TableName>,
    target_keys: Option<Vec<FieldName>>,
    mapping_overrides: HashMap<FieldName, FieldName>,
    version_column: FieldName,
    // (point name, callback) pairs, validated at build time
    pending_hooks: Vec<(String, Arc<dyn Fn(&GroupedRows) -> Result<(), HookError> + Send + Sync>)>,
}

impl TargetSpecBuilder {
    fn new(model_name: impl Into<ModelName>) -> Self {
        Self {
            model_name: model_name.into(),
            to_table: None,
            target_keys: None,
            mapping_overrides: HashMap::new(),
            version_column: "version".to_string(),
            pending_hooks: Vec::new(),
        }
    }

    /// Destination table. Defaults to the lowercased model name.
    pub fn to_table(mut self, table: impl Into<TableName>) -> Self {
        self.to_table = Some(table.into());
        self
    }

    /// Natural-key columns used to locate rows. Defaults to `["id"]`.
    pub fn target_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<FieldName>,
    {
        self.target_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Rename a wire field to a storage column. Values are never touched.
    pub fn map_field(mut self, from: impl Into<FieldName>, to: impl Into<FieldName>) -> Self {
        self.mapping_overrides.insert(from.into(), to.into());
        self
    }

    /// Override the version-stamp column (default `"version"`).
    pub fn version_column(mut self, column: impl Into<FieldName>) -> Self {
        self.version_column = column.into();
        self
    }

    /// Bind a callback to a named execution point. The point name is
    /// validated in [`build`](Self::build); an unknown name fails the whole
    /// spec before any row is processed.
    pub fn on(
        mut self,
        point: impl Into<String>,
        callback: impl Fn(&GroupedRows) -> Result<(), HookError> + Send + Sync + 'static,
    ) -> Self {
        self.pending_hooks.push((point.into(), Arc::new(callback)));
        self
    }

    /// Validate and build the spec.
    pub fn build(self) -> Result<TargetSpec, ConfigError> {
        let target_keys = match self.target_keys {
            None => vec!["id".to_string()],
            Some(keys) if keys.is_empty() => {
                return Err(ConfigError::EmptyTargetKeys(self.model_name));
            }
            Some(keys) => keys,
        };

        // A key that is the wire-side name of an override gets renamed away
        // and can never appear in a mapped row, unless some other override
        // maps onto it.
        for key in &target_keys {
            let renamed_away = self.mapping_overrides.contains_key(key);
            let mapped_onto = self.mapping_overrides.values().any(|to| to == key);
            if renamed_away && !mapped_onto {
                return Err(ConfigError::UnresolvableTargetKey {
                    model: self.model_name,
                    key: key.clone(),
                });
            }
        }

        let mut hooks = HookRegistry::new();
        for (point, callback) in self.pending_hooks {
            hooks.register(&point, move |rows| callback(rows))?;
        }

        let to_table = self
            .to_table
            .unwrap_or_else(|| self.model_name.to_lowercase());

        Ok(TargetSpec {
            model_name: self.model_name,
            to_table,
            target_keys,
            mapping_overrides: self.mapping_overrides,
            version_column: self.version_column,
            hooks,
        })
    }
}

/// All registered target specs, keyed by model name. Built once at startup
/// and shared read-only by every handler and publisher.
#[derive(Debug, Clone, Default)]
pub struct SpecRegistry {
    specs: HashMap<ModelName, Arc<TargetSpec>>,
}

impl SpecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec. Registering the same model twice is a
    /// configuration error.
    pub fn register(&mut self, spec: TargetSpec) -> Result<(), ConfigError> {
        let model = spec.model_name().to_string();
        if self.specs.contains_key(&model) {
            return Err(ConfigError::DuplicateModel(model));
        }
        self.specs.insert(model, Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, model_name: &str) -> Option<&Arc<TargetSpec>> {
        self.specs.get(model_name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
