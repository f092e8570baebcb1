use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{CanonicalField, LeadSource, NewProspect, RawRecord};
use crate::store::{LeadStore, StoreResult};

/// Translates raw field names into canonical fields for one source.
/// Keys are canonical fields, values are the field names found in raw records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping(BTreeMap<CanonicalField, String>);

impl FieldMapping {
    pub fn new(fields: BTreeMap<CanonicalField, String>) -> Self {
        Self(fields)
    }

    /// The built-in identity mapping: every canonical field is read from the raw field
    /// of the same name.
    pub fn default_mapping() -> Self {
        Self(
            CanonicalField::ALL
                .iter()
                .map(|field| (*field, field.as_str().to_owned()))
                .collect(),
        )
    }

    /// Return a copy of this mapping with `overrides` replacing matching entries.
    pub fn with_overrides(mut self, overrides: &BTreeMap<CanonicalField, String>) -> Self {
        for (field, raw) in overrides {
            self.0.insert(*field, raw.clone());
        }
        self
    }

    pub fn get(&self, field: CanonicalField) -> Option<&str> {
        self.0.get(&field).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CanonicalField, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check that every mapped raw field name is usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.0.is_empty() {
            return Err("mapping must map at least one canonical field".to_owned());
        }
        match self.0.iter().find(|(_, raw)| raw.trim().is_empty()) {
            Some((field, _)) => Err(format!("mapping for {} is empty", field)),
            None => Ok(()),
        }
    }

    /// Build a canonical prospect candidate from a raw record.
    ///
    /// A canonical field is `None` when it is unmapped, or when the mapped raw field is
    /// absent from the record or blank. The raw record is kept verbatim as metadata.
    pub fn project(&self, source_id: Uuid, record: &RawRecord) -> NewProspect {
        let mut prospect = NewProspect {
            source_id,
            first_name: None,
            last_name: None,
            email: None,
            phone: None,
            metadata: record.clone(),
        };

        for field in CanonicalField::ALL {
            let value = self
                .get(field)
                .and_then(|raw| record.get(raw))
                .filter(|value| !value.trim().is_empty())
                .cloned();
            prospect.set_field(field, value);
        }

        prospect
    }
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self::default_mapping()
    }
}

/// Resolves which `FieldMapping` applies to a source.
#[derive(Clone)]
pub struct FieldMapper {
    store: Arc<dyn LeadStore>,
}

impl FieldMapper {
    pub fn new(store: Arc<dyn LeadStore>) -> Self {
        Self { store }
    }

    /// Resolve the mapping for a source id. A saved mapping is returned verbatim; without
    /// one the default mapping applies, merged with the source's configured overrides if
    /// the source can be found.
    pub async fn resolve_mapping(&self, source_id: Uuid) -> StoreResult<FieldMapping> {
        if let Some(mapping) = self.store.get_mapping(source_id).await? {
            return Ok(mapping);
        }

        let mapping = match self.store.get_source(source_id).await? {
            Some(source) => {
                FieldMapping::default_mapping().with_overrides(&source.config.mapping_overrides)
            }
            None => FieldMapping::default_mapping(),
        };
        Ok(mapping)
    }

    /// Same as `resolve_mapping` for a source that has already been loaded.
    pub async fn resolve_for_source(&self, source: &LeadSource) -> StoreResult<FieldMapping> {
        match self.store.get_mapping(source.id).await? {
            Some(mapping) => Ok(mapping),
            None => Ok(FieldMapping::default_mapping()
                .with_overrides(&source.config.mapping_overrides)),
        }
    }
}
