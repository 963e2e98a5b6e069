//! Cache key definitions.
//!
//! A [`CacheKey`] is a resource domain plus an ordered set of filter
//! parameters. Filters live in a `BTreeMap`, so two keys built with the same
//! parameters in a different order are equal and serialize identically.

use std::collections::BTreeMap;
use std::fmt;

use crate::domain::types::{FilterValue, ResourceDomain};

/// Identifies one cached query result, e.g. `products{"category":"Buche"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    domain: ResourceDomain,
    filters: BTreeMap<String, FilterValue>,
}

impl CacheKey {
    pub fn new(domain: ResourceDomain) -> Self {
        Self {
            domain,
            filters: BTreeMap::new(),
        }
    }

    /// Add or replace one filter parameter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn domain(&self) -> &ResourceDomain {
        &self.domain
    }

    pub fn filters(&self) -> &BTreeMap<String, FilterValue> {
        &self.filters
    }

    pub fn filter(&self, field: &str) -> Option<&FilterValue> {
        self.filters.get(field)
    }

    /// Canonical string form: the domain followed by the JSON filter object.
    pub fn serialized(&self) -> String {
        let filters: serde_json::Map<String, serde_json::Value> = self
            .filters
            .iter()
            .map(|(field, value)| (field.clone(), value.to_json()))
            .collect();
        format!("{}{}", self.domain, serde_json::Value::Object(filters))
    }

    /// True when the text filter `field` names `identifier`, ignoring ASCII case.
    pub fn matches_identifier(&self, field: &str, identifier: &str) -> bool {
        self.filter(field)
            .and_then(FilterValue::as_text)
            .is_some_and(|value| value.eq_ignore_ascii_case(identifier))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialized())
    }
}
