//! Shared domain enumerations for catalog resources and change-feed operations.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Logical resource family a cache key belongs to.
///
/// The well-known families cover the storefront catalog; anything else that
/// shows up in configuration is carried as [`ResourceDomain::Custom`].
///
/// Equality, hashing and ordering go through [`ResourceDomain::as_str`], so
/// `Custom("products")` and `Products` name the same family.
#[derive(Debug, Clone)]
pub enum ResourceDomain {
    Products,
    ProductDetail,
    Categories,
    ShopSettings,
    Images,
    Custom(String),
}

impl ResourceDomain {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceDomain::Products => "products",
            ResourceDomain::ProductDetail => "product_detail",
            ResourceDomain::Categories => "categories",
            ResourceDomain::ShopSettings => "shop_settings",
            ResourceDomain::Images => "images",
            ResourceDomain::Custom(name) => name.as_str(),
        }
    }

    /// The families every storefront knows about, in display order.
    pub fn well_known() -> [ResourceDomain; 5] {
        [
            ResourceDomain::Products,
            ResourceDomain::ProductDetail,
            ResourceDomain::Categories,
            ResourceDomain::ShopSettings,
            ResourceDomain::Images,
        ]
    }
}

impl PartialEq for ResourceDomain {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for ResourceDomain {}

impl Hash for ResourceDomain {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl PartialOrd for ResourceDomain {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceDomain {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl fmt::Display for ResourceDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceDomain {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let name = value.trim().to_ascii_lowercase();
        let domain = match name.as_str() {
            "" => return Err(DomainError::validation("resource domain name is empty")),
            "products" => ResourceDomain::Products,
            "product_detail" => ResourceDomain::ProductDetail,
            "categories" => ResourceDomain::Categories,
            "shop_settings" => ResourceDomain::ShopSettings,
            "images" => ResourceDomain::Images,
            _ if name
                .chars()
                .any(|ch| ch.is_whitespace() || ch == '{' || ch == '}') =>
            {
                return Err(DomainError::validation(format!(
                    "resource domain `{value}` must not contain whitespace or braces"
                )));
            }
            _ => ResourceDomain::Custom(name),
        };
        Ok(domain)
    }
}

/// Mutation kind reported by the backend change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeOperation::Insert => "insert",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar filter parameter attached to a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl FilterValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FilterValue::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    /// Compare against a JSON field of a backend row.
    ///
    /// Text comparison ignores ASCII case; catalog rows mix `Buche` and `buche`.
    pub fn matches_json(&self, value: &serde_json::Value) -> bool {
        match (self, value) {
            (FilterValue::Bool(expected), serde_json::Value::Bool(actual)) => expected == actual,
            (FilterValue::Integer(expected), serde_json::Value::Number(actual)) => {
                actual.as_i64() == Some(*expected)
            }
            (FilterValue::Text(expected), serde_json::Value::String(actual)) => {
                expected.eq_ignore_ascii_case(actual)
            }
            _ => false,
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        match self {
            FilterValue::Bool(value) => serde_json::Value::Bool(*value),
            FilterValue::Integer(value) => serde_json::Value::from(*value),
            FilterValue::Text(value) => serde_json::Value::String(value.clone()),
        }
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Integer(value)
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}
