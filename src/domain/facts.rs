use rust_decimal::Decimal;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors converting raw JSON input into facts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FactError {
    #[error("fact value must be a boolean, number or string, got {0}")]
    UnsupportedValue(&'static str),

    #[error("number {0} cannot be represented exactly")]
    Number(String),

    #[error("facts must be a JSON object")]
    NotAnObject,
}

/// A single applicant/organization fact value.
///
/// Dates and enum symbols travel as text and are interpreted through the
/// fact type declared by the rule set that consults them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum FactValue {
    Bool(bool),
    Number(Decimal),
    Text(String),
}

impl FactValue {
    /// Human-readable kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            FactValue::Bool(_) => "boolean",
            FactValue::Number(_) => "number",
            FactValue::Text(_) => "text",
        }
    }

    /// Canonical, kind-tagged textual form.
    ///
    /// Numbers are normalized so `70`, `70.0` and `70.00` share one form.
    pub fn canonical(&self) -> String {
        match self {
            FactValue::Bool(b) => format!("b:{}", b),
            FactValue::Number(n) => format!("n:{}", canonical_decimal(*n)),
            FactValue::Text(s) => format!("s:{}", s),
        }
    }
}

fn canonical_decimal(n: Decimal) -> String {
    let normalized = n.normalize();
    if normalized.is_zero() {
        "0".to_string()
    } else {
        normalized.to_string()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl TryFrom<Value> for FactValue {
    type Error = FactError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bool(b) => Ok(FactValue::Bool(b)),
            Value::Number(n) => {
                let text = n.to_string();
                text.parse::<Decimal>()
                    .or_else(|_| Decimal::from_scientific(&text))
                    .map(FactValue::Number)
                    .map_err(|_| FactError::Number(text))
            }
            Value::String(s) => Ok(FactValue::Text(s)),
            other => Err(FactError::UnsupportedValue(json_kind(&other))),
        }
    }
}

impl From<FactValue> for Value {
    fn from(value: FactValue) -> Self {
        match value {
            FactValue::Bool(b) => Value::Bool(b),
            FactValue::Number(n) => {
                // Exact decimal text; serde_json keeps it verbatim.
                let text = canonical_decimal(n);
                text.parse::<serde_json::Number>()
                    .map(Value::Number)
                    .unwrap_or(Value::String(text))
            }
            FactValue::Text(s) => Value::String(s),
        }
    }
}

impl From<bool> for FactValue {
    fn from(value: bool) -> Self {
        FactValue::Bool(value)
    }
}

impl From<i32> for FactValue {
    fn from(value: i32) -> Self {
        FactValue::Number(Decimal::from(value))
    }
}

impl From<i64> for FactValue {
    fn from(value: i64) -> Self {
        FactValue::Number(Decimal::from(value))
    }
}

impl From<u32> for FactValue {
    fn from(value: u32) -> Self {
        FactValue::Number(Decimal::from(value))
    }
}

impl From<Decimal> for FactValue {
    fn from(value: Decimal) -> Self {
        FactValue::Number(value)
    }
}

impl From<&str> for FactValue {
    fn from(value: &str) -> Self {
        FactValue::Text(value.to_string())
    }
}

impl From<String> for FactValue {
    fn from(value: String) -> Self {
        FactValue::Text(value)
    }
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactValue::Bool(b) => write!(f, "{}", b),
            FactValue::Number(n) => write!(f, "{}", canonical_decimal(*n)),
            FactValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

/// Flat mapping of fact keys to values, kept in key order.
///
/// A JSON `null` on input means "not provided" and is dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Facts(BTreeMap<String, FactValue>);

impl Facts {
    pub fn new() -> Self {
        Facts(BTreeMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FactValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FactValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&FactValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in canonical (sorted key) order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FactValue)> {
        self.0.iter()
    }

    /// Build facts from a JSON object.
    pub fn from_json(value: Value) -> Result<Self, FactError> {
        match value {
            Value::Object(map) => Self::from_raw(map.into_iter().collect()),
            _ => Err(FactError::NotAnObject),
        }
    }

    fn from_raw(raw: BTreeMap<String, Value>) -> Result<Self, FactError> {
        let mut facts = BTreeMap::new();
        for (key, value) in raw {
            if value.is_null() {
                continue;
            }
            facts.insert(key, FactValue::try_from(value)?);
        }
        Ok(Facts(facts))
    }
}

impl FromIterator<(String, FactValue)> for Facts {
    fn from_iter<I: IntoIterator<Item = (String, FactValue)>>(iter: I) -> Self {
        Facts(iter.into_iter().collect())
    }
}

impl Serialize for Facts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Facts {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
        Facts::from_raw(raw).map_err(serde::de::Error::custom)
    }
}
