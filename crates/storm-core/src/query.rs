//! MongoDB-style query expressions.
//!
//! Queries are passed verbatim to the API server, which evaluates them
//! against resource documents. The expression tree here exists only to
//! compose and serialize them; nothing is evaluated locally.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

/// A query expression over resource fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Eq { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Nin { field: String, values: Vec<Value> },
    Regex { field: String, pattern: String },
    And(Vec<Query>),
    Or(Vec<Query>),
}

impl Query {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Query::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn not_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Query::Nin {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn regex(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Query::Regex {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    pub fn and(terms: impl IntoIterator<Item = Query>) -> Self {
        Query::And(terms.into_iter().collect())
    }

    pub fn or(terms: impl IntoIterator<Item = Query>) -> Self {
        Query::Or(terms.into_iter().collect())
    }

    /// Render into the JSON shape the API server expects.
    pub fn to_value(&self) -> Value {
        match self {
            Query::Eq { field, value } => json!({ field: value }),
            Query::In { field, values } => json!({ field: { "$in": values } }),
            Query::Nin { field, values } => json!({ field: { "$nin": values } }),
            Query::Regex { field, pattern } => json!({ field: { "$regex": pattern } }),
            Query::And(terms) => {
                json!({ "$and": terms.iter().map(Query::to_value).collect::<Vec<_>>() })
            }
            Query::Or(terms) => {
                json!({ "$or": terms.iter().map(Query::to_value).collect::<Vec<_>>() })
            }
        }
    }

    /// Compact JSON rendering, used as the `q` query-string parameter.
    pub fn to_compact_json(&self) -> String {
        self.to_value().to_string()
    }

    /// Parse a query document back into an expression tree.
    ///
    /// A map with several top-level fields is an implicit conjunction.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let map = value
            .as_object()
            .ok_or_else(|| format!("query must be an object, got {value}"))?;

        let mut terms = Vec::with_capacity(map.len());
        for (key, entry) in map {
            terms.push(Self::parse_entry(key, entry)?);
        }

        match terms.len() {
            0 => Err("query must not be empty".to_string()),
            1 => Ok(terms.remove(0)),
            _ => Ok(Query::And(terms)),
        }
    }

    fn parse_entry(key: &str, entry: &Value) -> Result<Self, String> {
        match key {
            "$and" | "$or" => {
                let items = entry
                    .as_array()
                    .ok_or_else(|| format!("{key} expects an array"))?;
                let terms = items
                    .iter()
                    .map(Self::from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                if key == "$and" {
                    Ok(Query::And(terms))
                } else {
                    Ok(Query::Or(terms))
                }
            }
            field => match entry.as_object().and_then(Self::single_operator) {
                Some(("$in", operand)) => Ok(Query::In {
                    field: field.to_string(),
                    values: operand_array("$in", operand)?,
                }),
                Some(("$nin", operand)) => Ok(Query::Nin {
                    field: field.to_string(),
                    values: operand_array("$nin", operand)?,
                }),
                Some(("$regex", operand)) => Ok(Query::Regex {
                    field: field.to_string(),
                    pattern: operand
                        .as_str()
                        .ok_or("$regex expects a string")?
                        .to_string(),
                }),
                Some((op, _)) => Err(format!("unsupported query operator {op}")),
                None => Ok(Query::Eq {
                    field: field.to_string(),
                    value: entry.clone(),
                }),
            },
        }
    }

    /// A `{"$op": operand}` map, if the object is exactly that shape.
    fn single_operator(map: &Map<String, Value>) -> Option<(&str, &Value)> {
        if map.len() == 1 {
            let (key, value) = map.iter().next()?;
            if key.starts_with('$') {
                return Some((key.as_str(), value));
            }
        }
        None
    }
}

fn operand_array(op: &str, operand: &Value) -> Result<Vec<Value>, String> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| format!("{op} expects an array"))
}

impl Serialize for Query {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Query {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Query::from_value(&value).map_err(D::Error::custom)
    }
}
