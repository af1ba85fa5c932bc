//! Tool-call arguments of `query_database`, validated into typed requests.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use examdesk_types::Collection;

use crate::error::QueryError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Select,
    Compare,
    Aggregate,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Operation::Select, Operation::Compare, Operation::Aggregate];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Select => "select",
            Operation::Compare => "compare",
            Operation::Aggregate => "aggregate",
        }
    }

    fn parse(raw: &str) -> Result<Self, QueryError> {
        let normalized = raw.trim().to_ascii_lowercase();
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == normalized)
            .ok_or_else(|| {
                QueryError::InvalidArguments(format!(
                    "operation must be one of select, compare, aggregate (got `{raw}`)"
                ))
            })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectParams {
    pub filter: Map<String, Value>,
    pub sort: Vec<String>,
    pub fields: Vec<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompareParams {
    pub filter: Map<String, Value>,
    pub fields: Vec<String>,
    pub compare: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregateParams {
    pub filter: Map<String, Value>,
    pub fields: Vec<String>,
    pub group_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOperation {
    Select(SelectParams),
    Compare(CompareParams),
    Aggregate(AggregateParams),
}

impl QueryOperation {
    pub fn operation(&self) -> Operation {
        match self {
            QueryOperation::Select(_) => Operation::Select,
            QueryOperation::Compare(_) => Operation::Compare,
            QueryOperation::Aggregate(_) => Operation::Aggregate,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub collection: Collection,
    pub operation: QueryOperation,
}

impl QueryRequest {
    /// Validates the loosely-typed argument object the assistant sent.
    pub fn from_arguments(args: &Value) -> Result<Self, QueryError> {
        if !args.is_object() {
            return Err(QueryError::InvalidArguments(
                "arguments must be a JSON object".to_string(),
            ));
        }
        let raw: RawArguments = serde_json::from_value(args.clone())
            .map_err(|err| QueryError::InvalidArguments(err.to_string()))?;

        let collection = raw
            .collection
            .parse::<Collection>()
            .map_err(|err| QueryError::UnknownCollection(err.0))?;
        let operation = match raw.operation.as_deref() {
            None => Operation::Select,
            Some(op) => Operation::parse(op)?,
        };

        let query = raw.query.unwrap_or_default();
        let filter = match query.filter {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(QueryError::InvalidArguments(format!(
                    "query.filter must be an object, got {other}"
                )))
            }
        };
        let fields = list(query.fields);

        let operation = match operation {
            Operation::Select => QueryOperation::Select(SelectParams {
                filter,
                sort: list(query.sort),
                fields,
                limit: query.limit,
            }),
            Operation::Compare => QueryOperation::Compare(CompareParams {
                filter,
                fields,
                compare: list(query.compare),
            }),
            Operation::Aggregate => QueryOperation::Aggregate(AggregateParams {
                filter,
                fields,
                group_by: list(query.group_by),
            }),
        };

        Ok(Self {
            collection,
            operation,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawArguments {
    collection: String,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    query: Option<RawQuery>,
}

#[derive(Debug, Deserialize, Default)]
struct RawQuery {
    #[serde(default)]
    filter: Option<Value>,
    #[serde(default)]
    sort: Option<StringList>,
    #[serde(default)]
    fields: Option<StringList>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default, rename = "groupBy", alias = "group_by")]
    group_by: Option<StringList>,
    #[serde(default)]
    compare: Option<StringList>,
}

/// Either `["a", "b"]` or `"a,b"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringList {
    One(String),
    Many(Vec<String>),
}

fn list(value: Option<StringList>) -> Vec<String> {
    let items = match value {
        None => return Vec::new(),
        Some(StringList::One(s)) => s.split(',').map(str::to_string).collect::<Vec<_>>(),
        Some(StringList::Many(items)) => items,
    };
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
