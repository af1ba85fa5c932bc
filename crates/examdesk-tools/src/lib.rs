use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use examdesk_content::ContentStore;
use examdesk_types::{Collection, ToolResult, ToolSchema};

mod adapter;
mod error;
mod query;
mod shaping;

pub use adapter::{QueryAdapter, QueryOutput};
pub use error::QueryError;
pub use query::{
    AggregateParams, CompareParams, Operation, QueryOperation, QueryRequest, SelectParams,
};
pub use shaping::{school_codes_in, split_detail_request, translate_filter, DetailSplit};

pub const QUERY_DATABASE: &str = "query_database";

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult>;
}

/// Tools the assistant may call during a run, keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the database query tool backed by `store`.
    pub fn with_content_store(store: Arc<dyn ContentStore>) -> Self {
        Self::new().with_tool(Arc::new(QueryDatabaseTool::new(QueryAdapter::new(store))))
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.schema().name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self.tools.values().map(|t| t.schema()).collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Returns the registry unchanged when every schema passes
    /// [`validate_tool_schemas`].
    pub fn validated(self) -> Result<Self, ToolSchemaValidationError> {
        validate_tool_schemas(&self.list())?;
        Ok(self)
    }

    pub async fn execute(&self, name: &str, args: Value) -> anyhow::Result<ToolResult> {
        let Some(tool) = self.get(name) else {
            anyhow::bail!("unknown tool `{name}`");
        };
        tool.execute(args).await
    }
}

/// Reads the admissions collections on the assistant's behalf.
pub struct QueryDatabaseTool {
    adapter: QueryAdapter,
}

impl QueryDatabaseTool {
    pub fn new(adapter: QueryAdapter) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl Tool for QueryDatabaseTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: QUERY_DATABASE.to_string(),
            description: "Query the school admissions database. Collections: exam_ai_schools \
                (school name, code, district, province), exam_ai_school_details (program type, \
                application/exam/announcement/report dates, exam location) and \
                exam_ai_school_applicant_summaries (yearly quotas, applicants and pass rates \
                per program). At most 10 rows are returned."
                .to_string(),
            input_schema: query_database_schema(),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let request = QueryRequest::from_arguments(&args)?;
        let output = self.adapter.execute(request).await?;
        let metadata = json!({
            "collection": output.collection,
            "count": output.count,
        });
        Ok(ToolResult {
            output: serde_json::to_string(&output)?,
            metadata,
        })
    }
}

pub fn query_database_schema() -> Value {
    let collections = Collection::ALL.iter().map(|c| c.as_str()).collect::<Vec<_>>();
    let operations = Operation::ALL.iter().map(|o| o.as_str()).collect::<Vec<_>>();
    let string_list = json!({"type": "array", "items": {"type": "string"}});
    json!({
        "type": "object",
        "properties": {
            "collection": {"type": "string", "enum": collections},
            "operation": {"type": "string", "enum": operations},
            "query": {
                "type": "object",
                "properties": {
                    "filter": {"type": "object"},
                    "sort": string_list,
                    "fields": string_list,
                    "limit": {"type": "integer"},
                    "groupBy": string_list,
                    "compare": string_list
                }
            }
        },
        "required": ["collection"]
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

/// Rejects schemas the assistants API refuses at run creation.
pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        if schema.input_schema.get("type").and_then(Value::as_str) != Some("object") {
            return Err(ToolSchemaValidationError {
                tool_name: schema.name.clone(),
                path: "$".to_string(),
                reason: "top-level schema must be an object".to_string(),
            });
        }
        check_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn check_node(tool_name: &str, path: &str, value: &Value) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        return Ok(());
    };
    let fail = |reason: &str| ToolSchemaValidationError {
        tool_name: tool_name.to_string(),
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if obj.get("type").and_then(Value::as_str) == Some("array") && !obj.contains_key("items") {
        return Err(fail("array schema missing items"));
    }
    if let Some(values) = obj.get("enum") {
        if values.as_array().map(|v| v.is_empty()).unwrap_or(true) {
            return Err(fail("enum must be a non-empty array"));
        }
    }
    if let Some(items) = obj.get("items") {
        check_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        for (key, child) in props {
            check_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    if let Some(required) = obj.get("required").and_then(Value::as_array) {
        let props = obj.get("properties").and_then(Value::as_object);
        for name in required.iter().filter_map(Value::as_str) {
            if !props.map(|p| p.contains_key(name)).unwrap_or(false) {
                return Err(fail(&format!("required property `{name}` is not declared")));
            }
        }
    }
    Ok(())
}
