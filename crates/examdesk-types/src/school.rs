use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Collections of the admissions dataset exposed to the assistant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Collection {
    #[serde(rename = "exam_ai_schools")]
    Schools,
    #[serde(rename = "exam_ai_school_details")]
    SchoolDetails,
    #[serde(rename = "exam_ai_school_applicant_summaries")]
    ApplicantSummaries,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Schools,
        Collection::SchoolDetails,
        Collection::ApplicantSummaries,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Schools => "exam_ai_schools",
            Collection::SchoolDetails => "exam_ai_school_details",
            Collection::ApplicantSummaries => "exam_ai_school_applicant_summaries",
        }
    }

    /// Whether rows of this collection carry a `school` foreign key.
    pub fn references_school(self) -> bool {
        !matches!(self, Collection::Schools)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCollection(pub String);

impl fmt::Display for UnknownCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown collection `{}`", self.0)
    }
}

impl std::error::Error for UnknownCollection {}

impl FromStr for Collection {
    type Err = UnknownCollection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == trimmed)
            .ok_or_else(|| UnknownCollection(trimmed.to_string()))
    }
}

/// Name of the foreign-key field pointing at [`School`].
pub const SCHOOL_FK_FIELD: &str = "school";

/// Fields that live on [`SchoolDetail`] rather than on [`School`].
pub const DETAIL_FIELDS: [&str; 7] = [
    "program_type",
    "application_start",
    "application_end",
    "exam_date",
    "announcement_date",
    "report_date",
    "location",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct School {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<SchoolDetail>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SchoolDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announcement_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school_info: Option<Box<School>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ApplicantSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_quota: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_applicants: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_in_district: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applicants_in_district: Option<i64>,
    #[serde(
        default,
        deserialize_with = "number_or_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub pass_rate_in_district: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_out_district: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applicants_out_district: Option<i64>,
    #[serde(
        default,
        deserialize_with = "number_or_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub pass_rate_out_district: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_special: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applicants_special: Option<i64>,
    #[serde(
        default,
        deserialize_with = "number_or_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub pass_rate_special: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school_info: Option<Box<School>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Normalizes a foreign-key value to the string form of the referenced id.
///
/// Accepts plain ids (string or number) and expanded relation objects
/// carrying an `id`.
pub fn school_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("id").and_then(school_key),
        _ => None,
    }
}

// Decimal columns come back from the content API as strings.
fn number_or_string<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected number or numeric string, got {other}"
        ))),
    }
}
