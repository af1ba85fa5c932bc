use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use examdesk_content::{ContentStore, ItemQuery, MAX_ITEMS};
use examdesk_types::{
    school_key, ApplicantSummary, Collection, School, SchoolDetail, SCHOOL_FK_FIELD,
};

use crate::error::QueryError;
use crate::query::{QueryOperation, QueryRequest, SelectParams};
use crate::shaping::{
    is_uuid, school_code, school_codes_in, split_detail_request, translate_filter,
    with_school_key, DetailSplit, SCHOOL_JOIN_FIELDS,
};

/// Result of one `query_database` call, serialized as the tool output.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryOutput {
    pub collection: Collection,
    pub operation: &'static str,
    pub count: usize,
    pub items: Vec<Value>,
}

/// Runs validated query requests against the content store, joining school
/// rows onto the rows that reference them.
#[derive(Clone)]
pub struct QueryAdapter {
    store: Arc<dyn ContentStore>,
}

impl QueryAdapter {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    pub async fn execute(&self, request: QueryRequest) -> Result<QueryOutput, QueryError> {
        let collection = request.collection;
        let params = match request.operation {
            QueryOperation::Select(params) => params,
            other => return Err(QueryError::UnsupportedOperation(other.operation())),
        };

        let codes = self
            .resolve_school_codes(&school_codes_in(collection, &params.filter))
            .await?;
        let items = match collection {
            Collection::Schools => self.select_schools(params, &codes).await?,
            Collection::SchoolDetails => {
                let rows: Vec<SchoolDetail> =
                    self.select_referencing(collection, &params, &codes).await?;
                let rows = self.attach_schools(rows).await?;
                to_values(collection, &rows)?
            }
            Collection::ApplicantSummaries => {
                let rows: Vec<ApplicantSummary> =
                    self.select_referencing(collection, &params, &codes).await?;
                let rows = self.attach_schools(rows).await?;
                to_values(collection, &rows)?
            }
        };

        Ok(QueryOutput {
            collection,
            operation: "select",
            count: items.len(),
            items,
        })
    }

    async fn read<T: DeserializeOwned>(
        &self,
        collection: Collection,
        query: &ItemQuery,
    ) -> Result<Vec<T>, QueryError> {
        tracing::debug!(
            collection = collection.as_str(),
            limit = query.effective_limit(),
            filter = ?query.filter,
            "reading content items"
        );
        let rows = self
            .store
            .read_items(collection, query)
            .await
            .map_err(|err| QueryError::store(collection, err))?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row).map_err(|err| QueryError::Decode {
                    collection,
                    message: err.to_string(),
                })
            })
            .collect()
    }

    /// Maps public school codes to school UUIDs. Every code must resolve.
    async fn resolve_school_codes(
        &self,
        codes: &[i64],
    ) -> Result<HashMap<i64, String>, QueryError> {
        let mut resolved = HashMap::new();
        for chunk in codes.chunks(MAX_ITEMS as usize) {
            let query = ItemQuery::new()
                .filter(json!({ "code": { "_in": chunk } }))
                .fields(vec!["id".to_string(), "code".to_string()])
                .limit(Some(chunk.len() as i64));
            let schools: Vec<School> = self.read(Collection::Schools, &query).await?;
            for school in schools {
                if let (Some(code), Some(id)) = (school.code, school.id) {
                    resolved.insert(code, id);
                }
            }
        }
        if let Some(missing) = codes.iter().find(|code| !resolved.contains_key(code)) {
            return Err(QueryError::UnresolvedReference {
                collection: Collection::Schools,
                field: "code",
                value: missing.to_string(),
            });
        }
        Ok(resolved)
    }

    async fn select_referencing<T: DeserializeOwned>(
        &self,
        collection: Collection,
        params: &SelectParams,
        codes: &HashMap<i64, String>,
    ) -> Result<Vec<T>, QueryError> {
        let query = ItemQuery::new()
            .filter(Value::Object(translate_filter(collection, &params.filter, codes)))
            .sort(params.sort.clone())
            .fields(with_school_key(&params.fields))
            .limit(params.limit);
        self.read(collection, &query).await
    }

    async fn select_schools(
        &self,
        params: SelectParams,
        codes: &HashMap<i64, String>,
    ) -> Result<Vec<Value>, QueryError> {
        if let Some(split) = split_detail_request(&params.fields, &params.filter) {
            let schools = self.schools_with_details(&params, split, codes).await?;
            return to_values(Collection::Schools, &schools);
        }
        let query = ItemQuery::new()
            .filter(Value::Object(translate_filter(
                Collection::Schools,
                &params.filter,
                codes,
            )))
            .sort(params.sort)
            .fields(params.fields)
            .limit(params.limit);
        let schools: Vec<School> = self.read(Collection::Schools, &query).await?;
        to_values(Collection::Schools, &schools)
    }

    /// Fetches schools, then each school's detail rows in a lookup of its
    /// own, and nests the details under the school. With a detail filter,
    /// schools without a matching detail row are dropped.
    async fn schools_with_details(
        &self,
        params: &SelectParams,
        split: DetailSplit,
        codes: &HashMap<i64, String>,
    ) -> Result<Vec<School>, QueryError> {
        let school_query = ItemQuery::new()
            .filter(Value::Object(translate_filter(
                Collection::Schools,
                &split.school_filter,
                codes,
            )))
            .sort(params.sort.clone())
            .fields(split.school_fields)
            .limit(params.limit);
        let schools: Vec<School> = self.read(Collection::Schools, &school_query).await?;

        let detail_filter =
            translate_filter(Collection::SchoolDetails, &split.detail_filter, codes);
        let mut joined = Vec::with_capacity(schools.len());
        for mut school in schools {
            let Some(id) = school.id.clone() else {
                joined.push(school);
                continue;
            };
            let mut filter = detail_filter.clone();
            filter.insert(SCHOOL_FK_FIELD.to_string(), json!({ "_eq": id }));
            let detail_query = ItemQuery::new()
                .filter(Value::Object(filter))
                .sort(vec!["sort".to_string()])
                .fields(split.detail_fields.clone());
            school.details = self.read(Collection::SchoolDetails, &detail_query).await?;

            if split.detail_filter.is_empty() || !school.details.is_empty() {
                joined.push(school);
            }
        }
        Ok(joined)
    }

    /// Looks up the schools referenced by `rows` in one query and attaches
    /// each match. Rows whose key matches no school are left without one.
    async fn attach_schools<T: ReferencesSchool>(
        &self,
        mut rows: Vec<T>,
    ) -> Result<Vec<T>, QueryError> {
        let mut keys: Vec<String> = Vec::new();
        for key in rows.iter().filter_map(|r| r.school_ref().and_then(school_key)) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            return Ok(rows);
        }

        let (ids, codes): (Vec<String>, Vec<String>) = keys.into_iter().partition(|k| is_uuid(k));
        let codes = codes
            .iter()
            .filter_map(|c| school_code(&Value::String(c.clone())))
            .collect::<Vec<_>>();
        let mut lookups = Vec::new();
        if !ids.is_empty() {
            lookups.push(json!({ "id": { "_in": ids } }));
        }
        if !codes.is_empty() {
            lookups.push(json!({ "code": { "_in": codes } }));
        }
        let filter = match lookups.len() {
            0 => return Ok(rows),
            1 => lookups.remove(0),
            _ => json!({ "_or": lookups }),
        };

        let query = ItemQuery::new()
            .filter(filter)
            .fields(SCHOOL_JOIN_FIELDS.iter().map(|f| f.to_string()).collect());
        let schools: Vec<School> = self.read(Collection::Schools, &query).await?;

        let mut index: HashMap<String, School> = HashMap::new();
        for school in schools {
            if let Some(code) = school.code {
                index.insert(code.to_string(), school.clone());
            }
            if let Some(id) = school.id.clone() {
                index.insert(id, school);
            }
        }
        for row in &mut rows {
            let matched = row
                .school_ref()
                .and_then(school_key)
                .and_then(|key| index.get(&key))
                .cloned();
            row.set_school_info(matched);
        }
        Ok(rows)
    }
}

fn to_values<T: Serialize>(collection: Collection, rows: &[T]) -> Result<Vec<Value>, QueryError> {
    rows.iter()
        .map(|row| {
            serde_json::to_value(row).map_err(|err| QueryError::Decode {
                collection,
                message: err.to_string(),
            })
        })
        .collect()
}

/// Rows carrying a `school` foreign key that can hold the joined school.
trait ReferencesSchool {
    fn school_ref(&self) -> Option<&Value>;
    fn set_school_info(&mut self, school: Option<School>);
}

impl ReferencesSchool for ApplicantSummary {
    fn school_ref(&self) -> Option<&Value> {
        self.school.as_ref()
    }

    fn set_school_info(&mut self, school: Option<School>) {
        self.school_info = school.map(Box::new);
    }
}

impl ReferencesSchool for SchoolDetail {
    fn school_ref(&self) -> Option<&Value> {
        self.school.as_ref()
    }

    fn set_school_info(&mut self, school: Option<School>) {
        self.school_info = school.map(Box::new);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Map;

    use crate::query::{CompareParams, Operation};

    pub(crate) const CENTRAL: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
    pub(crate) const NORTH: &str = "16fd2706-8baf-433b-82eb-8c7fada847da";
    const MISSING: &str = "c56a4180-65aa-42ec-a945-5fd21dec0538";

    /// Serves canned rows per collection and records every request.
    #[derive(Default)]
    pub(crate) struct FakeStore {
        rows: HashMap<Collection, Vec<Value>>,
        failing: Option<Collection>,
        calls: Mutex<Vec<(Collection, ItemQuery)>>,
    }

    impl FakeStore {
        pub(crate) fn with_rows(mut self, collection: Collection, rows: Vec<Value>) -> Self {
            self.rows.insert(collection, rows);
            self
        }

        fn failing_on(mut self, collection: Collection) -> Self {
            self.failing = Some(collection);
            self
        }

        pub(crate) fn calls(&self) -> Vec<(Collection, ItemQuery)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl ContentStore for FakeStore {
        async fn read_items(
            &self,
            collection: Collection,
            query: &ItemQuery,
        ) -> anyhow::Result<Vec<Value>> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((collection, query.clone()));
            if self.failing == Some(collection) {
                anyhow::bail!("You don't have permission to access this.");
            }
            let rows = self.rows.get(&collection).cloned().unwrap_or_default();
            Ok(rows
                .into_iter()
                .filter(|row| matches_filter(row, query.filter.as_ref()))
                .take(query.effective_limit() as usize)
                .collect())
        }
    }

    /// Honors top-level `_eq` and `_icontains` conditions; other operators
    /// match every row.
    fn matches_filter(row: &Value, filter: Option<&Value>) -> bool {
        let Some(filter) = filter.and_then(Value::as_object) else {
            return true;
        };
        filter.iter().all(|(field, condition)| {
            let actual = &row[field.as_str()];
            if let Some(expected) = condition.get("_eq") {
                return actual == expected;
            }
            if let Some(needle) = condition.get("_icontains").and_then(Value::as_str) {
                return actual
                    .as_str()
                    .map(|a| a.to_lowercase().contains(&needle.to_lowercase()))
                    .unwrap_or(false);
            }
            true
        })
    }

    pub(crate) fn schools() -> Vec<Value> {
        vec![
            json!({"id": CENTRAL, "code": 1000, "name": "Central High", "province": "Bangkok"}),
            json!({"id": NORTH, "code": 1024, "name": "North Academy", "province": "Chiang Mai"}),
        ]
    }

    fn select(collection: Collection, query: Value) -> QueryRequest {
        let mut args = json!({ "collection": collection.as_str() });
        if !query.is_null() {
            args["query"] = query;
        }
        QueryRequest::from_arguments(&args).expect("request")
    }

    fn filter_of(query: &ItemQuery) -> Map<String, Value> {
        query
            .filter
            .as_ref()
            .and_then(|f| f.as_object().cloned())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn summaries_get_matching_school_attached_and_unmatched_left_bare() {
        let store = Arc::new(
            FakeStore::default()
                .with_rows(
                    Collection::ApplicantSummaries,
                    vec![
                        json!({"id": 1, "school": CENTRAL, "year": 2022, "total_applicants": 812}),
                        json!({"id": 2, "school": MISSING, "year": 2022, "total_applicants": 40}),
                        json!({"id": 3, "school": 1024, "year": 2022, "total_applicants": 377}),
                    ],
                )
                .with_rows(Collection::Schools, schools()),
        );
        let adapter = QueryAdapter::new(store.clone());

        let output = adapter
            .execute(select(
                Collection::ApplicantSummaries,
                json!({"filter": {"year": 2022}}),
            ))
            .await
            .expect("output");

        assert_eq!(output.count, 3);
        assert_eq!(output.items[0]["school_info"]["name"], "Central High");
        assert!(output.items[1].get("school_info").is_none());
        assert_eq!(output.items[1]["school"], MISSING);
        assert_eq!(output.items[2]["school_info"]["name"], "North Academy");

        let calls = store.calls();
        assert_eq!(calls.len(), 2, "summaries then one school lookup");
        assert_eq!(calls[0].0, Collection::ApplicantSummaries);
        assert_eq!(filter_of(&calls[0].1)["year"], json!({"_eq": 2022}));
        assert_eq!(calls[1].0, Collection::Schools);
        assert_eq!(
            calls[1].1.filter,
            Some(json!({"_or": [
                {"id": {"_in": [CENTRAL, MISSING]}},
                {"code": {"_in": [1024]}}
            ]}))
        );
    }

    #[tokio::test]
    async fn no_request_exceeds_the_item_cap() {
        let many = (0..25)
            .map(|i| json!({"id": i, "school": CENTRAL, "year": 2000 + i}))
            .collect::<Vec<_>>();
        let store = Arc::new(
            FakeStore::default()
                .with_rows(Collection::ApplicantSummaries, many)
                .with_rows(Collection::Schools, schools()),
        );
        let adapter = QueryAdapter::new(store.clone());

        let output = adapter
            .execute(select(
                Collection::ApplicantSummaries,
                json!({"limit": 500, "fields": ["year"]}),
            ))
            .await
            .expect("output");

        assert_eq!(output.count, 10);
        let calls = store.calls();
        assert!(!calls.is_empty());
        for (_, query) in &calls {
            assert!(query.effective_limit() <= MAX_ITEMS);
            assert!(query
                .to_query_pairs()
                .contains(&("limit".to_string(), query.effective_limit().to_string())));
        }
        assert_eq!(calls[0].1.fields, vec!["year", "school"]);
    }

    #[tokio::test]
    async fn numeric_school_filter_is_resolved_to_uuid() {
        let mut north_first = schools();
        north_first.reverse();
        let store = Arc::new(
            FakeStore::default()
                .with_rows(Collection::Schools, north_first)
                .with_rows(
                    Collection::ApplicantSummaries,
                    vec![json!({"id": 3, "school": NORTH, "year": 2022})],
                ),
        );
        let adapter = QueryAdapter::new(store.clone());

        adapter
            .execute(select(
                Collection::ApplicantSummaries,
                json!({"filter": {"school": 1024}}),
            ))
            .await
            .expect("output");

        let calls = store.calls();
        assert_eq!(calls[0].0, Collection::Schools);
        assert_eq!(calls[0].1.filter, Some(json!({"code": {"_in": [1024]}})));
        assert_eq!(calls[1].0, Collection::ApplicantSummaries);
        assert_eq!(filter_of(&calls[1].1)["school"], json!({"_eq": NORTH}));
    }

    #[tokio::test]
    async fn unresolved_school_code_is_an_explicit_error() {
        let store = Arc::new(FakeStore::default().with_rows(Collection::Schools, schools()));
        let adapter = QueryAdapter::new(store.clone());

        let err = adapter
            .execute(select(
                Collection::ApplicantSummaries,
                json!({"filter": {"school": 5555}}),
            ))
            .await
            .expect_err("unresolved");

        assert!(matches!(
            err,
            QueryError::UnresolvedReference { field: "code", ref value, .. } if value == "5555"
        ));
        assert_eq!(store.calls().len(), 1, "summaries are never queried");
    }

    #[tokio::test]
    async fn detail_fields_on_schools_merge_details_by_school() {
        let store = Arc::new(
            FakeStore::default()
                .with_rows(Collection::Schools, schools())
                .with_rows(
                    Collection::SchoolDetails,
                    vec![
                        json!({"id": 10, "school": CENTRAL, "program_type": "science", "exam_date": "2024-03-02", "sort": 1}),
                        json!({"id": 11, "school": CENTRAL, "program_type": "arts", "exam_date": "2024-03-03", "sort": 2}),
                        json!({"id": 12, "school": NORTH, "program_type": "science", "exam_date": "2024-03-09", "sort": 1}),
                    ],
                ),
        );
        let adapter = QueryAdapter::new(store.clone());

        let output = adapter
            .execute(select(
                Collection::Schools,
                json!({"fields": ["name", "exam_date", "program_type"]}),
            ))
            .await
            .expect("output");

        assert_eq!(output.count, 2);
        let central_details = output.items[0]["details"].as_array().expect("details");
        assert_eq!(central_details.len(), 2);
        assert_eq!(central_details[1]["program_type"], "arts");
        assert_eq!(output.items[1]["details"][0]["exam_date"], "2024-03-09");

        let calls = store.calls();
        assert_eq!(calls.len(), 3, "schools then one detail lookup per school");
        assert_eq!(calls[0].0, Collection::Schools);
        assert_eq!(calls[0].1.fields, vec!["name", "id"]);
        assert_eq!(calls[1].0, Collection::SchoolDetails);
        assert_eq!(filter_of(&calls[1].1)["school"], json!({"_eq": CENTRAL}));
        assert_eq!(filter_of(&calls[2].1)["school"], json!({"_eq": NORTH}));
        assert_eq!(
            calls[1].1.fields,
            vec!["exam_date", "program_type", "school", "sort"]
        );
    }

    #[tokio::test]
    async fn one_school_filling_the_detail_cap_does_not_hide_another() {
        let mut details = (0..10)
            .map(|i| {
                json!({"id": i, "school": CENTRAL, "program_type": "science",
                       "exam_date": format!("2024-03-{:02}", i + 1), "sort": i})
            })
            .collect::<Vec<_>>();
        details.push(json!({"id": 99, "school": NORTH, "program_type": "science",
                            "exam_date": "2024-04-01", "sort": 1}));
        details.push(json!({"id": 100, "school": NORTH, "program_type": "arts",
                            "exam_date": "2024-04-02", "sort": 2}));
        let store = Arc::new(
            FakeStore::default()
                .with_rows(Collection::Schools, schools())
                .with_rows(Collection::SchoolDetails, details),
        );
        let adapter = QueryAdapter::new(store.clone());

        let output = adapter
            .execute(select(
                Collection::Schools,
                json!({
                    "fields": ["name", "exam_date"],
                    "filter": {"program_type": "science"}
                }),
            ))
            .await
            .expect("output");

        let names = output
            .items
            .iter()
            .map(|s| s["name"].as_str().unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Central High", "North Academy"]);
        assert_eq!(output.count, 2);
        assert_eq!(output.items[0]["details"].as_array().map(Vec::len), Some(10));
        assert_eq!(output.items[1]["details"][0]["exam_date"], "2024-04-01");
        assert_eq!(output.items[1]["details"].as_array().map(Vec::len), Some(1));
        for (_, query) in store.calls() {
            assert!(query.effective_limit() <= MAX_ITEMS);
        }
    }

    #[tokio::test]
    async fn detail_filter_drops_schools_with_no_matching_detail() {
        let store = Arc::new(
            FakeStore::default()
                .with_rows(Collection::Schools, schools())
                .with_rows(
                    Collection::SchoolDetails,
                    vec![json!({"id": 12, "school": NORTH, "program_type": "arts", "sort": 1})],
                ),
        );
        let adapter = QueryAdapter::new(store);

        let output = adapter
            .execute(select(
                Collection::Schools,
                json!({"fields": ["name", "program_type"], "filter": {"program_type": "arts"}}),
            ))
            .await
            .expect("output");

        assert_eq!(output.count, 1);
        assert_eq!(output.items[0]["name"], "North Academy");
    }

    #[tokio::test]
    async fn details_queried_directly_are_joined_to_their_school() {
        let store = Arc::new(
            FakeStore::default()
                .with_rows(Collection::Schools, schools())
                .with_rows(
                    Collection::SchoolDetails,
                    vec![json!({"id": 12, "school": NORTH, "location": "Main hall"})],
                ),
        );
        let adapter = QueryAdapter::new(store);

        let output = adapter
            .execute(select(Collection::SchoolDetails, Value::Null))
            .await
            .expect("output");

        assert_eq!(output.items[0]["school_info"]["id"], NORTH);
        assert_eq!(output.items[0]["location"], "Main hall");
    }

    #[tokio::test]
    async fn compare_is_rejected_without_touching_the_store() {
        let store = Arc::new(FakeStore::default());
        let adapter = QueryAdapter::new(store.clone());

        let request = QueryRequest {
            collection: Collection::ApplicantSummaries,
            operation: QueryOperation::Compare(CompareParams::default()),
        };
        let err = adapter.execute(request).await.expect_err("unsupported");

        assert!(matches!(err, QueryError::UnsupportedOperation(Operation::Compare)));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn store_failure_is_reported_with_collection() {
        let store = Arc::new(FakeStore::default().failing_on(Collection::Schools));
        let adapter = QueryAdapter::new(store);

        let err = adapter
            .execute(select(Collection::Schools, json!({"filter": {"name": "central"}})))
            .await
            .expect_err("store failure");

        assert_eq!(err.code(), "QUERY_STORE_FAILED");
        assert!(err.to_string().contains("exam_ai_schools"));
        assert!(err.to_string().contains("permission"));
    }
}
