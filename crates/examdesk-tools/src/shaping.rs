//! Translation of assistant-written filters and field lists into content API
//! query parameters.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use examdesk_types::{Collection, DETAIL_FIELDS, SCHOOL_FK_FIELD};

/// Largest magnitude at which every integral `f64` is exact.
const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

/// Fields read when a [`examdesk_types::School`] is attached to another row.
pub const SCHOOL_JOIN_FIELDS: [&str; 6] = ["id", "code", "name", "description", "district", "province"];

/// Public school codes referenced by the `school` key of a filter, including
/// inside `_and` / `_or` groups.
pub fn school_codes_in(collection: Collection, filter: &Map<String, Value>) -> Vec<i64> {
    let mut codes = Vec::new();
    collect_codes(collection, filter, &mut codes);
    codes.sort_unstable();
    codes.dedup();
    codes
}

fn collect_codes(collection: Collection, filter: &Map<String, Value>, out: &mut Vec<i64>) {
    for (key, value) in filter {
        if is_logical_group(key) {
            for member in value.as_array().into_iter().flatten() {
                if let Some(map) = member.as_object() {
                    collect_codes(collection, map, out);
                }
            }
            continue;
        }
        if key != SCHOOL_FK_FIELD || !collection.references_school() {
            continue;
        }
        match value {
            Value::Array(items) => out.extend(items.iter().filter_map(school_code)),
            other => out.extend(school_code(other)),
        }
    }
}

/// Translates bare `key: value` pairs into operator filters.
///
/// `codes` must hold a resolved UUID for every code returned by
/// [`school_codes_in`]; unresolved codes are left as-is.
pub fn translate_filter(
    collection: Collection,
    filter: &Map<String, Value>,
    codes: &HashMap<i64, String>,
) -> Map<String, Value> {
    filter
        .iter()
        .map(|(key, value)| {
            let translated = if is_logical_group(key) {
                translate_group(collection, value, codes)
            } else if key == SCHOOL_FK_FIELD && collection.references_school() {
                translate_school_reference(value, codes)
            } else {
                translate_value(collection, value, codes)
            };
            (key.clone(), translated)
        })
        .collect()
}

fn translate_group(collection: Collection, value: &Value, codes: &HashMap<i64, String>) -> Value {
    match value {
        Value::Array(members) => Value::Array(
            members
                .iter()
                .map(|member| match member.as_object() {
                    Some(map) => Value::Object(translate_filter(collection, map, codes)),
                    None => member.clone(),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn translate_value(collection: Collection, value: &Value, codes: &HashMap<i64, String>) -> Value {
    match value {
        Value::Object(map) if is_operator_object(map) => value.clone(),
        // nested relational filter
        Value::Object(map) => Value::Object(translate_filter(collection, map, codes)),
        Value::String(s) => json!({ "_icontains": s }),
        Value::Array(_) => json!({ "_in": value }),
        Value::Null => json!({ "_null": true }),
        _ => json!({ "_eq": value }),
    }
}

fn translate_school_reference(value: &Value, codes: &HashMap<i64, String>) -> Value {
    match value {
        Value::Object(map) if is_operator_object(map) => value.clone(),
        Value::Object(map) => Value::Object(translate_filter(Collection::Schools, map, codes)),
        Value::Array(items) => translate_school_list(items, codes),
        Value::String(s) if !is_uuid(s) && school_code(value).is_none() => {
            json!({ "name": { "_icontains": s.trim() } })
        }
        Value::Null => json!({ "_null": true }),
        other => json!({ "_eq": resolve_reference(other, codes) }),
    }
}

/// Ids and codes match the key itself; anything else is a school name.
fn translate_school_list(items: &[Value], codes: &HashMap<i64, String>) -> Value {
    let (refs, names): (Vec<&Value>, Vec<&Value>) = items.iter().partition(|item| match item {
        Value::String(s) => is_uuid(s) || school_code(item).is_some(),
        _ => true,
    });
    let ids = refs
        .into_iter()
        .map(|item| resolve_reference(item, codes))
        .collect::<Vec<_>>();
    let names = names
        .into_iter()
        .filter_map(Value::as_str)
        .map(|name| Value::String(name.trim().to_string()))
        .collect::<Vec<_>>();

    match (ids.is_empty(), names.is_empty()) {
        (_, true) => json!({ "_in": ids }),
        (true, false) => json!({ "name": { "_in": names } }),
        (false, false) => json!({
            "_or": [
                { "id": { "_in": ids } },
                { "name": { "_in": names } }
            ]
        }),
    }
}

fn resolve_reference(value: &Value, codes: &HashMap<i64, String>) -> Value {
    match school_code(value).and_then(|code| codes.get(&code)) {
        Some(id) => Value::String(id.clone()),
        None => value.clone(),
    }
}

/// A numeric school code, written as an integer, an integral float or a
/// digit string.
pub fn school_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < MAX_EXACT_FLOAT)
                .map(|f| f as i64)
        }),
        Value::String(s) => {
            let trimmed = s.trim();
            if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
                trimmed.parse().ok()
            } else {
                None
            }
        }
        _ => None,
    }
}

pub fn is_uuid(value: &str) -> bool {
    Uuid::parse_str(value.trim()).is_ok()
}

fn is_logical_group(key: &str) -> bool {
    key == "_and" || key == "_or"
}

fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('_'))
}

/// Field list for rows that carry a school reference; the join needs the key.
pub fn with_school_key(fields: &[String]) -> Vec<String> {
    if fields.is_empty() || fields.iter().any(|f| f == "*") {
        return fields.to_vec();
    }
    let mut out = fields
        .iter()
        .filter(|f| f.as_str() != "school_info")
        .cloned()
        .collect::<Vec<_>>();
    let expands_school = out.iter().any(|f| f.starts_with("school."));
    if expands_school {
        if !out.iter().any(|f| f == "school.id" || f == "school.*") {
            out.push("school.id".to_string());
        }
    } else if !out.iter().any(|f| f == SCHOOL_FK_FIELD) {
        out.push(SCHOOL_FK_FIELD.to_string());
    }
    out
}

pub fn is_detail_field(field: &str) -> bool {
    DETAIL_FIELDS.contains(&field)
}

/// A schools request whose fields or filter reach into school details,
/// split into the part each collection can answer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetailSplit {
    pub school_fields: Vec<String>,
    pub detail_fields: Vec<String>,
    pub school_filter: Map<String, Value>,
    pub detail_filter: Map<String, Value>,
}

/// Returns `None` when no requested field is a detail field.
pub fn split_detail_request(fields: &[String], filter: &Map<String, Value>) -> Option<DetailSplit> {
    if !fields.iter().any(|f| is_detail_field(f)) {
        return None;
    }

    let mut school_fields = fields
        .iter()
        .filter(|f| !is_detail_field(f) && f.as_str() != "details")
        .cloned()
        .collect::<Vec<_>>();
    if !school_fields.iter().any(|f| f == "id" || f == "*") {
        school_fields.push("id".to_string());
    }

    let mut detail_fields = fields
        .iter()
        .filter(|f| is_detail_field(f))
        .cloned()
        .collect::<Vec<_>>();
    for required in [SCHOOL_FK_FIELD, "sort"] {
        if !detail_fields.iter().any(|f| f == required) {
            detail_fields.push(required.to_string());
        }
    }

    let (detail_filter, school_filter): (Map<String, Value>, Map<String, Value>) = filter
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .partition(|(k, _)| is_detail_field(k));

    Some(DetailSplit {
        school_fields,
        detail_fields,
        school_filter,
        detail_filter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CENTRAL: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn bare_values_become_operator_filters() {
        let filter = obj(json!({
            "name": "central",
            "year": 2022,
            "active": true,
            "province": null,
            "program": ["science", "arts"],
            "total_applicants": {"_gte": 100}
        }));
        let out = translate_filter(Collection::ApplicantSummaries, &filter, &HashMap::new());
        assert_eq!(out["name"], json!({"_icontains": "central"}));
        assert_eq!(out["year"], json!({"_eq": 2022}));
        assert_eq!(out["active"], json!({"_eq": true}));
        assert_eq!(out["province"], json!({"_null": true}));
        assert_eq!(out["program"], json!({"_in": ["science", "arts"]}));
        assert_eq!(out["total_applicants"], json!({"_gte": 100}));
    }

    #[test]
    fn logical_groups_translate_each_member() {
        let filter = obj(json!({"_or": [{"year": 2021}, {"year": {"_eq": 2022}}]}));
        let out = translate_filter(Collection::ApplicantSummaries, &filter, &HashMap::new());
        assert_eq!(
            out["_or"],
            json!([{"year": {"_eq": 2021}}, {"year": {"_eq": 2022}}])
        );
    }

    #[test]
    fn school_reference_resolves_codes_uuids_and_names() {
        let codes = HashMap::from([(1024_i64, CENTRAL.to_string())]);

        let by_code = translate_filter(
            Collection::ApplicantSummaries,
            &obj(json!({"school": 1024})),
            &codes,
        );
        assert_eq!(by_code["school"], json!({"_eq": CENTRAL}));

        let by_digit_string = translate_filter(
            Collection::SchoolDetails,
            &obj(json!({"school": "1024"})),
            &codes,
        );
        assert_eq!(by_digit_string["school"], json!({"_eq": CENTRAL}));

        let by_uuid = translate_filter(
            Collection::ApplicantSummaries,
            &obj(json!({"school": CENTRAL})),
            &codes,
        );
        assert_eq!(by_uuid["school"], json!({"_eq": CENTRAL}));

        let by_name = translate_filter(
            Collection::ApplicantSummaries,
            &obj(json!({"school": "Central High"})),
            &codes,
        );
        assert_eq!(by_name["school"], json!({"name": {"_icontains": "Central High"}}));

        let relational = translate_filter(
            Collection::ApplicantSummaries,
            &obj(json!({"school": {"province": "Bangkok"}})),
            &codes,
        );
        assert_eq!(relational["school"], json!({"province": {"_icontains": "Bangkok"}}));
    }

    #[test]
    fn school_lists_split_into_references_and_names() {
        let codes = HashMap::from([(1024_i64, CENTRAL.to_string())]);

        let names = translate_filter(
            Collection::ApplicantSummaries,
            &obj(json!({"school": ["Central High", " North Academy "]})),
            &codes,
        );
        assert_eq!(
            names["school"],
            json!({"name": {"_in": ["Central High", "North Academy"]}})
        );

        let refs = translate_filter(
            Collection::SchoolDetails,
            &obj(json!({"school": [1024, CENTRAL]})),
            &codes,
        );
        assert_eq!(refs["school"], json!({"_in": [CENTRAL, CENTRAL]}));

        let mixed = translate_filter(
            Collection::ApplicantSummaries,
            &obj(json!({"school": ["1024", "North Academy"]})),
            &codes,
        );
        assert_eq!(
            mixed["school"],
            json!({"_or": [
                {"id": {"_in": [CENTRAL]}},
                {"name": {"_in": ["North Academy"]}}
            ]})
        );
    }

    #[test]
    fn integral_float_codes_resolve_like_integers() {
        assert_eq!(school_code(&json!(1024.0)), Some(1024));
        assert_eq!(school_code(&json!(1024.5)), None);
        assert_eq!(school_code(&json!(" 77 ")), Some(77));

        let filter = obj(json!({"school": 1024.0}));
        assert_eq!(school_codes_in(Collection::ApplicantSummaries, &filter), vec![1024]);
        let codes = HashMap::from([(1024_i64, CENTRAL.to_string())]);
        let out = translate_filter(Collection::ApplicantSummaries, &filter, &codes);
        assert_eq!(out["school"], json!({"_eq": CENTRAL}));
    }

    #[test]
    fn school_key_on_schools_collection_is_a_plain_field() {
        let out = translate_filter(Collection::Schools, &obj(json!({"school": 5})), &HashMap::new());
        assert_eq!(out["school"], json!({"_eq": 5}));
        assert!(school_codes_in(Collection::Schools, &obj(json!({"school": 5}))).is_empty());
    }

    #[test]
    fn codes_are_collected_from_groups_and_arrays() {
        let filter = obj(json!({
            "school": [1024, CENTRAL, "77"],
            "_and": [{"school": 1024}, {"year": 2022}]
        }));
        assert_eq!(school_codes_in(Collection::ApplicantSummaries, &filter), vec![77, 1024]);
    }

    #[test]
    fn join_key_is_added_to_explicit_field_lists() {
        assert!(with_school_key(&[]).is_empty());
        assert_eq!(with_school_key(&["*".to_string()]), vec!["*"]);
        assert_eq!(
            with_school_key(&["year".to_string(), "school_info".to_string()]),
            vec!["year", "school"]
        );
        assert_eq!(
            with_school_key(&["school.name".to_string()]),
            vec!["school.name", "school.id"]
        );
    }

    #[test]
    fn detail_split_partitions_fields_and_filter() {
        let fields = vec!["name".to_string(), "exam_date".to_string()];
        let filter = obj(json!({"province": "Bangkok", "program_type": "science"}));
        let split = split_detail_request(&fields, &filter).expect("split");
        assert_eq!(split.school_fields, vec!["name", "id"]);
        assert_eq!(split.detail_fields, vec!["exam_date", "school", "sort"]);
        assert_eq!(split.school_filter, obj(json!({"province": "Bangkok"})));
        assert_eq!(split.detail_filter, obj(json!({"program_type": "science"})));

        assert!(split_detail_request(&["name".to_string()], &filter).is_none());
    }
}
