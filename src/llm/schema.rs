// JSON-schema transformations required by specific providers. Schemas travel
// through the gateway as plain `serde_json::Value`s; these walkers rewrite
// them without interpreting anything beyond object/array structure.

use serde_json::Value;

/// Keywords vLLM's `json_object` guided decoding rejects anywhere in a schema.
const BANNED_JSON_OBJECT_KEYWORDS: &[&str] = &[
    "additionalProperties",
    "patternProperties",
    "dependencies",
    "allOf",
    "anyOf",
    "oneOf",
    "not",
    "$ref",
    "format",
];

/// OpenAI strict `json_schema` mode requires `additionalProperties: false` on
/// every object node. Returns a rewritten copy.
pub fn enforce_additional_properties(schema: &Value) -> Value {
    let mut out = schema.clone();
    enforce_in_place(&mut out);
    out
}

fn enforce_in_place(node: &mut Value) {
    match node {
        Value::Object(map) => {
            let is_object_node = map
                .get("type")
                .and_then(Value::as_str)
                .is_some_and(|t| t == "object")
                || map.contains_key("properties");
            if is_object_node {
                map.insert("additionalProperties".to_string(), Value::Bool(false));
            }
            for value in map.values_mut() {
                enforce_in_place(value);
            }
        }
        Value::Array(items) => {
            for item in items {
                enforce_in_place(item);
            }
        }
        _ => {}
    }
}

/// Strip every keyword vLLM's guided decoding cannot handle, recursively.
/// Returns a rewritten copy.
pub fn sanitize_for_json_object(schema: &Value) -> Value {
    let mut out = schema.clone();
    sanitize_in_place(&mut out);
    out
}

fn sanitize_in_place(node: &mut Value) {
    match node {
        Value::Object(map) => {
            for key in BANNED_JSON_OBJECT_KEYWORDS {
                map.remove(*key);
            }
            for value in map.values_mut() {
                sanitize_in_place(value);
            }
        }
        Value::Array(items) => {
            for item in items {
                sanitize_in_place(item);
            }
        }
        _ => {}
    }
}

/// True when any node of `schema` contains one of the banned keywords.
pub fn contains_banned_keyword(schema: &Value) -> bool {
    match schema {
        Value::Object(map) => {
            map.keys()
                .any(|key| BANNED_JSON_OBJECT_KEYWORDS.contains(&key.as_str()))
                || map.values().any(contains_banned_keyword)
        }
        Value::Array(items) => items.iter().any(contains_banned_keyword),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strict_mode_sets_additional_properties_everywhere() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "address": {
                    "type": "object",
                    "properties": { "city": { "type": "string" } }
                },
                "tags": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": { "label": { "type": "string" } }
                    }
                }
            }
        });

        let strict = enforce_additional_properties(&schema);
        assert_eq!(strict["additionalProperties"], json!(false));
        assert_eq!(
            strict["properties"]["address"]["additionalProperties"],
            json!(false)
        );
        assert_eq!(
            strict["properties"]["tags"]["items"]["additionalProperties"],
            json!(false)
        );
        // Non-object nodes are untouched.
        assert!(strict["properties"]["name"]
            .as_object()
            .unwrap()
            .get("additionalProperties")
            .is_none());
    }

    #[test]
    fn sanitizer_removes_every_banned_keyword_recursively() {
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "anyOf": [{ "type": "object" }],
            "properties": {
                "x": { "$ref": "#/definitions/x" },
                "y": {
                    "type": "string",
                    "format": "date-time",
                    "patternProperties": {}
                },
                "z": {
                    "type": "object",
                    "dependencies": {},
                    "properties": {
                        "inner": { "oneOf": [], "not": {}, "allOf": [] }
                    }
                }
            }
        });

        let sanitized = sanitize_for_json_object(&schema);
        assert!(!contains_banned_keyword(&sanitized));
        // Surviving structure is intact.
        assert_eq!(sanitized["type"], json!("object"));
        assert_eq!(sanitized["properties"]["y"]["type"], json!("string"));
        assert!(sanitized["properties"]["z"]["properties"]["inner"]
            .as_object()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn clean_schema_reports_no_banned_keywords() {
        let schema = json!({
            "type": "object",
            "properties": { "city": { "type": "string" } },
            "required": ["city"]
        });
        assert!(!contains_banned_keyword(&schema));
    }
}
