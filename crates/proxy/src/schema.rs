//! Tool-schema adaptation for backend dialects.
//!
//! Local inference servers accept different subsets of JSON Schema. The
//! adapter rewrites a tool's input schema for the target dialect: union
//! keywords are resolved away, deep object nesting is flattened for
//! grammar-constrained backends, descriptions are capped, and unsupported
//! keywords are scrubbed. Every transform is deterministic and idempotent;
//! the adapter is a pure function from `(dialect, schema)` to `schema'`.

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::messages::{anthropic, openai};

/// Structures nested deeper than this are rejected outright.
const MAX_SCHEMA_DEPTH: usize = 10;

/// Formats kept when a dialect only understands the common set.
const COMMON_FORMATS: &[&str] = &["date-time", "date", "time", "email", "uri", "uuid"];

/// Schema adaptation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// The schema structure exceeds [`MAX_SCHEMA_DEPTH`] levels. The tool is
    /// omitted from the outgoing request.
    #[error("schema nesting exceeds {MAX_SCHEMA_DEPTH} levels")]
    TooDeep,
}

/// How a dialect treats `additionalProperties` on object schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdditionalProperties {
    /// Leave the schema as written.
    Keep,
    /// The backend requires an explicit `false` on every object.
    ForceFalse,
    /// The backend rejects the keyword entirely.
    Strip,
}

/// Schema dialect of the target backend, resolved by model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDialect {
    /// No rewriting beyond union resolution and the depth limit.
    Passthrough,
    /// Llama-family: grammar-constrained decoding chokes on deep objects.
    Llama,
    /// Mistral-family: short descriptions, no additionalProperties.
    Mistral,
    /// Qwen-family: medium descriptions, strict object schemas.
    Qwen,
}

impl SchemaDialect {
    /// Resolve the dialect from a model name by substring match. Unknown
    /// models pass through untouched.
    pub fn for_model(model: &str) -> Self {
        let model = model.to_ascii_lowercase();

        if model.contains("llama") {
            Self::Llama
        } else if model.contains("mistral") || model.contains("mixtral") || model.contains("ministral") {
            Self::Mistral
        } else if model.contains("qwen") {
            Self::Qwen
        } else {
            Self::Passthrough
        }
    }

    /// Object schemas nested at or below this depth are flattened to strings.
    fn object_nesting_cap(self) -> Option<usize> {
        match self {
            Self::Llama => Some(2),
            _ => None,
        }
    }

    /// Character cap on tool descriptions.
    fn description_cap(self) -> Option<usize> {
        match self {
            Self::Mistral => Some(100),
            Self::Qwen => Some(200),
            _ => None,
        }
    }

    fn additional_properties(self) -> AdditionalProperties {
        match self {
            Self::Qwen => AdditionalProperties::ForceFalse,
            Self::Mistral => AdditionalProperties::Strip,
            Self::Llama | Self::Passthrough => AdditionalProperties::Keep,
        }
    }

    fn keeps_format(self, format: &str) -> bool {
        match self {
            Self::Passthrough => true,
            _ => COMMON_FORMATS.contains(&format),
        }
    }
}

/// Adapt one Anthropic tool definition into the OpenAI shape expected by the
/// target dialect. Returns [`SchemaError::TooDeep`] when the schema is beyond
/// saving; the caller omits the tool and logs a warning.
pub fn adapt_tool(dialect: SchemaDialect, tool: &anthropic::Tool) -> Result<openai::Tool, SchemaError> {
    let schema = adapt_schema(dialect, tool.input_schema.clone())?;

    let description = match dialect.description_cap() {
        Some(cap) => truncate_description(&tool.description, cap),
        None => tool.description.clone(),
    };

    Ok(openai::Tool {
        tool_type: openai::ToolType::Function,
        function: openai::FunctionDefinition {
            name: tool.name.clone(),
            description,
            parameters: schema,
        },
    })
}

/// Rewrite a JSON Schema fragment for the target dialect.
pub fn adapt_schema(dialect: SchemaDialect, mut schema: Value) -> Result<Value, SchemaError> {
    resolve_unions(&mut schema);

    if let Some(cap) = dialect.object_nesting_cap() {
        cap_object_nesting(&mut schema, 0, cap);
    }

    scrub_keywords(&mut schema, dialect);
    apply_additional_properties(&mut schema, dialect.additional_properties());

    if container_depth(&schema) > MAX_SCHEMA_DEPTH {
        return Err(SchemaError::TooDeep);
    }

    Ok(schema)
}

/// Resolve `oneOf`/`anyOf`/`allOf` and multi-valued `type` arrays, recursively.
/// A schema without union keywords passes through unchanged.
fn resolve_unions(value: &mut Value) {
    match value {
        Value::Object(map) => {
            collapse_type_array(map);

            if let Some(Value::Array(members)) = map.remove("allOf").map(normalize_members) {
                merge_all_of(map, members);
            }

            for keyword in ["oneOf", "anyOf"] {
                if let Some(Value::Array(members)) = map.remove(keyword).map(normalize_members) {
                    merge_first_non_null(map, members);
                }
            }

            for child in map.values_mut() {
                resolve_unions(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                resolve_unions(item);
            }
        }
        _ => {}
    }
}

fn normalize_members(value: Value) -> Value {
    match value {
        Value::Array(members) => Value::Array(members),
        other => Value::Array(vec![other]),
    }
}

/// `type: [a, b, ...]` collapses to the first non-`"null"` entry.
fn collapse_type_array(map: &mut Map<String, Value>) {
    let Some(Value::Array(types)) = map.get("type") else {
        return;
    };

    let picked = types
        .iter()
        .find(|t| t.as_str() != Some("null"))
        .or_else(|| types.first())
        .cloned();

    match picked {
        Some(t) => {
            map.insert("type".to_string(), t);
        }
        None => {
            map.remove("type");
        }
    }
}

/// `allOf`: union the properties, union and dedup `required`, adopt `type`
/// when all members agree.
fn merge_all_of(map: &mut Map<String, Value>, members: Vec<Value>) {
    let mut properties = Map::new();
    let mut required: Vec<Value> = Vec::new();
    let mut types: Vec<Value> = Vec::new();

    if let Some(Value::Object(existing)) = map.remove("properties") {
        properties.extend(existing);
    }
    if let Some(Value::Array(existing)) = map.remove("required") {
        required.extend(existing);
    }

    for member in members {
        let Value::Object(member) = member else { continue };

        for (key, value) in member {
            match key.as_str() {
                "properties" => {
                    if let Value::Object(props) = value {
                        properties.extend(props);
                    }
                }
                "required" => {
                    if let Value::Array(names) = value {
                        for name in names {
                            if !required.contains(&name) {
                                required.push(name);
                            }
                        }
                    }
                }
                "type" => types.push(value),
                _ => {
                    map.entry(key).or_insert(value);
                }
            }
        }
    }

    if !properties.is_empty() {
        map.insert("properties".to_string(), Value::Object(properties));
    }
    if !required.is_empty() {
        map.insert("required".to_string(), Value::Array(required));
    }
    if !types.is_empty() && types.iter().all(|t| *t == types[0]) && !map.contains_key("type") {
        map.insert("type".to_string(), types.into_iter().next().unwrap_or(Value::Null));
    }
}

/// `oneOf`/`anyOf`: pick the first member whose `type` is not `"null"` and
/// merge its fields into the parent, parent fields winning.
fn merge_first_non_null(map: &mut Map<String, Value>, members: Vec<Value>) {
    let picked = members
        .iter()
        .find(|m| m.get("type").and_then(Value::as_str) != Some("null"))
        .or_else(|| members.first())
        .cloned();

    let Some(Value::Object(member)) = picked else { return };

    for (key, value) in member {
        map.entry(key).or_insert(value);
    }
}

/// Flatten object schemas nested at `cap` levels or deeper to opaque strings.
fn cap_object_nesting(value: &mut Value, depth: usize, cap: usize) {
    let Value::Object(map) = value else {
        if let Value::Array(items) = value {
            for item in items {
                cap_object_nesting(item, depth, cap);
            }
        }
        return;
    };

    let is_object_schema = map.get("type").and_then(Value::as_str) == Some("object");

    if is_object_schema && depth >= cap {
        *value = json!({"type": "string", "description": "JSON object (flattened)"});
        return;
    }

    let child_depth = if is_object_schema { depth + 1 } else { depth };

    if let Some(Value::Object(properties)) = map.get_mut("properties") {
        for property in properties.values_mut() {
            cap_object_nesting(property, child_depth, cap);
        }
    }

    if let Some(items) = map.get_mut("items") {
        cap_object_nesting(items, child_depth, cap);
    }

    if let Some(additional) = map.get_mut("additionalProperties")
        && additional.is_object()
    {
        cap_object_nesting(additional, child_depth, cap);
    }
}

/// Drop keywords the backend cannot handle: root self-references,
/// pattern-less `propertyNames`, unknown `format` values.
fn scrub_keywords(value: &mut Value, dialect: SchemaDialect) {
    match value {
        Value::Object(map) => {
            if map.get("$ref").and_then(Value::as_str) == Some("#") {
                map.remove("$ref");
            }

            let drop_property_names = matches!(
                map.get("propertyNames"),
                Some(Value::Object(inner)) if !inner.contains_key("pattern")
            );
            if drop_property_names {
                map.remove("propertyNames");
            }

            let drop_format = matches!(
                map.get("format").and_then(Value::as_str),
                Some(format) if !dialect.keeps_format(format)
            );
            if drop_format {
                map.remove("format");
            }

            for child in map.values_mut() {
                scrub_keywords(child, dialect);
            }
        }
        Value::Array(items) => {
            for item in items {
                scrub_keywords(item, dialect);
            }
        }
        _ => {}
    }
}

fn apply_additional_properties(value: &mut Value, policy: AdditionalProperties) {
    if policy == AdditionalProperties::Keep {
        return;
    }

    match value {
        Value::Object(map) => {
            if map.get("type").and_then(Value::as_str) == Some("object") {
                match policy {
                    AdditionalProperties::ForceFalse => {
                        map.insert("additionalProperties".to_string(), Value::Bool(false));
                    }
                    AdditionalProperties::Strip => {
                        map.remove("additionalProperties");
                    }
                    AdditionalProperties::Keep => {}
                }
            }

            for child in map.values_mut() {
                apply_additional_properties(child, policy);
            }
        }
        Value::Array(items) => {
            for item in items {
                apply_additional_properties(item, policy);
            }
        }
        _ => {}
    }
}

/// Nesting depth of the raw JSON structure: scalars are 0, containers are one
/// more than their deepest child.
fn container_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(container_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(container_depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Cap a description at the last sentence boundary within `cap` characters,
/// else hard-cut with an ellipsis. Already-short descriptions pass through.
fn truncate_description(description: &str, cap: usize) -> String {
    if description.chars().count() <= cap {
        return description.to_string();
    }

    let head: String = description.chars().take(cap).collect();

    if let Some(boundary) = head.rfind(['.', '!', '?']) {
        return head[..=boundary].trim_end().to_string();
    }

    let mut cut: String = head.chars().take(cap.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
