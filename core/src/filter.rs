//! The seam to the external filter compiler. The bus only needs
//! `compile(source) -> evaluate(object) -> bool`; the DSL itself lives
//! outside the core.

use concave_proto::JsonObject;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid filter: {0}")]
pub struct FilterError(pub String);

/// A compiled predicate. Evaluation is pure and cheap; compilation happens
/// once per subscription and is cached on the subscription record.
pub trait CompiledFilter: Send + Sync {
    fn matches(&self, object: &JsonObject) -> bool;

    /// The source string the predicate was compiled from.
    fn source(&self) -> &str;
}

pub trait FilterEngine: Send + Sync {
    fn compile(&self, source: &str) -> Result<Arc<dyn CompiledFilter>, FilterError>;
}

/// Matches every object; the compiled form of the empty / `*` filter.
pub struct MatchAll;

impl CompiledFilter for MatchAll {
    fn matches(&self, _object: &JsonObject) -> bool { true }
    fn source(&self) -> &str { "*" }
}

/// Minimal engine for tests and embedding: the filter source is a JSON
/// object whose fields must all be equal on the candidate. `""` and `"*"`
/// compile to [`MatchAll`]. The production DSL compiler plugs in through
/// the same trait.
pub struct JsonFieldEngine;

impl FilterEngine for JsonFieldEngine {
    fn compile(&self, source: &str) -> Result<Arc<dyn CompiledFilter>, FilterError> {
        let trimmed = source.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Ok(Arc::new(MatchAll));
        }
        let fields: JsonObject = serde_json::from_str(trimmed).map_err(|e| FilterError(e.to_string()))?;
        Ok(Arc::new(FieldEquals { source: source.to_string(), fields }))
    }
}

struct FieldEquals {
    source: String,
    fields: JsonObject,
}

impl CompiledFilter for FieldEquals {
    fn matches(&self, object: &JsonObject) -> bool {
        self.fields.iter().all(|(field, expected)| object.get(field) == Some(expected))
    }

    fn source(&self) -> &str { &self.source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(pairs: serde_json::Value) -> JsonObject {
        match pairs {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn wildcard_matches_everything() {
        let engine = JsonFieldEngine;
        for source in ["", "*", "  "] {
            let filter = engine.compile(source).unwrap();
            assert!(filter.matches(&object(json!({"anything": 1}))));
        }
    }

    #[test]
    fn field_equality() {
        let engine = JsonFieldEngine;
        let filter = engine.compile(r#"{"completed": false, "owner": "ada"}"#).unwrap();
        assert!(filter.matches(&object(json!({"completed": false, "owner": "ada", "extra": 1}))));
        assert!(!filter.matches(&object(json!({"completed": true, "owner": "ada"}))));
        assert!(!filter.matches(&object(json!({"owner": "ada"}))));
    }

    #[test]
    fn invalid_source_is_rejected() {
        assert!(JsonFieldEngine.compile("not json").is_err());
    }
}
