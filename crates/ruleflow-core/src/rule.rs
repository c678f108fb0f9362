//! Rule model
//!
//! A rule binds a watched list, a JSON Schema gate and an action. Rules are
//! authored as JSON documents and decoded here into [`Rule`], whose action is
//! the closed sum type [`RuleAction`]: an unknown `type` cannot be
//! represented past decoding.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::RuleError;
use crate::path::ResourcePath;
use crate::tree::{ItemsPattern, Tree};

/// A decoded rule definition
///
/// Immutable once active: an edited rule is decoded again and replaces the
/// previous definition wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Collection to watch
    pub list: ResourcePath,

    /// JSON Schema an item's full representation must satisfy
    pub schema: Value,

    /// What to do with matching items
    #[serde(flatten)]
    pub action: RuleAction,

    /// Merged into the item's `_meta` when the rule fires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,

    /// Shape to materialise for created containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<Tree>,

    /// Where items live below `list`
    #[serde(default)]
    pub items_path: ItemsPattern,
}

/// Rule action, tagged by the document's `type` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuleAction {
    /// Link the item into a templated destination collection
    Reindex {
        /// Template yielding the destination collection path
        destination: String,
        /// Pin the link to the item's revision
        #[serde(default)]
        versioned: bool,
    },

    /// Create a job resource referencing the item and queue it for a service
    Job {
        /// Job description template; must name its `service`
        job: Map<String, Value>,
        /// Location below the job's `config` where the item reference goes
        pointer: String,
    },
}

impl RuleAction {
    /// Wire name of the action type
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Reindex { .. } => "reindex",
            Self::Job { .. } => "job",
        }
    }
}

/// JSON Schema every rule document must satisfy
#[must_use]
pub fn rule_document_schema() -> Value {
    json!({
        "type": "object",
        "required": ["list", "schema", "type"],
        "properties": {
            "list": { "type": "string", "minLength": 1 },
            "schema": { "type": ["object", "boolean"] },
            "type": { "enum": ["reindex", "job"] },
            "destination": { "type": "string", "minLength": 1 },
            "versioned": { "type": "boolean" },
            "meta": { "type": "object" },
            "tree": { "type": "object" },
            "itemsPath": { "type": "string", "minLength": 1 },
            "job": {
                "type": "object",
                "required": ["service"],
                "properties": { "service": { "type": "string", "minLength": 1 } }
            },
            "pointer": { "type": "string", "pattern": "^(/.*)?$" }
        },
        "allOf": [
            {
                "if": { "properties": { "type": { "const": "reindex" } } },
                "then": { "required": ["destination"] }
            },
            {
                "if": { "properties": { "type": { "const": "job" } } },
                "then": { "required": ["job", "pointer"] }
            }
        ]
    })
}

static RULE_DOCUMENT_VALIDATOR: Lazy<jsonschema::Validator> = Lazy::new(|| {
    jsonschema::validator_for(&rule_document_schema()).expect("built-in rule schema compiles")
});

impl Rule {
    /// Decode a rule from its stored JSON document
    ///
    /// The document is first checked against [`rule_document_schema`], so
    /// every shape problem is reported at once, then decoded.
    ///
    /// # Errors
    /// - `RuleError::InvalidDocument` if the document violates the rule schema
    /// - `RuleError::Decode` if the document cannot be decoded
    pub fn from_document(document: &Value) -> Result<Self, RuleError> {
        let violations: Vec<String> = RULE_DOCUMENT_VALIDATOR
            .iter_errors(document)
            .map(|err| format!("{}: {err}", err.instance_path))
            .collect();
        if !violations.is_empty() {
            return Err(RuleError::InvalidDocument(violations));
        }

        Ok(Self::deserialize(document)?)
    }

    /// Target service of a job rule
    #[must_use]
    pub fn job_service(&self) -> Option<&str> {
        match &self.action {
            RuleAction::Job { job, .. } => job.get("service").and_then(Value::as_str),
            RuleAction::Reindex { .. } => None,
        }
    }
}
