//! Destination and job resolution
//!
//! Both are compiled once per rule and evaluated per item.

use std::sync::Arc;

use ruleflow_core::json::set_pointer;
use ruleflow_core::{ResourceId, ResourcePath};
use serde_json::{json, Map, Value};

use crate::error::{ExecutionError, TemplateError};
use crate::template::{Template, TemplateEngine};

/// Turns item data into the reindex target collection
#[derive(Debug, Clone)]
pub struct DestinationResolver {
    template: Arc<dyn Template>,
}

impl DestinationResolver {
    /// Compile a destination template
    ///
    /// # Errors
    /// Returns error if the template does not compile
    pub fn compile(engine: &dyn TemplateEngine, source: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            template: engine.compile(source)?,
        })
    }

    /// Destination collection for `item`
    ///
    /// # Errors
    /// - `ExecutionError::Template` if rendering fails
    /// - `ExecutionError::Destination` if the result is not a valid path
    pub fn resolve(&self, item: &Value) -> Result<ResourcePath, ExecutionError> {
        let rendered = self.template.render(item)?;
        Ok(rendered.parse()?)
    }
}

/// Job description template of a job rule
///
/// String leaves containing `{{` are templates; everything else is copied
/// as is. The stored template is never modified.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    template: Value,
    fields: Vec<(String, Arc<dyn Template>)>,
    config_pointer: String,
}

impl JobTemplate {
    /// Compile a job template that references the item at `pointer` below `config`
    ///
    /// # Errors
    /// Returns error if any templated leaf does not compile
    pub fn compile(
        engine: &dyn TemplateEngine,
        job: &Map<String, Value>,
        pointer: &str,
    ) -> Result<Self, TemplateError> {
        let template = Value::Object(job.clone());
        let mut fields = Vec::new();
        collect_templates(engine, &template, &mut String::new(), &mut fields)?;
        Ok(Self {
            template,
            fields,
            config_pointer: format!("/config{pointer}"),
        })
    }

    /// Target service as written in the rule, possibly templated
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        self.template.get("service").and_then(Value::as_str)
    }

    /// Service a materialised job is queued for
    ///
    /// # Errors
    /// `ExecutionError::InvalidService` unless the rendered `service` is a
    /// non-empty string usable as one path segment
    pub fn queue_service(job: &Value) -> Result<&str, ExecutionError> {
        let service = job.get("service").and_then(Value::as_str).unwrap_or_default();
        if service.is_empty() || service.contains('/') || service == "." || service == ".." {
            return Err(ExecutionError::InvalidService(service.to_string()));
        }
        Ok(service)
    }

    /// Where the item reference goes in a materialised job
    #[must_use]
    pub fn config_pointer(&self) -> &str {
        &self.config_pointer
    }

    /// Job description for `item`, referencing it by `item_id`
    ///
    /// # Errors
    /// - `ExecutionError::Template` if a templated field fails to render
    /// - `ExecutionError::Pointer` if the reference cannot be injected
    pub fn materialize(&self, item: &Value, item_id: &ResourceId) -> Result<Value, ExecutionError> {
        let mut job = self.template.clone();
        for (pointer, template) in &self.fields {
            let rendered = template.render(item)?;
            if let Some(slot) = job.pointer_mut(pointer) {
                *slot = Value::String(rendered);
            }
        }
        set_pointer(&mut job, &self.config_pointer, json!({ "_id": item_id.as_str() }))?;
        Ok(job)
    }
}

fn collect_templates(
    engine: &dyn TemplateEngine,
    value: &Value,
    pointer: &mut String,
    out: &mut Vec<(String, Arc<dyn Template>)>,
) -> Result<(), TemplateError> {
    match value {
        Value::String(s) if s.contains("{{") => {
            out.push((pointer.clone(), engine.compile(s)?));
        }
        Value::Object(map) => {
            for (key, child) in map {
                let len = pointer.len();
                pointer.push('/');
                pointer.push_str(&key.replace('~', "~0").replace('/', "~1"));
                collect_templates(engine, child, pointer, out)?;
                pointer.truncate(len);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                let len = pointer.len();
                pointer.push('/');
                pointer.push_str(&index.to_string());
                collect_templates(engine, child, pointer, out)?;
                pointer.truncate(len);
            }
        }
        _ => {}
    }
    Ok(())
}
