// Task templates: parameterized sequence documents.
//
// A template is a JSON document carrying `${param}` placeholders plus a
// `_template` descriptor (name, version, declared parameters). Instantiation
// runs in two passes: template parameters are bound first by plain string
// substitution, then the macro engine expands whatever tokens remain.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde_json::Value;
use tracing::{debug, warn};

use crate::engine::MacroEngine;
use crate::error::TemplateError;

/// A registered sequence template.
#[derive(Debug, Clone)]
pub struct TaskTemplate {
    pub name: String,
    pub description: String,
    /// JSON text with `${param}` placeholders in string positions.
    pub content: String,
    pub required_params: Vec<String>,
    /// Per-parameter schema: `{"param": {"type": "...", ...}}`.
    pub parameter_schema: Value,
    pub category: String,
    pub version: String,
}

impl TaskTemplate {
    /// Validates the supplied parameters against the declared requirements.
    pub fn validate_params(&self, params: &Value) -> Result<(), TemplateError> {
        let map = params.as_object().ok_or_else(|| {
            TemplateError::InvalidArgument("template parameters must be an object".to_string())
        })?;
        for required in &self.required_params {
            if !map.contains_key(required) {
                return Err(TemplateError::MissingParameter(format!(
                    "{} (template {})",
                    required, self.name
                )));
            }
        }
        if let Some(schema) = self.parameter_schema.as_object() {
            for (name, spec) in schema {
                let Some(value) = map.get(name) else { continue };
                if let Some(expected) = spec.get("type").and_then(Value::as_str) {
                    if !type_matches(expected, value) {
                        return Err(TemplateError::InvalidArgument(format!(
                            "parameter '{name}' should be {expected}"
                        )));
                    }
                }
                if let Some(allowed) = spec.get("enum").and_then(Value::as_array) {
                    if !allowed.contains(value) {
                        return Err(TemplateError::InvalidArgument(format!(
                            "parameter '{name}' is not one of the allowed values"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Binds parameters (pass one) and returns the still-unexpanded document.
    fn bind(&self, params: &Value) -> Result<Value, TemplateError> {
        self.validate_params(params)?;
        let map = params.as_object().expect("validated above");

        let mut text = self.content.clone();
        for (name, value) in map {
            let quoted = format!("\"${{{name}}}\"");
            let bare = format!("${{{name}}}");
            // A placeholder occupying a whole JSON string takes the value's
            // native JSON form; embedded placeholders take its string form.
            let encoded = serde_json::to_string(value)?;
            text = text.replace(&quoted, &encoded);
            let inline = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text = text.replace(&bare, &inline);
        }

        let mut doc: Value = serde_json::from_str(&text)?;
        if let Some(obj) = doc.as_object_mut() {
            obj.remove("_template");
        }
        Ok(doc)
    }

    /// Full two-pass instantiation: bind parameters, then expand macros.
    pub fn instantiate(
        &self,
        params: &Value,
        macros: &MacroEngine,
    ) -> Result<Value, TemplateError> {
        let mut doc = self.bind(params)?;
        macros.process_json(&mut doc)?;
        Ok(doc)
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

/// Thread-safe template registry.
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, TaskTemplate>>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, template: TaskTemplate) {
        debug!(name = %template.name, "registering template");
        self.templates
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(template.name.clone(), template);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.templates
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<TaskTemplate> {
        self.templates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .templates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Registers the built-in exposure templates.
    pub fn register_builtins(&self) {
        for template in builtin_templates() {
            self.register(template);
        }
    }

    /// Loads every `*.json` template in a directory. Files without a valid
    /// `_template` descriptor are skipped with a warning. Returns the number
    /// of templates loaded.
    pub fn load_from_directory(&self, dir: &Path) -> Result<usize, TemplateError> {
        let mut loaded = 0usize;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = std::fs::read_to_string(&path)?;
            match parse_template_file(&text) {
                Ok(template) => {
                    self.register(template);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping invalid template file");
                }
            }
        }
        Ok(loaded)
    }
}

fn parse_template_file(text: &str) -> Result<TaskTemplate, TemplateError> {
    let doc: Value = serde_json::from_str(text)?;
    let descriptor = doc
        .get("_template")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            TemplateError::Template("template file is missing a _template object".to_string())
        })?;
    let name = descriptor
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| TemplateError::Template("_template.name must be a string".to_string()))?
        .to_string();
    let version = descriptor
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or("1.0.0")
        .to_string();
    let description = descriptor
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let category = descriptor
        .get("category")
        .and_then(Value::as_str)
        .unwrap_or("General")
        .to_string();
    let (required_params, parameter_schema) = match descriptor.get("parameters") {
        Some(Value::Array(names)) => (
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Value::Object(serde_json::Map::new()),
        ),
        Some(Value::Object(schema)) => (
            schema.keys().cloned().collect(),
            Value::Object(schema.clone()),
        ),
        _ => (Vec::new(), Value::Object(serde_json::Map::new())),
    };

    Ok(TaskTemplate {
        name,
        description,
        content: text.to_string(),
        required_params,
        parameter_schema,
        category,
        version,
    })
}

/// Built-in exposure templates.
pub fn builtin_templates() -> Vec<TaskTemplate> {
    let basic_exposure = TaskTemplate {
        name: "BasicExposure".to_string(),
        description: "Single exposure against one target".to_string(),
        content: r#"{
  "name": "${targetName} session",
  "state": 0,
  "maxConcurrentTargets": 1,
  "targets": [
    {
      "name": "${targetName}",
      "enabled": true,
      "maxRetries": 3,
      "cooldown": 5,
      "tasks": [
        {
          "name": "Exposure",
          "type": "TakeExposure",
          "params": {
            "exposure": "${exposureTime}",
            "type": "${frameType}",
            "binning": "${binning}",
            "gain": "${gain}",
            "offset": "${offset}"
          }
        }
      ]
    }
  ]
}"#
        .to_string(),
        required_params: vec![
            "targetName".to_string(),
            "exposureTime".to_string(),
            "frameType".to_string(),
            "binning".to_string(),
            "gain".to_string(),
            "offset".to_string(),
        ],
        parameter_schema: serde_json::json!({
            "targetName": {"type": "string", "description": "Name of the target"},
            "exposureTime": {"type": "number", "description": "Exposure time in seconds"},
            "frameType": {"type": "string", "enum": ["light", "dark", "bias", "flat"]},
            "binning": {"type": "integer", "description": "Binning factor"},
            "gain": {"type": "integer", "description": "Camera gain"},
            "offset": {"type": "integer", "description": "Camera offset"}
        }),
        category: "Exposure".to_string(),
        version: "1.0.0".to_string(),
    };

    let multiple_exposure = TaskTemplate {
        name: "MultipleExposure".to_string(),
        description: "Repeated exposures against one target".to_string(),
        content: r#"{
  "name": "${targetName} session",
  "state": 0,
  "maxConcurrentTargets": 1,
  "targets": [
    {
      "name": "${targetName}",
      "enabled": true,
      "maxRetries": 3,
      "cooldown": 5,
      "tasks": [
        {
          "name": "MultipleExposure",
          "type": "TakeManyExposure",
          "params": {
            "count": "${count}",
            "exposure": "${exposureTime}",
            "type": "${frameType}",
            "binning": "${binning}",
            "gain": "${gain}",
            "offset": "${offset}"
          }
        }
      ]
    }
  ]
}"#
        .to_string(),
        required_params: vec![
            "targetName".to_string(),
            "count".to_string(),
            "exposureTime".to_string(),
            "frameType".to_string(),
            "binning".to_string(),
            "gain".to_string(),
            "offset".to_string(),
        ],
        parameter_schema: serde_json::json!({
            "targetName": {"type": "string"},
            "count": {"type": "integer"},
            "exposureTime": {"type": "number"},
            "frameType": {"type": "string", "enum": ["light", "dark", "bias", "flat"]},
            "binning": {"type": "integer"},
            "gain": {"type": "integer"},
            "offset": {"type": "integer"}
        }),
        category: "Exposure".to_string(),
        version: "1.0.0".to_string(),
    };

    vec![basic_exposure, multiple_exposure]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn basic_exposure_instantiates_with_native_types() {
        let registry = TemplateRegistry::new();
        registry.register_builtins();
        let macros = MacroEngine::new();

        let template = registry.get("BasicExposure").unwrap();
        let doc = template
            .instantiate(
                &json!({
                    "targetName": "M42",
                    "exposureTime": 30.0,
                    "frameType": "light",
                    "binning": 1,
                    "gain": 100,
                    "offset": 10
                }),
                &macros,
            )
            .unwrap();

        let target = &doc["targets"][0];
        assert_eq!(target["name"], "M42");
        let params = &target["tasks"][0]["params"];
        assert_eq!(params["exposure"], json!(30.0));
        assert_eq!(params["type"], "light");
        assert_eq!(params["binning"], json!(1));
        assert_eq!(params["gain"], json!(100));
        assert_eq!(params["offset"], json!(10));
    }

    #[test]
    fn missing_required_parameter_fails() {
        let registry = TemplateRegistry::new();
        registry.register_builtins();
        let macros = MacroEngine::new();
        let template = registry.get("BasicExposure").unwrap();
        let err = template
            .instantiate(&json!({"targetName": "M42"}), &macros)
            .unwrap_err();
        assert!(matches!(err, TemplateError::MissingParameter(_)));
    }

    #[test]
    fn schema_type_mismatch_fails() {
        let registry = TemplateRegistry::new();
        registry.register_builtins();
        let macros = MacroEngine::new();
        let template = registry.get("BasicExposure").unwrap();
        let err = template
            .instantiate(
                &json!({
                    "targetName": "M42",
                    "exposureTime": "thirty",
                    "frameType": "light",
                    "binning": 1,
                    "gain": 100,
                    "offset": 10
                }),
                &macros,
            )
            .unwrap_err();
        assert!(matches!(err, TemplateError::InvalidArgument(_)));
    }

    #[test]
    fn macros_run_after_parameter_binding() {
        let registry = TemplateRegistry::new();
        registry.register(TaskTemplate {
            name: "Shouty".to_string(),
            description: String::new(),
            content: r#"{"name": "${uppercase(${label})}", "targets": []}"#.to_string(),
            required_params: vec!["label".to_string()],
            parameter_schema: json!({}),
            category: "Test".to_string(),
            version: "1.0.0".to_string(),
        });
        let macros = MacroEngine::new();
        let template = registry.get("Shouty").unwrap();
        let doc = template
            .instantiate(&json!({"label": "carina"}), &macros)
            .unwrap();
        assert_eq!(doc["name"], "CARINA");
    }

    #[test]
    fn load_templates_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("mosaic.json");
        std::fs::write(
            &good,
            r#"{
              "_template": {"name": "Mosaic", "version": "2.0.0", "parameters": ["targetName"]},
              "name": "${targetName}",
              "targets": []
            }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a template").unwrap();

        let registry = TemplateRegistry::new();
        let loaded = registry.load_from_directory(dir.path()).unwrap();
        assert_eq!(loaded, 1);
        let template = registry.get("Mosaic").unwrap();
        assert_eq!(template.version, "2.0.0");
        assert_eq!(template.required_params, vec!["targetName".to_string()]);

        // _template descriptor is stripped on instantiation
        let macros = MacroEngine::new();
        let doc = template
            .instantiate(&json!({"targetName": "NGC 7000"}), &macros)
            .unwrap();
        assert!(doc.get("_template").is_none());
        assert_eq!(doc["name"], "NGC 7000");
    }
}
