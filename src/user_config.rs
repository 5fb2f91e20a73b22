//! Renders a per-user endpoint config from an admin-supplied Jinja-style
//! YAML template and a user's `user_opts`, gated by a JSON-schema-shaped
//! `user_config_schema` (`spec.md` §4.6, §8: "empty `user_opts` round
//! trips").
//!
//! Not present in the six kept `original_source/` files; built to the
//! shape `endpoint_manager.py`'s caller implies (template + schema +
//! opts in, rendered YAML out) using `serde_yaml`, the ecosystem default
//! for YAML in this pack's absence of a closer match.

use std::path::Path;

use serde_json::Value;

use crate::error::LaunchError;

/// Loads the admin-authored template and optional schema from `conf_dir`,
/// mirroring `endpoint_manager.py`'s `load_user_config_template`: a
/// required `user_config_template.yaml`, and an optional
/// `user_config_schema.json` alongside it.
pub fn load_user_config_template(conf_dir: &Path) -> std::io::Result<(String, Option<Value>)> {
    let template = std::fs::read_to_string(conf_dir.join("user_config_template.yaml"))?;
    let schema = match std::fs::read_to_string(conf_dir.join("user_config_schema.json")) {
        Ok(text) => Some(serde_json::from_str(&text).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };
    Ok((template, schema))
}

/// Renders `user_opts` into a per-user config document.
pub trait UserConfigRenderer: Send + Sync {
    fn render(
        &self,
        template: &str,
        schema: Option<&Value>,
        user_opts: &serde_json::Map<String, Value>,
    ) -> Result<String, LaunchError>;
}

/// Substitutes `{{ user_opts.KEY }}` placeholders in the template with the
/// matching value from `user_opts`, validating against `schema` first when
/// one is supplied.
///
/// This is deliberately not a full templating engine: the original
/// deployment's templates only ever interpolate flat `user_opts` values,
/// so a small regex substitution covers the real surface without pulling
/// in a template-engine dependency no example in the pack uses.
pub struct TemplateUserConfigRenderer;

impl UserConfigRenderer for TemplateUserConfigRenderer {
    fn render(
        &self,
        template: &str,
        schema: Option<&Value>,
        user_opts: &serde_json::Map<String, Value>,
    ) -> Result<String, LaunchError> {
        if let Some(schema) = schema {
            validate_against_schema(schema, user_opts)?;
        }

        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                return Err(LaunchError::TemplateRender(
                    "unterminated {{ in user config template".into(),
                ));
            };
            let key_expr = after[..end].trim();
            let key = key_expr
                .strip_prefix("user_opts.")
                .ok_or_else(|| {
                    LaunchError::TemplateRender(format!(
                        "unsupported template expression: {key_expr}"
                    ))
                })?;
            let value = user_opts.get(key).ok_or_else(|| {
                LaunchError::TemplateRender(format!("user_opts missing key: {key}"))
            })?;
            rendered.push_str(&scalar_to_string(value));
            rest = &after[end + 2..];
        }
        rendered.push_str(rest);

        // The rendered document must itself be valid YAML (`spec.md` §8).
        let _: serde_yaml::Value = serde_yaml::from_str(&rendered)
            .map_err(|e| LaunchError::TemplateRender(format!("rendered config is not valid YAML: {e}")))?;
        Ok(rendered)
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Minimal JSON-schema check: `required` keys present, and declared
/// `properties` types for any key the caller actually supplied. Good
/// enough for the admin-authored schemas this deployment produces;
/// full JSON-schema validation is out of scope.
fn validate_against_schema(
    schema: &Value,
    user_opts: &serde_json::Map<String, Value>,
) -> Result<(), LaunchError> {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required {
            let Some(key) = key.as_str() else { continue };
            if !user_opts.contains_key(key) {
                return Err(LaunchError::TemplateRender(format!(
                    "missing required user_opts key: {key}"
                )));
            }
        }
    }
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in user_opts {
            let Some(expected_type) = properties
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if !value_matches_type(value, expected_type) {
                return Err(LaunchError::TemplateRender(format!(
                    "user_opts.{key} does not match schema type {expected_type}"
                )));
            }
        }
    }
    Ok(())
}

fn value_matches_type(value: &Value, expected_type: &str) -> bool {
    match expected_type {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_user_opts_round_trips_through_a_template_with_no_placeholders() {
        let renderer = TemplateUserConfigRenderer;
        let template = "display_name: fixed\nmax_workers: 4\n";
        let rendered = renderer
            .render(template, None, &serde_json::Map::new())
            .unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert!(parsed.is_mapping());
    }

    #[test]
    fn substitutes_user_opts_placeholder() {
        let renderer = TemplateUserConfigRenderer;
        let template = "max_workers: {{ user_opts.workers }}\n";
        let mut opts = serde_json::Map::new();
        opts.insert("workers".into(), Value::from(8));
        let rendered = renderer.render(template, None, &opts).unwrap();
        assert_eq!(rendered.trim(), "max_workers: 8");
    }

    #[test]
    fn missing_required_key_is_rejected() {
        let renderer = TemplateUserConfigRenderer;
        let schema = serde_json::json!({"required": ["workers"]});
        let rendered = renderer.render("ok: true\n", Some(&schema), &serde_json::Map::new());
        assert!(rendered.is_err());
    }

    #[test]
    fn missing_template_file_is_an_error_but_missing_schema_is_not() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("user_config_template.yaml"), "ok: true\n").unwrap();
        let (template, schema) = load_user_config_template(dir.path()).unwrap();
        assert_eq!(template, "ok: true\n");
        assert!(schema.is_none());

        let empty = tempfile::tempdir().unwrap();
        assert!(load_user_config_template(empty.path()).is_err());
    }

    #[test]
    fn wrong_type_for_declared_property_is_rejected() {
        let renderer = TemplateUserConfigRenderer;
        let schema = serde_json::json!({"properties": {"workers": {"type": "integer"}}});
        let mut opts = serde_json::Map::new();
        opts.insert("workers".into(), Value::from("not-a-number"));
        let rendered = renderer.render("ok: true\n", Some(&schema), &opts);
        assert!(rendered.is_err());
    }
}
