use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::models::{Params, StepId};

/// Values available to `{{...}}` placeholders in step params.
///
/// `{{name}}` resolves against the execution's initial params (dotted paths descend
/// into objects and arrays). `{{steps.<id>.output.<path>}}` resolves against the output
/// of a step that already succeeded. Unresolved placeholders are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    /// Initial execution params
    variables: Params,

    /// Outputs of succeeded steps
    step_outputs: HashMap<StepId, JsonValue>,
}

impl TemplateContext {
    pub fn new(variables: Params) -> Self {
        Self {
            variables,
            step_outputs: HashMap::new(),
        }
    }

    /// Get a variable value
    pub fn get_variable(&self, key: &str) -> Option<&JsonValue> {
        self.variables.get(key)
    }

    /// Record a step output for later reference
    pub fn set_step_output(&mut self, step_id: impl Into<StepId>, output: JsonValue) {
        self.step_outputs.insert(step_id.into(), output);
    }

    pub fn get_step_output(&self, step_id: &str) -> Option<&JsonValue> {
        self.step_outputs.get(step_id)
    }

    /// Resolve a dotted expression such as `host` or `steps.triage.output.severity`
    pub fn resolve(&self, expr: &str) -> Option<&JsonValue> {
        let mut parts = expr.trim().split('.');
        let head = parts.next()?;

        if head == "steps" {
            let step_id = parts.next()?;
            let output = self.step_outputs.get(step_id)?;
            return match parts.next() {
                None => Some(output),
                Some("output") => descend(output, parts),
                Some(_) => None,
            };
        }

        descend(self.variables.get(head)?, parts)
    }

    /// Substitute placeholders in a string
    pub fn substitute_string(&self, template: &str) -> String {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            let expr = &rest[start + 2..start + 2 + len];
            let end = start + 2 + len + 2;

            result.push_str(&rest[..start]);
            match self.resolve(expr) {
                Some(value) => result.push_str(&render(value)),
                None => result.push_str(&rest[start..end]),
            }
            rest = &rest[end..];
        }

        result.push_str(rest);
        result
    }

    /// Substitute placeholders throughout a param map
    pub fn substitute_parameters(&self, params: &Params) -> Params {
        params
            .iter()
            .map(|(key, value)| (key.clone(), self.substitute_json_value(value)))
            .collect()
    }

    fn substitute_json_value(&self, value: &JsonValue) -> JsonValue {
        match value {
            JsonValue::String(s) => {
                // a lone placeholder keeps the referenced value's JSON type
                if let Some(expr) = whole_placeholder(s) {
                    if let Some(resolved) = self.resolve(expr) {
                        return resolved.clone();
                    }
                }
                JsonValue::String(self.substitute_string(s))
            }
            JsonValue::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.substitute_json_value(v)))
                    .collect(),
            ),
            JsonValue::Array(arr) => {
                JsonValue::Array(arr.iter().map(|v| self.substitute_json_value(v)).collect())
            }
            _ => value.clone(),
        }
    }
}

fn descend<'a, 'p>(
    mut value: &'a JsonValue,
    path: impl Iterator<Item = &'p str>,
) -> Option<&'a JsonValue> {
    for segment in path {
        value = match value {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

fn render(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Null => "null".to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> TemplateContext {
        let mut ctx = TemplateContext::new(
            json!({
                "host": "ws-042",
                "port": 8443,
                "owner": {"email": "soc@example.com"}
            })
            .as_object()
            .cloned()
            .unwrap(),
        );
        ctx.set_step_output(
            "triage",
            json!({"severity": "high", "hosts": ["ws-042", "ws-043"], "score": 9.5}),
        );
        ctx
    }

    #[test]
    fn test_substitute_string() {
        let ctx = context();
        assert_eq!(
            ctx.substitute_string("isolate {{host}}:{{port}}"),
            "isolate ws-042:8443"
        );
        assert_eq!(
            ctx.substitute_string("severity={{ steps.triage.output.severity }}"),
            "severity=high"
        );
        assert_eq!(
            ctx.substitute_string("notify {{owner.email}}"),
            "notify soc@example.com"
        );
    }

    #[test]
    fn test_unresolved_placeholders_left_intact() {
        let ctx = context();
        assert_eq!(ctx.substitute_string("{{missing}} and {{host}}"), "{{missing}} and ws-042");
        assert_eq!(ctx.substitute_string("open {{host"), "open {{host");
        assert_eq!(
            ctx.substitute_string("{{steps.unknown.output.x}}"),
            "{{steps.unknown.output.x}}"
        );
    }

    #[test]
    fn test_whole_placeholder_keeps_json_type() {
        let ctx = context();
        let params = json!({
            "port": "{{port}}",
            "targets": "{{steps.triage.output.hosts}}",
            "first": "{{steps.triage.output.hosts.0}}",
            "nested": {"score": "{{steps.triage.output.score}}", "label": "score {{steps.triage.output.score}}"},
            "list": ["{{host}}", 1]
        })
        .as_object()
        .cloned()
        .unwrap();

        let resolved = ctx.substitute_parameters(&params);
        assert_eq!(resolved["port"], json!(8443));
        assert_eq!(resolved["targets"], json!(["ws-042", "ws-043"]));
        assert_eq!(resolved["first"], json!("ws-042"));
        assert_eq!(resolved["nested"]["score"], json!(9.5));
        assert_eq!(resolved["nested"]["label"], json!("score 9.5"));
        assert_eq!(resolved["list"], json!(["ws-042", 1]));
    }

    #[test]
    fn test_resolve_whole_step_output() {
        let ctx = context();
        assert_eq!(ctx.resolve("steps.triage").unwrap()["severity"], "high");
        assert!(ctx.resolve("steps.triage.result").is_none());
        assert!(ctx.get_variable("host").is_some());
    }
}
