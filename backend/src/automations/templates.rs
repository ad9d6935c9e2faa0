// Placeholder rendering for email content and computed field values

use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

use cadence_shared::Enrollment;

use crate::services::ContactSnapshot;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").expect("placeholder pattern is valid"));

/// Variables a step can reference: the contact's own attributes at the top
/// level plus `contact.*`, `fields.*` and `enrollment.*`.
pub fn render_context(contact: &ContactSnapshot, enrollment: &Enrollment) -> Value {
    let contact_doc = contact.to_document();
    let mut context = match &contact_doc {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    context.insert("contact".to_string(), contact_doc);
    context.insert(
        "enrollment".to_string(),
        json!({
            "id": enrollment.id,
            "automation_id": enrollment.automation_id,
            "started_at": enrollment.started_at,
            "sequence": enrollment.sequence,
        }),
    );
    Value::Object(context)
}

/// Resolve a dotted path such as `fields.company` or `tags.0`
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Replace `{{path}}` placeholders. Unknown paths are left as written.
pub fn render_str(template: &str, variables: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| match lookup(variables, &caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) => String::new(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Render every string inside a JSON value
pub fn render_value(value: &Value, variables: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(render_str(s, variables)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, variables)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, variables)).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_render_context_paths() {
        let mut contact = ContactSnapshot::new(Uuid::new_v4()).with_field("company", json!("Acme"));
        contact.first_name = Some("Grace".to_string());
        let enrollment = Enrollment::new(Uuid::new_v4(), contact.id, Utc::now());
        let context = render_context(&contact, &enrollment);

        assert_eq!(
            render_str("Hi {{first_name}} from {{ fields.company }}", &context),
            "Hi Grace from Acme"
        );
        assert_eq!(render_str("{{contact.first_name}}", &context), "Grace");
        assert_eq!(render_str("{{enrollment.id}}", &context), enrollment.id.to_string());
    }

    #[test]
    fn test_unknown_placeholder_kept() {
        assert_eq!(render_str("Hello {{missing.path}}", &json!({})), "Hello {{missing.path}}");
        assert_eq!(render_str("{{last_name}}", &json!({ "last_name": null })), "");
    }

    #[test]
    fn test_render_value_nested() {
        let vars = json!({ "n": 3, "tags": ["a", "b"] });
        let rendered = render_value(&json!({ "count": "{{n}}", "list": ["{{tags.1}}"], "flag": true }), &vars);
        assert_eq!(rendered, json!({ "count": "3", "list": ["b"], "flag": true }));
    }
}
