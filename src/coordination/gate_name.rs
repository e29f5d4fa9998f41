//! Gate name template resolution.
//!
//! Templates like `embed:{tenant_id}` are interpolated from the work item's
//! arguments. Resolution fails open: an argument key that is missing or not
//! representable as a scalar leaves the placeholder literal in the name and
//! records it, so a template typo narrows concurrency instead of blocking
//! dispatch.

use serde_json::Value;
use tracing::warn;

/// Outcome of resolving a gate name template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    pub name: String,
    /// Placeholder keys that could not be resolved from the arguments
    pub missing_keys: Vec<String>,
}

impl ResolvedName {
    pub fn is_fully_resolved(&self) -> bool {
        self.missing_keys.is_empty()
    }
}

/// Interpolate `{key}` placeholders in `template` from `args`.
///
/// Only scalar argument values (strings, numbers, booleans) are substituted.
/// Unmatched braces are treated as literal text.
pub fn resolve(template: &str, args: &Value) -> ResolvedName {
    let mut name = String::with_capacity(template.len());
    let mut missing_keys = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        name.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let key = &after_open[..close];
                match scalar_arg(args, key) {
                    Some(value) => name.push_str(&value),
                    None => {
                        // Keep the placeholder literal; callers still get a
                        // usable (if narrower) gate name
                        name.push('{');
                        name.push_str(key);
                        name.push('}');
                        missing_keys.push(key.to_string());
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                // Unterminated brace, keep everything as-is
                name.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    name.push_str(rest);

    if !missing_keys.is_empty() {
        warn!(
            template = template,
            missing_keys = ?missing_keys,
            "Gate name template has unresolved placeholders"
        );
    }

    ResolvedName { name, missing_keys }
}

fn scalar_arg(args: &Value, key: &str) -> Option<String> {
    match args.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_full_resolution() {
        let resolved = resolve("embed:{tenant_id}:{model}", &json!({
            "tenant_id": "acme",
            "model": "small"
        }));
        assert_eq!(resolved.name, "embed:acme:small");
        assert!(resolved.is_fully_resolved());
    }

    #[test]
    fn test_numeric_and_bool_args() {
        let resolved = resolve("shard:{n}:{hot}", &json!({"n": 7, "hot": true}));
        assert_eq!(resolved.name, "shard:7:true");
    }

    #[test]
    fn test_missing_key_fails_open() {
        let resolved = resolve("embed:{tenant_id}", &json!({"other": 1}));
        assert_eq!(resolved.name, "embed:{tenant_id}");
        assert_eq!(resolved.missing_keys, vec!["tenant_id".to_string()]);
    }

    #[test]
    fn test_non_scalar_arg_fails_open() {
        let resolved = resolve("embed:{cfg}", &json!({"cfg": {"nested": 1}}));
        assert_eq!(resolved.name, "embed:{cfg}");
        assert!(!resolved.is_fully_resolved());
    }

    #[test]
    fn test_template_without_placeholders() {
        let resolved = resolve("global_gate", &json!({}));
        assert_eq!(resolved.name, "global_gate");
        assert!(resolved.is_fully_resolved());
    }

    #[test]
    fn test_unterminated_brace_kept_literal() {
        let resolved = resolve("embed:{tenant", &json!({"tenant": "x"}));
        assert_eq!(resolved.name, "embed:{tenant");
        assert!(resolved.is_fully_resolved());
    }

    proptest! {
        #[test]
        fn prop_plain_templates_pass_through(template in "[a-z:_]{0,40}") {
            let resolved = resolve(&template, &json!({}));
            prop_assert_eq!(&resolved.name, &template);
            prop_assert!(resolved.is_fully_resolved());
        }

        #[test]
        fn prop_resolved_keys_never_reported_missing(
            key in "[a-z_]{1,10}",
            value in "[a-z0-9]{1,10}"
        ) {
            let template = format!("gate:{{{key}}}");
            let args = json!({ key.clone(): value.clone() });
            let resolved = resolve(&template, &args);
            prop_assert_eq!(&resolved.name, &format!("gate:{value}"));
            prop_assert!(resolved.is_fully_resolved());
        }
    }
}
