use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Variables available for `{{name}}` interpolation in method parameters.
pub type ExecContext = Map<String, Value>;

/// Substitute `{{variable}}` placeholders from the execution context.
/// Unknown variables are left verbatim so misconfigurations stay visible.
pub fn interpolate(text: &str, context: &ExecContext) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let regex = PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{(\w+)\}\}").expect("valid regex"));

    regex
        .replace_all(text, |caps: &regex::Captures<'_>| {
            match context.get(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, Value)]) -> ExecContext {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn substitutes_strings_and_numbers() {
        let context = ctx(&[("user", json!("ada")), ("attempt", json!(3))]);
        assert_eq!(
            interpolate("hello {{user}}, try {{attempt}}", &context),
            "hello ada, try 3"
        );
    }

    #[test]
    fn unknown_placeholders_survive() {
        let context = ctx(&[]);
        assert_eq!(interpolate("find {{thing}}", &context), "find {{thing}}");
    }
}
