// src/graph/template.rs

//! `{tag}` substitution in command templates.

use crate::errors::{FlowError, Result};
use crate::types::{Tags, format_tags};

/// Render `template`, replacing each `{key}` with the task's tag value.
///
/// `{{` and `}}` produce literal braces. An unknown key or an unclosed
/// placeholder is a configuration error.
pub fn render(template: &str, tags: &Tags) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for k in chars.by_ref() {
                    if k == '}' {
                        closed = true;
                        break;
                    }
                    key.push(k);
                }
                if !closed {
                    return Err(FlowError::ConfigError(format!(
                        "unclosed placeholder in command template: {template}"
                    )));
                }
                let value = tags.get(key.trim()).ok_or_else(|| {
                    FlowError::ConfigError(format!(
                        "command template references unknown tag '{key}' (task tags: {})",
                        format_tags(tags)
                    ))
                })?;
                out.push_str(&value.to_string());
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TagValue, tags};

    #[test]
    fn substitutes_tags() {
        let t = tags([("sample", TagValue::from("a")), ("lane", TagValue::from(2))]);
        assert_eq!(render("bwa {sample}_{lane}.fq", &t).unwrap(), "bwa a_2.fq");
    }

    #[test]
    fn double_braces_are_literal() {
        let t = tags([("x", 1)]);
        assert_eq!(render("awk '{{print $1}}' {x}", &t).unwrap(), "awk '{print $1}' 1");
    }

    #[test]
    fn unknown_or_unclosed_placeholders_fail() {
        let t = tags([("x", 1)]);
        assert!(matches!(render("{y}", &t), Err(FlowError::ConfigError(_))));
        assert!(matches!(render("echo {x", &t), Err(FlowError::ConfigError(_))));
    }
}
