//! Compose-style variable interpolation.
//!
//! Supported forms: `$VAR`, `${VAR}`, `${VAR:-default}`, `${VAR-default}`,
//! `${VAR:?message}`, `${VAR?message}` and the `$$` escape. Unset variables
//! without a default interpolate to the empty string, as compose does.

use std::collections::BTreeMap;

use crate::error::ManifestError;

/// Interpolates every string scalar in a YAML tree. Mapping keys are left alone.
pub fn interpolate_value(
    value: &mut serde_yaml::Value,
    vars: &BTreeMap<String, String>,
) -> Result<(), ManifestError> {
    match value {
        serde_yaml::Value::String(s) => {
            *s = interpolate(s, vars)?;
        }
        serde_yaml::Value::Sequence(seq) => {
            for item in seq {
                interpolate_value(item, vars)?;
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                interpolate_value(item, vars)?;
            }
        }
        serde_yaml::Value::Tagged(tagged) => interpolate_value(&mut tagged.value, vars)?,
        _ => {}
    }
    Ok(())
}

/// Interpolates a single string.
pub fn interpolate(input: &str, vars: &BTreeMap<String, String>) -> Result<String, ManifestError> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek().map(|&(_, next)| next) {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let mut body = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    body.push(c);
                }
                if !closed {
                    return Err(ManifestError::UnterminatedVariable(input.to_string()));
                }
                out.push_str(&expand_braced(&body, vars)?);
            }
            Some(next) if is_name_start(next) => {
                let mut name = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if !is_name_char(c) {
                        break;
                    }
                    name.push(c);
                    chars.next();
                }
                out.push_str(vars.get(&name).map(String::as_str).unwrap_or(""));
            }
            _ => out.push('$'),
        }
    }

    Ok(out)
}

fn is_name_start(c: char) -> bool {
    c == '_' || c.is_ascii_alphabetic()
}

fn is_name_char(c: char) -> bool {
    c == '_' || c.is_ascii_alphanumeric()
}

fn expand_braced(body: &str, vars: &BTreeMap<String, String>) -> Result<String, ManifestError> {
    let name_end = body.find(|c: char| !is_name_char(c)).unwrap_or(body.len());
    let (name, modifier) = body.split_at(name_end);
    let value = vars.get(name);
    let set_nonempty = value.map(|v| !v.is_empty()).unwrap_or(false);

    let required = |message: &str| ManifestError::RequiredVariable {
        name: name.to_string(),
        message: if message.is_empty() {
            "required variable is missing a value".to_string()
        } else {
            message.to_string()
        },
    };

    if modifier.is_empty() {
        return Ok(value.cloned().unwrap_or_default());
    }
    if let Some(default) = modifier.strip_prefix(":-") {
        return if set_nonempty {
            Ok(value.cloned().unwrap_or_default())
        } else {
            interpolate(default, vars)
        };
    }
    if let Some(default) = modifier.strip_prefix('-') {
        return match value {
            Some(v) => Ok(v.clone()),
            None => interpolate(default, vars),
        };
    }
    if let Some(message) = modifier.strip_prefix(":?") {
        return if set_nonempty {
            Ok(value.cloned().unwrap_or_default())
        } else {
            Err(required(message))
        };
    }
    if let Some(message) = modifier.strip_prefix('?') {
        return value.cloned().ok_or_else(|| required(message));
    }

    Err(ManifestError::UnterminatedVariable(format!("${{{}}}", body)))
}
