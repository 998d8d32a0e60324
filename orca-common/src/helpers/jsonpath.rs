use serde_json::Value;

use crate::{OrcaError, Result};

/// Extract a value from a JSON document using the compact path language
/// `segment(.segment)*`, where a segment is `key` or `key[index]`.
///
/// Misses fail with [`OrcaError::PathNotFound`] instead of coercing types;
/// used to map provider-specific OAuth user documents onto the common user
/// record.
pub fn extract<'a>(value: &'a Value, path: &str) -> Result<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        let (key, index) = parse_segment(segment, path)?;
        current = current
            .get(key)
            .ok_or_else(|| OrcaError::PathNotFound(path.to_string()))?;
        if let Some(index) = index {
            current = current
                .get(index)
                .ok_or_else(|| OrcaError::PathNotFound(path.to_string()))?;
        }
    }
    Ok(current)
}

/// Like [`extract`], but additionally requires the target to be a string.
pub fn extract_string(value: &Value, path: &str) -> Result<String> {
    extract(value, path)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| OrcaError::PathNotFound(path.to_string()))
}

fn parse_segment<'a>(segment: &'a str, path: &str) -> Result<(&'a str, Option<usize>)> {
    if segment.is_empty() {
        return Err(OrcaError::PathNotFound(path.to_string()));
    }
    match segment.split_once('[') {
        None => Ok((segment, None)),
        Some((key, rest)) => {
            let index = rest
                .strip_suffix(']')
                .and_then(|idx| idx.parse::<usize>().ok())
                .ok_or_else(|| OrcaError::PathNotFound(path.to_string()))?;
            Ok((key, Some(index)))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc() -> Value {
        json!({
            "user": {
                "name": "alice",
                "emails": [
                    {"value": "alice@example.com"},
                    {"value": "alice@other.example"},
                ],
            },
            "sub": "u-1",
        })
    }

    #[test]
    fn plain_keys() {
        assert_eq!(extract_string(&doc(), "sub").unwrap(), "u-1");
        assert_eq!(extract_string(&doc(), "user.name").unwrap(), "alice");
    }

    #[test]
    fn indexed_segment() {
        assert_eq!(
            extract_string(&doc(), "user.emails[1].value").unwrap(),
            "alice@other.example"
        );
    }

    #[test]
    fn missing_key_fails() {
        assert!(matches!(
            extract(&doc(), "user.missing"),
            Err(OrcaError::PathNotFound(_))
        ));
    }

    #[test]
    fn out_of_bounds_index_fails() {
        assert!(matches!(
            extract(&doc(), "user.emails[9].value"),
            Err(OrcaError::PathNotFound(_))
        ));
    }

    #[test]
    fn malformed_segment_fails() {
        assert!(extract(&doc(), "user.emails[x].value").is_err());
        assert!(extract(&doc(), "user..name").is_err());
    }

    #[test]
    fn type_mismatch_is_not_coerced() {
        assert!(extract_string(&doc(), "user.emails").is_err());
    }
}
