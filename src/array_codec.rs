//! PostgreSQL `TEXT[]` array-literal encode/decode.
//!
//! `jobs.args`/`env` are real array columns and round-trip through sqlx's
//! native `Vec<String>` binding. The `plans_include`/`plans_exclude`/
//! `plans_lowprio` filter strings the workshop queue rebuilds on every
//! library/rate-limiter change (§4.4) are different: they are assembled
//! in-process and passed as a single text parameter cast to `TEXT[]` in SQL
//! (`plan_name = ANY ($1::TEXT[])`), exactly as `original_source`'s
//! `pg_encode_array` helper builds them throughout `PGQueue.cxx`/
//! `Workplace.cxx`. This module is the Rust equivalent of that helper plus
//! its inverse (used by tests and by `db::workshop` to build those three
//! filter strings).

use crate::error::{ControlError, Error};

/// Encodes a list of strings as a Postgres array literal: `{}` for empty,
/// `{foo,"bar,baz"}` otherwise. An element is quoted whenever it is empty or
/// contains any of `{}",\` or whitespace; quoted elements escape `"` and `\`
/// with a backslash.
pub fn encode(values: &[String]) -> String {
    if values.is_empty() {
        return "{}".to_string();
    }

    let mut out = String::from("{");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if needs_quoting(value) {
            out.push('"');
            for c in value.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
        } else {
            out.push_str(value);
        }
    }
    out.push('}');
    out
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value.chars().any(|c| {
            matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace()
        })
}

/// Decodes a Postgres array literal produced by [`encode`]. Returns
/// [`ControlError::MalformedFrame`] (reused here as a generic "malformed
/// wire payload" error, since the queue's argument column is read off the
/// same control-protocol-adjacent path) on anything that isn't a
/// well-formed `{...}` literal.
pub fn decode(literal: &str) -> Result<Vec<String>, Error> {
    let bytes = literal.as_bytes();
    if bytes.first() != Some(&b'{') || bytes.last() != Some(&b'}') {
        return Err(ControlError::MalformedFrame(format!(
            "array literal missing braces: {literal:?}"
        ))
        .into());
    }
    let inner = &literal[1..literal.len() - 1];
    if inner.is_empty() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        let mut element = String::new();
        match chars.peek() {
            Some('"') => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(c) => element.push(c),
                            None => {
                                return Err(ControlError::MalformedFrame(
                                    "unterminated escape in array literal".to_string(),
                                )
                                .into())
                            }
                        },
                        Some('"') => break,
                        Some(c) => element.push(c),
                        None => {
                            return Err(ControlError::MalformedFrame(
                                "unterminated quoted element in array literal".to_string(),
                            )
                            .into())
                        }
                    }
                }
            }
            _ => {
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    element.push(c);
                    chars.next();
                }
            }
        }
        out.push(element);

        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(c) => {
                return Err(ControlError::MalformedFrame(format!(
                    "unexpected character {c:?} after array element"
                ))
                .into())
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_empty() {
        assert_eq!(encode(&[]), "{}");
    }

    #[test]
    fn encodes_and_decodes_plain() {
        let values = vec!["foo".to_string(), "bar".to_string()];
        let literal = encode(&values);
        assert_eq!(literal, "{foo,bar}");
        assert_eq!(decode(&literal).unwrap(), values);
    }

    #[test]
    fn quotes_special_characters() {
        let values = vec!["bar,baz".to_string()];
        let literal = encode(&values);
        assert_eq!(literal, "{\"bar,baz\"}");
        assert_eq!(decode(&literal).unwrap(), values);
    }

    #[test]
    fn round_trips_quotes_and_backslashes() {
        let values = vec!["foo".to_string(), "\"".to_string(), "\\".to_string()];
        let literal = encode(&values);
        assert_eq!(decode(&literal).unwrap(), values);
    }

    #[test]
    fn decodes_braces_with_quoted_comma() {
        let decoded = decode("{foo,\"bar,baz\"}").unwrap();
        assert_eq!(decoded, vec!["foo".to_string(), "bar,baz".to_string()]);
    }

    #[test]
    fn decode_rejects_missing_braces() {
        assert!(decode("foo,bar").is_err());
    }

    #[test]
    fn decode_of_empty_braces_is_empty_vec() {
        assert_eq!(decode("{}").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn empty_element_gets_quoted() {
        let values = vec!["".to_string(), "x".to_string()];
        let literal = encode(&values);
        assert_eq!(decode(&literal).unwrap(), values);
    }
}
