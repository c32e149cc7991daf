//! DataJoint-style textual definitions
//!
//! ```text
//! # Top-level, singular, discrete instance of an experiment or task run
//! -> subject.Subject
//! session_id           : varchar(16)   # session number or other identifier
//! ---
//! session_datetime=NULL : datetime
//! session_type=NULL     : varchar(32)
//! ```
//!
//! References are resolved only against the descriptors handed to
//! [`parse_definition`]; a name that matches none of them is an error.
//! Supported reference options: `nullable`, `cascade`, `nullify`.

use std::sync::Arc;

use super::{Attribute, AttributeType, Entity, EntityDefinition, EntityKind, OnDelete, Reference, Value};
use crate::{Error, Result};

/// Parse a textual definition into a template.
///
/// `name` is the local entity name (`"Attribute"` for a part). `refs` are
/// the resolved descriptors that `->` lines may name, either bare
/// (`Session`) or module-qualified (`lab.User`).
///
/// # Errors
///
/// `ParseError` for malformed lines, `SchemaDefinition` for references
/// that match none of `refs`.
///
/// # Example
///
/// ```rust
/// use element_session::schema::{parse_definition, EntityKind};
///
/// let def = parse_definition(
///     "User",
///     EntityKind::Lookup,
///     "user : varchar(32)\n---\nuser_email='' : varchar(128)",
///     &[],
/// )?;
/// assert_eq!(def.name(), "User");
/// # Ok::<(), element_session::Error>(())
/// ```
pub fn parse_definition(
    name: &str,
    kind: EntityKind,
    text: &str,
    refs: &[&Arc<Entity>],
) -> Result<EntityDefinition> {
    let mut def = EntityDefinition::new(name, kind);
    let mut in_primary = true;
    let mut seen_item = false;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        let at = |msg: String| Error::ParseError(format!("{name}, line {}: {msg}", lineno + 1));

        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            if !seen_item && def.comment_text().is_none() {
                def = def.comment(comment.trim());
            }
            continue;
        }
        if is_divider(line) {
            if !in_primary {
                return Err(at("second primary-key divider".to_string()));
            }
            in_primary = false;
            continue;
        }
        seen_item = true;

        if let Some(rest) = line.strip_prefix("->") {
            let (options, target) = parse_reference(strip_comment(rest).trim()).map_err(at)?;
            if target == "master" {
                if kind != EntityKind::Part || !in_primary {
                    return Err(at("`-> master` is only valid in a part's primary key".to_string()));
                }
                continue;
            }
            let entity = resolve(target, refs).ok_or_else(|| {
                Error::definition(
                    name,
                    format!("reference to `{target}` does not match any supplied descriptor"),
                )
            })?;
            let mut reference = Reference::to(entity);
            for option in options {
                reference = match option {
                    "nullable" => reference.nullable(),
                    "cascade" => reference.on_delete(OnDelete::Cascade),
                    "nullify" => reference.on_delete(OnDelete::Nullify),
                    other => return Err(at(format!("unsupported reference option `{other}`"))),
                };
            }
            def = if in_primary {
                def.reference(reference)
            } else {
                def.secondary_reference(reference)
            };
            continue;
        }

        let attr = parse_attribute(line).map_err(at)?;
        def = if in_primary {
            def.primary(attr)
        } else {
            def.secondary(attr)
        };
    }
    Ok(def)
}

fn is_divider(line: &str) -> bool {
    line.len() >= 3 && (line.chars().all(|c| c == '-') || line.chars().all(|c| c == '_'))
}

fn resolve<'a>(target: &str, refs: &[&'a Arc<Entity>]) -> Option<&'a Arc<Entity>> {
    let exact = refs.iter().find(|e| e.name() == target);
    let unqualified = || {
        let (_, local) = target.split_once('.')?;
        refs.iter().find(|e| e.name() == local)
    };
    exact.or_else(unqualified).copied()
}

/// `[nullable, cascade] Target` → (options, target)
fn parse_reference(spec: &str) -> std::result::Result<(Vec<&str>, &str), String> {
    let (options, target) = match spec.strip_prefix('[') {
        Some(rest) => {
            let (opts, target) = rest
                .split_once(']')
                .ok_or_else(|| "unterminated reference options".to_string())?;
            let opts = opts
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .collect();
            (opts, target.trim())
        }
        None => (Vec::new(), spec),
    };
    if target.is_empty() || target.contains(char::is_whitespace) {
        return Err(format!("invalid reference target `{target}`"));
    }
    Ok((options, target))
}

/// Find `needle` outside single or double quotes.
fn find_unquoted(s: &str, needle: char) -> Option<usize> {
    let mut quote = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, c) if c == needle => return Some(i),
            _ => {}
        }
    }
    None
}

fn strip_comment(s: &str) -> &str {
    find_unquoted(s, '#').map_or(s, |i| &s[..i])
}

fn parse_attribute(line: &str) -> std::result::Result<Attribute, String> {
    let comment = find_unquoted(line, '#').map(|i| line[i + 1..].trim());
    let body = strip_comment(line);
    let colon = find_unquoted(body, ':').ok_or_else(|| format!("expected `name : type`, got `{line}`"))?;
    let (lhs, ty) = (body[..colon].trim(), body[colon + 1..].trim());

    let (name, default) = match find_unquoted(lhs, '=') {
        Some(i) => (lhs[..i].trim(), Some(parse_default(lhs[i + 1..].trim())?)),
        None => (lhs, None),
    };
    if name.is_empty() {
        return Err(format!("missing attribute name in `{line}`"));
    }

    let mut attr = Attribute::new(name, parse_type(ty)?);
    if let Some(default) = default {
        attr = attr.with_default(default);
    }
    if let Some(comment) = comment.filter(|c| !c.is_empty()) {
        attr = attr.comment(comment);
    }
    Ok(attr)
}

fn unquote(s: &str) -> Option<&str> {
    ['\'', '"'].iter().find_map(|q| s.strip_prefix(*q)?.strip_suffix(*q))
}

fn parse_default(s: &str) -> std::result::Result<Value, String> {
    if s.eq_ignore_ascii_case("null") {
        return Ok(Value::Null);
    }
    if let Some(text) = unquote(s) {
        return Ok(Value::from(text));
    }
    if let Ok(i) = s.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    if let Ok(f) = s.parse::<f64>() {
        return Ok(Value::Float(f));
    }
    match s.to_ascii_lowercase().as_str() {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        _ => Err(format!("unsupported default `{s}`")),
    }
}

fn parse_type(ty: &str) -> std::result::Result<AttributeType, String> {
    let lower = ty.trim().to_ascii_lowercase();
    let (base, arg) = match lower.split_once('(') {
        Some((base, rest)) => {
            let close = rest
                .rfind(')')
                .ok_or_else(|| format!("unbalanced parentheses in `{ty}`"))?;
            (base.trim().to_string(), Some(ty.trim()[base.len() + 1..][..close].to_string()))
        }
        None => (lower.clone(), None),
    };
    let base = base.trim_end_matches(" unsigned").trim();

    let parsed = match base {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" => AttributeType::Int,
        "float" | "double" | "decimal" | "real" => AttributeType::Float,
        "bool" | "boolean" => AttributeType::Bool,
        "varchar" | "char" => {
            let n = arg
                .as_deref()
                .and_then(|a| a.trim().parse::<u32>().ok())
                .ok_or_else(|| format!("`{ty}` needs a length"))?;
            AttributeType::Varchar(n)
        }
        "enum" => {
            let options = arg
                .as_deref()
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(|o| unquote(o).map(str::to_string).ok_or_else(|| format!("enum option {o} must be quoted")))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            AttributeType::Enum(options)
        }
        "date" => AttributeType::Date,
        "datetime" | "timestamp" => AttributeType::Datetime,
        "blob" | "tinyblob" | "mediumblob" | "longblob" => AttributeType::Blob,
        _ => return Err(format!("unsupported type `{ty}`")),
    };
    Ok(parsed)
}
