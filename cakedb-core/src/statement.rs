//! Statements observed by the write interceptor.
//!
//! A revision has to be replayable on its own, so bound parameters are
//! rendered into the SQL text as literals before the statement is logged.

use crate::error::{CakeError, Result};
use rusqlite::types::Value;
use std::collections::HashMap;

/// How a statement reaches the main database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Regular application traffic; eligible for capture.
    Capture,
    /// Replay of an already logged revision; never captured again.
    Replay,
}

/// An executed statement as seen by the interceptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }

    /// True if any bound parameter is exactly the given text.
    pub fn binds_text(&self, needle: &str) -> bool {
        self.params
            .iter()
            .any(|p| matches!(p, Value::Text(s) if s == needle))
    }

    /// True if the statement text starts with one of the given keywords,
    /// ignoring case and leading whitespace.
    pub fn starts_with_any(&self, keywords: &[String]) -> bool {
        let head = self.sql.trim_start().to_lowercase();
        keywords
            .iter()
            .any(|kw| head.starts_with(kw.to_lowercase().as_str()))
    }

    /// Render the statement with every parameter substituted as a literal.
    pub fn render(&self) -> Result<String> {
        render(&self.sql, &self.params)
    }
}

/// Format a single value as an SQLite literal.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => {
            if f.is_nan() {
                "NULL".to_string()
            } else if f.is_infinite() {
                if *f > 0.0 { "9e999".to_string() } else { "-9e999".to_string() }
            } else {
                format!("{:?}", f)
            }
        }
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Blob(b) => format!("X'{}'", hex::encode_upper(b)),
    }
}

/// Substitute `?`, `?NNN` and named (`:name`, `@name`, `$name`) placeholders
/// with literal values.
///
/// Indexes follow SQLite's numbering: `?NNN` is NNN, a bare `?` is one past
/// the largest index so far, and a named parameter takes one past the largest
/// index at its first appearance and keeps it afterwards. Placeholders inside
/// string literals, quoted identifiers and comments are left alone. Text with
/// no bound values is returned as is, since it ran exactly that way.
pub fn render(sql: &str, params: &[Value]) -> Result<String> {
    if params.is_empty() {
        return Ok(sql.to_string());
    }

    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut named: HashMap<String, usize> = HashMap::new();
    let mut max_index = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                let end = scan_quoted(&chars, i, c);
                out.extend(&chars[i..end]);
                i = end;
            }
            '[' => {
                let end = scan_until(&chars, i + 1, ']').map(|p| p + 1).unwrap_or(chars.len());
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                let end = scan_until(&chars, i, '\n').map(|p| p + 1).unwrap_or(chars.len());
                out.extend(&chars[i..end]);
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let mut end = chars.len();
                let mut j = i + 2;
                while j + 1 < chars.len() {
                    if chars[j] == '*' && chars[j + 1] == '/' {
                        end = j + 2;
                        break;
                    }
                    j += 1;
                }
                out.extend(&chars[i..end]);
                i = end;
            }
            '?' => {
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_ascii_digit() {
                    j += 1;
                }
                let index = if j > i + 1 {
                    let digits: String = chars[i + 1..j].iter().collect();
                    let n: usize = digits
                        .parse()
                        .map_err(|_| CakeError::Statement(format!("bad placeholder ?{}", digits)))?;
                    if n == 0 {
                        return Err(CakeError::Statement("placeholder ?0 is not valid".to_string()));
                    }
                    n
                } else {
                    max_index + 1
                };
                max_index = max_index.max(index);
                out.push_str(&literal(bound_value(params, index, &chars[i..j])?));
                i = j;
            }
            ':' | '@' | '$' if starts_named_param(&chars, i) => {
                let mut j = i + 1;
                while j < chars.len() && is_ident_char(chars[j]) {
                    j += 1;
                }
                let name: String = chars[i..j].iter().collect();
                let index = match named.get(&name) {
                    Some(&n) => n,
                    None => {
                        let n = max_index + 1;
                        named.insert(name, n);
                        n
                    }
                };
                max_index = max_index.max(index);
                out.push_str(&literal(bound_value(params, index, &chars[i..j])?));
                i = j;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    if max_index < params.len() {
        return Err(CakeError::Statement(format!(
            "{} values bound but only {} placeholders used",
            params.len(),
            max_index
        )));
    }

    Ok(out)
}

fn bound_value<'a>(params: &'a [Value], index: usize, placeholder: &[char]) -> Result<&'a Value> {
    params.get(index - 1).ok_or_else(|| {
        CakeError::Statement(format!(
            "placeholder {} (index {}) has no bound value ({} given)",
            placeholder.iter().collect::<String>(),
            index,
            params.len()
        ))
    })
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// A sigil starts a parameter only outside an identifier; `a$b` is a name.
fn starts_named_param(chars: &[char], i: usize) -> bool {
    let follows_ident = i > 0 && is_ident_char(chars[i - 1]);
    let has_name = chars
        .get(i + 1)
        .is_some_and(|n| n.is_alphanumeric() || *n == '_');
    has_name && !follows_ident
}

/// Index just past the closing quote; doubled quotes are escapes.
fn scan_quoted(chars: &[char], start: usize, quote: char) -> usize {
    let mut j = start + 1;
    while j < chars.len() {
        if chars[j] == quote {
            if chars.get(j + 1) == Some(&quote) {
                j += 2;
                continue;
            }
            return j + 1;
        }
        j += 1;
    }
    chars.len()
}

fn scan_until(chars: &[char], from: usize, target: char) -> Option<usize> {
    (from..chars.len()).find(|&j| chars[j] == target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_positional() {
        let sql = render(
            "insert into todo (title, content) values (?, ?)",
            &[Value::Text("title_1".into()), Value::Text("it's".into())],
        )
        .unwrap();
        assert_eq!(sql, "insert into todo (title, content) values ('title_1', 'it''s')");
    }

    #[test]
    fn test_render_numbered_and_reused() {
        let sql = render(
            "update t set a = ?1, b = ?2 where a = ?1",
            &[Value::Integer(5), Value::Null],
        )
        .unwrap();
        assert_eq!(sql, "update t set a = 5, b = NULL where a = 5");
    }

    #[test]
    fn test_render_skips_literals_and_comments() {
        let sql = render(
            "insert into t (q, \"w?\") values ('what?', ?) -- why?\n",
            &[Value::Real(1.5)],
        )
        .unwrap();
        assert_eq!(sql, "insert into t (q, \"w?\") values ('what?', 1.5) -- why?\n");
    }

    #[test]
    fn test_render_blob_and_real() {
        let sql = render("insert into t values (?, ?)", &[Value::Blob(vec![0xde, 0xad]), Value::Real(2.0)])
            .unwrap();
        assert_eq!(sql, "insert into t values (X'DEAD', 2.0)");
    }

    #[test]
    fn test_render_parameter_count_mismatch() {
        assert!(render("insert into t values (?, ?)", &[Value::Integer(1)]).is_err());
        assert!(render("insert into t values (?)", &[Value::Integer(1), Value::Integer(2)]).is_err());
    }

    #[test]
    fn test_render_named_params_by_position() {
        let sql = render(
            "update t set a = :a, b = @b where a = :a and c = ?3",
            &[Value::Integer(1), Value::Integer(2), Value::Integer(3)],
        )
        .unwrap();
        assert_eq!(sql, "update t set a = 1, b = 2 where a = 1 and c = 3");

        let sql = render("insert into todo (title) values ($title)", &[Value::Text("x".into())]).unwrap();
        assert_eq!(sql, "insert into todo (title) values ('x')");
    }

    #[test]
    fn test_render_dollar_inside_identifier() {
        let sql = render("insert into w (a$b, c) values (?, 'p$q')", &[Value::Integer(1)]).unwrap();
        assert_eq!(sql, "insert into w (a$b, c) values (1, 'p$q')");
    }

    #[test]
    fn test_render_without_values_is_verbatim() {
        let script = "insert into w (a$b) values (1); update t set q = ? where 0";
        assert_eq!(render(script, &[]).unwrap(), script);
    }

    #[test]
    fn test_keyword_filter() {
        let kws = vec!["select".to_string()];
        assert!(Statement::raw("  SELECT * from kv").starts_with_any(&kws));
        assert!(!Statement::raw("insert into kv values (1)").starts_with_any(&kws));
    }

    #[test]
    fn test_binds_text() {
        let stmt = Statement::new(
            "update kv set value = ? where key = ?",
            vec![Value::Text("abc".into()), Value::Text("revision_point".into())],
        );
        assert!(stmt.binds_text("revision_point"));
        assert!(!Statement::raw("update kv set value = 'revision_point'").binds_text("revision_point"));
    }
}
