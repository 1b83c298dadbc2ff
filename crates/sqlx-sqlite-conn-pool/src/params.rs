//! Named statement parameters
//!
//! SQLx binds SQLite arguments by position only, so `:name`, `@name` and
//! `$name` placeholders are rewritten to numbered `?N` placeholders before the
//! statement is compiled. Every occurrence of a name maps to the same number.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::Sqlite;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;

use crate::{Error, Result};

/// Values for named placeholders, keyed with or without the leading sigil
/// (`"name"`, `":name"`, `"@name"` and `"$name"` are equivalent).
pub type NamedParameters = IndexMap<String, JsonValue>;

/// SQL with named placeholders replaced, plus the values in binding order
#[derive(Debug, PartialEq)]
pub(crate) struct PositionalSql {
   pub sql: String,
   pub values: Vec<JsonValue>,
}

fn is_ident_start(b: u8) -> bool {
   b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
   b.is_ascii_alphanumeric() || b == b'_'
}

/// Index of the closing quote of a quoted literal or identifier starting at `i`.
/// Doubled quotes are escapes.
fn skip_quoted(bytes: &[u8], i: usize, quote: u8) -> usize {
   let mut j = i + 1;
   while j < bytes.len() {
      if bytes[j] == quote {
         if j + 1 < bytes.len() && bytes[j + 1] == quote {
            j += 2;
            continue;
         }
         return j;
      }
      j += 1;
   }
   j
}

fn skip_until(bytes: &[u8], i: usize, end: u8) -> usize {
   let mut j = i + 1;
   while j < bytes.len() && bytes[j] != end {
      j += 1;
   }
   j
}

fn skip_block_comment(bytes: &[u8], i: usize) -> usize {
   let mut j = i + 2;
   while j + 1 < bytes.len() {
      if bytes[j] == b'*' && bytes[j + 1] == b'/' {
         return j + 1;
      }
      j += 1;
   }
   bytes.len()
}

fn strip_sigil(key: &str) -> &str {
   key.strip_prefix([':', '@', '$']).unwrap_or(key)
}

/// Rewrites named placeholders in `sql` to `?N` and orders `params` to match.
///
/// Placeholders inside string literals, quoted identifiers and comments are
/// left alone. Parameters that the statement never references are ignored.
pub(crate) fn to_positional(sql: &str, params: &NamedParameters) -> Result<PositionalSql> {
   let bytes = sql.as_bytes();
   let len = bytes.len();
   let mut out = String::with_capacity(len);
   let mut names: Vec<&str> = Vec::new();
   let mut copied = 0;
   let mut i = 0;

   while i < len {
      match bytes[i] {
         b'\'' | b'"' | b'`' => i = skip_quoted(bytes, i, bytes[i]),
         b'[' => i = skip_until(bytes, i, b']'),
         b'-' if i + 1 < len && bytes[i + 1] == b'-' => i = skip_until(bytes, i + 1, b'\n'),
         b'/' if i + 1 < len && bytes[i + 1] == b'*' => i = skip_block_comment(bytes, i),
         b':' | b'@' | b'$' if i + 1 < len && is_ident_start(bytes[i + 1]) => {
            let start = i + 1;
            let mut end = start;
            while end < len && is_ident_char(bytes[end]) {
               end += 1;
            }

            let name = &sql[start..end];
            let position = match names.iter().position(|n| *n == name) {
               Some(index) => index + 1,
               None => {
                  names.push(name);
                  names.len()
               }
            };

            out.push_str(&sql[copied..i]);
            out.push('?');
            out.push_str(&position.to_string());
            copied = end;
            i = end;
            continue;
         }
         _ => {}
      }
      i += 1;
   }
   out.push_str(&sql[copied..]);

   let lookup: IndexMap<&str, &JsonValue> = params
      .iter()
      .map(|(key, value)| (strip_sigil(key), value))
      .collect();

   let values = names
      .into_iter()
      .map(|name| {
         lookup
            .get(name)
            .map(|value| (*value).clone())
            .ok_or_else(|| Error::MissingParameter(name.to_string()))
      })
      .collect::<Result<Vec<_>>>()?;

   Ok(PositionalSql { sql: out, values })
}

/// Binds a JSON value to a SQLx query as the closest SQLite type.
///
/// Objects and arrays are stored as JSON text so `json_extract` can read them.
pub(crate) fn bind_value<'q>(
   query: Query<'q, Sqlite, SqliteArguments<'q>>,
   value: JsonValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
   match value {
      JsonValue::Null => query.bind(None::<String>),
      JsonValue::Bool(flag) => query.bind(flag),
      JsonValue::String(text) => query.bind(text),
      JsonValue::Number(number) => {
         // Preserve integer precision by binding as i64 when possible
         if let Some(int_val) = number.as_i64() {
            query.bind(int_val)
         } else if let Some(uint_val) = number.as_u64() {
            // u64 beyond i64::MAX cannot be an SQLite INTEGER
            query.bind(uint_val as f64)
         } else {
            query.bind(number.as_f64().unwrap_or_default())
         }
      }
      json @ (JsonValue::Array(_) | JsonValue::Object(_)) => query.bind(json),
   }
}
