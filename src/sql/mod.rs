//! SQL text helpers shared by the shard executors: dialect detection from a
//! connection URL, identifier quoting, positional placeholder rewriting and named-parameter
//! expansion (`:name`, with list parameters expanded for `in (:ids)`).

use crate::core::{DbError, Result, Value};
use std::borrow::Cow;
use std::collections::HashMap;

/// SQL flavour of a shard, derived from its URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
    Generic,
}

impl Dialect {
    pub fn from_url(url: &str) -> Self {
        let scheme = url
            .split_once(':')
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();
        match scheme.as_str() {
            "sqlite" => Self::Sqlite,
            "postgres" | "postgresql" => Self::Postgres,
            "mysql" | "mariadb" => Self::MySql,
            _ => Self::Generic,
        }
    }

    /// Bind marker for the `position`-th parameter (1-based).
    pub fn placeholder(&self, position: usize) -> String {
        match self {
            Self::Postgres => format!("${}", position),
            _ => "?".to_string(),
        }
    }

    /// Quotes a table or column name so reserved words such as `order`
    /// are accepted as identifiers.
    pub fn quote_ident(&self, name: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", name.replace('`', "``")),
            _ => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    /// Prepares a `?` statement for binding: markers are rewritten into the
    /// dialect's own syntax and NULL arguments are written inline as the
    /// `NULL` literal, so drivers with typed parameters never see an
    /// untyped bind. Returns the SQL and the arguments still to bind.
    ///
    /// Statements without `?` markers are passed through untouched.
    pub fn bind_positional<'a>(
        &self,
        sql: &'a str,
        args: &[Value],
    ) -> Result<(Cow<'a, str>, Vec<Value>)> {
        let has_null = args.iter().any(Value::is_null);
        if !sql.contains('?') || (!has_null && !matches!(self, Self::Postgres)) {
            return Ok((Cow::Borrowed(sql), args.to_vec()));
        }

        let segments = tokenize(sql);
        let markers = segments.iter().filter(|s| **s == Segment::Positional).count();
        if markers == 0 {
            return Ok((Cow::Borrowed(sql), args.to_vec()));
        }
        if markers != args.len() {
            return Err(DbError::ParameterError(format!(
                "statement has {} '?' markers but {} arguments were supplied",
                markers,
                args.len()
            )));
        }

        let mut out = String::with_capacity(sql.len() + 8);
        let mut bound = Vec::with_capacity(args.len());
        let mut next = args.iter();
        for segment in segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Named(name) => {
                    out.push(':');
                    out.push_str(name);
                }
                Segment::Positional => match next.next() {
                    Some(value) => self.push_bind(&mut out, &mut bound, value),
                    None => out.push('?'),
                },
            }
        }
        Ok((Cow::Owned(out), bound))
    }

    fn push_bind(&self, out: &mut String, bound: &mut Vec<Value>, value: &Value) {
        if value.is_null() {
            out.push_str("NULL");
        } else {
            bound.push(value.clone());
            out.push_str(&self.placeholder(bound.len()));
        }
    }

    /// Turns `:name` markers into positional binds, returning the rewritten
    /// SQL and the argument list in bind order.
    ///
    /// List parameters expand to one bind per element; an empty list expands
    /// to `NULL` so that `in (:ids)` matches nothing instead of being a
    /// syntax error. NULL values are inlined the same way as in
    /// [`Dialect::bind_positional`].
    pub fn expand_named(&self, sql: &str, params: &NamedParams) -> Result<(String, Vec<Value>)> {
        let mut out = String::with_capacity(sql.len() + 16);
        let mut args = Vec::new();

        for segment in tokenize(sql) {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Positional => out.push('?'),
                Segment::Named(name) => {
                    let param = params.get(name).ok_or_else(|| {
                        DbError::ParameterError(format!(
                            "no value supplied for named parameter ':{}'",
                            name
                        ))
                    })?;
                    match param {
                        Param::Value(value) => self.push_bind(&mut out, &mut args, value),
                        Param::List(values) if values.is_empty() => out.push_str("NULL"),
                        Param::List(values) => {
                            for (i, value) in values.iter().enumerate() {
                                if i > 0 {
                                    out.push_str(", ");
                                }
                                self.push_bind(&mut out, &mut args, value);
                            }
                        }
                    }
                }
            }
        }

        Ok((out, args))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Positional,
    Named(&'a str),
}

/// Splits SQL into literal text and bind markers. Quoted literals,
/// quoted identifiers, `--` comments and `::` casts are passed through.
fn tokenize(sql: &str) -> Vec<Segment<'_>> {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut segments = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < len {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < len {
                    if bytes[i] == quote {
                        if i + 1 < len && bytes[i + 1] == quote {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'-' if i + 1 < len && bytes[i + 1] == b'-' => {
                while i < len && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b':' if i + 1 < len && bytes[i + 1] == b':' => {
                i += 2;
            }
            b':' => {
                let name_start = i + 1;
                let mut end = name_start;
                while end < len && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
                    end += 1;
                }
                let starts_like_identifier = name_start < len
                    && (bytes[name_start].is_ascii_alphabetic() || bytes[name_start] == b'_');
                if end > name_start && starts_like_identifier {
                    if start < i {
                        segments.push(Segment::Text(&sql[start..i]));
                    }
                    segments.push(Segment::Named(&sql[name_start..end]));
                    start = end;
                    i = end;
                } else {
                    i += 1;
                }
            }
            b'?' => {
                if start < i {
                    segments.push(Segment::Text(&sql[start..i]));
                }
                segments.push(Segment::Positional);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }

    if start < len {
        segments.push(Segment::Text(&sql[start..]));
    }
    segments
}

/// A named parameter value: a single scalar or a list expanded in place.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Value(Value),
    List(Vec<Value>),
}

macro_rules! impl_param_from_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Param {
                fn from(value: $ty) -> Self {
                    Param::Value(Value::from(value))
                }
            }
        )*
    };
}

impl_param_from_scalar!(i64, i32, f64, bool, String, &str, &String);

macro_rules! impl_param_from_list {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<Vec<$ty>> for Param {
                fn from(values: Vec<$ty>) -> Self {
                    Param::List(values.into_iter().map(Value::from).collect())
                }
            }
        )*
    };
}

impl_param_from_list!(i64, String, &str, &String);

impl From<Value> for Param {
    fn from(value: Value) -> Self {
        Param::Value(value)
    }
}

impl From<Vec<Value>> for Param {
    fn from(values: Vec<Value>) -> Self {
        Param::List(values)
    }
}

impl From<&[String]> for Param {
    fn from(values: &[String]) -> Self {
        Param::List(values.iter().map(Value::from).collect())
    }
}

/// Parameters for `:name` style statements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedParams {
    values: HashMap<String, Param>,
}

impl NamedParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Param>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Param>) -> Option<Param> {
        self.values.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Param)> {
        self.values.iter()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for NamedParams {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut params = NamedParams::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_url() {
        assert_eq!(Dialect::from_url("sqlite:///tmp/a.db"), Dialect::Sqlite);
        assert_eq!(Dialect::from_url("postgres://u:p@h/db"), Dialect::Postgres);
        assert_eq!(Dialect::from_url("postgresql://h/db"), Dialect::Postgres);
        assert_eq!(Dialect::from_url("mysql://h/db"), Dialect::MySql);
        assert_eq!(Dialect::from_url("mariadb://h/db"), Dialect::MySql);
        assert_eq!(Dialect::from_url("whatever"), Dialect::Generic);
    }

    #[test]
    fn test_bind_positional_for_postgres() {
        let sql = "select * from t where a = ? and b = '?' and c = ?";
        let args = vec![Value::Integer(1), Value::from("x")];
        let (rewritten, bound) = Dialect::Postgres.bind_positional(sql, &args).unwrap();
        assert_eq!(rewritten, "select * from t where a = $1 and b = '?' and c = $2");
        assert_eq!(bound, args);

        let (rewritten, bound) = Dialect::Sqlite.bind_positional(sql, &args).unwrap();
        assert_eq!(rewritten, sql);
        assert_eq!(bound, args);
    }

    #[test]
    fn test_null_arguments_are_inlined() {
        let args = vec![Value::Integer(1), Value::Null, Value::Boolean(true)];
        let (sql, bound) = Dialect::Postgres
            .bind_positional("insert into t (a,b,c) values (?,?,?)", &args)
            .unwrap();
        assert_eq!(sql, "insert into t (a,b,c) values ($1,NULL,$2)");
        assert_eq!(bound, vec![Value::Integer(1), Value::Boolean(true)]);

        let (sql, bound) = Dialect::Sqlite
            .bind_positional("update t set a=? where b=?", &[Value::Null, Value::from("k")])
            .unwrap();
        assert_eq!(sql, "update t set a=NULL where b=?");
        assert_eq!(bound, vec![Value::from("k")]);

        let params = NamedParams::new()
            .with("b", Value::Null)
            .with("c", 7i64)
            .with("ids", vec![Value::from("a"), Value::Null]);
        let (sql, bound) = Dialect::Postgres
            .expand_named("update t set b=:b, c=:c where id in (:ids)", &params)
            .unwrap();
        assert_eq!(sql, "update t set b=NULL, c=$1 where id in ($2, NULL)");
        assert_eq!(bound, vec![Value::Integer(7), Value::from("a")]);
    }

    #[test]
    fn test_bind_positional_checks_argument_count() {
        let err = Dialect::Postgres
            .bind_positional("select * from t where a=? and b=?", &[Value::Integer(1)])
            .unwrap_err();
        assert!(matches!(err, DbError::ParameterError(_)));

        // Native markers are left to the driver.
        let args = [Value::Null];
        let (sql, bound) = Dialect::Postgres
            .bind_positional("select * from t where a=$1", &args)
            .unwrap();
        assert_eq!(sql, "select * from t where a=$1");
        assert_eq!(bound, args.to_vec());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(Dialect::Sqlite.quote_ident("order"), "\"order\"");
        assert_eq!(Dialect::Postgres.quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::MySql.quote_ident("group"), "`group`");
    }

    #[test]
    fn test_expand_named_with_list() {
        let params = NamedParams::new()
            .with("ids", vec!["a", "b", "c"])
            .with("name", "x");
        let (sql, args) = Dialect::Sqlite
            .expand_named("select id from t where id in (:ids) and name=:name", &params)
            .unwrap();
        assert_eq!(sql, "select id from t where id in (?, ?, ?) and name=?");
        assert_eq!(
            args,
            vec![
                Value::from("a"),
                Value::from("b"),
                Value::from("c"),
                Value::from("x")
            ]
        );
    }

    #[test]
    fn test_expand_named_numbers_postgres_binds() {
        let params = NamedParams::new().with("a", 1i64).with("ids", vec![2i64, 3]);
        let (sql, args) = Dialect::Postgres
            .expand_named("update t set a=:a where id in (:ids) and a=:a", &params)
            .unwrap();
        assert_eq!(sql, "update t set a=$1 where id in ($2, $3) and a=$4");
        assert_eq!(args.len(), 4);
    }

    #[test]
    fn test_expand_named_skips_literals_and_casts() {
        let params = NamedParams::new().with("id", "x");
        let (sql, args) = Dialect::Postgres
            .expand_named(
                "select ':nope', created::text from t where id=:id -- :ignored\n",
                &params,
            )
            .unwrap();
        assert_eq!(
            sql,
            "select ':nope', created::text from t where id=$1 -- :ignored\n"
        );
        assert_eq!(args, vec![Value::from("x")]);
    }

    #[test]
    fn test_expand_named_empty_list_matches_nothing() {
        let params = NamedParams::new().with("ids", Vec::<String>::new());
        let (sql, args) = Dialect::MySql
            .expand_named("delete from t where id in (:ids)", &params)
            .unwrap();
        assert_eq!(sql, "delete from t where id in (NULL)");
        assert!(args.is_empty());
    }

    #[test]
    fn test_missing_named_param_is_an_error() {
        let err = Dialect::Sqlite
            .expand_named("select * from t where id=:id", &NamedParams::new())
            .unwrap_err();
        assert!(matches!(err, DbError::ParameterError(_)));
    }
}
