use super::FieldKind;
use crate::core::{DbError, Result, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Conversion between an entity field type and a SQL [`Value`].
///
/// Implemented for the scalar types entities may declare; `#[derive(EntityEnum)]`
/// implements it for enums, stored by variant name.
pub trait FieldValue: Sized {
    const KIND: FieldKind;
    const NULLABLE: bool = false;

    fn to_value(&self) -> Value;

    fn from_value(value: Value) -> Result<Self>;
}

fn null_into(kind: &str) -> DbError {
    DbError::MappingError(format!("cannot store NULL into non-nullable {}", kind))
}

fn mismatch(expected: &str, value: &Value) -> DbError {
    DbError::MappingError(format!(
        "expected {}, got {} '{}'",
        expected,
        value.type_name(),
        value
    ))
}

impl FieldValue for String {
    const KIND: FieldKind = FieldKind::Text;

    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s),
            Value::Null => Err(null_into("string")),
            other => Ok(other.to_string()),
        }
    }
}

macro_rules! impl_integer_field {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FieldValue for $ty {
                const KIND: FieldKind = FieldKind::Integer;

                fn to_value(&self) -> Value {
                    Value::Integer(i64::from(*self))
                }

                fn from_value(value: Value) -> Result<Self> {
                    if value.is_null() {
                        return Err(null_into(stringify!($ty)));
                    }
                    let wide = value
                        .as_i64()
                        .ok_or_else(|| mismatch(stringify!($ty), &value))?;
                    <$ty>::try_from(wide).map_err(|_| {
                        DbError::MappingError(format!(
                            "{} out of range for {}",
                            wide,
                            stringify!($ty)
                        ))
                    })
                }
            }
        )*
    };
}

// Only types that widen losslessly into i64; u64 and usize have no exact
// column form and are not mapped.
impl_integer_field!(i64, i32, i16, u32);

impl FieldValue for f64 {
    const KIND: FieldKind = FieldKind::Float;

    fn to_value(&self) -> Value {
        Value::Float(*self)
    }

    fn from_value(value: Value) -> Result<Self> {
        if value.is_null() {
            return Err(null_into("f64"));
        }
        value.as_f64().ok_or_else(|| mismatch("f64", &value))
    }
}

impl FieldValue for f32 {
    const KIND: FieldKind = FieldKind::Float;

    fn to_value(&self) -> Value {
        Value::Float(f64::from(*self))
    }

    fn from_value(value: Value) -> Result<Self> {
        f64::from_value(value).map(|f| f as f32)
    }
}

impl FieldValue for bool {
    const KIND: FieldKind = FieldKind::Boolean;

    fn to_value(&self) -> Value {
        Value::Boolean(*self)
    }

    fn from_value(value: Value) -> Result<Self> {
        if value.is_null() {
            return Err(null_into("bool"));
        }
        value.as_bool().ok_or_else(|| mismatch("bool", &value))
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    const KIND: FieldKind = T::KIND;
    const NULLABLE: bool = true;

    fn to_value(&self) -> Value {
        match self {
            Some(inner) => inner.to_value(),
            None => Value::Null,
        }
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Stored as RFC 3339 text. Integer columns are read as epoch milliseconds.
impl FieldValue for DateTime<Utc> {
    const KIND: FieldKind = FieldKind::Timestamp;

    fn to_value(&self) -> Value {
        Value::Text(self.to_rfc3339())
    }

    fn from_value(value: Value) -> Result<Self> {
        match &value {
            Value::Null => Err(null_into("timestamp")),
            Value::Integer(millis) => Utc
                .timestamp_millis_opt(*millis)
                .single()
                .ok_or_else(|| mismatch("timestamp", &value)),
            Value::Text(text) => {
                let text = text.trim();
                if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                    return Ok(parsed.with_timezone(&Utc));
                }
                NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                    .map(|naive| naive.and_utc())
                    .map_err(|_| mismatch("timestamp", &value))
            }
            _ => Err(mismatch("timestamp", &value)),
        }
    }
}

impl FieldValue for NaiveDate {
    const KIND: FieldKind = FieldKind::Date;

    fn to_value(&self) -> Value {
        Value::Text(self.format("%Y-%m-%d").to_string())
    }

    fn from_value(value: Value) -> Result<Self> {
        match &value {
            Value::Null => Err(null_into("date")),
            Value::Text(text) => {
                let text = text.trim();
                let date_part = text.get(..10).unwrap_or(text);
                NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
                    .map_err(|_| mismatch("date", &value))
            }
            _ => Err(mismatch("date", &value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_coercions() {
        assert_eq!(i64::from_value(Value::Text("42".into())).unwrap(), 42);
        assert_eq!(i32::from_value(Value::Float(7.0)).unwrap(), 7);
        assert!(i16::from_value(Value::Integer(100_000)).is_err());
        assert!(u32::from_value(Value::Integer(-1)).is_err());
        assert!(i64::from_value(Value::Text("abc".into())).is_err());
    }

    #[test]
    fn test_integer_extremes_round_trip_exactly() {
        assert_eq!(u32::from_value(u32::MAX.to_value()).unwrap(), u32::MAX);
        assert_eq!(i64::from_value(i64::MAX.to_value()).unwrap(), i64::MAX);
        assert_eq!(i64::from_value(i64::MIN.to_value()).unwrap(), i64::MIN);
        assert_eq!(i16::from_value(i16::MIN.to_value()).unwrap(), i16::MIN);

        let err = u32::from_value(Value::Integer(i64::from(u32::MAX) + 1)).unwrap_err();
        assert!(matches!(err, DbError::MappingError(_)));
        assert!(err.to_string().contains("out of range"), "{}", err);
    }

    #[test]
    fn test_null_into_non_nullable_is_a_mapping_error() {
        assert!(matches!(
            i64::from_value(Value::Null),
            Err(DbError::MappingError(_))
        ));
        assert!(matches!(
            String::from_value(Value::Null),
            Err(DbError::MappingError(_))
        ));
        assert_eq!(Option::<i64>::from_value(Value::Null).unwrap(), None);
        assert_eq!(
            Option::<String>::from_value(Value::Text("x".into())).unwrap(),
            Some("x".to_string())
        );
    }

    #[test]
    fn test_bool_from_integer_and_text() {
        assert!(bool::from_value(Value::Integer(1)).unwrap());
        assert!(!bool::from_value(Value::Text("false".into())).unwrap());
        assert!(bool::from_value(Value::Text("maybe".into())).is_err());
    }

    #[test]
    fn test_string_accepts_any_scalar() {
        assert_eq!(String::from_value(Value::Integer(5)).unwrap(), "5");
        assert_eq!(String::from_value(Value::Boolean(true)).unwrap(), "true");
    }

    #[test]
    fn test_timestamp_parsing() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let stored = ts.to_value();
        assert_eq!(DateTime::<Utc>::from_value(stored).unwrap(), ts);

        let from_millis = DateTime::<Utc>::from_value(Value::Integer(ts.timestamp_millis())).unwrap();
        assert_eq!(from_millis, ts);

        let from_naive =
            DateTime::<Utc>::from_value(Value::Text("2024-03-01 12:30:00".into())).unwrap();
        assert_eq!(from_naive, ts);
    }

    #[test]
    fn test_date_parsing() {
        let date = NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();
        assert_eq!(date.to_value(), Value::Text("2023-12-31".into()));
        assert_eq!(NaiveDate::from_value(date.to_value()).unwrap(), date);
        assert_eq!(
            NaiveDate::from_value(Value::Text("2023-12-31T00:00:00Z".into())).unwrap(),
            date
        );
    }

    #[test]
    fn test_option_keeps_inner_kind() {
        assert_eq!(<Option<f64> as FieldValue>::KIND, FieldKind::Float);
        assert!(<Option<f64> as FieldValue>::NULLABLE);
        assert!(!<f64 as FieldValue>::NULLABLE);
    }
}
