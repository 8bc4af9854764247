use chrono::NaiveDate;
use rustshard::orm::{Entity, FieldKind, FieldValue};
use rustshard::{DbError, EntityMapper, Value};

#[derive(Debug, Clone, Default, PartialEq, rustshard::EntityEnum)]
enum Tier {
    #[default]
    Basic,
    Gold,
    #[entity(rename = "platinum")]
    Platinum,
}

#[derive(Debug, Clone, Default, PartialEq, rustshard::Entity)]
#[entity(table = "members", replace, ignore)]
struct Member {
    id: Option<String>,
    #[entity(column = "display_name")]
    name: String,
    score: f64,
    tier: Tier,
    joined: Option<NaiveDate>,
    created: i64,
    #[entity(skip)]
    scratch: u32,
}

#[derive(Debug, Clone, Default, PartialEq, rustshard::Entity)]
struct Plain {
    id: String,
    r#type: Option<String>,
}

#[test]
fn test_descriptor_follows_declaration_order() {
    let descriptor = Member::entity_descriptor();
    assert_eq!(descriptor.type_name, "Member");
    assert_eq!(descriptor.table_name(), "members");
    assert!(descriptor.replace_supported);
    assert!(descriptor.ignore_supported);

    let columns: Vec<(&str, FieldKind, bool)> = descriptor
        .fields
        .iter()
        .map(|field| (field.name, field.kind, field.nullable))
        .collect();
    assert_eq!(
        columns,
        vec![
            ("id", FieldKind::Text, true),
            ("display_name", FieldKind::Text, false),
            ("score", FieldKind::Float, false),
            ("tier", FieldKind::Enum, false),
            ("joined", FieldKind::Date, true),
            ("created", FieldKind::Integer, false),
        ]
    );
}

#[test]
fn test_defaults_without_options() {
    let descriptor = Plain::entity_descriptor();
    assert_eq!(descriptor.table_name(), "Plain");
    assert!(!descriptor.replace_supported);
    assert!(!descriptor.ignore_supported);
    // Raw identifiers map to the bare column name.
    assert_eq!(descriptor.fields[1].name, "type");
}

#[test]
fn test_read_and_write_fields() {
    let mut member = Member::default();
    member.write_field(0, Value::from("m-1")).unwrap();
    member.write_field(1, Value::from("Ada")).unwrap();
    member.write_field(2, Value::Integer(3)).unwrap();
    member.write_field(3, Value::from("platinum")).unwrap();
    member.write_field(4, Value::from("2024-02-29")).unwrap();

    assert_eq!(member.id.as_deref(), Some("m-1"));
    assert_eq!(member.name, "Ada");
    assert_eq!(member.score, 3.0);
    assert_eq!(member.tier, Tier::Platinum);
    assert_eq!(member.joined, NaiveDate::from_ymd_opt(2024, 2, 29));

    assert_eq!(member.read_field(3), Value::from("platinum"));
    assert_eq!(member.read_field(1), Value::from("Ada"));
    assert_eq!(member.read_field(42), Value::Null);

    assert!(matches!(
        member.write_field(42, Value::Null),
        Err(DbError::MappingError(_))
    ));
    assert!(matches!(
        member.write_field(1, Value::Null),
        Err(DbError::MappingError(_))
    ));
}

#[test]
fn test_enum_values() {
    assert_eq!(Tier::KIND, FieldKind::Enum);
    assert_eq!(Tier::Gold.to_value(), Value::from("Gold"));
    assert_eq!(Tier::from_value(Value::from("Basic")).unwrap(), Tier::Basic);
    assert!(matches!(
        Tier::from_value(Value::from("Diamond")),
        Err(DbError::MappingError(_))
    ));
    assert!(matches!(
        Tier::from_value(Value::Null),
        Err(DbError::MappingError(_))
    ));
    assert!(matches!(
        Tier::from_value(Value::Integer(1)),
        Err(DbError::MappingError(_))
    ));
    assert_eq!(Option::<Tier>::from_value(Value::Null).unwrap(), None);
}

#[test]
fn test_mapper_accepts_derived_entity() {
    let mapper = EntityMapper::<Member>::new().unwrap();
    assert_eq!(mapper.table_name(), "members");
    assert!(mapper.has_column("display_name"));
    assert!(!mapper.has_column("scratch"));
    assert!(mapper.is_replace_supported());
    assert!(mapper.is_ignore_supported());
}
