use prost_reflect::{DescriptorPool, Value};
use prost_types::field_descriptor_proto::Type;

use super::*;
use crate::test_utils::{
    demo_pool, int_message, int_value, message, message_field, repeated, repeated_message, scalar,
    FileBuilder,
};

fn schema(pool: &DescriptorPool, name: &str) -> MessageSchema {
    MessageSchema::new(message(pool, name))
}

/// Two packages with the same shapes under different names, plus variants
/// that differ in one field.
fn shapes_pool() -> DescriptorPool {
    FileBuilder::new("shapes")
        .message("Inner", vec![scalar("n", 1, Type::Int64)])
        .message("InnerText", vec![scalar("n", 1, Type::String)])
        .message(
            "Wide",
            vec![
                scalar("id", 1, Type::Int64),
                scalar("label", 3, Type::String),
                message_field("inner", 4, "shapes.Inner"),
                scalar("extra", 9, Type::Bool),
            ],
        )
        .message(
            "Narrow",
            vec![
                scalar("identifier", 1, Type::Int64),
                message_field("nested", 4, "shapes.Inner"),
            ],
        )
        .message("LabelText", vec![scalar("label", 3, Type::String)])
        .message("LabelInt", vec![scalar("label", 3, Type::Int64)])
        .message("Ids", vec![repeated("id", 1, Type::Int64)])
        .message(
            "DeepText",
            vec![message_field("inner", 4, "shapes.InnerText")],
        )
        .message(
            "Node",
            vec![
                scalar("value", 1, Type::Int64),
                message_field("next", 2, "shapes.Node"),
                repeated_message("children", 3, "shapes.Node"),
            ],
        )
        .message(
            "Link",
            vec![
                scalar("data", 1, Type::Int64),
                message_field("tail", 2, "shapes.Link"),
                repeated_message("kids", 3, "shapes.Link"),
            ],
        )
        .build()
}

// ============================================================================
// Compatibility
// ============================================================================

#[test]
fn test_compatible_is_reflexive() {
    let pool = shapes_pool();
    for name in ["shapes.Wide", "shapes.Narrow", "shapes.Node", "shapes.Ids"] {
        let s = schema(&pool, name);
        assert!(s.compatible(&s), "{} should be compatible with itself", name);
    }
}

#[test]
fn test_compatible_ignores_fields_on_one_side_only() {
    let pool = shapes_pool();
    let wide = schema(&pool, "shapes.Wide");
    let narrow = schema(&pool, "shapes.Narrow");
    assert!(wide.compatible(&narrow));
    assert!(narrow.compatible(&wide));
}

#[test]
fn test_compatible_ignores_names() {
    let pool = shapes_pool();
    let demo = demo_pool();
    // shapes.Inner { int64 n = 1 } vs demo.Number { int64 value = 1 }
    let inner = schema(&pool, "shapes.Inner");
    let number = schema(&demo, "demo.Number");
    assert!(inner.compatible(&number));
}

#[test]
fn test_type_mismatch_is_incompatible() {
    let pool = shapes_pool();
    let text = schema(&pool, "shapes.LabelText");
    let int = schema(&pool, "shapes.LabelInt");
    assert!(!text.compatible(&int));
    assert!(!int.compatible(&text));
}

#[test]
fn test_cardinality_mismatch_is_incompatible() {
    let pool = shapes_pool();
    let ids = schema(&pool, "shapes.Ids");
    let narrow = schema(&pool, "shapes.Narrow");
    assert!(!ids.compatible(&narrow));
}

#[test]
fn test_nested_mismatch_is_incompatible() {
    let pool = shapes_pool();
    let wide = schema(&pool, "shapes.Wide");
    let deep = schema(&pool, "shapes.DeepText");
    assert!(!wide.compatible(&deep));
}

#[test]
fn test_recursive_types_terminate() {
    let pool = shapes_pool();
    let node = schema(&pool, "shapes.Node");
    let link = schema(&pool, "shapes.Link");
    assert!(node.compatible(&link));
}

#[test]
fn test_recursive_type_against_mismatch() {
    let pool = shapes_pool();
    let node = schema(&pool, "shapes.Node");
    // Node.value (1) is singular, Ids.id (1) is repeated.
    let ids = schema(&pool, "shapes.Ids");
    assert!(!node.compatible(&ids));
}

// ============================================================================
// Projection
// ============================================================================

#[test]
fn test_field_projects_message_field() {
    let pool = shapes_pool();
    let wide = schema(&pool, "shapes.Wide");
    let inner = wide.field("inner").unwrap();
    assert_eq!(inner.full_name(), "shapes.Inner");
    assert_eq!(inner, schema(&pool, "shapes.Inner"));
}

#[test]
fn test_field_rejects_scalar_and_missing() {
    let pool = shapes_pool();
    let wide = schema(&pool, "shapes.Wide");
    assert!(wide.field("label").is_none());
    assert!(wide.field("missing").is_none());
    assert!(wide.project("label").unwrap_err().is_not_found());
    assert!(wide.project("missing").unwrap_err().is_not_found());
}

#[test]
fn test_field_rejects_repeated_message() {
    let pool = shapes_pool();
    let node = schema(&pool, "shapes.Node");
    assert!(node.field("children").is_none());
    assert_eq!(node.field("next").unwrap().full_name(), "shapes.Node");
}

// ============================================================================
// Messages
// ============================================================================

#[test]
fn test_new_empty_has_schema_type() {
    let pool = demo_pool();
    let number = schema(&pool, "demo.Number");
    let empty = number.new_empty();
    assert_eq!(empty.descriptor().full_name(), "demo.Number");
    assert_eq!(int_value(&empty), 0);
}

#[test]
fn test_transcode_between_compatible_types() {
    let pool = demo_pool();
    let number = message(&pool, "demo.Number");
    let sum = schema(&pool, "demo.Sum");

    let converted = sum.transcode(&int_message(&number, 21)).unwrap();
    assert_eq!(converted.descriptor().full_name(), "demo.Sum");
    assert_eq!(
        converted.get_field_by_name("value").unwrap().as_ref(),
        &Value::I64(21)
    );
}

#[test]
fn test_display_is_full_name() {
    let pool = demo_pool();
    assert_eq!(schema(&pool, "demo.Pair").to_string(), "demo.Pair");
}
