//! Transform inference from source and target types.

use crate::core::FieldType;
use crate::transform::TransformKind;

/// Transform suggested for a source column of `declared_type` feeding a
/// target field of `field_type`.
///
/// A typed target decides the transform. Untyped targets fall back to the
/// source type.
pub fn infer_transform(declared_type: &str, field_type: &FieldType) -> TransformKind {
    match field_type {
        FieldType::Boolean => TransformKind::Bool,
        FieldType::Integer => TransformKind::Int,
        FieldType::Float => TransformKind::Float,
        FieldType::Char | FieldType::Text => TransformKind::String,
        FieldType::Date => TransformKind::Date,
        FieldType::DateTime => TransformKind::Datetime,
        FieldType::Other(_) => from_source(declared_type),
    }
}

fn from_source(declared_type: &str) -> TransformKind {
    match declared_type.to_lowercase().as_str() {
        "bit" => TransformKind::Bool,
        "int" | "bigint" | "smallint" | "tinyint" => TransformKind::Int,
        "float" | "real" => TransformKind::Float,
        "varchar" | "nvarchar" | "char" | "nchar" | "text" | "ntext" => TransformKind::String,
        "datetime" | "datetime2" | "smalldatetime" | "datetimeoffset" => TransformKind::Datetime,
        "date" => TransformKind::Date,
        _ => TransformKind::Direct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_type_decides() {
        assert_eq!(infer_transform("tinyint", &FieldType::Boolean), TransformKind::Bool);
        assert_eq!(infer_transform("datetime", &FieldType::Date), TransformKind::Date);
        assert_eq!(infer_transform("int", &FieldType::Char), TransformKind::String);
        assert_eq!(infer_transform("varchar", &FieldType::Float), TransformKind::Float);
    }

    #[test]
    fn test_untyped_target_uses_source_type() {
        let other = FieldType::Other("jsonb".to_string());
        assert_eq!(infer_transform("BIT", &other), TransformKind::Bool);
        assert_eq!(infer_transform("real", &other), TransformKind::Float);
        assert_eq!(infer_transform("datetime2", &other), TransformKind::Datetime);
        assert_eq!(infer_transform("varbinary", &other), TransformKind::Direct);
    }

    #[test]
    fn test_exact_numerics_pass_through() {
        let numeric = FieldType::Other("numeric".to_string());
        assert_eq!(infer_transform("decimal", &numeric), TransformKind::Direct);
        assert_eq!(infer_transform("money", &numeric), TransformKind::Direct);
        assert_eq!(infer_transform("numeric", &numeric), TransformKind::Direct);
    }
}
