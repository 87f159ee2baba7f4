//! Column mapping: stable ids and physical names for schema fields.
//!
//! When `delta.columnMapping.mode` is `name` or `id`, every field carries
//! `delta.columnMapping.id` and `delta.columnMapping.physicalName` in its
//! metadata so columns can be renamed or dropped without rewriting data.
//! Ids are allocated from `delta.columnMapping.maxColumnId`.

use serde_json::Value;

use super::{DataType, StructField, StructType};

/// Field metadata key holding the column id.
pub const COLUMN_MAPPING_ID_KEY: &str = "delta.columnMapping.id";
/// Field metadata key holding the physical column name.
pub const COLUMN_MAPPING_PHYSICAL_NAME_KEY: &str = "delta.columnMapping.physicalName";

/// Column id of a field, if assigned.
pub fn column_id(field: &StructField) -> Option<i64> {
    field.metadata.get(COLUMN_MAPPING_ID_KEY).and_then(Value::as_i64)
}

/// Physical name of a field, falling back to the logical name.
pub fn physical_name(field: &StructField) -> &str {
    field
        .metadata
        .get(COLUMN_MAPPING_PHYSICAL_NAME_KEY)
        .and_then(Value::as_str)
        .unwrap_or(&field.name)
}

/// Highest column id assigned anywhere in `schema`, or 0.
pub fn max_column_id(schema: &StructType) -> i64 {
    schema
        .all_fields()
        .into_iter()
        .filter_map(column_id)
        .max()
        .unwrap_or(0)
}

/// Assign ids and physical names to every field that lacks them.
///
/// Fields that already exist in `existing` (matched by case-insensitive name
/// at the same nesting level) inherit its mapping. Returns the rewritten
/// schema and the new maximum column id.
pub fn assign_column_mapping(
    schema: &StructType,
    existing: Option<&StructType>,
    max_column_id: i64,
) -> (StructType, i64) {
    let mut next_id = max_column_id.max(existing.map(self::max_column_id).unwrap_or(0));
    let fields = assign_fields(
        &schema.fields,
        existing.map(|s| s.fields.as_slice()),
        &mut next_id,
    );
    (StructType::new(fields), next_id)
}

fn assign_fields(
    fields: &[StructField],
    existing: Option<&[StructField]>,
    next_id: &mut i64,
) -> Vec<StructField> {
    fields
        .iter()
        .map(|field| {
            let previous = existing.and_then(|prev| {
                prev.iter()
                    .find(|p| p.name.eq_ignore_ascii_case(&field.name))
            });
            let mut out = field.clone();

            if column_id(&out).is_none() {
                match previous.and_then(|p| column_id(p).map(|id| (id, physical_name(p)))) {
                    Some((id, physical)) => {
                        out.metadata
                            .insert(COLUMN_MAPPING_ID_KEY.to_string(), Value::from(id));
                        out.metadata.insert(
                            COLUMN_MAPPING_PHYSICAL_NAME_KEY.to_string(),
                            Value::from(physical.to_string()),
                        );
                    }
                    None => {
                        *next_id += 1;
                        out.metadata
                            .insert(COLUMN_MAPPING_ID_KEY.to_string(), Value::from(*next_id));
                        out.metadata.insert(
                            COLUMN_MAPPING_PHYSICAL_NAME_KEY.to_string(),
                            Value::from(format!("col-{}", uuid::Uuid::new_v4())),
                        );
                    }
                }
            }

            out.data_type = assign_nested(
                &field.data_type,
                previous.map(|p| &p.data_type),
                next_id,
            );
            out
        })
        .collect()
}

fn assign_nested(
    data_type: &DataType,
    previous: Option<&DataType>,
    next_id: &mut i64,
) -> DataType {
    match data_type {
        DataType::Primitive(_) => data_type.clone(),
        DataType::Struct(s) => {
            let prev_fields = match previous {
                Some(DataType::Struct(p)) => Some(p.fields.as_slice()),
                _ => None,
            };
            DataType::Struct(Box::new(StructType::new(assign_fields(
                &s.fields,
                prev_fields,
                next_id,
            ))))
        }
        DataType::Array(a) => {
            let prev = match previous {
                Some(DataType::Array(p)) => Some(&p.element_type),
                _ => None,
            };
            let mut a = a.as_ref().clone();
            a.element_type = assign_nested(&a.element_type, prev, next_id);
            DataType::Array(Box::new(a))
        }
        DataType::Map(m) => {
            let (prev_key, prev_value) = match previous {
                Some(DataType::Map(p)) => (Some(&p.key_type), Some(&p.value_type)),
                _ => (None, None),
            };
            let mut m = m.as_ref().clone();
            m.key_type = assign_nested(&m.key_type, prev_key, next_id);
            m.value_type = assign_nested(&m.value_type, prev_value, next_id);
            DataType::Map(Box::new(m))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PrimitiveType;

    #[test]
    fn assigns_sequential_ids_including_nested_fields() {
        let schema = StructType::new(vec![
            StructField::new("a", PrimitiveType::Long, true),
            StructField::new(
                "s",
                StructType::new(vec![StructField::new("x", PrimitiveType::Integer, true)]),
                true,
            ),
        ]);
        let (mapped, max_id) = assign_column_mapping(&schema, None, 0);
        assert_eq!(max_id, 3);
        let ids: Vec<_> = mapped.all_fields().into_iter().filter_map(column_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(physical_name(&mapped.fields[0]).starts_with("col-"));
    }

    #[test]
    fn existing_fields_keep_their_mapping() {
        let (v1, max1) = assign_column_mapping(
            &StructType::new(vec![StructField::new("a", PrimitiveType::Long, true)]),
            None,
            0,
        );
        let evolved = StructType::new(vec![
            StructField::new("a", PrimitiveType::Long, true),
            StructField::new("b", PrimitiveType::String, true),
        ]);
        let (v2, max2) = assign_column_mapping(&evolved, Some(&v1), max1);
        assert_eq!(max2, 2);
        assert_eq!(column_id(&v2.fields[0]), Some(1));
        assert_eq!(physical_name(&v2.fields[0]), physical_name(&v1.fields[0]));
        assert_eq!(column_id(&v2.fields[1]), Some(2));
    }

    #[test]
    fn unmapped_field_uses_logical_name() {
        let field = StructField::new("plain", PrimitiveType::Long, true);
        assert_eq!(physical_name(&field), "plain");
        assert_eq!(column_id(&field), None);
    }
}
