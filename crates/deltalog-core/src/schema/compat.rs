//! Schema compatibility checks for metadata updates.
//!
//! Three modes are supported:
//! - [`SchemaEvolution::Exact`]: the proposed schema must have the same columns
//!   with the same types and nullability (field metadata and order are ignored).
//! - [`SchemaEvolution::Merge`]: existing columns must survive with the same or
//!   a widened type; new columns must be nullable; nullability may only relax.
//! - [`SchemaEvolution::Overwrite`]: any valid schema is accepted.

use std::collections::HashMap;

use snafu::prelude::*;

use super::{DataType, PrimitiveType, StructField, StructType};

/// How a proposed schema may differ from the table schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaEvolution {
    /// No change allowed.
    #[default]
    Exact,
    /// Additive change allowed.
    Merge,
    /// Replace the schema wholesale.
    Overwrite,
}

/// Errors raised when a proposed schema is not compatible with the table.
#[derive(Debug, Snafu)]
pub enum SchemaCompatibilityError {
    /// The proposed schema is missing a column that exists in the table schema.
    #[snafu(display("Proposed schema is missing column {column}"))]
    MissingColumn {
        /// Dotted path of the missing column.
        column: String,
    },

    /// The proposed schema has a column the table does not have.
    #[snafu(display("Proposed schema has extra column {column} not present in table schema"))]
    ExtraColumn {
        /// Dotted path of the extra column.
        column: String,
    },

    /// A newly added column is declared non-nullable.
    #[snafu(display("New column {column} must be nullable"))]
    NonNullableNewColumn {
        /// Dotted path of the new column.
        column: String,
    },

    /// Column exists in both schemas, but the types differ.
    #[snafu(display(
        "Type mismatch for column {column}: table has {table_type}, proposed has {proposed_type}"
    ))]
    TypeMismatch {
        /// Dotted path of the column.
        column: String,
        /// The type in the table schema.
        table_type: DataType,
        /// The type in the proposed schema.
        proposed_type: DataType,
    },

    /// A nullable column became non-nullable, or nullability differs in exact mode.
    #[snafu(display("Nullability of column {column} cannot change from {table_nullable}"))]
    NullabilityMismatch {
        /// Dotted path of the column.
        column: String,
        /// Nullability in the table schema.
        table_nullable: bool,
    },
}

/// A convenience type alias for results of schema compatibility operations.
pub type SchemaCompatResult<T> = Result<T, SchemaCompatibilityError>;

/// Whether `from` may be widened to `to` when type widening is enabled.
pub fn is_widening(from: &PrimitiveType, to: &PrimitiveType) -> bool {
    use PrimitiveType::*;
    match (from, to) {
        (Byte, Short | Integer | Long | Double) => true,
        (Short, Integer | Long | Double) => true,
        (Integer, Long | Double) => true,
        (Float, Double) => true,
        (Date, TimestampNtz) => true,
        (
            Decimal {
                precision: p1,
                scale: s1,
            },
            Decimal {
                precision: p2,
                scale: s2,
            },
        ) => {
            p2 >= p1 && s2 >= s1 && i16::from(*p2) - i16::from(*s2) >= i16::from(*p1) - i16::from(*s1)
        }
        _ => false,
    }
}

/// Check `proposed` against `existing` under `mode`.
pub fn ensure_compatible(
    existing: &StructType,
    proposed: &StructType,
    mode: SchemaEvolution,
    allow_widening: bool,
) -> SchemaCompatResult<()> {
    match mode {
        SchemaEvolution::Overwrite => Ok(()),
        SchemaEvolution::Exact | SchemaEvolution::Merge => {
            check_struct(&existing.fields, &proposed.fields, "", mode, allow_widening)
        }
    }
}

fn by_lower_name(fields: &[StructField]) -> HashMap<String, &StructField> {
    fields
        .iter()
        .map(|f| (f.name.to_ascii_lowercase(), f))
        .collect()
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn check_struct(
    existing: &[StructField],
    proposed: &[StructField],
    prefix: &str,
    mode: SchemaEvolution,
    allow_widening: bool,
) -> SchemaCompatResult<()> {
    let proposed_by_name = by_lower_name(proposed);
    let existing_by_name = by_lower_name(existing);

    for table_field in existing {
        let column = join(prefix, &table_field.name);
        let new_field = proposed_by_name
            .get(&table_field.name.to_ascii_lowercase())
            .context(MissingColumnSnafu {
                column: column.clone(),
            })?;

        let nullability_ok = match mode {
            SchemaEvolution::Exact => table_field.nullable == new_field.nullable,
            _ => new_field.nullable || !table_field.nullable,
        };
        ensure!(
            nullability_ok,
            NullabilityMismatchSnafu {
                column: column.clone(),
                table_nullable: table_field.nullable,
            }
        );

        check_type(
            &table_field.data_type,
            &new_field.data_type,
            &column,
            mode,
            allow_widening,
        )?;
    }

    for new_field in proposed {
        if existing_by_name.contains_key(&new_field.name.to_ascii_lowercase()) {
            continue;
        }
        let column = join(prefix, &new_field.name);
        match mode {
            SchemaEvolution::Exact => return ExtraColumnSnafu { column }.fail(),
            _ => ensure!(new_field.nullable, NonNullableNewColumnSnafu { column }),
        }
    }
    Ok(())
}

fn check_type(
    table_type: &DataType,
    proposed_type: &DataType,
    column: &str,
    mode: SchemaEvolution,
    allow_widening: bool,
) -> SchemaCompatResult<()> {
    let mismatch = || SchemaCompatibilityError::TypeMismatch {
        column: column.to_string(),
        table_type: table_type.clone(),
        proposed_type: proposed_type.clone(),
    };

    match (table_type, proposed_type) {
        (DataType::Primitive(a), DataType::Primitive(b)) => {
            let widened = allow_widening && mode == SchemaEvolution::Merge && is_widening(a, b);
            if a == b || widened {
                Ok(())
            } else {
                Err(mismatch())
            }
        }
        (DataType::Struct(a), DataType::Struct(b)) => {
            check_struct(&a.fields, &b.fields, column, mode, allow_widening)
        }
        (DataType::Array(a), DataType::Array(b)) => {
            if a.contains_null && !b.contains_null {
                return Err(mismatch());
            }
            check_type(
                &a.element_type,
                &b.element_type,
                &join(column, "element"),
                mode,
                allow_widening,
            )
        }
        (DataType::Map(a), DataType::Map(b)) => {
            if a.value_contains_null && !b.value_contains_null {
                return Err(mismatch());
            }
            check_type(&a.key_type, &b.key_type, &join(column, "key"), mode, false)?;
            check_type(
                &a.value_type,
                &b.value_type,
                &join(column, "value"),
                mode,
                allow_widening,
            )
        }
        _ => Err(mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> StructType {
        StructType::new(vec![
            StructField::new("id", PrimitiveType::Integer, false),
            StructField::new("name", PrimitiveType::String, true),
        ])
    }

    #[test]
    fn exact_accepts_identical_schema_in_any_order() {
        let reordered = StructType::new(vec![
            StructField::new("name", PrimitiveType::String, true),
            StructField::new("id", PrimitiveType::Integer, false),
        ]);
        assert!(ensure_compatible(&base(), &reordered, SchemaEvolution::Exact, false).is_ok());
    }

    #[test]
    fn exact_rejects_extra_column() {
        let mut proposed = base();
        proposed
            .fields
            .push(StructField::new("extra", PrimitiveType::Long, true));
        let err = ensure_compatible(&base(), &proposed, SchemaEvolution::Exact, false)
            .expect_err("extra column");
        assert!(matches!(err, SchemaCompatibilityError::ExtraColumn { .. }));
    }

    #[test]
    fn merge_accepts_new_nullable_column() {
        let mut proposed = base();
        proposed
            .fields
            .push(StructField::new("extra", PrimitiveType::Long, true));
        assert!(ensure_compatible(&base(), &proposed, SchemaEvolution::Merge, false).is_ok());
    }

    #[test]
    fn merge_rejects_new_required_column_and_dropped_column() {
        let mut proposed = base();
        proposed
            .fields
            .push(StructField::new("extra", PrimitiveType::Long, false));
        assert!(matches!(
            ensure_compatible(&base(), &proposed, SchemaEvolution::Merge, false),
            Err(SchemaCompatibilityError::NonNullableNewColumn { .. })
        ));

        let dropped = StructType::new(vec![StructField::new("id", PrimitiveType::Integer, false)]);
        assert!(matches!(
            ensure_compatible(&base(), &dropped, SchemaEvolution::Merge, false),
            Err(SchemaCompatibilityError::MissingColumn { .. })
        ));
    }

    #[test]
    fn widening_requires_flag() {
        let widened = StructType::new(vec![
            StructField::new("id", PrimitiveType::Long, false),
            StructField::new("name", PrimitiveType::String, true),
        ]);
        assert!(matches!(
            ensure_compatible(&base(), &widened, SchemaEvolution::Merge, false),
            Err(SchemaCompatibilityError::TypeMismatch { .. })
        ));
        assert!(ensure_compatible(&base(), &widened, SchemaEvolution::Merge, true).is_ok());
        // Narrowing is never allowed.
        assert!(ensure_compatible(&widened, &base(), SchemaEvolution::Merge, true).is_err());
    }

    #[test]
    fn merge_rejects_tightened_nullability() {
        let tightened = StructType::new(vec![
            StructField::new("id", PrimitiveType::Integer, false),
            StructField::new("name", PrimitiveType::String, false),
        ]);
        assert!(matches!(
            ensure_compatible(&base(), &tightened, SchemaEvolution::Merge, false),
            Err(SchemaCompatibilityError::NullabilityMismatch { .. })
        ));
    }

    #[test]
    fn overwrite_accepts_anything() {
        let other = StructType::new(vec![StructField::new("z", PrimitiveType::Binary, false)]);
        assert!(ensure_compatible(&base(), &other, SchemaEvolution::Overwrite, false).is_ok());
    }

    #[test]
    fn decimal_widening_preserves_integer_digits() {
        let d = |precision, scale| PrimitiveType::Decimal { precision, scale };
        assert!(is_widening(&d(10, 2), &d(12, 2)));
        assert!(is_widening(&d(10, 2), &d(12, 4)));
        assert!(!is_widening(&d(10, 2), &d(10, 4)));
    }
}
