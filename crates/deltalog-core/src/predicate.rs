//! Partition predicates.
//!
//! Transactions record the predicates they read with so conflict detection can
//! ask whether a concurrently added or removed file *could* have been visible
//! to them. Evaluation is three-valued: a predicate over a non-partition column
//! (or a data filter the engine cannot see into) evaluates to unknown, and
//! unknown counts as a match. That keeps conflict detection conservative.
//!
//! Partition values are stored as strings. How two of them compare depends on
//! the column's type in the table schema ([`PartitionColumns`]): integral and
//! fractional columns compare numerically, everything else compares the exact
//! strings. A value that does not parse as its column's number type makes the
//! comparison unknown.

use std::{cmp::Ordering, collections::BTreeSet, fmt};

use crate::{
    actions::{AddFile, PartitionValues, RemoveFile},
    schema::{DataType, PrimitiveType, StructType},
};

/// How the serialized values of a partition column are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOrdering {
    /// Signed integers.
    Integral,
    /// Floating point and decimal numbers.
    Fractional,
    /// Exact string comparison.
    Text,
}

impl ValueOrdering {
    fn of(data_type: &DataType) -> Self {
        match data_type {
            DataType::Primitive(
                PrimitiveType::Long
                | PrimitiveType::Integer
                | PrimitiveType::Short
                | PrimitiveType::Byte,
            ) => ValueOrdering::Integral,
            DataType::Primitive(
                PrimitiveType::Float | PrimitiveType::Double | PrimitiveType::Decimal { .. },
            ) => ValueOrdering::Fractional,
            _ => ValueOrdering::Text,
        }
    }

    fn compare(self, a: &str, b: &str) -> Option<Ordering> {
        match self {
            ValueOrdering::Integral => {
                let (x, y) = (a.trim().parse::<i64>().ok()?, b.trim().parse::<i64>().ok()?);
                Some(x.cmp(&y))
            }
            ValueOrdering::Fractional => {
                let (x, y) = (a.trim().parse::<f64>().ok()?, b.trim().parse::<f64>().ok()?);
                x.partial_cmp(&y)
            }
            ValueOrdering::Text => Some(a.cmp(b)),
        }
    }
}

/// A table's partition columns and how each one's values compare.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionColumns {
    columns: Vec<(String, ValueOrdering)>,
}

impl PartitionColumns {
    /// Resolve `names` against `schema`. Columns missing from the schema
    /// compare as text.
    pub fn new(schema: &StructType, names: &[String]) -> Self {
        let columns = names
            .iter()
            .map(|name| {
                let ordering = schema
                    .field_ignore_case(name)
                    .map_or(ValueOrdering::Text, |f| ValueOrdering::of(&f.data_type));
                (name.clone(), ordering)
            })
            .collect();
        Self { columns }
    }

    /// Columns whose values all compare as text.
    pub fn untyped<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: names
                .into_iter()
                .map(|n| (n.into(), ValueOrdering::Text))
                .collect(),
        }
    }

    /// Column names in table order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// Ordering used for `column`, if it is a partition column.
    pub fn ordering(&self, column: &str) -> Option<ValueOrdering> {
        self.find(column).map(|(_, o)| o)
    }

    fn find(&self, column: &str) -> Option<(&str, ValueOrdering)> {
        self.columns
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(column))
            .map(|(n, o)| (n.as_str(), *o))
    }
}

/// Comparison operator for [`Predicate::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// A boolean expression over partition columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every file.
    True,
    /// `column = value`
    Eq {
        /// Partition column.
        column: String,
        /// Serialized partition value.
        value: String,
    },
    /// `column IN (values)`
    In {
        /// Partition column.
        column: String,
        /// Serialized partition values.
        values: Vec<String>,
    },
    /// `column IS NULL`
    IsNull {
        /// Partition column.
        column: String,
    },
    /// `column <op> value`, ordered by the column's type.
    Compare {
        /// Partition column.
        column: String,
        /// Operator.
        op: CompareOp,
        /// Serialized partition value.
        value: String,
    },
    /// Conjunction.
    And(Box<Predicate>, Box<Predicate>),
    /// Disjunction.
    Or(Box<Predicate>, Box<Predicate>),
    /// Negation.
    Not(Box<Predicate>),
    /// A filter on data columns, opaque to the engine.
    DataFilter {
        /// Human-readable description, used in conflict messages.
        description: String,
    },
}

impl Predicate {
    /// `column = value`
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    /// `column IN (values)`
    pub fn is_in<I, S>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `column IS NULL`
    pub fn is_null(column: impl Into<String>) -> Self {
        Predicate::IsNull {
            column: column.into(),
        }
    }

    /// `column <op> value`
    pub fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<String>) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// An opaque filter over data columns.
    pub fn data_filter(description: impl Into<String>) -> Self {
        Predicate::DataFilter {
            description: description.into(),
        }
    }

    /// `self AND other`
    pub fn and(self, other: Predicate) -> Self {
        Predicate::And(Box::new(self), Box::new(other))
    }

    /// `self OR other`
    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    /// `NOT self`
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Columns referenced anywhere in the expression.
    pub fn references(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Predicate::True | Predicate::DataFilter { .. } => {}
            Predicate::Eq { column, .. }
            | Predicate::In { column, .. }
            | Predicate::IsNull { column }
            | Predicate::Compare { column, .. } => {
                out.insert(column.as_str());
            }
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.collect_references(out);
                b.collect_references(out);
            }
            Predicate::Not(p) => p.collect_references(out),
        }
    }

    /// Three-valued evaluation against one file's partition values.
    ///
    /// `None` means the answer depends on data the engine cannot see.
    pub fn evaluate(&self, columns: &PartitionColumns, values: &PartitionValues) -> Option<bool> {
        // A partition column with no entry is treated as null.
        let lookup = |column: &str| -> Option<(Option<&str>, ValueOrdering)> {
            let (name, ordering) = columns.find(column)?;
            let value = values
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .and_then(|(_, v)| v.as_deref());
            Some((value, ordering))
        };

        match self {
            Predicate::True => Some(true),
            Predicate::DataFilter { .. } => None,
            Predicate::Eq { column, value } => match lookup(column)? {
                (None, _) => Some(false),
                (Some(a), ordering) => ordering.compare(a, value).map(Ordering::is_eq),
            },
            Predicate::In { column, values } => match lookup(column)? {
                (None, _) => Some(false),
                (Some(a), ordering) => {
                    let mut answer = Some(false);
                    for v in values {
                        match ordering.compare(a, v) {
                            Some(Ordering::Equal) => return Some(true),
                            Some(_) => {}
                            None => answer = None,
                        }
                    }
                    answer
                }
            },
            Predicate::IsNull { column } => Some(lookup(column)?.0.is_none()),
            Predicate::Compare { column, op, value } => match lookup(column)? {
                (None, _) => Some(false),
                (Some(a), ordering) => {
                    let ord = ordering.compare(a, value)?;
                    Some(match op {
                        CompareOp::Lt => ord.is_lt(),
                        CompareOp::Le => ord.is_le(),
                        CompareOp::Gt => ord.is_gt(),
                        CompareOp::Ge => ord.is_ge(),
                    })
                }
            },
            Predicate::And(a, b) => {
                match (a.evaluate(columns, values), b.evaluate(columns, values)) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                }
            }
            Predicate::Or(a, b) => {
                match (a.evaluate(columns, values), b.evaluate(columns, values)) {
                    (Some(true), _) | (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                }
            }
            Predicate::Not(p) => p.evaluate(columns, values).map(|b| !b),
        }
    }

    /// Conservative match: true unless the predicate is definitely false.
    pub fn might_match(&self, columns: &PartitionColumns, values: &PartitionValues) -> bool {
        self.evaluate(columns, values) != Some(false)
    }

    /// Conservative match against an added file.
    pub fn might_match_add(&self, columns: &PartitionColumns, add: &AddFile) -> bool {
        self.might_match(columns, &add.partition_values)
    }

    /// Conservative match against a removed file. A tombstone without
    /// partition values always matches.
    pub fn might_match_remove(&self, columns: &PartitionColumns, remove: &RemoveFile) -> bool {
        match &remove.partition_values {
            Some(values) => self.might_match(columns, values),
            None => true,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::True => f.write_str("true"),
            Predicate::Eq { column, value } => write!(f, "{column} = '{value}'"),
            Predicate::In { column, values } => {
                write!(f, "{column} IN (")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{v}'")?;
                }
                f.write_str(")")
            }
            Predicate::IsNull { column } => write!(f, "{column} IS NULL"),
            Predicate::Compare { column, op, value } => {
                let op = match op {
                    CompareOp::Lt => "<",
                    CompareOp::Le => "<=",
                    CompareOp::Gt => ">",
                    CompareOp::Ge => ">=",
                };
                write!(f, "{column} {op} '{value}'")
            }
            Predicate::And(a, b) => write!(f, "({a} AND {b})"),
            Predicate::Or(a, b) => write!(f, "({a} OR {b})"),
            Predicate::Not(p) => write!(f, "NOT {p}"),
            Predicate::DataFilter { description } => f.write_str(description),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StructField;

    fn pv(pairs: &[(&str, Option<&str>)]) -> PartitionValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    fn cols() -> PartitionColumns {
        let schema = StructType::new(vec![
            StructField::new("date", DataType::primitive(PrimitiveType::Date), true),
            StructField::new("region", DataType::primitive(PrimitiveType::String), true),
            StructField::new("bucket", DataType::primitive(PrimitiveType::Integer), true),
            StructField::new("amount", DataType::primitive(PrimitiveType::Double), true),
        ]);
        let names = ["date", "region", "bucket", "amount"].map(String::from);
        PartitionColumns::new(&schema, &names)
    }

    #[test]
    fn equality_on_partition_column() {
        let values = pv(&[("date", Some("2024-01-01")), ("region", Some("eu"))]);
        assert_eq!(
            Predicate::eq("region", "eu").evaluate(&cols(), &values),
            Some(true)
        );
        assert_eq!(
            Predicate::eq("region", "us").evaluate(&cols(), &values),
            Some(false)
        );
        assert!(Predicate::is_in("REGION", ["us", "eu"]).might_match(&cols(), &values));
    }

    #[test]
    fn non_partition_column_is_unknown_and_matches() {
        let values = pv(&[("date", Some("2024-01-01")), ("region", Some("eu"))]);
        let p = Predicate::eq("customer", "42");
        assert_eq!(p.evaluate(&cols(), &values), None);
        assert!(p.might_match(&cols(), &values));
        assert!(p.clone().not().might_match(&cols(), &values));
    }

    #[test]
    fn and_short_circuits_on_definite_false() {
        let values = pv(&[("date", Some("2024-01-01")), ("region", Some("eu"))]);
        let p = Predicate::data_filter("amount > 10").and(Predicate::eq("region", "us"));
        assert_eq!(p.evaluate(&cols(), &values), Some(false));
        let q = Predicate::data_filter("amount > 10").or(Predicate::eq("region", "us"));
        assert_eq!(q.evaluate(&cols(), &values), None);
    }

    #[test]
    fn numeric_columns_compare_as_numbers() {
        let values = pv(&[("bucket", Some("9")), ("amount", Some("2.50")), ("region", None)]);
        let lt = |column: &str, value: &str| {
            Predicate::compare(column, CompareOp::Lt, value).evaluate(&cols(), &values)
        };
        assert_eq!(lt("bucket", "10"), Some(true));
        assert_eq!(lt("amount", "10"), Some(true));
        assert_eq!(
            Predicate::eq("bucket", "09").evaluate(&cols(), &values),
            Some(true)
        );
        assert_eq!(
            Predicate::eq("amount", "2.5").evaluate(&cols(), &values),
            Some(true)
        );
        assert_eq!(
            Predicate::is_null("region").evaluate(&cols(), &values),
            Some(true)
        );
        assert_eq!(
            Predicate::eq("region", "eu").evaluate(&cols(), &values),
            Some(false)
        );
    }

    #[test]
    fn string_columns_compare_exact_strings() {
        let padded = pv(&[("region", Some("01"))]);
        let ten = pv(&[("region", Some("10"))]);

        assert_eq!(Predicate::eq("region", "1").evaluate(&cols(), &padded), Some(false));
        assert!(Predicate::eq("region", "1").not().might_match(&cols(), &padded));
        assert!(!Predicate::is_in("region", ["1", "2"]).might_match(&cols(), &padded));

        let below_nine = Predicate::compare("region", CompareOp::Lt, "9");
        assert_eq!(below_nine.evaluate(&cols(), &padded), Some(true));
        assert_eq!(below_nine.evaluate(&cols(), &ten), Some(true));
    }

    #[test]
    fn unparseable_numbers_are_unknown() {
        let values = pv(&[("bucket", Some("seven"))]);
        let p = Predicate::eq("bucket", "7");
        assert_eq!(p.evaluate(&cols(), &values), None);
        assert!(p.clone().not().might_match(&cols(), &values));
        assert_eq!(
            Predicate::is_in("bucket", ["x", "8"]).evaluate(&cols(), &pv(&[("bucket", Some("8"))])),
            Some(true)
        );
    }

    #[test]
    fn untyped_columns_compare_as_text() {
        let cols = PartitionColumns::untyped(["p"]);
        let values = pv(&[("p", Some("10"))]);
        assert_eq!(cols.ordering("P"), Some(ValueOrdering::Text));
        assert_eq!(
            Predicate::compare("p", CompareOp::Lt, "9").evaluate(&cols, &values),
            Some(true)
        );
    }

    #[test]
    fn tombstone_without_partition_values_matches() {
        let rm = RemoveFile {
            path: "x".to_string(),
            deletion_timestamp: Some(1),
            data_change: true,
            extended_file_metadata: None,
            partition_values: None,
            size: None,
            tags: None,
            deletion_vector: None,
            base_row_id: None,
            default_row_commit_version: None,
        };
        assert!(Predicate::eq("region", "us").might_match_remove(&cols(), &rm));
    }

    #[test]
    fn display_and_references() {
        let p = Predicate::eq("a", "1").and(Predicate::is_null("b").not());
        assert_eq!(p.to_string(), "(a = '1' AND NOT b IS NULL)");
        assert_eq!(p.references().into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
