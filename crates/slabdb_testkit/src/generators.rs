//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data and random
//! sequences of transaction operations.

use proptest::prelude::*;
use slabdb_core::{ColumnType, Value};

/// Strategy for generating valid table names. Names starting with `!` are
/// reserved and never generated.
pub fn table_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for the column types a plain column can have.
pub fn column_type_strategy() -> impl Strategy<Value = ColumnType> {
    prop_oneof![
        Just(ColumnType::Int),
        Just(ColumnType::Bool),
        Just(ColumnType::String),
    ]
}

/// Strategy for non-null values of `col_type`. Link columns only get
/// nulls since their values depend on the target table.
pub fn value_strategy(col_type: ColumnType) -> BoxedStrategy<Value> {
    match col_type {
        ColumnType::Int => any::<i64>().prop_map(Value::Int).boxed(),
        ColumnType::Bool => any::<bool>().prop_map(Value::Bool).boxed(),
        ColumnType::String => prop::string::string_regex("[a-zA-Z0-9 ]{0,24}")
            .expect("Invalid regex")
            .prop_map(Value::String)
            .boxed(),
        ColumnType::Link => Just(Value::Null).boxed(),
    }
}

/// One step of a randomly generated transaction workload.
///
/// Reader indexes are taken modulo the number of open readers; the step
/// does nothing when none are open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOp {
    /// Start a write, create `inserts` objects, then commit or roll back.
    Write {
        /// Number of objects to create.
        inserts: usize,
        /// Whether to commit rather than roll back.
        commit: bool,
    },
    /// Start a read transaction at the latest version.
    OpenReader,
    /// Close a reader.
    CloseReader(usize),
    /// Move a reader to the latest version.
    AdvanceReader(usize),
    /// Open a frozen copy of a reader.
    FreezeReader(usize),
    /// Promote a reader, create one object and commit.
    PromoteReader(usize),
}

/// Strategy for a single workload step.
pub fn tx_op_strategy() -> impl Strategy<Value = TxOp> {
    prop_oneof![
        3 => (0usize..8, prop::bool::weighted(0.75))
            .prop_map(|(inserts, commit)| TxOp::Write { inserts, commit }),
        2 => Just(TxOp::OpenReader),
        2 => any::<usize>().prop_map(TxOp::CloseReader),
        1 => any::<usize>().prop_map(TxOp::AdvanceReader),
        1 => any::<usize>().prop_map(TxOp::FreezeReader),
        1 => any::<usize>().prop_map(TxOp::PromoteReader),
    ]
}

/// Strategy for a workload of up to `max_len` steps.
pub fn tx_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<TxOp>> {
    prop::collection::vec(tx_op_strategy(), 1..=max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn table_names_are_never_reserved(name in table_name_strategy()) {
            prop_assert!(!name.is_empty());
            prop_assert!(!name.starts_with('!'));
        }

        #[test]
        fn values_match_their_column_type(
            (col_type, value) in column_type_strategy()
                .prop_flat_map(|t| (Just(t), value_strategy(t)))
        ) {
            prop_assert!(matches!(
                (&value, col_type),
                (Value::Int(_), ColumnType::Int)
                    | (Value::Bool(_), ColumnType::Bool)
                    | (Value::String(_), ColumnType::String)
            ));
        }

        #[test]
        fn workloads_are_never_empty(ops in tx_ops_strategy(20)) {
            prop_assert!(!ops.is_empty() && ops.len() <= 20);
        }
    }
}
