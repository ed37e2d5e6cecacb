//! The read models this crate maintains.
//!
//! Every table is keyed by `instance_id` first, so one instance's rows are
//! never visible through another instance's queries.

pub mod features;
pub mod quota;

use crate::statement::Column;

/// Column shared by every projection table.
pub const INSTANCE_ID: &str = "instance_id";

pub(crate) fn instance_column(instance_id: &str) -> Column {
    Column::new(INSTANCE_ID, instance_id.to_string())
}
