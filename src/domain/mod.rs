//! Domain aggregates and the commands that write them.
//!
//! Each submodule defines the request type, the adjacently tagged event
//! enum, the write model, and an `impl Commands` block with its commands.

pub mod features;
pub mod mail_text;
pub mod quota;

use crate::error::CommandError;

/// Aggregate type of organizations.
pub const ORG_AGGREGATE_TYPE: &str = "org";

/// Aggregate type of the instance itself. Its aggregate id is the instance
/// id.
pub const INSTANCE_AGGREGATE_TYPE: &str = "instance";

/// Reject an empty required field.
pub(crate) fn require(field: &str, value: &str) -> Result<(), CommandError> {
    if value.trim().is_empty() {
        return Err(CommandError::invalid(format!("{field} is required")));
    }
    Ok(())
}
