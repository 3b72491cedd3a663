use crate::{CategoryId, DepartmentId, DivisionId, MemberId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tribute sent from one member to another.
///
/// Owned by the tribute ledger; this crate only models its shape so the
/// hierarchy catalog can validate the references it carries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TributeTransfer {
    pub sender: MemberId,
    pub receiver: MemberId,
    pub amount: u64,
    pub category: CategoryId,
    pub division: DivisionId,
    pub department: DepartmentId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
