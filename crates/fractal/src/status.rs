//! The record state machine.
//!
//! Transitions are planned here as pure data and applied by the storage
//! backends, so both backends enforce identical semantics:
//!
//! ```text
//! waiting ──claim──▶ running ──success──▶ complete
//!                            └─failure──▶ error
//! waiting,error,running ──cancel──▶ cancelled
//! complete ──invalidate──▶ invalid
//! any-non-deleted ──soft_delete──▶ deleted
//! cancelled ──uncancel──▶ <previous>
//! invalid   ──uninvalidate──▶ complete
//! deleted   ──undelete──▶ <previous>
//! error,running ──reset──▶ waiting
//! ```
//!
//! Status-narrowing operations push the pre-change status onto the record's
//! info backup stack; the matching revert pops it. Cancelling or deleting a
//! running record forfeits the manager claim, so `waiting` is pushed in
//! place of `running`.

use models::{RecordStatus, RecordType, ServerError};

use crate::store::RecordRow;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatusOperation {
    Reset,
    Cancel,
    Uncancel,
    Invalidate,
    Uninvalidate,
    SoftDelete,
    Undelete,
}

impl StatusOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusOperation::Reset => "reset",
            StatusOperation::Cancel => "cancel",
            StatusOperation::Uncancel => "uncancel",
            StatusOperation::Invalidate => "invalidate",
            StatusOperation::Uninvalidate => "uninvalidate",
            StatusOperation::SoftDelete => "delete",
            StatusOperation::Undelete => "undelete",
        }
    }
}

/// What must happen to the record's task row (leaf records only; a service
/// row is retained across every transition).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskEffect {
    None,
    /// Remove the task row.
    Delete,
    /// Recreate the task row (from the popped backup's tag/priority) if
    /// absent; `available` follows the new status.
    Recreate { available: bool },
    /// Task row exists; force `available = true`.
    MakeAvailable,
}

/// The planned effect of one status operation on one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPlan {
    pub new_status: RecordStatus,
    pub clear_manager: bool,
    /// Push this status onto the info backup stack.
    pub push_backup: Option<RecordStatus>,
    /// Pop the top of the info backup stack (its status is `new_status`).
    pub pop_backup: bool,
    pub task_effect: TaskEffect,
}

fn conflict(record: &RecordRow, op: StatusOperation) -> ServerError {
    ServerError::StateConflict(format!(
        "cannot {} record {} in status {}",
        op.as_str(),
        record.id,
        record.status
    ))
}

/// Plan a status change. `backup_top` is the status on top of the record's
/// info backup stack, for the revert operations.
pub fn plan_status_change(
    record: &RecordRow,
    backup_top: Option<RecordStatus>,
    op: StatusOperation,
) -> Result<StatusPlan, ServerError> {
    use RecordStatus::*;

    let is_leaf = !record.record_type.is_service();

    match op {
        StatusOperation::Reset => match record.status {
            Error | Running => Ok(StatusPlan {
                new_status: Waiting,
                clear_manager: true,
                push_backup: None,
                pop_backup: false,
                task_effect: if is_leaf {
                    TaskEffect::MakeAvailable
                } else {
                    TaskEffect::None
                },
            }),
            _ => Err(conflict(record, op)),
        },

        StatusOperation::Cancel => match record.status {
            Waiting | Running | Error => Ok(StatusPlan {
                new_status: Cancelled,
                clear_manager: record.status == Running,
                // A forfeited claim reverts to waiting, not running.
                push_backup: Some(if record.status == Running {
                    Waiting
                } else {
                    record.status
                }),
                pop_backup: false,
                task_effect: if is_leaf {
                    TaskEffect::Delete
                } else {
                    TaskEffect::None
                },
            }),
            _ => Err(conflict(record, op)),
        },

        StatusOperation::Uncancel => {
            if record.status != Cancelled {
                return Err(conflict(record, op));
            }
            let restored = backup_top.ok_or_else(|| {
                ServerError::Internal(format!(
                    "record {} is cancelled but has no info backup",
                    record.id
                ))
            })?;
            Ok(StatusPlan {
                new_status: restored,
                clear_manager: false,
                push_backup: None,
                pop_backup: true,
                task_effect: if is_leaf && restored.has_compute_row() {
                    TaskEffect::Recreate {
                        available: restored == Waiting,
                    }
                } else {
                    TaskEffect::None
                },
            })
        }

        StatusOperation::Invalidate => match record.status {
            Complete => Ok(StatusPlan {
                new_status: Invalid,
                clear_manager: false,
                push_backup: Some(Complete),
                pop_backup: false,
                task_effect: TaskEffect::None,
            }),
            _ => Err(conflict(record, op)),
        },

        StatusOperation::Uninvalidate => {
            if record.status != Invalid {
                return Err(conflict(record, op));
            }
            let restored = backup_top.ok_or_else(|| {
                ServerError::Internal(format!(
                    "record {} is invalid but has no info backup",
                    record.id
                ))
            })?;
            Ok(StatusPlan {
                new_status: restored,
                clear_manager: false,
                push_backup: None,
                pop_backup: true,
                task_effect: TaskEffect::None,
            })
        }

        StatusOperation::SoftDelete => match record.status {
            Deleted => Err(conflict(record, op)),
            status => Ok(StatusPlan {
                new_status: Deleted,
                clear_manager: status == Running,
                push_backup: Some(if status == Running { Waiting } else { status }),
                pop_backup: false,
                task_effect: if is_leaf {
                    TaskEffect::Delete
                } else {
                    TaskEffect::None
                },
            }),
        },

        StatusOperation::Undelete => {
            if record.status != Deleted {
                return Err(conflict(record, op));
            }
            let restored = backup_top.ok_or_else(|| {
                ServerError::StateConflict(format!(
                    "record {} was hard-deleted or never soft-deleted",
                    record.id
                ))
            })?;
            Ok(StatusPlan {
                new_status: restored,
                clear_manager: false,
                push_backup: None,
                pop_backup: true,
                task_effect: if is_leaf && restored.has_compute_row() {
                    TaskEffect::Recreate {
                        available: restored == Waiting,
                    }
                } else {
                    TaskEffect::None
                },
            })
        }
    }
}

/// Does this record type currently expect a task or live service row in the
/// given status? Used to uphold the row/status invariants after transitions.
pub fn expects_compute_row(record_type: RecordType, status: RecordStatus) -> bool {
    match record_type.is_service() {
        false => status.has_compute_row(),
        // Service rows survive cancellation/deletion: they hold iteration
        // state needed on revert.
        true => status != RecordStatus::Complete,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use models::Id;

    fn record(record_type: RecordType, status: RecordStatus) -> RecordRow {
        RecordRow {
            id: Id(7),
            record_type,
            status,
            manager_name: match status {
                RecordStatus::Running | RecordStatus::Error => Some("m".to_string()),
                _ => None,
            },
            created_on: Utc::now(),
            modified_on: Utc::now(),
            creator_user: None,
        }
    }

    #[test]
    fn cancel_pushes_prior_status_and_drops_task() {
        let plan = plan_status_change(
            &record(RecordType::Singlepoint, RecordStatus::Waiting),
            None,
            StatusOperation::Cancel,
        )
        .unwrap();
        assert_eq!(plan.new_status, RecordStatus::Cancelled);
        assert_eq!(plan.push_backup, Some(RecordStatus::Waiting));
        assert_eq!(plan.task_effect, TaskEffect::Delete);
        assert!(!plan.clear_manager);
    }

    #[test]
    fn cancel_of_running_forfeits_claim() {
        let plan = plan_status_change(
            &record(RecordType::Singlepoint, RecordStatus::Running),
            None,
            StatusOperation::Cancel,
        )
        .unwrap();
        assert_eq!(plan.push_backup, Some(RecordStatus::Waiting));
        assert!(plan.clear_manager);
    }

    #[test]
    fn cancel_of_complete_is_a_conflict() {
        let err = plan_status_change(
            &record(RecordType::Singlepoint, RecordStatus::Complete),
            None,
            StatusOperation::Cancel,
        )
        .unwrap_err();
        assert!(matches!(err, ServerError::StateConflict(_)));
    }

    #[test]
    fn uncancel_restores_backup_status() {
        let plan = plan_status_change(
            &record(RecordType::Singlepoint, RecordStatus::Cancelled),
            Some(RecordStatus::Error),
            StatusOperation::Uncancel,
        )
        .unwrap();
        assert_eq!(plan.new_status, RecordStatus::Error);
        assert!(plan.pop_backup);
        assert_eq!(plan.task_effect, TaskEffect::Recreate { available: false });
    }

    #[test]
    fn invalidate_round_trip() {
        let plan = plan_status_change(
            &record(RecordType::Singlepoint, RecordStatus::Complete),
            None,
            StatusOperation::Invalidate,
        )
        .unwrap();
        assert_eq!(plan.new_status, RecordStatus::Invalid);
        assert_eq!(plan.push_backup, Some(RecordStatus::Complete));
        assert_eq!(plan.task_effect, TaskEffect::None);

        let back = plan_status_change(
            &record(RecordType::Singlepoint, RecordStatus::Invalid),
            Some(RecordStatus::Complete),
            StatusOperation::Uninvalidate,
        )
        .unwrap();
        assert_eq!(back.new_status, RecordStatus::Complete);
        assert!(back.pop_backup);
    }

    #[test]
    fn delete_then_undelete_nests_with_invalidate() {
        // complete -> invalid -> deleted -> (undelete) invalid -> (uninvalidate) complete
        let del = plan_status_change(
            &record(RecordType::Singlepoint, RecordStatus::Invalid),
            Some(RecordStatus::Complete),
            StatusOperation::SoftDelete,
        )
        .unwrap();
        assert_eq!(del.new_status, RecordStatus::Deleted);
        assert_eq!(del.push_backup, Some(RecordStatus::Invalid));

        let undel = plan_status_change(
            &record(RecordType::Singlepoint, RecordStatus::Deleted),
            Some(RecordStatus::Invalid),
            StatusOperation::Undelete,
        )
        .unwrap();
        assert_eq!(undel.new_status, RecordStatus::Invalid);
        assert_eq!(undel.task_effect, TaskEffect::None);
    }

    #[test]
    fn reset_applies_to_error_and_running_only() {
        for status in [RecordStatus::Error, RecordStatus::Running] {
            let plan = plan_status_change(
                &record(RecordType::Singlepoint, status),
                None,
                StatusOperation::Reset,
            )
            .unwrap();
            assert_eq!(plan.new_status, RecordStatus::Waiting);
            assert!(plan.clear_manager);
            assert_eq!(plan.task_effect, TaskEffect::MakeAvailable);
            assert_eq!(plan.push_backup, None);
        }
        for status in [
            RecordStatus::Waiting,
            RecordStatus::Complete,
            RecordStatus::Cancelled,
            RecordStatus::Deleted,
            RecordStatus::Invalid,
        ] {
            assert!(plan_status_change(
                &record(RecordType::Singlepoint, status),
                None,
                StatusOperation::Reset,
            )
            .is_err());
        }
    }

    #[test]
    fn service_records_keep_their_service_row() {
        let plan = plan_status_change(
            &record(RecordType::Torsiondrive, RecordStatus::Waiting),
            None,
            StatusOperation::Cancel,
        )
        .unwrap();
        assert_eq!(plan.task_effect, TaskEffect::None);
        assert!(expects_compute_row(
            RecordType::Torsiondrive,
            RecordStatus::Cancelled
        ));
        assert!(!expects_compute_row(
            RecordType::Singlepoint,
            RecordStatus::Cancelled
        ));
    }
}
