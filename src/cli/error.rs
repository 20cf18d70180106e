use crate::error::FilepoolError;
use crate::pool::transfer::TransferError;

// Exit codes for CLI automation
pub const SUCCESS: i32 = 0;
pub const ERROR: i32 = 1;
pub const NOT_FOUND: i32 = 2;
pub const INVALID_INPUT: i32 = 3;

/// Exit code for a failed command
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<FilepoolError>() {
        Some(
            FilepoolError::NotInPool(_)
            | FilepoolError::LocalFileMissing(_)
            | FilepoolError::Transfer(TransferError::NotFound { .. }),
        ) => NOT_FOUND,
        Some(
            FilepoolError::NotDownloadable(_)
            | FilepoolError::InvalidPackage(_)
            | FilepoolError::InvalidPath(_)
            | FilepoolError::Config(_),
        ) => INVALID_INPUT,
        _ => ERROR,
    }
}
