use flight_profiler_common::ExitCode;
use thiserror::Error;

/// Every way a single injection attempt can fail, in one-to-one
/// correspondence with [`ExitCode`] so converting to a process exit code is
/// total and never needs a catch-all arm.
#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("ptrace attach failed: {0}")]
    AttachFailed(#[source] nix::Error),

    #[error("failed to read registers right after attach: {0}")]
    GetRegistersAfterAttachFailed(#[source] nix::Error),

    #[error("failed to set registers for injected shellcode: {0}")]
    SetInjectedShellcodeRegistersFailed(#[source] nix::Error),

    #[error("failed to read target memory: {0}")]
    ReadTargetMemoryFailed(#[source] nix::Error),

    #[error("failed to write shellcode into target memory: {0}")]
    WriteShellcodeToTargetMemoryFailed(#[source] nix::Error),

    #[error("error continuing target through malloc: {0}")]
    ErrorInExecuteMalloc(#[source] nix::Error),

    #[error("failed to read registers after malloc: {0}")]
    GetMallocRegistersFailed(#[source] nix::Error),

    #[error("malloc returned NULL in target")]
    MallocReturnZero,

    #[error("failed to write library path into target-allocated buffer: {0}")]
    WriteLibraryStrToTargetMemoryFailed(#[source] nix::Error),

    #[error("error continuing target through dlopen: {0}")]
    ErrorInExecuteDlopen(#[source] nix::Error),

    #[error("failed to read registers after dlopen: {0}")]
    GetDlopenRegistersFailed(#[source] nix::Error),

    #[error("dlopen returned NULL in target")]
    DlopenReturnZero,

    #[error("error continuing target through free: {0}")]
    ErrorInExecuteFree(#[source] nix::Error),

    #[error("failed to fully recover target state after a failed injection")]
    ErrorInExecuteRecoverInjection,

    #[error("agent library does not appear in the target's memory map after injection")]
    ErrorInVerifySoLocation,
}

impl From<&LauncherError> for ExitCode {
    fn from(err: &LauncherError) -> Self {
        match err {
            LauncherError::AttachFailed(_) => ExitCode::AttachFailed,
            LauncherError::GetRegistersAfterAttachFailed(_) => {
                ExitCode::GetRegistersAfterAttachFailed
            }
            LauncherError::SetInjectedShellcodeRegistersFailed(_) => {
                ExitCode::SetInjectedShellcodeRegistersFailed
            }
            LauncherError::ReadTargetMemoryFailed(_) => ExitCode::ReadTargetMemoryFailed,
            LauncherError::WriteShellcodeToTargetMemoryFailed(_) => {
                ExitCode::WriteShellcodeToTargetMemoryFailed
            }
            LauncherError::ErrorInExecuteMalloc(_) => ExitCode::ErrorInExecuteMalloc,
            LauncherError::GetMallocRegistersFailed(_) => ExitCode::GetMallocRegistersFailed,
            LauncherError::MallocReturnZero => ExitCode::MallocReturnZero,
            LauncherError::WriteLibraryStrToTargetMemoryFailed(_) => {
                ExitCode::WriteLibraryStrToTargetMemoryFailed
            }
            LauncherError::ErrorInExecuteDlopen(_) => ExitCode::ErrorInExecuteDlopen,
            LauncherError::GetDlopenRegistersFailed(_) => ExitCode::GetDlopenRegistersFailed,
            LauncherError::DlopenReturnZero => ExitCode::DlopenReturnZero,
            LauncherError::ErrorInExecuteFree(_) => ExitCode::ErrorInExecuteFree,
            LauncherError::ErrorInExecuteRecoverInjection => {
                ExitCode::ErrorInExecuteRecoverInjection
            }
            LauncherError::ErrorInVerifySoLocation => ExitCode::ErrorInVerifySoLocation,
        }
    }
}

impl From<LauncherError> for ExitCode {
    fn from(err: LauncherError) -> Self {
        ExitCode::from(&err)
    }
}
