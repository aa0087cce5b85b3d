use std::process::ExitCode as ProcessExitCode;

/// Every way the launcher's injection sequence can fail, plus success.
///
/// Numeric values start at 1 so that 0 is reserved for success and never
/// collides with a real failure; order matches the sequence a single
/// injection attempt walks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    AttachFailed = 1,
    GetRegistersAfterAttachFailed = 2,
    SetInjectedShellcodeRegistersFailed = 3,
    ReadTargetMemoryFailed = 4,
    WriteShellcodeToTargetMemoryFailed = 5,
    ErrorInExecuteMalloc = 6,
    GetMallocRegistersFailed = 7,
    MallocReturnZero = 8,
    WriteLibraryStrToTargetMemoryFailed = 9,
    ErrorInExecuteDlopen = 10,
    GetDlopenRegistersFailed = 11,
    DlopenReturnZero = 12,
    ErrorInExecuteFree = 13,
    ErrorInExecuteRecoverInjection = 14,
    ErrorInVerifySoLocation = 15,
}

impl ExitCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<ExitCode> for ProcessExitCode {
    fn from(code: ExitCode) -> Self {
        ProcessExitCode::from(code.as_u8())
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.as_u8())
    }
}
