//! Exit codes for the pm-scrub CLI.
//!
//! Exit codes communicate the outcome of a run without requiring output
//! parsing.
//!
//! Exit code ranges:
//! - 0-3: Operational outcomes (the run completed; the code grades it)
//! - 10-19: User/environment errors (recoverable by user action)
//! - 20-29: Internal errors (bugs, should be reported)

/// Exit codes for pm-scrub operations.
///
/// These codes are a stable contract for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    // ========================================================================
    // Operational Outcomes (0-3)
    // ========================================================================
    /// Every incident processed with no validation issues
    Clean = 0,

    /// Non-critical validation issues were reported
    IssuesFound = 1,

    /// Critical issues or residual PII in at least one incident
    CriticalIssues = 2,

    /// Some incidents failed (e.g. a mandatory detector); the rest completed
    PartialFail = 3,

    // ========================================================================
    // User / Environment Errors (10-19)
    // ========================================================================
    /// Invalid arguments or malformed batch input
    ArgsError = 10,

    /// Malformed or missing policy/configuration
    ConfigError = 11,

    // ========================================================================
    // Internal Errors (20-29)
    // ========================================================================
    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error
    IoError = 21,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Check if this exit code indicates a clean run.
    pub fn is_success(self) -> bool {
        matches!(self, ExitCode::Clean)
    }

    /// Check if this exit code indicates an operational outcome (codes 0-3).
    pub fn is_operational(self) -> bool {
        (self as i32) < 10
    }

    /// Check if this exit code is a user/environment error (codes 10-19).
    pub fn is_user_error(self) -> bool {
        let code = self as i32;
        (10..20).contains(&code)
    }

    /// Check if this exit code is an internal error (codes 20-29).
    pub fn is_internal_error(self) -> bool {
        let code = self as i32;
        code >= 20
    }

    /// Check if this exit code indicates any error requiring attention.
    pub fn is_error(self) -> bool {
        (self as i32) >= 10
    }

    /// Get the code name as a string constant (for JSON output).
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::IssuesFound => "OK_ISSUES",
            ExitCode::CriticalIssues => "ERR_CRITICAL",
            ExitCode::PartialFail => "ERR_PARTIAL",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges() {
        assert!(ExitCode::Clean.is_success());
        assert!(ExitCode::CriticalIssues.is_operational());
        assert!(!ExitCode::CriticalIssues.is_error());
        assert!(ExitCode::ConfigError.is_user_error());
        assert!(ExitCode::IoError.is_internal_error());
        assert!(!ExitCode::ArgsError.is_internal_error());
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitCode::ConfigError.to_string(), "ERR_CONFIG (11)");
        assert_eq!(i32::from(ExitCode::PartialFail), 3);
    }
}
