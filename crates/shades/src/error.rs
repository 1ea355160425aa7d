//! Error Module - Shades Error Types
//!
//! Defines all error types used across the heap, commit, recovery, loader
//! and VM layers.

use thiserror::Error;

/// Main error type for all Shades operations
#[derive(Debug, Error)]
pub enum ShadesError {
    #[error("First generation exhausted: requested {requested} words, available {available} words")]
    FirstGenerationFull { requested: usize, available: usize },

    #[error("Database full: no free page for generation {generation}")]
    DatabaseFull { generation: u32 },

    #[error("Disk image full: no free disk page")]
    DiskFull,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Disk image I/O failed during {operation}: {source}")]
    DiskIo {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("No valid root block found in disk image")]
    NoValidRoot,

    #[error("Recovered image does not match configuration: {0}")]
    RecoveryMismatch(String),

    #[error("Continuation frame too large: {words} words exceeds {limit}")]
    ContTooLarge { words: usize, limit: usize },

    #[error("Bytecode load failed:\n{0}")]
    BcodeLoad(LoadErrors),

    #[error("Unknown global id {0}")]
    UnknownGlobal(u32),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShadesError {
    /// Check if this error is recoverable by committing and retrying
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ShadesError::FirstGenerationFull { .. })
    }

    /// Check if this error indicates a bug in the caller or a bytecode producer
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            ShadesError::Internal(_) | ShadesError::UnknownGlobal(_)
        )
    }

    /// Process exit code per the CLI contract: 1 for configuration/IO
    /// errors, 2 for invariant violations.
    pub fn exit_code(&self) -> i32 {
        if self.is_bug() {
            2
        } else {
            1
        }
    }
}

/// Accumulated per-item problems from one bytecode load.
///
/// The loader validates the whole instruction stream and reports every
/// problem it finds; the load succeeds only if this list stays empty.
#[derive(Debug, Default)]
pub struct LoadErrors(pub Vec<LoadProblem>);

/// One problem found while validating a raw bytecode stream
#[derive(Debug, Error)]
pub enum LoadProblem {
    #[error("word {word}: unknown opcode {opcode:#x}")]
    UnknownOpcode { word: usize, opcode: u32 },

    #[error("word {word}: instruction truncated, needs {needed} words but {remaining} remain")]
    TruncatedInsn {
        word: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("word {word}: branch target {target} is not an instruction boundary")]
    BadBranchTarget { word: usize, target: usize },

    #[error("word {word}: backward branch to {target} is forbidden")]
    BackwardBranch { word: usize, target: usize },

    #[error("word {word}: immediate string id {id} is not interned")]
    UnknownString { word: usize, id: u32 },

    #[error("entry point {name:?} is already declared")]
    DuplicateEntryPoint { name: String },

    #[error("bcode cell of {words} words would exceed the page limit of {limit}")]
    CodeTooLong { words: usize, limit: usize },

    #[error("stack too deep: continuation frame of {words} words exceeds {limit}")]
    StackTooDeep { words: usize, limit: usize },
}

impl std::fmt::Display for LoadErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, p) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  {p}")?;
        }
        Ok(())
    }
}

impl From<LoadErrors> for ShadesError {
    fn from(e: LoadErrors) -> Self {
        ShadesError::BcodeLoad(e)
    }
}

/// Result type alias for Shades operations
pub type Result<T> = std::result::Result<T, ShadesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_generation_full_is_recoverable() {
        let e = ShadesError::FirstGenerationFull {
            requested: 100,
            available: 10,
        };
        assert!(e.is_recoverable());
        assert!(!e.is_bug());
        assert_eq!(e.exit_code(), 1);
    }

    #[test]
    fn test_internal_error_is_bug() {
        let e = ShadesError::Internal("oops".to_string());
        assert!(e.is_bug());
        assert_eq!(e.exit_code(), 2);
    }

    #[test]
    fn test_load_errors_format() {
        let errs = LoadErrors(vec![
            LoadProblem::UnknownOpcode { word: 3, opcode: 0xffff },
            LoadProblem::StackTooDeep { words: 300, limit: 254 },
        ]);
        let msg = ShadesError::from(errs).to_string();
        assert!(msg.contains("unknown opcode"));
        assert!(msg.contains("stack too deep"));
    }
}
