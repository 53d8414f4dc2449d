//! Error types for fixel-based analysis

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for fixel analysis operations
pub type FixelResult<T> = Result<T, FixelError>;

/// Errors that can occur during fixel-based analysis
#[derive(Error, Debug)]
pub enum FixelError {
    /// Input validation failure (shape mismatch, empty track file, ...)
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// File read/write failure with path context
    #[error("I/O error on \"{path}\": {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The requested number of unique permutations exceeds the permutation space
    #[error("cannot generate {requested} unique permutations of {subjects} subjects")]
    PermutationSpaceExhausted { requested: usize, subjects: usize },

    /// Numerical failure that could not be demoted to a per-fixel NaN
    #[error("numerical error: {0}")]
    Numerical(String),
}

impl FixelError {
    /// Attach path context to a raw I/O error
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FixelError::FileIo {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = FixelError::InputInvalid("no tracks found in input file".into());
        assert!(err.to_string().contains("no tracks"));

        let err = FixelError::PermutationSpaceExhausted {
            requested: 5000,
            subjects: 4,
        };
        assert!(err.to_string().contains("5000"));
        assert!(err.to_string().contains("4 subjects"));
    }
}
