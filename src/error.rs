//! Error taxonomy shared by every reconstruction, training and persistence path.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LenslessError>;

#[derive(Debug, thiserror::Error)]
pub enum LenslessError {
    /// An operation was called out of order, e.g. stepping a solver that has no data.
    #[error("usage error: {0}")]
    Usage(String),

    /// Unknown identifier, invalid weight or an impossible component combination.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Non-finite gradients detected after a backward pass.
    #[error("numeric instability: non-finite gradients in the {group} parameter group")]
    NumericInstability { group: String },

    #[error("numeric error: {0}")]
    Numeric(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("npy write error: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),

    #[error("npz write error: {0}")]
    NpzWrite(#[from] ndarray_npy::WriteNpzError),

    #[error("npy read error: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    #[error("npz read error: {0}")]
    NpzRead(#[from] ndarray_npy::ReadNpzError),
}

impl LenslessError {
    pub(crate) fn shape(context: &str, expected: &[usize], found: &[usize]) -> Self {
        LenslessError::ShapeMismatch {
            context: context.to_string(),
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }
}

impl From<realfft::FftError> for LenslessError {
    fn from(err: realfft::FftError) -> Self {
        LenslessError::Numeric(format!("fft: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let err = LenslessError::shape("operator input", &[4, 4, 1], &[3, 4, 1]);
        let msg = err.to_string();
        assert!(msg.contains("operator input"));
        assert!(msg.contains("[4, 4, 1]"));
    }

    #[test]
    fn test_instability_names_group() {
        let err = LenslessError::NumericInstability {
            group: "mask".to_string(),
        };
        assert!(err.to_string().contains("mask"));
    }
}
