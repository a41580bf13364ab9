use thiserror::Error;

/// Errors the engine can raise.
///
/// Per the error-handling design, only [`ReconError::InputValidation`] and
/// [`ReconError::ResourceFatal`] ever abort a run. `GeometryDegenerate`,
/// `RegistrationFailure` and `NumericDegenerate` are recovered locally
/// (slice dropped, transform reverted, value floored) and only ever
/// surfaced as counts in the metrics stream; they are kept as error
/// variants so call sites can use `?` and `tracing::warn!` uniformly
/// instead of inventing a side channel.
#[derive(Error, Debug)]
pub enum ReconError {
    #[error("input validation failed: {0}")]
    InputValidation(String),

    #[error("slice {slice} has no PSF overlap with the reconstructed volume")]
    GeometryDegenerate { slice: usize },

    #[error("registration failed for slice {slice}: {reason}")]
    RegistrationFailure { slice: usize, reason: String },

    #[error("numeric value degenerate ({what}), floored to {floor}")]
    NumericDegenerate { what: String, floor: f64 },

    #[error("fatal resource error: {0}")]
    ResourceFatal(String),
}

pub type Result<T> = std::result::Result<T, ReconError>;
