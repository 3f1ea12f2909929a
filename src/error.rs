use thiserror::Error;

/// Errors raised by the solver core.
///
/// Ordinary non-convergence is not an error: it is reported through
/// `converged = false` on the numeric results.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PowerFlowError {
    #[error("{what}: expected length {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("branch {branch} references bus {bus} but the circuit has {nbus} buses")]
    BusIndexOutOfRange { branch: usize, bus: usize, nbus: usize },

    #[error("island {island} has no reference (slack) bus")]
    NoSlack { island: usize },

    #[error("singular system: {0}")]
    Singular(String),

    #[error("outage of branch {branch} islands the network")]
    Islanding { branch: usize },

    #[error("linear solver: {0}")]
    LinearSolver(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),
}

pub type Result<T> = std::result::Result<T, PowerFlowError>;
