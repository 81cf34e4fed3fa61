use thiserror::Error;

use crate::identity::HsuError;
use crate::seal::SealError;
use crate::state::StateError;

/// Failures before an instance starts, or while listing instances.
///
/// Errors after the shim is spawned are reported through
/// [`Outcome`](crate::monitor::Outcome) instead.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Hsu(#[from] HsuError),

    #[error(transparent)]
    Seal(#[from] SealError),

    #[error(transparent)]
    State(#[from] StateError),
}
