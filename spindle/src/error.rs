use std::io;

use thiserror::Error;

/// Recoverable failures. Broken invariants are not errors, they are fatal.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to allocate a {size} byte fiber stack")]
    StackAllocation {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("invalid value {value:?} for `{key}`")]
    InvalidConfig { key: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, Error>;
