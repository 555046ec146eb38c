//! Error types for Mixer Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Dangling dependency: {id} is still required by {dependents:?}")]
    DanglingDependency { id: String, dependents: Vec<String> },

    #[error("Missing dependency: {id} depends on unknown {missing:?}")]
    MissingDependency { id: String, missing: Vec<String> },

    #[error("Unknown proxy: {0}")]
    UnknownProxy(String),

    #[error("Cyclic dependency among: {0:?}")]
    CyclicDependency(Vec<String>),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Scene adapter error: {0}")]
    Scene(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
