use std::time::Duration;

use thiserror::Error;

pub mod config;
pub mod controller;
pub mod vault;
pub mod workqueue;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Secret store request {method} {path} failed with status {status}")]
    SecretStoreError {
        method: String,
        path: String,
        status: u16,
    },

    #[error("HTTP Error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization Error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Timed out after {timeout:?} waiting for {service} to become ready ({phase})")]
    ReadinessTimeout {
        service: String,
        phase: ReadinessPhase,
        timeout: Duration,
    },

    #[error("Invalid resource key \"{0}\", expected namespace/name")]
    InvalidKey(String),

    #[error("Resource {0} has no {1}")]
    MissingField(String, &'static str),

    #[error("Step \"{step}\" failed: {source}")]
    StepFailed {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::KubeError(e)
    }
}

impl Error {
    /// Tags an error with the provisioning or teardown step that produced it.
    pub fn at_step(self, step: &'static str) -> Self {
        Error::StepFailed {
            step,
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, skipping step tags.
    pub fn root(&self) -> &Error {
        match self {
            Error::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessPhase {
    /// Waiting for the Endpoints object to list an address.
    Endpoints,
    /// Polling the health endpoint through the Service.
    Health,
}

impl std::fmt::Display for ReadinessPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessPhase::Endpoints => f.write_str("endpoints"),
            ReadinessPhase::Health => f.write_str("health check"),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Extension for tagging fallible steps, e.g. `create(..).await.step("service account")?`.
pub(crate) trait StepExt<T> {
    fn step(self, step: &'static str) -> Result<T>;
}

impl<T, E: Into<Error>> StepExt<T> for std::result::Result<T, E> {
    fn step(self, step: &'static str) -> Result<T> {
        self.map_err(|e| e.into().at_step(step))
    }
}
