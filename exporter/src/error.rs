//! Error taxonomy.
//!
//! Every failure in the exporter lands in exactly one of three dispositions:
//! refuse to start (`Config`), die so the supervisor restarts us
//! (`HardwareUnreachable`), or degrade and carry on (everything else, which
//! collectors and transformers log and absorb). Only `main` turns an error
//! into an exit code.

use dcgm_client::DcgmError;
use thiserror::Error;

/// Catalogue and flag validation failures. All fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed record on line {line}: {msg}")]
    MalformedRecord { line: usize, msg: String },
    #[error("could not find field '{0}'")]
    UnknownField(String),
    #[error("unknown prom type '{0}'")]
    UnknownPromType(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The host engine connection is gone; the process must exit non-zero so
    /// the orchestrator restarts the agent.
    #[error("host engine unreachable: {0}")]
    HardwareUnreachable(#[source] DcgmError),

    /// Any other engine error. The scrape that hit it fails; the next scrape
    /// retries from scratch.
    #[error("host engine error: {0}")]
    Transient(#[source] DcgmError),

    #[error("kubernetes: {0}")]
    Kubernetes(String),
}

impl From<DcgmError> for ExporterError {
    fn from(err: DcgmError) -> Self {
        match err {
            DcgmError::ConnectionNotValid => ExporterError::HardwareUnreachable(err),
            _ => ExporterError::Transient(err),
        }
    }
}

impl ExporterError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExporterError::HardwareUnreachable(_) | ExporterError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_loss_is_fatal_everything_else_transient() {
        let fatal: ExporterError = DcgmError::ConnectionNotValid.into();
        assert!(fatal.is_fatal());

        let transient: ExporterError = DcgmError::NoData.into();
        assert!(!transient.is_fatal());
        assert!(matches!(transient, ExporterError::Transient(_)));
    }
}
