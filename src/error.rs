//! Failure taxonomy shared by every layer of the crate.
//!
//! Query-layer failures (`Network`, `Api`) come back as error values that a
//! sweep can filter without aborting; scenario/model failures
//! (`Configuration`, `Data`, `ModelFit`) abort the operation that raised
//! them. Every variant names the stage that failed and the offending value.

/// Errors that can occur while querying, fitting, or projecting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The remote data API was unreachable or timed out.
    #[error("network failure for {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The remote data API answered with a non-success status.
    #[error("{url} returned HTTP {status}: {message}")]
    Api {
        url: String,
        status: u16,
        message: String,
    },

    /// The caller omitted or malformed a required field.
    #[error("configuration error in {stage}: {message}")]
    Configuration { stage: &'static str, message: String },

    /// The available data cannot support the requested operation.
    #[error("data error in {stage}: {message}")]
    Data { stage: &'static str, message: String },

    /// The fitting capability rejected the formula/data combination.
    #[error("model fit error in {stage}: {message}")]
    ModelFit { stage: &'static str, message: String },
}

impl Error {
    pub fn configuration(stage: &'static str, message: impl Into<String>) -> Self {
        Error::Configuration {
            stage,
            message: message.into(),
        }
    }

    pub fn data(stage: &'static str, message: impl Into<String>) -> Self {
        Error::Data {
            stage,
            message: message.into(),
        }
    }

    pub fn model_fit(stage: &'static str, message: impl Into<String>) -> Self {
        Error::ModelFit {
            stage,
            message: message.into(),
        }
    }

    /// True for the query-layer failures that batch callers filter rather
    /// than abort on.
    pub fn is_query_failure(&self) -> bool {
        matches!(self, Error::Network { .. } | Error::Api { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_stage_and_offender() {
        let err = Error::data("build", "baseline has no column `vmt`");
        assert_eq!(
            err.to_string(),
            "data error in build: baseline has no column `vmt`"
        );
        assert!(!err.is_query_failure());

        let err = Error::Api {
            url: "https://example.org/api/v1/emissions".into(),
            status: 503,
            message: "maintenance window".into(),
        };
        assert!(err.is_query_failure());
        assert!(err.to_string().contains("503"));
    }
}
