//! Error handling for the workflow client

use rnaflow_data::DerivedAction;
use serde::Deserialize;
use thiserror::Error;

#[derive(Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// Network failure or request that never got a response.
    #[error("request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Non-success response from the backend.
    #[error("backend responded with status {status}: {message}")]
    Http { status: u16, message: String },

    /// The backend holds a lock for this action on this job (HTTP 409).
    #[error("{action} is already running for job {job_id}: {message}")]
    ActionBusy {
        job_id: String,
        action: DerivedAction,
        message: String,
    },

    #[error("could not decode backend payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A single round trip exceeded its per-tick bound.
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// Artifacts required before a request are not listed on the job yet.
    #[error("job {job_id} is missing {}", .missing.join(", "))]
    Precondition { job_id: String, missing: Vec<String> },

    #[error("no pathway selected, pick one from the GSEA table first")]
    MissingPathway,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no job id given")]
    EmptyJobId,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub async fn from_response(response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "failed to read response text".to_string());
        ClientError::Http {
            status,
            message: detail_message(&body),
        }
    }

    /// Failures of a round trip that a later attempt may not repeat: the
    /// network, any non-2xx answer, an elapsed per-tick bound or a garbled
    /// body. Watchers count these as faults. Everything else is a local
    /// error that retrying cannot fix. A 409 from an action endpoint is
    /// reported as busy instead and is not a transport error either.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Reqwest(_)
                | ClientError::Http { .. }
                | ClientError::Timeout(_)
                | ClientError::Decode(_)
        )
    }
}

// the backend wraps error text as {"detail": "..."}; fall back to the raw body
fn detail_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            detail: serde_json::Value::String(detail),
        }) => detail,
        Ok(ErrorBody { detail }) => detail.to_string(),
        Err(_) => body.trim().to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_detail_message() {
        assert_eq!(
            "pathway_id or pathway_description is required",
            detail_message(r#"{"detail": "pathway_id or pathway_description is required"}"#)
        );
        assert_eq!(
            r#"[{"loc":["body","top_n"]}]"#,
            detail_message(r#"{"detail": [{"loc": ["body", "top_n"]}]}"#)
        );
        assert_eq!("Bad Gateway", detail_message("Bad Gateway\n"));
    }

    // testing the error taxonomy split between transport and backend answers
    #[test]
    fn test_is_transport() {
        let unavailable = ClientError::Http {
            status: 503,
            message: String::new(),
        };
        let rejected = ClientError::Http {
            status: 400,
            message: String::new(),
        };
        assert!(unavailable.is_transport());
        assert!(rejected.is_transport());
        assert!(ClientError::Timeout(10).is_transport());
        assert!(!ClientError::MissingPathway.is_transport());
        assert!(!ClientError::EmptyJobId.is_transport());
        assert!(!ClientError::Config("api_url".to_string()).is_transport());
    }
}
