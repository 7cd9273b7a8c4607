use async_trait::async_trait;

/// Errors from a summarization backend.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SummarizeError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("provider error {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("empty response from provider")]
    EmptyResponse,
}

/// A request to condense design content into a short textual summary.
#[derive(Clone, Debug, Default)]
pub struct SummaryRequest {
    pub content: String,
    pub instructions: Option<String>,
}

/// The out-of-band collaborator behind the `analyze` frame.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, request: SummaryRequest) -> Result<String, SummarizeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl Summarizer for Upper {
        async fn summarize(&self, request: SummaryRequest) -> Result<String, SummarizeError> {
            Ok(request.content.to_uppercase())
        }
    }

    #[tokio::test]
    async fn trait_object_dispatch() {
        let s: Box<dyn Summarizer> = Box::new(Upper);
        let out = s
            .summarize(SummaryRequest {
                content: "frame".into(),
                instructions: None,
            })
            .await
            .unwrap();
        assert_eq!(out, "FRAME");
    }

    #[test]
    fn provider_error_display() {
        let e = SummarizeError::Provider {
            status: 529,
            body: "overloaded".into(),
        };
        assert_eq!(e.to_string(), "provider error 529: overloaded");
    }
}
