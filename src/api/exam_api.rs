use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;

use crate::config::ApiConfig;
use crate::error::{ProctorError, Result};

const REQUEST_TIMEOUT_SECS: u64 = 10;

/// The one REST call the proctoring core depends on.
pub trait ExamApi: Send + Sync {
    /// Records that the candidate left the exam and why.
    fn exit_answer<'a>(
        &'a self,
        exam_id: &'a str,
        answer_id: &'a str,
        message: &'a str,
    ) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExitAnswerRequest<'a> {
    exam_id: &'a str,
    answer_id: &'a str,
    message: &'a str,
}

pub struct HttpExamApi {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl HttpExamApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProctorError::internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

impl ExamApi for HttpExamApi {
    fn exit_answer<'a>(
        &'a self,
        exam_id: &'a str,
        answer_id: &'a str,
        message: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let url = self.endpoint("answer/exit");
            let mut request = self.client.patch(&url).json(&ExitAnswerRequest {
                exam_id,
                answer_id,
                message,
            });
            if let Some(token) = &self.auth_token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            if !response.status().is_success() {
                let status = response.status();
                let error_text = response.text().await.unwrap_or_default();
                return Err(ProctorError::Api(format!(
                    "exit answer failed with status {}: {}",
                    status, error_text
                )));
            }

            tracing::info!(exam_id = %exam_id, answer_id = %answer_id, message = %message, "Exam exit recorded");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use warp::Filter;

    type Captured = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    fn serve(status: warp::http::StatusCode) -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();

        let route = warp::patch()
            .and(warp::path!("api" / "answer" / "exit"))
            .and(warp::header::optional::<String>("authorization"))
            .and(warp::body::json())
            .map(move |auth: Option<String>, body: serde_json::Value| {
                sink.lock().unwrap().push((auth, body));
                warp::reply::with_status("ok", status)
            });

        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        (format!("http://{}/api", addr), captured)
    }

    #[tokio::test]
    async fn test_exit_answer_sends_patch_with_bearer() {
        let (base_url, captured) = serve(warp::http::StatusCode::OK);
        let api = HttpExamApi::new(&ApiConfig {
            base_url: format!("{}/", base_url),
            auth_token: Some("secret-token".into()),
        })
        .unwrap();

        api.exit_answer("exam-1", "answer-9", "Malpractice").await.unwrap();

        let calls = captured.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.as_deref(), Some("Bearer secret-token"));
        assert_eq!(
            calls[0].1,
            serde_json::json!({"examId": "exam-1", "answerId": "answer-9", "message": "Malpractice"})
        );
    }

    #[tokio::test]
    async fn test_exit_answer_surfaces_http_failure() {
        let (base_url, _captured) = serve(warp::http::StatusCode::INTERNAL_SERVER_ERROR);
        let api = HttpExamApi::new(&ApiConfig {
            base_url,
            auth_token: None,
        })
        .unwrap();

        let err = api.exit_answer("exam-1", "answer-9", "Submitted").await.unwrap_err();
        assert!(matches!(err, ProctorError::Api(_)));
        assert!(err.to_string().contains("500"));
    }
}
