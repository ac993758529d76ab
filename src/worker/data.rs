//! Data Worker
//!
//! Short-request mode: no file I/O. The response body is captured in memory
//! (capped) together with headers, content type and status code. Data tasks
//! emit no progress and never generate notifications.

use std::collections::HashMap;

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;

use super::{Outcome, RunContext, WorkerResult};
use crate::error::{TaskError, TaskResult};
use crate::task::Task;

/// Response capture cap.
const MAX_BODY_CAPTURE: usize = 2 * 1024 * 1024;

pub async fn run(mut task: Task, ctx: &RunContext) -> WorkerResult {
    let outcome = match execute(&mut task, ctx).await {
        Ok(outcome) => outcome,
        Err(error) => Outcome::Failed(error),
    };
    WorkerResult { task, outcome }
}

async fn execute(task: &mut Task, ctx: &RunContext) -> TaskResult<Outcome> {
    let url = task.parsed_url()?;
    let method = reqwest::Method::from_bytes(task.http_method().as_bytes())
        .map_err(|e| TaskError::General(format!("bad HTTP method: {e}")))?;
    let mut request = ctx.client.request(method, url);
    for (key, value) in &task.headers {
        request = request.header(key, value);
    }
    if let Some(post) = &task.post {
        request = request.body(post.clone());
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            if ctx.cancel.is_cancelled() {
                return Ok(Outcome::Canceled);
            }
            return Err(TaskError::Connection(e.to_string()));
        }
    };
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Ok(Outcome::NotFound);
    }
    if !(200..=206).contains(&status.as_u16()) {
        return Err(TaskError::HttpResponse {
            code: status.as_u16(),
            description: status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string(),
        });
    }

    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let (mime_type, charset) = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(parse_content_type)
        .unwrap_or((None, None));

    if ctx.cancel.is_cancelled() {
        return Ok(Outcome::Canceled);
    }
    let mut body = response.text().await.map_err(TaskError::from)?;
    super::truncate_capture(&mut body, MAX_BODY_CAPTURE);

    Ok(Outcome::Complete {
        response_body: Some(body),
        response_headers: Some(headers),
        response_status_code: Some(status.as_u16()),
        mime_type,
        charset,
    })
}

/// Split `text/html; charset=utf-8` into mime type and charset.
fn parse_content_type(value: &str) -> (Option<String>, Option<String>) {
    let mut parts = value.split(';');
    let mime_type = parts.next().map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
    let charset = parts
        .filter_map(|p| {
            let p = p.trim();
            p.strip_prefix("charset=")
                .or_else(|| p.strip_prefix("charset ="))
                .map(|c| c.trim_matches('"').to_string())
        })
        .next();
    (mime_type, charset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_type() {
        assert_eq!(
            parse_content_type("text/html; charset=utf-8"),
            (Some("text/html".to_string()), Some("utf-8".to_string()))
        );
        assert_eq!(
            parse_content_type("application/json"),
            (Some("application/json".to_string()), None)
        );
        assert_eq!(
            parse_content_type("text/plain; charset=\"iso-8859-1\""),
            (Some("text/plain".to_string()), Some("iso-8859-1".to_string()))
        );
    }
}
