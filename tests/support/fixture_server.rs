//! Mock HTTP fixtures for transfer tests, built on wiremock.
//!
//! A single [`Respond`] implementation serves one body with byte-range
//! support: `Range` requests are answered with 206 + `Content-Range`,
//! `If-Range` is validated against a fixed ETag (a stale validator gets the
//! full 200 body), and HEAD probes see the same headers. Forced status codes
//! cover the 404/503 scenarios and an optional response delay keeps
//! transfers in flight long enough for admission tests.

use std::time::Duration;

use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// One received request, reduced to the fields tests assert on.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub range: Option<String>,
    pub if_range: Option<String>,
}

#[derive(Clone)]
pub struct FixtureOptions {
    pub body: Vec<u8>,
    /// Strong validator sent on every response
    pub etag: Option<String>,
    pub accept_ranges: bool,
    pub content_disposition: Option<String>,
    /// Always answer with this status and an empty body
    pub force_status: Option<u16>,
    /// Delay before the response is sent
    pub response_delay: Option<Duration>,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            body: Vec::new(),
            etag: Some("\"fixture-v1\"".to_string()),
            accept_ranges: true,
            content_disposition: None,
            force_status: None,
            response_delay: None,
        }
    }
}

pub struct FixtureServer {
    server: MockServer,
}

impl FixtureServer {
    pub async fn spawn(options: FixtureOptions) -> Self {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(RangeResponder { options })
            .mount(&server)
            .await;
        Self { server }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.uri(), path)
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|request| RecordedRequest {
                method: request.method.to_string(),
                path: request.url.path().to_string(),
                range: header_value(request, "range"),
                if_range: header_value(request, "if-range"),
            })
            .collect()
    }

    pub async fn request_count(&self) -> usize {
        self.requests().await.len()
    }
}

/// Responder computing a range-aware response per request.
struct RangeResponder {
    options: FixtureOptions,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let options = &self.options;
        let mut template = if let Some(status) = options.force_status {
            ResponseTemplate::new(status)
        } else {
            let total = options.body.len() as u64;
            let range = header_value(request, "range").filter(|_| options.accept_ranges);
            let validator_current = match header_value(request, "if-range") {
                Some(validator) => Some(&validator) == options.etag.as_ref(),
                None => true,
            };
            match range.filter(|_| validator_current) {
                Some(range) => match parse_range(&range, total) {
                    Some((from, to)) => ResponseTemplate::new(206)
                        .set_body_bytes(options.body[from as usize..=to as usize].to_vec())
                        .insert_header("content-range", format!("bytes {from}-{to}/{total}")),
                    None if range_start(&range).is_some_and(|start| start >= total) => {
                        // well-formed but exhausted range
                        ResponseTemplate::new(416)
                            .insert_header("content-range", format!("bytes */{total}"))
                    }
                    None => ResponseTemplate::new(200).set_body_bytes(options.body.clone()),
                },
                // no range, stale validator, or ranges disabled: full body
                None => ResponseTemplate::new(200).set_body_bytes(options.body.clone()),
            }
        };
        if options.accept_ranges {
            template = template.insert_header("accept-ranges", "bytes");
        }
        if let Some(etag) = &options.etag {
            template = template.insert_header("etag", etag.clone());
        }
        if let Some(disposition) = &options.content_disposition {
            template = template.insert_header("content-disposition", disposition.clone());
        }
        if let Some(delay) = options.response_delay {
            template = template.set_delay(delay);
        }
        template
    }
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// `bytes=N-...` -> N
fn range_start(value: &str) -> Option<u64> {
    value
        .trim()
        .strip_prefix("bytes=")?
        .split('-')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// `bytes=N-` or `bytes=N-M` -> inclusive (from, to)
fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let mut parts = spec.split('-');
    let from: u64 = parts.next()?.trim().parse().ok()?;
    let to = match parts.next()?.trim() {
        "" => total.checked_sub(1)?,
        end => end.parse().ok()?,
    };
    if from > to || to >= total {
        return None;
    }
    Some((from, to))
}
