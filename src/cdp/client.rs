//! High-level CDP client: target sessions, navigation, script evaluation
//! and request interception on top of [`CdpConnection`].

use std::{sync::Arc, time::Duration};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use regex::Regex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    cdp::connection::CdpConnection,
    common::{PipeError, PipeResult},
};

/// Upper bound on waiting for `Page.loadEventFired` after a navigation.
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CdpClient {
    connection: Arc<CdpConnection>,
}

impl CdpClient {
    /// Connect to a browser's DevTools WebSocket endpoint.
    pub async fn connect(ws_url: &str, cmd_timeout: Duration) -> PipeResult<Self> {
        let connection = CdpConnection::create(ws_url, cmd_timeout).await?;
        Ok(Self { connection })
    }

    /// Open a fresh blank target and attach to it with a flat session.
    pub async fn new_target_session(&self) -> PipeResult<CdpClientSession> {
        let created = self
            .connection
            .send(
                "Target.createTarget",
                Some(json!({"url": "about:blank"})),
                None,
            )
            .await?;
        let target_id = created["targetId"]
            .as_str()
            .ok_or_else(|| PipeError::Cdp("Target.createTarget returned no targetId".into()))?
            .to_string();
        let attached = self
            .connection
            .send(
                "Target.attachToTarget",
                Some(json!({"targetId": target_id, "flatten": true})),
                None,
            )
            .await?;
        let session_id = attached["sessionId"]
            .as_str()
            .ok_or_else(|| PipeError::Cdp("Target.attachToTarget returned no sessionId".into()))?
            .to_string();
        debug!("Attached to target {target_id} as session {session_id}");
        Ok(CdpClientSession {
            connection: self.connection.clone(),
            session_id,
            handlers: Vec::new(),
            fail_unhandled: false,
        })
    }

    pub fn close(&self) {
        self.connection.close();
    }
}

/// What a request handler decided to do with a paused request.
pub enum RequestAction {
    /// Let the request proceed unmodified.
    Continue,
    /// Abort the request with a network error reason, e.g. `BlockedByClient`.
    Fail { reason: &'static str },
    /// Answer the request without hitting the network.
    Fulfill {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    /// Continue with a rewritten URL and/or headers.
    Alter {
        url: Option<String>,
        headers: Option<Vec<(String, String)>>,
    },
}

/// Which pause point of the Fetch domain a handler hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Request,
    Response,
}

impl RequestStage {
    fn as_str(self) -> &'static str {
        match self {
            RequestStage::Request => "Request",
            RequestStage::Response => "Response",
        }
    }
}

/// A request intercepted via the Fetch domain. `response_status` and `body`
/// are populated only when paused at the response stage.
pub struct PausedRequest {
    pub request_id: String,
    pub url: String,
    pub response_status: Option<u16>,
    pub body: Option<Vec<u8>>,
}

type RequestCallback = Box<dyn Fn(&PausedRequest) -> RequestAction + Send + Sync>;

struct RequestHandler {
    url_pattern: String,
    regex: Regex,
    stage: RequestStage,
    on_request: RequestCallback,
}

pub struct CdpClientSession {
    connection: Arc<CdpConnection>,
    session_id: String,
    handlers: Vec<RequestHandler>,
    fail_unhandled: bool,
}

impl CdpClientSession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send(&self, method: &str, params: Option<Value>) -> PipeResult<Value> {
        self.connection
            .send(method, params, Some(&self.session_id))
            .await
    }

    /// Navigate the target and wait for the page load event. The Page
    /// domain is disabled again before returning, and a target detaching
    /// mid-load aborts the wait.
    pub async fn navigate(&self, url: &str) -> PipeResult<()> {
        // Subscribe before navigating so a fast load cannot slip past.
        // Detach notifications arrive on the browser session, not ours.
        let mut loaded = self
            .connection
            .subscribe(Some(&self.session_id), "Page.loadEventFired");
        let mut detached = self.connection.subscribe(None, "Target.detachedFromTarget");
        self.send("Page.enable", None).await?;
        let outcome = self.wait_for_load(url, &mut loaded, &mut detached).await;
        let _ = self.send("Page.disable", None).await;
        outcome
    }

    async fn wait_for_load(
        &self,
        url: &str,
        loaded: &mut mpsc::Receiver<Value>,
        detached: &mut mpsc::Receiver<Value>,
    ) -> PipeResult<()> {
        let result = self.send("Page.navigate", Some(json!({"url": url}))).await?;
        if let Some(error) = result["errorText"].as_str() {
            return Err(PipeError::Cdp(format!("Navigation failed: {error}")));
        }
        let wait = async {
            loop {
                tokio::select! {
                    event = loaded.recv() => {
                        return match event {
                            Some(_) => Ok(()),
                            None => {
                                Err(PipeError::Cdp("Connection closed while loading page".into()))
                            }
                        };
                    }
                    event = detached.recv() => match event {
                        Some(params) if is_session_detach(&params, &self.session_id) => {
                            return Err(PipeError::Cdp("Target has been detached".into()));
                        }
                        Some(_) => {}
                        None => {
                            return Err(PipeError::Cdp(
                                "Connection closed while loading page".into(),
                            ));
                        }
                    },
                }
            }
        };
        match tokio::time::timeout(NAVIGATION_TIMEOUT, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PipeError::Cdp(format!("Timed out loading {url}"))),
        }
    }

    /// Evaluate a JavaScript expression and return its value.
    ///
    /// Promises are awaited, so `async` expressions resolve to their final
    /// value. Thrown exceptions surface as errors.
    pub async fn evaluate(&self, expression: &str) -> PipeResult<Value> {
        let result = self
            .send(
                "Runtime.evaluate",
                Some(json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                })),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("unknown exception");
            return Err(PipeError::Cdp(format!("Evaluation failed: {text}")));
        }
        Ok(result["result"]["value"].clone())
    }

    /// Fail requests no handler claims instead of letting them through.
    pub fn set_fail_unhandled(&mut self, fail: bool) {
        self.fail_unhandled = fail;
    }

    /// Register a request-stage handler for URLs matching the glob-style
    /// pattern.
    ///
    /// `*` matches one or more characters and `?` matches a single one;
    /// escape either with a backslash to match it literally. Handlers run in
    /// registration order and the first match decides the request's fate.
    pub fn add_request_handler<F>(&mut self, url_pattern: &str, on_request: F) -> PipeResult<()>
    where
        F: Fn(&PausedRequest) -> RequestAction + Send + Sync + 'static,
    {
        self.add_handler(url_pattern, RequestStage::Request, on_request)
    }

    /// Register a handler paused after response headers arrive. The paused
    /// request carries the response body, so the handler can rewrite it via
    /// [`RequestAction::Fulfill`].
    pub fn add_response_handler<F>(&mut self, url_pattern: &str, on_response: F) -> PipeResult<()>
    where
        F: Fn(&PausedRequest) -> RequestAction + Send + Sync + 'static,
    {
        self.add_handler(url_pattern, RequestStage::Response, on_response)
    }

    fn add_handler<F>(&mut self, url_pattern: &str, stage: RequestStage, callback: F) -> PipeResult<()>
    where
        F: Fn(&PausedRequest) -> RequestAction + Send + Sync + 'static,
    {
        let regex = Regex::new(&url_pattern_to_regex(url_pattern))
            .map_err(|e| PipeError::Cdp(format!("Invalid URL pattern {url_pattern}: {e}")))?;
        self.handlers.push(RequestHandler {
            url_pattern: url_pattern.to_string(),
            regex,
            stage,
            on_request: Box::new(callback),
        });
        Ok(())
    }

    /// Enable the Fetch domain and route paused requests through the
    /// registered handlers until the connection closes.
    pub async fn intercept_requests(&self) -> PipeResult<()> {
        let patterns = enable_patterns(&self.handlers);
        let mut paused = self
            .connection
            .subscribe(Some(&self.session_id), "Fetch.requestPaused");
        self.send("Fetch.enable", Some(json!({"patterns": patterns})))
            .await?;
        while let Some(params) = paused.recv().await {
            let Some(request_id) = params["requestId"].as_str() else {
                continue;
            };
            let response_status = params["responseStatusCode"].as_u64().map(|s| s as u16);
            let stage = if response_status.is_some() || !params["responseErrorReason"].is_null() {
                RequestStage::Response
            } else {
                RequestStage::Request
            };
            let mut request = PausedRequest {
                request_id: request_id.to_string(),
                url: params["request"]["url"].as_str().unwrap_or("").to_string(),
                response_status,
                body: None,
            };
            if stage == RequestStage::Response
                && self
                    .handlers
                    .iter()
                    .any(|h| h.stage == stage && h.regex.is_match(&request.url))
            {
                request.body = self.response_body(&request.request_id).await.ok();
            }
            let action = route_request(&self.handlers, stage, &request).unwrap_or_else(|| {
                if self.fail_unhandled {
                    RequestAction::Fail {
                        reason: "BlockedByClient",
                    }
                } else {
                    RequestAction::Continue
                }
            });
            if let Err(e) = self.apply_action(stage, &request, action).await {
                debug!("Failed to resolve paused request {}: {e}", request.request_id);
            }
        }
        Ok(())
    }

    /// The body of a response-stage paused request.
    pub async fn response_body(&self, request_id: &str) -> PipeResult<Vec<u8>> {
        let result = self
            .send("Fetch.getResponseBody", Some(json!({"requestId": request_id})))
            .await?;
        let body = result["body"].as_str().unwrap_or("");
        if result["base64Encoded"].as_bool().unwrap_or(false) {
            BASE64_STANDARD
                .decode(body)
                .map_err(|e| PipeError::Cdp(format!("Invalid response body encoding: {e}")))
        } else {
            Ok(body.as_bytes().to_vec())
        }
    }

    async fn apply_action(
        &self,
        stage: RequestStage,
        request: &PausedRequest,
        action: RequestAction,
    ) -> PipeResult<()> {
        let request_id = &request.request_id;
        match action {
            RequestAction::Continue => {
                trace!("Continuing request {}", request.url);
                let method = match stage {
                    RequestStage::Request => "Fetch.continueRequest",
                    RequestStage::Response => "Fetch.continueResponse",
                };
                self.send(method, Some(json!({"requestId": request_id})))
                    .await?;
            }
            RequestAction::Fail { reason } => {
                trace!("Failing request {} with {reason}", request.url);
                self.send(
                    "Fetch.failRequest",
                    Some(json!({"requestId": request_id, "errorReason": reason})),
                )
                .await?;
            }
            RequestAction::Fulfill {
                status,
                headers,
                body,
            } => {
                trace!("Fulfilling request {} with status {status}", request.url);
                self.send(
                    "Fetch.fulfillRequest",
                    Some(json!({
                        "requestId": request_id,
                        "responseCode": status,
                        "responseHeaders": header_entries(&headers),
                        "body": BASE64_STANDARD.encode(body),
                    })),
                )
                .await?;
            }
            RequestAction::Alter { url, headers } => {
                let mut params = json!({"requestId": request_id});
                match stage {
                    RequestStage::Request => {
                        if let Some(url) = url {
                            params["url"] = Value::String(url);
                        }
                        if let Some(headers) = headers {
                            params["headers"] = header_entries(&headers);
                        }
                        self.send("Fetch.continueRequest", Some(params)).await?;
                    }
                    RequestStage::Response => {
                        if let Some(headers) = headers {
                            params["responseHeaders"] = header_entries(&headers);
                        }
                        self.send("Fetch.continueResponse", Some(params)).await?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Whether a `Target.detachedFromTarget` event names the given session.
fn is_session_detach(params: &Value, session_id: &str) -> bool {
    params["sessionId"].as_str() == Some(session_id)
}

/// Pattern list for `Fetch.enable`: catch-all entries for both stages come
/// first so every request pauses and the unhandled-request policy applies,
/// then the handlers' own patterns in registration order.
fn enable_patterns(handlers: &[RequestHandler]) -> Vec<Value> {
    let mut patterns = vec![
        json!({"urlPattern": "*", "requestStage": "Response"}),
        json!({"urlPattern": "*", "requestStage": "Request"}),
    ];
    patterns.extend(
        handlers
            .iter()
            .map(|h| json!({"urlPattern": h.url_pattern, "requestStage": h.stage.as_str()})),
    );
    patterns
}

fn header_entries(headers: &[(String, String)]) -> Value {
    Value::Array(
        headers
            .iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect(),
    )
}

fn route_request(
    handlers: &[RequestHandler],
    stage: RequestStage,
    request: &PausedRequest,
) -> Option<RequestAction> {
    handlers
        .iter()
        .find(|h| h.stage == stage && h.regex.is_match(&request.url))
        .map(|h| (h.on_request)(request))
}

/// Translate a Fetch `urlPattern` glob into an anchored regex.
fn url_pattern_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped @ ('*' | '?')) => {
                    regex.push('\\');
                    regex.push(escaped);
                }
                Some(other) => {
                    regex.push_str(&regex::escape(&other.to_string()));
                }
                None => regex.push_str("\\\\"),
            },
            '*' => regex.push_str(".+"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, url: &str) -> bool {
        Regex::new(&url_pattern_to_regex(pattern)).unwrap().is_match(url)
    }

    #[test]
    fn test_url_pattern_globs() {
        assert!(matches("https://host/*", "https://host/path/file.m3u8"));
        assert!(!matches("https://host/*", "https://host/"));
        assert!(matches("https://host/page?", "https://host/page1"));
        assert!(!matches("https://host/page?", "https://host/page10"));
        assert!(matches("https://host/a.b", "https://host/a.b"));
        assert!(!matches("https://host/a.b", "https://host/aXb"));
    }

    #[test]
    fn test_url_pattern_escapes() {
        assert!(matches(r"https://host/q\?x=*", "https://host/q?x=1"));
        assert!(!matches(r"https://host/q\?x=*", "https://host/qAx=1"));
        assert!(matches(r"https://host/lit\*", "https://host/lit*"));
        assert!(!matches(r"https://host/lit\*", "https://host/literal"));
    }

    fn handler(
        pattern: &str,
        stage: RequestStage,
        action: fn(&PausedRequest) -> RequestAction,
    ) -> RequestHandler {
        RequestHandler {
            url_pattern: pattern.to_string(),
            regex: Regex::new(&url_pattern_to_regex(pattern)).unwrap(),
            stage,
            on_request: Box::new(action),
        }
    }

    fn paused(url: &str) -> PausedRequest {
        PausedRequest {
            request_id: "1".to_string(),
            url: url.to_string(),
            response_status: None,
            body: None,
        }
    }

    #[test]
    fn test_enable_patterns_start_with_catch_all_stages() {
        let handlers = vec![
            handler("http://foo/", RequestStage::Response, |_| {
                RequestAction::Continue
            }),
            handler("http://bar/", RequestStage::Request, |_| {
                RequestAction::Continue
            }),
        ];
        assert_eq!(
            enable_patterns(&handlers),
            vec![
                json!({"urlPattern": "*", "requestStage": "Response"}),
                json!({"urlPattern": "*", "requestStage": "Request"}),
                json!({"urlPattern": "http://foo/", "requestStage": "Response"}),
                json!({"urlPattern": "http://bar/", "requestStage": "Request"}),
            ]
        );
    }

    #[test]
    fn test_detach_event_matches_only_own_session() {
        let event = json!({"sessionId": "S1", "targetId": "T1"});
        assert!(is_session_detach(&event, "S1"));
        assert!(!is_session_detach(&event, "S2"));
        assert!(!is_session_detach(&json!({"targetId": "T1"}), "S1"));
    }

    #[test]
    fn test_routing_first_match_wins() {
        let handlers = vec![
            handler("*.m3u8", RequestStage::Request, |_| RequestAction::Fail {
                reason: "BlockedByClient",
            }),
            handler("*", RequestStage::Request, |_| RequestAction::Fulfill {
                status: 200,
                headers: Vec::new(),
                body: Vec::new(),
            }),
        ];

        assert!(matches!(
            route_request(&handlers, RequestStage::Request, &paused("https://host/index.m3u8")),
            Some(RequestAction::Fail { .. })
        ));
        assert!(matches!(
            route_request(&handlers, RequestStage::Request, &paused("https://host/page")),
            Some(RequestAction::Fulfill { .. })
        ));
    }

    #[test]
    fn test_routing_respects_stage() {
        let handlers = vec![handler("*", RequestStage::Response, |_| {
            RequestAction::Continue
        })];
        assert!(route_request(&handlers, RequestStage::Request, &paused("https://host/")).is_none());
        assert!(
            route_request(&handlers, RequestStage::Response, &paused("https://host/")).is_some()
        );
    }

    #[test]
    fn test_unmatched_requests_have_no_action() {
        let handlers = Vec::new();
        assert!(route_request(&handlers, RequestStage::Request, &paused("https://host/")).is_none());
    }
}
