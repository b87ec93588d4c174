//! Shared HTTP session with retry/backoff.
//!
//! One blocking `reqwest` client serves every plugin and stream engine in a
//! session. Mutating a network option (proxy, SSL verify, bound interface,
//! address family) rebuilds the client; headers, cookies and query params are
//! injected per request so they can be tweaked without a rebuild.

use std::{collections::HashMap, net::IpAddr, time::Duration};

use parking_lot::RwLock;
use reqwest::{
    Method, StatusCode,
    blocking::{Client, Response},
    header::{HeaderMap, HeaderName, HeaderValue},
};
use tracing::{debug, warn};

use crate::common::{PipeError, PipeResult};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Base delay for the exponential retry backoff, in seconds.
const BACKOFF_BASE: f64 = 0.3;

/// Ceiling for a single retry delay, in seconds.
const BACKOFF_MAX: f64 = 10.0;

/// Which error kind a failed request is promoted to after retries.
#[derive(Debug, Clone, Copy, Default)]
pub enum ErrorKind {
    #[default]
    Plugin,
    Stream,
}

impl ErrorKind {
    fn build(self, msg: String) -> PipeError {
        match self {
            ErrorKind::Plugin => PipeError::Plugin(msg),
            ErrorKind::Stream => PipeError::Stream(msg),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Status codes accepted in addition to 2xx.
    pub acceptable_status: Vec<u16>,
    /// Retries after the first attempt.
    pub retries: u32,
    /// Per-request timeout override.
    pub timeout: Option<Duration>,
    /// Extra headers for this request only.
    pub headers: Vec<(String, String)>,
    /// Extra query params for this request only.
    pub params: Vec<(String, String)>,
    /// Range header shortcut.
    pub range: Option<String>,
    /// Request body (POST).
    pub body: Option<Vec<u8>>,
    pub error_kind: ErrorKind,
}

struct NetConfig {
    proxy: Option<String>,
    ssl_verify: bool,
    local_address: Option<IpAddr>,
    timeout: Duration,
}

pub struct HttpSession {
    client: RwLock<Client>,
    config: RwLock<NetConfig>,
    headers: RwLock<HeaderMap>,
    cookies: RwLock<HashMap<String, String>>,
    params: RwLock<Vec<(String, String)>>,
}

impl HttpSession {
    pub fn new() -> PipeResult<Self> {
        let config = NetConfig {
            proxy: None,
            ssl_verify: true,
            local_address: None,
            timeout: DEFAULT_TIMEOUT,
        };
        let client = Self::build_client(&config)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(DEFAULT_USER_AGENT),
        );
        Ok(Self {
            client: RwLock::new(client),
            config: RwLock::new(config),
            headers: RwLock::new(headers),
            cookies: RwLock::new(HashMap::new()),
            params: RwLock::new(Vec::new()),
        })
    }

    fn build_client(config: &NetConfig) -> PipeResult<Client> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.ssl_verify);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy)
                    .map_err(|e| PipeError::plugin(format!("Invalid proxy: {e}")))?,
            );
        }
        if let Some(addr) = config.local_address {
            builder = builder.local_address(addr);
        }
        builder
            .build()
            .map_err(|e| PipeError::plugin(format!("Failed to build HTTP client: {e}")))
    }

    fn rebuild(&self) -> PipeResult<()> {
        let client = Self::build_client(&self.config.read())?;
        *self.client.write() = client;
        Ok(())
    }

    pub fn set_proxy(&self, proxy: Option<String>) -> PipeResult<()> {
        self.config.write().proxy = proxy;
        self.rebuild()
    }

    pub fn set_ssl_verify(&self, verify: bool) -> PipeResult<()> {
        self.config.write().ssl_verify = verify;
        self.rebuild()
    }

    /// Bind outgoing connections to a local address. Passing the IPv4 or
    /// IPv6 unspecified address constrains the address family.
    pub fn set_local_address(&self, addr: Option<IpAddr>) -> PipeResult<()> {
        self.config.write().local_address = addr;
        self.rebuild()
    }

    pub fn set_timeout(&self, timeout: Duration) -> PipeResult<()> {
        self.config.write().timeout = timeout;
        self.rebuild()
    }

    pub fn timeout(&self) -> Duration {
        self.config.read().timeout
    }

    pub fn set_header(&self, name: &str, value: &str) -> PipeResult<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| PipeError::plugin(format!("Invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| PipeError::plugin(format!("Invalid header value: {e}")))?;
        self.headers.write().insert(name, value);
        Ok(())
    }

    pub fn set_cookie(&self, name: &str, value: &str) {
        self.cookies.write().insert(name.into(), value.into());
    }

    pub fn set_param(&self, name: &str, value: &str) {
        self.params.write().push((name.into(), value.into()));
    }

    /// GET with default options.
    pub fn get(&self, url: &str) -> PipeResult<Response> {
        self.request(Method::GET, url, &RequestOptions::default())
    }

    pub fn head(&self, url: &str) -> PipeResult<Response> {
        self.request(Method::HEAD, url, &RequestOptions::default())
    }

    /// Issue a request, retrying transient failures with exponential backoff
    /// capped at [`BACKOFF_MAX`].
    pub fn request(&self, method: Method, url: &str, opts: &RequestOptions) -> PipeResult<Response> {
        let mut attempt = 0u32;
        loop {
            match self.request_once(method.clone(), url, opts) {
                Ok(res) => return Ok(res),
                Err(err) => {
                    attempt += 1;
                    if attempt > opts.retries {
                        return Err(opts.error_kind.build(format!("Unable to open URL: {url} ({err})")));
                    }
                    let delay = (BACKOFF_BASE * 2f64.powi(attempt as i32 - 1)).min(BACKOFF_MAX);
                    warn!("Failed to open {url} (attempt {attempt}): {err}; retrying in {delay:.1}s");
                    std::thread::sleep(Duration::from_secs_f64(delay));
                }
            }
        }
    }

    fn request_once(&self, method: Method, url: &str, opts: &RequestOptions) -> Result<Response, String> {
        let client = self.client.read().clone();
        let mut req = client
            .request(method, url)
            .headers(self.headers.read().clone());
        if let Some(timeout) = opts.timeout {
            req = req.timeout(timeout);
        }
        for (name, value) in &opts.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(range) = &opts.range {
            req = req.header(reqwest::header::RANGE, range.as_str());
        }
        let cookies = self.cookies.read();
        if !cookies.is_empty() {
            let header = cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            req = req.header(reqwest::header::COOKIE, header);
        }
        drop(cookies);
        let session_params = self.params.read().clone();
        if !session_params.is_empty() {
            req = req.query(&session_params);
        }
        if !opts.params.is_empty() {
            req = req.query(&opts.params);
        }
        if let Some(body) = &opts.body {
            req = req.body(body.clone());
        }

        let res = req.send().map_err(|e| e.to_string())?;
        let status = res.status();
        if status.is_success() || opts.acceptable_status.contains(&status.as_u16()) {
            Ok(res)
        } else {
            Err(format!("HTTP status {status}"))
        }
    }

    /// Decode a response body as JSON, sniffing the encoding from the first
    /// four bytes (RFC 4627 null-byte pattern) when the response declares no
    /// charset.
    pub fn json(&self, res: Response) -> PipeResult<serde_json::Value> {
        let declared = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split("charset=").nth(1))
            .map(|c| c.trim().to_ascii_lowercase());
        let body = res
            .bytes()
            .map_err(|e| PipeError::plugin(format!("Failed to read response body: {e}")))?;
        let text = match declared.as_deref() {
            Some("utf-8") | Some("utf8") => String::from_utf8_lossy(&body).into_owned(),
            Some(other) => {
                debug!("Unhandled declared charset {other:?}, sniffing instead");
                decode_sniffed(&body)
            }
            None => decode_sniffed(&body),
        };
        serde_json::from_str(&text).map_err(|e| PipeError::plugin(format!("Invalid JSON: {e}")))
    }
}

/// RFC 4627 §3: the first two characters of a JSON text are always ASCII, so
/// the null-byte layout of the first four bytes identifies the encoding.
fn decode_sniffed(body: &[u8]) -> String {
    if body.len() >= 4 {
        let b = [body[0] == 0, body[1] == 0, body[2] == 0, body[3] == 0];
        match b {
            [true, true, true, false] => return decode_utf32(body, true),
            [false, true, true, true] => return decode_utf32(body, false),
            [true, false, true, false] => return decode_utf16(body, true),
            [false, true, false, true] => return decode_utf16(body, false),
            _ => {}
        }
    }
    String::from_utf8_lossy(body).into_owned()
}

fn decode_utf16(body: &[u8], big_endian: bool) -> String {
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|c| {
            if big_endian {
                u16::from_be_bytes([c[0], c[1]])
            } else {
                u16::from_le_bytes([c[0], c[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}

fn decode_utf32(body: &[u8], big_endian: bool) -> String {
    body.chunks_exact(4)
        .filter_map(|c| {
            let v = if big_endian {
                u32::from_be_bytes([c[0], c[1], c[2], c[3]])
            } else {
                u32::from_le_bytes([c[0], c[1], c[2], c[3]])
            };
            char::from_u32(v)
        })
        .collect()
}

/// Split a `k=v;k=v` string into pairs. Used for the cookie, header and
/// query-param CLI options.
pub fn parse_keyvalue_list(input: &str) -> Vec<(String, String)> {
    input
        .split(';')
        .filter_map(|item| {
            let item = item.trim();
            if item.is_empty() {
                return None;
            }
            let mut parts = item.splitn(2, '=');
            let key = parts.next()?.trim();
            let value = parts.next().unwrap_or("").trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

/// True when a status code means the server does not support HEAD.
pub fn head_unsupported(status: StatusCode) -> bool {
    status == StatusCode::NOT_IMPLEMENTED
}
