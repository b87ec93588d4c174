//! Progressive HTTP stream.

use std::{io, io::Read, sync::Arc};

use reqwest::Method;
use tracing::{debug, warn};

use crate::{
    common::PipeResult,
    session::http::{ErrorKind, HttpSession, RequestOptions},
    stream::{Stream, StreamHandle},
};

pub struct HttpStream {
    http: Arc<HttpSession>,
    url: String,
    headers: Vec<(String, String)>,
}

impl HttpStream {
    pub fn new(http: Arc<HttpSession>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }
}

impl Stream for HttpStream {
    fn stream_type(&self) -> &'static str {
        "http"
    }

    fn url(&self) -> Option<String> {
        Some(self.url.clone())
    }

    fn open(&self) -> PipeResult<Box<dyn StreamHandle>> {
        let mut handle = HttpStreamHandle {
            http: self.http.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            response: None,
            offset: 0,
            closed: false,
        };
        handle.connect()?;
        Ok(Box::new(handle))
    }
}

struct HttpStreamHandle {
    http: Arc<HttpSession>,
    url: String,
    headers: Vec<(String, String)>,
    response: Option<reqwest::blocking::Response>,
    offset: u64,
    closed: bool,
}

impl HttpStreamHandle {
    fn connect(&mut self) -> PipeResult<()> {
        let mut opts = RequestOptions {
            headers: self.headers.clone(),
            retries: 1,
            error_kind: ErrorKind::Stream,
            // Accept 206 for the ranged resume path.
            acceptable_status: vec![206],
            ..Default::default()
        };
        if self.offset > 0 {
            debug!("Resuming {} at byte {}", self.url, self.offset);
            opts.range = Some(format!("bytes={}-", self.offset));
        }
        let res = self.http.request(Method::GET, &self.url, &opts)?;
        self.response = Some(res);
        Ok(())
    }
}

impl Read for HttpStreamHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        let Some(res) = self.response.as_mut() else {
            return Ok(0);
        };
        match res.read(buf) {
            Ok(n) => {
                self.offset += n as u64;
                Ok(n)
            }
            Err(err) => {
                // One transparent resume from the current offset; a second
                // failure surfaces to the caller.
                warn!("HTTP stream interrupted at byte {}: {err}", self.offset);
                self.response = None;
                self.connect().map_err(io::Error::other)?;
                let Some(res) = self.response.as_mut() else {
                    return Ok(0);
                };
                let n = res.read(buf)?;
                self.offset += n as u64;
                Ok(n)
            }
        }
    }
}

impl StreamHandle for HttpStreamHandle {
    fn close(&mut self) {
        self.closed = true;
        self.response = None;
    }
}
