//! Session: options, the shared HTTP client and the plugin registry.

pub mod http;
pub mod options;

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

use lru::LruCache;
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use crate::{
    common::{PipeError, PipeResult},
    plugin::{Matcher, NO_PRIORITY, Plugin},
    session::http::{HttpSession, RequestOptions, head_unsupported, parse_keyvalue_list},
    session::options::Options,
    stream::Stream,
};

/// URL resolution results kept per session.
const RESOLVE_CACHE_SIZE: usize = 128;

struct RegisteredPlugin {
    plugin: Box<dyn Plugin>,
    matchers: Vec<Matcher>,
}

pub struct Session {
    pub options: Arc<Options>,
    pub http: Arc<HttpSession>,
    plugins: Vec<RegisteredPlugin>,
    resolve_cache: Mutex<LruCache<String, usize>>,
}

impl Session {
    /// An empty session; use [`crate::plugins::register_builtin`] or
    /// [`Session::register`] to add plugins.
    pub fn new() -> PipeResult<Self> {
        Ok(Self {
            options: Arc::new(Options::new()),
            http: Arc::new(HttpSession::new()?),
            plugins: Vec::new(),
            resolve_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(RESOLVE_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
        })
    }

    pub fn register(&mut self, plugin: Box<dyn Plugin>) -> PipeResult<()> {
        let matchers = plugin
            .spec()
            .matchers
            .iter()
            .map(Matcher::compile)
            .collect::<PipeResult<Vec<_>>>()?;
        debug!("Registered plugin {}", plugin.name());
        self.plugins.push(RegisteredPlugin { plugin, matchers });
        self.resolve_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.plugin.name()).collect()
    }

    /// Set an option, applying HTTP side effects for the `http-*` keys.
    pub fn set_option(&self, key: &str, value: Value) -> PipeResult<()> {
        let normalized = key.to_lowercase().replace('_', "-");
        match normalized.as_str() {
            "http-proxy" => {
                self.http
                    .set_proxy(value.as_str().map(str::to_string))?;
            }
            "http-ssl-verify" => {
                self.http.set_ssl_verify(value.as_bool().unwrap_or(true))?;
            }
            "http-timeout" => {
                if let Some(secs) = value.as_f64() {
                    self.http
                        .set_timeout(std::time::Duration::from_secs_f64(secs))?;
                }
            }
            "http-local-address" => {
                let addr = match value.as_str() {
                    Some(s) => Some(s.parse().map_err(|e| {
                        PipeError::plugin(format!("Invalid local address {s:?}: {e}"))
                    })?),
                    None => None,
                };
                self.http.set_local_address(addr)?;
            }
            "http-headers" => {
                if let Some(list) = value.as_str() {
                    for (name, val) in parse_keyvalue_list(list) {
                        self.http.set_header(&name, &val)?;
                    }
                }
            }
            "http-cookies" => {
                if let Some(list) = value.as_str() {
                    for (name, val) in parse_keyvalue_list(list) {
                        self.http.set_cookie(&name, &val);
                    }
                }
            }
            "http-query-params" => {
                if let Some(list) = value.as_str() {
                    for (name, val) in parse_keyvalue_list(list) {
                        self.http.set_param(&name, &val);
                    }
                }
            }
            _ => {}
        }
        self.options.set(&normalized, value);
        Ok(())
    }

    /// Find the plugin responsible for a URL. Bare URLs get an `https://`
    /// prefix; when nothing matches and `follow_redirect` is set, the URL is
    /// resolved via HEAD (GET if the server rejects HEAD) and matched once
    /// more against its redirect target.
    pub fn resolve_url(&self, url: &str, follow_redirect: bool) -> PipeResult<(&dyn Plugin, String)> {
        let url = normalize_url(url);
        if let Some(index) = self.cached_match(&url) {
            return Ok((self.plugins[index].plugin.as_ref(), url));
        }

        if let Some(index) = self.best_match(&url) {
            self.resolve_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .put(url.clone(), index);
            return Ok((self.plugins[index].plugin.as_ref(), url));
        }

        if follow_redirect {
            if let Some(target) = self.redirect_target(&url) {
                if target != url {
                    debug!("Resolving {url} via redirect target {target}");
                    return self.resolve_url(&target, false);
                }
            }
        }
        Err(PipeError::NoPlugin(url))
    }

    fn cached_match(&self, url: &str) -> Option<usize> {
        self.resolve_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .copied()
    }

    /// Highest matcher priority wins; ties go to the earliest registration.
    fn best_match(&self, url: &str) -> Option<usize> {
        let mut best: Option<(u8, usize)> = None;
        for (index, registered) in self.plugins.iter().enumerate() {
            for matcher in &registered.matchers {
                if matcher.priority == NO_PRIORITY || !matcher.regex.is_match(url) {
                    continue;
                }
                let better = match best {
                    Some((priority, _)) => matcher.priority > priority,
                    None => true,
                };
                if better {
                    best = Some((matcher.priority, index));
                }
            }
        }
        best.map(|(_, index)| index)
    }

    /// The final URL after following redirects, probed with HEAD first.
    fn redirect_target(&self, url: &str) -> Option<String> {
        let opts = RequestOptions {
            acceptable_status: vec![501],
            ..Default::default()
        };
        let res = self.http.request(Method::HEAD, url, &opts).ok()?;
        if head_unsupported(res.status()) {
            let res = self.http.get(url).ok()?;
            return Some(res.url().to_string());
        }
        Some(res.url().to_string())
    }

    /// Resolve a URL and ask its plugin for streams.
    pub fn streams(&self, url: &str) -> PipeResult<Vec<(String, Box<dyn Stream>)>> {
        let (plugin, url) = self.resolve_url(url, true)?;
        debug!("Found matching plugin {} for URL {url}", plugin.name());
        let streams = plugin.streams(self, &url)?;
        if streams.is_empty() {
            return Err(PipeError::NoStreams(url));
        }
        Ok(streams)
    }
}

/// Prefix scheme-less URLs so `example.com/live` resolves.
fn normalize_url(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{MatcherSpec, PluginSpec};
    use crate::stream::StreamHandle;

    struct FakePlugin {
        spec: &'static PluginSpec,
    }

    impl Plugin for FakePlugin {
        fn spec(&self) -> &'static PluginSpec {
            self.spec
        }

        fn streams(
            &self,
            _session: &Session,
            _url: &str,
        ) -> PipeResult<Vec<(String, Box<dyn Stream>)>> {
            Ok(vec![("best".into(), Box::new(NullStream))])
        }
    }

    struct NullStream;

    impl Stream for NullStream {
        fn stream_type(&self) -> &'static str {
            "null"
        }

        fn url(&self) -> Option<String> {
            None
        }

        fn open(&self) -> PipeResult<Box<dyn StreamHandle>> {
            Err(PipeError::stream("not a real stream"))
        }
    }

    static LOW_SPEC: PluginSpec = PluginSpec {
        name: "low",
        matchers: &[MatcherSpec {
            pattern: r"https?://shared\.example\.com/.+",
            priority: crate::plugin::LOW_PRIORITY,
            name: None,
        }],
        arguments: &[],
    };

    static HIGH_SPEC: PluginSpec = PluginSpec {
        name: "high",
        matchers: &[MatcherSpec {
            pattern: r"https?://shared\.example\.com/.+",
            priority: crate::plugin::HIGH_PRIORITY,
            name: None,
        }],
        arguments: &[],
    };

    static NO_SPEC: PluginSpec = PluginSpec {
        name: "never",
        matchers: &[MatcherSpec {
            pattern: r".+",
            priority: crate::plugin::NO_PRIORITY,
            name: None,
        }],
        arguments: &[],
    };

    fn session_with(specs: &[&'static PluginSpec]) -> Session {
        let mut session = Session::new().unwrap();
        for spec in specs {
            session.register(Box::new(FakePlugin { spec })).unwrap();
        }
        session
    }

    #[test]
    fn scheme_prefixing() {
        assert_eq!(normalize_url("example.com/live"), "https://example.com/live");
        assert_eq!(normalize_url("http://example.com"), "http://example.com");
    }

    #[test]
    fn higher_priority_wins_regardless_of_order() {
        let session = session_with(&[&LOW_SPEC, &HIGH_SPEC]);
        let (plugin, _) = session
            .resolve_url("https://shared.example.com/live", false)
            .unwrap();
        assert_eq!(plugin.name(), "high");
    }

    #[test]
    fn ties_go_to_first_registration() {
        static LOW2_SPEC: PluginSpec = PluginSpec {
            name: "low2",
            matchers: &[MatcherSpec {
                pattern: r"https?://shared\.example\.com/.+",
                priority: crate::plugin::LOW_PRIORITY,
                name: None,
            }],
            arguments: &[],
        };
        let session = session_with(&[&LOW_SPEC, &LOW2_SPEC]);
        let (plugin, _) = session
            .resolve_url("https://shared.example.com/live", false)
            .unwrap();
        assert_eq!(plugin.name(), "low");
    }

    #[test]
    fn no_priority_matchers_never_resolve() {
        let session = session_with(&[&NO_SPEC]);
        assert!(matches!(
            session.resolve_url("https://anything.example.com/x", false),
            Err(PipeError::NoPlugin(_))
        ));
    }

    #[test]
    fn unmatched_url_is_an_error() {
        let session = session_with(&[&LOW_SPEC]);
        assert!(matches!(
            session.resolve_url("https://other.example.com/x", false),
            Err(PipeError::NoPlugin(_))
        ));
    }

    #[test]
    fn options_and_side_effects() {
        let session = session_with(&[]);
        session
            .set_option("HTTP_SSL_VERIFY", serde_json::json!(false))
            .unwrap();
        assert!(!session.options.get_bool("http-ssl-verify"));
        session
            .set_option("http-timeout", serde_json::json!(5.0))
            .unwrap();
        assert_eq!(session.http.timeout(), std::time::Duration::from_secs(5));
    }
}
