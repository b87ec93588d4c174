//! Direct-URL plugin: plays raw HLS/DASH/progressive URLs without any
//! service-specific extraction. Explicit `hls://`, `dash://` and
//! `httpstream://` prefixes force a protocol; bare `.m3u8`/`.mpd` URLs are
//! sniffed by extension at low priority so service plugins win their own
//! domains.

use std::sync::Arc;

use reqwest::Method;

use crate::{
    common::{PipeError, PipeResult},
    hls::{self, HlsStream},
    plugin::{LOW_PRIORITY, MatcherSpec, NORMAL_PRIORITY, Plugin, PluginSpec},
    session::{Session, http::RequestOptions},
    stream::{Stream, http::HttpStream, quality},
};

pub const SPEC: PluginSpec = PluginSpec {
    name: "direct",
    matchers: &[
        MatcherSpec {
            pattern: r"^(?:hls|dash|httpstream)://\S+$",
            priority: NORMAL_PRIORITY,
            name: Some("explicit"),
        },
        MatcherSpec {
            pattern: r"^\S+\.m3u8(?:\?\S*)?$",
            priority: LOW_PRIORITY,
            name: Some("hls"),
        },
        MatcherSpec {
            pattern: r"^\S+\.mpd(?:\?\S*)?$",
            priority: LOW_PRIORITY,
            name: Some("dash"),
        },
    ],
    arguments: &[],
};

enum Protocol {
    Hls,
    Dash,
    HttpStream,
}

/// Split an input URL into its protocol and the media URL. The inner part of
/// a prefixed URL may omit its scheme (`hls://example.com/pl.m3u8`).
fn classify(url: &str) -> Option<(Protocol, String)> {
    for (prefix, protocol) in [
        ("hls://", Protocol::Hls),
        ("dash://", Protocol::Dash),
        ("httpstream://", Protocol::HttpStream),
    ] {
        if let Some(inner) = url.strip_prefix(prefix) {
            let inner = if inner.contains("://") {
                inner.to_string()
            } else {
                format!("https://{inner}")
            };
            return Some((protocol, inner));
        }
    }
    let path_end = url.find('?').unwrap_or(url.len());
    let path = &url[..path_end];
    if path.ends_with(".m3u8") {
        return Some((Protocol::Hls, url.to_string()));
    }
    if path.ends_with(".mpd") {
        return Some((Protocol::Dash, url.to_string()));
    }
    None
}

pub struct DirectPlugin;

impl Plugin for DirectPlugin {
    fn spec(&self) -> &'static PluginSpec {
        &SPEC
    }

    fn streams(
        &self,
        session: &Session,
        url: &str,
    ) -> PipeResult<Vec<(String, Box<dyn Stream>)>> {
        let (protocol, media_url) = classify(url)
            .ok_or_else(|| PipeError::plugin(format!("Unsupported URL: {url}")))?;
        let http = session.http.clone();
        let options = session.options.clone();

        match protocol {
            Protocol::Hls => hls_streams(http, options, &media_url),
            Protocol::Dash => crate::dash::streams(http, options, &media_url),
            Protocol::HttpStream => Ok(vec![(
                "live".to_string(),
                Box::new(HttpStream::new(http, &media_url)) as Box<dyn Stream>,
            )]),
        }
    }
}

/// A media playlist yields one stream; a master playlist yields its named
/// variants.
fn hls_streams(
    http: Arc<crate::session::http::HttpSession>,
    options: Arc<crate::session::options::Options>,
    url: &str,
) -> PipeResult<Vec<(String, Box<dyn Stream>)>> {
    let opts = RequestOptions::default();
    let res = http.request(Method::GET, url, &opts)?;
    let final_url = res.url().to_string();
    let text = res
        .text()
        .map_err(|e| PipeError::plugin(format!("Failed to read playlist: {e}")))?;
    let playlist = hls::m3u8::parse(&text, &final_url);

    if playlist.is_master {
        quality::streams_from_master(http, options, &playlist)
    } else {
        Ok(vec![(
            "live".to_string(),
            Box::new(HlsStream::new(http, options, final_url)) as Box<dyn Stream>,
        )])
    }
}
