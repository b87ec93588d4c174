//! Variant naming, quality weighting and selection.
//!
//! Master playlist entries become named streams (`720p`, `1604k`, rendition
//! names) with `_alt` suffixes for duplicates. Weights order the names so
//! `best`/`worst` and exclusion filters work across naming schemes.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, warn};

use crate::{
    common::{PipeError, PipeResult},
    hls::{HlsStream, m3u8::{Media, Playlist, PlaylistEntry}},
    session::{http::HttpSession, options::Options},
    stream::{Stream, ffmpeg::{FfmpegMuxer, MuxedStream}},
};

/// Synthetic names resolved against the weighted ordering.
pub const SYNONYMS_BEST: &[&str] = &["best", "best-unfiltered"];
pub const SYNONYMS_WORST: &[&str] = &["worst", "worst-unfiltered"];

fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_+]+$").unwrap())
}

fn weight_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)(k|p)(\d+)?(\+)?$").unwrap())
}

/// Weight of a stream name for quality ordering. Returns the weight and the
/// group it was derived from (`pixels`, `bitrate` or `none`).
pub fn stream_weight(name: &str) -> (f64, &'static str) {
    if let Some(caps) = weight_pattern().captures(name) {
        let value: f64 = caps[1].parse().unwrap_or(0.0);
        let bonus = if caps.get(4).is_some() { 1.0 } else { 0.0 };
        return match &caps[2] {
            "k" => (value / 2.8 + bonus, "bitrate"),
            _ => {
                let framerate = caps
                    .get(3)
                    .and_then(|m| m.as_str().parse::<f64>().ok())
                    .unwrap_or(0.0);
                (value + framerate / 10.0 + bonus, "pixels")
            }
        };
    }
    match name {
        "live" | "hd" => (1080.0, "pixels"),
        "ehq" => (720.0, "pixels"),
        "hq" | "sd" => (576.0, "pixels"),
        "sq" => (360.0, "pixels"),
        "iphonehigh" => (230.0, "pixels"),
        "iphonelow" => (170.0, "pixels"),
        _ => (0.0, "none"),
    }
}

/// Parse one exclusion token (`>720p`, `>=480p`, `<1080p`, `<=540p`, or a
/// plain name for exact exclusion) into a predicate over stream names.
fn parse_filter(token: &str) -> Box<dyn Fn(&str) -> bool> {
    let (op, operand): (fn(f64, f64) -> bool, &str) = if let Some(rest) = token.strip_prefix(">=") {
        (|w, v| w >= v, rest)
    } else if let Some(rest) = token.strip_prefix("<=") {
        (|w, v| w <= v, rest)
    } else if let Some(rest) = token.strip_prefix('>') {
        (|w, v| w > v, rest)
    } else if let Some(rest) = token.strip_prefix('<') {
        (|w, v| w < v, rest)
    } else {
        let name = token.to_string();
        return Box::new(move |candidate| candidate == name);
    };
    let (value, _) = stream_weight(operand.trim());
    Box::new(move |candidate| {
        let (weight, group) = stream_weight(candidate);
        group != "none" && op(weight, value)
    })
}

/// Order names by weight, unweighted names first in registration order.
pub fn sorted_names(names: &[String]) -> Vec<String> {
    let mut sorted: Vec<String> = names.to_vec();
    sorted.sort_by(|a, b| {
        let (wa, _) = stream_weight(a);
        let (wb, _) = stream_weight(b);
        wa.partial_cmp(&wb).unwrap_or(std::cmp::Ordering::Equal)
    });
    sorted
}

/// Resolve a requested quality against available stream names.
///
/// `requested` is a comma-separated priority list; `best` and `worst` pick
/// from the weighted names that survive the exclusion filters. The
/// `-unfiltered` synonyms ignore the filters.
pub fn select_name(names: &[String], requested: &str, excludes: &[String]) -> Option<String> {
    let filters: Vec<_> = excludes.iter().map(|t| parse_filter(t)).collect();
    let excluded = |name: &str| filters.iter().any(|f| f(name));

    for token in requested.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let unfiltered = token.ends_with("-unfiltered");
        let pick_best = SYNONYMS_BEST.contains(&token);
        let pick_worst = SYNONYMS_WORST.contains(&token);
        if pick_best || pick_worst {
            let mut weighted: Vec<&String> = names
                .iter()
                .filter(|n| stream_weight(n).1 != "none")
                .filter(|n| unfiltered || !excluded(n))
                .collect();
            if weighted.is_empty() {
                // No weighted names at all: fall back to the full list.
                weighted = names.iter().filter(|n| unfiltered || !excluded(n)).collect();
            }
            weighted.sort_by(|a, b| {
                let (wa, _) = stream_weight(a);
                let (wb, _) = stream_weight(b);
                wa.partial_cmp(&wb).unwrap_or(std::cmp::Ordering::Equal)
            });
            let chosen = if pick_best {
                weighted.last()
            } else {
                weighted.first()
            };
            if let Some(name) = chosen {
                return Some((*name).clone());
            }
            continue;
        }
        if let Some(name) = names.iter().find(|n| n.as_str() == token) {
            return Some(name.clone());
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Master playlist resolution

/// Turn a master playlist into named streams, muxing in external audio
/// renditions where the playlist carries them separately.
pub fn streams_from_master(
    http: Arc<HttpSession>,
    options: Arc<Options>,
    playlist: &Playlist,
) -> PipeResult<Vec<(String, Box<dyn Stream>)>> {
    let mut out: Vec<(String, Box<dyn Stream>)> = Vec::new();
    let mut taken: Vec<String> = Vec::new();

    for entry in &playlist.playlists {
        if entry.iframes_only {
            continue;
        }
        let Some(name) = variant_name(entry, &playlist.media, &taken) else {
            debug!("Skipping unnamed variant {}", entry.uri);
            continue;
        };
        taken.push(name.clone());

        let audio = select_audio_renditions(entry, &playlist.media, &options);
        let external_audio: Vec<&Media> =
            audio.iter().filter(|m| m.uri.is_some()).copied().collect();

        let stream: Box<dyn Stream> = if !external_audio.is_empty()
            && FfmpegMuxer::is_available(&options)
        {
            let mut substreams: Vec<Box<dyn Stream>> = vec![Box::new(HlsStream::new(
                http.clone(),
                options.clone(),
                entry.uri.clone(),
            ))];
            for media in &external_audio {
                if let Some(uri) = &media.uri {
                    substreams.push(Box::new(HlsStream::new(
                        http.clone(),
                        options.clone(),
                        uri.clone(),
                    )));
                }
            }
            Box::new(MuxedStream::new(options.clone(), substreams))
        } else {
            if !external_audio.is_empty() {
                warn!(
                    "Stream {name} carries a separate audio track but FFmpeg is unavailable; \
                     the output may be missing audio"
                );
            }
            Box::new(HlsStream::new(http.clone(), options.clone(), entry.uri.clone()))
        };
        out.push((name, stream));
    }

    Ok(out)
}

/// Naming fallback chain: video rendition name, then `<height>p`, then
/// `<kbps>k`. Names outside the allowed charset fall through to the next
/// rule; duplicates get `_alt`/`_alt2` and further copies are dropped.
fn variant_name(entry: &PlaylistEntry, media: &[Media], taken: &[String]) -> Option<String> {
    let rendition_name = entry.stream_info.video_group.as_ref().and_then(|group| {
        media
            .iter()
            .find(|m| m.media_type == "VIDEO" && &m.group_id == group)
            .map(|m| m.name.clone())
    });

    let mut candidates: Vec<String> = Vec::new();
    if let Some(name) = rendition_name {
        candidates.push(name);
    }
    if let Some((_, height)) = entry.stream_info.resolution {
        candidates.push(format!("{height}p"));
    }
    if entry.stream_info.bandwidth > 0 {
        candidates.push(format!("{}k", entry.stream_info.bandwidth / 1000));
    }

    let base = candidates.into_iter().find(|c| name_pattern().is_match(c))?;
    if !taken.iter().any(|t| t == &base) {
        return Some(base);
    }
    let alt = format!("{base}_alt");
    if !taken.iter().any(|t| t == &alt) {
        return Some(alt);
    }
    let alt2 = format!("{base}_alt2");
    if !taken.iter().any(|t| t == &alt2) {
        return Some(alt2);
    }
    None
}

/// Audio renditions for a variant, in priority order: explicit user
/// selection (`hls-audio-select` languages, names or `*`), then the
/// autoselect rendition matching the configured locale, then the default
/// rendition, then the first.
fn select_audio_renditions<'a>(
    entry: &PlaylistEntry,
    media: &'a [Media],
    options: &Options,
) -> Vec<&'a Media> {
    let Some(group) = &entry.stream_info.audio_group else {
        return Vec::new();
    };
    let renditions: Vec<&Media> = media
        .iter()
        .filter(|m| m.media_type == "AUDIO" && &m.group_id == group)
        .collect();
    if renditions.is_empty() {
        return Vec::new();
    }

    let selection = options.get_str_list("hls-audio-select");
    if !selection.is_empty() {
        if selection.iter().any(|s| s == "*") {
            return renditions;
        }
        let wanted: Vec<String> = selection.iter().map(|s| s.to_lowercase()).collect();
        let matched: Vec<&Media> = renditions
            .iter()
            .filter(|m| {
                wanted.iter().any(|w| {
                    m.language.as_deref().map(str::to_lowercase).as_deref() == Some(w)
                        || m.name.to_lowercase() == *w
                })
            })
            .copied()
            .collect();
        if !matched.is_empty() {
            return matched;
        }
    }

    let locale_lang = options
        .get_str("locale")
        .and_then(|l| l.split(['_', '-']).next().map(str::to_lowercase));
    if let Some(lang) = locale_lang {
        if let Some(m) = renditions.iter().find(|m| {
            m.autoselect && m.language.as_deref().map(str::to_lowercase).as_deref() == Some(&lang)
        }) {
            return vec![m];
        }
    }
    if let Some(m) = renditions.iter().find(|m| m.default) {
        return vec![m];
    }
    vec![renditions[0]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::m3u8;

    #[test]
    fn weights() {
        assert_eq!(stream_weight("720p"), (720.0, "pixels"));
        assert_eq!(stream_weight("720p+"), (721.0, "pixels"));
        assert_eq!(stream_weight("720p60"), (726.0, "pixels"));
        let (w, g) = stream_weight("2800k");
        assert!((w - 1000.0).abs() < 0.01);
        assert_eq!(g, "bitrate");
        assert_eq!(stream_weight("hd"), (1080.0, "pixels"));
        assert_eq!(stream_weight("mobile_high"), (0.0, "none"));
    }

    #[test]
    fn best_and_worst() {
        let names: Vec<String> = ["audio", "360p", "720p", "1080p"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(select_name(&names, "best", &[]).as_deref(), Some("1080p"));
        assert_eq!(select_name(&names, "worst", &[]).as_deref(), Some("360p"));
        assert_eq!(select_name(&names, "720p", &[]).as_deref(), Some("720p"));
        assert_eq!(
            select_name(&names, "1440p,best", &[]).as_deref(),
            Some("1080p")
        );
        assert_eq!(select_name(&names, "1440p", &[]), None);
    }

    #[test]
    fn exclusion_filters() {
        let names: Vec<String> = ["360p", "720p", "1080p"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let excludes = vec![">720p".to_string()];
        assert_eq!(
            select_name(&names, "best", &excludes).as_deref(),
            Some("720p")
        );
        let excludes = vec![">=720p".to_string()];
        assert_eq!(
            select_name(&names, "best", &excludes).as_deref(),
            Some("360p")
        );
        // Exact-name exclusion.
        let excludes = vec!["1080p".to_string()];
        assert_eq!(
            select_name(&names, "best", &excludes).as_deref(),
            Some("720p")
        );
        // Unfiltered synonym ignores the excludes.
        assert_eq!(
            select_name(&names, "best-unfiltered", &excludes).as_deref(),
            Some("1080p")
        );
    }

    fn master(text: &str) -> Playlist {
        m3u8::parse(text, "https://example.com/master.m3u8")
    }

    #[test]
    fn variant_naming_fallbacks() {
        let playlist = master(
            "#EXTM3U\n\
             #EXT-X-STREAM-INF:BANDWIDTH=1604000,RESOLUTION=1280x720\nchunk720.m3u8\n\
             #EXT-X-STREAM-INF:BANDWIDTH=2604000,RESOLUTION=1280x720\nchunk720b.m3u8\n\
             #EXT-X-STREAM-INF:BANDWIDTH=800000\nchunkaudio.m3u8\n",
        );
        let taken0: Vec<String> = vec![];
        let n0 = variant_name(&playlist.playlists[0], &playlist.media, &taken0).unwrap();
        assert_eq!(n0, "720p");
        let taken1 = vec![n0];
        let n1 = variant_name(&playlist.playlists[1], &playlist.media, &taken1).unwrap();
        assert_eq!(n1, "720p_alt");
        // No resolution: bandwidth naming.
        let n2 = variant_name(&playlist.playlists[2], &playlist.media, &taken1).unwrap();
        assert_eq!(n2, "800k");
    }

    #[test]
    fn alt_dedupe_caps_at_two() {
        let playlist = master(
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1,RESOLUTION=1280x720\na.m3u8\n",
        );
        let taken: Vec<String> = ["720p", "720p_alt", "720p_alt2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(variant_name(&playlist.playlists[0], &playlist.media, &taken).is_none());
    }

    #[test]
    fn audio_selection_priority() {
        let playlist = master(
            "#EXTM3U\n\
             #EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"English\",LANGUAGE=\"en\",AUTOSELECT=YES,URI=\"en.m3u8\"\n\
             #EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"French\",LANGUAGE=\"fr\",DEFAULT=YES,URI=\"fr.m3u8\"\n\
             #EXT-X-STREAM-INF:BANDWIDTH=1604000,RESOLUTION=1280x720,AUDIO=\"aud\"\nchunk.m3u8\n",
        );
        let entry = &playlist.playlists[0];

        // Default rendition wins without user input or locale.
        let options = Options::new();
        let picked = select_audio_renditions(entry, &playlist.media, &options);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "French");

        // Explicit language selection.
        options.set("hls-audio-select", serde_json::json!(["en"]));
        let picked = select_audio_renditions(entry, &playlist.media, &options);
        assert_eq!(picked[0].name, "English");

        // Wildcard selects every rendition.
        options.set("hls-audio-select", serde_json::json!(["*"]));
        assert_eq!(select_audio_renditions(entry, &playlist.media, &options).len(), 2);

        // Locale-driven autoselect.
        let options = Options::new();
        options.set("locale", serde_json::json!("en_US"));
        let picked = select_audio_renditions(entry, &playlist.media, &options);
        assert_eq!(picked[0].name, "English");
    }
}
