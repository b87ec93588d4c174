//! M3U8 playlist parser.
//!
//! Line-oriented, one handler per tag. Carries the running parser state the
//! HLS spec requires: the current `#EXTINF`, the byterange offset carried
//! over when `#EXT-X-BYTERANGE` omits one, the latest `#EXT-X-KEY` and
//! `#EXT-X-MAP` (both stick to following segments), a pending discontinuity
//! flag and a running program-date-time clock.

use std::collections::HashMap;

use time::{Duration as TimeDuration, OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::warn;
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub struct ByteRange {
    pub length: u64,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMethod {
    None,
    Aes128,
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    pub method: KeyMethod,
    pub uri: Option<String>,
    pub iv: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Map {
    pub uri: String,
    pub byterange: Option<ByteRange>,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub uri: String,
    /// Monotonic sequence number: media-sequence + index within playlist.
    pub num: u64,
    pub duration: f64,
    pub title: Option<String>,
    pub discontinuity: bool,
    pub byterange: Option<ByteRange>,
    pub key: Option<Key>,
    pub map: Option<Map>,
    pub date: Option<OffsetDateTime>,
    /// LL-HLS / Twitch prefetch segment.
    pub prefetch: bool,
    /// Falls inside a known ad daterange.
    pub ad: bool,
}

#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub bandwidth: u64,
    pub resolution: Option<(u32, u32)>,
    pub codecs: Vec<String>,
    pub audio_group: Option<String>,
    pub video_group: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Media {
    pub media_type: String,
    pub group_id: String,
    pub name: String,
    pub language: Option<String>,
    pub default: bool,
    pub autoselect: bool,
    pub uri: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlaylistEntry {
    pub uri: String,
    pub stream_info: StreamInfo,
    pub iframes_only: bool,
}

#[derive(Debug, Clone)]
pub struct DateRange {
    pub id: Option<String>,
    pub class: Option<String>,
    pub start_date: Option<OffsetDateTime>,
    pub duration: Option<f64>,
    pub planned_duration: Option<f64>,
    pub attributes: HashMap<String, String>,
}

impl DateRange {
    /// Heuristic used to pause ad content: Twitch stitched-ad ranges and any
    /// range carrying an `X-TV-TWITCH-AD-*` client attribute.
    pub fn is_ad(&self) -> bool {
        self.class.as_deref() == Some("twitch-stitched-ad")
            || self
                .id
                .as_deref()
                .is_some_and(|id| id.starts_with("stitched-ad-"))
            || self
                .attributes
                .keys()
                .any(|k| k.starts_with("X-TV-TWITCH-AD"))
    }

    fn contains(&self, date: &OffsetDateTime) -> bool {
        let Some(start) = self.start_date else {
            return false;
        };
        let duration = self.duration.or(self.planned_duration);
        match duration {
            Some(d) => *date >= start && *date < start + TimeDuration::seconds_f64(d),
            None => *date >= start,
        }
    }
}

#[derive(Debug, Default)]
pub struct Playlist {
    pub targetduration: Option<f64>,
    pub media_sequence: u64,
    pub is_endlist: bool,
    pub iframes_only: bool,
    pub is_master: bool,
    pub segments: Vec<Segment>,
    pub playlists: Vec<PlaylistEntry>,
    pub media: Vec<Media>,
    pub dateranges: Vec<DateRange>,
}

impl Playlist {
    pub fn last_segment_number(&self) -> Option<u64> {
        self.segments.last().map(|s| s.num)
    }

    /// Serialize a media playlist back to M3U8 text. Master playlists are
    /// never rewritten; only the media form is needed (segment handoff,
    /// tests).
    pub fn serialize(&self) -> String {
        let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
        if let Some(td) = self.targetduration {
            out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", td.ceil() as u64));
        }
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", self.media_sequence));
        let mut last_key: Option<&Key> = None;
        let mut last_map: Option<&Map> = None;
        for seg in &self.segments {
            if seg.discontinuity {
                out.push_str("#EXT-X-DISCONTINUITY\n");
            }
            if seg.key.as_ref() != last_key {
                if let Some(key) = &seg.key {
                    out.push_str("#EXT-X-KEY:METHOD=");
                    match &key.method {
                        KeyMethod::None => out.push_str("NONE"),
                        KeyMethod::Aes128 => out.push_str("AES-128"),
                        KeyMethod::Other(m) => out.push_str(m),
                    }
                    if let Some(uri) = &key.uri {
                        out.push_str(&format!(",URI=\"{uri}\""));
                    }
                    if let Some(iv) = &key.iv {
                        out.push_str(&format!(",IV=0x{}", hex::encode(iv)));
                    }
                    out.push('\n');
                }
                last_key = seg.key.as_ref();
            }
            if seg.map.as_ref() != last_map {
                if let Some(map) = &seg.map {
                    out.push_str(&format!("#EXT-X-MAP:URI=\"{}\"", map.uri));
                    if let Some(br) = &map.byterange {
                        match br.offset {
                            Some(o) => out.push_str(&format!(",BYTERANGE=\"{}@{}\"", br.length, o)),
                            None => out.push_str(&format!(",BYTERANGE=\"{}\"", br.length)),
                        }
                    }
                    out.push('\n');
                }
                last_map = seg.map.as_ref();
            }
            if let Some(br) = &seg.byterange {
                match br.offset {
                    Some(o) => out.push_str(&format!("#EXT-X-BYTERANGE:{}@{}\n", br.length, o)),
                    None => out.push_str(&format!("#EXT-X-BYTERANGE:{}\n", br.length)),
                }
            }
            out.push_str(&format!(
                "#EXTINF:{:.3},{}\n{}\n",
                seg.duration,
                seg.title.as_deref().unwrap_or(""),
                seg.uri
            ));
        }
        if self.is_endlist {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        out
    }
}

/// Running state while scanning a media playlist.
#[derive(Default)]
struct ParserState {
    extinf: Option<(f64, Option<String>)>,
    byterange: Option<ByteRange>,
    /// End offset of the previous byterange, for offset carry-over.
    byterange_offset: u64,
    /// URI of the segment that byterange offset belongs to.
    byterange_uri: Option<String>,
    key: Option<Key>,
    map: Option<Map>,
    discontinuity: bool,
    date: Option<OffsetDateTime>,
}

pub fn parse(text: &str, base_url: &str) -> Playlist {
    let mut playlist = Playlist::default();
    let mut state = ParserState::default();
    let mut pending_stream_info: Option<(StreamInfo, bool)> = None;
    let lines: Vec<&str> = text.lines().map(str::trim).collect();

    playlist.is_master = lines.iter().any(|l| l.starts_with("#EXT-X-STREAM-INF"));

    for line in &lines {
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('#') {
            let (tag, attrs) = match rest.split_once(':') {
                Some((tag, attrs)) => (tag, attrs),
                None => (rest, ""),
            };
            // Dispatch table: one arm per tag.
            match tag {
                "EXTM3U" | "EXT-X-VERSION" => {}
                "EXT-X-TARGETDURATION" => {
                    playlist.targetduration = attrs.parse().ok();
                }
                "EXT-X-MEDIA-SEQUENCE" => {
                    playlist.media_sequence = attrs.parse().unwrap_or(0);
                }
                "EXT-X-ENDLIST" => playlist.is_endlist = true,
                "EXT-X-I-FRAMES-ONLY" => playlist.iframes_only = true,
                "EXT-X-PLAYLIST-TYPE" => {}
                "EXTINF" => {
                    let mut parts = attrs.splitn(2, ',');
                    let duration = parts
                        .next()
                        .and_then(|d| d.trim().parse().ok())
                        .unwrap_or(0.0);
                    let title = parts
                        .next()
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string);
                    state.extinf = Some((duration, title));
                }
                "EXT-X-BYTERANGE" => {
                    state.byterange = Some(parse_byterange(attrs));
                }
                "EXT-X-DISCONTINUITY" => state.discontinuity = true,
                "EXT-X-KEY" => {
                    state.key = Some(parse_key(attrs, base_url));
                }
                "EXT-X-MAP" => {
                    let attrs = parse_attributes(attrs);
                    if let Some(uri) = attrs.get("URI") {
                        state.map = Some(Map {
                            uri: resolve(base_url, uri),
                            byterange: attrs.get("BYTERANGE").map(|br| parse_byterange(br)),
                        });
                    }
                }
                "EXT-X-PROGRAM-DATE-TIME" => {
                    state.date = parse_datetime(attrs);
                }
                "EXT-X-DATERANGE" => {
                    playlist.dateranges.push(parse_daterange(attrs));
                }
                "EXT-X-TWITCH-PREFETCH" => {
                    // Clone the preceding segment's metadata; only the URI and
                    // the prefetch flag differ.
                    if let Some(prev) = playlist.segments.last().cloned() {
                        let uri = resolve(base_url, attrs.trim());
                        playlist.segments.push(Segment {
                            uri,
                            num: prev.num + 1,
                            prefetch: true,
                            discontinuity: false,
                            byterange: None,
                            date: None,
                            ..prev
                        });
                    }
                }
                "EXT-X-STREAM-INF" => {
                    pending_stream_info = Some((parse_stream_info(attrs), false));
                }
                "EXT-X-I-FRAME-STREAM-INF" => {
                    let attrs_map = parse_attributes(attrs);
                    if let Some(uri) = attrs_map.get("URI") {
                        playlist.playlists.push(PlaylistEntry {
                            uri: resolve(base_url, uri),
                            stream_info: parse_stream_info(attrs),
                            iframes_only: true,
                        });
                    }
                }
                "EXT-X-MEDIA" => {
                    let attrs = parse_attributes(attrs);
                    playlist.media.push(Media {
                        media_type: attrs.get("TYPE").cloned().unwrap_or_default(),
                        group_id: attrs.get("GROUP-ID").cloned().unwrap_or_default(),
                        name: attrs.get("NAME").cloned().unwrap_or_default(),
                        language: attrs.get("LANGUAGE").cloned(),
                        default: attrs.get("DEFAULT").map(String::as_str) == Some("YES"),
                        autoselect: attrs.get("AUTOSELECT").map(String::as_str) == Some("YES"),
                        uri: attrs.get("URI").map(|u| resolve(base_url, u)),
                    });
                }
                _ => {}
            }
            continue;
        }

        // A non-comment line is a URI: a variant reference in a master
        // playlist, a segment otherwise.
        if playlist.is_master {
            if let Some((stream_info, iframes_only)) = pending_stream_info.take() {
                playlist.playlists.push(PlaylistEntry {
                    uri: resolve(base_url, line),
                    stream_info,
                    iframes_only,
                });
            }
            continue;
        }

        let (duration, title) = state.extinf.take().unwrap_or((0.0, None));
        let uri = resolve(base_url, line);
        let byterange = state.byterange.take().map(|mut br| {
            // An omitted offset continues right after the previous range of
            // the same resource. A different resource starts over at zero.
            if br.offset.is_none() {
                if state.byterange_uri.as_deref() != Some(uri.as_str()) {
                    state.byterange_offset = 0;
                }
                br.offset = Some(state.byterange_offset);
            }
            state.byterange_offset = br.offset.unwrap_or(0) + br.length;
            state.byterange_uri = Some(uri.clone());
            br
        });
        let num = playlist.media_sequence + playlist.segments.len() as u64;
        let date = state.date;
        let ad = date
            .as_ref()
            .map(|d| playlist.dateranges.iter().any(|r| r.is_ad() && r.contains(d)))
            .unwrap_or(false);
        playlist.segments.push(Segment {
            uri,
            num,
            duration,
            title,
            discontinuity: std::mem::take(&mut state.discontinuity),
            byterange,
            key: state.key.clone(),
            map: state.map.clone(),
            date,
            prefetch: false,
            ad,
        });
        // Advance the running wall clock by this segment's duration; an
        // explicit EXT-X-PROGRAM-DATE-TIME on the next segment overrides it.
        state.date = state.date.map(|d| d + TimeDuration::seconds_f64(duration));
    }

    playlist
}

fn resolve(base: &str, maybe_relative: &str) -> String {
    match Url::parse(base).and_then(|b| b.join(maybe_relative)) {
        Ok(url) => url.to_string(),
        Err(_) => maybe_relative.to_string(),
    }
}

/// `<length>[@<offset>]`
fn parse_byterange(attr: &str) -> ByteRange {
    let attr = attr.trim().trim_matches('"');
    let mut parts = attr.split('@');
    let length = parts
        .next()
        .and_then(|p| p.trim().parse().ok())
        .unwrap_or(0);
    let offset = parts.next().and_then(|p| p.trim().parse().ok());
    ByteRange { length, offset }
}

fn parse_key(attrs: &str, base_url: &str) -> Key {
    let attrs = parse_attributes(attrs);
    let method = match attrs.get("METHOD").map(String::as_str) {
        Some("NONE") | None => KeyMethod::None,
        Some("AES-128") => KeyMethod::Aes128,
        Some(other) => KeyMethod::Other(other.to_string()),
    };
    let iv = attrs.get("IV").and_then(|iv| {
        let hex_str = iv.trim_start_matches("0x").trim_start_matches("0X");
        hex::decode(hex_str).ok()
    });
    Key {
        method,
        uri: attrs.get("URI").map(|u| resolve(base_url, u)),
        iv,
    }
}

fn parse_stream_info(attrs: &str) -> StreamInfo {
    let attrs = parse_attributes(attrs);
    StreamInfo {
        bandwidth: attrs
            .get("BANDWIDTH")
            .and_then(|b| b.parse().ok())
            .unwrap_or(0),
        resolution: attrs.get("RESOLUTION").and_then(|r| {
            let mut parts = r.split(['x', 'X']);
            let w = parts.next()?.parse().ok()?;
            let h = parts.next()?.parse().ok()?;
            Some((w, h))
        }),
        codecs: attrs
            .get("CODECS")
            .map(|c| c.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default(),
        audio_group: attrs.get("AUDIO").cloned(),
        video_group: attrs.get("VIDEO").cloned(),
    }
}

fn parse_daterange(attrs: &str) -> DateRange {
    let attrs = parse_attributes(attrs);
    DateRange {
        id: attrs.get("ID").cloned(),
        class: attrs.get("CLASS").cloned(),
        start_date: attrs.get("START-DATE").and_then(|d| parse_datetime(d)),
        duration: attrs.get("DURATION").and_then(|d| d.parse().ok()),
        planned_duration: attrs.get("PLANNED-DURATION").and_then(|d| d.parse().ok()),
        attributes: attrs
            .iter()
            .filter(|(k, _)| k.starts_with("X-"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

fn parse_datetime(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim().trim_matches('"');
    OffsetDateTime::parse(value, &Rfc3339)
        .inspect_err(|e| warn!("Unparsable program date time {value:?}: {e}"))
        .ok()
}

/// Split an attribute list (`A=1,B="x,y",C=2`) respecting quoted values.
fn parse_attributes(input: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped.find('"').unwrap_or(stripped.len());
            value = stripped[..end].to_string();
            rest = stripped.get(end + 1..).unwrap_or("");
            rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest.get(end + 1..).unwrap_or("").trim_start();
        }
        out.insert(key, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://example.com/live/playlist.m3u8";

    #[test]
    fn media_playlist_segments_and_sequence() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:42\n\
                    #EXTINF:9.5,first\nseg1.ts\n#EXTINF:10.0,\nseg2.ts\n#EXT-X-ENDLIST\n";
        let pl = parse(text, BASE);
        assert!(!pl.is_master);
        assert!(pl.is_endlist);
        assert_eq!(pl.targetduration, Some(10.0));
        assert_eq!(pl.segments.len(), 2);
        assert_eq!(pl.segments[0].num, 42);
        assert_eq!(pl.segments[1].num, 43);
        assert_eq!(pl.segments[0].uri, "https://example.com/live/seg1.ts");
        assert_eq!(pl.segments[0].title.as_deref(), Some("first"));
        assert_eq!(pl.last_segment_number(), Some(43));
    }

    #[test]
    fn key_sticks_to_following_segments() {
        let text = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x0000000000000000000000000000002A\n\
                    #EXTINF:4,\na.ts\n#EXTINF:4,\nb.ts\n";
        let pl = parse(text, BASE);
        for seg in &pl.segments {
            let key = seg.key.as_ref().unwrap();
            assert_eq!(key.method, KeyMethod::Aes128);
            assert_eq!(key.uri.as_deref(), Some("https://example.com/live/key.bin"));
            assert_eq!(key.iv.as_ref().unwrap()[15], 0x2A);
        }
    }

    #[test]
    fn byterange_offset_carry_over() {
        let text = "#EXTM3U\n#EXT-X-BYTERANGE:100@0\n#EXTINF:4,\nres.ts\n\
                    #EXT-X-BYTERANGE:200\n#EXTINF:4,\nres.ts\n";
        let pl = parse(text, BASE);
        assert_eq!(
            pl.segments[0].byterange,
            Some(ByteRange { length: 100, offset: Some(0) })
        );
        assert_eq!(
            pl.segments[1].byterange,
            Some(ByteRange { length: 200, offset: Some(100) })
        );
    }

    #[test]
    fn byterange_offset_resets_on_new_resource() {
        let text = "#EXTM3U\n#EXT-X-BYTERANGE:100@50\n#EXTINF:4,\na.ts\n\
                    #EXT-X-BYTERANGE:200\n#EXTINF:4,\nb.ts\n\
                    #EXT-X-BYTERANGE:300\n#EXTINF:4,\nb.ts\n";
        let pl = parse(text, BASE);
        // b.ts is a different resource than a.ts, so its offset-less range
        // starts at zero instead of continuing a.ts's 150.
        assert_eq!(
            pl.segments[1].byterange,
            Some(ByteRange { length: 200, offset: Some(0) })
        );
        assert_eq!(
            pl.segments[2].byterange,
            Some(ByteRange { length: 300, offset: Some(200) })
        );
    }

    #[test]
    fn discontinuity_is_one_shot() {
        let text = "#EXTM3U\n#EXTINF:4,\na.ts\n#EXT-X-DISCONTINUITY\n#EXTINF:4,\nb.ts\n#EXTINF:4,\nc.ts\n";
        let pl = parse(text, BASE);
        assert!(!pl.segments[0].discontinuity);
        assert!(pl.segments[1].discontinuity);
        assert!(!pl.segments[2].discontinuity);
    }

    #[test]
    fn map_sticks_and_resolves() {
        let text = "#EXTM3U\n#EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"600@0\"\n\
                    #EXTINF:4,\na.m4s\n#EXTINF:4,\nb.m4s\n";
        let pl = parse(text, BASE);
        let map = pl.segments[1].map.as_ref().unwrap();
        assert_eq!(map.uri, "https://example.com/live/init.mp4");
        assert_eq!(map.byterange, Some(ByteRange { length: 600, offset: Some(0) }));
    }

    #[test]
    fn twitch_prefetch_clones_previous() {
        let text = "#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:10\n#EXTINF:2,\na.ts\n\
                    #EXT-X-TWITCH-PREFETCH:https://cdn/prefetch.ts\n";
        let pl = parse(text, BASE);
        assert_eq!(pl.segments.len(), 2);
        let pf = &pl.segments[1];
        assert!(pf.prefetch);
        assert_eq!(pf.num, 11);
        assert_eq!(pf.uri, "https://cdn/prefetch.ts");
        assert_eq!(pf.duration, 2.0);
    }

    #[test]
    fn program_date_time_advances_by_duration() {
        let text = "#EXTM3U\n#EXT-X-PROGRAM-DATE-TIME:2024-01-01T00:00:00Z\n\
                    #EXTINF:10,\na.ts\n#EXTINF:10,\nb.ts\n";
        let pl = parse(text, BASE);
        let d0 = pl.segments[0].date.unwrap();
        let d1 = pl.segments[1].date.unwrap();
        assert_eq!((d1 - d0).whole_seconds(), 10);
    }

    #[test]
    fn ad_daterange_marks_segments() {
        let text = "#EXTM3U\n\
                    #EXT-X-DATERANGE:ID=\"stitched-ad-1\",START-DATE=\"2024-01-01T00:00:00Z\",DURATION=20\n\
                    #EXT-X-PROGRAM-DATE-TIME:2024-01-01T00:00:00Z\n\
                    #EXTINF:10,\nad1.ts\n#EXTINF:10,\nad2.ts\n#EXTINF:10,\ncontent.ts\n";
        let pl = parse(text, BASE);
        assert!(pl.segments[0].ad);
        assert!(pl.segments[1].ad);
        assert!(!pl.segments[2].ad);
    }

    #[test]
    fn master_playlist_variants_and_media() {
        let text = "#EXTM3U\n\
                    #EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"English\",LANGUAGE=\"en\",DEFAULT=YES,AUTOSELECT=YES,URI=\"audio/en.m3u8\"\n\
                    #EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1280x720,CODECS=\"avc1.4d401f,mp4a.40.2\",AUDIO=\"aud\"\n\
                    720p.m3u8\n";
        let pl = parse(text, BASE);
        assert!(pl.is_master);
        assert_eq!(pl.playlists.len(), 1);
        let entry = &pl.playlists[0];
        assert_eq!(entry.stream_info.bandwidth, 1_280_000);
        assert_eq!(entry.stream_info.resolution, Some((1280, 720)));
        assert_eq!(entry.stream_info.audio_group.as_deref(), Some("aud"));
        assert_eq!(pl.media.len(), 1);
        assert!(pl.media[0].default);
        assert_eq!(pl.media[0].language.as_deref(), Some("en"));
    }

    #[test]
    fn roundtrip_preserves_segment_identity() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:5\n\
                    #EXT-X-KEY:METHOD=AES-128,URI=\"https://example.com/k.bin\"\n\
                    #EXT-X-MAP:URI=\"https://example.com/init.mp4\"\n\
                    #EXT-X-BYTERANGE:100@50\n#EXTINF:9.000,\nhttps://example.com/a.ts\n\
                    #EXTINF:8.000,\nhttps://example.com/b.ts\n#EXT-X-ENDLIST\n";
        let first = parse(text, BASE);
        let second = parse(&first.serialize(), BASE);
        assert_eq!(first.segments.len(), second.segments.len());
        for (a, b) in first.segments.iter().zip(&second.segments) {
            assert_eq!(a.num, b.num);
            assert_eq!(a.uri, b.uri);
            assert_eq!(a.duration, b.duration);
            assert_eq!(a.key, b.key);
            assert_eq!(a.map, b.map);
            assert_eq!(a.byterange, b.byterange);
        }
    }
}
