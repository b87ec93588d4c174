//! DASH Media Presentation Description model.
//!
//! The raw XML is deserialized with quick-xml's serde support into `*Xml`
//! structs, then resolved into a flat tree where every Representation knows
//! its inherited segment addressing (SegmentBase, SegmentList or
//! SegmentTemplate, found by walking ancestors) and its stable
//! `(periodID, adaptationSetID, representationID)` ident.

use serde::Deserialize;
use time::{Duration as TimeDuration, OffsetDateTime, format_description::well_known::Rfc3339};
use url::Url;

use crate::common::{PipeError, PipeResult};

// ---------------------------------------------------------------------------
// Raw XML shapes

#[derive(Debug, Deserialize)]
struct MpdXml {
    #[serde(rename = "@type")]
    mpd_type: Option<String>,
    #[serde(rename = "@availabilityStartTime")]
    availability_start_time: Option<String>,
    #[serde(rename = "@publishTime")]
    publish_time: Option<String>,
    #[serde(rename = "@mediaPresentationDuration")]
    media_presentation_duration: Option<String>,
    #[serde(rename = "@minimumUpdatePeriod")]
    minimum_update_period: Option<String>,
    #[serde(rename = "@minBufferTime")]
    min_buffer_time: Option<String>,
    #[serde(rename = "@suggestedPresentationDelay")]
    suggested_presentation_delay: Option<String>,
    #[serde(rename = "BaseURL")]
    base_url: Option<String>,
    #[serde(rename = "Period", default)]
    periods: Vec<PeriodXml>,
}

#[derive(Debug, Deserialize)]
struct PeriodXml {
    #[serde(rename = "@id")]
    id: Option<String>,
    #[serde(rename = "@start")]
    start: Option<String>,
    #[serde(rename = "@duration")]
    duration: Option<String>,
    #[serde(rename = "BaseURL")]
    base_url: Option<String>,
    #[serde(rename = "AdaptationSet", default)]
    adaptation_sets: Vec<AdaptationSetXml>,
}

#[derive(Debug, Deserialize)]
struct AdaptationSetXml {
    #[serde(rename = "@id")]
    id: Option<String>,
    #[serde(rename = "@mimeType")]
    mime_type: Option<String>,
    #[serde(rename = "@contentType")]
    content_type: Option<String>,
    #[serde(rename = "@lang")]
    lang: Option<String>,
    #[serde(rename = "SegmentBase")]
    segment_base: Option<SegmentBaseXml>,
    #[serde(rename = "SegmentList")]
    segment_list: Option<SegmentListXml>,
    #[serde(rename = "SegmentTemplate")]
    segment_template: Option<SegmentTemplateXml>,
    #[serde(rename = "Representation", default)]
    representations: Vec<RepresentationXml>,
}

#[derive(Debug, Deserialize)]
struct RepresentationXml {
    #[serde(rename = "@id")]
    id: Option<String>,
    #[serde(rename = "@mimeType")]
    mime_type: Option<String>,
    #[serde(rename = "@bandwidth")]
    bandwidth: Option<u64>,
    #[serde(rename = "@width")]
    width: Option<u32>,
    #[serde(rename = "@height")]
    height: Option<u32>,
    #[serde(rename = "@codecs")]
    codecs: Option<String>,
    #[serde(rename = "@lang")]
    lang: Option<String>,
    #[serde(rename = "BaseURL")]
    base_url: Option<String>,
    #[serde(rename = "SegmentBase")]
    segment_base: Option<SegmentBaseXml>,
    #[serde(rename = "SegmentList")]
    segment_list: Option<SegmentListXml>,
    #[serde(rename = "SegmentTemplate")]
    segment_template: Option<SegmentTemplateXml>,
}

#[derive(Debug, Clone, Deserialize)]
struct SegmentBaseXml {
    #[serde(rename = "@indexRange")]
    index_range: Option<String>,
    #[serde(rename = "Initialization")]
    initialization: Option<UrlTypeXml>,
}

#[derive(Debug, Clone, Deserialize)]
struct SegmentListXml {
    #[serde(rename = "@timescale")]
    timescale: Option<u64>,
    #[serde(rename = "@duration")]
    duration: Option<u64>,
    #[serde(rename = "@startNumber")]
    start_number: Option<u64>,
    #[serde(rename = "Initialization")]
    initialization: Option<UrlTypeXml>,
    #[serde(rename = "SegmentURL", default)]
    segment_urls: Vec<SegmentUrlXml>,
}

#[derive(Debug, Clone, Deserialize)]
struct SegmentUrlXml {
    #[serde(rename = "@media")]
    media: Option<String>,
    #[serde(rename = "@mediaRange")]
    media_range: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UrlTypeXml {
    #[serde(rename = "@sourceURL")]
    source_url: Option<String>,
    #[serde(rename = "@range")]
    range: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SegmentTemplateXml {
    #[serde(rename = "@media")]
    media: Option<String>,
    #[serde(rename = "@initialization")]
    initialization: Option<String>,
    #[serde(rename = "@timescale")]
    timescale: Option<u64>,
    #[serde(rename = "@duration")]
    duration: Option<u64>,
    #[serde(rename = "@startNumber")]
    start_number: Option<u64>,
    #[serde(rename = "@presentationTimeOffset")]
    presentation_time_offset: Option<u64>,
    #[serde(rename = "@availabilityTimeOffset")]
    availability_time_offset: Option<f64>,
    #[serde(rename = "SegmentTimeline")]
    timeline: Option<SegmentTimelineXml>,
}

#[derive(Debug, Clone, Deserialize)]
struct SegmentTimelineXml {
    #[serde(rename = "S", default)]
    entries: Vec<TimelineEntryXml>,
}

#[derive(Debug, Clone, Deserialize)]
struct TimelineEntryXml {
    #[serde(rename = "@t")]
    t: Option<u64>,
    #[serde(rename = "@d")]
    d: u64,
    #[serde(rename = "@r", default)]
    r: Option<i64>,
}

// ---------------------------------------------------------------------------
// Resolved model

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepresentationIdent {
    pub period: String,
    pub adaptation_set: String,
    pub representation: String,
}

#[derive(Debug, Clone)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SegmentTemplate {
    pub media: Option<UrlTemplate>,
    pub initialization: Option<UrlTemplate>,
    pub timescale: u64,
    pub duration: Option<u64>,
    pub start_number: u64,
    pub presentation_time_offset: u64,
    pub availability_time_offset: f64,
    pub timeline: Option<Vec<TimelineEntry>>,
}

#[derive(Debug, Clone, Copy)]
pub struct TimelineEntry {
    pub t: Option<u64>,
    pub d: u64,
    pub r: i64,
}

#[derive(Debug, Clone)]
pub struct SegmentList {
    pub timescale: u64,
    pub duration: Option<u64>,
    pub start_number: u64,
    pub initialization: Option<(String, Option<ByteRange>)>,
    pub segment_urls: Vec<(String, Option<ByteRange>)>,
}

#[derive(Debug, Clone)]
pub struct SegmentBase {
    pub index_range: Option<ByteRange>,
    pub initialization: Option<(Option<String>, Option<ByteRange>)>,
}

#[derive(Debug, Clone)]
pub enum SegmentProfile {
    Base(SegmentBase),
    List(SegmentList),
    Template(SegmentTemplate),
    /// No segment addressing at any level: the BaseURL is the whole media.
    Single,
}

#[derive(Debug, Clone)]
pub struct Representation {
    pub ident: RepresentationIdent,
    pub mime_type: String,
    pub bandwidth: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub codecs: Option<String>,
    pub lang: Option<String>,
    pub base_url: Url,
    pub profile: SegmentProfile,
    /// Period start offset, in seconds from `availabilityStartTime`.
    pub period_start: f64,
    pub period_duration: Option<f64>,
}

impl Representation {
    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }

    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }
}

#[derive(Debug, Clone)]
pub struct Mpd {
    pub dynamic: bool,
    pub availability_start_time: OffsetDateTime,
    pub publish_time: Option<OffsetDateTime>,
    pub media_presentation_duration: Option<f64>,
    pub minimum_update_period: Option<f64>,
    pub min_buffer_time: f64,
    pub suggested_presentation_delay: Option<f64>,
    pub representations: Vec<Representation>,
}

impl Mpd {
    /// Fallback when `suggestedPresentationDelay` is absent on a dynamic
    /// manifest: `max(3, minBufferTime)` seconds. Starting at the raw live
    /// edge with zero buffer stalls immediately.
    pub fn presentation_delay(&self) -> f64 {
        self.suggested_presentation_delay
            .unwrap_or_else(|| self.min_buffer_time.max(3.0))
    }

    pub fn representation(&self, ident: &RepresentationIdent) -> Option<&Representation> {
        self.representations.iter().find(|r| &r.ident == ident)
    }
}

pub fn parse(text: &str, manifest_url: &str) -> PipeResult<Mpd> {
    let raw: MpdXml = quick_xml::de::from_str(text)
        .map_err(|e| PipeError::MpdParsing(format!("invalid XML: {e}")))?;

    let manifest_url = Url::parse(manifest_url)
        .map_err(|e| PipeError::MpdParsing(format!("invalid manifest URL: {e}")))?;
    let dynamic = raw.mpd_type.as_deref() == Some("dynamic");

    let publish_time = match &raw.publish_time {
        Some(s) => Some(parse_datetime(s)?),
        None => None,
    };
    // Anchor for calendar-based duration parts (months/years): publishTime,
    // or now for a dynamic manifest without one.
    let anchor = publish_time.unwrap_or_else(OffsetDateTime::now_utc);

    let availability_start_time = match &raw.availability_start_time {
        Some(s) => parse_datetime(s)?,
        None => OffsetDateTime::UNIX_EPOCH,
    };

    let media_presentation_duration = raw
        .media_presentation_duration
        .as_deref()
        .map(|d| parse_duration(d, anchor))
        .transpose()?;
    let minimum_update_period = raw
        .minimum_update_period
        .as_deref()
        .map(|d| parse_duration(d, anchor))
        .transpose()?;
    let min_buffer_time = raw
        .min_buffer_time
        .as_deref()
        .map(|d| parse_duration(d, anchor))
        .transpose()?
        .unwrap_or(0.0);
    let suggested_presentation_delay = raw
        .suggested_presentation_delay
        .as_deref()
        .map(|d| parse_duration(d, anchor))
        .transpose()?;

    let mpd_base = join_base(&manifest_url, raw.base_url.as_deref())?;

    let mut representations = Vec::new();
    let mut running_start = 0.0f64;
    for (period_idx, period) in raw.periods.iter().enumerate() {
        let period_id = period
            .id
            .clone()
            .unwrap_or_else(|| format!("p{period_idx}"));
        let period_start = match period.start.as_deref() {
            Some(s) => parse_duration(s, anchor)?,
            None => running_start,
        };
        let period_duration = period
            .duration
            .as_deref()
            .map(|d| parse_duration(d, anchor))
            .transpose()?
            .or_else(|| {
                if raw.periods.len() == 1 {
                    media_presentation_duration
                } else {
                    None
                }
            });
        if let Some(d) = period_duration {
            running_start = period_start + d;
        }
        let period_base = join_base(&mpd_base, period.base_url.as_deref())?;

        for (set_idx, set) in period.adaptation_sets.iter().enumerate() {
            let set_id = set.id.clone().unwrap_or_else(|| format!("a{set_idx}"));
            for rep in &set.representations {
                let rep_id = rep.id.clone().ok_or_else(|| {
                    PipeError::MpdParsing("Representation is missing an @id attribute".into())
                })?;
                // @mimeType is inherited from the AdaptationSet; a
                // contentType-only set still resolves.
                let mime_type = rep
                    .mime_type
                    .clone()
                    .or_else(|| set.mime_type.clone())
                    .or_else(|| {
                        set.content_type
                            .as_deref()
                            .map(|ct| format!("{ct}/unknown"))
                    })
                    .ok_or_else(|| {
                        PipeError::MpdParsing(format!(
                            "Representation {rep_id} has no mimeType on itself or its ancestors"
                        ))
                    })?;

                let base_url = join_base(&period_base, rep.base_url.as_deref())?;
                let profile = resolve_profile(rep, set, &base_url)?;

                representations.push(Representation {
                    ident: RepresentationIdent {
                        period: period_id.clone(),
                        adaptation_set: set_id.clone(),
                        representation: rep_id,
                    },
                    mime_type,
                    bandwidth: rep.bandwidth.unwrap_or(0),
                    width: rep.width,
                    height: rep.height,
                    codecs: rep.codecs.clone(),
                    lang: rep.lang.clone().or_else(|| set.lang.clone()),
                    base_url,
                    profile,
                    period_start,
                    period_duration,
                });
            }
        }
    }

    Ok(Mpd {
        dynamic,
        availability_start_time,
        publish_time,
        media_presentation_duration,
        minimum_update_period,
        min_buffer_time,
        suggested_presentation_delay,
        representations,
    })
}

/// Nearest ancestor wins: Representation-level tags shadow AdaptationSet
/// ones; template attributes merge child-over-parent.
fn resolve_profile(
    rep: &RepresentationXml,
    set: &AdaptationSetXml,
    base_url: &Url,
) -> PipeResult<SegmentProfile> {
    if rep.segment_template.is_some() || set.segment_template.is_some() {
        let merged = merge_templates(rep.segment_template.as_ref(), set.segment_template.as_ref());
        return Ok(SegmentProfile::Template(resolve_template(&merged)?));
    }
    if let Some(list) = rep.segment_list.as_ref().or(set.segment_list.as_ref()) {
        return Ok(SegmentProfile::List(resolve_list(list, base_url)));
    }
    if let Some(base) = rep.segment_base.as_ref().or(set.segment_base.as_ref()) {
        return Ok(SegmentProfile::Base(SegmentBase {
            index_range: base.index_range.as_deref().and_then(parse_range),
            initialization: base
                .initialization
                .as_ref()
                .map(|i| (i.source_url.clone(), i.range.as_deref().and_then(parse_range))),
        }));
    }
    Ok(SegmentProfile::Single)
}

fn merge_templates(
    child: Option<&SegmentTemplateXml>,
    parent: Option<&SegmentTemplateXml>,
) -> SegmentTemplateXml {
    let empty = SegmentTemplateXml {
        media: None,
        initialization: None,
        timescale: None,
        duration: None,
        start_number: None,
        presentation_time_offset: None,
        availability_time_offset: None,
        timeline: None,
    };
    let c = child.cloned().unwrap_or_else(|| empty.clone());
    let p = parent.cloned().unwrap_or(empty);
    SegmentTemplateXml {
        media: c.media.or(p.media),
        initialization: c.initialization.or(p.initialization),
        timescale: c.timescale.or(p.timescale),
        duration: c.duration.or(p.duration),
        start_number: c.start_number.or(p.start_number),
        presentation_time_offset: c.presentation_time_offset.or(p.presentation_time_offset),
        availability_time_offset: c.availability_time_offset.or(p.availability_time_offset),
        timeline: c.timeline.or(p.timeline),
    }
}

fn resolve_template(raw: &SegmentTemplateXml) -> PipeResult<SegmentTemplate> {
    Ok(SegmentTemplate {
        media: raw.media.as_deref().map(UrlTemplate::compile).transpose()?,
        initialization: raw
            .initialization
            .as_deref()
            .map(UrlTemplate::compile)
            .transpose()?,
        timescale: raw.timescale.unwrap_or(1),
        duration: raw.duration,
        start_number: raw.start_number.unwrap_or(1),
        presentation_time_offset: raw.presentation_time_offset.unwrap_or(0),
        availability_time_offset: raw.availability_time_offset.unwrap_or(0.0),
        timeline: raw.timeline.as_ref().map(|tl| {
            tl.entries
                .iter()
                .map(|e| TimelineEntry {
                    t: e.t,
                    d: e.d,
                    r: e.r.unwrap_or(0),
                })
                .collect()
        }),
    })
}

fn resolve_list(raw: &SegmentListXml, base_url: &Url) -> SegmentList {
    let resolve = |u: &str| {
        base_url
            .join(u)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| u.to_string())
    };
    SegmentList {
        timescale: raw.timescale.unwrap_or(1),
        duration: raw.duration,
        start_number: raw.start_number.unwrap_or(1),
        initialization: raw.initialization.as_ref().and_then(|i| {
            i.source_url
                .as_deref()
                .map(|u| (resolve(u), i.range.as_deref().and_then(parse_range)))
        }),
        segment_urls: raw
            .segment_urls
            .iter()
            .filter_map(|s| {
                s.media
                    .as_deref()
                    .map(|u| (resolve(u), s.media_range.as_deref().and_then(parse_range)))
            })
            .collect(),
    }
}

fn join_base(base: &Url, relative: Option<&str>) -> PipeResult<Url> {
    match relative {
        Some(rel) => base
            .join(rel.trim())
            .map_err(|e| PipeError::MpdParsing(format!("invalid BaseURL {rel:?}: {e}"))),
        None => Ok(base.clone()),
    }
}

/// `start-end` byte range attribute.
fn parse_range(range: &str) -> Option<ByteRange> {
    let mut parts = range.splitn(2, '-');
    let start = parts.next()?.parse().ok()?;
    let end = parts.next().and_then(|e| e.parse().ok());
    Some(ByteRange { start, end })
}

fn parse_datetime(value: &str) -> PipeResult<OffsetDateTime> {
    let value = value.trim();
    // Tolerate a missing timezone designator; some encoders omit the Z.
    let with_tz;
    let value = if value.ends_with('Z')
        || value.contains('+')
        || value.get(10..).is_some_and(|rest| rest.contains('-'))
    {
        value
    } else {
        with_tz = format!("{value}Z");
        &with_tz
    };
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|e| PipeError::MpdParsing(format!("invalid datetime {value:?}: {e}")))
}

/// Parse an ISO 8601 duration into seconds. Calendar parts (years, months)
/// are resolved against `anchor` since their length depends on the date.
pub fn parse_duration(value: &str, anchor: OffsetDateTime) -> PipeResult<f64> {
    let err = |msg: &str| PipeError::MpdParsing(format!("invalid duration {value:?}: {msg}"));
    let mut rest = value.trim();
    let negative = if let Some(stripped) = rest.strip_prefix('-') {
        rest = stripped;
        true
    } else {
        false
    };
    let Some(stripped) = rest.strip_prefix('P') else {
        return Err(err("missing P designator"));
    };
    rest = stripped;

    let mut in_time = false;
    let mut years = 0i64;
    let mut months = 0i64;
    let mut seconds = 0.0f64;
    let mut seen_any = false;

    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('T') {
            in_time = true;
            rest = stripped;
            continue;
        }
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| err("component without designator"))?;
        if digits_end == 0 {
            return Err(err("empty component"));
        }
        let number: f64 = rest[..digits_end]
            .parse()
            .map_err(|_| err("unparsable number"))?;
        let designator = rest.as_bytes()[digits_end] as char;
        rest = &rest[digits_end + 1..];
        seen_any = true;
        match (in_time, designator) {
            (false, 'Y') => years = number as i64,
            (false, 'M') => months = number as i64,
            (false, 'W') => seconds += number * 7.0 * 86400.0,
            (false, 'D') => seconds += number * 86400.0,
            (true, 'H') => seconds += number * 3600.0,
            (true, 'M') => seconds += number * 60.0,
            (true, 'S') => seconds += number,
            _ => return Err(err("unknown designator")),
        }
    }
    if !seen_any {
        return Err(err("no components"));
    }

    if years != 0 || months != 0 {
        let shifted = add_months(anchor, years * 12 + months);
        seconds += (shifted - anchor).as_seconds_f64();
    }

    Ok(if negative { -seconds } else { seconds })
}

fn add_months(date: OffsetDateTime, months: i64) -> OffsetDateTime {
    let zero_based = date.year() as i64 * 12 + (date.month() as u8 as i64 - 1) + months;
    let year = (zero_based.div_euclid(12)) as i32;
    let month = time::Month::try_from((zero_based.rem_euclid(12) + 1) as u8)
        .unwrap_or(time::Month::January);
    let day = date
        .day()
        .min(time::util::days_in_month(month, year));
    date.replace_date(time::Date::from_calendar_date(year, month, day).unwrap_or(date.date()))
}

// ---------------------------------------------------------------------------
// URL templates

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateVar {
    RepresentationId,
    Bandwidth,
    Number,
    Time,
}

#[derive(Debug, Clone)]
enum TemplatePart {
    Literal(String),
    Var { var: TemplateVar, width: usize },
}

/// A `$Var%fmt$` URL template, compiled once per manifest load.
#[derive(Debug, Clone)]
pub struct UrlTemplate {
    parts: Vec<TemplatePart>,
}

impl UrlTemplate {
    pub fn compile(template: &str) -> PipeResult<Self> {
        let err =
            |msg: &str| PipeError::MpdParsing(format!("invalid template {template:?}: {msg}"));
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = template;
        while let Some(start) = rest.find('$') {
            literal.push_str(&rest[..start]);
            rest = &rest[start + 1..];
            if let Some(stripped) = rest.strip_prefix('$') {
                // $$ escapes a literal dollar sign.
                literal.push('$');
                rest = stripped;
                continue;
            }
            let end = rest.find('$').ok_or_else(|| err("unterminated $Var$"))?;
            let token = &rest[..end];
            rest = &rest[end + 1..];
            let (name, fmt) = match token.split_once('%') {
                Some((name, fmt)) => (name, Some(fmt)),
                None => (token, None),
            };
            let var = match name {
                "RepresentationID" => TemplateVar::RepresentationId,
                "Bandwidth" => TemplateVar::Bandwidth,
                "Number" => TemplateVar::Number,
                "Time" => TemplateVar::Time,
                other => return Err(err(&format!("unknown variable ${other}$"))),
            };
            let width = match fmt {
                Some(fmt) => {
                    let digits = fmt
                        .strip_prefix('0')
                        .and_then(|f| f.strip_suffix('d'))
                        .ok_or_else(|| err("unsupported format spec"))?;
                    digits.parse().map_err(|_| err("bad format width"))?
                }
                None => 0,
            };
            if !literal.is_empty() {
                parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
            }
            parts.push(TemplatePart::Var { var, width });
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(TemplatePart::Literal(literal));
        }
        Ok(Self { parts })
    }

    pub fn format(
        &self,
        representation_id: &str,
        bandwidth: u64,
        number: Option<u64>,
        t: Option<u64>,
    ) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Literal(lit) => out.push_str(lit),
                TemplatePart::Var { var, width } => {
                    let value = match var {
                        TemplateVar::RepresentationId => {
                            out.push_str(representation_id);
                            continue;
                        }
                        TemplateVar::Bandwidth => bandwidth,
                        TemplateVar::Number => number.unwrap_or(0),
                        TemplateVar::Time => t.unwrap_or(0),
                    };
                    out.push_str(&format!("{value:0width$}", width = *width));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const MANIFEST_URL: &str = "https://example.com/dash/manifest.mpd";

    #[test]
    fn template_number_format() {
        let tpl = UrlTemplate::compile("v-$Number%05d$.m4s").unwrap();
        assert_eq!(tpl.format("r0", 0, Some(100), None), "v-00100.m4s");
        assert_eq!(tpl.format("r0", 0, Some(7), None), "v-00007.m4s");
    }

    #[test]
    fn template_all_vars_and_escape() {
        let tpl = UrlTemplate::compile("$RepresentationID$/$Bandwidth$/$Time$$$.mp4").unwrap();
        assert_eq!(tpl.format("video1", 500000, None, Some(90000)), "video1/500000/90000$.mp4");
    }

    #[test]
    fn template_rejects_unknown_var() {
        assert!(UrlTemplate::compile("$Nope$.mp4").is_err());
    }

    #[test]
    fn iso_durations() {
        let anchor = datetime!(2024-01-31 00:00:00 UTC);
        assert_eq!(parse_duration("PT2S", anchor).unwrap(), 2.0);
        assert_eq!(parse_duration("PT1M30S", anchor).unwrap(), 90.0);
        assert_eq!(parse_duration("PT1.5S", anchor).unwrap(), 1.5);
        assert_eq!(parse_duration("P1DT1H", anchor).unwrap(), 90000.0);
        assert_eq!(parse_duration("P2W", anchor).unwrap(), 14.0 * 86400.0);
        // One month from Jan 31 clamps to Feb 29 (2024 is a leap year).
        assert_eq!(parse_duration("P1M", anchor).unwrap(), 29.0 * 86400.0);
        assert!(parse_duration("17", anchor).is_err());
        assert!(parse_duration("P", anchor).is_err());
    }

    const STATIC_MPD: &str = r#"<?xml version="1.0"?>
<MPD type="static" mediaPresentationDuration="PT30S" minBufferTime="PT2S">
  <Period id="p0">
    <AdaptationSet id="0" mimeType="video/mp4">
      <SegmentTemplate media="v-$Number%05d$.m4s" initialization="v-init.mp4"
        timescale="90000" duration="180000" startNumber="100"/>
      <Representation id="v720" bandwidth="1500000" width="1280" height="720" codecs="avc1.4d401f"/>
    </AdaptationSet>
    <AdaptationSet id="1" mimeType="audio/mp4" lang="en">
      <SegmentTemplate media="a-$Number$.m4s" timescale="48000" duration="96000"/>
      <Representation id="a0" bandwidth="128000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn static_manifest_resolves_tree() {
        let mpd = parse(STATIC_MPD, MANIFEST_URL).unwrap();
        assert!(!mpd.dynamic);
        assert_eq!(mpd.media_presentation_duration, Some(30.0));
        assert_eq!(mpd.representations.len(), 2);

        let video = &mpd.representations[0];
        assert_eq!(video.ident.period, "p0");
        assert_eq!(video.ident.representation, "v720");
        assert!(video.is_video());
        assert_eq!(video.height, Some(720));
        let SegmentProfile::Template(tpl) = &video.profile else {
            panic!("expected template profile");
        };
        assert_eq!(tpl.timescale, 90000);
        assert_eq!(tpl.start_number, 100);
        assert_eq!(
            tpl.media.as_ref().unwrap().format("v720", 1500000, Some(100), None),
            "v-00100.m4s"
        );

        let audio = &mpd.representations[1];
        assert!(audio.is_audio());
        assert_eq!(audio.lang.as_deref(), Some("en"));
    }

    #[test]
    fn missing_representation_id_is_fatal() {
        let text = r#"<MPD type="static"><Period><AdaptationSet mimeType="video/mp4">
            <Representation bandwidth="1"/></AdaptationSet></Period></MPD>"#;
        assert!(matches!(parse(text, MANIFEST_URL), Err(PipeError::MpdParsing(_))));
    }

    #[test]
    fn missing_mime_type_is_fatal() {
        let text = r#"<MPD type="static"><Period><AdaptationSet>
            <Representation id="x" bandwidth="1"/></AdaptationSet></Period></MPD>"#;
        assert!(matches!(parse(text, MANIFEST_URL), Err(PipeError::MpdParsing(_))));
    }

    #[test]
    fn default_presentation_delay() {
        let text = r#"<MPD type="dynamic" availabilityStartTime="2024-01-01T00:00:00Z"
            minBufferTime="PT6S"><Period id="p0"/></MPD>"#;
        let mpd = parse(text, MANIFEST_URL).unwrap();
        assert_eq!(mpd.presentation_delay(), 6.0);

        let text = r#"<MPD type="dynamic" availabilityStartTime="2024-01-01T00:00:00Z"
            minBufferTime="PT1S"><Period id="p0"/></MPD>"#;
        let mpd = parse(text, MANIFEST_URL).unwrap();
        assert_eq!(mpd.presentation_delay(), 3.0);
    }

    #[test]
    fn segment_list_resolves_urls() {
        let text = r#"<MPD type="static"><Period id="p0">
          <AdaptationSet mimeType="video/mp4">
            <Representation id="r0" bandwidth="1">
              <SegmentList timescale="1" duration="5">
                <Initialization sourceURL="init.mp4"/>
                <SegmentURL media="s1.m4s"/>
                <SegmentURL media="s2.m4s" mediaRange="0-499"/>
              </SegmentList>
            </Representation>
          </AdaptationSet></Period></MPD>"#;
        let mpd = parse(text, MANIFEST_URL).unwrap();
        let SegmentProfile::List(list) = &mpd.representations[0].profile else {
            panic!("expected list profile");
        };
        assert_eq!(list.segment_urls.len(), 2);
        assert_eq!(list.segment_urls[0].0, "https://example.com/dash/s1.m4s");
        assert_eq!(
            list.initialization.as_ref().unwrap().0,
            "https://example.com/dash/init.mp4"
        );
        let range = list.segment_urls[1].1.as_ref().unwrap();
        assert_eq!((range.start, range.end), (0, Some(499)));
    }
}
