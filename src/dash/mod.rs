//! DASH stream engine.
//!
//! One worker per representation. Segment addressing follows the manifest's
//! profile: SegmentTemplate with a timeline, SegmentTemplate with a number
//! clock, SegmentList, or a single BaseURL media file.

pub mod mpd;

use std::{
    collections::VecDeque,
    sync::Arc,
    time::Duration,
};

use reqwest::Method;
use time::OffsetDateTime;
use tracing::{debug, warn};
use url::Url;

use crate::{
    common::{PipeError, PipeResult},
    session::{
        http::{ErrorKind, HttpSession, RequestOptions},
        options::Options,
    },
    stream::{
        Stream, StreamHandle,
        ffmpeg::{FfmpegMuxer, MuxedStream},
        segmented::{
            CloseSignal, SegmentFetcher, SegmentProducer, SegmentSink, SegmentedHandle,
            SegmentedOptions,
        },
    },
};

use self::mpd::{
    Mpd, Representation, RepresentationIdent, SegmentList, SegmentProfile, SegmentTemplate,
};

/// Chunk size for streaming segment bodies into the ring buffer.
const CHUNK_SIZE: usize = 8192;

/// Floor on the manifest reload interval.
const MIN_RELOAD_INTERVAL: f64 = 1.0;

// ---------------------------------------------------------------------------
// Stream discovery

/// Fetch and parse a manifest, returning named streams: video representations
/// keyed by `<height>p` (or `<kbps>k`), muxed with the best matching audio
/// representation when the manifest carries separate audio.
pub fn streams(
    http: Arc<HttpSession>,
    options: Arc<Options>,
    url: &str,
) -> PipeResult<Vec<(String, Box<dyn Stream>)>> {
    let manifest = fetch_manifest(&http, url, 1)?;

    let audio = select_audio(&manifest, &options);
    let mut out: Vec<(String, Box<dyn Stream>)> = Vec::new();
    let mut names: Vec<String> = Vec::new();

    for rep in manifest.representations.iter().filter(|r| r.is_video()) {
        let base = match rep.height {
            Some(h) => format!("{h}p"),
            None => format!("{}k", rep.bandwidth / 1000),
        };
        let Some(name) = alt_name(&base, &names) else {
            debug!("Skipping stream with duplicate name {base}");
            continue;
        };
        names.push(name.clone());

        let video = DashStream::new(http.clone(), options.clone(), url, rep.ident.clone());
        let stream: Box<dyn Stream> = match &audio {
            Some(audio_ident) if FfmpegMuxer::is_available(&options) => {
                let audio_stream =
                    DashStream::new(http.clone(), options.clone(), url, audio_ident.clone());
                Box::new(MuxedStream::new(
                    options.clone(),
                    vec![Box::new(video), Box::new(audio_stream)],
                ))
            }
            _ => Box::new(video),
        };
        out.push((name, stream));
    }

    // Audio-only manifest.
    if out.is_empty() {
        if let Some(audio_ident) = audio {
            out.push((
                "audio".into(),
                Box::new(DashStream::new(http, options, url, audio_ident)),
            ));
        }
    }

    if out.is_empty() {
        return Err(PipeError::NoStreams(url.to_string()));
    }
    Ok(out)
}

/// Disambiguate a stream name against already-used ones. After `_alt` and
/// `_alt2` further duplicates are dropped.
fn alt_name(base: &str, taken: &[String]) -> Option<String> {
    [
        base.to_string(),
        format!("{base}_alt"),
        format!("{base}_alt2"),
    ]
    .into_iter()
    .find(|candidate| !taken.iter().any(|n| n == candidate))
}

/// Best audio representation: prefer the configured locale language, then the
/// highest bandwidth.
fn select_audio(manifest: &Mpd, options: &Options) -> Option<RepresentationIdent> {
    let wanted_lang = options.get_str("locale").and_then(|l| {
        l.split(['_', '-']).next().map(str::to_lowercase)
    });
    let mut audio: Vec<&Representation> =
        manifest.representations.iter().filter(|r| r.is_audio()).collect();
    audio.sort_by_key(|r| std::cmp::Reverse(r.bandwidth));
    if let Some(lang) = wanted_lang {
        if let Some(rep) = audio
            .iter()
            .find(|r| r.lang.as_deref().map(str::to_lowercase) == Some(lang.clone()))
        {
            return Some(rep.ident.clone());
        }
    }
    audio.first().map(|r| r.ident.clone())
}

fn fetch_manifest(http: &HttpSession, url: &str, retries: u32) -> PipeResult<Mpd> {
    let opts = RequestOptions {
        retries,
        error_kind: ErrorKind::Stream,
        ..Default::default()
    };
    let res = http.request(Method::GET, url, &opts)?;
    let final_url = res.url().to_string();
    let text = res
        .text()
        .map_err(|e| PipeError::stream(format!("Failed to read manifest: {e}")))?;
    mpd::parse(&text, &final_url)
}

// ---------------------------------------------------------------------------
// Stream descriptor

pub struct DashStream {
    http: Arc<HttpSession>,
    options: Arc<Options>,
    manifest_url: String,
    ident: RepresentationIdent,
}

impl DashStream {
    pub fn new(
        http: Arc<HttpSession>,
        options: Arc<Options>,
        manifest_url: &str,
        ident: RepresentationIdent,
    ) -> Self {
        Self {
            http,
            options,
            manifest_url: manifest_url.to_string(),
            ident,
        }
    }
}

impl Stream for DashStream {
    fn stream_type(&self) -> &'static str {
        "dash"
    }

    fn url(&self) -> Option<String> {
        Some(self.manifest_url.clone())
    }

    fn open(&self) -> PipeResult<Box<dyn StreamHandle>> {
        let manifest = fetch_manifest(&self.http, &self.manifest_url, 1)?;
        if manifest.representation(&self.ident).is_none() {
            return Err(PipeError::stream(format!(
                "Representation {} disappeared from the manifest",
                self.ident.representation
            )));
        }

        let producer = ManifestWorker::new(
            self.http.clone(),
            self.options.clone(),
            self.manifest_url.clone(),
            self.ident.clone(),
            manifest,
        );
        let fetcher = Arc::new(DashSegmentFetcher::new(self.http.clone(), &self.options));

        let threads = self.options.get_u64("stream-segment-threads").unwrap_or(1) as usize;
        let handle = SegmentedHandle::spawn(
            producer,
            fetcher,
            SegmentedOptions {
                threads,
                ringbuffer_size: self
                    .options
                    .get_u64("ringbuffer-size")
                    .unwrap_or(16 * 1024 * 1024) as usize,
                read_timeout: Duration::from_secs_f64(
                    self.options.get_f64("stream-timeout").unwrap_or(60.0),
                ),
                name: "dash".into(),
            },
        )?;
        Ok(Box::new(handle))
    }
}

// ---------------------------------------------------------------------------
// Segments

pub struct DashSegment {
    pub uri: Url,
    pub range: Option<mpd::ByteRange>,
    pub init: bool,
}

// ---------------------------------------------------------------------------
// Worker

struct ManifestWorker {
    http: Arc<HttpSession>,
    manifest_url: String,
    ident: RepresentationIdent,
    queue: VecDeque<DashSegment>,
    dynamic: bool,
    reload_interval: f64,
    reload_attempts: u32,
    finished: bool,
    sent_init: bool,
    state: AddressingState,
}

/// Per-profile iteration state carried across manifest reloads.
enum AddressingState {
    /// Timeline templates: remember the last yielded presentation time so a
    /// reload only contributes entries past it.
    Timeline { last_t: Option<u64> },
    /// Number-clock templates: next number to yield plus the wall-clock data
    /// needed to tell whether it is available yet.
    NumberClock {
        next: u64,
        /// One past the last number, for static manifests.
        end: Option<u64>,
        seg_duration: f64,
        available_start: OffsetDateTime,
    },
    /// SegmentList: the next segment number to yield, in startNumber
    /// terms so reloads that drop leading entries line up.
    List { next: u64 },
    Done,
}

impl ManifestWorker {
    fn new(
        http: Arc<HttpSession>,
        options: Arc<Options>,
        manifest_url: String,
        ident: RepresentationIdent,
        manifest: Mpd,
    ) -> Self {
        let reload_attempts =
            options.get_u64("dash-manifest-reload-attempts").unwrap_or(3) as u32;
        let mut worker = Self {
            http,
            manifest_url,
            ident,
            queue: VecDeque::new(),
            dynamic: manifest.dynamic,
            reload_interval: MIN_RELOAD_INTERVAL,
            reload_attempts,
            finished: false,
            sent_init: false,
            state: AddressingState::Done,
        };
        worker.init_state(&manifest);
        worker.refill(&manifest);
        worker
    }

    fn representation<'a>(&self, manifest: &'a Mpd) -> Option<&'a Representation> {
        manifest.representation(&self.ident)
    }

    fn init_state(&mut self, manifest: &Mpd) {
        let Some(rep) = self.representation(manifest) else {
            self.state = AddressingState::Done;
            return;
        };
        self.reload_interval = manifest
            .minimum_update_period
            .unwrap_or(MIN_RELOAD_INTERVAL)
            .max(MIN_RELOAD_INTERVAL);

        self.state = match &rep.profile {
            SegmentProfile::Template(template) => {
                if template.timeline.is_some() {
                    AddressingState::Timeline { last_t: None }
                } else {
                    self.number_clock_state(manifest, rep, template)
                }
            }
            SegmentProfile::List(list) => {
                let skip = if manifest.dynamic {
                    dynamic_list_start(manifest, list) as u64
                } else {
                    0
                };
                AddressingState::List {
                    next: list.start_number + skip,
                }
            }
            SegmentProfile::Base(_) | SegmentProfile::Single => AddressingState::Done,
        };

        // Base/Single profiles produce everything up front.
        if matches!(
            rep.profile,
            SegmentProfile::Base(_) | SegmentProfile::Single
        ) {
            self.queue_single(rep);
            self.finished = true;
        }
    }

    fn number_clock_state(
        &self,
        manifest: &Mpd,
        rep: &Representation,
        template: &SegmentTemplate,
    ) -> AddressingState {
        let seg_duration =
            template.duration.unwrap_or(template.timescale) as f64 / template.timescale as f64;
        let available_start = manifest.availability_start_time
            + Duration::from_secs_f64(rep.period_start.max(0.0));

        if !manifest.dynamic {
            let total = rep
                .period_duration
                .or(manifest.media_presentation_duration)
                .unwrap_or(0.0);
            let count = (total / seg_duration).ceil() as u64;
            return AddressingState::NumberClock {
                next: template.start_number,
                end: Some(template.start_number + count),
                seg_duration,
                available_start,
            };
        }

        // Live: start behind the edge by the presentation delay plus the
        // manifest's minimum buffer.
        let pto = template.presentation_time_offset as f64 / template.timescale as f64;
        let elapsed = (OffsetDateTime::now_utc() - available_start).as_seconds_f64()
            - pto
            - manifest.presentation_delay()
            - manifest.min_buffer_time;
        let offset = (elapsed / seg_duration).floor().max(0.0) as u64;
        AddressingState::NumberClock {
            next: template.start_number + offset,
            end: None,
            seg_duration,
            available_start,
        }
    }

    fn queue_single(&mut self, rep: &Representation) {
        match &rep.profile {
            SegmentProfile::Base(base) => {
                if let Some((uri, range)) = &base.initialization {
                    let url = match uri {
                        Some(u) => rep.base_url.join(u).unwrap_or_else(|_| rep.base_url.clone()),
                        None => rep.base_url.clone(),
                    };
                    self.queue.push_back(DashSegment {
                        uri: url,
                        range: range.clone(),
                        init: true,
                    });
                }
                self.queue.push_back(DashSegment {
                    uri: rep.base_url.clone(),
                    range: None,
                    init: false,
                });
            }
            SegmentProfile::Single => {
                self.queue.push_back(DashSegment {
                    uri: rep.base_url.clone(),
                    range: None,
                    init: false,
                });
            }
            _ => {}
        }
    }

    fn queue_init(&mut self, rep: &Representation, template: &SegmentTemplate) {
        if self.sent_init {
            return;
        }
        self.sent_init = true;
        if let Some(init) = &template.initialization {
            let path = init.format(&self.ident.representation, rep.bandwidth, None, None);
            if let Ok(url) = rep.base_url.join(&path) {
                self.queue.push_back(DashSegment {
                    uri: url,
                    range: None,
                    init: true,
                });
            }
        }
    }

    /// Pull newly available segments out of the manifest into the queue.
    fn refill(&mut self, manifest: &Mpd) {
        let Some(rep) = self.representation(manifest).cloned() else {
            warn!(
                "Representation {} missing from reloaded manifest",
                self.ident.representation
            );
            return;
        };

        let mut state = std::mem::replace(&mut self.state, AddressingState::Done);
        match &mut state {
            AddressingState::Timeline { last_t } => {
                if let SegmentProfile::Template(template) = &rep.profile {
                    self.refill_timeline(manifest, &rep, template, last_t);
                }
            }
            AddressingState::NumberClock {
                next,
                end,
                seg_duration,
                available_start,
            } => {
                if let SegmentProfile::Template(template) = &rep.profile {
                    self.refill_numbered(&rep, template, next, *end, *seg_duration, *available_start);
                    if end.is_some_and(|end| *next >= end) {
                        self.finished = true;
                    }
                }
            }
            AddressingState::List { next } => {
                if let SegmentProfile::List(list) = &rep.profile {
                    self.refill_list(&rep, list, next);
                }
            }
            AddressingState::Done => {}
        }
        self.state = state;

        if !self.dynamic {
            self.finished = true;
        }
    }

    fn refill_timeline(
        &mut self,
        manifest: &Mpd,
        rep: &Representation,
        template: &SegmentTemplate,
        last_t: &mut Option<u64>,
    ) {
        let Some(media) = &template.media else { return };
        let first_load = last_t.is_none();
        let period_end = rep.period_duration.map(|d| {
            template.presentation_time_offset + (d * template.timescale as f64) as u64
        });
        let mut fresh: Vec<(u64, u64)> = expand_timeline(template, period_end)
            .into_iter()
            .filter(|(t, _)| last_t.is_none_or(|seen| *t > seen))
            .collect();
        if first_load {
            self.queue_init(rep, template);
            if manifest.dynamic {
                // Walk back from the live edge by the presentation delay
                // before yielding anything.
                let delay_ticks =
                    (manifest.presentation_delay() * template.timescale as f64) as u64;
                let mut acc = 0u64;
                let mut start = fresh.len();
                for (i, (_, d)) in fresh.iter().enumerate().rev() {
                    acc += d;
                    start = i;
                    if acc >= delay_ticks {
                        break;
                    }
                }
                fresh.drain(..start);
            }
        }
        for (t, _) in fresh {
            let path = media.format(&self.ident.representation, rep.bandwidth, None, Some(t));
            if let Ok(url) = rep.base_url.join(&path) {
                self.queue.push_back(DashSegment {
                    uri: url,
                    range: None,
                    init: false,
                });
            }
            *last_t = Some(t);
        }
    }

    fn refill_numbered(
        &mut self,
        rep: &Representation,
        template: &SegmentTemplate,
        next: &mut u64,
        end: Option<u64>,
        seg_duration: f64,
        available_start: OffsetDateTime,
    ) {
        let Some(media) = &template.media else { return };
        self.queue_init(rep, template);
        let limit = match end {
            Some(end) => end,
            None => {
                // How many numbers the clock has made available.
                let elapsed = (OffsetDateTime::now_utc() - available_start).as_seconds_f64();
                template.start_number + (elapsed / seg_duration).floor().max(0.0) as u64
            }
        };
        while *next < limit {
            let path = media.format(&self.ident.representation, rep.bandwidth, Some(*next), None);
            if let Ok(url) = rep.base_url.join(&path) {
                self.queue.push_back(DashSegment {
                    uri: url,
                    range: None,
                    init: false,
                });
            }
            *next += 1;
        }
    }

    fn refill_list(&mut self, rep: &Representation, list: &SegmentList, next: &mut u64) {
        if !self.sent_init {
            self.sent_init = true;
            if let Some((uri, range)) = &list.initialization {
                if let Ok(url) = rep.base_url.join(uri) {
                    self.queue.push_back(DashSegment {
                        uri: url,
                        range: range.clone(),
                        init: true,
                    });
                }
            }
        }
        let skip = if *next < list.start_number {
            warn!(
                "Skipped segments: expected segment number {} but the list now starts at {}",
                *next, list.start_number
            );
            0
        } else {
            (*next - list.start_number) as usize
        };
        for (uri, range) in list.segment_urls.iter().skip(skip) {
            if let Ok(url) = rep.base_url.join(uri) {
                self.queue.push_back(DashSegment {
                    uri: url,
                    range: range.clone(),
                    init: false,
                });
            }
        }
        *next = (*next).max(list.start_number + list.segment_urls.len() as u64);
    }

    fn reload(&mut self, closer: &CloseSignal) -> bool {
        if closer.wait(Duration::from_secs_f64(self.reload_interval)) {
            return false;
        }
        match fetch_manifest(&self.http, &self.manifest_url, self.reload_attempts) {
            Ok(manifest) => {
                if !manifest.dynamic {
                    // The stream converted to static; drain and finish.
                    self.dynamic = false;
                }
                self.refill(&manifest);
                true
            }
            Err(err) => {
                warn!("Failed to reload manifest: {err}");
                true
            }
        }
    }
}

impl SegmentProducer for ManifestWorker {
    type Segment = DashSegment;

    fn next(&mut self, closer: &CloseSignal) -> Option<DashSegment> {
        loop {
            if closer.is_closed() {
                return None;
            }
            if let Some(segment) = self.queue.pop_front() {
                return Some(segment);
            }
            if self.finished {
                debug!("Reached end of presentation");
                return None;
            }
            if !self.reload(closer) {
                return None;
            }
        }
    }
}

/// Flatten a SegmentTimeline into absolute (t, d) pairs, applying `@r`
/// repeats and carrying the running clock through entries without `@t`.
/// A negative `@r` repeats until the next entry's `@t`, or until
/// `period_end` (in timescale ticks) for the last timed entry.
fn expand_timeline(template: &SegmentTemplate, period_end: Option<u64>) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    let Some(timeline) = &template.timeline else {
        return out;
    };
    let mut clock: u64 = 0;
    for (i, entry) in timeline.iter().enumerate() {
        if let Some(t) = entry.t {
            clock = t;
        }
        if entry.r >= 0 {
            for _ in 0..=entry.r as u64 {
                out.push((clock, entry.d));
                clock += entry.d;
            }
        } else {
            let until = timeline[i + 1..].iter().find_map(|e| e.t).or(period_end);
            match until {
                Some(until) if entry.d > 0 => {
                    while clock < until {
                        out.push((clock, entry.d));
                        clock += entry.d;
                    }
                }
                _ => {
                    out.push((clock, entry.d));
                    clock += entry.d;
                }
            }
        }
    }
    out
}

/// Optimal dynamic start for a SegmentList: `ceil(delay / segDuration)`
/// entries back from the live edge.
fn dynamic_list_start(manifest: &Mpd, list: &SegmentList) -> usize {
    let seg_duration = list.duration.unwrap_or(list.timescale) as f64 / list.timescale as f64;
    let back = (manifest.presentation_delay() / seg_duration).ceil() as usize;
    let start = list.segment_urls.len().saturating_sub(back.max(1));
    if start > 0 {
        debug!("Skipping {start} segments to reach the live edge");
    }
    start
}

// ---------------------------------------------------------------------------
// Fetcher

struct DashSegmentFetcher {
    http: Arc<HttpSession>,
    retries: u32,
    timeout: Duration,
}

impl DashSegmentFetcher {
    fn new(http: Arc<HttpSession>, options: &Options) -> Self {
        Self {
            http,
            retries: options.get_u64("stream-segment-attempts").unwrap_or(3).max(1) as u32 - 1,
            timeout: Duration::from_secs_f64(
                options.get_f64("stream-segment-timeout").unwrap_or(10.0),
            ),
        }
    }
}

impl SegmentFetcher for DashSegmentFetcher {
    type Segment = DashSegment;

    fn fetch(&self, segment: DashSegment, sink: &SegmentSink, closer: &CloseSignal) {
        let range = segment.range.as_ref().map(|r| match r.end {
            Some(end) => format!("bytes={}-{}", r.start, end),
            None => format!("bytes={}-", r.start),
        });
        let opts = RequestOptions {
            retries: self.retries,
            timeout: Some(self.timeout),
            error_kind: ErrorKind::Stream,
            acceptable_status: vec![206],
            range,
            ..Default::default()
        };
        let mut res = match self.http.request(Method::GET, segment.uri.as_str(), &opts) {
            Ok(res) => res,
            Err(err) => {
                sink.failed(format!("Failed to fetch segment {}: {err}", segment.uri));
                return;
            }
        };
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            if closer.is_closed() {
                return;
            }
            match std::io::Read::read(&mut res, &mut chunk) {
                Ok(0) => return,
                Ok(n) => {
                    if !sink.write(chunk[..n].to_vec()) {
                        return;
                    }
                }
                Err(err) => {
                    sink.failed(format!("Failed to read segment {}: {err}", segment.uri));
                    return;
                }
            }
        }
    }
}
