//! Plugin model: static registration tables, compiled URL matchers and the
//! trait service plugins implement.

pub mod metadata;

use regex::{Regex, RegexBuilder};

use crate::{
    common::{PipeError, PipeResult},
    session::Session,
    stream::Stream,
};

pub const NO_PRIORITY: u8 = 0;
pub const LOW_PRIORITY: u8 = 10;
pub const NORMAL_PRIORITY: u8 = 20;
pub const HIGH_PRIORITY: u8 = 30;

/// One URL pattern a plugin claims. These tables are plain literals so the
/// build-time extractor can read them without executing any code.
#[derive(Debug)]
pub struct MatcherSpec {
    pub pattern: &'static str,
    pub priority: u8,
    /// Matcher name, for plugins that treat different URL shapes differently.
    pub name: Option<&'static str>,
}

/// A command-line argument the plugin consumes from session options.
#[derive(Debug)]
pub struct ArgumentSpec {
    pub name: &'static str,
    pub required: bool,
    pub sensitive: bool,
    pub requires: &'static [&'static str],
    pub help: Option<&'static str>,
}

/// Help text marker that hides an argument from the exported metadata.
pub const SUPPRESS: &str = "==SUPPRESS==";

#[derive(Debug)]
pub struct PluginSpec {
    pub name: &'static str,
    pub matchers: &'static [MatcherSpec],
    pub arguments: &'static [ArgumentSpec],
}

/// A compiled matcher, case-insensitive like the registration patterns
/// assume.
pub struct Matcher {
    pub regex: Regex,
    pub priority: u8,
    pub name: Option<&'static str>,
}

impl Matcher {
    pub fn compile(spec: &MatcherSpec) -> PipeResult<Self> {
        let regex = RegexBuilder::new(spec.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| PipeError::plugin(format!("Invalid matcher pattern: {e}")))?;
        Ok(Self {
            regex,
            priority: spec.priority,
            name: spec.name,
        })
    }
}

pub trait Plugin: Send + Sync {
    fn spec(&self) -> &'static PluginSpec;

    /// Resolve the given URL into named streams.
    fn streams(
        &self,
        session: &Session,
        url: &str,
    ) -> PipeResult<Vec<(String, Box<dyn Stream>)>>;

    fn name(&self) -> &'static str {
        self.spec().name
    }
}

/// The `plugins.json` produced by the build-time extractor.
pub fn metadata_json() -> &'static str {
    include_str!(concat!(env!("OUT_DIR"), "/plugins.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matcher_is_case_insensitive() {
        let spec = MatcherSpec {
            pattern: r"https?://example\.com/live/\w+",
            priority: NORMAL_PRIORITY,
            name: None,
        };
        let matcher = Matcher::compile(&spec).unwrap();
        assert!(matcher.regex.is_match("HTTPS://EXAMPLE.COM/live/abc"));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let spec = MatcherSpec {
            pattern: r"(((",
            priority: NO_PRIORITY,
            name: None,
        };
        assert!(Matcher::compile(&spec).is_err());
    }

    #[test]
    fn embedded_metadata_is_valid_json() {
        let parsed: serde_json::Value = serde_json::from_str(metadata_json()).unwrap();
        assert!(parsed.is_object());
    }
}
