//! Build-time plugin metadata extraction.
//!
//! Reads the `PluginSpec` registration tables out of `src/plugins/*.rs` as
//! text and renders them to `plugins.json`. The tables must be plain
//! literals; anything computed (macros, function calls, references to
//! non-priority constants) is rejected with a position-carrying error so the
//! build fails loudly instead of shipping wrong metadata.
//!
//! This module is also compiled directly into `build.rs` via `#[path]`, so
//! it must stay free of `crate::` imports.

use std::{collections::BTreeMap, fs, path::Path};

use serde_json::{Map, Value, json};
use thiserror::Error;

/// Marker hiding an argument from the exported metadata.
const SUPPRESS_MARKER: &str = "==SUPPRESS==";

/// Points at the offending source literal.
#[derive(Debug, Error)]
#[error("{message} ({file}:{line}:{column})")]
pub struct MetadataParseError {
    pub message: String,
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub source_line: String,
}

impl MetadataParseError {
    pub fn new(
        message: impl Into<String>,
        file: impl Into<String>,
        line: usize,
        column: usize,
        source_line: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            file: file.into(),
            line,
            column,
            source_line: source_line.into(),
        }
    }
}

/// Extract metadata from every plugin source file in `dir`, keyed and sorted
/// by plugin name.
pub fn extract_dir(dir: &Path) -> Result<Value, MetadataParseError> {
    let mut plugins: BTreeMap<String, Value> = BTreeMap::new();
    let mut paths: Vec<_> = fs::read_dir(dir)
        .map_err(|e| MetadataParseError::new(format!("Cannot read {dir:?}: {e}"), dir.display().to_string(), 0, 0, ""))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension().is_some_and(|ext| ext == "rs")
                && p.file_name().is_some_and(|n| n != "mod.rs")
        })
        .collect();
    paths.sort();

    for path in paths {
        let (name, value) = extract_file(&path)?;
        if plugins.contains_key(&name) {
            return Err(MetadataParseError::new(
                format!("Duplicate plugin name {name:?}"),
                path.display().to_string(),
                0,
                0,
                "",
            ));
        }
        plugins.insert(name, value);
    }
    Ok(Value::Object(plugins.into_iter().collect()))
}

/// Extract one plugin's metadata. Returns the plugin name and its JSON
/// description.
pub fn extract_file(path: &Path) -> Result<(String, Value), MetadataParseError> {
    let source = fs::read_to_string(path).map_err(|e| {
        MetadataParseError::new(
            format!("Cannot read file: {e}"),
            path.display().to_string(),
            0,
            0,
            "",
        )
    })?;
    let file = path.display().to_string();

    let start = find_spec_literal(&source).ok_or_else(|| {
        MetadataParseError::new("No PluginSpec registration table found", &file, 1, 1, "")
    })?;

    let mut cursor = Cursor {
        src: &source,
        pos: start,
        file: &file,
    };
    cursor.expect_char('{')?;
    let mut name: Option<String> = None;
    let mut matchers: Option<Vec<Value>> = None;
    let mut arguments: Option<Vec<Value>> = None;

    loop {
        cursor.skip_trivia();
        if cursor.peek() == Some('}') {
            cursor.advance();
            break;
        }
        let field = cursor.parse_ident()?;
        cursor.expect_char(':')?;
        match field.as_str() {
            "name" => name = Some(cursor.parse_string()?),
            "matchers" => matchers = Some(cursor.parse_struct_array("MatcherSpec")?),
            "arguments" => arguments = Some(cursor.parse_struct_array("ArgumentSpec")?),
            other => {
                return Err(cursor.error(format!("Unknown PluginSpec field {other:?}")));
            }
        }
        cursor.skip_trivia();
        if cursor.peek() == Some(',') {
            cursor.advance();
        }
    }

    let name = name.ok_or_else(|| cursor.error("PluginSpec is missing its name"))?;
    let matchers = matchers.unwrap_or_default();
    if matchers.is_empty() {
        return Err(cursor.error(format!("Plugin {name:?} declares no matchers")));
    }

    let arguments: Vec<Value> = arguments
        .unwrap_or_default()
        .into_iter()
        .filter(|arg| arg.get("help").and_then(Value::as_str) != Some(SUPPRESS_MARKER))
        .collect();

    let mut obj = Map::new();
    obj.insert("matchers".into(), Value::Array(matchers));
    if !arguments.is_empty() {
        obj.insert("arguments".into(), Value::Array(arguments));
    }
    Ok((name, Value::Object(obj)))
}

/// Find the opening brace of a `= PluginSpec { ... }` literal.
fn find_spec_literal(source: &str) -> Option<usize> {
    let mut search = 0;
    while let Some(found) = source[search..].find("PluginSpec") {
        let at = search + found;
        let before = source[..at].trim_end();
        let after = source[at + "PluginSpec".len()..].trim_start();
        if before.ends_with('=') && after.starts_with('{') {
            let brace = source[at..].find('{').unwrap_or(0);
            return Some(at + brace);
        }
        search = at + "PluginSpec".len();
    }
    None
}

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
    file: &'a str,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => self.advance(),
                Some('/') if self.src[self.pos..].starts_with("//") => {
                    while let Some(c) = self.peek() {
                        self.advance();
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn error(&self, message: impl Into<String>) -> MetadataParseError {
        let consumed = &self.src[..self.pos];
        let line = consumed.matches('\n').count() + 1;
        let column = consumed
            .rsplit('\n')
            .next()
            .map(|l| l.chars().count() + 1)
            .unwrap_or(1);
        let source_line = self.src.lines().nth(line - 1).unwrap_or("").to_string();
        MetadataParseError::new(message, self.file, line, column, source_line)
    }

    fn expect_char(&mut self, expected: char) -> Result<(), MetadataParseError> {
        self.skip_trivia();
        if self.peek() == Some(expected) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!(
                "Expected {expected:?}, found {:?}",
                self.peek().unwrap_or('\0')
            )))
        }
    }

    /// An identifier or a `path::to::ident` chain. Lone `::` separators are
    /// consumed so path-qualified constants resolve by their last segment.
    fn parse_ident(&mut self) -> Result<String, MetadataParseError> {
        self.skip_trivia();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.advance();
            } else if self.src[self.pos..].starts_with("::") {
                self.advance();
                self.advance();
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.error("Expected an identifier"));
        }
        Ok(self.src[start..self.pos].to_string())
    }

    /// A plain or raw string literal. Computed values are rejected here.
    fn parse_string(&mut self) -> Result<String, MetadataParseError> {
        self.skip_trivia();
        match self.peek() {
            Some('"') => self.parse_quoted(),
            Some('r') => self.parse_raw_string(),
            _ => Err(self.error("Expected a string literal")),
        }
    }

    fn parse_quoted(&mut self) -> Result<String, MetadataParseError> {
        self.advance(); // opening quote
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("Unterminated string literal")),
                Some('"') => {
                    self.advance();
                    return Ok(out);
                }
                Some('\\') => {
                    self.advance();
                    let escaped = self
                        .peek()
                        .ok_or_else(|| self.error("Unterminated escape"))?;
                    self.advance();
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '\\' => '\\',
                        '"' => '"',
                        '0' => '\0',
                        other => {
                            return Err(
                                self.error(format!("Unsupported escape sequence \\{other}"))
                            );
                        }
                    });
                }
                Some(c) => {
                    self.advance();
                    out.push(c);
                }
            }
        }
    }

    fn parse_raw_string(&mut self) -> Result<String, MetadataParseError> {
        self.advance(); // 'r'
        let mut hashes = 0;
        while self.peek() == Some('#') {
            hashes += 1;
            self.advance();
        }
        if self.peek() != Some('"') {
            return Err(self.error("Expected a raw string literal"));
        }
        self.advance();
        let terminator = format!("\"{}", "#".repeat(hashes));
        match self.src[self.pos..].find(&terminator) {
            Some(rel) => {
                let value = self.src[self.pos..self.pos + rel].to_string();
                self.pos += rel + terminator.len();
                Ok(value)
            }
            None => Err(self.error("Unterminated raw string literal")),
        }
    }

    /// `None` or `Some("...")`.
    fn parse_optional_string(&mut self) -> Result<Option<String>, MetadataParseError> {
        self.skip_trivia();
        let ident = self.parse_ident()?;
        match ident.as_str() {
            "None" => Ok(None),
            "Some" => {
                self.expect_char('(')?;
                let value = self.parse_string()?;
                self.expect_char(')')?;
                Ok(Some(value))
            }
            other => Err(self.error(format!("Expected None or Some(...), found {other:?}"))),
        }
    }

    fn parse_bool(&mut self) -> Result<bool, MetadataParseError> {
        let ident = self.parse_ident()?;
        match ident.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(self.error(format!("Expected a bool literal, found {other:?}"))),
        }
    }

    /// Integer literal or one of the well-known priority constants.
    fn parse_priority(&mut self) -> Result<u8, MetadataParseError> {
        self.skip_trivia();
        if self.peek().is_some_and(|c| c.is_ascii_digit()) {
            let start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
            return self.src[start..self.pos]
                .parse()
                .map_err(|_| self.error("Priority out of range"));
        }
        let ident = self.parse_ident()?;
        match ident.rsplit("::").next().unwrap_or(&ident) {
            "NO_PRIORITY" => Ok(0),
            "LOW_PRIORITY" => Ok(10),
            "NORMAL_PRIORITY" => Ok(20),
            "HIGH_PRIORITY" => Ok(30),
            other => Err(self.error(format!("Unknown priority {other:?}"))),
        }
    }

    /// `&["a", "b"]`.
    fn parse_string_array(&mut self) -> Result<Vec<String>, MetadataParseError> {
        self.skip_trivia();
        if self.peek() == Some('&') {
            self.advance();
        }
        self.expect_char('[')?;
        let mut out = Vec::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some(']') {
                self.advance();
                return Ok(out);
            }
            out.push(self.parse_string()?);
            self.skip_trivia();
            if self.peek() == Some(',') {
                self.advance();
            }
        }
    }

    /// `&[StructName { ... }, ...]` for matcher and argument tables.
    fn parse_struct_array(&mut self, struct_name: &str) -> Result<Vec<Value>, MetadataParseError> {
        self.skip_trivia();
        if self.peek() == Some('&') {
            self.advance();
        }
        self.expect_char('[')?;
        let mut out = Vec::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some(']') {
                self.advance();
                return Ok(out);
            }
            let ident = self.parse_ident()?;
            let ident = ident.rsplit("::").next().unwrap_or(&ident).to_string();
            if ident != struct_name {
                return Err(self.error(format!(
                    "Expected a {struct_name} literal, found {ident:?}"
                )));
            }
            out.push(match struct_name {
                "MatcherSpec" => self.parse_matcher()?,
                _ => self.parse_argument()?,
            });
            self.skip_trivia();
            if self.peek() == Some(',') {
                self.advance();
            }
        }
    }

    fn parse_matcher(&mut self) -> Result<Value, MetadataParseError> {
        self.expect_char('{')?;
        let mut pattern: Option<String> = None;
        let mut priority: u8 = 20;
        let mut name: Option<String> = None;
        loop {
            self.skip_trivia();
            if self.peek() == Some('}') {
                self.advance();
                break;
            }
            let field = self.parse_ident()?;
            self.expect_char(':')?;
            match field.as_str() {
                "pattern" => pattern = Some(self.parse_string()?),
                "priority" => priority = self.parse_priority()?,
                "name" => name = self.parse_optional_string()?,
                other => return Err(self.error(format!("Unknown MatcherSpec field {other:?}"))),
            }
            self.skip_trivia();
            if self.peek() == Some(',') {
                self.advance();
            }
        }
        let pattern = pattern.ok_or_else(|| self.error("MatcherSpec is missing its pattern"))?;
        let mut obj = Map::new();
        obj.insert("pattern".into(), json!(pattern));
        obj.insert("priority".into(), json!(priority));
        if let Some(name) = name {
            obj.insert("name".into(), json!(name));
        }
        Ok(Value::Object(obj))
    }

    fn parse_argument(&mut self) -> Result<Value, MetadataParseError> {
        self.expect_char('{')?;
        let mut name: Option<String> = None;
        let mut required = false;
        let mut sensitive = false;
        let mut requires: Vec<String> = Vec::new();
        let mut help: Option<String> = None;
        loop {
            self.skip_trivia();
            if self.peek() == Some('}') {
                self.advance();
                break;
            }
            let field = self.parse_ident()?;
            self.expect_char(':')?;
            match field.as_str() {
                "name" => name = Some(self.parse_string()?),
                "required" => required = self.parse_bool()?,
                "sensitive" => sensitive = self.parse_bool()?,
                "requires" => requires = self.parse_string_array()?,
                "help" => help = self.parse_optional_string()?,
                other => return Err(self.error(format!("Unknown ArgumentSpec field {other:?}"))),
            }
            self.skip_trivia();
            if self.peek() == Some(',') {
                self.advance();
            }
        }
        let name = name.ok_or_else(|| self.error("ArgumentSpec is missing its name"))?;
        let mut obj = Map::new();
        obj.insert("name".into(), json!(name));
        obj.insert("required".into(), json!(required));
        obj.insert("sensitive".into(), json!(sensitive));
        if !requires.is_empty() {
            obj.insert("requires".into(), json!(requires));
        }
        if let Some(help) = help {
            obj.insert("help".into(), json!(help));
        }
        Ok(Value::Object(obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_plugin(dir: &Path, file: &str, contents: &str) {
        let mut f = fs::File::create(dir.join(file)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    const VALID: &str = r####"
use crate::plugin::{MatcherSpec, PluginSpec, NORMAL_PRIORITY};

pub const SPEC: PluginSpec = PluginSpec {
    name: "example",
    matchers: &[
        MatcherSpec {
            pattern: r"https?://example\.com/(?:live|vod)/\w+",
            priority: NORMAL_PRIORITY,
            name: None,
        },
        MatcherSpec {
            pattern: r"https?://alt\.example\.com/.+",
            priority: 10,
            name: Some("alt"),
        },
    ],
    arguments: &[
        ArgumentSpec {
            name: "example-token",
            required: false,
            sensitive: true,
            requires: &[],
            help: Some("API token"),
        },
        ArgumentSpec {
            name: "example-hidden",
            required: false,
            sensitive: false,
            requires: &[],
            help: Some("==SUPPRESS=="),
        },
    ],
};
"####;

    #[test]
    fn extracts_valid_spec() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "example.rs", VALID);
        let json = extract_dir(dir.path()).unwrap();
        let plugin = &json["example"];
        let matchers = plugin["matchers"].as_array().unwrap();
        assert_eq!(matchers.len(), 2);
        assert_eq!(matchers[0]["priority"], 20);
        assert!(matchers[0].get("name").is_none());
        assert_eq!(matchers[1]["name"], "alt");

        // The suppressed argument is dropped.
        let arguments = plugin["arguments"].as_array().unwrap();
        assert_eq!(arguments.len(), 1);
        assert_eq!(arguments[0]["name"], "example-token");
        assert_eq!(arguments[0]["sensitive"], true);
    }

    #[test]
    fn rejects_computed_pattern() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "bad.rs",
            r#"
pub const SPEC: PluginSpec = PluginSpec {
    name: "bad",
    matchers: &[MatcherSpec { pattern: concat!("a", "b"), priority: 20, name: None }],
    arguments: &[],
};
"#,
        );
        let err = extract_dir(dir.path()).unwrap_err();
        assert!(err.message.contains("string literal"), "{}", err.message);
        assert_eq!(err.line, 4);
        assert!(err.source_line.contains("concat!"));
    }

    #[test]
    fn rejects_missing_spec() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "empty.rs", "pub fn nothing() {}\n");
        let err = extract_dir(dir.path()).unwrap_err();
        assert!(err.message.contains("No PluginSpec"));
    }

    #[test]
    fn rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let spec = r#"
pub const SPEC: PluginSpec = PluginSpec {
    name: "twin",
    matchers: &[MatcherSpec { pattern: "x", priority: 20, name: None }],
    arguments: &[],
};
"#;
        write_plugin(dir.path(), "a.rs", spec);
        write_plugin(dir.path(), "b.rs", spec);
        let err = extract_dir(dir.path()).unwrap_err();
        assert!(err.message.contains("Duplicate"));
    }

    #[test]
    fn output_is_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        for (file, name) in [("zz.rs", "alpha"), ("aa.rs", "zulu")] {
            write_plugin(
                dir.path(),
                file,
                &format!(
                    r#"
pub const SPEC: PluginSpec = PluginSpec {{
    name: "{name}",
    matchers: &[MatcherSpec {{ pattern: "x", priority: 20, name: None }}],
    arguments: &[],
}};
"#
                ),
            );
        }
        let json = extract_dir(dir.path()).unwrap();
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["alpha", "zulu"]);
    }

    #[test]
    fn raw_strings_with_hashes() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "raw.rs",
            r####"
pub const SPEC: PluginSpec = PluginSpec {
    name: "raw",
    matchers: &[MatcherSpec { pattern: r#"https://x/"quoted""#, priority: 20, name: None }],
    arguments: &[],
};
"####,
        );
        let json = extract_dir(dir.path()).unwrap();
        assert_eq!(
            json["raw"]["matchers"][0]["pattern"],
            r#"https://x/"quoted""#
        );
    }
}
