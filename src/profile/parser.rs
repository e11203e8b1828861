//! Tokenizer and option table for OpenVPN-style configuration text
//!
//! Each line is split by a small character state machine that understands
//! double quotes, single quotes and backslash escapes. `#` and `;` start a
//! comment only between tokens. A line whose first token is `<name>` opens
//! an inline block that runs until a line reading `</name>`; the block is
//! stored as the two-token option `name <body>`.

use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error(
        "Input looks like a ZIP archive. Import is only possible for OpenVPN config files (.ovpn/.conf)"
    )]
    ZipArchive,
    #[error("Options warning: Bad backslash ('\\') usage on line {line}")]
    BadBackslash { line: usize },
    #[error("Unterminated quoted string on line {line}")]
    UnterminatedQuote { line: usize },
    #[error("No endtag </{name}> for starttag <{name}> found")]
    MissingEndTag { name: String },
    #[error("Option {option} has {count} parameters, expected between {min} and {max}")]
    ArgumentCount {
        option: String,
        count: usize,
        min: usize,
        max: usize,
    },
    #[error("Argument to --{option} has to be an integer: {value}")]
    InvalidNumber { option: String, value: String },
    #[error("Unknown parameter to {option}: {value}")]
    InvalidValue { option: String, value: String },
    #[error("Could not parse {option} address: {value}")]
    InvalidAddress { option: String, value: String },
    #[error("Unsupported option {0} encountered in config file. Aborting")]
    UnsupportedOption(String),
    #[error("Sorry. Only tun mode is supported")]
    OnlyTunSupported,
    #[error("Invalid mode for --mode specified, need p2p: {0}")]
    InvalidMode(String),
    #[error("Unsupported option to --proto {0}")]
    UnsupportedProtocol(String),
    #[error("Using a <connection> block and --remote is not allowed.")]
    RemoteAndConnectionBlock,
    #[error("A <connection> block must have exactly one remote, found {0}")]
    ConnectionBlockRemotes(usize),
}

const META_PREFIX: &str = "# OVPN_ACCESS_SERVER_";

const ALIASES: &[(&str, &str)] = &[("server-poll-timeout", "timeout-connect")];

/// One occurrence of an option. `args[0]` is the option name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub args: Vec<String>,
    /// `args[1]` is the body of an inline `<name>` block
    pub inline: bool,
}

impl RawLine {
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// Number of parameters after the option name
    pub fn param_count(&self) -> usize {
        self.args.len().saturating_sub(1)
    }
}

/// Options keyed by name, in order of first appearance
#[derive(Debug, Clone, Default)]
pub struct RawOptionTable {
    entries: Vec<(String, Vec<RawLine>)>,
    meta: HashMap<String, String>,
}

impl RawOptionTable {
    pub fn insert(&mut self, line: RawLine) {
        let Some(name) = line.args.first().cloned() else {
            return;
        };
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, lines)) => lines.push(line),
            None => self.entries.push((name, vec![line])),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&[RawLine]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, lines)| lines.as_slice())
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<RawLine>> {
        let index = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(index).1)
    }

    /// Remove every occurrence of `name`, checking each carries between
    /// `min` and `max` parameters.
    pub fn take_all(
        &mut self,
        name: &str,
        min: usize,
        max: usize,
    ) -> Result<Option<Vec<RawLine>>, ParseError> {
        let Some(lines) = self.remove(name) else {
            return Ok(None);
        };
        for line in &lines {
            let count = line.param_count();
            if count < min || count > max {
                return Err(ParseError::ArgumentCount {
                    option: name.to_string(),
                    count,
                    min,
                    max,
                });
            }
        }
        Ok(Some(lines))
    }

    /// Remove `name` and return its last occurrence
    pub fn take(
        &mut self,
        name: &str,
        min: usize,
        max: usize,
    ) -> Result<Option<RawLine>, ParseError> {
        Ok(self.take_all(name, min, max)?.and_then(|mut lines| lines.pop()))
    }

    /// Remove a flag-style option, returning whether it was present
    pub fn take_flag(&mut self, name: &str, max: usize) -> Result<bool, ParseError> {
        Ok(self.take(name, 0, max)?.is_some())
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    /// Take whatever is left, in order of first appearance
    pub fn drain(&mut self) -> Vec<(String, Vec<RawLine>)> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse configuration text into an option table
pub fn parse(text: &str) -> Result<RawOptionTable, ParseError> {
    let mut table = RawOptionTable::default();
    let mut lines = text.lines().enumerate();

    while let Some((index, raw)) = lines.next() {
        let line_no = index + 1;
        let mut line = raw;
        if line_no == 1 {
            if line.starts_with("PK\u{3}\u{4}") || line.starts_with("PK\u{7}\u{8}") {
                return Err(ParseError::ZipArchive);
            }
            line = line.strip_prefix('\u{feff}').unwrap_or(line);
        }

        if let Some(meta) = line.strip_prefix(META_PREFIX) {
            if let Some((key, value)) = meta.split_once('=') {
                table.meta.insert(key.to_string(), value.to_string());
            }
            continue;
        }

        let mut args = tokenize(line, line_no)?;
        if args.is_empty() {
            continue;
        }
        if let Some(stripped) = args[0].strip_prefix("--") {
            args[0] = stripped.to_string();
        }

        let mut inline = false;
        let first = args[0].trim();
        if first.len() > 2 && first.starts_with('<') && first.ends_with('>') {
            let name = first[1..first.len() - 1].to_string();
            let end_tag = format!("</{}>", name);
            let mut body = String::new();
            loop {
                match lines.next() {
                    Some((_, l)) if l.trim() == end_tag => break,
                    Some((_, l)) => {
                        body.push_str(l);
                        body.push('\n');
                    }
                    None => return Err(ParseError::MissingEndTag { name }),
                }
            }
            if body.ends_with('\n') {
                body.pop();
            }
            args = vec![name, body];
            inline = true;
        }

        if let Some((_, current)) = ALIASES.iter().find(|(old, _)| *old == args[0]) {
            debug!("Option {} renamed to {}", args[0], current);
            args[0] = current.to_string();
        }

        table.insert(RawLine { args, inline });
    }

    Ok(table)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineState {
    Initial,
    Quoted,
    SingleQuoted,
    Unquoted,
    Done,
}

fn is_space(c: char) -> bool {
    c.is_whitespace() || c == '\0'
}

/// Split one line into tokens. `line_no` is only used for error reporting.
pub fn tokenize(line: &str, line_no: usize) -> Result<Vec<String>, ParseError> {
    let mut params = Vec::new();
    if line.is_empty() {
        return Ok(params);
    }

    let mut state = LineState::Initial;
    let mut backslash = false;
    let mut current = String::new();
    // A trailing NUL terminates the last token
    for c in line.chars().chain(std::iter::once('\0')) {
        let mut out = None;
        if !backslash && c == '\\' && state != LineState::SingleQuoted {
            backslash = true;
            continue;
        }

        match state {
            LineState::Initial => {
                if !is_space(c) {
                    if c == ';' || c == '#' {
                        break;
                    }
                    if !backslash && c == '"' {
                        state = LineState::Quoted;
                    } else if !backslash && c == '\'' {
                        state = LineState::SingleQuoted;
                    } else {
                        out = Some(c);
                        state = LineState::Unquoted;
                    }
                }
            }
            LineState::Unquoted => {
                if !backslash && is_space(c) {
                    state = LineState::Done;
                } else {
                    out = Some(c);
                }
            }
            LineState::Quoted => {
                if !backslash && c == '"' {
                    state = LineState::Done;
                } else {
                    out = Some(c);
                }
            }
            LineState::SingleQuoted => {
                if c == '\'' {
                    state = LineState::Done;
                } else {
                    out = Some(c);
                }
            }
            LineState::Done => {}
        }

        if state == LineState::Done {
            state = LineState::Initial;
            params.push(std::mem::take(&mut current));
            out = None;
        }

        if backslash {
            if let Some(o) = out {
                if !(o == '\\' || o == '"' || is_space(o)) {
                    return Err(ParseError::BadBackslash { line: line_no });
                }
            }
        }
        backslash = false;

        if let Some(o) = out {
            if o != '\0' {
                current.push(o);
            }
        }
    }

    match state {
        LineState::Quoted | LineState::SingleQuoted => {
            return Err(ParseError::UnterminatedQuote { line: line_no });
        }
        // Escaped trailing whitespace kept the last token open
        LineState::Unquoted => params.push(current),
        _ => {}
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(line: &str) -> Vec<String> {
        tokenize(line, 1).unwrap()
    }

    #[test]
    fn test_tokenize_quoting() {
        assert_eq!(
            tokens(r#"foo "a b" 'c\d' e\ f"#),
            vec!["foo", "a b", r"c\d", "e f"]
        );
    }

    #[test]
    fn test_tokenize_comments() {
        assert!(tokens("# just a comment").is_empty());
        assert!(tokens("   ; also a comment").is_empty());
        assert_eq!(tokens("remote host 1194 # trailing"), vec!["remote", "host", "1194"]);
        assert_eq!(tokens(r#"setenv X "a # b""#), vec!["setenv", "X", "a # b"]);
        assert_eq!(tokens("a#b"), vec!["a#b"]);
    }

    #[test]
    fn test_tokenize_escapes() {
        assert_eq!(tokens(r#""say \"hi\"""#), vec![r#"say "hi""#]);
        assert_eq!(tokens(r"path\\dir"), vec![r"path\dir"]);
        assert_eq!(
            tokenize(r"bad\q", 3),
            Err(ParseError::BadBackslash { line: 3 })
        );
    }

    #[test]
    fn test_tokenize_empty_quotes_and_whitespace() {
        assert_eq!(tokens(r#"opt """#), vec!["opt", ""]);
        assert!(tokens("   \t  ").is_empty());
        assert!(tokens("").is_empty());
    }

    #[test]
    fn test_tokenize_unterminated_quote() {
        assert_eq!(
            tokenize(r#"remote "host"#, 7),
            Err(ParseError::UnterminatedQuote { line: 7 })
        );
    }

    #[test]
    fn test_parse_repeated_options_keep_order() {
        let mut table = parse("remote a\nproto udp\nremote b 443\n").unwrap();
        let remotes = table.get("remote").unwrap();
        assert_eq!(remotes.len(), 2);
        assert_eq!(remotes[1].args, vec!["remote", "b", "443"]);
        let names: Vec<String> = table.drain().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["remote", "proto"]);
    }

    #[test]
    fn test_parse_strips_double_dash_and_aliases() {
        let table = parse("--client\nserver-poll-timeout 5\n").unwrap();
        assert!(table.contains("client"));
        assert!(table.contains("timeout-connect"));
        assert!(!table.contains("server-poll-timeout"));
    }

    #[test]
    fn test_parse_inline_block() {
        let text = "<ca>\n-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n</ca>\n";
        let table = parse(text).unwrap();
        let ca = &table.get("ca").unwrap()[0];
        assert!(ca.inline);
        assert_eq!(ca.args.len(), 2);
        assert_eq!(
            ca.args[1],
            "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----"
        );
    }

    #[test]
    fn test_parse_inline_block_end_tag_trimmed() {
        let table = parse("<key>\nabc\n  </key>  \nverb 3\n").unwrap();
        assert_eq!(table.get("key").unwrap()[0].args[1], "abc");
        assert!(table.contains("verb"));
    }

    #[test]
    fn test_parse_missing_end_tag() {
        let err = parse("<ca>\nabc\n").unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingEndTag {
                name: "ca".to_string()
            }
        );
        assert_eq!(err.to_string(), "No endtag </ca> for starttag <ca> found");
    }

    #[test]
    fn test_parse_rejects_zip() {
        assert_eq!(
            parse("PK\u{3}\u{4}garbage").unwrap_err(),
            ParseError::ZipArchive
        );
    }

    #[test]
    fn test_parse_strips_bom_and_reads_meta() {
        let text = "\u{feff}client\n# OVPN_ACCESS_SERVER_FRIENDLY_NAME=Office\n# OVPN_ACCESS_SERVER_USERNAME=alice\n";
        let table = parse(text).unwrap();
        assert!(table.contains("client"));
        assert_eq!(table.meta("FRIENDLY_NAME"), Some("Office"));
        assert_eq!(table.meta("USERNAME"), Some("alice"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_take_checks_argument_count() {
        let mut table = parse("verb 3 4\n").unwrap();
        let err = table.take("verb", 1, 1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Option verb has 2 parameters, expected between 1 and 1"
        );
    }

    #[test]
    fn test_take_returns_last_and_removes() {
        let mut table = parse("verb 1\nverb 4\n").unwrap();
        let verb = table.take("verb", 1, 1).unwrap().unwrap();
        assert_eq!(verb.arg(1), Some("4"));
        assert!(table.take("verb", 1, 1).unwrap().is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_crlf_lines() {
        let table = parse("client\r\nremote host 1194\r\n").unwrap();
        assert_eq!(table.get("remote").unwrap()[0].args, vec!["remote", "host", "1194"]);
    }
}
