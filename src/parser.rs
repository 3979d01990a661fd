//! Mock file parser.
//!
//! A mock file is a UTF-8 text document made of sections introduced by
//! `@SECTION[:<id>][<source|<<source]` header lines. Blank lines and lines
//! whose first non-space character is `#` are skipped. Recognized sections:
//! DESCRIPTION, HOST, REQUEST, RESPONSE, CODE, HEADERS, DELAY, AUTH.

use crate::rule::{Auth, DEFAULT_RESPONSE, Response, Rule, RequestSpec};
use crate::urlnorm;
use std::path::{Path, PathBuf};

/// Parse failure taxonomy. Per-rule; the observer treats all of these as
/// recoverable.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("mock file {0} does not exist")]
    NotFound(PathBuf),
    #[error("mock file {0} is not readable: {1}")]
    Unreadable(PathBuf, std::io::Error),
    #[error("mock file {0} is empty")]
    Empty(PathBuf),
    #[error("can't parse file {0}: section REQUEST is malformed")]
    MalformedRequest(PathBuf),
    #[error("can't parse file {0}: request url must start with /")]
    UrlWithoutSlash(PathBuf),
    #[error("can't parse file {0}: section CODE is malformed")]
    MalformedCode(PathBuf),
    #[error("can't parse file {0}: section HEADERS is malformed")]
    MalformedHeaders(PathBuf),
    #[error("can't parse file {0}: section DELAY is malformed")]
    MalformedDelay(PathBuf),
    #[error("can't parse file {0}: section AUTH is malformed")]
    MalformedAuth(PathBuf),
}

/// Content types guessed from a body file extension.
fn guess_content_type(source: &str) -> &'static str {
    match Path::new(source).extension().and_then(|e| e.to_str()) {
        Some("json") => "text/javascript",
        Some("txt") => "text/plain",
        Some("xml") => "text/xml",
        Some("csv") => "text/csv",
        Some("html") => "text/html",
        _ => "text/plain",
    }
}

/// Parse one mock file addressed as `rule_dir/service/dir/name.mock`
/// (`service` and `dir` may be empty).
pub fn parse(rule_dir: &Path, service: &str, dir: &str, name: &str) -> Result<Rule, ParseError> {
    let mut mock_path = rule_dir.to_path_buf();
    if !service.is_empty() {
        mock_path.push(service);
    }
    if !dir.is_empty() {
        mock_path.push(dir);
    }
    mock_path.push(format!("{name}.mock"));

    if !mock_path.exists() {
        return Err(ParseError::NotFound(mock_path));
    }
    let raw = std::fs::read_to_string(&mock_path)
        .map_err(|e| ParseError::Unreadable(mock_path.clone(), e))?;
    if raw.trim().is_empty() {
        return Err(ParseError::Empty(mock_path));
    }

    let lines: Vec<&str> = raw
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .collect();

    parse_rule_lines(&lines, rule_dir, service, dir, name, mock_path)
}

/// Split a rule path relative to the rule dir into (service, dir, name).
/// One component means a root-level mock with no service; the last component
/// is the file name, everything between the first and last is the inner dir.
pub fn split_rule_path(relative: &Path) -> (String, String, String) {
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    let stem = |file: &str| file.strip_suffix(".mock").unwrap_or(file).to_string();

    match parts.len() {
        0 => (String::new(), String::new(), String::new()),
        1 => (String::new(), String::new(), stem(&parts[0])),
        2 => (parts[0].clone(), String::new(), stem(&parts[1])),
        n => (
            parts[0].clone(),
            parts[1..n - 1].join("/"),
            stem(&parts[n - 1]),
        ),
    }
}

fn parse_rule_lines(
    lines: &[&str],
    rule_dir: &Path,
    service: &str,
    dir: &str,
    name: &str,
    mock_path: PathBuf,
) -> Result<Rule, ParseError> {
    let full_name = if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    };
    let pretty_path = if service.is_empty() {
        full_name.clone()
    } else {
        format!("{service}/{full_name}")
    };

    let mut rule = Rule {
        name: name.to_string(),
        full_name,
        service: service.to_string(),
        dir: dir.to_string(),
        path: mock_path.clone(),
        pretty_path,
        ..Rule::default()
    };

    let mut section = String::new();
    let mut id = DEFAULT_RESPONSE.to_string();

    for line in lines {
        if line.starts_with('@') {
            let header = parse_section_header(line);
            section = header.section;
            id = header.id;

            if section == "RESPONSE" && !header.source.is_empty() {
                let resp = response_entry(&mut rule, &id);
                if is_upstream_url(&header.source) {
                    resp.url = header.source;
                    resp.overwrite = header.overwrite;
                } else {
                    resp.headers.insert(
                        "Content-Type".to_string(),
                        guess_content_type(&header.source).to_string(),
                    );
                    let mut file = rule_dir.to_path_buf();
                    if !service.is_empty() {
                        file.push(service);
                    }
                    file.push(&header.source);
                    resp.file = file;
                }
            }
            continue;
        }

        match section.as_str() {
            "DESCRIPTION" => rule.desc.push_str(line),
            "HOST" => rule.request.host = line.trim_end().to_string(),
            "REQUEST" => {
                let mut parts = line.split_whitespace();
                let (method, url) = match (parts.next(), parts.next()) {
                    (Some(m), Some(u)) => (m, u),
                    _ => return Err(ParseError::MalformedRequest(mock_path)),
                };
                if !url.starts_with('/') {
                    return Err(ParseError::UrlWithoutSlash(mock_path));
                }
                rule.is_wildcard = url.contains('*');
                rule.request.method = method.to_uppercase();
                rule.request.url = url.to_string();
            }
            "RESPONSE" => {
                let resp = response_entry(&mut rule, &id);
                // A sourced response ignores inline lines: exactly one of
                // content/file/url may be populated.
                if resp.file.as_os_str().is_empty() && resp.url.is_empty() {
                    resp.content.push_str(line);
                    resp.content.push('\n');
                }
            }
            "CODE" => {
                let code: u16 = line
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::MalformedCode(mock_path.clone()))?;
                response_entry(&mut rule, &id).code = code;
            }
            "HEADERS" => {
                let (header_name, header_value) = line
                    .split_once(':')
                    .map(|(n, v)| (n.trim_end(), v.trim_start()))
                    .ok_or_else(|| ParseError::MalformedHeaders(mock_path.clone()))?;
                if header_name.is_empty() || header_value.is_empty() {
                    return Err(ParseError::MalformedHeaders(mock_path));
                }
                response_entry(&mut rule, &id)
                    .headers
                    .insert(header_name.to_string(), header_value.to_string());
            }
            "DELAY" => {
                let delay: f64 = line
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::MalformedDelay(mock_path.clone()))?;
                response_entry(&mut rule, &id).delay = delay;
            }
            "AUTH" => {
                let trimmed = line.trim_end();
                let (user, password) = trimmed
                    .split_once(':')
                    .ok_or_else(|| ParseError::MalformedAuth(mock_path.clone()))?;
                if password.contains(':') {
                    return Err(ParseError::MalformedAuth(mock_path));
                }
                rule.auth = Auth {
                    user: user.to_string(),
                    password: password.to_string(),
                };
            }
            // Unknown sections are ignored, like unknown header lines before
            // the first section.
            _ => {}
        }
    }

    if rule.request.method.is_empty() || rule.request.url.is_empty() {
        return Err(ParseError::MalformedRequest(mock_path));
    }

    if rule.responses.is_empty() {
        rule.responses
            .insert(DEFAULT_RESPONSE.to_string(), Response::default());
    }

    rule.request.nurl = urlnorm::normalize(&rule.request.url);
    rule.request.uri = make_uri(&rule.request);

    rule.mod_time = std::fs::metadata(&rule.path)
        .and_then(|m| m.modified())
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);

    Ok(rule)
}

/// Exact-match index key for a request matcher.
pub fn make_uri(request: &RequestSpec) -> String {
    format!("{}:{}:{}", request.host, request.method, request.nurl)
}

struct SectionHeader {
    section: String,
    id: String,
    source: String,
    overwrite: bool,
}

/// Split `@SECTION[:id][<source|<<source]`. Spaces are stripped, the section
/// name is upper-cased, the id defaults to `_default`.
fn parse_section_header(line: &str) -> SectionHeader {
    let compact: String = line[1..].chars().filter(|c| !c.is_whitespace()).collect();

    let (section, source, overwrite) = if let Some((s, src)) = compact.split_once("<<") {
        (s.to_string(), src.to_string(), true)
    } else if let Some((s, src)) = compact.split_once('<') {
        (s.to_string(), src.to_string(), false)
    } else {
        (compact, String::new(), false)
    };

    let (section, id) = match section.split_once(':') {
        Some((s, i)) => (s.to_string(), i.to_string()),
        None => (section, DEFAULT_RESPONSE.to_string()),
    };

    SectionHeader {
        section: section.to_uppercase(),
        id,
        source,
        overwrite,
    }
}

fn is_upstream_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn response_entry<'a>(rule: &'a mut Rule, id: &str) -> &'a mut Response {
    rule.responses.entry(id.to_string()).or_default()
}
