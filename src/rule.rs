//! Rule data model: the in-memory representation of one `.mock` file.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

/// Reserved response id: the fallback for status code and headers, and the
/// body when a rule declares no ids at all.
pub const DEFAULT_RESPONSE: &str = "_default";

/// One mock file, parsed.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Mock file name without extension.
    pub name: String,
    /// Inner dir + name, e.g. "dir1/login".
    pub full_name: String,
    /// Top-level directory under the rule dir.
    pub service: String,
    /// Inner directory path, possibly empty.
    pub dir: String,
    /// Full path to the mock file.
    pub path: PathBuf,
    /// Service + full name, for log messages.
    pub pretty_path: String,
    /// Free-text description.
    pub desc: String,
    /// Basic auth credentials; both set means auth is required.
    pub auth: Auth,
    /// Request matcher.
    pub request: RequestSpec,
    /// Responses keyed by id. Always holds at least one entry.
    pub responses: BTreeMap<String, Response>,
    /// Mock file mtime at parse time.
    pub mod_time: SystemTime,
    /// True when the URL contains `*`.
    pub is_wildcard: bool,
}

impl Default for Rule {
    fn default() -> Self {
        Rule {
            name: String::new(),
            full_name: String::new(),
            service: String::new(),
            dir: String::new(),
            path: PathBuf::new(),
            pretty_path: String::new(),
            desc: String::new(),
            auth: Auth::default(),
            request: RequestSpec::default(),
            responses: BTreeMap::new(),
            mod_time: SystemTime::UNIX_EPOCH,
            is_wildcard: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Auth {
    pub user: String,
    pub password: String,
}

impl Auth {
    /// Auth is enforced only when both credentials are present.
    pub fn is_required(&self) -> bool {
        !self.user.is_empty() && !self.password.is_empty()
    }
}

/// The request side of a rule.
#[derive(Debug, Clone, Default)]
pub struct RequestSpec {
    /// Optional host filter (empty = any host).
    pub host: String,
    /// Upper-case HTTP method.
    pub method: String,
    /// URL as written in the mock file, starts with `/`.
    pub url: String,
    /// URL with query parameters sorted.
    pub nurl: String,
    /// Exact-match index key: `host + ":" + method + ":" + nurl`.
    pub uri: String,
}

/// One canned response. The parser populates at most one of `content`,
/// `file`, `url`.
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// Inline body text.
    pub content: String,
    /// Absolute path to a file holding the body.
    pub file: PathBuf,
    /// Upstream URL for proxying.
    pub url: String,
    /// Status code; 0 inherits from `_default`.
    pub code: u16,
    /// Response headers, case-preserving.
    pub headers: BTreeMap<String, String>,
    /// Delay in seconds before responding.
    pub delay: f64,
    /// With `url`: replace status and headers with the upstream's.
    pub overwrite: bool,
}

impl Response {
    /// Body text: the file contents when a file is set, the inline content
    /// otherwise. A missing or unreadable body file yields an empty body.
    pub fn body(&self) -> String {
        if self.file.as_os_str().is_empty() {
            return self.content.clone();
        }
        std::fs::read_to_string(&self.file).unwrap_or_default()
    }
}

impl Rule {
    /// Response ids eligible for random selection (everything but
    /// `_default`), in deterministic order.
    pub fn selectable_ids(&self) -> Vec<&str> {
        self.responses
            .keys()
            .filter(|id| *id != DEFAULT_RESPONSE)
            .map(String::as_str)
            .collect()
    }
}
