//! Per-service transaction log.
//!
//! Append-only textual records in a fixed format that existing viewers parse;
//! the exact bytes matter. One file per service (`united`) or a mirror tree
//! `service/dir/name.log` (`split`). A record is built in full and written
//! with a single append-mode write so concurrent requests never interleave.

use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Transaction log layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    /// One `<service>.log` per service.
    United,
    /// `<service>/<dir>/<name>.log` mirror tree.
    Split,
}

/// One request/response record.
#[derive(Debug, Clone)]
pub struct Record {
    pub date: DateTime<Local>,
    /// Absolute rule path.
    pub mock: String,
    pub remote_address: String,
    /// Rule host filter; omitted from the record when empty.
    pub request_host: String,
    pub method: String,
    pub request_uri: String,
    /// Proxy upstream; omitted when empty.
    pub response_url: String,
    pub status_code: u16,
    pub status_desc: String,
    /// Sorted by name, values space-joined.
    pub request_headers: Vec<(String, String)>,
    /// Sorted cookie strings (`name=value`).
    pub cookies: Vec<String>,
    /// Sorted by name, values space-joined. Written for GET only.
    pub query: Vec<(String, String)>,
    pub request_body: String,
    pub response_body: String,
    /// Sorted by name.
    pub response_headers: Vec<(String, String)>,
}

impl Record {
    /// Render the record in the fixed textual format: a dashed date rule,
    /// 24-column labels, section blocks, two blank lines as terminator.
    pub fn format(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(
            out,
            "-- {} {}\n",
            self.date.format("%Y/%m/%d %H:%M:%S"),
            "-".repeat(65)
        );

        let _ = writeln!(out, "  {:<24} {}", "Mock:", self.mock);
        if !self.remote_address.is_empty() {
            let _ = writeln!(out, "  {:<24} {}", "Remote Adress:", self.remote_address);
        }
        if !self.request_host.is_empty() {
            let _ = writeln!(out, "  {:<24} {}", "Request Host:", self.request_host);
        }
        let _ = writeln!(out, "  {:<24} {} {}", "Request:", self.method, self.request_uri);
        if !self.response_url.is_empty() {
            let _ = writeln!(out, "  {:<24} {}", "Response URL:", self.response_url);
        }
        let _ = writeln!(
            out,
            "  {:<24} {} {}",
            "Status Code:", self.status_code, self.status_desc
        );

        if !self.request_headers.is_empty() {
            let _ = write!(out, "\n+ HEADERS\n\n");
            for (name, value) in &self.request_headers {
                let _ = writeln!(out, "  {:<24} {}", format!("{name}:"), value);
            }
        }

        if !self.cookies.is_empty() {
            let _ = write!(out, "\n+ COOKIES\n\n");
            for cookie in &self.cookies {
                let _ = writeln!(out, "  {cookie}");
            }
        }

        if self.method == "GET" && !self.query.is_empty() {
            let _ = write!(out, "\n+ QUERY\n\n");
            for (name, value) in &self.query {
                let _ = writeln!(out, "  {:<24} {}", format!("{name}:"), value);
            }
        }

        if !self.request_body.is_empty() {
            let _ = write!(out, "\n+ REQUEST BODY\n\n");
            out.push_str(&self.request_body);
            if !self.request_body.ends_with('\n') {
                out.push('\n');
            }
        }

        if !self.response_body.is_empty() {
            let _ = write!(out, "\n+ RESPONSE BODY\n\n");
            out.push_str(&self.response_body);
            if !self.response_body.ends_with('\n') {
                out.push('\n');
            }
        }

        if !self.response_headers.is_empty() {
            let _ = write!(out, "\n+ RESPONSE HEADERS\n\n");
            for (name, value) in &self.response_headers {
                let _ = writeln!(out, "  {:<24} {}", format!("{name}:"), value);
            }
        }

        out.push_str("\n\n");
        out
    }
}

/// Writer for transaction logs. Created directories get `log-dir-perms`;
/// newly created log files get `log-perms` and the configured owner.
pub struct TxLog {
    log_dir: PathBuf,
    log_type: LogType,
    user: Option<String>,
    group: Option<String>,
    log_perms: u32,
    log_dir_perms: u32,
}

impl TxLog {
    pub fn new(
        log_dir: impl Into<PathBuf>,
        log_type: LogType,
        user: Option<String>,
        group: Option<String>,
        log_perms: u32,
        log_dir_perms: u32,
    ) -> Self {
        TxLog {
            log_dir: log_dir.into(),
            log_type,
            user,
            group,
            log_perms,
            log_dir_perms,
        }
    }

    /// Append one record to the log for the given rule coordinates. The whole
    /// record goes out in one write so POSIX append keeps it contiguous.
    pub fn write(
        &self,
        service: &str,
        dir: &str,
        name: &str,
        record: &Record,
    ) -> anyhow::Result<()> {
        let path = self.log_path(service, dir, name)?;
        let is_new = !path.exists();

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(record.format().as_bytes())?;

        if is_new {
            self.apply_perms(&path, self.log_perms);
        }
        Ok(())
    }

    /// Resolve the log file path, creating intermediate directories in split
    /// mode. Rules without a service log under their own name.
    fn log_path(&self, service: &str, dir: &str, name: &str) -> anyhow::Result<PathBuf> {
        let service_part = if service.is_empty() { name } else { service };

        if self.log_type == LogType::United {
            return Ok(self.log_dir.join(format!("{service_part}.log")));
        }

        let mut current = self.log_dir.clone();
        let components = std::iter::once(service_part)
            .chain(dir.split('/'))
            .filter(|c| !c.is_empty());
        for component in components {
            current.push(component);
            if !current.exists() {
                std::fs::create_dir(&current)?;
                self.apply_perms(&current, self.log_dir_perms);
            }
        }

        Ok(current.join(format!("{name}.log")))
    }

    /// chmod plus optional chown from `access:user` / `access:group`. Failures
    /// are logged and ignored: permissions must never break a response.
    fn apply_perms(&self, path: &Path, mode: u32) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
                warn!(path = %path.display(), "can't set log permissions: {e}");
            }

            if self.user.is_none() && self.group.is_none() {
                return;
            }
            let uid = self.user.as_deref().and_then(|name| {
                nix::unistd::User::from_name(name)
                    .ok()
                    .flatten()
                    .map(|u| u.uid.as_raw())
            });
            let gid = self.group.as_deref().and_then(|name| {
                nix::unistd::Group::from_name(name)
                    .ok()
                    .flatten()
                    .map(|g| g.gid.as_raw())
            });
            if uid.is_some() || gid.is_some() {
                if let Err(e) = std::os::unix::fs::chown(path, uid, gid) {
                    warn!(path = %path.display(), "can't change log owner: {e}");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (path, mode);
        }
    }
}
