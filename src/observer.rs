//! Rule index and background reloader.
//!
//! The observer owns every loaded rule and keeps the indexes in sync with the
//! on-disk tree: deleted files unload, mtime changes reload (the URI key may
//! move), new `*.mock` files load. A scan cycle holds the write lock, so a
//! concurrent dispatch sees either the old or the new rule, never a partial
//! state. Dispatchers get `Arc<Rule>` handles that stay valid for the whole
//! request even if a reload drops the rule meanwhile.

use crate::parser;
use crate::rule::Rule;
use crate::urlnorm;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tokio::sync::{RwLock, watch};
use tracing::{error, info};

/// Method fallback order for HEAD requests when `processing:auto-head` is on.
const AUTO_HEAD_METHODS: [&str; 4] = ["GET", "POST", "PUT", "DELETE"];

pub struct Observer {
    rule_dir: PathBuf,
    auto_head: bool,
    started: AtomicBool,
    inner: RwLock<Indexes>,
}

/// All index maps are BTreeMaps so iteration (notably the wildcard scan) is
/// deterministic.
#[derive(Default)]
struct Indexes {
    /// Exact-match index: `host:method:nurl` -> rule.
    uri_map: BTreeMap<String, Arc<Rule>>,
    /// Reverse index for detecting already-loaded files.
    path_map: BTreeMap<PathBuf, Arc<Rule>>,
    /// Wildcard rules, keyed by file path; dispatch iterates, never looks up.
    wc_map: BTreeMap<PathBuf, Arc<Rule>>,
    /// service -> full name -> rule, for the list command.
    name_map: BTreeMap<String, BTreeMap<String, Arc<Rule>>>,
    /// Known services.
    srv_map: BTreeSet<String>,
    /// Failed files with the mtime observed at failure; errors are re-reported
    /// only when the file changes.
    err_map: HashMap<PathBuf, SystemTime>,
}

/// Handle for the background scan task returned by [`Observer::start`].
pub struct ObserverHandle {
    stop: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl ObserverHandle {
    /// Stop the ticker after the in-flight cycle completes and wait for the
    /// task to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.join.await;
    }
}

impl Observer {
    pub fn new(rule_dir: impl Into<PathBuf>, auto_head: bool) -> Self {
        Observer {
            rule_dir: rule_dir.into(),
            auto_head,
            started: AtomicBool::new(false),
            inner: RwLock::new(Indexes::default()),
        }
    }

    /// Launch the background task that re-runs [`Observer::load`] every
    /// `check_delay` seconds. Idempotent: a second call does nothing and
    /// returns `None`.
    pub fn start(self: &Arc<Self>, check_delay: u64) -> Option<ObserverHandle> {
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }

        let (stop, mut stopped) = watch::channel(false);
        let observer = Arc::clone(self);
        let join = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(check_delay.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        observer.load().await;
                    }
                }
            }
        });

        Some(ObserverHandle { stop, join })
    }

    /// One scan pass: unload deleted rules, reload changed ones, load new
    /// files. Returns false when any rule failed (first report only; repeats
    /// are suppressed until the file changes).
    pub async fn load(&self) -> bool {
        let mut inner = self.inner.write().await;
        let mut ok = true;

        // Pass over loaded rules: unload deleted files, reload changed ones.
        let loaded: Vec<Arc<Rule>> = inner.uri_map.values().cloned().collect();
        for rule in loaded {
            if !rule.path.exists() {
                remove_rule(&mut inner, &rule);
                inner.err_map.remove(&rule.path);
                info!(rule = %rule.pretty_path, "rule unloaded (mock file deleted)");
                continue;
            }

            let mtime = file_mtime(&rule.path);
            if mtime == rule.mod_time {
                continue;
            }

            match parser::parse(&self.rule_dir, &rule.service, &rule.dir, &rule.name) {
                Ok(reparsed) => {
                    // The URI may have changed; drop every old key first.
                    remove_rule(&mut inner, &rule);
                    inner.err_map.remove(&rule.path);
                    insert_rule(&mut inner, Arc::new(reparsed));
                    info!(rule = %rule.pretty_path, "rule reloaded");
                }
                Err(e) => {
                    // Keep the old rule active; report once per failing mtime.
                    if inner.err_map.get(&rule.path) != Some(&mtime) {
                        error!("can't parse rule file: {e}");
                        inner.err_map.insert(rule.path.clone(), mtime);
                        ok = false;
                    }
                }
            }
        }

        // Pass over the tree: load files not seen before.
        if !self.rule_dir.is_dir() {
            error!(dir = %self.rule_dir.display(), "can't read directory with rules");
            return false;
        }

        for path in list_mock_files(&self.rule_dir) {
            if inner.path_map.contains_key(&path) {
                continue;
            }

            let relative = match path.strip_prefix(&self.rule_dir) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let (service, dir, name) = parser::split_rule_path(relative);

            let rule = match parser::parse(&self.rule_dir, &service, &dir, &name) {
                Ok(rule) => Arc::new(rule),
                Err(e) => {
                    let mtime = file_mtime(&path);
                    if inner.err_map.get(&path) != Some(&mtime) {
                        error!("can't parse rule file: {e}");
                        inner.err_map.insert(path.clone(), mtime);
                        ok = false;
                    }
                    continue;
                }
            };

            if let Some(other) = find_conflict(&inner, &rule) {
                if inner.err_map.get(&rule.path) != Some(&rule.mod_time) {
                    error!(
                        "rule intersection: rule {} and rule {} have same result urls",
                        other.pretty_path, rule.pretty_path
                    );
                    inner.err_map.insert(rule.path.clone(), rule.mod_time);
                    ok = false;
                }
                continue;
            }

            inner.err_map.remove(&rule.path);
            info!(rule = %rule.pretty_path, "rule loaded");
            insert_rule(&mut inner, rule);
        }

        crate::metrics::set_rules_loaded(inner.uri_map.len() as i64);
        ok
    }

    /// Resolve a request to a rule: exact URI lookup (with and without host),
    /// then the auto-HEAD method set, then the wildcard scan. Host filtering
    /// applies equally on every path.
    pub async fn get_rule(&self, host: &str, method: &str, url: &str) -> Option<Arc<Rule>> {
        let inner = self.inner.read().await;
        let uri = urlnorm::normalize(url);

        let exact = |m: &str| {
            inner
                .uri_map
                .get(&format!("{host}:{m}:{uri}"))
                .or_else(|| inner.uri_map.get(&format!(":{m}:{uri}")))
                .cloned()
        };

        if let Some(rule) = exact(method) {
            return Some(rule);
        }

        let auto_head = self.auto_head && method == "HEAD";
        if auto_head {
            for m in AUTO_HEAD_METHODS {
                if let Some(rule) = exact(m) {
                    return Some(rule);
                }
            }
        }

        for rule in inner.wc_map.values() {
            let method_ok = rule.request.method == method
                || (auto_head && AUTO_HEAD_METHODS.contains(&rule.request.method.as_str()));
            if !method_ok {
                continue;
            }
            if !rule.request.host.is_empty() && rule.request.host != host {
                continue;
            }
            if urlnorm::match_pattern(&rule.request.nurl, &uri) {
                return Some(Arc::clone(rule));
            }
        }

        None
    }

    /// Known service names, sorted.
    pub async fn services(&self) -> Vec<String> {
        self.inner.read().await.srv_map.iter().cloned().collect()
    }

    /// Full names of a service's rules, sorted.
    pub async fn service_rule_names(&self, service: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        if !inner.srv_map.contains(service) {
            return Vec::new();
        }
        inner
            .name_map
            .get(service)
            .map(|rules| rules.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Look up a rule by service and full name (dir/name).
    pub async fn rule_by_name(&self, service: &str, full_name: &str) -> Option<Arc<Rule>> {
        let inner = self.inner.read().await;
        if !inner.srv_map.contains(service) {
            return None;
        }
        inner.name_map.get(service)?.get(full_name).cloned()
    }

    /// Number of loaded rules.
    pub async fn rules_count(&self) -> usize {
        self.inner.read().await.uri_map.len()
    }
}

/// A new rule conflicts when its exact URI is taken, or (for wildcards) when
/// an existing wildcard rule with the same method and host has an equivalent
/// URL pattern. The first loaded rule stays active.
fn find_conflict(inner: &Indexes, rule: &Rule) -> Option<Arc<Rule>> {
    if let Some(existing) = inner.uri_map.get(&rule.request.uri) {
        return Some(Arc::clone(existing));
    }
    if !rule.is_wildcard {
        return None;
    }
    inner
        .wc_map
        .values()
        .find(|wc| {
            wc.request.method == rule.request.method
                && wc.request.host == rule.request.host
                && urlnorm::equal_patterns(&wc.request.nurl, &rule.request.nurl)
        })
        .cloned()
}

fn insert_rule(inner: &mut Indexes, rule: Arc<Rule>) {
    inner
        .uri_map
        .insert(rule.request.uri.clone(), Arc::clone(&rule));
    inner
        .path_map
        .insert(rule.path.clone(), Arc::clone(&rule));
    if rule.is_wildcard {
        inner.wc_map.insert(rule.path.clone(), Arc::clone(&rule));
    }
    inner.srv_map.insert(rule.service.clone());
    inner
        .name_map
        .entry(rule.service.clone())
        .or_default()
        .insert(rule.full_name.clone(), rule);
}

fn remove_rule(inner: &mut Indexes, rule: &Rule) {
    inner.uri_map.remove(&rule.request.uri);
    inner.path_map.remove(&rule.path);
    inner.wc_map.remove(&rule.path);
    if let Some(names) = inner.name_map.get_mut(&rule.service) {
        names.remove(&rule.full_name);
        if names.is_empty() {
            inner.name_map.remove(&rule.service);
            inner.srv_map.remove(&rule.service);
        }
    }
}

fn file_mtime(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// All `*.mock` files under `dir`, skipping dotfile-prefixed directories, in
/// a deterministic order.
fn list_mock_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .map(|name| name.starts_with('.'))
                    .unwrap_or(false)
        })
        .filter_map(Result::ok)
        .filter(|entry| {
            entry.file_type().is_file()
                && entry
                    .path()
                    .extension()
                    .map(|ext| ext == "mock")
                    .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect()
}
