//! Hot-reloadable hostname table
//!
//! The hosts file maps hostnames to backends:
//!
//! ```text
//! # comment
//! .example.com                 # following labels get this suffix
//! www localhost:8080
//! admin localhost:9000 user:pass
//! *.ops localhost:9100
//! .                            # clear the suffix
//! other.net localhost:8081
//! ```
//!
//! Literal names go straight into an exact index. Glob names are kept as
//! ordered rules; the first rule that matches a hostname wins and the
//! answer is memoized into the exact index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::acme::HostPolicy;
use crate::error::{ForwardError, Result};
use crate::hosts::HostConfig;
use crate::matcher::{is_glob, is_valid_domain, DomainMatcher};

/// Default cap on glob-resolved names memoized per snapshot
pub const DEFAULT_MEMO_LIMIT: usize = 10_000;

/// One glob rule from the hosts file
#[derive(Debug)]
struct GlobRule {
    matcher: DomainMatcher,
    config: Arc<HostConfig>,
}

/// A complete parse of the hosts file
#[derive(Debug, Default)]
struct HostTable {
    exact: HashMap<String, Arc<HostConfig>>,
    globs: Vec<GlobRule>,
    memoized: usize,
}

impl HostTable {
    /// Parse hosts-file text. Bad lines are logged and skipped.
    fn parse(text: &str, placeholders: &[String]) -> Self {
        let mut table = HostTable::default();
        let mut suffix = String::new();

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.split('#').next().unwrap_or("");
            let fields: Vec<&str> = line.split_whitespace().collect();

            if fields.len() == 1 && fields[0].starts_with('.') {
                if fields[0] == "." {
                    debug!(line = line_no, "Suffix reset");
                    suffix.clear();
                } else {
                    debug!(line = line_no, suffix = fields[0], "Suffix set");
                    suffix = fields[0].to_string();
                }
                continue;
            }

            match fields.len() {
                0 => continue,
                2 | 3 => {}
                n => {
                    warn!(line = line_no, fields = n, "Skipping line with unexpected field count");
                    continue;
                }
            }

            let qualified = format!("{}{}", fields[0], suffix);
            if !is_valid_domain(&qualified) {
                warn!(line = line_no, domain = %qualified, "Skipping invalid domain");
                continue;
            }

            let config = match HostConfig::new(fields[1], fields.get(2).copied()) {
                Ok(config) => config,
                Err(e) => {
                    warn!(line = line_no, domain = %qualified, "Skipping entry: {}", e);
                    continue;
                }
            };

            debug!(
                domain = %qualified,
                target = config.target(),
                auth = config.requires_auth(),
                "Registered host"
            );
            table.register(qualified, Arc::new(config));
        }

        for host in placeholders {
            if is_valid_domain(host) && !is_glob(host) {
                table.register(host.clone(), Arc::new(HostConfig::placeholder()));
            } else {
                warn!(domain = %host, "Skipping invalid placeholder host");
            }
        }

        table
    }

    fn register(&mut self, domain: String, config: Arc<HostConfig>) {
        if is_glob(&domain) {
            self.globs.push(GlobRule {
                matcher: DomainMatcher::compile(&domain),
                config,
            });
        } else if self.exact.contains_key(&domain) {
            warn!(domain = %domain, "Duplicate host, keeping first entry");
        } else {
            self.exact.insert(domain, config);
        }
    }

    fn match_glob(&self, host: &str) -> Option<Arc<HostConfig>> {
        self.globs
            .iter()
            .find(|rule| rule.matcher.test(host))
            .map(|rule| rule.config.clone())
    }
}

/// Thread-safe, hot-reloadable hostname → [`HostConfig`] store
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    placeholders: Vec<String>,
    memo_limit: usize,
    table: RwLock<HostTable>,
}

impl ConfigStore {
    /// Create an empty store with no backing file
    pub fn new(placeholders: Vec<String>, memo_limit: usize) -> Self {
        Self {
            path: None,
            placeholders,
            memo_limit,
            table: RwLock::new(HostTable::default()),
        }
    }

    /// Create a store and load it from `path`; failure is fatal to the caller
    pub fn open(path: impl Into<PathBuf>, placeholders: Vec<String>, memo_limit: usize) -> Result<Self> {
        let mut store = Self::new(placeholders, memo_limit);
        let path = path.into();
        store.load(&path)?;
        store.path = Some(path);
        Ok(store)
    }

    /// Read and parse a hosts file, then swap it in.
    ///
    /// On error the current table is left untouched.
    pub fn load(&self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ForwardError::Config(format!("Failed to read hosts file {}: {}", path.display(), e))
        })?;
        self.load_str(&text);
        info!(path = %path.display(), "Hosts file loaded");
        Ok(())
    }

    /// Parse hosts-file text and swap it in
    pub fn load_str(&self, text: &str) {
        let table = HostTable::parse(text, &self.placeholders);
        info!(
            exact = table.exact.len(),
            globs = table.globs.len(),
            "Host table built"
        );
        *self.write() = table;
    }

    /// Reload from the file this store was opened with
    pub fn reload(&self) -> Result<()> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| ForwardError::Config("Store has no hosts file to reload".to_string()))?;
        self.load(path)
    }

    /// Resolve a hostname.
    ///
    /// Exact entries are answered under the read lock. On a miss, glob
    /// rules are scanned under the write lock and a match is memoized.
    pub fn lookup(&self, host: &str) -> Option<Arc<HostConfig>> {
        if let Some(config) = self.read().exact.get(host) {
            return Some(config.clone());
        }

        let mut table = self.write();
        // a reload or another lookup may have run since the read lock was dropped
        if let Some(config) = table.exact.get(host) {
            return Some(config.clone());
        }

        let config = table.match_glob(host)?;
        if table.memoized < self.memo_limit {
            table.exact.insert(host.to_string(), config.clone());
            table.memoized += 1;
        } else {
            debug!(host, "Memo limit reached, not caching glob match");
        }
        Some(config)
    }

    /// Number of hostnames answerable without a glob scan
    pub fn exact_len(&self) -> usize {
        self.read().exact.len()
    }

    // The table is only ever replaced whole, so a poisoned lock still holds a
    // consistent value.
    fn read(&self) -> RwLockReadGuard<'_, HostTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HostTable> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Certificates are only obtained for names the store can route
impl HostPolicy for ConfigStore {
    fn authorize_host(&self, host: &str) -> Result<()> {
        match self.lookup(host) {
            Some(_) => {
                debug!(host, "Allowing certificate");
                Ok(())
            }
            None => Err(ForwardError::HostDenied {
                host: host.to_string(),
            }),
        }
    }
}
