//! Namespace watcher maintaining the tenant list for one cluster
//!
//! The watcher is a background actor consuming namespace watch events plus a
//! resync ticker. It keeps a filtered, lexicographically sorted tenant list
//! and derives the `X-Scope-OrgID` scope header from it. The tenant slice is
//! only mutated inside the actor; readers take a shared lock and receive
//! defensive copies.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TenantsConfig;
use crate::error::Error;

/// Include/exclude regex pair applied to namespace names.
///
/// A name is admitted iff the include list is empty or at least one include
/// matches, and no exclude matches.
#[derive(Debug)]
pub struct TenantFilter {
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
}

impl TenantFilter {
    /// Compile the configured patterns. Compilation failures are fatal for
    /// the watcher being constructed.
    pub fn compile(cfg: &TenantsConfig) -> Result<TenantFilter, Error> {
        let compile = |patterns: &[String], kind: &str| -> Result<Vec<Regex>, Error> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        Error::config(format!("invalid {kind} pattern {p:?}: {e}"))
                    })
                })
                .collect()
        };

        Ok(TenantFilter {
            includes: compile(&cfg.include_patterns, "include")?,
            excludes: compile(&cfg.exclude_patterns, "exclude")?,
        })
    }

    /// Whether a namespace name passes the filter pair.
    pub fn admits(&self, name: &str) -> bool {
        if !self.includes.is_empty() && !self.includes.iter().any(|re| re.is_match(name)) {
            return false;
        }
        !self.excludes.iter().any(|re| re.is_match(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle state of a watcher.
pub enum WatcherState {
    /// Constructed but no background actor running
    NotStarted,
    /// Background actor consuming events
    Running,
    /// Stopped; never re-enters `Running`
    Stopped,
}

/// Per-cluster namespace watcher.
pub struct TenantWatcher {
    cluster: String,
    filter: TenantFilter,
    refresh_interval: Duration,
    client: kube::Client,
    tenants: RwLock<Vec<String>>,
    state: Mutex<WatcherState>,
    synced: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TenantWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantWatcher")
            .field("cluster", &self.cluster)
            .field("filter", &self.filter)
            .field("refresh_interval", &self.refresh_interval)
            .field("state", &self.state)
            .field("synced", &self.synced)
            .finish_non_exhaustive()
    }
}

impl TenantWatcher {
    /// Create a watcher for one cluster. Patterns are compiled here; a bad
    /// pattern fails construction.
    pub fn new(
        cluster: impl Into<String>,
        client: kube::Client,
        cfg: &TenantsConfig,
    ) -> Result<TenantWatcher, Error> {
        let cluster = cluster.into();
        if cluster.is_empty() {
            return Err(Error::config("cluster name is required"));
        }

        Ok(TenantWatcher {
            cluster,
            filter: TenantFilter::compile(cfg)?,
            refresh_interval: cfg.refresh_interval(),
            client,
            tenants: RwLock::new(Vec::new()),
            state: Mutex::new(WatcherState::NotStarted),
            synced: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WatcherState {
        *self.state.lock().expect("watcher state lock poisoned")
    }

    /// Whether the initial namespace snapshot has been processed.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Launch the background actor. A watcher can be started once; calling
    /// this on a running or stopped watcher is a logged no-op.
    pub fn start_async(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("watcher state lock poisoned");
            if *state != WatcherState::NotStarted {
                warn!(cluster = %self.cluster, state = ?*state, "tenant watcher already started");
                return;
            }
            *state = WatcherState::Running;
        }

        info!(
            cluster = %self.cluster,
            refresh_interval_secs = self.refresh_interval.as_secs(),
            include_patterns = self.filter.includes.len(),
            exclude_patterns = self.filter.excludes.len(),
            "starting tenant watcher"
        );

        let watcher = self.clone();
        tokio::spawn(async move { watcher.run().await });
    }

    /// Stop the watcher. Idempotent; a stopped watcher never restarts.
    pub fn stop(&self) {
        let mut state = self.state.lock().expect("watcher state lock poisoned");
        if *state != WatcherState::Stopped {
            debug!(cluster = %self.cluster, "stopping tenant watcher");
            *state = WatcherState::Stopped;
        }
        self.cancel.cancel();
    }

    /// Current tenant list, copied so callers cannot mutate watcher state.
    pub fn tenants(&self) -> Vec<String> {
        self.tenants
            .read()
            .expect("tenant list lock poisoned")
            .clone()
    }

    /// Number of tenants currently known.
    pub fn tenant_count(&self) -> usize {
        self.tenants.read().expect("tenant list lock poisoned").len()
    }

    /// Replace the tenant set from a full namespace snapshot: filter, sort,
    /// and swap under the write lock.
    pub fn refresh_from_snapshot<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let snapshot: BTreeSet<String> = names
            .into_iter()
            .map(|n| n.as_ref().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        self.refresh(&snapshot);
    }

    /// Build the scope header under the configured byte cap; `max_len` 0
    /// means no cap. Emits a warning when truncation was required.
    pub fn build_scope_header(&self, max_len: usize) -> String {
        let tenants = self.tenants();
        if tenants.is_empty() {
            return String::new();
        }

        let joined = tenants.join("|");
        if max_len == 0 || joined.len() <= max_len {
            return joined;
        }

        let truncated = truncate_scope_header(&tenants, max_len);
        warn!(
            cluster = %self.cluster,
            total_tenants = tenants.len(),
            header_length = joined.len(),
            max_length = max_len,
            truncated_length = truncated.len(),
            "X-Scope-OrgID header truncated due to length limit"
        );
        truncated
    }

    async fn run(self: Arc<Self>) {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        let start = tokio::time::Instant::now() + self.refresh_interval;
        let mut resync = tokio::time::interval_at(start, self.refresh_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Known namespace names, mirrored from the watch subscription. The
        // actor owns both sets; only the published tenant slice is shared.
        let mut known: BTreeSet<String> = BTreeSet::new();
        let mut pending: BTreeSet<String> = BTreeSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = resync.tick() => {
                    if self.has_synced() {
                        self.refresh(&known);
                    }
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => self.handle_event(event, &mut known, &mut pending),
                    Some(Err(e)) => {
                        // Prior tenant set is retained on listing errors.
                        warn!(cluster = %self.cluster, error = %e, "namespace watch error");
                    }
                    None => {
                        warn!(cluster = %self.cluster, "namespace watch stream ended");
                        break;
                    }
                },
            }
        }

        self.stop();
        debug!(cluster = %self.cluster, "tenant watcher exited");
    }

    fn handle_event(
        &self,
        event: watcher::Event<Namespace>,
        known: &mut BTreeSet<String>,
        pending: &mut BTreeSet<String>,
    ) {
        match event {
            watcher::Event::Init => pending.clear(),
            watcher::Event::InitApply(ns) => {
                if let Some(name) = ns.metadata.name {
                    if !name.is_empty() {
                        pending.insert(name);
                    }
                }
            }
            watcher::Event::InitDone => {
                *known = std::mem::take(pending);
                let first_sync = !self.synced.swap(true, Ordering::AcqRel);
                if first_sync {
                    info!(cluster = %self.cluster, "tenant watcher cache synced");
                }
                self.refresh(known);
            }
            watcher::Event::Apply(ns) => {
                let Some(name) = ns.metadata.name else { return };
                if name.is_empty() {
                    return;
                }
                // Refresh only when the name set changed; modified namespaces
                // with an unchanged name leave the tenant set as-is.
                if known.insert(name) {
                    self.refresh(known);
                }
            }
            watcher::Event::Delete(ns) => {
                let Some(name) = ns.metadata.name else { return };
                if known.remove(&name) {
                    self.refresh(known);
                }
            }
        }
    }

    fn refresh(&self, known: &BTreeSet<String>) {
        let tenants: Vec<String> = known
            .iter()
            .filter(|name| self.filter.admits(name))
            .cloned()
            .collect();

        let old_count;
        {
            let mut slot = self.tenants.write().expect("tenant list lock poisoned");
            old_count = slot.len();
            *slot = tenants;
        }

        let new_count = self.tenant_count();
        if old_count != new_count {
            info!(
                cluster = %self.cluster,
                tenant_count = new_count,
                "tenant list updated"
            );
        }
    }
}

/// Truncate the pipe-joined tenant list to at most `max_len` bytes, keeping
/// the largest whole-tenant prefix. A first tenant that alone exceeds the cap
/// is cut to its first `max_len` bytes.
fn truncate_scope_header(tenants: &[String], max_len: usize) -> String {
    let mut result = String::new();
    for (i, tenant) in tenants.iter().enumerate() {
        if i == 0 {
            if tenant.len() > max_len {
                return tenant[..max_len].to_string();
            }
        } else if result.len() + 1 + tenant.len() > max_len {
            break;
        } else {
            result.push('|');
        }
        result.push_str(tenant);
    }
    result
}
