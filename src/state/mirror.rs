use crate::state::{Site, SiteHealth, StateDoc};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Agent-local cache of the last controller-pushed state, plus the per-site
/// error map the reconciliation pipeline fills in.
///
/// The document is swapped wholesale on every push; subscribers get a
/// content-free "changed" signal and read the snapshot themselves.
pub struct StateMirror {
    doc: ArcSwap<StateDoc>,
    site_errors: Mutex<HashMap<String, Option<String>>>,
    changed_tx: broadcast::Sender<u64>,
}

impl Default for StateMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMirror {
    pub fn new() -> Self {
        let (changed_tx, _) = broadcast::channel(16);
        Self {
            doc: ArcSwap::new(Arc::new(StateDoc::default())),
            site_errors: Mutex::new(HashMap::new()),
            changed_tx,
        }
    }

    pub fn snapshot(&self) -> Arc<StateDoc> {
        self.doc.load_full()
    }

    pub fn version(&self) -> u64 {
        self.doc.load().version
    }

    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.changed_tx.subscribe()
    }

    /// Swap in a freshly pushed document and notify subscribers.
    pub fn replace_state(&self, doc: StateDoc) {
        let version = doc.version;
        self.doc.store(Arc::new(doc));
        let _ = self.changed_tx.send(version);
    }

    /// Site whose primary or alias matches `domain`.
    pub fn get_site(&self, domain: &str) -> Option<Site> {
        self.doc.load().find_site(domain).cloned()
    }

    /// Record the outcome of the last pipeline pass for one site.
    pub fn set_site_health(&self, domain: &str, error: Option<String>) {
        self.site_errors
            .lock()
            .unwrap()
            .insert(domain.to_string(), error);
    }

    /// Reset the error map to the currently known sites, all healthy.
    /// Called at the start of every sync so stale entries for removed
    /// sites disappear.
    pub fn reset_site_health(&self) {
        let doc = self.doc.load();
        let mut map = self.site_errors.lock().unwrap();
        map.clear();
        for site in &doc.sites {
            map.insert(site.domain.clone(), None);
        }
    }

    pub fn get_site_health(&self, domain: &str) -> Option<String> {
        self.site_errors
            .lock()
            .unwrap()
            .get(domain)
            .cloned()
            .flatten()
    }

    /// Current health of every known site, sorted by domain for stable
    /// reporting.
    pub fn all_site_health(&self) -> Vec<SiteHealth> {
        let map = self.site_errors.lock().unwrap();
        let mut out: Vec<SiteHealth> = map
            .iter()
            .map(|(domain, error)| SiteHealth {
                domain: domain.clone(),
                error: error.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.domain.cmp(&b.domain));
        out
    }
}
