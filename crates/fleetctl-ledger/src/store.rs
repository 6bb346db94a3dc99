//! Ledger — durable record of instances this controller has launched or
//! terminated, one JSON document for all fleets.
//!
//! Every operation takes the store lock, loads the document, mutates it,
//! and writes it back through a temp-file + rename so a crash mid-write
//! never corrupts the previous state. A missing file reads as empty.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

use crate::error::{LedgerError, LedgerResult};
use crate::types::{FleetLedger, InstanceRecord, InstanceStatus, LbInfo, Root};

/// Persistent instance ledger. Cheap to clone paths around; the lock
/// serializes all readers and writers in this process.
pub struct Ledger {
    path: PathBuf,
    mu: Mutex<()>,
}

impl Ledger {
    /// Create a ledger backed by the given file path. The file is created
    /// lazily on first mutation.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mu: Mutex::new(()),
        }
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> LedgerResult<Root> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Root::default()),
            Err(source) => {
                return Err(LedgerError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&data).map_err(|source| LedgerError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, root: &Root) -> LedgerResult<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|source| LedgerError::Write {
                    path: self.path.clone(),
                    source,
                })?;
            }
        }
        let data = serde_json::to_vec_pretty(root).map_err(LedgerError::Encode)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(|source| LedgerError::Write {
            path: tmp.clone(),
            source,
        })?;
        // Rename over the old document; the rename is the commit point.
        std::fs::rename(&tmp, &self.path).map_err(|source| LedgerError::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn with_root<T>(&self, f: impl FnOnce(&mut Root) -> LedgerResult<(T, bool)>) -> LedgerResult<T> {
        let _guard = self
            .mu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut root = self.load()?;
        let (out, dirty) = f(&mut root)?;
        if dirty {
            self.save(&root)?;
        }
        Ok(out)
    }

    /// Append a new Active record for a launched instance.
    pub fn add_active_record(
        &self,
        fleet: &str,
        group: &str,
        id: &str,
        name: &str,
    ) -> LedgerResult<()> {
        let now = Utc::now();
        self.with_root(|root| {
            let fs = root.fleets.entry(fleet.to_string()).or_default();
            fs.fleet_name = fleet.to_string();
            fs.instances.push(InstanceRecord {
                id: id.to_string(),
                group: group.to_string(),
                name: name.to_string(),
                status: InstanceStatus::Active,
                created_at: now,
                updated_at: now,
            });
            fs.updated_at = Some(now);
            Ok(((), true))
        })
    }

    /// Mark the given instance ids Terminated. Ids that are unknown or
    /// already terminated are left untouched.
    pub fn mark_terminated_by_ids(&self, fleet: &str, ids: &[String]) -> LedgerResult<()> {
        let now = Utc::now();
        self.with_root(|root| {
            let fs = root.fleets.entry(fleet.to_string()).or_default();
            fs.fleet_name = fleet.to_string();
            for rec in fs.instances.iter_mut() {
                if rec.status == InstanceStatus::Active && ids.contains(&rec.id) {
                    rec.status = InstanceStatus::Terminated;
                    rec.updated_at = now;
                }
            }
            fs.updated_at = Some(now);
            Ok(((), true))
        })
    }

    /// Up to `k` Active records, newest first (reverse append order). The
    /// append-only sequence position is the total order, so the result is
    /// deterministic for a given document.
    pub fn active_records_lifo(&self, fleet: &str, k: usize) -> LedgerResult<Vec<InstanceRecord>> {
        self.with_root(|root| {
            let recs = root
                .fleets
                .get(fleet)
                .map(|fs| {
                    fs.instances
                        .iter()
                        .rev()
                        .filter(|r| r.status == InstanceStatus::Active)
                        .take(k)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            Ok((recs, false))
        })
    }

    /// Number of Active records tracked for the fleet.
    pub fn count_active(&self, fleet: &str) -> LedgerResult<usize> {
        self.with_root(|root| {
            let n = root
                .fleets
                .get(fleet)
                .map(FleetLedger::count_active)
                .unwrap_or(0);
            Ok((n, false))
        })
    }

    /// Replace the fleet's record set wholesale. Used by state sync when
    /// the cloud is taken as the source of truth; the LB snapshot survives.
    pub fn reset_fleet_active(&self, fleet: &str, records: Vec<InstanceRecord>) -> LedgerResult<()> {
        let now = Utc::now();
        self.with_root(|root| {
            let fs = root.fleets.entry(fleet.to_string()).or_default();
            fs.fleet_name = fleet.to_string();
            fs.instances = records;
            fs.updated_at = Some(now);
            Ok(((), true))
        })
    }

    /// Human-readable summary: active/total plus a per-group breakdown.
    pub fn summary(&self, fleet: &str) -> LedgerResult<String> {
        self.with_root(|root| {
            let empty = FleetLedger::default();
            let fs = root.fleets.get(fleet).unwrap_or(&empty);
            let total = fs.instances.len();
            let active = fs.count_active();
            let mut by_group = std::collections::BTreeMap::<String, usize>::new();
            for rec in &fs.instances {
                if rec.status == InstanceStatus::Active {
                    *by_group.entry(rec.group.clone()).or_default() += 1;
                }
            }
            let updated = fs
                .updated_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            let mut out = format!(
                "Tracked state for fleet {fleet:?}: active={active} total={total} updated={updated}"
            );
            if !by_group.is_empty() {
                out.push_str("\nGroups:");
                for (group, count) in by_group {
                    let _ = write!(out, "\n  - {group}: {count}");
                }
            }
            Ok((out, false))
        })
    }

    // ── Load-balancer snapshot cache ───────────────────────────────

    /// Record the identifiers of the reconciled load balancer.
    pub fn set_lb_info(
        &self,
        fleet: &str,
        enabled: bool,
        id: &str,
        backend_set: &str,
        listener: &str,
    ) -> LedgerResult<()> {
        self.with_root(|root| {
            let fs = root.fleets.entry(fleet.to_string()).or_default();
            fs.fleet_name = fleet.to_string();
            let lb = fs.lb.get_or_insert_with(LbInfo::default);
            lb.enabled = enabled;
            lb.id = id.to_string();
            lb.backend_set = backend_set.to_string();
            lb.listener = listener.to_string();
            lb.updated_at = Utc::now();
            Ok(((), true))
        })
    }

    /// Record the reconciled backend IP list (and its count).
    pub fn set_lb_backends(&self, fleet: &str, ips: Vec<String>) -> LedgerResult<()> {
        self.with_root(|root| {
            let fs = root.fleets.entry(fleet.to_string()).or_default();
            let lb = fs.lb.get_or_insert_with(LbInfo::default);
            lb.backends_count = ips.len();
            lb.backends = ips;
            lb.updated_at = Utc::now();
            Ok(((), true))
        })
    }

    /// Record only the backend count (when the list was not retrievable).
    pub fn set_lb_backends_count(&self, fleet: &str, n: usize) -> LedgerResult<()> {
        self.with_root(|root| {
            let fs = root.fleets.entry(fleet.to_string()).or_default();
            let lb = fs.lb.get_or_insert_with(LbInfo::default);
            lb.backends_count = n;
            lb.updated_at = Utc::now();
            Ok(((), true))
        })
    }

    /// Drop the snapshot entirely (load balancer disabled in config).
    pub fn clear_lb(&self, fleet: &str) -> LedgerResult<()> {
        self.with_root(|root| {
            let Some(fs) = root.fleets.get_mut(fleet) else {
                return Ok(((), false));
            };
            let dirty = fs.lb.take().is_some();
            Ok(((), dirty))
        })
    }

    /// Last recorded LB snapshot, if any.
    pub fn get_lb_info(&self, fleet: &str) -> LedgerResult<Option<LbInfo>> {
        self.with_root(|root| {
            let lb = root.fleets.get(fleet).and_then(|fs| fs.lb.clone());
            Ok((lb, false))
        })
    }
}
