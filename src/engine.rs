//! Engine facade: the one entry point tying every tier together behind a
//! single `INIT -> OPEN -> (STOPPING) -> STOPPED` lifecycle.
//!
//! Which tiers an [`Engine`] actually writes through is decided by
//! [`Strategy`]: `WalOnly`/`WalToPage` land writes in the WAL (rolling to a
//! fresh file and, for `WalToPage`, handing the sealed file to the DROP
//! pool for background conversion into a page); `MemoryOnly`/`MemoryPlusPage`
//! land writes in the in-memory chunk table instead, the latter spilling
//! evicted chunks out to a page rather than discarding them. Reads always
//! fan out across whichever tiers are populated and merge with MEM taking
//! precedence over WAL, which takes precedence over PAGE.
//!
//! A series with a registered step (`set_steps`) also mirrors every accepted
//! write into the by-step grid tier, independent of `strategy`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};

use crate::bystep::ByStepEngine;
use crate::config::EngineConfig;
use crate::dropper::Dropper;
use crate::errors::{EngineError, Result};
use crate::lock::{LockKind, LockManager, Resource};
use crate::manifest::{ManifestState, ManifestStore};
use crate::mem::{EvictionPolicy, MemChunkTable};
use crate::page::{write_page, Page};
use crate::subscribe::{SubscribeNotifier, SubscriptionId};
use crate::threadpool::{PoolKind, ThreadManager};
use crate::types::{Flag, Id, Measurement, StepKind, Strategy, Time, MAX_TIME, MIN_TIME};
use crate::wal::Wal;

/// Outcome of a single `append`/`append_batch` call: how many measurements
/// landed in a tier versus how many were silently dropped (currently only
/// by-step mirroring of a series with no registered step, which is not an
/// error for the primary write).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendOutcome {
    pub written: u64,
    pub ignored: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Init,
    Open,
    Stopping,
    Stopped,
}

/// Shared, `Arc`-owned state so background DROP-pool tasks can outlive the
/// `&self` call that queued them.
struct Shared {
    root: PathBuf,
    chunk_bytes: usize,
    strategy: Strategy,
    manifest: Mutex<ManifestStore>,
    locks: LockManager,
    dropper: Dropper,
    wal: Mutex<Option<Wal>>,
    wal_seq: AtomicU64,
    mem: Mutex<Option<MemChunkTable>>,
    notifier: SubscribeNotifier,
    bystep: ByStepEngine,
}

pub struct Engine {
    state: RwLock<EngineState>,
    config: EngineConfig,
    threads: ThreadManager,
    shared: Arc<Shared>,
}

impl Engine {
    /// Load `config_path` (falling back to built-in defaults, same
    /// precedence as [`crate::config::load`]) and open it.
    ///
    /// # Errors
    /// Same as [`Engine::open`].
    pub fn open_with_config_file(config_path: Option<&std::path::Path>) -> Result<Self> {
        Self::open(crate::config::load(config_path))
    }

    /// Open an engine rooted at `config.root`, creating the directory and a
    /// fresh manifest if none exists, replaying the manifest's WAL/page
    /// inventory otherwise.
    ///
    /// # Errors
    /// Returns an error if the root directory, manifest, WAL, or by-step
    /// store cannot be opened.
    pub fn open(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root)
            .map_err(|e| EngineError::io(config.root.display().to_string(), "create-dir", e))?;

        let manifest = ManifestStore::open(config.root.join("MANIFEST"))?;

        let wal = match config.strategy {
            Strategy::WalOnly | Strategy::WalToPage => {
                let seq = manifest.state().wal_files.len() as u64;
                let name = manifest.state().wal_files.last().cloned().unwrap_or_else(|| format!("{seq:06}.wal"));
                Some(Wal::open(config.root.join(&name), config.wal_cap, config.wal_batch_size)?)
            }
            Strategy::MemoryOnly | Strategy::MemoryPlusPage => None,
        };
        let mem = match config.strategy {
            Strategy::MemoryOnly => {
                Some(MemChunkTable::new(config.chunk_bytes, config.memory_limit, EvictionPolicy::Drop))
            }
            Strategy::MemoryPlusPage => {
                Some(MemChunkTable::new(config.chunk_bytes, config.memory_limit, EvictionPolicy::SpillToPage))
            }
            Strategy::WalOnly | Strategy::WalToPage => None,
        };

        let shared = Arc::new(Shared {
            root: config.root.clone(),
            chunk_bytes: config.chunk_bytes,
            strategy: config.strategy,
            manifest: Mutex::new(manifest),
            locks: LockManager::new(),
            dropper: Dropper::new(config.root.clone(), config.chunk_bytes),
            wal: Mutex::new(wal),
            wal_seq: AtomicU64::new(0),
            mem: Mutex::new(mem),
            notifier: SubscribeNotifier::new(),
            bystep: ByStepEngine::open(config.root.join("bystep.db"))?,
        });

        let threads =
            ThreadManager::new(config.read_pool_capacity, config.drop_pool_capacity, config.common_pool_capacity);

        Ok(Self { state: RwLock::new(EngineState::Open), config, threads, shared })
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.state.read() == EngineState::Open {
            Ok(())
        } else {
            Err(EngineError::NotReady)
        }
    }

    /// Assign the fixed-step kind each series should be mirrored under.
    /// Series absent from `steps` are unaffected by by-step writes.
    pub fn set_steps(&self, steps: HashMap<Id, StepKind>) {
        self.shared.bystep.set_steps(steps);
    }

    /// Register a live subscriber. `ids` empty matches every series, `flag`
    /// zero matches any flag.
    pub fn subscribe(&self, ids: Vec<Id>, flag: Flag) -> (SubscriptionId, Receiver<Measurement>) {
        self.shared.notifier.subscribe(ids, flag)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.notifier.unsubscribe(id);
    }

    /// Accept one measurement into the primary tier selected by `strategy`,
    /// mirror it into the by-step tier if `m.id` has a registered step, and
    /// notify subscribers.
    ///
    /// # Errors
    /// Returns `NotReady` if the engine isn't open, or propagates an I/O
    /// failure from the active WAL append.
    pub fn append(&self, m: Measurement) -> Result<AppendOutcome> {
        self.ensure_open()?;
        self.write_primary(m)?;
        if self.shared.bystep.append(m).is_err() {
            // id has no registered step; by-step mirroring simply doesn't apply.
        }
        self.shared.notifier.notify(m);
        Ok(AppendOutcome { written: 1, ignored: 0 })
    }

    /// Accept a batch of measurements one at a time. Stops and propagates
    /// the error on the first I/O failure or if the engine isn't open;
    /// otherwise accumulates `written`/`ignored` counts (ignored is
    /// currently always zero since a missing by-step registration never
    /// rejects the primary write).
    ///
    /// # Errors
    /// Returns `NotReady` or propagates an I/O failure, same as `append`.
    pub fn append_batch(&self, measurements: impl IntoIterator<Item = Measurement>) -> Result<AppendOutcome> {
        let mut outcome = AppendOutcome::default();
        for m in measurements {
            let got = self.append(m)?;
            outcome.written += got.written;
            outcome.ignored += got.ignored;
        }
        Ok(outcome)
    }

    fn write_primary(&self, m: Measurement) -> Result<()> {
        match self.shared.strategy {
            Strategy::WalOnly | Strategy::WalToPage => self.write_to_wal(m),
            Strategy::MemoryOnly | Strategy::MemoryPlusPage => self.write_to_mem(m),
        }
    }

    fn write_to_wal(&self, m: Measurement) -> Result<()> {
        let _guard = self.shared.locks.lock(LockKind::Write, &[Resource::Wal]);
        let mut slot = self.shared.wal.lock();
        let wal = slot.as_mut().expect("wal-based strategy always holds a Wal");
        wal.append(&m)?;
        if !wal.is_sealed() {
            return Ok(());
        }

        wal.flush()?;
        let sealed_path = wal.path().to_path_buf();
        let seq = self.shared.wal_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let new_name = format!("{seq:06}.wal");
        let new_wal = Wal::open(self.shared.root.join(&new_name), self.config.wal_cap, self.config.wal_batch_size)?;
        *slot = Some(new_wal);
        drop(slot);
        self.shared.manifest.lock().add_wal(new_name)?;

        if self.shared.strategy == Strategy::WalToPage {
            let shared = self.shared.clone();
            self.threads.submit(PoolKind::Drop, move || {
                let mut manifest = shared.manifest.lock();
                if let Err(e) = shared.dropper.drop_wal(&sealed_path, &mut manifest, &shared.locks) {
                    log::warn!("background drop of {} failed: {e}", sealed_path.display());
                }
            });
        }
        Ok(())
    }

    fn write_to_mem(&self, m: Measurement) -> Result<()> {
        let _guard = self.shared.locks.lock(LockKind::Write, &[Resource::Mem]);
        let mut slot = self.shared.mem.lock();
        let mem = slot.as_mut().expect("mem-based strategy always holds a MemChunkTable");
        let spilled = mem.append(m)?;
        drop(slot);
        if spilled.is_empty() {
            return Ok(());
        }
        let measurements: Vec<Measurement> =
            spilled.iter().filter_map(|c| c.reader("mem-evict").ok()).flatten().collect();
        self.spill_to_page(&measurements)
    }

    fn spill_to_page(&self, measurements: &[Measurement]) -> Result<()> {
        if measurements.is_empty() {
            return Ok(());
        }
        let _guard = self.shared.locks.lock(LockKind::Write, &[Resource::Page]);
        let seq = self.shared.wal_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let stem = format!("{seq:06}-spill");
        let page_path = self.shared.root.join(format!("{stem}.page"));
        let index_path = self.shared.root.join(format!("{stem}.pagei"));
        write_page(&page_path, &index_path, measurements, self.shared.chunk_bytes, 1)?;
        self.shared.manifest.lock().add_page(format!("{stem}.page"))
    }

    /// Run each job on the READ pool and collect results in submission
    /// order, blocking until every one completes. Every tier scan
    /// (`interval`/`time_point_raw`/`min_max_time`) fans out through this so
    /// mem/wal/page are scanned concurrently instead of on the calling
    /// thread.
    fn fan_out_read<T: Send + 'static>(&self, jobs: Vec<Box<dyn FnOnce() -> T + Send>>) -> Vec<T> {
        let mut slots = Vec::with_capacity(jobs.len());
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
            let slot2 = slot.clone();
            handles.push(self.threads.submit(PoolKind::Read, move || {
                *slot2.lock() = Some(job());
            }));
            slots.push(slot);
        }
        for h in handles {
            h.wait();
        }
        slots.into_iter().map(|s| s.lock().take().expect("read task completed before wait() returned")).collect()
    }

    /// Closed-interval scan across every populated tier, merged with
    /// MEM > WAL > PAGE precedence at equal `(id, time)`. The per-tier scans
    /// are fanned out to the READ pool and joined before merging.
    ///
    /// # Errors
    /// Returns `NotReady` or propagates a tier read failure.
    pub fn interval(&self, ids: &[Id], flag: Flag, from: Time, to: Time) -> Result<Vec<Measurement>> {
        self.ensure_open()?;
        let _guard = self.shared.locks.lock(LockKind::Read, &[Resource::Wal, Resource::Page, Resource::Mem]);

        let ids_owned = ids.to_vec();
        let mut jobs: Vec<Box<dyn FnOnce() -> (u8, Result<Vec<Measurement>>) + Send>> = Vec::new();

        if self.shared.mem.lock().is_some() {
            let shared = self.shared.clone();
            let ids_owned = ids_owned.clone();
            jobs.push(Box::new(move || {
                let out =
                    shared.mem.lock().as_ref().map_or_else(Vec::new, |mem| mem.interval(&ids_owned, flag, from, to));
                (0, Ok(out))
            }));
        }
        if self.shared.wal.lock().is_some() {
            let shared = self.shared.clone();
            let ids_owned = ids_owned.clone();
            jobs.push(Box::new(move || {
                let out = shared.wal.lock().as_mut().expect("checked Some above").scan(&ids_owned, flag, from, to);
                (1, out)
            }));
        }
        for name in self.shared.manifest.lock().state().page_files.clone() {
            let shared = self.shared.clone();
            let ids_owned = ids_owned.clone();
            jobs.push(Box::new(move || {
                let stem = name.trim_end_matches(".page");
                let out = Page::open(shared.root.join(&name), shared.root.join(format!("{stem}.pagei")))
                    .and_then(|p| p.interval(&ids_owned, flag, from, to));
                (2, out)
            }));
        }

        let mut ranked: HashMap<(Id, Time), (u8, Measurement)> = HashMap::new();
        let mut consider = |rank: u8, ms: Vec<Measurement>| {
            for m in ms {
                ranked
                    .entry((m.id, m.time))
                    .and_modify(|(r, slot)| {
                        if rank < *r {
                            *r = rank;
                            *slot = m;
                        }
                    })
                    .or_insert((rank, m));
            }
        };
        for (rank, res) in self.fan_out_read(jobs) {
            consider(rank, res?);
        }

        let mut out: Vec<Measurement> = ranked.into_values().map(|(_, m)| m).collect();
        out.sort_by_key(|m| (m.id, m.time));
        Ok(out)
    }

    /// Latest sample per id with `time <= tp`, merged across populated
    /// tiers with the same MEM > WAL > PAGE precedence as `interval`. Ids
    /// with nothing recorded are simply absent from the map.
    ///
    /// # Errors
    /// Returns `NotReady` or propagates a tier read failure.
    pub fn current_value(&self, ids: &[Id], flag: Flag) -> Result<HashMap<Id, Measurement>> {
        self.time_point_raw(ids, flag, MAX_TIME)
    }

    /// Like `current_value` but bounded at `tp`, and fills every requested
    /// id with a `NO_DATA` placeholder if nothing qualifies.
    ///
    /// # Errors
    /// Returns `NotReady` or propagates a tier read failure.
    pub fn time_point(&self, ids: &[Id], flag: Flag, tp: Time) -> Result<HashMap<Id, Measurement>> {
        let mut out = self.time_point_raw(ids, flag, tp)?;
        for &id in ids {
            out.entry(id).or_insert_with(|| Measurement::no_data(id, tp));
        }
        Ok(out)
    }

    fn time_point_raw(&self, ids: &[Id], flag: Flag, tp: Time) -> Result<HashMap<Id, Measurement>> {
        self.ensure_open()?;
        let _guard = self.shared.locks.lock(LockKind::Read, &[Resource::Wal, Resource::Page, Resource::Mem]);

        let ids_owned = ids.to_vec();
        let mut jobs: Vec<Box<dyn FnOnce() -> (u8, Result<HashMap<Id, Measurement>>) + Send>> = Vec::new();

        if self.shared.mem.lock().is_some() {
            let shared = self.shared.clone();
            let ids_owned = ids_owned.clone();
            jobs.push(Box::new(move || {
                let out = shared.mem.lock().as_ref().map_or_else(HashMap::new, |mem| mem.time_point(&ids_owned, flag, tp));
                (0, Ok(out))
            }));
        }
        if self.shared.wal.lock().is_some() {
            let shared = self.shared.clone();
            let ids_owned = ids_owned.clone();
            jobs.push(Box::new(move || {
                let out = shared.wal.lock().as_mut().expect("checked Some above").scan(&ids_owned, flag, MIN_TIME, tp).map(
                    |scanned| {
                        let mut latest: HashMap<Id, Measurement> = HashMap::new();
                        for m in scanned {
                            latest
                                .entry(m.id)
                                .and_modify(|slot: &mut Measurement| if m.time > slot.time { *slot = m })
                                .or_insert(m);
                        }
                        latest
                    },
                );
                (1, out)
            }));
        }
        for name in self.shared.manifest.lock().state().page_files.clone() {
            let shared = self.shared.clone();
            let ids_owned = ids_owned.clone();
            jobs.push(Box::new(move || {
                let stem = name.trim_end_matches(".page");
                let out = Page::open(shared.root.join(&name), shared.root.join(format!("{stem}.pagei")))
                    .and_then(|p| p.time_point(&ids_owned, flag, tp));
                (2, out)
            }));
        }

        let mut best: HashMap<Id, (u8, Measurement)> = HashMap::new();
        let mut consider = |rank: u8, candidates: HashMap<Id, Measurement>| {
            for (id, m) in candidates {
                best.entry(id)
                    .and_modify(|(r, slot)| {
                        if rank < *r || (rank == *r && m.time > slot.time) {
                            *r = rank;
                            *slot = m;
                        }
                    })
                    .or_insert((rank, m));
            }
        };
        for (rank, res) in self.fan_out_read(jobs) {
            consider(rank, res?);
        }

        Ok(best.into_iter().map(|(id, (_, m))| (id, m)).collect())
    }

    /// The observed `[min, max]` time range for `id` across every populated
    /// tier.
    ///
    /// # Errors
    /// Returns `NotReady` or propagates a tier read failure.
    pub fn min_max_time(&self, id: Id) -> Result<Option<(Time, Time)>> {
        self.ensure_open()?;
        let _guard = self.shared.locks.lock(LockKind::Read, &[Resource::Wal, Resource::Page, Resource::Mem]);

        let mut jobs: Vec<Box<dyn FnOnce() -> Result<Option<(Time, Time)>> + Send>> = Vec::new();

        if self.shared.mem.lock().is_some() {
            let shared = self.shared.clone();
            jobs.push(Box::new(move || Ok(shared.mem.lock().as_ref().and_then(|mem| mem.min_max_time(id)))));
        }
        if self.shared.wal.lock().is_some() {
            let shared = self.shared.clone();
            jobs.push(Box::new(move || shared.wal.lock().as_mut().expect("checked Some above").min_max_time(id)));
        }
        for name in self.shared.manifest.lock().state().page_files.clone() {
            let shared = self.shared.clone();
            jobs.push(Box::new(move || {
                let stem = name.trim_end_matches(".page");
                let page = Page::open(shared.root.join(&name), shared.root.join(format!("{stem}.pagei")))?;
                if !page.might_contain_any(&[id]) {
                    return Ok(None);
                }
                let samples = page.interval(&[id], 0, MIN_TIME, MAX_TIME)?;
                Ok(samples.iter().map(|m| m.time).min().map(|lo| {
                    let hi = samples.iter().map(|m| m.time).max().unwrap_or(lo);
                    (lo, hi)
                }))
            }));
        }

        let mut acc: Option<(Time, Time)> = None;
        for res in self.fan_out_read(jobs) {
            if let Some((lo, hi)) = res? {
                acc = Some(acc.map_or((lo, hi), |(alo, ahi)| (alo.min(lo), ahi.max(hi))));
            }
        }
        Ok(acc)
    }

    /// Guarantee every accepted append up to this call is durable in at
    /// least one tier. A no-op for `MemoryOnly`, which by design keeps no
    /// durable copy; `MemoryPlusPage` force-spills its whole in-memory
    /// table to a page.
    ///
    /// # Errors
    /// Propagates an I/O failure from the active WAL or the forced spill.
    pub fn flush(&self) -> Result<()> {
        match self.shared.strategy {
            Strategy::WalOnly | Strategy::WalToPage => {
                if let Some(wal) = self.shared.wal.lock().as_mut() {
                    wal.flush()?;
                }
            }
            Strategy::MemoryOnly => {}
            Strategy::MemoryPlusPage => {
                let snapshot = self.shared.mem.lock().as_ref().map(MemChunkTable::snapshot_all).unwrap_or_default();
                self.spill_to_page(&snapshot)?;
            }
        }
        self.shared.bystep.flush();
        Ok(())
    }

    /// Rebuild the manifest from a directory scan, logging and dropping any
    /// page whose index trailer disagrees with its own record count.
    ///
    /// # Errors
    /// Propagates an I/O failure while scanning the root directory.
    pub fn fsck(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.shared.locks.lock_all_write();

        let mut wal_files = Vec::new();
        let mut page_files = Vec::new();
        for entry in std::fs::read_dir(&self.shared.root)
            .map_err(|e| EngineError::io(self.shared.root.display().to_string(), "read-dir", e))?
        {
            let entry = entry.map_err(|e| EngineError::io(self.shared.root.display().to_string(), "read-dir", e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".wal") {
                wal_files.push(name);
            } else if name.ends_with(".page") {
                let stem = name.trim_end_matches(".page");
                let index_path = self.shared.root.join(format!("{stem}.pagei"));
                match Page::open(entry.path(), &index_path).and_then(|p| Ok((p.verify_trailers_agree()?, p))) {
                    Ok((true, _)) => page_files.push(name),
                    Ok((false, _)) => log::warn!("fsck: dropping {name}, page/index trailers disagree"),
                    Err(e) => log::warn!("fsck: dropping unreadable page {name}: {e}"),
                }
            }
        }
        wal_files.sort();
        page_files.sort();

        let state = ManifestState { schema_version: crate::manifest::SCHEMA_VERSION, wal_files, page_files };
        self.shared.manifest.lock().replace(state)
    }

    /// Merge every page overlapping `[from, to]` into one. Returns the new
    /// page's name, or `None` if fewer than two pages actually overlapped.
    ///
    /// # Errors
    /// Propagates an I/O failure from reading or writing a page, or a
    /// manifest persist failure.
    pub fn compact_by_time(&self, from: Time, to: Time) -> Result<Option<String>> {
        self.ensure_open()?;
        let page_names = self.shared.manifest.lock().state().page_files.clone();
        let mut manifest = self.shared.manifest.lock();
        self.shared.dropper.compact(&page_names, from, to, &mut manifest, &self.shared.locks)
    }

    /// Enter `STOPPING`, flush every durable tier, drain the by-step store,
    /// and join every worker thread. The engine is unusable afterward.
    ///
    /// # Errors
    /// Propagates a flush failure; the engine is still marked `STOPPED`
    /// regardless, matching the fact that shutdown cannot be retried.
    pub fn stop(self) -> Result<()> {
        *self.state.write() = EngineState::Stopping;
        let flushed = self.flush();
        *self.state.write() = EngineState::Stopped;
        self.threads.shutdown();
        flushed
    }
}
