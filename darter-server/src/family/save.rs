//! Snapshot orchestration: `DoSave`, boot load, and scheduled saves.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use darter_common::error::{DarterError, DarterResult};
use darter_core::command::{CommandFrame, CommandReply};
use darter_core::db_slice::{DbSlice, SliceRecord};
use darter_core::registry::{CommandFlags, CommandId};
use darter_storage::files::{LoadSource, create_dirs, extend_filename};
use darter_storage::rdb::{LoadStats, RdbLoader, RdbSaver, RdbTypeFreqMap};
use darter_transaction::coordinator::update_error;
use tracing::{error, info, warn};

use crate::server_state::{GlobalState, GlobalStateOwner, global_state_name};

use super::{ServerFamily, schedule::SnapshotSpec, unix_time_ms, unix_time_secs};

/// Result of the most recent successful save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastSaveInfo {
    /// Unix seconds the save completed at (startup time before any save).
    pub save_time: u64,
    /// Path of the written file (shard 0's file for per-shard saves).
    pub file_name: String,
    /// Serialized value-type histogram, sorted by type name.
    pub freq_map: Vec<(String, u64)>,
}

/// Save failure carrying the user-facing detail prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveError {
    /// Error code propagated to the caller.
    pub code: DarterError,
    /// Detail prefix (for example `create-dir `), possibly empty.
    pub details: String,
}

impl SaveError {
    fn plain(code: DarterError) -> Self {
        Self {
            code,
            details: String::new(),
        }
    }

    /// The reply text: detail prefix followed by the error message.
    #[must_use]
    pub fn message(&self) -> String {
        format!("{}{}", self.details, self.code)
    }
}

/// Restores `Saving → Active` on every exit path.
struct SavingStateGuard<'a>(&'a GlobalStateOwner);

impl Drop for SavingStateGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.switch_state(GlobalState::Saving, GlobalState::Active);
    }
}

/// One snapshot output file: handle, saver, and its type histogram.
struct RdbSnapshot {
    saver: RdbSaver<BufWriter<File>>,
    freq_map: RdbTypeFreqMap,
    started: bool,
}

impl RdbSnapshot {
    fn open(path: &Path, single_shard: bool) -> DarterResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|error| DarterError::io(&error))?;
        Ok(Self {
            saver: RdbSaver::new(BufWriter::new(file), single_shard),
            freq_map: RdbTypeFreqMap::new(),
            started: false,
        })
    }

    fn start(&mut self, scripts: &[String]) -> DarterResult<()> {
        self.saver.save_header(scripts)
    }

    fn start_in_shard(&mut self, slice: &DbSlice, now_ms: u64) {
        self.saver.start_snapshot_in_shard(slice, now_ms);
        self.started = true;
    }

    fn has_started(&self) -> bool {
        self.started
    }

    fn save_body(&mut self) -> DarterResult<()> {
        let mut freq_map = std::mem::take(&mut self.freq_map);
        let result = self.saver.save_body(&mut freq_map);
        self.freq_map = freq_map;
        result
    }

    fn close(self) -> (DarterResult<()>, RdbTypeFreqMap) {
        let result = self
            .saver
            .into_sink()
            .into_inner()
            .map_err(|error| DarterError::io(error.error()))
            .and_then(|file| file.sync_all().map_err(|error| DarterError::io(&error)));
        (result, self.freq_map)
    }
}

type SnapshotSlots = Arc<Vec<Mutex<Option<RdbSnapshot>>>>;

fn save_cid() -> CommandId {
    CommandId::new("SAVE", CommandFlags::ADMIN | CommandFlags::GLOBAL_TRANS, -1)
}

fn run_snapshot_slot(
    snapshots: &SnapshotSlots,
    first_error: &Arc<Mutex<Option<DarterError>>>,
    index: usize,
    stage: &dyn Fn(&mut RdbSnapshot) -> DarterResult<()>,
) {
    let mut slot = snapshots[index]
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(snapshot) = slot.as_mut() {
        if let Err(local_error) = stage(snapshot) {
            let mut merged = first_error.lock().unwrap_or_else(PoisonError::into_inner);
            update_error(local_error, &mut merged);
        }
    }
}

fn close_snapshot_slot(
    snapshots: &SnapshotSlots,
    first_error: &Arc<Mutex<Option<DarterError>>>,
    index: usize,
    merge_freq: &dyn Fn(RdbTypeFreqMap),
) {
    let taken = snapshots[index]
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(snapshot) = taken {
        let (result, freq_map) = snapshot.close();
        if let Err(local_error) = result {
            let mut merged = first_error.lock().unwrap_or_else(PoisonError::into_inner);
            update_error(local_error, &mut merged);
        }
        merge_freq(freq_map);
    }
}

impl ServerFamily {
    /// Writes a consistent snapshot of the entire keyspace.
    ///
    /// Legacy mode produces one `.rdb` file; `new_version` produces one
    /// `.dfs` file per shard, all sharing one timestamp. The consistent cut
    /// is pinned by a single-hop global transaction; body serialization runs
    /// outside the hop.
    ///
    /// # Errors
    ///
    /// Returns the first failure with its user-facing detail prefix. A state
    /// conflict surfaces as `operation_in_progress` with the observed state.
    pub async fn do_save(self: &Arc<Self>, new_version: bool) -> Result<(), SaveError> {
        let dir_path = self.data_dir();
        if !self.config.dir.is_empty() {
            if let Err(code) = create_dirs(&dir_path) {
                return Err(SaveError {
                    code,
                    details: "create-dir ".to_owned(),
                });
            }
        }
        let base: PathBuf = if self.config.dbfilename.is_empty() {
            PathBuf::from("dump")
        } else {
            PathBuf::from(&self.config.dbfilename)
        };

        let observed = self
            .global_state
            .switch_state(GlobalState::Active, GlobalState::Saving);
        if observed != GlobalState::Saving {
            return Err(SaveError::plain(DarterError::OperationInProgress(
                global_state_name(observed).to_owned(),
            )));
        }
        let _state_guard = SavingStateGuard(&self.global_state);

        let started_at = Instant::now();
        let now_local = chrono::Local::now();
        let now_secs = unix_time_secs();
        let lua_scripts = self.script_mgr.scripts();
        let shard_set = self.coordinator.shard_set();
        let shard_count = shard_set.size().as_usize();

        let slot_count = if new_version { shard_count } else { 1 };
        let snapshots: SnapshotSlots =
            Arc::new((0..slot_count).map(|_| Mutex::new(None)).collect());
        let first_error: Arc<Mutex<Option<DarterError>>> = Arc::new(Mutex::new(None));

        let tx = self
            .coordinator
            .create_transaction(save_cid(), 0, CommandFrame::new("SAVE", Vec::new()))
            .map_err(SaveError::plain)?;

        if new_version {
            // One file per shard, opened inside that shard's hop.
            let hop_snapshots = Arc::clone(&snapshots);
            let hop_error = Arc::clone(&first_error);
            let hop_scripts = lua_scripts.clone();
            let hop_dir = dir_path.clone();
            let hop_base = base.clone();
            self.coordinator
                .schedule_single_hop(&tx, move |_, shard| {
                    let sid = shard.shard_id();
                    let mut shard_file = hop_base.clone();
                    extend_filename(now_local, Some(sid), &mut shard_file);
                    let abs_path = hop_dir.join(shard_file);

                    let opened = RdbSnapshot::open(&abs_path, true).and_then(|mut snapshot| {
                        snapshot.start(&hop_scripts)?;
                        snapshot.start_in_shard(shard.db_slice_ref(), unix_time_ms());
                        Ok(snapshot)
                    });
                    match opened {
                        Ok(snapshot) => {
                            *hop_snapshots[usize::from(sid)]
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
                        }
                        Err(local_error) => {
                            let mut slot =
                                hop_error.lock().unwrap_or_else(PoisonError::into_inner);
                            update_error(local_error, &mut slot);
                        }
                    }
                    Ok(())
                })
                .await
                .map_err(SaveError::plain)?;
        } else {
            let mut filename = base.clone();
            extend_filename(now_local, None, &mut filename);
            let abs_path = dir_path.join(filename);

            let mut snapshot = RdbSnapshot::open(&abs_path, false).map_err(SaveError::plain)?;
            snapshot.start(&lua_scripts).map_err(SaveError::plain)?;
            *snapshots[0].lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);

            // The shared saver binds every shard's cut inside the hop.
            let hop_snapshots = Arc::clone(&snapshots);
            self.coordinator
                .schedule_single_hop(&tx, move |_, shard| {
                    if let Some(snapshot) = hop_snapshots[0]
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .as_mut()
                    {
                        snapshot.start_in_shard(shard.db_slice_ref(), unix_time_ms());
                    }
                    Ok(())
                })
                .await
                .map_err(SaveError::plain)?;
        }

        self.is_saving.store(true, Ordering::Relaxed);
        self.run_save_stage(new_version, &snapshots, &first_error, |snapshot| {
            if snapshot.has_started() {
                snapshot.save_body()
            } else {
                Ok(())
            }
        })
        .await;
        self.is_saving.store(false, Ordering::Relaxed);

        let rdb_name_map: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));
        {
            let close_map = Arc::clone(&rdb_name_map);
            self.run_save_close_stage(new_version, &snapshots, &first_error, move |freq_map| {
                let mut merged = close_map.lock().unwrap_or_else(PoisonError::into_inner);
                for (type_name, count) in freq_map {
                    *merged.entry(type_name).or_insert(0) += count;
                }
            })
            .await;
        }

        let mut final_path = base.clone();
        if new_version {
            extend_filename(now_local, Some(0), &mut final_path);
        } else {
            extend_filename(now_local, None, &mut final_path);
        }
        let final_path = dir_path.join(final_path);

        let outcome = first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match outcome {
            Some(code) => Err(SaveError::plain(code)),
            None => {
                let mut freq_map = rdb_name_map
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .drain()
                    .collect::<Vec<_>>();
                freq_map.sort();

                let save_info = Arc::new(LastSaveInfo {
                    save_time: now_secs,
                    file_name: final_path.to_string_lossy().into_owned(),
                    freq_map,
                });
                *self
                    .last_save_info
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = save_info;

                info!(
                    path = %final_path.display(),
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "saving finished"
                );
                Ok(())
            }
        }
    }

    /// Runs one save stage: on every shard for per-shard snapshots, inline
    /// for the legacy shared file.
    async fn run_save_stage(
        &self,
        new_version: bool,
        snapshots: &SnapshotSlots,
        first_error: &Arc<Mutex<Option<DarterError>>>,
        stage: impl Fn(&mut RdbSnapshot) -> DarterResult<()> + Clone + Send + 'static,
    ) {
        if new_version {
            let stage_snapshots = Arc::clone(snapshots);
            let stage_error = Arc::clone(first_error);
            let result = self
                .coordinator
                .shard_set()
                .run_blocking_in_parallel(move |shard| {
                    run_snapshot_slot(
                        &stage_snapshots,
                        &stage_error,
                        usize::from(shard.shard_id()),
                        &stage,
                    );
                })
                .await;
            if let Err(dispatch_error) = result {
                let mut merged = first_error.lock().unwrap_or_else(PoisonError::into_inner);
                update_error(dispatch_error, &mut merged);
            }
        } else {
            run_snapshot_slot(snapshots, first_error, 0, &stage);
        }
    }

    async fn run_save_close_stage(
        &self,
        new_version: bool,
        snapshots: &SnapshotSlots,
        first_error: &Arc<Mutex<Option<DarterError>>>,
        merge_freq: impl Fn(RdbTypeFreqMap) + Clone + Send + 'static,
    ) {
        if new_version {
            let stage_snapshots = Arc::clone(snapshots);
            let stage_error = Arc::clone(first_error);
            let result = self
                .coordinator
                .shard_set()
                .run_blocking_in_parallel(move |shard| {
                    close_snapshot_slot(
                        &stage_snapshots,
                        &stage_error,
                        usize::from(shard.shard_id()),
                        &merge_freq,
                    );
                })
                .await;
            if let Err(dispatch_error) = result {
                let mut merged = first_error.lock().unwrap_or_else(PoisonError::into_inner);
                update_error(dispatch_error, &mut merged);
            }
        } else {
            close_snapshot_slot(snapshots, first_error, 0, &merge_freq);
        }
    }

    /// `SAVE [DF]` / `BGSAVE`.
    pub(crate) async fn execute_save(self: &Arc<Self>, frame: &CommandFrame) -> CommandReply {
        if frame.args.len() > 1 {
            return CommandReply::Error("syntax error".to_owned());
        }
        let mut new_version = false;
        if let Some(subcommand) = frame.args.first() {
            if subcommand.eq_ignore_ascii_case(b"DF") {
                new_version = true;
            } else {
                return CommandReply::Error(format!(
                    "Unknown SAVE subcommand or wrong number of arguments for '{}'",
                    String::from_utf8_lossy(subcommand)
                ));
            }
        }

        match self.do_save(new_version).await {
            Ok(()) => CommandReply::ok(),
            Err(save_error) => CommandReply::Error(save_error.message()),
        }
    }

    /// The most recent save summary.
    #[must_use]
    pub fn last_save_info(&self) -> Arc<LastSaveInfo> {
        Arc::clone(
            &self
                .last_save_info
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Starts the boot-time load fiber.
    ///
    /// # Errors
    ///
    /// Returns reactor dispatch failures; a state conflict is logged and
    /// ignored, matching load-on-boot semantics.
    pub(crate) fn spawn_boot_load(self: &Arc<Self>, source: LoadSource) -> DarterResult<()> {
        let observed = self
            .global_state
            .switch_state(GlobalState::Active, GlobalState::Loading);
        if observed != GlobalState::Loading {
            warn!(state = global_state_name(observed), "in progress, ignored");
            return Ok(());
        }

        let family = Arc::clone(self);
        let handle = self
            .coordinator
            .shard_set()
            .pool()
            .launch_fiber_on(self.aux_reactor(), move || {
                Box::pin(async move {
                    let load_started = Instant::now();
                    match family.load_rdb(source).await {
                        Ok(stats) => info!(
                            keys = stats.keys_loaded,
                            elapsed_ms = load_started.elapsed().as_millis() as u64,
                            "done loading RDB"
                        ),
                        Err(load_error) => error!(error = %load_error, "error loading snapshot"),
                    }
                    let _ = family
                        .global_state
                        .switch_state(GlobalState::Loading, GlobalState::Active);
                })
            })?;
        *self
            .load_fiber
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Loads one snapshot source (a single `.rdb` or a `.dfs` shard set)
    /// into the live shards.
    ///
    /// # Errors
    ///
    /// Returns decode or I/O failures; partially loaded entries stay.
    pub(crate) async fn load_rdb(&self, source: LoadSource) -> DarterResult<LoadStats> {
        let paths = match source {
            LoadSource::Single(path) => vec![path],
            LoadSource::ShardSet(paths) => paths,
        };

        let mut total = LoadStats::default();
        for path in paths {
            let file = File::open(&path).map_err(|open_error| DarterError::io(&open_error))?;
            let mut loader = RdbLoader::new();
            let mut records = Vec::new();
            loader.load(std::io::BufReader::new(file), |record| records.push(record))?;
            for script in loader.scripts() {
                self.script_mgr.restore(script.clone());
            }
            total.keys_loaded += loader.stats().keys_loaded;
            total.bytes_read += loader.stats().bytes_read;

            self.import_records(records).await?;
        }
        Ok(total)
    }

    /// Routes decoded records to their owning shards in per-shard batches.
    pub(crate) async fn import_records(&self, records: Vec<SliceRecord>) -> DarterResult<()> {
        let resolver = *self.coordinator.resolver();
        let mut per_shard: HashMap<u16, Vec<SliceRecord>> = HashMap::new();
        for record in records {
            per_shard
                .entry(resolver.shard_for_key(&record.key))
                .or_default()
                .push(record);
        }
        for (shard, batch) in per_shard {
            self.coordinator
                .shard_set()
                .run_on_shard(shard, move |engine_shard| {
                    for record in batch {
                        engine_shard.db_slice().import_record(record);
                    }
                })
                .await?;
        }
        Ok(())
    }

    /// Starts the scheduled-snapshot fiber.
    ///
    /// # Errors
    ///
    /// Returns reactor dispatch failures.
    pub(crate) fn spawn_snapshot_schedule(self: &Arc<Self>, spec: SnapshotSpec) -> DarterResult<()> {
        let family = Arc::clone(self);
        let handle = self
            .coordinator
            .shard_set()
            .pool()
            .launch_fiber_on(self.aux_reactor(), move || {
                Box::pin(async move {
                    family.snapshot_schedule_loop(spec).await;
                })
            })?;
        *self
            .snapshot_fiber
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Wakes every 20 s; saves when the schedule matches and the last save
    /// happened in a different wall-clock minute.
    async fn snapshot_schedule_loop(self: Arc<Self>, spec: SnapshotSpec) {
        let tick = Duration::from_secs(20);
        loop {
            if self.snapshot_done.wait_for(tick).await {
                break;
            }

            let now = unix_time_secs();
            if !super::schedule::does_time_match_specifier(&spec, now) {
                continue;
            }
            let last_save = self.last_save_info().save_time;
            if last_save / 60 == now / 60 {
                continue;
            }

            if let Err(save_error) = self.do_save(false).await {
                warn!(error = %save_error.message(), "failed to perform snapshot");
            }
        }
    }
}
