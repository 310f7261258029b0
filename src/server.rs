//! The region server: hosts a set of regions, serves reads and writes
//! against them, and keeps in step with the master.
//!
//! One server owns its online regions and its write-ahead log exclusively.
//! The `run` loop performs the startup handshake, then heartbeats the
//! master every `msg_interval`, shipping buffered reports and queueing the
//! returned instructions for the worker task. Going too long without a
//! successful report is fatal: the master has given the server's regions
//! away, so the server aborts rather than serve stale ranges.
//!
//! The RPC surface is exposed as methods on [`RegionServer`]; the wire
//! transport that would call them is out of scope.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::catalog::{CatalogTable, LocalCatalog, RegionInfo, META_TABLE, ROOT_TABLE};
use crate::chore::ChoreRunner;
use crate::chores::{CatalogAccess, Flusher, LogRoller, SplitOrCompactChecker};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::errinput;
use crate::flock::DirLock;
use crate::key::{ColumnMatcher, LATEST_TIMESTAMP};
use crate::leases::Leases;
use crate::master::{Instruction, MasterClient, Outbound, Report, ServerInfo, ServerLoad};
use crate::region::{Region, RegionScanner, RowFilter, RowResult};
use crate::registry::RegionRegistry;
use crate::wal::Hlog;

const INSTRUCTION_QUEUE_DEPTH: usize = 64;

/// Shutdown and health flags shared with chores and the worker.
pub struct ServerFlags {
    stop_requested: AtomicBool,
    abort_requested: AtomicBool,
    fs_ok: AtomicBool,
}

impl ServerFlags {
    pub fn new() -> Self {
        Self {
            stop_requested: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            fs_ok: AtomicBool::new(true),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    pub fn fs_ok(&self) -> bool {
        self.fs_ok.load(Ordering::SeqCst)
    }

    /// Orderly shutdown: regions close and flush on the way out.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Go down hard: skip region close, keep the log for replay.
    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn mark_fs_failed(&self) {
        self.fs_ok.store(false, Ordering::SeqCst);
        self.request_abort();
    }
}

impl Default for ServerFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Probes the backing store. A failed probe marks the filesystem gone and
/// requests an abort; from then on every RPC answers "server not running".
pub struct FilesystemProbe {
    root: PathBuf,
    flags: Arc<ServerFlags>,
}

impl FilesystemProbe {
    pub fn new(root: PathBuf, flags: Arc<ServerFlags>) -> Self {
        Self { root, flags }
    }

    /// Returns whether the filesystem is still usable.
    pub fn check(&self) -> bool {
        if !self.flags.fs_ok() {
            return false;
        }
        if fs::metadata(&self.root).is_err() {
            tracing::error!(root = %self.root.display(), "filesystem unavailable, shutting down");
            self.flags.mark_fs_failed();
        }
        self.flags.fs_ok()
    }
}

/// One buffered row mutation batch, committed atomically at one timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUpdate {
    pub row: Vec<u8>,
    pub ops: Vec<BatchOperation>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOperation {
    Put { column: Vec<u8>, value: Vec<u8> },
    Delete { column: Vec<u8> },
}

impl BatchUpdate {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            ops: Vec::new(),
        }
    }

    pub fn put(mut self, column: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.ops.push(BatchOperation::Put {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(mut self, column: impl Into<Vec<u8>>) -> Self {
        self.ops.push(BatchOperation::Delete {
            column: column.into(),
        });
        self
    }
}

struct ToDo {
    instruction: Instruction,
    tries: u32,
}

/// Handles owned by one incarnation of the region service; torn down on
/// stop and on a master-ordered restart.
struct Service {
    chores: ChoreRunner,
    worker: JoinHandle<()>,
    todo_tx: mpsc::Sender<ToDo>,
    worker_stop: Arc<AtomicBool>,
}

enum HeartbeatOutcome {
    Stop,
    Restart,
}

pub struct RegionServer {
    config: RwLock<Config>,
    registry: Arc<RegionRegistry>,
    log: RwLock<Option<Arc<Hlog>>>,
    leases: RwLock<Option<Arc<Leases>>>,
    /// Open scan cursors by lease id. Shared with lease expiry listeners,
    /// which remove the cursor they cover.
    scanners: Arc<Mutex<HashMap<u64, Arc<Mutex<RegionScanner>>>>>,
    flags: Arc<ServerFlags>,
    probe: Arc<FilesystemProbe>,
    outbound: Arc<Outbound>,
    master: Arc<dyn MasterClient>,
    start_code: AtomicU64,
    request_count: AtomicU64,
    _dir_lock: DirLock,
}

impl RegionServer {
    /// Creates the server and takes exclusive ownership of the root
    /// directory. Nothing is served until [`run`](Self::run).
    pub fn new(config: Config, master: Arc<dyn MasterClient>) -> Result<Arc<Self>> {
        fs::create_dir_all(&config.root_dir)?;
        let dir_lock = DirLock::acquire(config.root_dir.join("server.lock"))
            .map_err(|_| Error::RegionServerRunning(config.root_dir.display().to_string()))?;

        let flags = Arc::new(ServerFlags::new());
        let probe = Arc::new(FilesystemProbe::new(config.root_dir.clone(), flags.clone()));
        Ok(Arc::new(Self {
            config: RwLock::new(config),
            registry: Arc::new(RegionRegistry::new()),
            log: RwLock::new(None),
            leases: RwLock::new(None),
            scanners: Arc::new(Mutex::new(HashMap::new())),
            flags,
            probe,
            outbound: Arc::new(Outbound::new()),
            master,
            start_code: AtomicU64::new(rand::random()),
            request_count: AtomicU64::new(0),
            _dir_lock: dir_lock,
        }))
    }

    pub fn flags(&self) -> &Arc<ServerFlags> {
        &self.flags
    }

    pub fn registry(&self) -> &Arc<RegionRegistry> {
        &self.registry
    }

    /// Orderly shutdown.
    pub fn stop(&self) {
        self.flags.request_stop();
    }

    /// Exit without closing regions; the log stays behind for replay.
    pub fn abort(&self) {
        self.flags.request_abort();
    }

    // RPC surface

    fn check_open(&self) -> Result<()> {
        if self.flags.stop_requested() || self.flags.abort_requested() || !self.flags.fs_ok() {
            return Err(Error::ServerNotRunning);
        }
        Ok(())
    }

    fn count_request(&self) {
        self.request_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Surfaces transient IO by probing the filesystem, per the error
    /// policy: the probe decides whether the server keeps running.
    fn io_guard<T>(&self, result: Result<T>) -> Result<T> {
        if matches!(&result, Err(Error::Io(_))) {
            self.probe.check();
        }
        result
    }

    pub fn get_region_info(&self, region: &str) -> Result<RegionInfo> {
        self.check_open()?;
        self.count_request();
        self.registry.lookup(region, false)?.info()
    }

    pub fn get(
        &self,
        region: &str,
        row: &[u8],
        column: &[u8],
        timestamp: Option<u64>,
        versions: Option<usize>,
    ) -> Result<Vec<Vec<u8>>> {
        self.check_open()?;
        self.count_request();
        let region = self.registry.lookup(region, true)?;
        self.io_guard(region.get(
            row,
            column,
            timestamp.unwrap_or(LATEST_TIMESTAMP),
            versions.unwrap_or(1),
        ))
    }

    pub fn get_row(&self, region: &str, row: &[u8]) -> Result<RowResult> {
        self.check_open()?;
        self.count_request();
        let region = self.registry.lookup(region, true)?;
        self.io_guard(region.get_full(row))
    }

    /// Opens a server-side scanner and leases it to the caller. The id is
    /// a fresh random 64-bit value; collisions are treated as impossible.
    pub fn open_scanner(
        &self,
        region: &str,
        columns: &[Vec<u8>],
        start_row: &[u8],
        timestamp: u64,
        filter: Option<Box<dyn RowFilter>>,
    ) -> Result<u64> {
        self.check_open()?;
        self.count_request();
        let region = self.registry.lookup(region, true)?;
        let matcher = ColumnMatcher::new(columns)?;
        let scanner =
            self.io_guard(region.scanner(matcher, start_row.to_vec(), timestamp, filter))?;

        let id = rand::random();
        self.scanners
            .lock()?
            .insert(id, Arc::new(Mutex::new(scanner)));

        let leases = self.leases()?;
        let scanners = self.scanners.clone();
        leases.create(
            id,
            Box::new(move || {
                if let Ok(mut scanners) = scanners.lock() {
                    scanners.remove(&id);
                }
            }),
        )?;
        Ok(id)
    }

    /// The next row from a scanner, renewing its lease. `UnknownScanner`
    /// when the cursor is gone or its lease has expired.
    pub fn next(&self, scanner_id: u64) -> Result<Option<(Vec<u8>, RowResult)>> {
        self.check_open()?;
        self.count_request();
        let scanner = self
            .scanners
            .lock()?
            .get(&scanner_id)
            .cloned()
            .ok_or(Error::UnknownScanner(scanner_id))?;
        self.leases()?
            .renew(scanner_id)
            .map_err(|_| Error::UnknownScanner(scanner_id))?;
        let mut scanner = scanner.lock()?;
        self.io_guard(scanner.next_row())
    }

    pub fn close_scanner(&self, scanner_id: u64) -> Result<()> {
        self.check_open()?;
        self.count_request();
        self.scanners
            .lock()?
            .remove(&scanner_id)
            .ok_or(Error::UnknownScanner(scanner_id))?;
        self.leases()?.cancel(scanner_id);
        Ok(())
    }

    /// Applies one row's batch as a single commit. Deletes at the latest
    /// timestamp run after the commit so their tombstones land on the
    /// newest existing cells.
    pub fn batch_update(&self, region: &str, timestamp: u64, batch: BatchUpdate) -> Result<()> {
        self.check_open()?;
        self.count_request();
        let region = self.registry.lookup(region, false)?;

        let lock_id = region.start_update(&batch.row)?;
        let mut latest_deletes = Vec::new();
        let result = (|| {
            for op in &batch.ops {
                match op {
                    BatchOperation::Put { column, value } => {
                        region.put(lock_id, column, value.clone())?
                    }
                    BatchOperation::Delete { column } => {
                        if timestamp == LATEST_TIMESTAMP {
                            latest_deletes.push(column.clone());
                        } else {
                            region.delete(lock_id, column)?;
                        }
                    }
                }
            }
            region.commit(lock_id, timestamp)
        })();
        if result.is_err() {
            let _ = region.abort(lock_id);
            return self.io_guard(result);
        }
        for column in latest_deletes {
            self.io_guard(region.delete_all(&batch.row, &column, LATEST_TIMESTAMP))?;
        }
        Ok(())
    }

    pub fn delete_all(
        &self,
        region: &str,
        row: &[u8],
        column: &[u8],
        timestamp: u64,
    ) -> Result<()> {
        self.check_open()?;
        self.count_request();
        let region = self.registry.lookup(region, false)?;
        self.io_guard(region.delete_all(row, column, timestamp))
    }

    // Region lifecycle, driven by the instruction worker.

    fn open_region(&self, info: RegionInfo) -> Result<()> {
        let name = info.region_name();
        if self.registry.lookup(&name, false).is_ok() {
            self.outbound.report_open(info);
            return Ok(());
        }
        let root_dir = self.config.read()?.root_dir.clone();
        let region = Arc::new(Region::open(&root_dir, info, self.log_handle()?, None)?);
        let opened = region.info()?;
        self.registry.open(region)?;
        self.outbound.report_open(opened);
        Ok(())
    }

    fn close_region(&self, info: &RegionInfo, report: bool) -> Result<()> {
        if let Some(region) = self.registry.remove(&info.region_name()) {
            region.close(false)?;
            if report {
                self.outbound.report_close(region.info()?);
            }
        }
        Ok(())
    }

    fn close_all_regions(&self, abort: bool) -> Vec<RegionInfo> {
        let mut closed = Vec::new();
        for region in self.registry.drain() {
            match region.close(abort).and_then(|_| region.info()) {
                Ok(info) => closed.push(info),
                Err(e) => {
                    tracing::error!(region = region.name(), error = %e, "error closing region")
                }
            }
        }
        closed
    }

    // Lifecycle

    /// The server main loop: handshake with the master, start the region
    /// service, heartbeat until told to stop (or restart), then shut down.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            let overrides = self.report_for_duty().await?;
            let service = Self::init_service(&self, overrides)?;
            let outcome = self.heartbeat_loop(&service.todo_tx).await;
            match outcome {
                HeartbeatOutcome::Restart => {
                    tracing::info!("restarting region service at master's request");
                    self.teardown(service).await;
                    self.close_all_regions(false);
                    if let Some(log) = self.log.write()?.take() {
                        if let Err(e) = log.close_and_delete() {
                            tracing::error!(error = %e, "error deleting log during restart");
                            self.flags.request_abort();
                            break;
                        }
                    }
                    self.start_code.store(rand::random(), Ordering::SeqCst);
                    continue;
                }
                HeartbeatOutcome::Stop => {
                    self.teardown(service).await;
                    break;
                }
            }
        }
        self.shutdown().await
    }

    /// Let the master know we are up; retry until it answers or we are
    /// stopped. The returned map overrides local configuration.
    async fn report_for_duty(&self) -> Result<HashMap<String, String>> {
        let interval = self.config.read()?.msg_interval;
        loop {
            if self.flags.stop_requested() {
                return Err(Error::ServerNotRunning);
            }
            match self
                .master
                .region_server_startup(self.current_server_info()?)
                .await
            {
                Ok(overrides) => {
                    tracing::info!("reported for duty to master");
                    return Ok(overrides);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "error telling master we are up");
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    /// Installs master overrides, opens the WAL for this incarnation, and
    /// starts the leases, chores and instruction worker.
    fn init_service(server: &Arc<Self>, overrides: HashMap<String, String>) -> Result<Service> {
        server.config.write()?.apply_overrides(&overrides)?;
        let cfg = server.config.read()?.clone();
        fs::create_dir_all(&cfg.root_dir)?;

        let (host, port) = cfg
            .bind_address
            .split_once(':')
            .map(|(h, p)| (h.to_string(), p.to_string()))
            .unwrap_or_else(|| (cfg.bind_address.clone(), "0".to_string()));
        let start_code = server.start_code.load(Ordering::SeqCst);
        let log_dir = cfg.root_dir.join(format!("log_{host}_{start_code}_{port}"));
        let log = Arc::new(Hlog::create(log_dir)?);
        *server.log.write()? = Some(log.clone());

        *server.leases.write()? = Some(Leases::start(cfg.lease_period, cfg.wake_frequency));

        let chores = ChoreRunner::new(server.flags.clone());
        chores.register(Arc::new(Flusher {
            registry: server.registry.clone(),
            flags: server.flags.clone(),
            probe: server.probe.clone(),
            threshold: cfg.flush_threshold,
            max_interval: cfg.flush_interval,
            period: cfg.wake_frequency,
        }));
        chores.register(Arc::new(SplitOrCompactChecker {
            registry: server.registry.clone(),
            flags: server.flags.clone(),
            probe: server.probe.clone(),
            outbound: server.outbound.clone(),
            catalogs: server.clone(),
            compaction_threshold: cfg.compaction_threshold,
            max_filesize: cfg.max_filesize,
            period: cfg.split_check_interval,
        }));
        chores.register(Arc::new(LogRoller {
            log,
            probe: server.probe.clone(),
            max_entries: cfg.max_log_entries,
            period: cfg.wake_frequency,
        }));

        let (todo_tx, todo_rx) = mpsc::channel(INSTRUCTION_QUEUE_DEPTH);
        let worker_stop = Arc::new(AtomicBool::new(false));
        let worker = tokio::spawn(worker_loop(
            server.clone(),
            todo_rx,
            todo_tx.clone(),
            worker_stop.clone(),
            cfg.wake_frequency,
            cfg.num_retries,
        ));

        tracing::info!(
            address = %cfg.bind_address,
            start_code,
            "region server started"
        );
        Ok(Service {
            chores,
            worker,
            todo_tx,
            worker_stop,
        })
    }

    async fn heartbeat_loop(&self, todo_tx: &mpsc::Sender<ToDo>) -> HeartbeatOutcome {
        let (msg_interval, lease_timeout, num_retries) = match self.config.read() {
            Ok(cfg) => (cfg.msg_interval, cfg.master_lease_period, cfg.num_retries),
            Err(_) => return HeartbeatOutcome::Stop,
        };
        let mut last_success = Instant::now();
        let mut tries: u32 = 0;

        while !self.flags.stop_requested() {
            tokio::time::sleep(msg_interval).await;
            if self.flags.stop_requested() {
                break;
            }
            if last_success.elapsed() >= lease_timeout {
                tracing::error!(
                    silent_for = ?last_success.elapsed(),
                    "unable to report to master, aborting server"
                );
                self.flags.request_abort();
                break;
            }

            let Ok(info) = self.current_server_info() else {
                continue;
            };
            let reports = self.outbound.take();
            match self.master.region_server_report(info, reports.clone()).await {
                Ok(instructions) => {
                    last_success = Instant::now();
                    tries = 0;
                    for instruction in instructions {
                        if self.flags.stop_requested() {
                            break;
                        }
                        match instruction {
                            Instruction::Stop => {
                                tracing::info!("master requested stop");
                                self.flags.request_stop();
                            }
                            Instruction::CallServerStartup => {
                                if self.probe.check() {
                                    return HeartbeatOutcome::Restart;
                                }
                                tracing::error!(
                                    "filesystem check failed, refusing restart and shutting down"
                                );
                            }
                            other => {
                                if self.flags.fs_ok()
                                    && todo_tx
                                        .try_send(ToDo {
                                            instruction: other,
                                            tries: 0,
                                        })
                                        .is_err()
                                {
                                    tracing::warn!("instruction queue full, dropping instruction");
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    // Undelivered reports go back in the buffer.
                    for report in reports {
                        self.outbound.push(report);
                    }
                    tries += 1;
                    if tries <= num_retries {
                        tracing::warn!(error = %e, tries, "master report failed, will retry");
                    } else {
                        tracing::error!(error = %e, "exceeded master report retries");
                        if self.probe.check() {
                            self.flags.request_stop();
                        }
                    }
                }
            }
        }
        HeartbeatOutcome::Stop
    }

    /// Stops the worker, chores and leases of one service incarnation.
    async fn teardown(&self, service: Service) {
        let leases = match self.leases.write() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(leases) = leases {
            leases.expire_all();
            leases.shutdown().await;
        }
        if let Ok(mut scanners) = self.scanners.lock() {
            scanners.clear();
        }

        service.worker_stop.store(true, Ordering::SeqCst);
        drop(service.todo_tx);
        if let Err(e) = service.worker.await {
            tracing::error!(error = %e, "instruction worker panicked");
        }
        if let Err(e) = service.chores.shutdown().await {
            tracing::error!(error = %e, "error stopping chores");
        }
    }

    /// Final shutdown: close regions and the log, and tell the master
    /// what we were serving. On abort, regions and log are left as-is for
    /// replay and no report is sent.
    async fn shutdown(&self) -> Result<()> {
        if self.flags.abort_requested() {
            if self.flags.fs_ok() {
                if let Some(log) = self.log.write()?.take() {
                    if let Err(e) = log.close() {
                        tracing::error!(error = %e, "error closing log on abort");
                    }
                }
            }
            tracing::info!("aborted region server");
            return Ok(());
        }

        let closed = self.close_all_regions(false);
        if let Some(log) = self.log.write()?.take() {
            if let Err(e) = log.close_and_delete() {
                tracing::error!(error = %e, "error deleting log on shutdown");
            }
        }

        let mut reports = vec![Report::Exiting];
        reports.extend(closed.into_iter().map(Report::Close));
        if let Ok(info) = self.current_server_info() {
            if let Err(e) = self.master.region_server_report(info, reports).await {
                tracing::warn!(error = %e, "failed to send exiting report to master");
            }
        }
        tracing::info!("stopped region server");
        Ok(())
    }

    // Helpers

    fn log_handle(&self) -> Result<Arc<Hlog>> {
        self.log
            .read()?
            .clone()
            .ok_or(Error::ServerNotRunning)
    }

    fn leases(&self) -> Result<Arc<Leases>> {
        self.leases
            .read()?
            .clone()
            .ok_or(Error::ServerNotRunning)
    }

    fn current_server_info(&self) -> Result<ServerInfo> {
        let cfg = self.config.read()?;
        Ok(ServerInfo {
            address: cfg.bind_address.clone(),
            start_code: self.start_code.load(Ordering::SeqCst),
            load: ServerLoad {
                requests: self.request_count.swap(0, Ordering::SeqCst),
                regions: self.registry.online_count() as u64,
            },
        })
    }
}

impl CatalogAccess for RegionServer {
    /// Finds a locally hosted catalog region for `table`'s rows: a `root`
    /// region when `table` is `meta`, a `meta` region otherwise. The root
    /// region itself never splits.
    fn catalog_for(&self, table: &str) -> Result<Arc<dyn CatalogTable>> {
        if table == ROOT_TABLE {
            return errinput!("the root region does not split");
        }
        let wanted = if table == META_TABLE {
            ROOT_TABLE
        } else {
            META_TABLE
        };
        let region = self
            .registry
            .online_snapshot()
            .into_iter()
            .find(|r| r.info().map(|i| i.table == wanted).unwrap_or(false))
            .ok_or_else(|| Error::Io(format!("no {wanted} region hosted on this server")))?;
        Ok(Arc::new(LocalCatalog::new(region)))
    }
}

async fn worker_loop(
    server: Arc<RegionServer>,
    mut rx: mpsc::Receiver<ToDo>,
    tx: mpsc::Sender<ToDo>,
    worker_stop: Arc<AtomicBool>,
    wake_frequency: Duration,
    num_retries: u32,
) {
    loop {
        if server.flags.stop_requested() || worker_stop.load(Ordering::SeqCst) {
            break;
        }
        let todo = match tokio::time::timeout(wake_frequency, rx.recv()).await {
            Ok(Some(todo)) => todo,
            Ok(None) => break,
            Err(_) => continue, // wake to poll the stop flags
        };
        if server.flags.stop_requested() || worker_stop.load(Ordering::SeqCst) {
            break;
        }

        tracing::info!(instruction = ?todo.instruction, "processing master instruction");
        let result = match &todo.instruction {
            Instruction::Open(info) => server.open_region(info.clone()),
            Instruction::Close(info) => server.close_region(info, true),
            Instruction::CloseWithoutReport(info) => server.close_region(info, false),
            // Handled in the heartbeat loop; never queued.
            Instruction::Stop | Instruction::CallServerStartup => Ok(()),
        };
        if let Err(e) = result {
            tracing::error!(error = %e, instruction = ?todo.instruction, "instruction failed");
            if todo.tries < num_retries {
                let retry = ToDo {
                    instruction: todo.instruction,
                    tries: todo.tries + 1,
                };
                if tx.try_send(retry).is_err() {
                    tracing::error!("instruction queue full, dropping retry");
                }
            } else if !server.probe.check() {
                break;
            }
        }
    }
    tracing::info!("instruction worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FamilyDescriptor;
    use crate::master::testing::MockMaster;
    use crate::tmpfs::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config::new(dir.path().join("data"))
            .msg_interval(Duration::from_millis(20))
            .wake_frequency(Duration::from_millis(20))
            .lease_period(Duration::from_millis(150))
    }

    fn user_info(id: u64) -> RegionInfo {
        RegionInfo::new(
            "t",
            Vec::new(),
            Vec::new(),
            id,
            vec![FamilyDescriptor::new("f").max_versions(5)],
        )
    }

    async fn started_server(dir: &TempDir) -> (Arc<RegionServer>, Arc<MockMaster>, Service) {
        let master = Arc::new(MockMaster::new());
        let server = RegionServer::new(test_config(dir), master.clone()).expect("new server");
        let service = RegionServer::init_service(&server, HashMap::new()).expect("init");
        (server, master, service)
    }

    #[tokio::test]
    async fn test_batch_update_get_and_scan() {
        let dir = TempDir::new().expect("temp dir");
        let (server, _master, service) = started_server(&dir).await;

        server.open_region(user_info(1)).expect("open region");
        let name = user_info(1).region_name();

        server
            .batch_update(&name, 100, BatchUpdate::new("k1").put("f:c", "v1"))
            .expect("batch update");
        assert_eq!(
            server
                .get(&name, b"k1", b"f:c", Some(100), Some(1))
                .expect("get"),
            vec![b"v1".to_vec()]
        );
        let row = server.get_row(&name, b"k1").expect("get_row");
        assert_eq!(row.get(b"f:c".as_slice()).unwrap(), b"v1");

        let id = server
            .open_scanner(&name, &[], b"", LATEST_TIMESTAMP, None)
            .expect("open scanner");
        let (row, columns) = server.next(id).expect("next").expect("one row");
        assert_eq!(row, b"k1");
        assert_eq!(columns.get(b"f:c".as_slice()).unwrap(), b"v1");
        assert!(server.next(id).expect("next").is_none());

        server.close_scanner(id).expect("close scanner");
        assert!(matches!(server.next(id), Err(Error::UnknownScanner(_))));

        server.stop();
        server.teardown(service).await;
    }

    #[tokio::test]
    async fn test_latest_timestamp_batch_delete() {
        let dir = TempDir::new().expect("temp dir");
        let (server, _master, service) = started_server(&dir).await;

        server.open_region(user_info(1)).expect("open region");
        let name = user_info(1).region_name();

        server
            .batch_update(&name, 50, BatchUpdate::new("k1").put("f:c", "v"))
            .expect("put");
        server
            .batch_update(
                &name,
                LATEST_TIMESTAMP,
                BatchUpdate::new("k1").delete("f:c"),
            )
            .expect("delete");

        // The tombstone landed on the newest cell's timestamp.
        assert!(server
            .get(&name, b"k1", b"f:c", Some(50), Some(1))
            .expect("get")
            .is_empty());

        server.stop();
        server.teardown(service).await;
    }

    #[tokio::test]
    async fn test_scanner_lease_expiry_closes_cursor() {
        let dir = TempDir::new().expect("temp dir");
        let (server, _master, service) = started_server(&dir).await;

        server.open_region(user_info(1)).expect("open region");
        let name = user_info(1).region_name();
        server
            .batch_update(&name, 1, BatchUpdate::new("k1").put("f:c", "v"))
            .expect("put");

        let id = server
            .open_scanner(&name, &[], b"", LATEST_TIMESTAMP, None)
            .expect("open scanner");

        // Outlive the 150ms lease without renewing.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(matches!(server.next(id), Err(Error::UnknownScanner(_))));

        server.stop();
        server.teardown(service).await;
    }

    #[tokio::test]
    async fn test_rpcs_refused_when_not_running() {
        let dir = TempDir::new().expect("temp dir");
        let master = Arc::new(MockMaster::new());
        let server = RegionServer::new(test_config(&dir), master).expect("new server");

        server.stop();
        assert!(matches!(
            server.get("anywhere", b"r", b"f:c", None, None),
            Err(Error::ServerNotRunning)
        ));
    }

    #[tokio::test]
    async fn test_unknown_region_not_serving() {
        let dir = TempDir::new().expect("temp dir");
        let (server, _master, service) = started_server(&dir).await;
        assert!(matches!(
            server.get("t,,99", b"r", b"f:c", None, None),
            Err(Error::NotServingRegion(_))
        ));
        server.stop();
        server.teardown(service).await;
    }

    #[tokio::test]
    async fn test_run_opens_regions_and_reports_exit() {
        let dir = TempDir::new().expect("temp dir");
        let master = Arc::new(MockMaster::new());
        master.script(vec![Instruction::Open(user_info(7))]);
        for _ in 0..4 {
            master.script(Vec::new());
        }
        master.script(vec![Instruction::Stop]);

        let server = RegionServer::new(test_config(&dir), master.clone()).expect("new server");
        server.clone().run().await.expect("run");

        let reports = master.reported();
        assert!(
            reports
                .iter()
                .any(|r| matches!(r, Report::Open(info) if info.region_id == 7)),
            "open report missing: {reports:?}"
        );
        assert!(reports.iter().any(|r| matches!(r, Report::Exiting)));
        assert!(
            reports
                .iter()
                .any(|r| matches!(r, Report::Close(info) if info.region_id == 7)),
            "exit close report missing: {reports:?}"
        );
        assert_eq!(master.startups.lock().unwrap().len(), 1);
        assert_eq!(server.registry.online_count(), 0);
    }

    #[tokio::test]
    async fn test_call_server_startup_restarts_service() {
        let dir = TempDir::new().expect("temp dir");
        let master = Arc::new(MockMaster::new());
        master.script(vec![Instruction::CallServerStartup]);
        master.script(vec![Instruction::Stop]);

        let server = RegionServer::new(test_config(&dir), master.clone()).expect("new server");
        server.clone().run().await.expect("run");

        let startups = master.startups.lock().unwrap().clone();
        assert_eq!(startups.len(), 2, "restart redoes the handshake");
        assert_ne!(
            startups[0].start_code, startups[1].start_code,
            "restart picks a fresh start code"
        );
    }

    struct DeafMaster;
    #[async_trait::async_trait]
    impl MasterClient for DeafMaster {
        async fn region_server_startup(
            &self,
            _info: ServerInfo,
        ) -> Result<HashMap<String, String>> {
            Ok(HashMap::new())
        }
        async fn region_server_report(
            &self,
            _info: ServerInfo,
            _reports: Vec<Report>,
        ) -> Result<Vec<Instruction>> {
            Err(Error::Io("master unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_master_silence_aborts_server() {
        let dir = TempDir::new().expect("temp dir");
        let mut config = test_config(&dir);
        config.master_lease_period = Duration::from_millis(60);
        config.num_retries = 100; // keep the retry path out of the way

        let server = RegionServer::new(config, Arc::new(DeafMaster)).expect("new server");
        server.clone().run().await.expect("run");
        assert!(server.flags.abort_requested());
    }
}
