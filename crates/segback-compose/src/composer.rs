//! The composition pipeline.
//!
//! Producers [`submit`](ArchiveComposer::submit) discovered files into a
//! bounded queue. A fixed set of workers drains the queue: append-optimized
//! segment files above the size threshold go to the [`DedupUploader`], every
//! other file is packed into a checked-out archive slot by a tracked sub-task
//! while the worker goes back to the queue. The first failure anywhere cancels
//! the run and is what [`finish_composing`](ArchiveComposer::finish_composing)
//! reports.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::archive::ArchiveHeader;
use crate::bundle::{ArchiveFileSets, ArchiveIndex, BundleRecord, FileRecorder, RegularBundleFiles};
use crate::chain::ChainResolver;
use crate::classify::{RelFileClass, RelStorageMap};
use crate::config::ComposerConfig;
use crate::crypter::{Crypter, NoopCrypter};
use crate::dedup::{ao_files_metadata_key, load_base_files, system_clock, Clock, DedupUploader};
use crate::descriptor::FileDescriptor;
use crate::error::{ComposeError, Result};
use crate::packer::FilePacker;
use crate::slot_pool::ArchiveSlotPool;
use crate::stats::{ComposeStats, ComposeStatsSnapshot};
use crate::storage::ObjectStore;
use crate::task_group::TaskGroup;

/// Name of the bundle record object read by restore.
pub const BUNDLE_RECORD_NAME: &str = "files_metadata.json";

/// Folder under a backup holding the sealed archives.
pub const TAR_PARTITIONS_FOLDER: &str = "tar_partitions";

type Queue = Arc<tokio::sync::Mutex<mpsc::Receiver<FileDescriptor>>>;

/// Builds an [`ArchiveComposer`] and starts its workers.
pub struct ComposerBuilder {
    store: Arc<dyn ObjectStore>,
    backup_name: String,
    config: ComposerConfig,
    increment_from: Option<String>,
    rel_storage: RelStorageMap,
    crypter: Arc<dyn Crypter>,
    recorder: Arc<dyn FileRecorder>,
    index: Box<dyn ArchiveIndex>,
    clock: Clock,
    cancel: CancellationToken,
}

impl ComposerBuilder {
    /// Start building a composer for `backup_name` writing into `store`.
    pub fn new(store: Arc<dyn ObjectStore>, backup_name: impl Into<String>) -> Self {
        Self {
            store,
            backup_name: backup_name.into(),
            config: ComposerConfig::default(),
            increment_from: None,
            rel_storage: RelStorageMap::new(),
            crypter: Arc::new(NoopCrypter),
            recorder: Arc::new(RegularBundleFiles::new()),
            index: Box::new(ArchiveFileSets::new()),
            clock: system_clock(),
            cancel: CancellationToken::new(),
        }
    }

    /// Use `config` instead of the defaults.
    pub fn with_config(mut self, config: ComposerConfig) -> Self {
        self.config = config;
        self
    }

    /// Diff segment files against this backup instead of the latest one.
    /// An empty name means "no explicit base".
    pub fn with_increment_from(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.increment_from = (!name.is_empty()).then_some(name);
        self
    }

    /// Known append-optimized segment files.
    pub fn with_rel_storage_map(mut self, map: RelStorageMap) -> Self {
        self.rel_storage = map;
        self
    }

    /// Crypter attached to every archive and segment upload.
    pub fn with_crypter(mut self, crypter: Arc<dyn Crypter>) -> Self {
        self.crypter = crypter;
        self
    }

    /// Replace the default file recorder.
    pub fn with_recorder(mut self, recorder: Arc<dyn FileRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Replace the default archive index.
    pub fn with_archive_index(mut self, index: Box<dyn ArchiveIndex>) -> Self {
        self.index = index;
        self
    }

    /// Source of "now" for the dedup age check.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Parent token; cancelling it aborts the run.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate the configuration, load the dedup base and start the workers.
    #[instrument(skip(self), fields(backup = %self.backup_name))]
    pub async fn build(self) -> Result<ArchiveComposer> {
        self.config.validate()?;
        if self.backup_name.is_empty() || self.backup_name.contains('/') {
            return Err(ComposeError::InvalidConfig(format!(
                "invalid backup name {:?}",
                self.backup_name
            )));
        }

        let resolver = ChainResolver::new(Arc::clone(&self.store), self.config.backup_prefix.clone());
        let base_files =
            load_base_files(&resolver, self.store.as_ref(), self.increment_from.as_deref()).await?;

        let stats = Arc::new(ComposeStats::new());
        let backup_folder = self.config.backup_folder(&self.backup_name);
        let pool = ArchiveSlotPool::new(
            self.config.archive_slots,
            self.config.archive_size_threshold,
            format!("{}/{}", backup_folder, TAR_PARTITIONS_FOLDER),
            Arc::clone(&self.store),
            Arc::clone(&stats),
        );
        let uploader = DedupUploader::new(
            Arc::clone(&self.store),
            Arc::clone(&self.crypter),
            Arc::clone(&self.recorder),
            Arc::clone(&stats),
            base_files,
            self.config.dedup_age_limit(),
            self.backup_name.clone(),
            self.config.aosegments_folder(),
            self.clock,
        )?;
        let packer = FilePacker::new(Arc::clone(&self.recorder), Arc::clone(&stats));

        let workers = self.config.max_concurrency;
        let (tx, rx) = mpsc::channel(workers);
        let shared = Arc::new(Shared {
            store: self.store,
            backup_folder,
            rel_storage: self.rel_storage,
            ao_seg_size_threshold: self.config.ao_seg_size_threshold,
            crypter: self.crypter,
            recorder: self.recorder,
            index: Mutex::new(self.index),
            pool,
            uploader,
            packer,
            stats,
            group: TaskGroup::new(&self.cancel),
        });

        let queue: Queue = Arc::new(tokio::sync::Mutex::new(rx));
        for worker in 0..workers {
            let shared_ref = Arc::clone(&shared);
            let queue = Arc::clone(&queue);
            shared
                .group
                .spawn(async move { shared_ref.run_worker(worker, queue).await });
        }
        info!(
            workers,
            slots = self.config.archive_slots,
            base_entries = shared.uploader.base_len(),
            "Composer started"
        );

        Ok(ArchiveComposer {
            shared,
            sender: Mutex::new(Some(tx)),
        })
    }
}

/// State shared by the composer handle, its workers and their sub-tasks.
struct Shared {
    store: Arc<dyn ObjectStore>,
    backup_folder: String,
    rel_storage: RelStorageMap,
    ao_seg_size_threshold: u64,
    crypter: Arc<dyn Crypter>,
    recorder: Arc<dyn FileRecorder>,
    index: Mutex<Box<dyn ArchiveIndex>>,
    pool: ArchiveSlotPool,
    uploader: DedupUploader,
    packer: FilePacker,
    stats: Arc<ComposeStats>,
    group: TaskGroup,
}

impl Shared {
    async fn run_worker(self: Arc<Self>, worker: usize, queue: Queue) -> Result<()> {
        let token = self.group.token().clone();
        loop {
            let received = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(worker, "Worker observed cancellation");
                    return Ok(());
                }
                received = async { queue.lock().await.recv().await } => received,
            };
            let Some(descriptor) = received else {
                debug!(worker, "Submission queue closed, worker exiting");
                return Ok(());
            };
            self.route(descriptor).await?;
        }
    }

    async fn route(self: &Arc<Self>, descriptor: FileDescriptor) -> Result<()> {
        match self.rel_storage.classify(Path::new(&descriptor.header.name)) {
            RelFileClass::AppendOptimized { meta, location }
                if descriptor.raw_size >= self.ao_seg_size_threshold =>
            {
                debug!(file = %descriptor.header.name, size = descriptor.raw_size, "Routing to segment dedup");
                self.uploader.add_file(&descriptor, &meta, &location).await
            }
            _ => {
                let mut slot = self.pool.dequeue(self.group.token()).await?;
                slot.set_up(&self.crypter);
                self.index.lock().add_file(slot.name(), &descriptor.header.name);
                debug!(file = %descriptor.header.name, archive = slot.name(), "Routing to archive");

                let task = Arc::clone(self);
                self.group.spawn(async move {
                    task.packer.pack(&descriptor, &mut slot).await?;
                    task.pool.check_size_and_enqueue_back(slot).await
                });
                Ok(())
            }
        }
    }
}

/// Handle to a running composition.
///
/// All methods take `&self`; wrap in an `Arc` to submit from several producers.
pub struct ArchiveComposer {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::Sender<FileDescriptor>>>,
}

impl ArchiveComposer {
    /// Queue a file for archiving or dedup. Waits while the queue is full.
    ///
    /// Returns `Cancelled` if the run is cancelled first (the file is dropped)
    /// and `QueueClosed` after [`finish_composing`](Self::finish_composing).
    pub async fn submit(&self, descriptor: FileDescriptor) -> Result<()> {
        let sender = self.sender.lock().clone().ok_or(ComposeError::QueueClosed)?;
        let token = self.shared.group.token();
        let name = descriptor.header.name.clone();
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                error!(file = %name, "Run cancelled, dropping submitted file");
                Err(ComposeError::Cancelled)
            }
            sent = sender.send(descriptor) => sent.map_err(|_| {
                if token.is_cancelled() {
                    ComposeError::Cancelled
                } else {
                    ComposeError::QueueClosed
                }
            }),
        }
    }

    /// Write a metadata-only entry (e.g. a directory) straight into an archive.
    ///
    /// If no slot can be obtained, the run's first error is returned instead.
    pub async fn add_header(&self, header: ArchiveHeader) -> Result<()> {
        if header.size != 0 {
            return Err(ComposeError::Pack {
                name: header.name,
                reason: "header-only entries must have zero size".to_string(),
            });
        }
        let shared = &self.shared;
        let mut slot = match shared.pool.dequeue(shared.group.token()).await {
            Ok(slot) => slot,
            Err(ComposeError::QueueClosed) => return Err(ComposeError::QueueClosed),
            Err(_) => return Err(shared.group.failure()),
        };
        slot.set_up(&shared.crypter);
        shared.index.lock().add_file(slot.name(), &header.name);
        shared.recorder.add_file(&header, false);
        let written = slot.write_header(&header);
        shared.pool.enqueue_back(slot);
        written?;
        shared.stats.record_header();
        Ok(())
    }

    /// Record a file deliberately left out of the backup.
    pub fn skip_file(&self, header: &ArchiveHeader) {
        self.shared.recorder.add_skipped(header);
        self.shared.stats.record_skipped();
    }

    /// Close submission, wait for all work, seal the remaining archives and
    /// persist the dedup manifest. Returns the archive file index.
    #[instrument(skip(self), fields(backup = %self.shared.backup_folder))]
    pub async fn finish_composing(&self) -> Result<ArchiveFileSets> {
        if self.sender.lock().take().is_none() {
            return Err(ComposeError::QueueClosed);
        }
        let shared = &self.shared;
        shared.group.wait().await?;
        let archives = shared.pool.finish().await?;

        let manifest = shared.uploader.get_files();
        let key = ao_files_metadata_key(&shared.backup_folder);
        let body = serde_json::to_vec(&manifest)?;
        shared.store.write(&key, Bytes::from(body)).await?;

        let file_sets = shared.index.lock().file_sets();
        info!(
            archives = archives.len(),
            archived_files = file_sets.file_count(),
            segment_files = manifest.files.len(),
            manifest = %key,
            "Composition finished"
        );
        Ok(file_sets)
    }

    /// Bundle bookkeeping; complete only after `finish_composing`.
    pub fn get_files(&self) -> BundleRecord {
        BundleRecord {
            files: self.shared.recorder.files(),
            archive_files: self.shared.index.lock().file_sets(),
        }
    }

    /// Persist the bundle record next to the archives. Returns its key.
    pub async fn upload_bundle_record(&self) -> Result<String> {
        let record = self.get_files();
        let key = format!("{}/{}", self.shared.backup_folder, BUNDLE_RECORD_NAME);
        let body = serde_json::to_vec(&record)?;
        self.shared.store.write(&key, Bytes::from(body)).await?;
        info!(key = %key, files = record.files.len(), "Uploaded bundle record");
        Ok(key)
    }

    /// Counters of the run so far.
    pub fn stats(&self) -> ComposeStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// True once the run failed or was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.group.is_cancelled()
    }
}
