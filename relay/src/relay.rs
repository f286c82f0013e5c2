//! The relay process: meta setup, the event pump, and the `Process`
//! contract the holder drives.
//!
//! The pump pulls events from a `Reader`, runs them through a
//! `Transformer`, hands them to a `Writer` and advances the checkpoint.
//! Reader, writer and the upstream SQL connection are external
//! collaborators injected as factories; the relay core owns only the order
//! of operations and the checkpoint discipline.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use camino::Utf8Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use binlog::event::{Event, EventPayload, EventType};
use binlog::GtidSet;

use crate::error::{ProcessResult, ReaderError, RelayError};
use crate::meta::{parse_sub_dir, LocalMeta, Position};
use crate::recover::{self, RecoverResult};
use crate::{RelayConf, RelayLogInfo};

#[derive(Debug)]
pub struct ReaderResult {
    pub event: Event,
}

/// Upstream event source. `get_event` blocks until the next event arrives
/// or `cancel` fires, in which case it yields `ReaderError::Canceled`.
#[async_trait]
pub trait Reader: Send {
    async fn start(&mut self) -> anyhow::Result<()>;
    async fn close(&mut self) -> anyhow::Result<()>;
    async fn get_event(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<ReaderResult, ReaderError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Transformed {
    pub ignore: bool,
}

/// Classifies events before they are written. Pure.
pub trait Transformer: Send + Sync {
    fn transform(&self, event: &Event) -> Transformed;
}

/// Default transformer: heartbeats, server-ignorable events and artificial
/// rotates (zero timestamp, emitted on connect) are noise and never reach
/// the writer.
#[derive(Debug, Default)]
pub struct EventFilter;

impl Transformer for EventFilter {
    fn transform(&self, event: &Event) -> Transformed {
        let ignore = match &event.payload {
            EventPayload::Heartbeat => true,
            EventPayload::Rotate { .. } => event.header.timestamp == 0,
            _ => event.header.event_type == EventType::Ignorable,
        };
        Transformed { ignore }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteResult {
    /// The writer decided the event does not belong in the file (e.g. a
    /// duplicate format-description event); the checkpoint must not move.
    pub ignore: bool,
}

/// Sink persisting event bytes into the current relay file. Owns file
/// rotation on rotate events. `write_event` returns only after the bytes
/// are durably queued.
#[async_trait]
pub trait Writer: Send {
    async fn start(&mut self) -> anyhow::Result<()>;
    async fn close(&mut self) -> anyhow::Result<()>;
    async fn write_event(&mut self, event: &Event) -> anyhow::Result<WriteResult>;
    async fn flush(&mut self) -> anyhow::Result<()>;
    /// Reconcile writer-internal state with the file on disk. The relay
    /// recovers files itself during init, so implementations may no-op.
    async fn recover(&mut self) -> anyhow::Result<Option<RecoverResult>>;
}

/// The few facts only the upstream SQL connection can provide.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn server_uuid(&self) -> anyhow::Result<String>;
    /// A server id not in use by any other replica, for announcing.
    async fn random_server_id(&self) -> anyhow::Result<u32>;
    async fn gtid_purged(&self) -> anyhow::Result<GtidSet>;
}

pub type ReaderFactory =
    Box<dyn Fn(&RelayConf, &Position, &GtidSet) -> Box<dyn Reader> + Send + Sync>;
pub type WriterFactory =
    Box<dyn Fn(&RelayConf, &Utf8Path, &Position) -> Box<dyn Writer> + Send + Sync>;

/// What the holder drives. `Relay` is the real implementation; tests
/// substitute their own.
#[async_trait]
pub trait Process: Send + Sync {
    /// Prepare to run: directories, meta, recovery. Failing leaves the
    /// holder in its initial stage.
    async fn init(&self) -> Result<(), RelayError>;
    /// Run the pump until cancellation or error.
    async fn process(&self, cancel: CancellationToken) -> ProcessResult;
    /// Swap the configuration. Only called while the pump is not running.
    async fn reload(&self, conf: RelayConf) -> Result<(), RelayError>;
    fn active_relay_log(&self) -> Option<RelayLogInfo>;
    /// Delete everything under the relay directory. Full reset.
    async fn purge_relay_dir(&self) -> Result<(), RelayError>;
    async fn close(&self);
    fn is_closed(&self) -> bool;
}

pub struct Relay {
    conf: Mutex<RelayConf>,
    meta: LocalMeta,
    upstream: Box<dyn Upstream>,
    transformer: Box<dyn Transformer>,
    reader_factory: ReaderFactory,
    writer_factory: WriterFactory,
    active: RwLock<Option<RelayLogInfo>>,
    closed: AtomicBool,
}

impl Relay {
    pub fn new(
        conf: RelayConf,
        upstream: Box<dyn Upstream>,
        transformer: Box<dyn Transformer>,
        reader_factory: ReaderFactory,
        writer_factory: WriterFactory,
    ) -> Relay {
        let meta = LocalMeta::new(conf.relay_dir.clone(), conf.flavor, conf.no_sync);
        Relay {
            conf: Mutex::new(conf),
            meta,
            upstream,
            transformer,
            reader_factory,
            writer_factory,
            active: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn meta(&self) -> &LocalMeta {
        &self.meta
    }

    fn conf(&self) -> RelayConf {
        self.conf.lock().expect("relay conf mutex poisoned").clone()
    }

    async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<bool> {
        let uuid = self
            .upstream
            .server_uuid()
            .await
            .context("failed to get upstream server UUID")?;

        // roll to a new sub-directory when the upstream identity changed or
        // the operator requested a specific suffix
        let need_resetup = match self.meta.current_uuid() {
            None => true,
            Some(current) => {
                let (base, _) = parse_sub_dir(&current)?;
                base != uuid || self.conf().uuid_suffix != 0
            }
        };
        if need_resetup {
            self.re_setup_meta(&uuid).await?;
        }

        let conf = self.conf();
        let (_, pos) = self.meta.pos();
        let (_, gset) = self.meta.gtid();
        let sub_dir = self
            .meta
            .dir()
            .expect("meta has an active sub-directory after re-setup");
        info!(sub_dir = %sub_dir, pos = %pos, gtid = %gset, "starting relay pump");

        let mut reader = (self.reader_factory)(&conf, &pos, &gset);
        reader
            .start()
            .await
            .context("failed to start binlog reader")?;
        let mut writer = (self.writer_factory)(&conf, &sub_dir, &pos);
        writer
            .start()
            .await
            .context("failed to start relay writer")?;

        let result = self
            .handle_events(cancel, reader.as_mut(), self.transformer.as_ref(), writer.as_mut())
            .await;

        if let Err(e) = writer.flush().await {
            warn!("failed to flush relay writer on exit: {e:#}");
        }
        if let Err(e) = reader.close().await {
            warn!("failed to close binlog reader: {e:#}");
        }
        if let Err(e) = writer.close().await {
            warn!("failed to close relay writer: {e:#}");
        }
        // the checkpoint never outruns the writer: writer flushed above,
        // meta flushed after
        if self.meta.dirty() {
            if let Err(e) = self.meta.flush() {
                warn!("failed to flush relay meta on exit: {e:#}");
            }
        }
        result
    }

    /// The pump loop. Returns Ok(true) on cancellation; reader and writer
    /// errors propagate unwrapped for the caller to classify.
    pub(crate) async fn handle_events(
        &self,
        cancel: &CancellationToken,
        reader: &mut dyn Reader,
        transformer: &dyn Transformer,
        writer: &mut dyn Writer,
    ) -> anyhow::Result<bool> {
        let flush_interval = self.conf().flush_meta_interval();
        let mut last_flush = Instant::now();
        let (_, pos) = self.meta.pos();
        let mut current_file = pos.name;

        loop {
            if cancel.is_cancelled() {
                return Ok(true);
            }
            let event = match reader.get_event(cancel).await {
                Ok(res) => res.event,
                Err(ReaderError::Canceled) => return Ok(true),
                Err(err) => return Err(err.into()),
            };

            if transformer.transform(&event).ignore {
                debug!(event_type = ?event.header.event_type, "ignored noise event");
                continue;
            }

            let wres = writer
                .write_event(&event)
                .await
                .context("failed to write relay event")?;
            if wres.ignore {
                debug!(event_type = ?event.header.event_type, "writer skipped event");
                continue;
            }

            let new_pos = match &event.payload {
                EventPayload::Rotate { next_binlog, .. } => {
                    // restart correctness hinges on the checkpoint being
                    // durable the moment the stream moves to a new file
                    current_file = next_binlog.clone();
                    let new_pos = Position::new(next_binlog.clone(), 4);
                    self.meta.save(new_pos.clone(), None)?;
                    self.meta.flush()?;
                    last_flush = Instant::now();
                    info!(file = %current_file, "relay stream rotated");
                    new_pos
                }
                EventPayload::Query { gset: Some(gs), .. }
                | EventPayload::Xid { gset: Some(gs), .. } => {
                    let new_pos =
                        Position::new(current_file.clone(), u64::from(event.header.log_pos));
                    self.meta.save(new_pos.clone(), Some(gs.clone()))?;
                    new_pos
                }
                _ => {
                    let new_pos =
                        Position::new(current_file.clone(), u64::from(event.header.log_pos));
                    self.meta.save(new_pos.clone(), None)?;
                    new_pos
                }
            };

            if self.meta.dirty() && last_flush.elapsed() >= flush_interval {
                self.meta.flush()?;
                last_flush = Instant::now();
            }

            self.publish_active(&new_pos);
        }
    }

    fn publish_active(&self, pos: &Position) {
        if pos.name.is_empty() {
            return;
        }
        let Some(sub_dir) = self.meta.current_uuid() else {
            return;
        };
        if let Ok(info) = RelayLogInfo::new(&sub_dir, pos.name.clone(), pos.pos) {
            *self
                .active
                .write()
                .expect("active relay log lock poisoned") = Some(info);
        }
    }

    /// Start a fresh `<uuid>.<suffix>` sub-directory and apply the one-shot
    /// configured start point, which is consumed here.
    async fn re_setup_meta(&self, uuid: &str) -> Result<(), RelayError> {
        let conf = self.conf();
        self.meta.add_dir(uuid, None, None, conf.uuid_suffix)?;

        if !conf.binlog_name.is_empty() || (conf.enable_gtid && !conf.binlog_gtid.is_empty()) {
            let adjusted = self.meta.adjust_with_start_pos(
                &conf.binlog_name,
                &conf.binlog_gtid,
                conf.enable_gtid,
            )?;
            debug!(adjusted, "applied configured relay start point");
        }

        if conf.enable_gtid {
            match self.upstream.gtid_purged().await {
                Ok(purged) if !purged.is_empty() => {
                    self.meta.extend_gtid_with_purged(&purged)?;
                }
                Ok(_) => {}
                Err(e) => warn!("failed to read gtid_purged from upstream: {e:#}"),
            }
        }

        {
            let mut conf = self.conf.lock().expect("relay conf mutex poisoned");
            conf.binlog_name.clear();
            conf.binlog_gtid.clear();
            conf.uuid_suffix = 0;
        }
        info!(%uuid, "relay meta set up");
        Ok(())
    }
}

#[async_trait]
impl Process for Relay {
    async fn init(&self) -> Result<(), RelayError> {
        let conf = self.conf();
        fs::create_dir_all(&conf.relay_dir)
            .with_context(|| format!("failed to create relay dir {}", conf.relay_dir))?;

        if conf.server_id == 0 {
            let server_id = self
                .upstream
                .random_server_id()
                .await
                .context("failed to get a free server id from upstream")?;
            self.conf.lock().expect("relay conf mutex poisoned").server_id = server_id;
        }

        self.meta.load()?;

        let purged = match self.upstream.gtid_purged().await {
            Ok(purged) if !purged.is_empty() => Some(purged),
            Ok(_) => None,
            Err(e) => {
                warn!("failed to read gtid_purged from upstream: {e:#}");
                None
            }
        };
        recover::try_recover_latest_file(&self.meta, conf.flavor, purged.as_ref(), conf.no_sync)?;
        Ok(())
    }

    async fn process(&self, cancel: CancellationToken) -> ProcessResult {
        match self.run(&cancel).await {
            Ok(_) => ProcessResult::canceled(),
            Err(err) => {
                error!("relay pump exited: {err:#}");
                ProcessResult::with_error(err)
            }
        }
    }

    async fn reload(&self, new_conf: RelayConf) -> Result<(), RelayError> {
        let mut conf = self.conf.lock().expect("relay conf mutex poisoned");
        if new_conf.relay_dir != conf.relay_dir {
            return Err(RelayError::InvalidArgs(
                "relay_dir can not change on reload".into(),
            ));
        }
        if new_conf.flavor != conf.flavor {
            return Err(RelayError::InvalidArgs(
                "flavor can not change on reload".into(),
            ));
        }
        *conf = new_conf;
        info!("relay config reloaded");
        Ok(())
    }

    fn active_relay_log(&self) -> Option<RelayLogInfo> {
        self.active
            .read()
            .expect("active relay log lock poisoned")
            .clone()
    }

    async fn purge_relay_dir(&self) -> Result<(), RelayError> {
        let dir = self.conf().relay_dir;
        if dir.exists() {
            for entry in dir
                .read_dir_utf8()
                .with_context(|| format!("failed to list {dir}"))?
            {
                let entry = entry.with_context(|| format!("failed to list {dir}"))?;
                let path = entry.path();
                if entry
                    .file_type()
                    .with_context(|| format!("failed to stat {path}"))?
                    .is_dir()
                {
                    fs::remove_dir_all(path)
                        .with_context(|| format!("failed to remove {path}"))?;
                } else {
                    fs::remove_file(path)
                        .with_context(|| format!("failed to remove {path}"))?;
                }
            }
        }
        *self
            .active
            .write()
            .expect("active relay log lock poisoned") = None;
        // reset the in-memory meta to the now-empty directory
        self.meta.load()?;
        info!(%dir, "relay dir purged");
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.meta.dirty() {
            if let Err(e) = self.meta.flush() {
                warn!("failed to flush relay meta on close: {e:#}");
            }
        }
        info!("relay closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
