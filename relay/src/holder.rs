//! The relay holder: the operator-facing state machine owning the pump
//! task.
//!
//! ```text
//!           init() ok, start()
//!   New ───────────────▶ Running ◀──────── Resume
//!                         │   ▲              │
//!                        Pause│              │
//!                         ▼   │              │
//!                       Paused ──────────────┘
//!                         │
//!                        Stop
//!                         ▼
//!                      Stopped (terminal)
//! ```
//!
//! Every transition is serialized on one async mutex owning the pump's
//! cancellation token and join handle; observers read a small snapshot
//! mutex and never see a half-applied transition. `close()` is special: it
//! parks the holder in internal `Paused` but reports `Stopped` outward,
//! which callers rely on.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{ProcessResult, RelayError, RelayErrorInfo};
use crate::relay::Process;
use crate::{RelayConf, RelayLogInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    New,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::New => "New",
            Stage::Running => "Running",
            Stage::Paused => "Paused",
            Stage::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOp {
    Pause,
    Resume,
    Stop,
    /// An op value the holder does not know. Kept explicit because op codes
    /// arrive over the wire in the embedding process.
    Invalid,
}

impl fmt::Display for RelayOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayOp::Pause => "Pause",
            RelayOp::Resume => "Resume",
            RelayOp::Stop => "Stop",
            RelayOp::Invalid => "Invalid",
        };
        f.write_str(s)
    }
}

/// Observable snapshot returned by `status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub stage: Stage,
    pub result: Option<ProcessResult>,
}

/// Builds the inner relay process. Injected so tests can substitute their
/// own process without any global hook.
pub type ProcessFactory =
    Box<dyn Fn(&RelayConf) -> Result<Arc<dyn Process>, RelayError> + Send + Sync>;

struct Snapshot {
    stage: Stage,
    result: Option<ProcessResult>,
    last_error: Option<RelayErrorInfo>,
}

struct Core {
    state: Mutex<Snapshot>,
    closed: AtomicBool,
}

impl Core {
    fn lock(&self) -> std::sync::MutexGuard<'_, Snapshot> {
        self.state.lock().expect("relay holder state mutex poisoned")
    }
}

struct PumpSlot {
    cancel: CancellationToken,
    handle: Option<JoinHandle<ProcessResult>>,
}

pub struct RelayHolder {
    relay: Arc<dyn Process>,
    core: Arc<Core>,
    /// Transition lock; also owns the pump task.
    pump: tokio::sync::Mutex<PumpSlot>,
}

impl RelayHolder {
    pub fn new(conf: &RelayConf, factory: ProcessFactory) -> Result<RelayHolder, RelayError> {
        let relay = factory(conf)?;
        Ok(RelayHolder {
            relay,
            core: Arc::new(Core {
                state: Mutex::new(Snapshot {
                    stage: Stage::New,
                    result: None,
                    last_error: None,
                }),
                closed: AtomicBool::new(false),
            }),
            pump: tokio::sync::Mutex::new(PumpSlot {
                cancel: CancellationToken::new(),
                handle: None,
            }),
        })
    }

    /// Initialize the inner relay. Errors surface unchanged and the stage
    /// stays `New`.
    pub async fn init(&self) -> Result<(), RelayError> {
        self.relay.init().await
    }

    /// Spawn the pump. Only effective from `New`; later calls are no-ops.
    pub async fn start(&self) {
        let mut slot = self.pump.lock().await;
        if self.stage() != Stage::New {
            return;
        }
        self.spawn_pump(&mut slot);
        info!("relay holder started");
    }

    pub async fn operate(&self, op: RelayOp) -> Result<(), RelayError> {
        match op {
            RelayOp::Pause => self.pause_relay().await,
            RelayOp::Resume => self.resume_relay().await,
            RelayOp::Stop => self.stop_relay().await,
            RelayOp::Invalid => Err(RelayError::UnsupportedOp(op.to_string())),
        }
    }

    /// Atomic reconfiguration: pause if running, reload, restore the origin
    /// stage. A reload failure surfaces and leaves the holder `Paused`; no
    /// auto-resume.
    pub async fn update(&self, new_conf: RelayConf) -> Result<(), RelayError> {
        let origin = self.stage();
        if origin == Stage::Running {
            self.pause_relay().await?;
        }
        self.relay.reload(new_conf).await?;
        if origin == Stage::Running {
            self.resume_relay().await?;
        }
        Ok(())
    }

    /// Observable snapshot. A closed holder always reports `Stopped` with
    /// no result, whatever its internal stage.
    pub fn status(&self) -> RelayStatus {
        if self.closed() {
            return RelayStatus {
                stage: Stage::Stopped,
                result: None,
            };
        }
        let st = self.core.lock();
        RelayStatus {
            stage: st.stage,
            result: st.result.clone(),
        }
    }

    /// Last surfaced error. A closed holder parked in `Paused` reports the
    /// synthetic "relay stopped".
    pub fn error(&self) -> Option<RelayErrorInfo> {
        if self.closed() && self.stage() == Stage::Paused {
            return Some(RelayErrorInfo {
                msg: "relay stopped".to_string(),
            });
        }
        self.core.lock().last_error.clone()
    }

    /// Cancel the pump and park the holder: internal stage `Paused`, outward
    /// stage `Stopped`. Idempotent.
    pub async fn close(&self) {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut slot = self.pump.lock().await;
        self.stop_pump(&mut slot).await;
        self.relay.close().await;
        let mut st = self.core.lock();
        if st.stage != Stage::Stopped {
            st.stage = Stage::Paused;
        }
        info!("relay holder closed");
    }

    pub fn stage(&self) -> Stage {
        self.core.lock().stage
    }

    pub fn result(&self) -> Option<ProcessResult> {
        self.core.lock().result.clone()
    }

    pub fn closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }

    pub fn active_relay_log(&self) -> Option<RelayLogInfo> {
        self.relay.active_relay_log()
    }

    /// Delete the whole relay directory. Full reset; only sensible while
    /// the pump is not running.
    pub async fn purge_relay_dir(&self) -> Result<(), RelayError> {
        self.relay.purge_relay_dir().await
    }

    async fn pause_relay(&self) -> Result<(), RelayError> {
        let mut slot = self.pump.lock().await;
        let stage = self.stage();
        if stage != Stage::Running {
            return Err(invalid_stage(stage));
        }
        self.stop_pump(&mut slot).await;
        self.core.lock().stage = Stage::Paused;
        info!("relay paused");
        Ok(())
    }

    async fn resume_relay(&self) -> Result<(), RelayError> {
        let mut slot = self.pump.lock().await;
        let stage = self.stage();
        if stage != Stage::Paused {
            return Err(invalid_stage(stage));
        }
        self.spawn_pump(&mut slot);
        info!("relay resumed");
        Ok(())
    }

    async fn stop_relay(&self) -> Result<(), RelayError> {
        let mut slot = self.pump.lock().await;
        if self.stage() == Stage::Stopped {
            return Err(invalid_stage(Stage::Stopped));
        }
        self.stop_pump(&mut slot).await;
        self.core.closed.store(true, Ordering::Release);
        self.core.lock().stage = Stage::Stopped;
        info!("relay stopped");
        Ok(())
    }

    /// Spawn the pump task. The observable state flips to `Running` before
    /// the task exists so a pump that exits immediately still lands in
    /// `Paused`.
    fn spawn_pump(&self, slot: &mut PumpSlot) {
        {
            let mut st = self.core.lock();
            st.stage = Stage::Running;
            st.result = None;
            st.last_error = None;
        }

        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let relay = self.relay.clone();
        let core = self.core.clone();
        let handle = tokio::spawn(async move {
            let result = relay.process(child).await;
            let mut st = core.lock();
            st.result = Some(result.clone());
            st.last_error = result
                .errors
                .first()
                .map(|e| RelayErrorInfo { msg: e.msg.clone() });
            // a self-exiting pump pauses the holder; operator transitions
            // have already moved the stage elsewhere
            if st.stage == Stage::Running {
                st.stage = Stage::Paused;
            }
            result
        });

        slot.cancel = cancel;
        slot.handle = Some(handle);
    }

    /// Cancel the pump and wait for it to record its result.
    async fn stop_pump(&self, slot: &mut PumpSlot) {
        slot.cancel.cancel();
        if let Some(handle) = slot.handle.take() {
            if let Err(e) = handle.await {
                error!("relay pump task aborted: {e}");
                let mut st = self.core.lock();
                let result = ProcessResult::with_error(format!("relay pump task aborted: {e}"));
                st.last_error = result
                    .errors
                    .first()
                    .map(|err| RelayErrorInfo { msg: err.msg.clone() });
                st.result = Some(result);
            }
        }
    }
}

fn invalid_stage(stage: Stage) -> RelayError {
    RelayError::InvalidStage(match stage {
        Stage::Stopped => "current stage is already stopped".to_string(),
        other => format!("current stage is {other}"),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::ProcessError;

    use super::*;

    #[derive(Default)]
    struct DummyState {
        init_err: Option<String>,
        reload_err: Option<String>,
        /// Result the pump reports when cancelled.
        process_result: ProcessResult,
        /// When set, the pump exits immediately instead of waiting for
        /// cancellation.
        exit_immediately: bool,
        closed: bool,
    }

    #[derive(Default)]
    struct DummyRelay {
        state: Mutex<DummyState>,
    }

    impl DummyRelay {
        fn lock(&self) -> std::sync::MutexGuard<'_, DummyState> {
            self.state.lock().unwrap()
        }
    }

    #[async_trait]
    impl Process for DummyRelay {
        async fn init(&self) -> Result<(), RelayError> {
            match &self.lock().init_err {
                Some(msg) => Err(RelayError::Other(anyhow::anyhow!("{msg}"))),
                None => Ok(()),
            }
        }

        async fn process(&self, cancel: CancellationToken) -> ProcessResult {
            let exit_now = self.lock().exit_immediately;
            if !exit_now {
                cancel.cancelled().await;
            }
            self.lock().process_result.clone()
        }

        async fn reload(&self, _conf: RelayConf) -> Result<(), RelayError> {
            match &self.lock().reload_err {
                Some(msg) => Err(RelayError::Other(anyhow::anyhow!("{msg}"))),
                None => Ok(()),
            }
        }

        fn active_relay_log(&self) -> Option<RelayLogInfo> {
            None
        }

        async fn purge_relay_dir(&self) -> Result<(), RelayError> {
            Ok(())
        }

        async fn close(&self) {
            self.lock().closed = true;
        }

        fn is_closed(&self) -> bool {
            self.lock().closed
        }
    }

    fn new_holder() -> (RelayHolder, Arc<DummyRelay>) {
        let dummy = Arc::new(DummyRelay::default());
        let for_factory = dummy.clone();
        let holder = RelayHolder::new(
            &RelayConf::default(),
            Box::new(move |_conf| Ok(for_factory.clone() as Arc<dyn Process>)),
        )
        .unwrap();
        (holder, dummy)
    }

    async fn wait_stage(holder: &RelayHolder, expect: Stage) -> bool {
        for _ in 0..100 {
            if holder.stage() == expect {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_holder_lifecycle() {
        let (holder, dummy) = new_holder();

        test_init(&holder, &dummy).await;
        test_start(&holder, &dummy).await;
        test_pause_and_resume(&holder, &dummy).await;
        test_close(&holder, &dummy).await;
        test_stop(&holder).await;
    }

    async fn test_init(holder: &RelayHolder, dummy: &DummyRelay) {
        holder.init().await.unwrap();
        assert_eq!(holder.stage(), Stage::New);

        dummy.lock().init_err = Some("init error".to_string());
        let err = holder.init().await.unwrap_err();
        assert!(err.to_string().contains("init error"));
        assert_eq!(holder.stage(), Stage::New);
        dummy.lock().init_err = None;
    }

    async fn test_start(holder: &RelayHolder, dummy: &DummyRelay) {
        assert_eq!(holder.stage(), Stage::New);
        assert!(!holder.closed());
        assert!(holder.result().is_none());

        holder.start().await;
        assert!(wait_stage(holder, Stage::Running).await);
        assert!(holder.result().is_none());
        assert!(holder.error().is_none());

        let status = holder.status();
        assert_eq!(status.stage, Stage::Running);
        assert!(status.result.is_none());

        // a second start is a no-op
        holder.start().await;
        assert_eq!(holder.stage(), Stage::Running);

        // update pauses, reloads, restores; a failing reload leaves Paused
        test_update(holder, dummy).await;
        assert_eq!(holder.stage(), Stage::Paused);
        assert!(!holder.closed());

        holder.operate(RelayOp::Resume).await.unwrap();
        assert!(wait_stage(holder, Stage::Running).await);
        assert!(holder.result().is_none());
    }

    async fn test_update(holder: &RelayHolder, dummy: &DummyRelay) {
        let origin = holder.stage();
        holder.update(RelayConf::default()).await.unwrap();
        assert!(wait_stage(holder, origin).await);
        assert!(!holder.closed());

        dummy.lock().reload_err = Some("reload error".to_string());
        let err = holder.update(RelayConf::default()).await.unwrap_err();
        assert!(err.to_string().contains("reload error"));
        dummy.lock().reload_err = None;
    }

    async fn test_pause_and_resume(holder: &RelayHolder, dummy: &DummyRelay) {
        holder.operate(RelayOp::Pause).await.unwrap();
        assert_eq!(holder.stage(), Stage::Paused);
        assert!(!holder.closed());

        let err = holder.operate(RelayOp::Pause).await.unwrap_err();
        assert!(err.to_string().contains("current stage is Paused"));

        assert_eq!(holder.status().stage, Stage::Paused);

        test_update(holder, dummy).await;

        holder.operate(RelayOp::Resume).await.unwrap();
        assert!(wait_stage(holder, Stage::Running).await);
        assert!(holder.result().is_none());
        assert!(!holder.closed());

        let err = holder.operate(RelayOp::Resume).await.unwrap_err();
        assert!(err.to_string().contains("current stage is Running"));

        let status = holder.status();
        assert_eq!(status.stage, Stage::Running);
        assert!(status.result.is_none());

        let err = holder.operate(RelayOp::Invalid).await.unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    async fn test_close(holder: &RelayHolder, dummy: &DummyRelay) {
        let injected = ProcessResult {
            is_canceled: true,
            errors: vec![ProcessError::new("process error")],
        };
        dummy.lock().process_result = injected.clone();

        holder.close().await;
        assert!(wait_stage(holder, Stage::Paused).await);
        assert_eq!(holder.result(), Some(injected.clone()));
        assert!(holder.closed());
        assert!(dummy.is_closed());

        // idempotent
        holder.close().await;
        assert_eq!(holder.stage(), Stage::Paused);
        assert_eq!(holder.result(), Some(injected));
        assert!(holder.closed());

        // a closed holder reports Stopped with no result, whatever its
        // internal stage
        let status = holder.status();
        assert_eq!(status.stage, Stage::Stopped);
        assert!(status.result.is_none());

        assert_eq!(holder.error().unwrap().msg, "relay stopped");
    }

    async fn test_stop(holder: &RelayHolder) {
        holder.operate(RelayOp::Stop).await.unwrap();
        assert_eq!(holder.stage(), Stage::Stopped);
        assert!(holder.closed());

        let err = holder.operate(RelayOp::Stop).await.unwrap_err();
        assert!(err.to_string().contains("current stage is already stopped"));
    }

    #[tokio::test]
    async fn test_pump_self_exit_pauses_with_error() {
        let (holder, dummy) = new_holder();
        holder.init().await.unwrap();
        {
            let mut st = dummy.lock();
            st.exit_immediately = true;
            st.process_result = ProcessResult::with_error("reader error for testing");
        }

        holder.start().await;
        assert!(wait_stage(&holder, Stage::Paused).await);

        let result = holder.result().unwrap();
        assert!(!result.is_canceled);
        assert_eq!(result.errors.len(), 1);
        assert!(holder
            .error()
            .unwrap()
            .msg
            .contains("reader error for testing"));
        assert!(!holder.closed());

        // resumable after a self-exit
        dummy.lock().exit_immediately = false;
        holder.operate(RelayOp::Resume).await.unwrap();
        assert!(wait_stage(&holder, Stage::Running).await);
        assert!(holder.result().is_none());
        assert!(holder.error().is_none());
    }

    #[tokio::test]
    async fn test_resume_from_new_is_invalid() {
        let (holder, _) = new_holder();
        let err = holder.operate(RelayOp::Resume).await.unwrap_err();
        assert!(err.to_string().contains("current stage is New"));
    }
}
