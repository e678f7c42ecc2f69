//! Process-lifecycle state and runtime tuning.
//!
//! [`RuntimeContext`] owns every process-global toggle the launch touches:
//! memory-reclamation suspension, the dedicated execution stream, the at-exit
//! hook registry and the worker start method. Tests build one per case.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{LaunchError, Result};
use crate::metrics::LaunchMetrics;
use crate::shutdown::ExitHooks;

/// How child worker processes are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMethod {
    /// Fresh process, nothing inherited from the launcher.
    Spawn,
    /// Copy of the launcher process.
    Fork,
}

/// Identifier of an accelerator execution stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamHandle(pub u64);

/// The stream every device starts on.
pub const DEFAULT_STREAM: StreamHandle = StreamHandle(0);

/// Automatic memory reclamation of the host runtime.
pub trait MemoryReclaimer: Send + Sync {
    /// Stop automatic reclamation for the rest of the process.
    fn suspend(&self) -> anyhow::Result<()>;
}

/// The active accelerator device.
pub trait Accelerator: Send + Sync {
    fn device_name(&self) -> String;

    /// Create a new, non-default stream.
    fn create_stream(&self) -> anyhow::Result<StreamHandle>;

    /// Make `stream` current for all subsequent work from this process.
    fn set_current_stream(&self, stream: StreamHandle) -> anyhow::Result<()>;
}

/// Reclaimer for hosts without a managed collector; records the suspension only.
#[derive(Debug, Default)]
pub struct HostReclaimer {
    suspended: AtomicBool,
}

impl HostReclaimer {
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }
}

impl MemoryReclaimer for HostReclaimer {
    fn suspend(&self) -> anyhow::Result<()> {
        self.suspended.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Host-side accelerator with logical streams and no device work.
#[derive(Debug, Default)]
pub struct HostAccelerator {
    created: AtomicU64,
    current: AtomicU64,
}

impl HostAccelerator {
    pub fn current_stream(&self) -> StreamHandle {
        StreamHandle(self.current.load(Ordering::SeqCst))
    }

    pub fn streams_created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }
}

impl Accelerator for HostAccelerator {
    fn device_name(&self) -> String {
        "host".to_string()
    }

    fn create_stream(&self) -> anyhow::Result<StreamHandle> {
        let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(StreamHandle(id))
    }

    fn set_current_stream(&self, stream: StreamHandle) -> anyhow::Result<()> {
        self.current.store(stream.0, Ordering::SeqCst);
        Ok(())
    }
}

/// What runtime tuning applied; set once per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuningState {
    pub stream: StreamHandle,
}

/// Process-lifecycle state shared by the launch components.
pub struct RuntimeContext {
    reclaimer: Arc<dyn MemoryReclaimer>,
    accelerator: Arc<dyn Accelerator>,
    exit_hooks: ExitHooks,
    start_method: StartMethod,
    tuning: OnceLock<TuningState>,
    metrics: LaunchMetrics,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("device", &self.accelerator.device_name())
            .field("start_method", &self.start_method)
            .field("tuning", &self.tuning.get())
            .field("exit_hooks", &self.exit_hooks)
            .finish()
    }
}

impl RuntimeContext {
    /// Context with the worker start method fixed to [`StartMethod::Spawn`].
    pub fn new(reclaimer: Arc<dyn MemoryReclaimer>, accelerator: Arc<dyn Accelerator>) -> Self {
        Self {
            reclaimer,
            accelerator,
            exit_hooks: ExitHooks::new(),
            start_method: StartMethod::Spawn,
            tuning: OnceLock::new(),
            metrics: LaunchMetrics::new(),
        }
    }

    /// Context backed by [`HostReclaimer`] and [`HostAccelerator`].
    pub fn detached() -> Self {
        Self::new(
            Arc::new(HostReclaimer::default()),
            Arc::new(HostAccelerator::default()),
        )
    }

    pub fn start_method(&self) -> StartMethod {
        self.start_method
    }

    pub fn exit_hooks(&self) -> &ExitHooks {
        &self.exit_hooks
    }

    pub fn metrics(&self) -> &LaunchMetrics {
        &self.metrics
    }

    pub fn accelerator(&self) -> &Arc<dyn Accelerator> {
        &self.accelerator
    }

    /// The applied tuning, once [`RuntimeContext::apply_runtime_tuning`] has run.
    pub fn tuning(&self) -> Option<TuningState> {
        self.tuning.get().copied()
    }

    /// Suspend memory reclamation and bind a dedicated stream, for the rest
    /// of the process. Neither effect is ever undone.
    ///
    /// Applied at most once per context; later calls return `Ok(false)`.
    pub fn apply_runtime_tuning(&self) -> Result<bool> {
        if self.tuning.get().is_some() {
            debug!("runtime tuning already applied");
            return Ok(false);
        }

        self.reclaimer
            .suspend()
            .map_err(|source| LaunchError::RuntimeTuning { source })?;

        let stream = self
            .accelerator
            .create_stream()
            .map_err(|source| LaunchError::RuntimeTuning { source })?;
        self.accelerator
            .set_current_stream(stream)
            .map_err(|source| LaunchError::RuntimeTuning { source })?;

        let _ = self.tuning.set(TuningState { stream });
        info!(
            device = %self.accelerator.device_name(),
            stream = stream.0,
            "memory reclamation suspended, dedicated stream bound"
        );
        crate::obs::emit_runtime_tuned(stream.0);
        Ok(true)
    }
}
