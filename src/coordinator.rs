// src/coordinator.rs
//! Realtime render coordinator
//! - Owns one coalescing scheduler and one render cache
//! - Serializes compiles: at most one in flight, follow-ups queue and drain
//! - Pushes finished mesh bytes to a non-owning display sink
//!
//! The coordinator is the boundary where render-path failures stop: a failed
//! compile is logged and the previous mesh stays on screen for that cycle.
//! Nothing in here propagates errors back to `update_parameter` callers or to
//! the scheduler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::Instant;

use crate::cache::{CacheConfig, CacheStats, RenderCache};
use crate::params::ParamValue;
use crate::scheduler::{CoalescingScheduler, RenderTrigger, SchedulerStats};
use crate::{Error, Result};

// ---------- External collaborators ----------

/// The expensive external geometry compiler (an OpenSCAD-compatible tool).
/// Safe to call repeatedly with identical input; a call may take seconds.
pub trait GeometryCompiler: Send + Sync {
    fn compile(&self, source: String) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// External holder of the current source text and receiver of finished mesh
/// bytes. Held by `Weak` reference so the pipeline never extends the lifetime
/// of a UI object it does not own.
pub trait RenderSink: Send + Sync {
    fn current_source_text(&self) -> String;
    fn receive_mesh(&self, mesh: Arc<[u8]>) -> impl Future<Output = ()> + Send;
}

/// Applies one named parameter to the model source, returning the rewritten
/// source text, or `None` when the binding does not rewrite anything.
pub trait ParameterBinding: Send + Sync {
    fn apply_parameter(&self, name: &str, value: &ParamValue) -> Option<String>;
}

/// Default binding: parameter-to-source rewriting is not wired up, so forced
/// updates render the sink's current text unchanged.
pub struct NoopBinding;

impl ParameterBinding for NoopBinding {
    fn apply_parameter(&self, name: &str, _value: &ParamValue) -> Option<String> {
        log::debug!("no parameter binding configured; '{}' not applied to source", name);
        None
    }
}

// ---------- Config ----------

pub struct PipelineConfig {
    /// Inactivity required before a batch of changes triggers a render.
    pub quiet_window: Duration,
    pub cache: CacheConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quiet_window: Duration::from_millis(250),
            cache: CacheConfig::default(),
        }
    }
}

// ---------- Stats ----------

#[derive(Default)]
struct PerfCounters {
    renders: u64,
    total: Duration,
    last: Duration,
}

/// Composite snapshot for the out-of-scope UI layer.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    pub render_count: u64,
    pub average_render_ms: f64,
    pub last_render_ms: f64,
    pub render_in_flight: bool,
    pub queued_renders: u32,
    pub cache: CacheStats,
    pub scheduler: SchedulerStats,
}

// ---------- Coordinator ----------

pub struct RealtimeCoordinator<C, S> {
    scheduler: CoalescingScheduler,
    cache: RenderCache,
    compiler: Arc<C>,
    sink: Weak<S>,
    binding: Box<dyn ParameterBinding>,

    /// True for exactly the duration of one active render.
    in_flight: AtomicBool,
    /// Follow-ups that arrived while a render was in flight; drained strictly
    /// after that render completes.
    queued: AtomicU32,
    perf: Mutex<PerfCounters>,
    /// Latest value seen for every parameter name; drained renders read this
    /// rather than a stale snapshot from when they were queued.
    current_params: Mutex<HashMap<String, ParamValue>>,
}

impl<C, S> RealtimeCoordinator<C, S>
where
    C: GeometryCompiler + 'static,
    S: RenderSink + 'static,
{
    pub fn new(config: PipelineConfig, compiler: Arc<C>, sink: Weak<S>) -> Arc<Self> {
        Self::with_binding(config, compiler, sink, Box::new(NoopBinding))
    }

    /// Construct with an explicit parameter-binding collaborator. Must be
    /// called inside a tokio runtime: the trigger-consumer loop is spawned
    /// here.
    pub fn with_binding(
        config: PipelineConfig,
        compiler: Arc<C>,
        sink: Weak<S>,
        binding: Box<dyn ParameterBinding>,
    ) -> Arc<Self> {
        let scheduler = CoalescingScheduler::new(config.quiet_window);
        let (trigger_tx, mut trigger_rx) = unbounded_channel();
        scheduler.set_trigger(trigger_tx);

        let coordinator = Arc::new(Self {
            scheduler,
            cache: RenderCache::new(config.cache),
            compiler,
            sink,
            binding,
            in_flight: AtomicBool::new(false),
            queued: AtomicU32::new(0),
            perf: Mutex::new(PerfCounters::default()),
            current_params: Mutex::new(HashMap::new()),
        });

        // Single consumer of the scheduler's trigger queue. Holding only a
        // Weak here lets the coordinator shut down when its last owner drops.
        let weak = Arc::downgrade(&coordinator);
        tokio::spawn(async move {
            while let Some(trigger) = trigger_rx.recv().await {
                let Some(coordinator) = weak.upgrade() else { break };
                if let RenderTrigger::ParameterBatch(batch) = trigger {
                    coordinator.absorb_batch(batch);
                }
                coordinator.on_quiet_period_elapsed().await;
            }
        });

        coordinator
    }

    // ---------- Public API ----------

    /// Record a parameter edit. Unforced edits flow through the coalescing
    /// scheduler; forced edits apply the parameter via the binding hook and
    /// render immediately, bypassing the quiet window.
    pub async fn update_parameter(&self, name: &str, value: ParamValue, force: bool) {
        self.current_params
            .lock()
            .insert(name.to_string(), value.clone());

        if force {
            let source_override = self.binding.apply_parameter(name, &value);
            self.trigger_render(source_override).await;
        } else {
            self.scheduler.update_parameter(name.to_string(), value);
        }
    }

    /// Compile `source` with `params`, going through the cache unless
    /// `use_cache` is false.
    pub async fn render_source(
        &self,
        source: &str,
        params: &HashMap<String, ParamValue>,
        use_cache: bool,
    ) -> Result<Arc<[u8]>> {
        if source.is_empty() {
            return Err(Error::EmptySource);
        }
        if !use_cache {
            let bytes = self.compiler.compile(source.to_string()).await?;
            return Ok(bytes.into());
        }
        let key = RenderCache::compute_key(source, params);
        self.cache
            .get_or_render(key, || self.compiler.compile(source.to_string()))
            .await
    }

    /// Render the sink's current state now. Never returns an error: failures
    /// are logged at this boundary and the in-flight flag always clears.
    pub async fn render_now(&self) {
        self.trigger_render(None).await;
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn set_quiet_window(&self, quiet_window: Duration) {
        self.scheduler.set_quiet_window(quiet_window);
    }

    pub fn is_render_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn queued_renders(&self) -> u32 {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn average_render_time(&self) -> Duration {
        let perf = self.perf.lock();
        if perf.renders == 0 {
            Duration::ZERO
        } else {
            perf.total / perf.renders as u32
        }
    }

    pub fn performance_stats(&self) -> PerformanceStats {
        let (render_count, total, last) = {
            let perf = self.perf.lock();
            (perf.renders, perf.total, perf.last)
        };
        let average_render_ms = if render_count == 0 {
            0.0
        } else {
            total.as_secs_f64() * 1000.0 / render_count as f64
        };
        PerformanceStats {
            render_count,
            average_render_ms,
            last_render_ms: last.as_secs_f64() * 1000.0,
            render_in_flight: self.is_render_in_flight(),
            queued_renders: self.queued_renders(),
            cache: self.cache.stats(),
            scheduler: self.scheduler.stats(),
        }
    }

    // ---------- Render orchestration ----------

    fn absorb_batch(&self, batch: HashMap<String, ParamValue>) {
        let mut params = self.current_params.lock();
        for (name, value) in batch {
            params.insert(name, value);
        }
    }

    async fn on_quiet_period_elapsed(&self) {
        self.trigger_render(None).await;
    }

    /// Serialization gate: exactly one render runs at a time. A caller that
    /// finds a render in flight queues a follow-up and returns immediately;
    /// the running pass drains the queue after it completes, one render per
    /// ticket, re-reading current sink state on every pass.
    async fn trigger_render(&self, source_override: Option<String>) {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let depth = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
            log::debug!("render in flight; follow-up queued (depth {})", depth);
            return;
        }

        let mut source_override = source_override;
        loop {
            self.render_pass(source_override.take()).await;
            self.in_flight.store(false, Ordering::SeqCst);

            let drained = self
                .queued
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| q.checked_sub(1))
                .is_ok();
            if !drained {
                break;
            }
            if self
                .in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // Another caller took the flag between passes; their render
                // serves the same fresh state this ticket asked for.
                log::debug!("drain handed off to a newly started render");
                break;
            }
        }
    }

    /// One render: resolve the sink, read current source and parameters,
    /// compile (cached), push the mesh. Compile failures are logged here and
    /// go no further; the sink keeps its previous mesh.
    async fn render_pass(&self, source_override: Option<String>) {
        let Some(sink) = self.sink.upgrade() else {
            // Expected during teardown, hence debug not error.
            log::debug!("{}; aborting render", Error::SinkUnreachable);
            return;
        };

        let source = match source_override {
            Some(source) => source,
            None => sink.current_source_text(),
        };
        if source.is_empty() {
            log::debug!("no source text to render; skipping");
            return;
        }

        let params = self.current_params.lock().clone();
        let started = Instant::now();
        match self.render_source(&source, &params, true).await {
            Ok(mesh) => {
                sink.receive_mesh(mesh).await;
                let took = started.elapsed();
                let renders = {
                    let mut perf = self.perf.lock();
                    perf.renders += 1;
                    perf.total += took;
                    perf.last = took;
                    perf.renders
                };
                log::info!(
                    "render #{} finished in {:.1}ms",
                    renders,
                    took.as_secs_f64() * 1000.0
                );
            }
            Err(err) => {
                log::error!("render failed: {}", err);
            }
        }
    }
}
