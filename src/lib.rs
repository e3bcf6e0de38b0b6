// src/lib.rs
//! meshpipe — realtime parameter-update and render-caching pipeline.
//!
//! Sits between a live-editing front end and an expensive external geometry
//! compiler. Edits coalesce over a sliding quiet window, compiles are
//! serialized (at most one in flight), and identical (source, parameters)
//! pairs are served from a bounded content-addressed cache instead of
//! re-invoking the compiler.
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshpipe::{PipelineConfig, RealtimeCoordinator};
//! # use std::future::Future;
//! # use meshpipe::{GeometryCompiler, RenderSink, Result};
//! # struct Scad; struct Viewport;
//! # impl GeometryCompiler for Scad {
//! #     fn compile(&self, _s: String) -> impl Future<Output = Result<Vec<u8>>> + Send {
//! #         async { Ok(Vec::new()) }
//! #     }
//! # }
//! # impl RenderSink for Viewport {
//! #     fn current_source_text(&self) -> String { String::new() }
//! #     fn receive_mesh(&self, _m: Arc<[u8]>) -> impl Future<Output = ()> + Send { async {} }
//! # }
//!
//! # async fn demo() {
//! let compiler = Arc::new(Scad);
//! let viewport = Arc::new(Viewport);
//! let pipeline = RealtimeCoordinator::new(
//!     PipelineConfig::default(),
//!     compiler,
//!     Arc::downgrade(&viewport),
//! );
//! pipeline.update_parameter("size", 12.0.into(), false).await;
//! # }
//! ```

pub mod cache;
pub mod coordinator;
pub mod error;
pub mod params;
pub mod scheduler;

pub use cache::{CacheConfig, CacheKey, CacheStats, RenderCache};
pub use coordinator::{
    GeometryCompiler, NoopBinding, ParameterBinding, PerformanceStats, PipelineConfig,
    RealtimeCoordinator, RenderSink,
};
pub use error::{Error, Result};
pub use params::ParamValue;
pub use scheduler::{CoalescingScheduler, RenderTrigger, SchedulerStats};
