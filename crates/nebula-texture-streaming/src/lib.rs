//! Texture streaming planner: ranks streamed textures by importance, fits a
//! global mip bias to the pool budget, and turns the result into loads, trims
//! and evictions applied on the render thread.
//!
//! Planning runs as a job on a background worker (or inline), against frozen
//! snapshots of the textures; the committed schedule is applied once per
//! frame through [`TextureStreamer::apply_schedule`].

pub mod allocator;
pub mod bias;
pub mod error;
pub mod io;
pub mod job;
pub mod memory;
pub mod order_key;
pub mod plan;
pub mod pool;
pub mod scheduler;
pub mod select;
pub mod sorter;
pub mod state;
pub mod texture;
mod worker;

pub use allocator::{ApplyReport, ApplySettings, apply_plan, wanted_mip};
pub use bias::{BIAS_HYSTERESIS, MAX_BIAS, MIN_BIAS, apply_hysteresis, solve_bias};
pub use error::StreamingError;
pub use io::{CompositeRequest, QueuedIo, StreamRequest, StreamingIo};
pub use job::{PlanOutput, PlanningJob, run_planning};
pub use memory::{MemoryState, PoolCounters, mem_limit_for};
pub use order_key::OrderKey;
pub use plan::{LoadRequest, Schedule, ScheduleAction, TrimEntry, build_plan, request_sort_key};
pub use pool::{PoolAllocator, PoolItem, PoolLayout, StreamingPool};
pub use scheduler::{StreamingStats, TextureStreamer};
pub use select::select_by_weight;
pub use sorter::{SortParams, SortResult, sort_keys};
pub use state::PlannerState;
pub use texture::{
    FrameInfo, InFlightStream, MIP_FP_ONE, MIP_FP_SHIFT, MipRequest, StreamedTexture,
    TextureArena, TextureDesc, TextureFormat, TextureHandle, TextureSnapshot, Zone,
};
