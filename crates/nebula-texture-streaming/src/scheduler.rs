//! The texture streamer: owns the planner state machine and drives planning
//! jobs and schedule application.
//!
//! Each frame the render thread calls
//! [`begin_update_schedule`](TextureStreamer::begin_update_schedule), which
//! snapshots the tracked textures and launches a planning job, and some time
//! later [`apply_schedule`](TextureStreamer::apply_schedule), which commits the
//! job's plan and performs its side effects:
//!
//! ```text
//! Idle ──begin──▶ QueuedForUpdate ──job──▶ Updating ──job──▶ QueuedForSync
//!  ▲                                                              │ sync
//!  │ apply                                                        ▼
//!  └──────────────── QueuedForScheduleDiscard ◀──release── QueuedForSchedule
//! ```
//!
//! A destroyed texture turns a pending schedule into a discarded one, so a
//! plan that references it is never applied.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nebula_config::StreamingConfig;
use tracing::{debug, error, info, trace, warn};

use crate::allocator::{ApplyReport, ApplySettings, apply_plan};
use crate::error::StreamingError;
use crate::io::StreamingIo;
use crate::job::{PlanOutput, PlanningJob, execute};
use crate::memory::{MemoryState, PoolCounters};
use crate::plan::Schedule;
use crate::pool::PoolAllocator;
use crate::sorter::SortResult;
use crate::state::{PlannerState, StateCell};
use crate::texture::{FrameInfo, MIP_FP_SHIFT, MipRequest, TextureArena, TextureHandle};
use crate::worker::PlanningWorker;

/// Snapshot of the streamer's bookkeeping.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamingStats {
    pub state: PlannerState,
    /// Textures under active tracking.
    pub tracked: usize,
    /// Textures that fit the budget in the last plan.
    pub resident: usize,
    pub precached: usize,
    pub on_screen: usize,
    pub over_budget: bool,
    pub bias: i32,
    /// Projected streamed bytes of the last plan.
    pub list_size: u64,
    pub in_flight: usize,
    /// Allocation failures of the last apply.
    pub alloc_failures: u32,
    /// Planning cycles started.
    pub cycles: u64,
    pub last_apply: ApplyReport,
}

/// Plans and applies texture streaming against a pool and an IO engine.
///
/// All methods take `&self`; the scheduler state sits behind one mutex that
/// is held for short critical sections, except while waiting for an
/// outstanding planning job.
pub struct TextureStreamer<P, I> {
    state: Arc<StateCell>,
    inner: Mutex<Inner<P, I>>,
}

struct Inner<P, I> {
    config: StreamingConfig,
    pool: P,
    io: I,
    worker: Option<PlanningWorker>,
    /// Requests posted since the last cycle started.
    pending_requests: Vec<MipRequest>,
    /// The other half of the request ping-pong, recycled after commit.
    spare_requests: Vec<MipRequest>,
    /// A planning job was launched and its output not yet committed.
    job_pending: bool,
    inline_output: Option<PlanOutput>,
    tracked: Vec<TextureHandle>,
    schedule: Schedule,
    sort: SortResult,
    bias: i32,
    list_size: u64,
    in_flight: usize,
    prev_alloc_failures: u32,
    /// Applies left with caps lifted.
    flush_countdown: u32,
    cycles: u64,
    last_report: ApplyReport,
}

impl<P: PoolAllocator, I: StreamingIo> TextureStreamer<P, I> {
    /// Create a streamer. Spawns the planning worker when `job_update` is on.
    pub fn new(config: StreamingConfig, pool: P, io: I) -> Result<Self, StreamingError> {
        let state = Arc::new(StateCell::new(PlannerState::Idle));
        let worker = if config.job_update {
            Some(PlanningWorker::spawn(Arc::clone(&state))?)
        } else {
            None
        };
        info!(
            pool_bytes = pool.capacity(),
            job_update = config.job_update,
            suppress = config.suppress,
            "Texture streamer created"
        );

        Ok(Self {
            state,
            inner: Mutex::new(Inner {
                config,
                pool,
                io,
                worker,
                pending_requests: Vec::new(),
                spare_requests: Vec::new(),
                job_pending: false,
                inline_output: None,
                tracked: Vec::new(),
                schedule: Schedule::default(),
                sort: SortResult::default(),
                bias: 0,
                list_size: 0,
                in_flight: 0,
                prev_alloc_failures: 0,
                flush_countdown: 0,
                cycles: 0,
                last_report: ApplyReport::default(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<P, I>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state machine state.
    #[must_use]
    pub fn state(&self) -> PlannerState {
        self.state.get()
    }

    /// Post a desired-mip update. Picked up by the next planning cycle, which
    /// also starts tracking the texture.
    pub fn request_mip(&self, request: MipRequest) {
        self.lock().pending_requests.push(request);
    }

    /// Start a planning cycle.
    ///
    /// Commits an outstanding job first. Ignored unless the planner is idle.
    pub fn begin_update_schedule(
        &self,
        textures: &mut TextureArena,
        frame: &FrameInfo,
    ) -> Result<(), StreamingError> {
        let mut inner = self.lock();
        let state = self.state.get();
        if matches!(
            state,
            PlannerState::QueuedForUpdate | PlannerState::Updating | PlannerState::QueuedForSync
        ) {
            self.sync(&mut inner, textures)?;
        }
        if self.state.get() != PlannerState::Idle {
            trace!(state = ?self.state.get(), "Planning cycle already in progress");
            return Ok(());
        }

        inner.cycles += 1;
        let memory = MemoryState::from_counters(&PoolCounters {
            streamed_bytes: inner.pool.reserved_size(),
            bound_persistent_bytes: textures.bound_persistent_bytes(),
            physical_limit: inner.pool.capacity(),
            prev_list_size: inner.list_size,
        });

        if inner.config.suppress || (inner.tracked.is_empty() && inner.pending_requests.is_empty())
        {
            // Keep desired mips current while nothing is planned.
            for request in inner.pending_requests.drain(..) {
                if let Some(texture) = textures.get_mut(request.handle) {
                    texture.apply_mip_request(&request);
                }
            }
            inner.job_pending = false;
            inner.schedule.clear();
            inner.schedule.frame_id = frame.frame_id;
            inner.schedule.memory = memory;
            self.state.set(PlannerState::QueuedForSync);
            return Ok(());
        }

        let mut seen = HashSet::with_capacity(inner.tracked.len());
        let handles = inner
            .tracked
            .iter()
            .copied()
            .chain(inner.pending_requests.iter().map(|request| request.handle));
        let snapshots = handles
            .filter(|handle| seen.insert(*handle))
            .filter_map(|handle| textures.get(handle).map(|t| t.snapshot(handle)))
            .collect();
        let spare = std::mem::take(&mut inner.spare_requests);
        let requests = std::mem::replace(&mut inner.pending_requests, spare);

        let job = PlanningJob {
            snapshots,
            requests,
            frame: *frame,
            memory,
            prev_bias: inner.bias,
            min_mip_fp: i32::from(inner.config.min_mip) << MIP_FP_SHIFT,
        };

        self.state.set(PlannerState::QueuedForUpdate);
        inner.job_pending = true;
        if !inner.config.job_update || inner.worker.is_none() {
            inner.inline_output = Some(execute(job, &self.state));
            return Ok(());
        }
        let submitted = inner
            .worker
            .as_ref()
            .map_or(Err(StreamingError::WorkerDisconnected), |worker| {
                worker.submit(job)
            });
        if let Err(err) = submitted {
            inner.job_pending = false;
            self.state.set(PlannerState::Idle);
            return Err(err);
        }
        Ok(())
    }

    /// Wait for the outstanding job and commit its plan.
    fn sync(
        &self,
        inner: &mut Inner<P, I>,
        textures: &mut TextureArena,
    ) -> Result<(), StreamingError> {
        if inner.job_pending {
            inner.job_pending = false;
            let output = match inner.inline_output.take() {
                Some(output) => Ok(output),
                None => match &inner.worker {
                    Some(worker) => worker.wait(),
                    None => Err(StreamingError::WorkerDisconnected),
                },
            };
            let output = match output {
                Ok(output) => output,
                Err(err) => {
                    self.state.set(PlannerState::Idle);
                    return Err(err);
                }
            };
            Self::commit(inner, output, textures);
        }
        self.state.set(PlannerState::QueuedForSchedule);
        Ok(())
    }

    fn commit(inner: &mut Inner<P, I>, output: PlanOutput, textures: &mut TextureArena) {
        let PlanOutput {
            schedule,
            sort,
            order,
            mut requests,
        } = output;

        for request in &requests {
            if let Some(texture) = textures.get_mut(request.handle) {
                texture.apply_mip_request(request);
            }
        }
        requests.clear();
        inner.spare_requests = requests;

        inner.tracked = order;
        inner.sort = sort;
        inner.bias = sort.bias;
        inner.list_size = schedule.list_size;
        inner.schedule = schedule;

        debug!(
            frame = inner.schedule.frame_id,
            tracked = inner.tracked.len(),
            precached = sort.num_precached,
            balance = sort.balance_point,
            on_screen = sort.on_screen_point,
            bias = sort.bias,
            list_size = inner.list_size,
            "Committed texture streaming plan"
        );
        if sort.is_over_budget() {
            debug!(
                dropped = sort.num_precached - sort.balance_point,
                "Streaming budget exceeded"
            );
        }
    }

    /// Commit the outstanding plan and perform its loads, trims and evictions.
    ///
    /// Does nothing when idle; drops the plan when it was discarded.
    pub fn apply_schedule(
        &self,
        textures: &mut TextureArena,
    ) -> Result<ApplyReport, StreamingError> {
        let mut inner = self.lock();
        let state = self.state.get();
        if matches!(
            state,
            PlannerState::QueuedForUpdate | PlannerState::Updating | PlannerState::QueuedForSync
        ) {
            self.sync(&mut inner, textures)?;
        }

        match self.state.get() {
            PlannerState::QueuedForSchedule => {}
            PlannerState::QueuedForScheduleDiscard => {
                inner.schedule.clear();
                self.state.set(PlannerState::Idle);
                debug!("Discarded stale streaming schedule");
                return Ok(ApplyReport::default());
            }
            _ => return Ok(ApplyReport::default()),
        }

        let settings = ApplySettings::from_config(
            &inner.config,
            inner.flush_countdown > 0,
            inner.prev_alloc_failures,
        );
        let Inner {
            schedule,
            tracked,
            pool,
            io,
            in_flight,
            ..
        } = &mut *inner;
        let report = apply_plan(schedule, textures, tracked, pool, io, in_flight, &settings);

        inner.prev_alloc_failures = report.alloc_failures;
        inner.flush_countdown = inner.flush_countdown.saturating_sub(1);
        inner.schedule.clear();
        inner.last_report = report.clone();
        self.state.set(PlannerState::Idle);
        Ok(report)
    }

    /// Destroy a texture, dropping any pending plan that refers to it.
    ///
    /// Must not be called while a planning job is running.
    pub fn release_texture(
        &self,
        textures: &mut TextureArena,
        handle: TextureHandle,
    ) -> Result<(), StreamingError> {
        let mut inner = self.lock();
        if !textures.contains(handle) {
            return Err(StreamingError::InvalidHandle(handle));
        }

        let state = self.state.get();
        let planning = state.is_planning();
        if planning {
            error!(?handle, ?state, "Texture released while a planning job is in flight");
        }
        debug_assert!(!planning, "texture released while a planning job is in flight");
        if state == PlannerState::QueuedForSync || planning {
            self.sync(&mut inner, textures)?;
        }

        if self.state.get() == PlannerState::QueuedForSchedule
            && (inner.tracked.contains(&handle) || inner.schedule.references(handle))
        {
            self.state.set(PlannerState::QueuedForScheduleDiscard);
            debug!(?handle, "Pending streaming schedule discarded");
        }

        inner.tracked.retain(|tracked| *tracked != handle);
        inner.pending_requests.retain(|request| request.handle != handle);

        let Some(mut texture) = textures.remove(handle) else {
            return Err(StreamingError::InvalidHandle(handle));
        };
        if let Some(stream) = texture.take_stream() {
            inner.io.cancel_streaming(handle);
            inner.pool.release(stream.item);
            inner.in_flight = inner.in_flight.saturating_sub(1);
        }
        if let Some(item) = texture.take_pool_item() {
            inner.pool.release(item);
        }
        Ok(())
    }

    /// Report the end of a load started by the IO engine.
    ///
    /// `pool_item` is the item id from the [`StreamRequest`](crate::StreamRequest).
    /// Completions for a load that was aborted or replaced since are ignored.
    /// On success the texture switches to the loaded mips and its previous
    /// item goes back to the pool; on failure the load's item does.
    pub fn complete_streaming(
        &self,
        textures: &mut TextureArena,
        handle: TextureHandle,
        pool_item: u64,
        success: bool,
    ) -> Result<(), StreamingError> {
        let mut inner = self.lock();
        let texture = textures
            .get_mut(handle)
            .ok_or(StreamingError::InvalidHandle(handle))?;
        let Some(current) = texture.stream().map(|stream| stream.item.id()) else {
            warn!(?handle, "Streaming completion for a texture with no load in flight");
            return Ok(());
        };
        if current != pool_item {
            debug!(?handle, pool_item, current, "Ignoring completion of a superseded load");
            return Ok(());
        }
        if let Some(item) = texture.finish_stream(success) {
            inner.pool.release(item);
        }
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if success {
            trace!(?handle, mip = texture.resident_mip(), "Texture load completed");
        } else {
            debug!(?handle, "Texture load failed");
        }
        Ok(())
    }

    /// Lift the per-cycle job and byte caps for the next `flush_frames` applies.
    pub fn flush_all(&self) {
        let mut inner = self.lock();
        inner.flush_countdown = inner.config.flush_frames.max(1);
        info!(applies = inner.flush_countdown, "Flushing all pending texture loads");
    }

    /// Whether the last plan could not fit every precached texture.
    #[must_use]
    pub fn is_overflowing(&self) -> bool {
        self.lock().sort.is_over_budget()
    }

    #[must_use]
    pub fn stats(&self) -> StreamingStats {
        let inner = self.lock();
        StreamingStats {
            state: self.state.get(),
            tracked: inner.tracked.len(),
            resident: inner.sort.balance_point,
            precached: inner.sort.num_precached,
            on_screen: inner.sort.on_screen_point,
            over_budget: inner.sort.is_over_budget(),
            bias: inner.bias,
            list_size: inner.list_size,
            in_flight: inner.in_flight,
            alloc_failures: inner.prev_alloc_failures,
            cycles: inner.cycles,
            last_apply: inner.last_report.clone(),
        }
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> StreamingConfig {
        self.lock().config.clone()
    }

    /// Replace the configuration, starting or stopping the planning worker
    /// when `job_update` changes.
    pub fn set_config(&self, config: StreamingConfig) -> Result<(), StreamingError> {
        let mut inner = self.lock();
        if config.job_update && inner.worker.is_none() {
            inner.worker = Some(PlanningWorker::spawn(Arc::clone(&self.state))?);
        } else if !config.job_update && !inner.job_pending {
            inner.worker = None;
        }
        info!(
            job_update = config.job_update,
            suppress = config.suppress,
            "Texture streaming config updated"
        );
        inner.config = config;
        Ok(())
    }

    /// Run `f` with the pool.
    pub fn with_pool<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut self.lock().pool)
    }

    /// Run `f` with the IO engine.
    pub fn with_io<R>(&self, f: impl FnOnce(&mut I) -> R) -> R {
        f(&mut self.lock().io)
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
