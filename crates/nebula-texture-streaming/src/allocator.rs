//! Applies a committed schedule on the render thread: garbage collection,
//! aborts, trimming, eviction ("kicking") and load submission.

use std::collections::HashSet;

use nebula_config::StreamingConfig;
use tracing::{debug, trace, warn};

use crate::io::{CompositeRequest, StreamRequest, StreamingIo};
use crate::memory::mem_limit_for;
use crate::plan::{LoadRequest, Schedule, ScheduleAction};
use crate::pool::PoolAllocator;
use crate::texture::{InFlightStream, TextureArena, TextureDesc, TextureHandle};

/// Cached items freed per apply after a clean cycle.
pub const GC_ITEMS_DEFAULT: usize = 2;
/// Cached items freed per apply after a cycle with allocation failures.
pub const GC_ITEMS_AFTER_FAILURE: usize = 1000;
/// GC ceiling in percent of the soft limit on non-console platforms.
pub const GC_LIMIT_PERCENT: u64 = 120;

/// Per-apply knobs, resolved from [`StreamingConfig`] and runtime state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ApplySettings {
    pub suppress: bool,
    pub console_gc: bool,
    pub max_requested_jobs: usize,
    pub max_requested_bytes: u64,
    pub max_in_flight: usize,
    pub postpone_threshold_bytes: u64,
    pub postpone_threshold_mip: u8,
    pub prestream: bool,
    /// A flush is pending: job and byte caps do not apply.
    pub caps_lifted: bool,
    /// Allocation failures of the previous apply.
    pub prev_alloc_failures: u32,
}

impl ApplySettings {
    #[must_use]
    pub fn from_config(
        config: &StreamingConfig,
        caps_lifted: bool,
        prev_alloc_failures: u32,
    ) -> Self {
        Self {
            suppress: config.suppress,
            console_gc: config.console_gc,
            max_requested_jobs: config.max_requested_jobs as usize,
            max_requested_bytes: config.max_requested_bytes(),
            max_in_flight: config.max_in_flight as usize,
            postpone_threshold_bytes: config.postpone_threshold_bytes(),
            postpone_threshold_mip: config.postpone_threshold_mip,
            prestream: config.prestream,
            caps_lifted,
            prev_alloc_failures,
        }
    }
}

/// What one apply did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Item cap passed to the pool's garbage collection.
    pub gc_max_items: usize,
    pub gc_freed: usize,
    pub aborted: usize,
    pub trimmed: usize,
    pub kicked: usize,
    /// Reads handed to the IO engine.
    pub started: usize,
    pub composites_started: usize,
    /// Composites whose sources were not ready.
    pub composites_deferred: usize,
    pub io_refused: usize,
    pub alloc_failures: u32,
    pub bytes_requested: u64,
    pub unlinked: usize,
    /// The request loop stopped at a job, byte or in-flight cap.
    pub capped: bool,
}

/// Finest mip to actually request for a load planned up to `target`.
///
/// `avail` is the texture's finest resident mip.
#[must_use]
pub fn wanted_mip(
    desc: &TextureDesc,
    avail: u8,
    target: u8,
    urgent: bool,
    settings: &ApplySettings,
) -> u8 {
    if settings.prestream {
        return if target == 0 && avail > 1 { 1 } else { target };
    }
    if urgent {
        return target;
    }
    let mut wanted = target;
    while wanted + 1 < avail
        && wanted < settings.postpone_threshold_mip
        && desc.mip_size(wanted) > settings.postpone_threshold_bytes
    {
        wanted += 1;
    }
    wanted
}

/// Apply `schedule` against the live textures.
///
/// `tracked` is the committed tracking order; unlinked and destroyed handles
/// are removed from it.
pub fn apply_plan<P: PoolAllocator, I: StreamingIo>(
    schedule: &Schedule,
    textures: &mut TextureArena,
    tracked: &mut Vec<TextureHandle>,
    pool: &mut P,
    io: &mut I,
    in_flight: &mut usize,
    settings: &ApplySettings,
) -> ApplyReport {
    let mem_limit = mem_limit_for(pool.capacity()).max(0) as u64;
    let mut applier = Applier {
        schedule,
        textures: &mut *textures,
        tracked: tracked.as_slice(),
        pool: &mut *pool,
        io: &mut *io,
        in_flight: &mut *in_flight,
        mem_limit,
        trim_cursor: 0,
        kick_cursor: 0,
        report: ApplyReport::default(),
    };

    applier.collect_garbage(settings);
    applier.abort_loads();
    applier.relieve(0, None, settings.suppress);
    if !settings.suppress {
        applier.submit_requests(settings);
    }
    let mut report = applier.report;

    let before = tracked.len();
    let unlink: HashSet<TextureHandle> = schedule.unlink.iter().copied().collect();
    tracked.retain(|handle| !unlink.contains(handle) && textures.contains(*handle));
    report.unlinked = before - tracked.len();

    if report.alloc_failures > 0 {
        warn!(
            failures = report.alloc_failures,
            reserved = pool.reserved_size(),
            mem_limit,
            "Texture pool could not satisfy streaming requests"
        );
    }
    debug!(
        started = report.started,
        composites = report.composites_started,
        trimmed = report.trimmed,
        kicked = report.kicked,
        aborted = report.aborted,
        unlinked = report.unlinked,
        gc_freed = report.gc_freed,
        "Applied streaming schedule"
    );
    report
}

struct Applier<'a, P, I> {
    schedule: &'a Schedule,
    textures: &'a mut TextureArena,
    tracked: &'a [TextureHandle],
    pool: &'a mut P,
    io: &'a mut I,
    in_flight: &'a mut usize,
    mem_limit: u64,
    /// Trim entries consumed, walking the list from its end.
    trim_cursor: usize,
    /// Tracked entries examined for kicking, walking from the end.
    kick_cursor: usize,
    report: ApplyReport,
}

impl<P: PoolAllocator, I: StreamingIo> Applier<'_, P, I> {
    fn collect_garbage(&mut self, settings: &ApplySettings) {
        let target = if settings.console_gc {
            self.mem_limit
        } else {
            self.mem_limit * GC_LIMIT_PERCENT / 100
        };
        let max_items = if settings.prev_alloc_failures > 0 {
            GC_ITEMS_AFTER_FAILURE
        } else {
            GC_ITEMS_DEFAULT
        };
        let mut current = self.pool.allocated_size();
        self.report.gc_max_items = max_items;
        self.report.gc_freed = self.pool.garbage_collect(&mut current, target, max_items);
    }

    fn abort_loads(&mut self) {
        let schedule = self.schedule;
        for action in &schedule.actions {
            let ScheduleAction::Abort(handle) = *action;
            let Some(stream) = self.textures.get_mut(handle).and_then(|t| t.take_stream()) else {
                continue;
            };
            self.io.cancel_streaming(handle);
            self.pool.release(stream.item);
            *self.in_flight = self.in_flight.saturating_sub(1);
            self.report.aborted += 1;
            trace!(?handle, target = stream.target_mip, "Aborted overshooting load");
        }
    }

    /// Trim, then optionally kick, until `needed` more bytes fit the soft limit.
    fn relieve(&mut self, needed: u64, requester: Option<TextureHandle>, allow_kick: bool) -> bool {
        loop {
            if self.pool.reserved_size() + needed <= self.mem_limit {
                return true;
            }
            if self.trim_next() {
                continue;
            }
            if allow_kick && self.kick_next(requester) {
                continue;
            }
            return false;
        }
    }

    fn trim_next(&mut self) -> bool {
        let schedule = self.schedule;
        let Some(index) = schedule.trim.len().checked_sub(self.trim_cursor + 1) else {
            return false;
        };
        self.trim_cursor += 1;
        let entry = schedule.trim[index];
        if self.shrink(entry.handle, entry.target_mip) {
            self.report.trimmed += 1;
        }
        true
    }

    fn kick_next(&mut self, requester: Option<TextureHandle>) -> bool {
        let remaining = self.tracked.len().saturating_sub(self.kick_cursor);
        if remaining <= self.schedule.balance_point {
            return false;
        }
        self.kick_cursor += 1;
        let handle = self.tracked[remaining - 1];
        if Some(handle) == requester {
            return true;
        }
        let Some(persistent) = self.textures.get(handle).map(|t| t.desc().persistent_mip()) else {
            return true;
        };
        if self.shrink(handle, persistent) {
            self.report.kicked += 1;
            trace!(?handle, "Kicked texture to its persistent mip");
        }
        true
    }

    /// Move a resident texture into a smaller item holding `mip` down.
    fn shrink(&mut self, handle: TextureHandle, mip: u8) -> bool {
        let Some(texture) = self.textures.get_mut(handle) else {
            return false;
        };
        if texture.is_streaming() || texture.is_unloaded() || texture.resident_mip() >= mip {
            return false;
        }
        let Some(item) = self.pool.try_reserve(texture.desc(), mip, true) else {
            return false;
        };
        if let Some(old) = texture.shrink_into(item, mip) {
            self.pool.release(old);
        }
        true
    }

    fn submit_requests(&mut self, settings: &ApplySettings) {
        let schedule = self.schedule;
        self.io.begin_read_group();
        for request in &schedule.requests {
            if *self.in_flight >= settings.max_in_flight {
                self.report.capped = true;
                break;
            }
            let submitted = self.report.started + self.report.composites_started;
            if !settings.caps_lifted
                && (submitted >= settings.max_requested_jobs
                    || self.report.bytes_requested >= settings.max_requested_bytes)
            {
                self.report.capped = true;
                break;
            }
            self.submit(request, settings);
        }
        self.io.end_read_group();
    }

    fn submit(&mut self, request: &LoadRequest, settings: &ApplySettings) {
        let handle = request.handle;
        let Some(texture) = self.textures.get(handle) else {
            return;
        };
        if texture.is_streaming() || texture.resident_mip() <= request.target_mip {
            return;
        }
        let desc = *texture.desc();
        let avail = texture.resident_mip();
        let urgent = texture.high_priority || texture.force_high_res;
        let priority_class = texture.priority_class;
        let sources = texture.composite_sources.clone();
        let wanted = wanted_mip(&desc, avail, request.target_mip, urgent, settings);

        let needed = desc.size_from_mip(wanted);
        if !self.relieve(needed, Some(handle), true) {
            self.report.alloc_failures += 1;
            trace!(?handle, needed, "No headroom for load");
            return;
        }
        let Some(item) = self.pool.try_reserve(&desc, wanted, true) else {
            self.report.alloc_failures += 1;
            trace!(?handle, needed, "Pool refused load reservation");
            return;
        };

        let started = if sources.is_empty() {
            let stream = StreamRequest {
                handle,
                pool_item: item.id(),
                wanted_mip: wanted,
                last_mip: avail - 1,
                activate_mip: wanted,
                priority_class,
                bytes: desc.size_from_mip(wanted) - desc.size_from_mip(avail),
            };
            let started = self.io.start_streaming(&stream);
            if started {
                self.report.started += 1;
                self.report.bytes_requested += stream.bytes;
            }
            started
        } else {
            if !self.sources_ready(&sources, wanted) {
                self.pool.release(item);
                self.report.composites_deferred += 1;
                return;
            }
            let composite = CompositeRequest {
                handle,
                pool_item: item.id(),
                wanted_mip: wanted,
                last_mip: avail - 1,
                sources,
            };
            let started = self.io.start_composite(&composite);
            if started {
                self.report.composites_started += 1;
            }
            started
        };

        if !started {
            self.pool.release(item);
            self.report.io_refused += 1;
            return;
        }
        if let Some(texture) = self.textures.get_mut(handle) {
            texture.begin_stream(InFlightStream {
                item,
                target_mip: wanted,
                started_frame: self.schedule.frame_id,
            });
            *self.in_flight += 1;
        }
    }

    fn sources_ready(&self, sources: &[TextureHandle], mip: u8) -> bool {
        sources.iter().all(|&source| {
            self.textures
                .get(source)
                .is_some_and(|t| !t.is_unloaded() && !t.is_streaming() && t.resident_mip() <= mip)
        })
    }
}

#[cfg(test)]
#[path = "allocator_tests.rs"]
mod tests;
