//! The planning job: a self-contained unit of work that runs on the planning
//! worker or inline on the render thread.
//!
//! A job owns frozen [`TextureSnapshot`]s taken at the start of the cycle, so
//! it never reads live textures and needs no locks while it runs.

use std::collections::HashMap;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use crate::memory::MemoryState;
use crate::order_key::OrderKey;
use crate::plan::{Schedule, build_plan};
use crate::sorter::{SortParams, SortResult, sort_keys};
use crate::state::{PlannerState, StateCell};
use crate::texture::{FrameInfo, MipRequest, TextureHandle, TextureSnapshot};

/// Inputs of one planning cycle.
#[derive(Debug)]
pub struct PlanningJob {
    /// Tracked and newly requested textures.
    pub snapshots: Vec<TextureSnapshot>,
    /// Mip requests posted since the previous cycle.
    pub requests: Vec<MipRequest>,
    pub frame: FrameInfo,
    pub memory: MemoryState,
    pub prev_bias: i32,
    pub min_mip_fp: i32,
}

/// Result of a planning job, committed on the render thread.
#[derive(Debug)]
pub struct PlanOutput {
    pub schedule: Schedule,
    pub sort: SortResult,
    /// Handles in sorted key order; becomes the tracked list.
    pub order: Vec<TextureHandle>,
    /// The request buffer the job consumed, handed back for write-back and reuse.
    pub requests: Vec<MipRequest>,
}

/// Run a job to completion.
#[must_use]
pub fn run_planning(job: PlanningJob) -> PlanOutput {
    let PlanningJob {
        mut snapshots,
        requests,
        frame,
        memory,
        prev_bias,
        min_mip_fp,
    } = job;

    let slots: HashMap<TextureHandle, usize> = snapshots
        .iter()
        .enumerate()
        .map(|(slot, snapshot)| (snapshot.handle, slot))
        .collect();
    for request in &requests {
        if let Some(&slot) = slots.get(&request.handle) {
            snapshots[slot].apply_mip_request(request);
        }
    }

    let mut keys: Vec<OrderKey> = snapshots
        .iter()
        .enumerate()
        .map(|(slot, snapshot)| OrderKey::build(snapshot, slot as u32, &frame))
        .collect();

    // Seeded by frame so equal inputs always produce equal orders.
    let mut rng = ChaCha8Rng::seed_from_u64(frame.frame_id);
    let params = SortParams {
        stream_limit: memory.stream_limit,
        min_mip_fp,
        prev_bias,
    };
    let sort = sort_keys(&mut keys, &params, &mut rng);

    let mut schedule = build_plan(&snapshots, &keys, &sort, min_mip_fp);
    schedule.frame_id = frame.frame_id;
    schedule.memory = memory;

    trace!(
        textures = keys.len(),
        requests = schedule.requests.len(),
        trims = schedule.trim.len(),
        "Planning job finished"
    );

    PlanOutput {
        schedule,
        sort,
        order: keys.iter().map(OrderKey::handle).collect(),
        requests,
    }
}

/// Run a job, stepping `state` through `Updating` to `QueuedForSync`.
pub fn execute(job: PlanningJob, state: &StateCell) -> PlanOutput {
    let started = state.transition(PlannerState::QueuedForUpdate, PlannerState::Updating);
    debug_assert!(started, "planning job started outside QueuedForUpdate");
    let output = run_planning(job);
    state.set(PlannerState::QueuedForSync);
    output
}
