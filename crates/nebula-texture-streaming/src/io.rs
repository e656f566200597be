//! Asynchronous IO engine contract.
//!
//! The streamer only initiates work: reads are bracketed by
//! [`StreamingIo::begin_read_group`] / [`StreamingIo::end_read_group`] and
//! completion is reported back through
//! [`TextureStreamer::complete_streaming`](crate::TextureStreamer::complete_streaming).

use crate::texture::TextureHandle;

/// A read of mips `wanted_mip..=last_mip` into a reserved pool item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    pub handle: TextureHandle,
    /// Id of the pool item the data lands in.
    pub pool_item: u64,
    /// Finest mip to read.
    pub wanted_mip: u8,
    /// Coarsest mip to read (one finer than the currently resident mip).
    pub last_mip: u8,
    /// Mip the texture switches to once the read completes.
    pub activate_mip: u8,
    /// Stream priority class of the texture.
    pub priority_class: u8,
    /// Bytes that will be read.
    pub bytes: u64,
}

/// A GPU-side bake of a composite texture from its resident sources.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompositeRequest {
    pub handle: TextureHandle,
    pub pool_item: u64,
    pub wanted_mip: u8,
    pub last_mip: u8,
    pub sources: Vec<TextureHandle>,
}

/// The external IO engine.
pub trait StreamingIo {
    /// Open a batch of reads.
    fn begin_read_group(&mut self);

    /// Close the current batch.
    fn end_read_group(&mut self);

    /// Start a read. Returns `false` if the engine refused it.
    fn start_streaming(&mut self, request: &StreamRequest) -> bool;

    /// Start a composite bake. Returns `false` if it was refused.
    fn start_composite(&mut self, request: &CompositeRequest) -> bool;

    /// Cancel the read for `handle`, if it is still running.
    fn cancel_streaming(&mut self, handle: TextureHandle);
}

/// IO engine that queues requests for its owner to complete.
///
/// Nothing is read: the owner drains [`QueuedIo::take_started`] and reports
/// completion, which makes it suitable for headless simulation and tests.
#[derive(Debug, Default)]
pub struct QueuedIo {
    started: Vec<StreamRequest>,
    composites: Vec<CompositeRequest>,
    cancelled: Vec<TextureHandle>,
    groups: u32,
    open_group: bool,
    /// Refuse every request (simulates a saturated device).
    pub refuse: bool,
}

impl QueuedIo {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain reads started since the last call.
    pub fn take_started(&mut self) -> Vec<StreamRequest> {
        std::mem::take(&mut self.started)
    }

    /// Drain composites started since the last call.
    pub fn take_composites(&mut self) -> Vec<CompositeRequest> {
        std::mem::take(&mut self.composites)
    }

    /// Reads started and not yet drained.
    #[must_use]
    pub fn started(&self) -> &[StreamRequest] {
        &self.started
    }

    /// Composites started and not yet drained.
    #[must_use]
    pub fn composites(&self) -> &[CompositeRequest] {
        &self.composites
    }

    /// Handles whose reads were cancelled.
    #[must_use]
    pub fn cancelled(&self) -> &[TextureHandle] {
        &self.cancelled
    }

    /// Number of closed read groups.
    #[must_use]
    pub fn group_count(&self) -> u32 {
        self.groups
    }
}

impl StreamingIo for QueuedIo {
    fn begin_read_group(&mut self) {
        debug_assert!(!self.open_group, "read groups do not nest");
        self.open_group = true;
    }

    fn end_read_group(&mut self) {
        self.open_group = false;
        self.groups += 1;
    }

    fn start_streaming(&mut self, request: &StreamRequest) -> bool {
        if self.refuse {
            return false;
        }
        self.started.push(request.clone());
        true
    }

    fn start_composite(&mut self, request: &CompositeRequest) -> bool {
        if self.refuse {
            return false;
        }
        self.composites.push(request.clone());
        true
    }

    fn cancel_streaming(&mut self, handle: TextureHandle) {
        self.started.retain(|request| request.handle != handle);
        self.cancelled.push(handle);
    }
}
