//! Streamed texture entities, their handles, and the arena that owns them.
//!
//! The texture system owns every [`StreamedTexture`] through a [`TextureArena`]
//! and hands the streamer only [`TextureHandle`]s. A handle carries a generation
//! counter, so a handle kept across a texture's destruction simply stops
//! resolving instead of aliasing a new texture in the same slot.
//!
//! Mip values use 8.8 fixed point (`mip << 8`) so a fractional bias can be
//! applied uniformly across thousands of textures without float drift.

use crate::error::StreamingError;
use crate::pool::PoolItem;

/// Fractional bits of a fixed-point mip value.
pub const MIP_FP_SHIFT: u32 = 8;

/// One whole mip level in fixed point.
pub const MIP_FP_ONE: i32 = 1 << MIP_FP_SHIFT;

/// Highest (least urgent) stream priority class.
pub const MAX_PRIORITY_CLASS: u8 = 7;

/// Convert a float mip level to 8.8 fixed point.
#[must_use]
pub fn mip_to_fp(mip: f32) -> i32 {
    (mip * MIP_FP_ONE as f32).round() as i32
}

/// Whole mip index of a fixed-point mip (rounds toward the finer level).
#[must_use]
pub fn fp_to_mip(fp: i32) -> i32 {
    fp >> MIP_FP_SHIFT
}

/// Pixel formats the streamer can size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// 8-bit single channel.
    R8,
    /// 8-bit RGBA.
    Rgba8,
    /// 16-bit float RGBA.
    Rgba16Float,
    /// BC1, 8 bytes per 4x4 block.
    Bc1,
    /// BC3, 16 bytes per 4x4 block.
    Bc3,
    /// BC7, 16 bytes per 4x4 block.
    Bc7,
}

impl TextureFormat {
    fn block_dim(self) -> u32 {
        match self {
            Self::Bc1 | Self::Bc3 | Self::Bc7 => 4,
            Self::R8 | Self::Rgba8 | Self::Rgba16Float => 1,
        }
    }

    fn bytes_per_block(self) -> u64 {
        match self {
            Self::R8 => 1,
            Self::Rgba8 => 4,
            Self::Rgba16Float | Self::Bc1 => 8,
            Self::Bc3 | Self::Bc7 => 16,
        }
    }

    /// Bytes of a single `width x height` image in this format.
    #[must_use]
    pub fn image_size(self, width: u32, height: u32) -> u64 {
        let dim = self.block_dim();
        let blocks_x = u64::from(width.max(1).div_ceil(dim));
        let blocks_y = u64::from(height.max(1).div_ceil(dim));
        blocks_x * blocks_y * self.bytes_per_block()
    }
}

/// Immutable shape of a streamed texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    /// Width of mip 0 in texels.
    pub width: u32,
    /// Height of mip 0 in texels.
    pub height: u32,
    /// Pixel format.
    pub format: TextureFormat,
    /// Number of mips in the full chain.
    pub mip_count: u8,
    /// Number of coarsest mips that are never evicted.
    pub persistent_mip_count: u8,
}

impl TextureDesc {
    /// Describe a texture with a full mip chain.
    pub fn new(
        width: u32,
        height: u32,
        format: TextureFormat,
        persistent_mip_count: u8,
    ) -> Result<Self, StreamingError> {
        if width == 0 || height == 0 {
            return Err(StreamingError::InvalidDescription(
                "dimensions must be non-zero",
            ));
        }
        let mip_count = (u32::BITS - width.max(height).leading_zeros()) as u8;
        if persistent_mip_count == 0 || persistent_mip_count > mip_count {
            return Err(StreamingError::InvalidDescription(
                "persistent mip count must be within 1..=mip_count",
            ));
        }
        Ok(Self {
            width,
            height,
            format,
            mip_count,
            persistent_mip_count,
        })
    }

    /// Finest mip that is part of the persistent (never evicted) tail.
    #[must_use]
    pub fn persistent_mip(&self) -> u8 {
        self.mip_count - self.persistent_mip_count
    }

    /// Bytes of one mip level. Levels past the chain are empty.
    #[must_use]
    pub fn mip_size(&self, mip: u8) -> u64 {
        if mip >= self.mip_count {
            return 0;
        }
        let shift = u32::from(mip);
        self.format
            .image_size(self.width >> shift, self.height >> shift)
    }

    /// Bytes of the chain from `mip` down to the coarsest level.
    #[must_use]
    pub fn size_from_mip(&self, mip: u8) -> u64 {
        (mip..self.mip_count).map(|m| self.mip_size(m)).sum()
    }

    /// Bytes of the persistent tail.
    #[must_use]
    pub fn persistent_size(&self) -> u64 {
        self.size_from_mip(self.persistent_mip())
    }
}

/// Generational index of a texture in a [`TextureArena`].
///
/// Ordering is by slot then generation; the planner uses it as the identity
/// tie-break between textures with equal priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle {
    index: u32,
    generation: u32,
}

impl TextureHandle {
    /// Slot index inside the arena.
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }
}

/// Prediction window a mip request belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Zone {
    /// Needed now or within a few frames.
    Near = 0,
    /// Predicted to be needed later.
    Far = 1,
}

/// Per-frame inputs the planner reads when keying textures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FrameInfo {
    /// Monotonic frame counter.
    pub frame_id: u64,
    /// Textures accessed at or after this frame count as visible.
    pub visibility_frame: u64,
    /// Current round ids of the near and far zones.
    pub zone_round_ids: [u32; 2],
}

impl FrameInfo {
    /// Frame info where anything accessed in the previous frame is visible.
    #[must_use]
    pub fn new(frame_id: u64, near_round: u32, far_round: u32) -> Self {
        Self {
            frame_id,
            visibility_frame: frame_id.saturating_sub(1),
            zone_round_ids: [near_round, far_round],
        }
    }
}

/// A mip change reported by the texture system for one texture.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MipRequest {
    /// Texture the request is for.
    pub handle: TextureHandle,
    /// Desired mip in 8.8 fixed point.
    pub desired_mip_fp: i32,
    /// Frame the texture was last accessed in.
    pub access_frame: u64,
    /// Zone membership stamped by this request, if any.
    pub zone_round: Option<(Zone, u32)>,
}

impl MipRequest {
    /// A texture drawn this frame: stamps the access frame and the near zone round.
    #[must_use]
    pub fn visible(handle: TextureHandle, desired_mip: f32, frame: &FrameInfo) -> Self {
        Self {
            handle,
            desired_mip_fp: mip_to_fp(desired_mip),
            access_frame: frame.frame_id,
            zone_round: Some((Zone::Near, frame.zone_round_ids[Zone::Near as usize])),
        }
    }

    /// A texture predicted to be needed: stamps only the zone round.
    #[must_use]
    pub fn predicted(handle: TextureHandle, desired_mip: f32, zone: Zone, round: u32) -> Self {
        Self {
            handle,
            desired_mip_fp: mip_to_fp(desired_mip),
            access_frame: 0,
            zone_round: Some((zone, round)),
        }
    }
}

/// An outstanding asynchronous load.
#[derive(Debug)]
pub struct InFlightStream {
    /// Pool item the load writes into.
    pub item: PoolItem,
    /// Finest mip the load will make resident.
    pub target_mip: u8,
    /// Frame the load was submitted in.
    pub started_frame: u64,
}

/// The streaming-relevant state of one texture.
#[derive(Debug)]
pub struct StreamedTexture {
    desc: TextureDesc,
    resident_mip: u8,
    desired_mip_fp: i32,
    pool_item: Option<PoolItem>,
    stream: Option<InFlightStream>,
    /// Keep full resolution regardless of budget.
    pub force_high_res: bool,
    /// Streaming high-priority flag.
    pub high_priority: bool,
    /// Stream priority class, 0 (most urgent) to [`MAX_PRIORITY_CLASS`].
    pub priority_class: u8,
    /// Frame of the most recent access.
    pub last_access_frame: u64,
    /// Near and far zone round ids of the most recent requests.
    pub round_ids: [u32; 2],
    /// Source textures a composite is baked from (empty for regular textures).
    pub composite_sources: Vec<TextureHandle>,
}

impl StreamedTexture {
    /// A texture with nothing resident yet.
    #[must_use]
    pub fn new(desc: TextureDesc) -> Self {
        Self {
            desc,
            resident_mip: desc.mip_count,
            desired_mip_fp: i32::from(desc.persistent_mip()) << MIP_FP_SHIFT,
            pool_item: None,
            stream: None,
            force_high_res: false,
            high_priority: false,
            priority_class: 0,
            last_access_frame: 0,
            round_ids: [0, 0],
            composite_sources: Vec::new(),
        }
    }

    /// Shape of the texture.
    #[must_use]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    /// Finest resident mip; `mip_count` when unloaded.
    #[must_use]
    pub fn resident_mip(&self) -> u8 {
        self.resident_mip
    }

    /// Desired mip in fixed point.
    #[must_use]
    pub fn desired_mip_fp(&self) -> i32 {
        self.desired_mip_fp
    }

    /// Desired mip as a float.
    #[must_use]
    pub fn desired_mip(&self) -> f32 {
        self.desired_mip_fp as f32 / MIP_FP_ONE as f32
    }

    /// Whether no mip data is resident.
    #[must_use]
    pub fn is_unloaded(&self) -> bool {
        self.pool_item.is_none()
    }

    /// Whether a load is in flight.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// The in-flight load, if any.
    #[must_use]
    pub fn stream(&self) -> Option<&InFlightStream> {
        self.stream.as_ref()
    }

    /// Pool item holding the resident mips.
    #[must_use]
    pub fn pool_item(&self) -> Option<&PoolItem> {
        self.pool_item.as_ref()
    }

    /// Whether this texture is baked from other textures.
    #[must_use]
    pub fn is_composite(&self) -> bool {
        !self.composite_sources.is_empty()
    }

    /// Bytes of the resident chain.
    #[must_use]
    pub fn resident_size(&self) -> u64 {
        self.desc.size_from_mip(self.resident_mip)
    }

    /// Set the desired mip directly (float form).
    pub fn set_desired_mip(&mut self, mip: f32) {
        self.desired_mip_fp = mip_to_fp(mip);
    }

    /// Install mip data loaded outside the streamer, returning the replaced item.
    pub fn attach(&mut self, item: PoolItem, resident_mip: u8) -> Option<PoolItem> {
        self.resident_mip = resident_mip.min(self.desc.persistent_mip());
        self.pool_item.replace(item)
    }

    /// Fold a mip request into the texture's streaming inputs.
    pub fn apply_mip_request(&mut self, request: &MipRequest) {
        self.desired_mip_fp = request.desired_mip_fp;
        self.last_access_frame = self.last_access_frame.max(request.access_frame);
        if let Some((zone, round)) = request.zone_round {
            let slot = &mut self.round_ids[zone as usize];
            *slot = (*slot).max(round);
        }
    }

    /// Frozen copy of everything the planning job reads.
    #[must_use]
    pub fn snapshot(&self, handle: TextureHandle) -> TextureSnapshot {
        TextureSnapshot {
            handle,
            desc: self.desc,
            resident_mip: self.resident_mip,
            desired_mip_fp: self.desired_mip_fp,
            streaming_target: self.stream.as_ref().map(|s| s.target_mip),
            force_high_res: self.force_high_res,
            high_priority: self.high_priority,
            priority_class: self.priority_class.min(MAX_PRIORITY_CLASS),
            last_access_frame: self.last_access_frame,
            round_ids: self.round_ids,
            composite: self.is_composite(),
        }
    }

    pub(crate) fn begin_stream(&mut self, stream: InFlightStream) {
        debug_assert!(self.stream.is_none(), "one outstanding load per texture");
        self.stream = Some(stream);
    }

    pub(crate) fn take_stream(&mut self) -> Option<InFlightStream> {
        self.stream.take()
    }

    /// Finish the in-flight load and return the item the pool should reclaim.
    ///
    /// On success the load's item becomes the resident item and the previous
    /// one is returned; on failure the load's item is returned.
    pub(crate) fn finish_stream(&mut self, success: bool) -> Option<PoolItem> {
        let stream = self.stream.take()?;
        if success {
            self.resident_mip = stream.target_mip;
            self.pool_item.replace(stream.item)
        } else {
            Some(stream.item)
        }
    }

    /// Move the resident chain into `item`, dropping mips finer than `mip`.
    pub(crate) fn shrink_into(&mut self, item: PoolItem, mip: u8) -> Option<PoolItem> {
        self.resident_mip = mip;
        self.pool_item.replace(item)
    }

    pub(crate) fn take_pool_item(&mut self) -> Option<PoolItem> {
        self.pool_item.take()
    }
}

/// Planning-time copy of a texture's streaming state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TextureSnapshot {
    pub handle: TextureHandle,
    pub desc: TextureDesc,
    pub resident_mip: u8,
    pub desired_mip_fp: i32,
    /// Target mip of the in-flight load, if one is running.
    pub streaming_target: Option<u8>,
    pub force_high_res: bool,
    pub high_priority: bool,
    pub priority_class: u8,
    pub last_access_frame: u64,
    pub round_ids: [u32; 2],
    pub composite: bool,
}

impl TextureSnapshot {
    /// Apply a mip request to the frozen copy the same way the texture does.
    pub fn apply_mip_request(&mut self, request: &MipRequest) {
        self.desired_mip_fp = request.desired_mip_fp;
        self.last_access_frame = self.last_access_frame.max(request.access_frame);
        if let Some((zone, round)) = request.zone_round {
            let slot = &mut self.round_ids[zone as usize];
            *slot = (*slot).max(round);
        }
    }
}

struct Slot {
    generation: u32,
    texture: Option<StreamedTexture>,
}

/// Slot map of live textures, owned by the texture system.
#[derive(Default)]
pub struct TextureArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl TextureArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a texture and return its handle.
    pub fn insert(&mut self, texture: StreamedTexture) -> TextureHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.texture = Some(texture);
            return TextureHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            texture: Some(texture),
        });
        TextureHandle {
            index,
            generation: 0,
        }
    }

    /// Remove a texture. The caller owns any pool items it still holds.
    ///
    /// Use [`TextureStreamer::release_texture`](crate::TextureStreamer::release_texture)
    /// for textures the streamer tracks, so pending plans are discarded and
    /// pool items are returned.
    pub fn remove(&mut self, handle: TextureHandle) -> Option<StreamedTexture> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let texture = slot.texture.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(texture)
    }

    /// Look up a live texture.
    #[must_use]
    pub fn get(&self, handle: TextureHandle) -> Option<&StreamedTexture> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.texture.as_ref())
    }

    /// Look up a live texture mutably.
    pub fn get_mut(&mut self, handle: TextureHandle) -> Option<&mut StreamedTexture> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.texture.as_mut())
    }

    /// Whether the handle refers to a live texture.
    #[must_use]
    pub fn contains(&self, handle: TextureHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Number of live textures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether the arena holds no textures.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate over live textures with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (TextureHandle, &StreamedTexture)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.texture.as_ref().map(|texture| {
                (
                    TextureHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    texture,
                )
            })
        })
    }

    /// Bytes of persistent tails currently bound in the pool.
    #[must_use]
    pub fn bound_persistent_bytes(&self) -> u64 {
        self.iter()
            .filter(|(_, texture)| !texture.is_unloaded())
            .map(|(_, texture)| texture.desc().persistent_size())
            .sum()
    }
}
