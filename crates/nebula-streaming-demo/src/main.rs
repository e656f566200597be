//! Headless texture streaming simulation.
//!
//! Spawns a randomized texture set, sweeps a visibility window across it and
//! drives the planner frame by frame against the in-memory pool and the
//! queued IO engine. Loads complete after a fixed latency and a few fail.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Edits to `config.ron` are picked up while the simulation runs.
//! Run with `cargo run -p nebula-streaming-demo -- --frames 600 --pool-size-mb 64`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use nebula_config::{CliArgs, Config, StreamingConfig, default_config_dir};
use nebula_texture_streaming::{
    ApplyReport, FrameInfo, MipRequest, PoolAllocator, QueuedIo, StreamedTexture, StreamingError,
    StreamingPool, TextureArena, TextureDesc, TextureFormat, TextureHandle, TextureStreamer, Zone,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{error, info, warn};

type Streamer = TextureStreamer<StreamingPool, QueuedIo>;

const FORMATS: [TextureFormat; 4] = [
    TextureFormat::Bc1,
    TextureFormat::Bc3,
    TextureFormat::Bc7,
    TextureFormat::Rgba8,
];

/// Frames per far-zone prediction round.
const FAR_ROUND_FRAMES: u64 = 16;
/// Frames between stats reports.
const REPORT_FRAMES: u64 = 60;
/// Frames between texture replacements.
const CHURN_FRAMES: u64 = 50;
/// Frames between config file checks.
const RELOAD_FRAMES: u64 = 120;

#[derive(Parser, Debug)]
#[command(
    name = "nebula-streaming-demo",
    about = "Headless texture streaming simulation"
)]
struct DemoArgs {
    #[command(flatten)]
    streaming: CliArgs,

    /// Frames to simulate.
    #[arg(long, default_value_t = 600)]
    frames: u64,

    /// Textures in the scene.
    #[arg(long, default_value_t = 512)]
    textures: usize,

    /// Textures visible at once.
    #[arg(long, default_value_t = 96)]
    window: usize,

    /// Frames a load takes to complete.
    #[arg(long, default_value_t = 3)]
    latency: u64,

    /// Probability that a load fails.
    #[arg(long, default_value_t = 0.02)]
    failure_rate: f64,

    /// Scene seed.
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

/// A load handed to the IO engine, identified by its pool item.
struct PendingLoad {
    due_frame: u64,
    handle: TextureHandle,
    pool_item: u64,
}

#[derive(Default)]
struct Summary {
    frames: u64,
    started: usize,
    completed: usize,
    failed: usize,
    aborted: usize,
    trimmed: usize,
    kicked: usize,
    alloc_failures: u64,
    overflow_frames: u64,
    replaced: usize,
    peak_reserved: u64,
}

impl Summary {
    fn record(&mut self, report: &ApplyReport) {
        self.started += report.started + report.composites_started;
        self.aborted += report.aborted;
        self.trimmed += report.trimmed;
        self.kicked += report.kicked;
        self.alloc_failures += u64::from(report.alloc_failures);
    }

    fn print(&self) {
        println!("=== Texture streaming summary ({} frames) ===", self.frames);
        println!(
            "loads: {} started, {} completed, {} failed, {} aborted",
            self.started, self.completed, self.failed, self.aborted
        );
        println!(
            "pressure: {} trimmed, {} kicked, {} allocation failures",
            self.trimmed, self.kicked, self.alloc_failures
        );
        println!(
            "budget: {} overflowing frames, peak reserved {:.1} MiB",
            self.overflow_frames,
            self.peak_reserved as f64 / (1024.0 * 1024.0)
        );
        println!("churn: {} textures replaced", self.replaced);
    }
}

fn random_texture(rng: &mut ChaCha8Rng) -> Result<StreamedTexture, StreamingError> {
    let size = 1u32 << rng.random_range(7..=11u32);
    let format = FORMATS[rng.random_range(0..FORMATS.len())];
    let desc = TextureDesc::new(size, size, format, rng.random_range(3..=5))?;
    let mut texture = StreamedTexture::new(desc);
    texture.priority_class = rng.random_range(0..=7);
    texture.high_priority = rng.random_bool(0.05);
    Ok(texture)
}

/// Post this frame's visibility: a window sweeping across the texture list,
/// sharper at its center, with the textures just ahead predicted.
fn post_requests(
    streamer: &Streamer,
    handles: &[TextureHandle],
    frame: &FrameInfo,
    window: usize,
    rng: &mut ChaCha8Rng,
) {
    let count = handles.len();
    if count == 0 {
        return;
    }
    let window = window.clamp(1, count);
    let start = (frame.frame_id as usize * 2) % count;
    let falloff = (window / 8).max(1) as f32;

    for offset in 0..window {
        let distance = (offset as f32 - window as f32 / 2.0).abs() / falloff;
        let mip = (distance + rng.random_range(-0.25..0.25)).max(0.0);
        let handle = handles[(start + offset) % count];
        streamer.request_mip(MipRequest::visible(handle, mip, frame));
    }

    for offset in window..window + window / 2 {
        let handle = handles[(start + offset) % count];
        let round = frame.zone_round_ids[Zone::Near as usize];
        streamer.request_mip(MipRequest::predicted(handle, 2.0, Zone::Near, round));
    }

    if frame.frame_id % FAR_ROUND_FRAMES == 0 {
        let round = frame.zone_round_ids[Zone::Far as usize];
        for offset in window * 2..window * 3 {
            let handle = handles[(start + offset) % count];
            streamer.request_mip(MipRequest::predicted(handle, 4.0, Zone::Far, round));
        }
    }
}

/// Complete loads whose latency elapsed. Entries for loads aborted since are
/// ignored by the streamer.
fn complete_loads(
    streamer: &Streamer,
    arena: &mut TextureArena,
    loads: &mut VecDeque<PendingLoad>,
    frame_id: u64,
    failure_rate: f64,
    rng: &mut ChaCha8Rng,
    summary: &mut Summary,
) -> Result<(), StreamingError> {
    while loads.front().is_some_and(|load| load.due_frame <= frame_id) {
        let Some(load) = loads.pop_front() else {
            break;
        };
        let current = arena
            .get(load.handle)
            .and_then(|texture| texture.stream())
            .is_some_and(|stream| stream.item.id() == load.pool_item);
        let success = !rng.random_bool(failure_rate);
        streamer.complete_streaming(arena, load.handle, load.pool_item, success)?;
        if !current {
            continue;
        }
        if success {
            summary.completed += 1;
        } else {
            summary.failed += 1;
        }
    }
    Ok(())
}

/// Pick up edits to `config.ron`, keeping CLI overrides on top.
fn reload_config(
    streamer: &Streamer,
    args: &DemoArgs,
    config_dir: &Path,
    file_config: &mut Config,
    config: &mut Config,
) -> Result<(), StreamingError> {
    match file_config.reload(config_dir) {
        Ok(Some(new)) => {
            let mut effective = new.clone();
            effective.apply_cli_overrides(&args.streaming);
            if effective.streaming.pool_size_mb != config.streaming.pool_size_mb {
                warn!("Pool size changes take effect on restart");
            }
            streamer.set_config(effective.streaming.clone())?;
            *file_config = new;
            *config = effective;
        }
        Ok(None) => {}
        Err(err) => warn!(%err, "Failed to reload config, keeping current settings"),
    }
    Ok(())
}

fn run(
    args: &DemoArgs,
    config_dir: &Path,
    mut file_config: Config,
    mut config: Config,
) -> Result<Summary, StreamingError> {
    let streamer = TextureStreamer::new(
        config.streaming.clone(),
        StreamingPool::new(config.streaming.pool_size_bytes()),
        QueuedIo::new(),
    )?;
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let mut arena = TextureArena::new();
    let mut handles = (0..args.textures)
        .map(|_| random_texture(&mut rng).map(|texture| arena.insert(texture)))
        .collect::<Result<Vec<_>, _>>()?;
    let failure_rate = args.failure_rate.clamp(0.0, 1.0);

    info!(
        textures = handles.len(),
        frames = args.frames,
        pool_mb = config.streaming.pool_size_mb,
        "Starting streaming simulation"
    );

    let mut loads = VecDeque::new();
    let mut summary = Summary::default();
    let mut was_overflowing = false;

    for frame_id in 1..=args.frames {
        let far_round = (frame_id / FAR_ROUND_FRAMES + 1) as u32;
        let frame = FrameInfo::new(frame_id, frame_id as u32, far_round);

        post_requests(&streamer, &handles, &frame, args.window, &mut rng);
        streamer.begin_update_schedule(&mut arena, &frame)?;
        complete_loads(
            &streamer,
            &mut arena,
            &mut loads,
            frame_id,
            failure_rate,
            &mut rng,
            &mut summary,
        )?;
        let report = streamer.apply_schedule(&mut arena)?;
        summary.record(&report);

        for request in streamer.with_io(QueuedIo::take_started) {
            loads.push_back(PendingLoad {
                due_frame: frame_id + args.latency,
                handle: request.handle,
                pool_item: request.pool_item,
            });
        }

        let overflowing = streamer.is_overflowing();
        if overflowing {
            summary.overflow_frames += 1;
            if config.debug.warn_on_overflow && !was_overflowing {
                warn!(frame = frame_id, "Precached textures exceed the streaming budget");
            }
        }
        was_overflowing = overflowing;

        let reserved = streamer.with_pool(|pool| pool.reserved_size());
        summary.peak_reserved = summary.peak_reserved.max(reserved);

        if frame_id % CHURN_FRAMES == 0 && !handles.is_empty() {
            let slot = rng.random_range(0..handles.len());
            streamer.release_texture(&mut arena, handles[slot])?;
            handles[slot] = arena.insert(random_texture(&mut rng)?);
            summary.replaced += 1;
        }

        if frame_id == args.frames / 2 {
            streamer.flush_all();
        }

        if frame_id % RELOAD_FRAMES == 0 {
            reload_config(&streamer, args, config_dir, &mut file_config, &mut config)?;
        }

        if frame_id % REPORT_FRAMES == 0 {
            let stats = streamer.stats();
            info!(
                frame = frame_id,
                tracked = stats.tracked,
                resident = stats.resident,
                precached = stats.precached,
                on_screen = stats.on_screen,
                bias = stats.bias,
                list_mb = stats.list_size / (1024 * 1024),
                reserved_mb = reserved / (1024 * 1024),
                in_flight = stats.in_flight,
                "Streaming stats"
            );
        }
        summary.frames = frame_id;
    }

    Ok(summary)
}

fn main() -> ExitCode {
    let args = DemoArgs::parse();

    // Resolve config directory
    let config_dir = args
        .streaming
        .config
        .clone()
        .or_else(default_config_dir)
        .unwrap_or_else(|| PathBuf::from("."));

    let file_config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    let mut config = file_config.clone();
    config.apply_cli_overrides(&args.streaming);

    let log_dir = config_dir.join("logs");
    nebula_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    if let Err(err) = config.streaming.validate() {
        warn!(%err, "Invalid streaming config, using defaults");
        config.streaming = StreamingConfig::default();
    }

    match run(&args, &config_dir, file_config, config) {
        Ok(summary) => {
            summary.print();
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, "Streaming simulation failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_applies_file_edits_under_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let args = DemoArgs::parse_from(["nebula-streaming-demo", "--job-update", "false"]);
        let mut file_config = Config::load_or_create(dir.path()).unwrap();
        let mut config = file_config.clone();
        config.apply_cli_overrides(&args.streaming);
        let streamer = TextureStreamer::new(
            config.streaming.clone(),
            StreamingPool::new(config.streaming.pool_size_bytes()),
            QueuedIo::new(),
        )
        .unwrap();

        // Unchanged file: nothing to apply.
        reload_config(&streamer, &args, dir.path(), &mut file_config, &mut config).unwrap();
        assert!(!streamer.config().suppress);

        let mut edited = file_config.clone();
        edited.streaming.suppress = true;
        edited.save(dir.path()).unwrap();
        reload_config(&streamer, &args, dir.path(), &mut file_config, &mut config).unwrap();

        assert!(streamer.config().suppress);
        assert!(!streamer.config().job_update);
        assert!(file_config.streaming.job_update);
        assert!(config.streaming.suppress);
    }

    #[test]
    fn test_broken_config_file_keeps_settings() {
        let dir = tempfile::tempdir().unwrap();
        let args = DemoArgs::parse_from(["nebula-streaming-demo"]);
        let mut file_config = Config::load_or_create(dir.path()).unwrap();
        let mut config = file_config.clone();
        let streamer = TextureStreamer::new(
            StreamingConfig {
                job_update: false,
                ..config.streaming.clone()
            },
            StreamingPool::new(1 << 20),
            QueuedIo::new(),
        )
        .unwrap();

        std::fs::write(dir.path().join("config.ron"), "(streaming: (").unwrap();
        reload_config(&streamer, &args, dir.path(), &mut file_config, &mut config).unwrap();
        assert!(!streamer.config().job_update);
        assert_eq!(config, file_config);
    }
}
