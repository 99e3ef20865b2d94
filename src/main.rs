use anyhow::{Context, Result};
use camkit::capture::{LensFacing, MockCameraControl, MockEncoderControl, MockSoundBackend};
use camkit::{
    CamkitConfig, Capability, CaptureController, CameraDeviceManager, ComponentBuilder,
    CreationPriority, MediaType, Owner, PictureData, PictureSink, SoundPlayer,
};
use clap::Parser;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "camkit")]
#[command(about = "Camera component runtime and capture orchestration demo")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "camkit.toml")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long)]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long)]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        println!("{}", toml::to_string_pretty(&CamkitConfig::default())?);
        return Ok(());
    }

    init_logging(&args);

    info!("Starting camkit v{}", env!("CARGO_PKG_VERSION"));

    let config = CamkitConfig::load_from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config))?;
    config.validate().context("configuration invalid")?;

    if args.validate_config {
        println!("✓ Configuration is valid");
        return Ok(());
    }

    run_demo(config)
}

fn init_logging(args: &Args) {
    use tracing_subscriber::EnvFilter;

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("camkit={log_level}")));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(args.debug)
        .with_thread_names(args.debug)
        .init();
}

/// File-writing picture sink: chrono-named JPEG plus an optional JSON
/// metadata sidecar.
struct FilePictureSink {
    base: PathBuf,
    save_metadata: bool,
}

impl PictureSink for FilePictureSink {
    fn on_picture_taken(&self, picture: &PictureData, media_type: MediaType) {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let name = format!("IMG_{stamp}_{:02}.jpg", picture.frame_index);
        let path = self.base.join(&name);
        if let Err(e) = std::fs::write(&path, picture.bytes.as_slice()) {
            error!("Failed to write {}: {}", path.display(), e);
            return;
        }
        info!("Saved {}", path.display());

        if self.save_metadata {
            let metadata = serde_json::json!({
                "file": name,
                "media_type": media_type.to_string(),
                "frame_index": picture.frame_index,
                "size_bytes": picture.bytes.len(),
                "captured_at": chrono::Local::now().to_rfc3339(),
            });
            let sidecar = path.with_extension("json");
            if let Err(e) = std::fs::write(&sidecar, metadata.to_string()) {
                warn!("Failed to write metadata sidecar: {}", e);
            }
        }
    }
}

/// Wire a capture owner with mock camera/encoder/sound drivers and run a
/// short scripted capture session against it.
fn run_demo(config: CamkitConfig) -> Result<()> {
    std::fs::create_dir_all(&config.capture.path)
        .with_context(|| format!("cannot create capture path {}", config.capture.path))?;

    let capture_owner = Owner::new(format!("{}-capture", config.system.thread_name_prefix));
    capture_owner.start()?;

    let camera_control = MockCameraControl::new();
    let devices = vec![
        camera_control.device("0", LensFacing::Back),
        camera_control.device("1", LensFacing::Front),
    ];
    let sound_backend = MockSoundBackend::new();
    let encoder_factory = MockEncoderControl::new().factory();
    let sink = FilePictureSink {
        base: PathBuf::from(&config.capture.path),
        save_metadata: config.capture.save_metadata,
    };

    let controller_config = config.clone();
    capture_owner.call(move |ctx| {
        ctx.manager().add_builders(vec![
            ComponentBuilder::new(
                CreationPriority::Launch,
                vec![Capability::of::<CameraDeviceManager>()],
                move |component_ctx| Rc::new(CameraDeviceManager::new(component_ctx, devices)),
            ),
            ComponentBuilder::new(
                CreationPriority::High,
                vec![Capability::of::<SoundPlayer>()],
                move |component_ctx| {
                    Rc::new(SoundPlayer::new(component_ctx, Box::new(sound_backend)))
                },
            ),
            ComponentBuilder::new(
                CreationPriority::Normal,
                vec![Capability::of::<CaptureController>()],
                move |component_ctx| {
                    Rc::new(CaptureController::new(
                        component_ctx,
                        controller_config,
                        encoder_factory,
                        Some(Box::new(sink)),
                    ))
                },
            ),
        ]);
        ctx.manager().create_components(CreationPriority::Normal);
    })?;

    let service = capture_owner
        .call(|ctx| {
            ctx.manager()
                .find_component::<CaptureController>()
                .map(|c| c.service())
        })?
        .context("capture controller missing")?;

    info!("Opening camera and starting preview");
    service.open_camera()?;
    service.start_preview()?;
    std::thread::sleep(Duration::from_millis(100));

    info!("Capturing photo");
    let photo = service.capture_photo(1)?;
    std::thread::sleep(Duration::from_millis(200));
    info!("Photo request {} done", photo.request_id());

    info!("Recording a short video clip");
    service.set_media_type(MediaType::Video)?;
    std::thread::sleep(Duration::from_millis(100));
    let video = service.capture_video()?;
    std::thread::sleep(Duration::from_millis(500));
    video.close();
    std::thread::sleep(Duration::from_millis(100));

    info!("Stopping preview");
    if let Err(e) = service.stop_preview_and_wait() {
        warn!("Preview stop: {}", e);
    }

    capture_owner.shutdown();
    capture_owner.join();
    info!("Demo finished");
    Ok(())
}
