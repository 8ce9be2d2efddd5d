mod display;
mod pipeline;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use rdscan_geo::gnss::GeoReader;
use rdscan_geo::{doctor as geo_doctor, GeoSnapshot, GnssConfig};
use rdscan_store::{doctor as store_doctor, PersistenceWorker, StoreConfig};
use rdscan_vision::camera::{Camera, CameraConfig};
use rdscan_vision::overlay::{Overlay, OverlayConfig};
use rdscan_vision::priority::PRIORITY_CLASSES;
use rdscan_vision::tracker::{DedupConfig, DedupTracker};
use rdscan_vision::{Detector, VisionConfig};

use display::{DisplayConfig, DisplaySink, SinkSignal};
use pipeline::Pipeline;

#[cfg(feature = "vision-tflite")]
use rdscan_vision::tflite::TfliteDetector;

#[derive(Debug, Parser)]
#[command(name = "rdscan", version, about = "rdscan - road damage survey rig")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    Run,
    Gnss { #[command(subcommand)] cmd: GnssCmd },
    Vision { #[command(subcommand)] cmd: VisionCmd },
}

#[derive(Debug, Subcommand)]
enum GnssCmd {
    /// Print the coordinate snapshot once per second until Ctrl-C.
    Watch,
}

#[derive(Debug, Subcommand)]
enum VisionCmd { Inspect }

#[derive(Debug, serde::Deserialize)]
struct Config {
    camera: CameraConfig,
    vision: VisionConfig,
    gnss: GnssConfig,

    #[serde(default)]
    dedup: DedupConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    overlay: OverlayConfig,
    #[serde(default)]
    display: DisplayConfig,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run => run(&cfg).await?,
        Command::Gnss { cmd: GnssCmd::Watch } => gnss_watch(&cfg).await?,
        Command::Vision { cmd: VisionCmd::Inspect } => vision_inspect(&cfg)?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    cfg.dedup.check()?;
    anyhow::ensure!(cfg.camera.width > 0 && cfg.camera.height > 0, "camera size must be non-zero");
    anyhow::ensure!(
        cfg.vision.conf_threshold > 0.0 && cfg.vision.conf_threshold < 1.0,
        "vision.conf_threshold should be in (0, 1)"
    );
    for (class, _) in PRIORITY_CLASSES {
        if !cfg.vision.class_names.iter().any(|c| c == class) {
            warn!("doctor: model has no '{}' class; it will never be logged", class);
        }
    }

    geo_doctor::check_gnss(&cfg.gnss).context("gnss")?;
    store_doctor::check_store(&cfg.store)?;
    Overlay::new(&cfg.overlay)?;
    display::from_config(&cfg.display)?;

    info!("doctor: OK");
    Ok(())
}

fn vision_inspect(cfg: &Config) -> Result<()> {
    #[cfg(feature = "vision-tflite")]
    {
        let mut d = TfliteDetector::new(cfg.vision.clone())?;
        print!("{}", d.inspect()?);
        Ok(())
    }
    #[cfg(not(feature = "vision-tflite"))]
    {
        let _ = cfg;
        anyhow::bail!("vision backend not available; build with --features vision-tflite")
    }
}

fn init_detector(cfg: &Config) -> Result<Box<dyn Detector>> {
    #[cfg(feature = "vision-tflite")]
    {
        Ok(Box::new(TfliteDetector::new(cfg.vision.clone())?))
    }
    #[cfg(not(feature = "vision-tflite"))]
    {
        let _ = cfg;
        anyhow::bail!("binary not built with --features vision-tflite")
    }
}

fn spawn_geo_reader(
    gnss: &GnssConfig,
    geo: GeoSnapshot,
    stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<Result<(), rdscan_geo::GeoError>> {
    let gnss = gnss.clone();
    tokio::spawn(async move {
        let reader = GeoReader::from_config(geo, &gnss);
        reader.run(&gnss, stop).await
    })
}

async fn gnss_watch(cfg: &Config) -> Result<()> {
    let geo = GeoSnapshot::new();
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut reader = spawn_geo_reader(&cfg.gnss, geo.clone(), stop_rx);
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            res = &mut reader => {
                let st = geo.get();
                println!("lat={} lon={}", st.lat_text(), st.lon_text());
                res.context("gnss task")?.context("gnss reader")?;
                return Ok(());
            }
            _ = tick.tick() => {
                let st = geo.get();
                println!("lat={} lon={}", st.lat_text(), st.lon_text());
            }
        }
    }

    let _ = stop_tx.send(true);
    reader.await.context("gnss task")?.context("gnss reader")?;
    Ok(())
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting");

    let geo = GeoSnapshot::new();
    let (stop_tx, stop_rx) = watch::channel(false);
    let geo_task = spawn_geo_reader(&cfg.gnss, geo.clone(), stop_rx);

    let camera = Camera::new(cfg.camera.clone())?;
    let mut detector = init_detector(cfg)?;
    let mut sink = display::from_config(&cfg.display)?;
    let worker = PersistenceWorker::spawn(&cfg.store).context("start persistence worker")?;
    let mut pipeline = Pipeline::new(
        DedupTracker::new(cfg.dedup.clone())?,
        geo.clone(),
        Overlay::new(&cfg.overlay)?,
        worker.queue().clone(),
    );

    info!("run: road damage detection started, Ctrl-C to quit");
    let outcome = frame_loop(&camera, detector.as_mut(), &mut pipeline, sink.as_mut()).await;
    if let Err(e) = &outcome {
        warn!("run: frame loop stopped: {:#}", e);
    }

    // exactly one sentinel, after the last enqueue
    drop(pipeline);
    let stats = worker.shutdown().await?;
    info!(
        "run: persisted={} image_failures={} log_failures={} dropped={}",
        stats.persisted, stats.image_failures, stats.log_failures, stats.dropped
    );

    let _ = stop_tx.send(true);
    match geo_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("run: gnss reader ended early: {}", e),
        Err(e) => warn!("run: gnss task failed: {}", e),
    }

    outcome
}

async fn frame_loop(
    camera: &Camera,
    detector: &mut dyn Detector,
    pipeline: &mut Pipeline,
    sink: &mut dyn DisplaySink,
) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let mut frame = tokio::select! {
            _ = &mut ctrl_c => {
                info!("run: quit requested");
                return Ok(());
            }
            f = camera.capture() => f.context("capture frame")?,
        };

        let dets = detector.detect(&frame).context("run detector")?;
        let report = pipeline.process_frame(&mut frame, &dets);
        if let Some((label, prio)) = &report.stored {
            info!("run: new {} ({})", label, prio);
        }

        if sink.show(&frame, &report.hud)? == SinkSignal::Quit {
            info!("run: display sink requested quit");
            return Ok(());
        }
    }
}
