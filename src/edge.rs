use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::{
    alert::{
        AlertPublisher, CooldownGate, DirectoryStore, DispatchSettings, Dispatcher, EvidenceError,
        EvidenceStore, FrameOutcome, Rectangle,
    },
    config::Config,
    feed::{CaptureError, FrameSource, ReplayFeed},
    mqtt::{self, TransportError},
    shutdown::Shutdown,
};

/// How long a stop request waits for the frame source to hand back control
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Publisher process: broker, then feed and evidence directory, then the frame loop until the
/// feed ends or a stop is requested. Only startup failures are returned.
pub async fn run(cfg: Config, shutdown: Shutdown) -> Result<(), EdgeError> {
    let logging_span = info_span!("Edge", location = %cfg.zone.location);
    run_instrumented(cfg, shutdown, logging_span.clone())
        .instrument(logging_span)
        .await
}

async fn run_instrumented(cfg: Config, shutdown: Shutdown, span: Span) -> Result<(), EdgeError> {
    let transport = mqtt::connect_edge(&cfg.mqtt).await?;

    let (source, evidence) = match open_local_resources(&cfg) {
        Ok(resources) => resources,
        Err(e) => {
            transport.close().await;
            return Err(e);
        }
    };
    info!(
        zone = ?cfg.zone.rectangle(),
        evidence = %evidence.directory().display(),
        cooldown_secs = cfg.alert.cooldown_seconds,
        "Watching restricted zone"
    );

    let dispatcher = Dispatcher::new(
        DispatchSettings {
            topic: cfg.mqtt.topic.clone(),
            location: cfg.zone.location.clone(),
            target_label: cfg.detection.target_label.clone(),
            confidence_threshold: cfg.detection.confidence_threshold,
        },
        CooldownGate::from_secs(cfg.alert.cooldown_seconds),
        transport,
        evidence,
    );
    let zone = cfg.zone.rectangle();
    let pacing = LoopPacing {
        retry_delay: Duration::from_millis(cfg.feed.retry_delay_ms),
        frame_interval: Duration::from_millis(cfg.feed.frame_interval_ms),
    };

    // Frames are read and evaluated on a blocking thread, the transport keeps its own task
    let loop_shutdown = shutdown.clone();
    let mut frame_loop = tokio::task::spawn_blocking(move || {
        let _guard = span.enter();
        let mut source = source;
        run_frame_loop(&mut source, &dispatcher, &zone, &loop_shutdown, pacing, Local::now);
        dispatcher.into_publisher()
    });

    let mut stop = shutdown;
    let joined = tokio::select! {
        joined = &mut frame_loop => Some(joined),
        _ = stop.requested() => tokio::time::timeout(STOP_GRACE, &mut frame_loop).await.ok(),
    };
    match joined {
        Some(Ok(transport)) => transport.close().await,
        Some(Err(e)) => error!("Frame loop panicked: {}", e),
        // A source blocked on input can't be interrupted, leave it behind
        None => warn!("Detection feed did not stop in time, exiting without closing the broker session"),
    }
    info!("Edge node stopped");
    Ok(())
}

fn open_local_resources(
    cfg: &Config,
) -> Result<(ReplayFeed<Box<dyn std::io::BufRead + Send>>, DirectoryStore), EdgeError> {
    let evidence = DirectoryStore::open(&cfg.evidence.directory)?;
    let source = ReplayFeed::open(&cfg.feed.source)?;
    Ok((source, evidence))
}

#[derive(Debug, Clone, Copy)]
pub struct LoopPacing {
    pub retry_delay: Duration,
    pub frame_interval: Duration,
}

/// Reads and dispatches frames until the source closes or a stop is requested. Nothing that
/// happens to a single frame ends the loop.
pub fn run_frame_loop<F, P, E, C>(
    source: &mut F,
    dispatcher: &Dispatcher<P, E>,
    zone: &Rectangle,
    shutdown: &Shutdown,
    pacing: LoopPacing,
    mut clock: C,
) -> LoopStats
where
    F: FrameSource,
    P: AlertPublisher,
    E: EvidenceStore,
    C: FnMut() -> DateTime<Local>,
{
    let mut stats = LoopStats::default();
    while !shutdown.is_requested() {
        let frame = match source.read_frame() {
            Ok(frame) => frame,
            Err(CaptureError::Closed) => {
                info!("Detection feed ended");
                break;
            }
            Err(e) => {
                warn!("{}. Retrying shortly", e);
                stats.missed += 1;
                std::thread::sleep(pacing.retry_delay);
                continue;
            }
        };
        stats.frames += 1;
        match dispatcher.on_frame(&frame.image, &frame.detections, zone, clock()) {
            FrameOutcome::Clear => {}
            FrameOutcome::Suppressed => stats.suppressed += 1,
            FrameOutcome::Dispatched { published, .. } => {
                stats.dispatched += 1;
                if !published {
                    stats.unpublished += 1;
                }
            }
        }
        if !pacing.frame_interval.is_zero() {
            std::thread::sleep(pacing.frame_interval);
        }
    }
    debug!(?stats, "Frame loop finished");
    stats
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct LoopStats {
    pub frames: u64,
    pub missed: u64,
    pub suppressed: u64,
    pub dispatched: u64,
    pub unpublished: u64,
}

quick_error! {
    #[derive(Debug)]
    pub enum EdgeError {
        Broker(error: TransportError) {
            display("{}", error)
            from()
            source(error)
        }
        Feed(error: CaptureError) {
            display("{}", error)
            from()
            source(error)
        }
        Evidence(error: EvidenceError) {
            display("Evidence directory unusable: {}", error)
            from()
            source(error)
        }
    }
}
