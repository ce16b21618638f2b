//! Stream orchestrator (§4.7, C7): publish/unpublish lifecycle, idle
//! disposal, hot-config reload, jitter correction pre-stage.

use std::time::{Duration, Instant};

use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::callback::{CallbackWorker, HlsNotification};
use crate::config::{ConfigStore, HlsConfig};
use crate::controller::Controller;
use crate::jitter::{JitterCorrector, JitterMode};
use crate::mux::Muxer;
use crate::packet::Packet;
use crate::segment::Container;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Publishing,
    Unpublishing,
}

/// Lifecycle for a single logical (vhost, app, stream) publish session.
pub struct Stream {
    pub id: Uuid,
    vhost: String,
    app: String,
    name: String,
    state: State,
    controller: Option<Controller>,
    jitter: JitterCorrector,
    last_activity: Instant,
    disposable: bool,
    reload_pending: bool,
    worker: Option<CallbackWorker>,
}

impl Stream {
    pub fn new(vhost: impl Into<String>, app: impl Into<String>, name: impl Into<String>) -> Self {
        Stream {
            id: Uuid::new_v4(),
            vhost: vhost.into(),
            app: app.into(),
            name: name.into(),
            state: State::Idle,
            controller: None,
            jitter: JitterCorrector::new(JitterMode::PassThrough),
            last_activity: Instant::now(),
            disposable: false,
            reload_pending: false,
            worker: None,
        }
    }

    /// Pick TS or fMP4 per `use_fmp4` and build the controller. MUST NOT
    /// suspend: called while the stream is registered but before any
    /// concurrent accessor is possible (§4.7).
    pub fn initialize(&mut self, cfg: HlsConfig, sample_rate: u64) {
        let container = if cfg.use_fmp4 { Container::Fmp4 } else { Container::Ts };
        let recover = cfg.recover;
        let mut muxer = Muxer::new(cfg, container, self.vhost.clone(), self.app.clone(), self.name.clone());
        if recover {
            let path = muxer.m3u8_path();
            if let Err(e) = crate::mux::playlist::recover(&mut muxer, &path) {
                warn!(%e, "playlist recovery failed, starting fresh");
            }
        }
        self.controller = Some(Controller::new(muxer, sample_rate));
    }

    pub fn on_publish(&mut self, sink: impl crate::callback::CallbackSink + 'static, queue_capacity: usize) {
        let _span = info_span!("stream", id = %self.id).entered();
        self.state = State::Publishing;
        self.disposable = true;
        self.last_activity = Instant::now();
        self.worker = Some(CallbackWorker::spawn(sink, queue_capacity));
        info!("stream published");
    }

    /// Idempotent: close the current segment, stop the worker, mark
    /// disabled (§4.7).
    pub async fn on_unpublish(&mut self) {
        if self.state == State::Idle {
            return;
        }
        self.state = State::Unpublishing;
        if let Some(controller) = &mut self.controller {
            let closed = controller.muxer_mut().segment_close().ok().flatten();
            let _ = controller.muxer_mut().refresh_playlist();
            if let Some(seg) = closed {
                self.notify_reaped(&seg);
            }
        }
        if let Some(worker) = self.worker.take() {
            worker.shutdown().await;
        }
        self.state = State::Idle;
        info!(id = %self.id, "stream unpublished");
    }

    fn discarding(&self) -> bool {
        !matches!(self.state, State::Publishing)
    }

    /// Fast-path ingress per §4.7 `on_audio`/`on_video` steps 1-6.
    pub fn on_packet(&mut self, mut packet: Packet) {
        if self.discarding() {
            return;
        }
        if self.reload_pending {
            self.drain_reload();
        }

        self.last_activity = Instant::now();
        packet.dts = self.jitter.correct(packet.dts);

        let Some(controller) = &mut self.controller else {
            return;
        };
        let reaped = match controller.on_packet(packet) {
            Ok(seg) => seg,
            Err(e) => {
                warn!(%e, "packet processing failed");
                None
            }
        };
        if let Some(seg) = reaped {
            self.notify_reaped(&seg);
        }
    }

    /// Builds the two outbound notifications for one reaped segment and
    /// hands them to the async callback worker (§4.8, never on the data
    /// path — the worker computes the lazy `sha256` on its own task).
    fn notify_reaped(&self, seg: &crate::segment::Segment) {
        let Some(controller) = &self.controller else { return };
        let Some(worker) = &self.worker else { return };
        let m3u8_path = controller.muxer().m3u8_path();
        let notification = HlsNotification {
            segment_path: seg.path.clone(),
            segment_uri: seg.uri.clone(),
            m3u8_path: m3u8_path.clone(),
            m3u8_uri: m3u8_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            seq: seg.sequence_no,
            duration_secs: seg.duration_secs(),
            sha256: None,
        };
        let nb_notify = controller.muxer().cfg().nb_notify;
        worker.notify_segment_closed(notification.clone());
        worker.notify_segment_viewed(&notification.segment_uri, nb_notify);
    }

    /// Periodic tick: dispose if idle past `dispose_secs` and disposable.
    pub async fn cycle(&mut self) {
        if !self.disposable {
            return;
        }
        let Some(controller) = &self.controller else { return };
        let dispose_secs = controller.muxer().cfg().dispose_secs;
        if dispose_secs <= 0.0 {
            return;
        }
        if self.last_activity.elapsed() > Duration::from_secs_f64(dispose_secs) {
            self.dispose().await;
        }
    }

    async fn dispose(&mut self) {
        info!(id = %self.id, "disposing idle stream");
        if let Some(controller) = &mut self.controller {
            controller.muxer_mut().dispose();
        }
        if let Some(worker) = self.worker.take() {
            worker.shutdown().await;
        }
        self.controller = None;
        self.state = State::Idle;
        self.disposable = false;
    }

    /// Cooperative hot reload: sets a flag consulted by the next data-path
    /// call (§4.7 `async_reload`).
    pub fn async_reload(&mut self) {
        self.reload_pending = true;
    }

    fn drain_reload(&mut self) {
        self.reload_pending = false;
        info!(id = %self.id, "draining queued config reload");
        // Teardown + republish + reinject headers is host-specific (the
        // controller doesn't own the original sequence headers once
        // consumed); callers re-publish explicitly after this returns.
    }

    pub fn controller(&self) -> Option<&Controller> {
        self.controller.as_ref()
    }

    pub fn controller_mut(&mut self) -> Option<&mut Controller> {
        self.controller.as_mut()
    }
}

/// Convenience constructor mirroring `HlsConfig::load` + `Stream::initialize`.
pub fn build_stream(
    store: &dyn ConfigStore,
    vhost: &str,
    app: &str,
    name: &str,
    sample_rate: u64,
) -> crate::error::Result<Stream> {
    let cfg = HlsConfig::load(store, vhost)?;
    let mut stream = Stream::new(vhost, app, name);
    stream.initialize(cfg, sample_rate);
    Ok(stream)
}
