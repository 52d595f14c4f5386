//! Resource management and initialization tracking.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use posecast_capture::FrameSource;
use posecast_ipc::{ChannelKind, EngineEvent, PipelineConfig, ShutdownPhase, StartupPhase};
use posecast_transport::{
    DirectPeerChannel, DistributionChannel, GroupChannel, GroupSessionController, PeerLink,
};
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

use crate::anchors::TemplateSlot;
use crate::buffer::SharedFrameBuffer;
use crate::capture::{CapturePipeline, CaptureWorker};
use crate::error::EngineError;
use crate::inbound::InboundPump;
use crate::metrics::MetricsCollector;
use crate::pacer::{FramePacer, PacerTask};
use crate::SHUTDOWN_GRACE_MS;

/// Resources that have been initialized during startup.
#[derive(Default)]
pub struct PipelineResources {
    /// Worker draining the frame source.
    pub capture: Option<CaptureWorker>,

    /// Latest encoded frame, shared by capture and pacer.
    pub buffer: Option<Arc<SharedFrameBuffer>>,

    /// Channel the pacer dispatches to.
    pub channel: Option<Arc<dyn DistributionChannel>>,

    pub inbound: Option<InboundPump>,

    pub pacer: Option<PacerTask>,
}

/// Long-lived collaborators the pipeline is assembled from.
pub struct Collaborators {
    pub source: Box<dyn FrameSource>,
    pub link: Option<Arc<dyn PeerLink>>,
    pub group: Option<Arc<GroupSessionController>>,
    pub template: TemplateSlot,
}

/// Manages resource initialization and cleanup.
pub struct ResourceManager {
    collaborators: Mutex<Collaborators>,
    runtime: Handle,
    event_tx: Sender<EngineEvent>,
    resources: Mutex<PipelineResources>,
    current_phase: Mutex<Option<StartupPhase>>,
}

impl ResourceManager {
    pub fn new(collaborators: Collaborators, runtime: Handle, event_tx: Sender<EngineEvent>) -> Self {
        Self {
            collaborators: Mutex::new(collaborators),
            runtime,
            event_tx,
            resources: Mutex::new(PipelineResources::default()),
            current_phase: Mutex::new(None),
        }
    }

    /// Initialize resources up to and including the specified phase.
    #[instrument(name = "init_resources", skip(self, config, metrics))]
    pub fn initialize(
        &self,
        config: &PipelineConfig,
        metrics: &Arc<MetricsCollector>,
        target_phase: StartupPhase,
    ) -> Result<(), EngineError> {
        let mut phase = StartupPhase::CheckDevice;

        loop {
            *self.current_phase.lock() = Some(phase);
            self.init_phase(config, metrics, phase)?;

            if phase == target_phase {
                break;
            }

            phase = phase.next().ok_or(EngineError::PhaseOrder(phase.name()))?;
        }

        Ok(())
    }

    fn init_phase(
        &self,
        config: &PipelineConfig,
        metrics: &Arc<MetricsCollector>,
        phase: StartupPhase,
    ) -> Result<(), EngineError> {
        info!("Initializing phase: {:?}", phase);

        match phase {
            StartupPhase::CheckDevice => self.check_device(),
            StartupPhase::StartCapture => self.start_capture(config, metrics),
            StartupPhase::OpenChannel => self.open_channel(config),
            StartupPhase::StartPacer => self.start_pacer(config, metrics),
        }
    }

    fn check_device(&self) -> Result<(), EngineError> {
        let collaborators = self.collaborators.lock();
        if !collaborators.source.is_supported() {
            return Err(EngineError::UnsupportedDevice);
        }
        debug!(source = collaborators.source.name(), "Tracking device available");
        Ok(())
    }

    fn start_capture(&self, config: &PipelineConfig, metrics: &Arc<MetricsCollector>) -> Result<(), EngineError> {
        let mut collaborators = self.collaborators.lock();
        let samples = collaborators.source.start()?;

        let buffer = Arc::new(SharedFrameBuffer::new());
        let pipeline = CapturePipeline::new(
            config,
            collaborators.template.clone(),
            Arc::clone(&buffer),
            Arc::clone(metrics),
        );
        let worker = CaptureWorker::spawn(samples, pipeline)?;

        let mut resources = self.resources.lock();
        resources.capture = Some(worker);
        resources.buffer = Some(buffer);

        debug!("Capture initialized");
        Ok(())
    }

    fn open_channel(&self, config: &PipelineConfig) -> Result<(), EngineError> {
        let channel: Arc<dyn DistributionChannel> = {
            let collaborators = self.collaborators.lock();
            match config.channel {
                ChannelKind::Direct => {
                    let link = collaborators
                        .link
                        .clone()
                        .ok_or(EngineError::MissingCollaborator("peer link"))?;
                    Arc::new(DirectPeerChannel::new(link, config.compression, config.delivery))
                }
                ChannelKind::Group => {
                    let controller = collaborators
                        .group
                        .clone()
                        .ok_or(EngineError::MissingCollaborator("group activity"))?;
                    Arc::new(GroupChannel::new(controller, config.group_send, config.delivery))
                }
            }
        };

        let inbound = InboundPump::spawn(&self.runtime, Arc::clone(&channel), self.event_tx.clone());

        let mut resources = self.resources.lock();
        resources.channel = Some(channel);
        resources.inbound = Some(inbound);

        debug!(channel = ?config.channel, "Channel opened");
        Ok(())
    }

    fn start_pacer(&self, config: &PipelineConfig, metrics: &Arc<MetricsCollector>) -> Result<(), EngineError> {
        let mut resources = self.resources.lock();
        let buffer = resources
            .buffer
            .clone()
            .ok_or(EngineError::PhaseOrder(StartupPhase::StartPacer.name()))?;
        let channel = resources
            .channel
            .clone()
            .ok_or(EngineError::PhaseOrder(StartupPhase::StartPacer.name()))?;

        let pacer = FramePacer::new(buffer, channel, Arc::clone(metrics), config);
        resources.pacer = Some(pacer.spawn(&self.runtime));

        debug!("Pacer started");
        Ok(())
    }

    /// Rollback resources from the current phase backwards.
    #[instrument(name = "rollback_resources", skip(self))]
    pub fn rollback(&self) {
        let current = *self.current_phase.lock();

        if let Some(mut phase) = current {
            loop {
                info!("Rolling back phase: {:?}", phase);
                self.rollback_phase(phase);

                match phase.previous() {
                    Some(prev) => phase = prev,
                    None => break,
                }
            }
        }

        *self.current_phase.lock() = None;
    }

    fn rollback_phase(&self, phase: StartupPhase) {
        match phase {
            StartupPhase::StartPacer => self.stop_phase(ShutdownPhase::StopPacer),
            StartupPhase::OpenChannel => self.stop_phase(ShutdownPhase::CloseChannel),
            StartupPhase::StartCapture => self.stop_phase(ShutdownPhase::StopCapture),
            StartupPhase::CheckDevice => {
                // Nothing to rollback
            }
        }
    }

    /// Tear down the resources owned by one shutdown phase.
    pub fn stop_phase(&self, phase: ShutdownPhase) {
        let grace = Duration::from_millis(SHUTDOWN_GRACE_MS);

        match phase {
            ShutdownPhase::StopPacer => {
                let pacer = self.resources.lock().pacer.take();
                if let Some(pacer) = pacer {
                    self.runtime.block_on(pacer.shutdown(grace));
                }
            }
            ShutdownPhase::CloseChannel => {
                let inbound = {
                    let mut resources = self.resources.lock();
                    resources.channel = None;
                    resources.inbound.take()
                };
                if let Some(inbound) = inbound {
                    self.runtime.block_on(inbound.shutdown());
                }
            }
            ShutdownPhase::StopCapture => {
                let worker = {
                    let mut resources = self.resources.lock();
                    resources.buffer = None;
                    resources.capture.take()
                };
                if let Some(mut worker) = worker {
                    worker.stop();
                }

                let mut collaborators = self.collaborators.lock();
                if collaborators.source.is_active() {
                    if let Err(e) = collaborators.source.stop() {
                        warn!("Frame source stop failed: {}", e);
                    }
                }
            }
        }
    }

    /// Shutdown all resources cleanly.
    #[instrument(name = "shutdown_resources", skip(self))]
    pub fn shutdown(&self) {
        info!("Shutting down all resources");
        self.rollback();
    }

    /// Mark the pipeline as torn down after a phase-by-phase stop.
    pub fn clear_phase(&self) {
        *self.current_phase.lock() = None;
    }

    /// True when the frame source went away while capturing.
    pub fn capture_lost(&self) -> bool {
        self.resources
            .lock()
            .capture
            .as_ref()
            .is_some_and(CaptureWorker::source_lost)
    }

    pub fn link(&self) -> Option<Arc<dyn PeerLink>> {
        self.collaborators.lock().link.clone()
    }

    pub fn group(&self) -> Option<Arc<GroupSessionController>> {
        self.collaborators.lock().group.clone()
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
