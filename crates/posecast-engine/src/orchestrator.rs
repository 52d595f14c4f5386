//! Main engine orchestrator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use posecast_capture::FrameSource;
use posecast_ipc::{
    EngineCommand, EngineEvent, EngineState, PipelineConfig, PipelineMetrics, ShutdownPhase,
    StartupPhase, StopReason,
};
use posecast_transport::{GroupActivity, GroupSessionController, GroupTransition, PeerLink};
use tokio::runtime::Runtime;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::anchors::TemplateSlot;
use crate::error::EngineError;
use crate::metrics::MetricsCollector;
use crate::state::{Collaborators, ResourceManager};
use crate::METRICS_INTERVAL_MS;

/// Everything the engine is assembled from.
pub struct EngineParts {
    pub source: Box<dyn FrameSource>,

    /// Needed for the direct channel and advertising.
    pub link: Option<Arc<dyn PeerLink>>,

    /// Needed for the group channel.
    pub activity: Option<Arc<dyn GroupActivity>>,

    pub template: TemplateSlot,
}

impl EngineParts {
    pub fn new(source: impl FrameSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            link: None,
            activity: None,
            template: TemplateSlot::new(),
        }
    }

    pub fn with_link(mut self, link: Arc<dyn PeerLink>) -> Self {
        self.link = Some(link);
        self
    }

    pub fn with_activity(mut self, activity: Arc<dyn GroupActivity>) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn with_template(mut self, template: TemplateSlot) -> Self {
        self.template = template;
        self
    }
}

/// The pose telemetry engine.
pub struct Engine {
    command_rx: Receiver<EngineCommand>,
    event_tx: Sender<EngineEvent>,
    state: Arc<RwLock<EngineState>>,
    resource_manager: ResourceManager,
    metrics: Arc<MetricsCollector>,
    last_metrics: Instant,
    group_events: CancellationToken,
    runtime: Option<Runtime>,
}

impl Engine {
    /// Create a new engine with its own tokio runtime.
    pub fn new(
        parts: EngineParts,
        command_rx: Receiver<EngineCommand>,
        event_tx: Sender<EngineEvent>,
    ) -> Result<Self, EngineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("posecast-rt")
            .enable_all()
            .build()?;
        Ok(Self::with_runtime(runtime, parts, command_rx, event_tx))
    }

    /// Create a new engine on an existing runtime.
    ///
    /// Lets the caller build runtime-bound collaborators (such as a UDP
    /// link) before handing the runtime over.
    pub fn with_runtime(
        runtime: Runtime,
        parts: EngineParts,
        command_rx: Receiver<EngineCommand>,
        event_tx: Sender<EngineEvent>,
    ) -> Self {
        let group = parts.activity.map(|activity| {
            let _guard = runtime.enter();
            Arc::new(GroupSessionController::spawn(activity))
        });

        let group_events = CancellationToken::new();
        if let Some(group) = &group {
            runtime.spawn(forward_group_events(
                group.subscribe(),
                event_tx.clone(),
                group_events.clone(),
            ));
        }

        let collaborators = Collaborators {
            source: parts.source,
            link: parts.link,
            group,
            template: parts.template,
        };

        Self {
            command_rx,
            event_tx: event_tx.clone(),
            state: Arc::new(RwLock::new(EngineState::Idle)),
            resource_manager: ResourceManager::new(collaborators, runtime.handle().clone(), event_tx),
            metrics: Arc::new(MetricsCollector::default()),
            last_metrics: Instant::now(),
            group_events,
            runtime: Some(runtime),
        }
    }

    /// Run the engine (blocking).
    #[instrument(name = "engine_run", skip(self))]
    pub fn run(&mut self) {
        info!("Engine starting");
        self.send_event(EngineEvent::Ready);

        loop {
            match self.command_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(command) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if self.state.read().is_live() {
                        self.on_idle_tick();
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    info!("Command channel disconnected, shutting down");
                    self.stop_pipeline(StopReason::UserRequested);
                    break;
                }
            }
        }

        info!("Engine stopped");
    }

    /// Handle a command. Returns false if engine should stop.
    fn handle_command(&mut self, command: EngineCommand) -> bool {
        debug!(?command, "Handling command");

        match command {
            EngineCommand::Start { config } => self.start_pipeline(config),
            EngineCommand::Stop => self.stop_pipeline(StopReason::UserRequested),
            EngineCommand::StartAdvertising => self.set_advertising(true),
            EngineCommand::StopAdvertising => self.set_advertising(false),
            EngineCommand::ShareActivity => self.share_activity(),
            EngineCommand::LeaveActivity => self.leave_activity(),
            EngineCommand::GetState => self.send_state(),
            EngineCommand::Shutdown => {
                self.stop_pipeline(StopReason::UserRequested);
                if let Some(group) = self.resource_manager.group() {
                    group.shutdown();
                }
                self.send_event(EngineEvent::Shutdown);
                return false;
            }
        }

        true
    }

    /// Start the pipeline.
    #[instrument(name = "start_pipeline", skip(self, config))]
    fn start_pipeline(&mut self, config: PipelineConfig) {
        // Idempotent: ignore if already starting or live
        {
            let state = self.state.read();
            if state.is_starting() || state.is_live() {
                debug!("Already starting or live, ignoring start command");
                return;
            }
            if state.is_fatal() {
                debug!("Engine is in a fatal state, ignoring start command");
                return;
            }
        }

        if let Err(e) = config.validate().map_err(EngineError::from) {
            warn!("Rejected configuration: {}", e);
            self.transition_to(EngineState::Error {
                message: e.to_string(),
                recoverable: true,
            });
            return;
        }

        info!(channel = ?config.channel, target_hz = config.target_hz, "Starting pipeline");
        self.transition_to(EngineState::Starting {
            phase: StartupPhase::CheckDevice,
        });

        let metrics = Arc::new(MetricsCollector::new());

        match self
            .resource_manager
            .initialize(&config, &metrics, StartupPhase::StartPacer)
        {
            Ok(()) => {
                self.metrics = metrics;
                self.metrics.start();
                self.last_metrics = Instant::now();

                self.transition_to(EngineState::Live {
                    config,
                    metrics: PipelineMetrics::default(),
                });

                info!("Pipeline started successfully");
            }
            Err(e) => {
                error!("Pipeline start failed: {}", e);

                // Rollback any initialized resources
                self.resource_manager.rollback();

                let recoverable = !e.is_fatal();
                if !recoverable {
                    self.send_event(EngineEvent::Error {
                        recoverable,
                        message: e.to_string(),
                    });
                }
                self.transition_to(EngineState::Error {
                    message: e.to_string(),
                    recoverable,
                });
            }
        }
    }

    /// Stop the pipeline.
    #[instrument(name = "stop_pipeline", skip(self))]
    fn stop_pipeline(&mut self, reason: StopReason) {
        // Idempotent: ignore if already idle or stopping
        {
            let state = self.state.read();
            if state.is_idle() || state.is_stopping() || state.is_fatal() {
                debug!("Already idle or stopping, ignoring stop command");
                return;
            }
        }

        info!(?reason, "Stopping pipeline");

        let mut phase = Some(ShutdownPhase::StopPacer);
        while let Some(current) = phase {
            self.transition_to(EngineState::Stopping {
                reason: reason.clone(),
                phase: current,
            });
            self.resource_manager.stop_phase(current);
            phase = current.next();
        }
        self.resource_manager.clear_phase();

        // Stop metrics
        self.metrics.stop();

        if let StopReason::CaptureLost = reason {
            self.send_event(EngineEvent::Error {
                recoverable: true,
                message: reason.message(),
            });
        }

        self.transition_to(EngineState::Idle);
        info!("Pipeline stopped");
    }

    fn on_idle_tick(&mut self) {
        if self.resource_manager.capture_lost() {
            warn!("Frame source lost");
            self.stop_pipeline(StopReason::CaptureLost);
            return;
        }

        if self.last_metrics.elapsed() >= Duration::from_millis(METRICS_INTERVAL_MS) {
            self.emit_metrics();
            self.last_metrics = Instant::now();
        }
    }

    fn set_advertising(&self, enabled: bool) {
        let Some(link) = self.resource_manager.link() else {
            self.send_event(EngineEvent::Error {
                recoverable: true,
                message: EngineError::MissingCollaborator("peer link").to_string(),
            });
            return;
        };

        let result = if enabled {
            link.start_advertising()
        } else {
            link.stop_advertising()
        };

        match result {
            Ok(()) => info!(peer = %link.local_peer(), enabled, "Advertising changed"),
            Err(e) => self.send_event(EngineEvent::Error {
                recoverable: true,
                message: e.to_string(),
            }),
        }
    }

    fn share_activity(&self) {
        let Some(group) = self.resource_manager.group() else {
            self.send_event(EngineEvent::Error {
                recoverable: true,
                message: EngineError::MissingCollaborator("group activity").to_string(),
            });
            return;
        };

        if let Err(e) = group.prepare() {
            warn!("Failed to request activation: {}", e);
        }
    }

    fn leave_activity(&self) {
        if let Some(group) = self.resource_manager.group() {
            if let Err(e) = group.leave() {
                warn!("Failed to leave group session: {}", e);
            }
        }
    }

    fn send_state(&self) {
        let state = self.state.read().clone();
        self.send_event(EngineEvent::StateChanged {
            previous: Box::new(state.clone()),
            current: Box::new(state),
        });
    }

    fn emit_metrics(&self) {
        let metrics = self.metrics.snapshot();
        self.send_event(EngineEvent::Metrics(metrics));

        // Check for warnings
        for warning in self.metrics.check_warnings() {
            self.send_event(EngineEvent::PerformanceWarning(warning));
        }

        self.metrics.mark_reported();
    }

    fn transition_to(&self, new_state: EngineState) {
        let previous = {
            let mut state = self.state.write();
            let prev = state.clone();
            *state = new_state.clone();
            prev
        };

        debug!(
            previous = %previous.name(),
            current = %new_state.name(),
            "State transition"
        );

        self.send_event(EngineEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(new_state),
        });
    }

    fn send_event(&self, event: EngineEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.group_events.cancel();
        self.resource_manager.shutdown();
        if let Some(group) = self.resource_manager.group() {
            group.shutdown();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

/// Relay group session transitions to the controller.
async fn forward_group_events(
    mut transitions: broadcast::Receiver<GroupTransition>,
    event_tx: Sender<EngineEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            transition = transitions.recv() => match transition {
                Ok(transition) => {
                    let event = EngineEvent::GroupStateChanged {
                        previous: transition.previous,
                        current: transition.current,
                    };
                    if event_tx.try_send(event).is_err() {
                        warn!("Failed to forward group state change");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Group state events lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}
