/// `engine/` — the station root
///
/// `StationEngine` owns every component for the life of the process and
/// runs one dispatcher task that imposes a single order on clock, decode,
/// encode, and mixer events. Starting and stopping the engine toggles the
/// resource set (radio link, audio streams, clock thread, operators), not
/// the wiring.
pub mod resources;
pub mod state_machine;
pub mod tracker;
pub mod transmit;

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::audio::{
    AudioInput, AudioMixer, AudioOutput, AudioRingBuffer, CpalSink, MixedAudio, PlaybackSink,
    DEFAULT_MIX_WINDOW_MS,
};
use crate::clock::{ClockEvent, ClockSource, SlotClock, SystemClock};
use crate::codec::{
    DecodeOutcome, DecodeQueue, DigiModeCodec, EncodeOutcome, EncodeQueue, EncodeRequest,
};
use crate::config::{RadioType, StationConfig};
use crate::error::{EngineError, Result};
use crate::events::{EventBus, StationEvent};
use crate::mode::{ModeDescriptor, FT8};
use crate::qso::operator::{CommandResponse, OperatorCommand};
use crate::qso::strategy::MemoryWorkedLog;
use crate::qso::{OperatorConfig, OperatorManager, WorkedLog};
use crate::radio::{NullTransport, RadioController, RadioEvent, RadioTransport, TcpCatTransport};
use crate::slots::{
    SlotInfo, SlotPack, SlotPackManager, SlotPackStore, SlotScheduler, DEFAULT_PACK_MAX_AGE_MS,
};

pub use resources::{ResourceEntry, ResourceManager, StartFailure};
pub use state_machine::{EngineAction, EngineContext, EngineEvent, EngineState, EngineStateMachine};
pub use tracker::{TransmissionPhases, TransmissionTracker};
pub use transmit::{TransmitPipeline, PTT_HOLD_MS};

pub type SinkFactory = Box<dyn FnMut() -> Result<Box<dyn PlaybackSink>> + Send>;

const STOP_WATCHDOG_MS: u64 = 10_000;

/// Injection points; `EngineDeps::from_config` gives the production set.
pub struct EngineDeps {
    pub codec: Arc<dyn DigiModeCodec>,
    pub transport: Box<dyn RadioTransport>,
    pub worked_log: Arc<dyn WorkedLog>,
    pub clock: Arc<dyn ClockSource>,
    pub sink_factory: SinkFactory,
    /// False leaves the capture device untouched (tests feed the ring
    /// buffer directly).
    pub capture: bool,
}

impl EngineDeps {
    pub fn from_config(config: &StationConfig, codec: Arc<dyn DigiModeCodec>) -> Result<Self> {
        let transport: Box<dyn RadioTransport> = match config.radio.kind {
            RadioType::None => Box::new(NullTransport::default()),
            RadioType::Network => {
                let net = config.radio.network.clone().ok_or_else(|| {
                    EngineError::InvalidConfig("radio.network section missing".into())
                })?;
                Box::new(TcpCatTransport::new(net.host, net.port))
            }
            RadioType::Serial | RadioType::IcomWlan => {
                return Err(EngineError::InvalidConfig(
                    "serial and icom-wlan transports are provided by external plugins; \
                     construct the engine with EngineDeps and a custom transport"
                        .into(),
                ));
            }
        };
        let output_device = config.audio.output_device_name.clone();
        Ok(Self {
            codec,
            transport,
            worked_log: Arc::new(MemoryWorkedLog::new()),
            clock: Arc::new(SystemClock),
            sink_factory: Box::new(move || {
                Ok(Box::new(CpalSink::open(output_device.as_deref())?) as Box<dyn PlaybackSink>)
            }),
            capture: true,
        })
    }
}

// ── Audio monitor ────────────────────────────────────────────────────────────

/// Periodic health heartbeat: capture level and ring overflow onto the bus.
#[derive(Default)]
struct AudioMonitor {
    task: Option<JoinHandle<()>>,
}

impl AudioMonitor {
    fn start(&mut self, input: Arc<AudioInput>, ring: Arc<AudioRingBuffer>, events: EventBus) {
        self.stop();
        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                events.publish(StationEvent::SystemStatus {
                    state: "running".into(),
                    detail: Some(format!(
                        "capture level {:.3}, ring overflow {}",
                        input.level(),
                        ring.overflow_count()
                    )),
                });
            }
        }));
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Engine internals ─────────────────────────────────────────────────────────

enum ControlMsg {
    /// Tear the resource set down; the state machine is already in
    /// STOPPING by the time this is sent.
    ForcedStop(String),
    AutoStart,
}

struct EngineInner {
    events: EventBus,
    clock: Arc<dyn ClockSource>,
    sm: Mutex<EngineStateMachine>,
    resources: tokio::sync::Mutex<ResourceManager>,
    running: Arc<AtomicBool>,

    ring: Arc<AudioRingBuffer>,
    input: Arc<AudioInput>,
    output: Arc<AudioOutput>,
    mixer: Arc<AudioMixer>,
    pack_manager: Arc<Mutex<SlotPackManager>>,
    operators: Arc<Mutex<OperatorManager>>,
    scheduler: Arc<SlotScheduler>,
    slot_clock: Arc<Mutex<SlotClock>>,
    decode_queue: Arc<DecodeQueue>,
    encode_queue: Arc<EncodeQueue>,
    pipeline: Arc<TransmitPipeline>,
    radio: RadioController,
    tracker: Arc<Mutex<TransmissionTracker>>,

    persist_dir: Option<PathBuf>,
    spectrum_enabled: Arc<AtomicBool>,
    control_tx: UnboundedSender<ControlMsg>,
}

pub struct StationEngine {
    inner: Arc<EngineInner>,
    _dispatcher: JoinHandle<()>,
    _radio_watcher: JoinHandle<()>,
    _control: JoinHandle<()>,
}

impl StationEngine {
    /// Production construction: transports, devices, and clock from config.
    /// Must be called on a tokio runtime.
    pub fn from_config(config: StationConfig, codec: Arc<dyn DigiModeCodec>) -> Result<Self> {
        let deps = EngineDeps::from_config(&config, codec)?;
        Ok(Self::new(config, deps))
    }

    pub fn new(config: StationConfig, deps: EngineDeps) -> Self {
        let events = EventBus::new(256);
        let clock = deps.clock;
        let mode = config
            .operators
            .first()
            .and_then(|o| ModeDescriptor::by_name(&o.mode))
            .cloned()
            .unwrap_or_else(|| FT8.clone());
        let compensation = config.radio.transmit_compensation_ms.unwrap_or(0);

        let ring = Arc::new(AudioRingBuffer::with_seconds(30));
        let input = Arc::new(AudioInput::new(
            config.audio.input_device_name.clone(),
            Arc::clone(&clock),
            Arc::clone(&ring),
        ));
        let output = Arc::new(
            AudioOutput::unbound(Arc::clone(&clock))
                .with_frames_per_buffer(config.audio.buffer_size as usize)
                .with_wav_dump(config.audio.dump_tx_dir.clone()),
        );
        if let Some(vg) = &config.last_volume_gain {
            output.set_volume_gain_db(vg.gain_db);
        }

        let (mixed_tx, mixed_rx) = unbounded_channel();
        let mixer = AudioMixer::new(DEFAULT_MIX_WINDOW_MS, mixed_tx);

        let (radio_tx, radio_rx) = unbounded_channel();
        let radio = RadioController::new(deps.transport, radio_tx);
        radio.set_auto_reconnect(true);

        let tracker = Arc::new(Mutex::new(TransmissionTracker::new()));
        let pipeline = TransmitPipeline::new(
            Arc::clone(&clock),
            Arc::clone(&output),
            Arc::clone(&mixer),
            radio.clone(),
            events.clone(),
            Arc::clone(&tracker),
        );
        pipeline.set_compensation(compensation);

        let (decode_tx, decode_rx) = unbounded_channel();
        let decode_queue = Arc::new(DecodeQueue::new(Arc::clone(&deps.codec), 1, decode_tx));
        let (encode_tx, encode_rx) = unbounded_channel();
        let encode_queue = Arc::new(EncodeQueue::new(Arc::clone(&deps.codec), 1, encode_tx));

        let pack_manager = Arc::new(Mutex::new(SlotPackManager::new(
            mode.clone(),
            Arc::clone(&clock),
            events.clone(),
        )));
        let operators = Arc::new(Mutex::new(OperatorManager::new(
            mode.clone(),
            events.clone(),
            Arc::clone(&deps.worked_log),
        )));
        {
            let mut om = operators.lock().unwrap();
            for op in &config.operators {
                om.upsert_operator(op.clone());
            }
        }
        let scheduler = Arc::new(SlotScheduler::new(
            Arc::clone(&ring),
            config.ft8.decode_while_transmitting,
        ));

        let (clock_tx, clock_rx) = unbounded_channel();
        let slot_clock = Arc::new(Mutex::new(SlotClock::new(
            Arc::clone(&clock),
            mode,
            compensation,
            clock_tx,
        )));

        let (control_tx, control_rx) = unbounded_channel();
        let running = Arc::new(AtomicBool::new(false));

        let inner = Arc::new(EngineInner {
            events,
            clock,
            sm: Mutex::new(EngineStateMachine::new()),
            resources: tokio::sync::Mutex::new(ResourceManager::new()),
            running,
            ring,
            input,
            output,
            mixer,
            pack_manager,
            operators,
            scheduler,
            slot_clock,
            decode_queue,
            encode_queue,
            pipeline,
            radio,
            tracker,
            persist_dir: config.data_dir.clone(),
            spectrum_enabled: Arc::new(AtomicBool::new(false)),
            control_tx,
        });
        inner.register_resources(deps.sink_factory, deps.capture, config.radio.kind);

        let dispatcher = tokio::spawn(dispatcher_loop(
            Arc::clone(&inner),
            clock_rx,
            decode_rx,
            encode_rx,
            mixed_rx,
        ));
        let radio_watcher = tokio::spawn(radio_watcher_loop(Arc::clone(&inner), radio_rx));
        let control = tokio::spawn(control_loop(Arc::clone(&inner), control_rx));

        Self {
            inner,
            _dispatcher: dispatcher,
            _radio_watcher: radio_watcher,
            _control: control,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    pub async fn start(&self) -> Result<()> {
        self.inner.start_internal().await
    }

    pub async fn stop(&self) -> Result<()> {
        let action = self.inner.sm.lock().unwrap().on_event(EngineEvent::Stop);
        if action != Some(EngineAction::StopResources) {
            return Ok(());
        }
        self.inner.teardown().await
    }

    pub fn state(&self) -> EngineState {
        self.inner.sm.lock().unwrap().state()
    }

    pub fn context(&self) -> EngineContext {
        self.inner.sm.lock().unwrap().context().clone()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StationEvent> {
        self.inner.events.subscribe()
    }

    // ── Settings ──────────────────────────────────────────────────────────

    /// Takes effect at the next slot boundary.
    pub fn set_mode(&self, name: &str) -> Result<()> {
        let mode = ModeDescriptor::by_name(name)
            .ok_or_else(|| EngineError::InvalidConfig(format!("unknown mode '{name}'")))?;
        self.inner.slot_clock.lock().unwrap().set_mode(mode.clone());
        self.inner.operators.lock().unwrap().set_mode(mode.clone());
        self.inner.pack_manager.lock().unwrap().set_mode(mode.clone());
        self.inner.events.publish(StationEvent::ModeChanged {
            mode: mode.name.to_string(),
        });
        Ok(())
    }

    pub fn set_compensation(&self, ms: i64) {
        self.inner.slot_clock.lock().unwrap().set_compensation(ms);
        self.inner.pipeline.set_compensation(ms);
    }

    pub fn set_volume_gain_db(&self, db: f32) {
        self.inner.output.set_volume_gain_db(db);
        self.publish_volume();
    }

    pub fn set_volume_gain(&self, linear: f32) {
        self.inner.output.set_volume_gain(linear);
        self.publish_volume();
    }

    fn publish_volume(&self) {
        self.inner.events.publish(StationEvent::VolumeGainChanged {
            gain: self.inner.output.volume_gain(),
            gain_db: self.inner.output.volume_gain_db(),
        });
    }

    pub async fn set_frequency(&self, hz: u64) -> Result<()> {
        self.inner.radio.set_frequency(hz).await
    }

    // ── Operators ─────────────────────────────────────────────────────────

    pub fn upsert_operator(&self, config: OperatorConfig) {
        self.inner.operators.lock().unwrap().upsert_operator(config);
    }

    pub fn remove_operator(&self, id: &str) -> bool {
        self.inner.operators.lock().unwrap().remove_operator(id)
    }

    /// Route a user command; a content change mid-slot may trigger an
    /// immediate re-encode.
    pub async fn operator_command(
        &self,
        operator_id: &str,
        command: OperatorCommand,
    ) -> CommandResponse {
        let now = self.inner.clock.now();
        let changes_content = matches!(
            command,
            OperatorCommand::CallStation { .. }
                | OperatorCommand::ResumeCq
                | OperatorCommand::Halt
                | OperatorCommand::SetSlot { .. }
        );
        let (response, mid_slot) = {
            let mut om = self.inner.operators.lock().unwrap();
            let mode = om.mode().clone();
            let cycle = mode.cycle_number(mode.slot_start_for(now));
            let response = om.handle_command(operator_id, command, cycle);
            let mid_slot = if changes_content && self.inner.running.load(Ordering::SeqCst) {
                let slot_start = mode.slot_start_for(now);
                let slot = SlotInfo::new(slot_start, now, slot_start, &mode);
                om.check_and_trigger_transmission(operator_id, &slot, now)
            } else {
                None
            };
            (response, mid_slot)
        };
        if let Some(request) = mid_slot {
            self.inner.dispatch_encode(request, now).await;
        }
        response
    }

    // ── Queries ───────────────────────────────────────────────────────────

    pub fn slot_pack(&self, slot_id: &str) -> Option<SlotPack> {
        self.inner
            .pack_manager
            .lock()
            .unwrap()
            .get_slot_pack(slot_id)
            .cloned()
    }

    pub fn latest_slot_pack(&self) -> Option<SlotPack> {
        self.inner
            .pack_manager
            .lock()
            .unwrap()
            .get_latest_slot_pack()
            .cloned()
    }

    pub fn find_best_transmit_frequency(&self, slot_id: &str) -> Option<f32> {
        self.inner
            .pack_manager
            .lock()
            .unwrap()
            .find_best_transmit_frequency(slot_id, 300.0, 3_500.0, 100.0)
    }

    pub fn transmission_phases(
        &self,
        operator_id: &str,
        slot_start_ms: i64,
    ) -> Option<TransmissionPhases> {
        self.inner
            .tracker
            .lock()
            .unwrap()
            .get(operator_id, slot_start_ms)
            .cloned()
    }

    /// Milliseconds until the next nominal slot boundary.
    pub fn next_slot_in(&self) -> i64 {
        self.inner.slot_clock.lock().unwrap().get_next_slot_in()
    }

    pub fn operator_statuses(&self) -> Vec<crate::qso::OperatorStatus> {
        self.inner.operators.lock().unwrap().statuses()
    }

    pub fn radio(&self) -> &RadioController {
        &self.inner.radio
    }

    pub fn ring(&self) -> &Arc<AudioRingBuffer> {
        &self.inner.ring
    }
}

impl EngineInner {
    fn register_resources(
        self: &Arc<Self>,
        mut sink_factory: SinkFactory,
        capture: bool,
        radio_kind: RadioType,
    ) {
        let mut resources = self
            .resources
            .try_lock()
            .expect("resources are unshared during construction");

        let radio = self.radio.clone();
        let radio_stop = self.radio.clone();
        resources.register(ResourceEntry::new(
            "radio",
            1,
            move || radio.connect_blocking(),
            move || {
                radio_stop.disconnect_blocking("engine stop");
                Ok(())
            },
        ));

        if radio_kind == RadioType::IcomWlan {
            // The vendor transport plugin carries its own audio adapter; the
            // entry only marks the dependency slot.
            resources.register(
                ResourceEntry::new("icom_wlan_audio_adapter", 2, || Ok(()), || Ok(())).optional(),
            );
        }

        let input = Arc::clone(&self.input);
        let input_stop = Arc::clone(&self.input);
        resources.register(ResourceEntry::new(
            "audio_input_stream",
            3,
            move || if capture { input.start() } else { Ok(()) },
            move || {
                input_stop.stop();
                Ok(())
            },
        ));

        let output = Arc::clone(&self.output);
        let output_stop = Arc::clone(&self.output);
        resources.register(
            ResourceEntry::new(
                "audio_output_stream",
                4,
                move || {
                    let sink = sink_factory()?;
                    output.set_sink(sink);
                    Ok(())
                },
                move || {
                    output_stop.clear_sink();
                    Ok(())
                },
            )
            .depends_on(&["audio_input_stream"]),
        );

        let monitor = Arc::new(Mutex::new(AudioMonitor::default()));
        let monitor_stop = Arc::clone(&monitor);
        let monitor_input = Arc::clone(&self.input);
        let monitor_ring = Arc::clone(&self.ring);
        let monitor_events = self.events.clone();
        resources.register(ResourceEntry::new(
            "audio_monitor_service",
            5,
            move || {
                monitor.lock().unwrap().start(
                    Arc::clone(&monitor_input),
                    Arc::clone(&monitor_ring),
                    monitor_events.clone(),
                );
                Ok(())
            },
            move || {
                monitor_stop.lock().unwrap().stop();
                Ok(())
            },
        ));

        let clock_start = Arc::clone(&self.slot_clock);
        let clock_stop = Arc::clone(&self.slot_clock);
        resources.register(ResourceEntry::new(
            "clock",
            6,
            move || clock_start.lock().unwrap().start(),
            move || {
                clock_stop.lock().unwrap().stop();
                Ok(())
            },
        ));

        // The scheduler itself is event-driven; its resource entry gates
        // whether clock fires reach the dispatcher at all.
        let sched_flag = Arc::clone(&self.running);
        let sched_flag_stop = Arc::clone(&self.running);
        resources.register(
            ResourceEntry::new(
                "slot_scheduler",
                7,
                move || {
                    sched_flag.store(true, Ordering::SeqCst);
                    Ok(())
                },
                move || {
                    sched_flag_stop.store(false, Ordering::SeqCst);
                    Ok(())
                },
            )
            .depends_on(&["clock"]),
        );

        let spectrum = Arc::clone(&self.spectrum_enabled);
        let spectrum_stop = Arc::clone(&self.spectrum_enabled);
        resources.register(
            ResourceEntry::new(
                "spectrum_scheduler",
                8,
                move || {
                    spectrum.store(true, Ordering::SeqCst);
                    Ok(())
                },
                move || {
                    spectrum_stop.store(false, Ordering::SeqCst);
                    Ok(())
                },
            )
            .depends_on(&["clock"]),
        );

        let om_start = Arc::clone(&self.operators);
        let om_stop = Arc::clone(&self.operators);
        resources.register(
            ResourceEntry::new(
                "operator_manager",
                9,
                move || {
                    om_start.lock().unwrap().start_all_operators();
                    Ok(())
                },
                move || {
                    om_stop.lock().unwrap().stop_all_operators();
                    Ok(())
                },
            )
            .depends_on(&["clock"]),
        );
    }

    async fn start_internal(self: &Arc<Self>) -> Result<()> {
        let action = self.sm.lock().unwrap().on_event(EngineEvent::Start);
        if action != Some(EngineAction::StartResources) {
            return Err(EngineError::InvalidConfig(format!(
                "engine cannot start from state {:?}",
                self.sm.lock().unwrap().state()
            )));
        }
        self.events.publish(StationEvent::SystemStatus {
            state: "starting".into(),
            detail: None,
        });

        if let Some(dir) = &self.persist_dir {
            let store = SlotPackStore::new(dir.clone());
            self.pack_manager.lock().unwrap().set_store(store);
        }

        let result = self.resources.lock().await.start_all();
        match result {
            Ok(()) => {
                let started: Vec<String> = self
                    .resources
                    .lock()
                    .await
                    .started_names()
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
                self.running.store(true, Ordering::SeqCst);
                self.sm
                    .lock()
                    .unwrap()
                    .on_event(EngineEvent::StartSucceeded { started });
                self.events.publish(StationEvent::SystemStatus {
                    state: "running".into(),
                    detail: None,
                });
                log::info!("engine running");
                Ok(())
            }
            Err(failure) => {
                let store = self.pack_manager.lock().unwrap().take_store();
                if let Some(store) = store {
                    store.shutdown().await;
                }
                let message = failure.error.to_string();
                self.sm.lock().unwrap().on_event(EngineEvent::StartFailed {
                    error: message.clone(),
                    started: failure
                        .started_before_failure
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                });
                self.events.publish(StationEvent::SystemStatus {
                    state: "error".into(),
                    detail: Some(message.clone()),
                });
                Err(EngineError::ResourceStartFailure {
                    name: failure.failed_resource.to_string(),
                    message,
                })
            }
        }
    }

    /// Shared teardown for STOP and forced stops. The state machine has
    /// already moved to STOPPING.
    async fn teardown(self: &Arc<Self>) -> Result<()> {
        self.events.publish(StationEvent::SystemStatus {
            state: "stopping".into(),
            detail: None,
        });
        self.running.store(false, Ordering::SeqCst);

        let work = async {
            self.pipeline.force_ptt_off().await;
            self.output.stop_current_playback().await;
            self.mixer.reset();
            self.resources.lock().await.stop_all();
            let store = self.pack_manager.lock().unwrap().take_store();
            if let Some(store) = store {
                store.shutdown().await;
            }
        };
        let timed_out = tokio::time::timeout(Duration::from_millis(STOP_WATCHDOG_MS), work)
            .await
            .is_err();

        self.sm.lock().unwrap().on_event(EngineEvent::StopFinished);
        self.events.publish(StationEvent::SystemStatus {
            state: "idle".into(),
            detail: None,
        });
        if timed_out {
            log::error!("engine stop exceeded the {STOP_WATCHDOG_MS} ms watchdog");
            return Err(EngineError::StopTimeout(STOP_WATCHDOG_MS));
        }
        Ok(())
    }

    /// Common tail for every encode dispatch: counters, tracking, the
    /// operator's own-transmit frame, then the queue.
    async fn dispatch_encode(self: &Arc<Self>, request: EncodeRequest, now: i64) {
        self.pipeline.add_expected_encodes(1);
        self.tracker
            .lock()
            .unwrap()
            .requested(&request.operator_id, request.slot_start_ms, now);
        self.pack_manager.lock().unwrap().add_transmission_frame(
            &crate::slots::slot_id(request.slot_start_ms),
            &request.operator_id,
            &request.message,
            request.audio_freq_hz,
            now,
        );
        if let Err(e) = self.encode_queue.push(request).await {
            log::error!("encode queue rejected request: {e}");
        }
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────────────

async fn dispatcher_loop(
    inner: Arc<EngineInner>,
    mut clock_rx: UnboundedReceiver<ClockEvent>,
    mut decode_rx: UnboundedReceiver<DecodeOutcome>,
    mut encode_rx: UnboundedReceiver<EncodeOutcome>,
    mut mixed_rx: UnboundedReceiver<MixedAudio>,
) {
    loop {
        tokio::select! {
            Some(event) = clock_rx.recv() => handle_clock_event(&inner, event).await,
            Some(outcome) = decode_rx.recv() => handle_decode_outcome(&inner, outcome),
            Some(outcome) = encode_rx.recv() => handle_encode_outcome(&inner, outcome).await,
            Some(mixed) = mixed_rx.recv() => inner.pipeline.on_mixed_ready(mixed),
            else => break,
        }
    }
    log::debug!("dispatcher loop ended");
}

async fn handle_clock_event(inner: &Arc<EngineInner>, event: ClockEvent) {
    if !inner.running.load(Ordering::SeqCst) {
        return;
    }
    match event {
        ClockEvent::SlotStart(slot) => {
            log::debug!("slot {} (phase {} ms)", slot.id, slot.phase_ms);
            inner.pipeline.on_slot_start(&slot).await;
            {
                let mut packs = inner.pack_manager.lock().unwrap();
                packs.cleanup_expired(DEFAULT_PACK_MAX_AGE_MS);
            }
            inner
                .tracker
                .lock()
                .unwrap()
                .prune(slot.start_ms - 2 * DEFAULT_PACK_MAX_AGE_MS);
            inner.events.publish(StationEvent::SlotStart { slot });
        }
        ClockEvent::EncodeStart(slot) => {
            let now = inner.clock.now();
            let requests = {
                let mut om = inner.operators.lock().unwrap();
                om.collect_transmit_requests(&slot);
                om.process_pending_transmissions(&slot, now)
            };
            for request in requests {
                inner.dispatch_encode(request, now).await;
            }
        }
        ClockEvent::TransmitStart(slot) => {
            inner.pipeline.on_transmit_start(&slot);
        }
        ClockEvent::SubWindow(slot, window_idx) => {
            inner.events.publish(StationEvent::SubWindow {
                slot: slot.clone(),
                window_idx,
            });
            let (mode, transmitting) = {
                let om = inner.operators.lock().unwrap();
                (
                    om.mode().clone(),
                    om.has_active_transmissions_in_current_cycle(slot.start_ms),
                )
            };
            if let Err(e) = inner
                .scheduler
                .on_sub_window(&inner.decode_queue, &slot, window_idx, &mode, transmitting)
                .await
            {
                log::warn!("sub-window {window_idx} of {} not scheduled: {e}", slot.id);
            }
        }
    }
}

fn handle_decode_outcome(inner: &Arc<EngineInner>, outcome: DecodeOutcome) {
    match outcome {
        DecodeOutcome::Complete(result) => {
            let slot_id = result.slot_id.clone();
            let pack = {
                let mut packs = inner.pack_manager.lock().unwrap();
                packs.process_decode_result(result);
                packs.get_slot_pack(&slot_id).cloned()
            };
            if let Some(pack) = pack {
                inner.operators.lock().unwrap().on_slot_pack(&pack);
            }
        }
        DecodeOutcome::Error {
            slot_id,
            window_idx,
            message,
        } => {
            inner.events.publish(StationEvent::DecodeError {
                slot_id,
                window_idx,
                message,
            });
        }
    }
}

async fn handle_encode_outcome(inner: &Arc<EngineInner>, outcome: EncodeOutcome) {
    match outcome {
        EncodeOutcome::Complete(result) => {
            inner.pipeline.on_encode_complete(result).await;
        }
        EncodeOutcome::Error {
            operator_id,
            message,
            request,
        } => {
            inner.tracker.lock().unwrap().completed(
                &operator_id,
                request.slot_start_ms,
                inner.clock.now(),
                false,
            );
            inner
                .events
                .publish(StationEvent::EncodeError { operator_id, message });
        }
    }
}

// ── Radio watcher ────────────────────────────────────────────────────────────

async fn radio_watcher_loop(inner: Arc<EngineInner>, mut radio_rx: UnboundedReceiver<RadioEvent>) {
    while let Some(event) = radio_rx.recv().await {
        match event {
            RadioEvent::Connected { reconnect_attempts } => {
                inner.events.publish(StationEvent::RadioStatusChanged {
                    connected: true,
                    frequency_hz: Some(inner.radio.get_frequency()),
                });
                // A link that healed itself restarts an idle engine.
                if reconnect_attempts > 0
                    && inner.sm.lock().unwrap().state() == EngineState::Idle
                {
                    let _ = inner.control_tx.send(ControlMsg::AutoStart);
                }
            }
            RadioEvent::Disconnected { reason } => {
                inner.events.publish(StationEvent::RadioStatusChanged {
                    connected: false,
                    frequency_hz: None,
                });
                if inner.sm.lock().unwrap().state() == EngineState::Running {
                    // Ordering matters here: operators stop, PTT drops, the
                    // state machine leaves RUNNING, and only then does the
                    // user-facing advisory go out, followed by the teardown.
                    inner.operators.lock().unwrap().stop_all_operators();
                    let transmitting = inner.pipeline.quell_for_disconnect().await;
                    let action = inner
                        .sm
                        .lock()
                        .unwrap()
                        .on_event(EngineEvent::RadioDisconnected(reason.clone()));
                    if transmitting {
                        inner.pipeline.publish_disconnect_advisory(&reason);
                    }
                    if action == Some(EngineAction::StopResources) {
                        let _ = inner.control_tx.send(ControlMsg::ForcedStop(reason));
                    }
                }
            }
            RadioEvent::FrequencyChanged { hz } => {
                // New band: everything heard so far is stale.
                inner.pack_manager.lock().unwrap().clear_all();
                inner
                    .events
                    .publish(StationEvent::FrequencyChanged { frequency_hz: hz });
            }
            RadioEvent::Error { message } => {
                inner.events.publish(StationEvent::RadioError { message });
            }
        }
    }
}

async fn control_loop(inner: Arc<EngineInner>, mut control_rx: UnboundedReceiver<ControlMsg>) {
    while let Some(msg) = control_rx.recv().await {
        match msg {
            ControlMsg::ForcedStop(reason) => {
                log::warn!("stopping engine after radio loss: {reason}");
                if let Err(e) = inner.teardown().await {
                    log::error!("forced stop failed: {e}");
                }
            }
            ControlMsg::AutoStart => {
                log::info!("radio reconnected; auto-starting the engine");
                if let Err(e) = inner.start_internal().await {
                    log::warn!("auto-start after reconnect failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::ScriptedCodec;
    use crate::audio::NullSink;
    use crate::radio::transport::mock::MockTransport;
    use crate::slots::TRANSMIT_SNR;

    // A UTC-aligned FT8 boundary whose cycle number is even.
    const SLOT: i64 = 1_700_000_010_000;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn test_config() -> StationConfig {
        let mut config = StationConfig::default();
        config.ft8.my_callsign = "AA1AA".into();
        config.operators.push(OperatorConfig {
            id: "op1".into(),
            my_callsign: "AA1AA".into(),
            my_grid: "FN42".into(),
            transmit_cycles: vec![0, 1],
            auto_reply_to_cq: true,
            ..OperatorConfig::default()
        });
        config
    }

    fn test_deps(
        clock: Arc<ManualClock>,
        codec: Arc<ScriptedCodec>,
        transport: MockTransport,
        fail_sink: bool,
    ) -> EngineDeps {
        EngineDeps {
            codec,
            transport: Box::new(transport),
            worked_log: Arc::new(MemoryWorkedLog::new()),
            clock,
            sink_factory: Box::new(move || {
                if fail_sink {
                    Err(EngineError::DeviceNotFound("output".into()))
                } else {
                    Ok(Box::new(NullSink::new(48_000)) as Box<dyn PlaybackSink>)
                }
            }),
            capture: false,
        }
    }

    async fn wait_for_event(
        rx: &mut tokio::sync::broadcast::Receiver<StationEvent>,
        want: fn(&StationEvent) -> bool,
    ) -> StationEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(e) if want(&e) => return e,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(e) => panic!("event stream closed: {e}"),
                }
            }
        })
        .await
        .expect("expected event not observed in time")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_and_stop_cycle() {
        init_logging();
        let clock = Arc::new(ManualClock::new(SLOT - 100));
        let codec = Arc::new(ScriptedCodec::new());
        let engine = StationEngine::new(
            test_config(),
            test_deps(Arc::clone(&clock), codec, MockTransport::default(), false),
        );

        assert_eq!(engine.state(), EngineState::Idle);
        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(engine.radio().is_connected());

        // Double-start is rejected without disturbing the run.
        assert!(engine.start().await.is_err());
        assert_eq!(engine.state(), EngineState::Running);

        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!engine.radio().is_connected());

        // The engine is restartable.
        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        engine.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sink_failure_rolls_back_into_error_state() {
        init_logging();
        let clock = Arc::new(ManualClock::new(SLOT - 100));
        let codec = Arc::new(ScriptedCodec::new());
        let transport = MockTransport::default();
        let engine = StationEngine::new(
            test_config(),
            test_deps(Arc::clone(&clock), codec, transport.clone(), true),
        );

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, EngineError::ResourceStartFailure { .. }));
        assert_eq!(engine.state(), EngineState::Error);
        let context = engine.context();
        assert!(context.error.is_some());
        assert_eq!(
            context.started_resources,
            vec!["radio".to_string(), "audio_input_stream".into()]
        );
        // Rollback disconnected the radio again.
        assert!(!engine.radio().is_connected());

        // STOP recovers to IDLE.
        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slot_cycle_drives_a_cq_transmission() {
        init_logging();
        let clock = Arc::new(ManualClock::new(SLOT - 50));
        let codec = Arc::new(ScriptedCodec::new());
        codec.set_encode_duration_ms(200);
        let engine = StationEngine::new(
            test_config(),
            test_deps(Arc::clone(&clock), codec, MockTransport::default(), false),
        );
        let mut events = engine.subscribe();
        engine.start().await.unwrap();

        // Cross the slot boundary: slot_start then encode_start fire.
        clock.set(SLOT + 1);
        let log_event = wait_for_event(&mut events, |e| {
            matches!(e, StationEvent::TransmissionLog { .. })
        })
        .await;
        match log_event {
            StationEvent::TransmissionLog {
                operator_id,
                message,
                slot_start_ms,
                frequency,
                ..
            } => {
                assert_eq!(operator_id, "op1");
                assert_eq!(message, "CQ AA1AA FN42");
                assert_eq!(slot_start_ms, SLOT);
                assert_eq!(frequency, 1_500.0);
            }
            _ => unreachable!(),
        }

        // PTT keys when the gated playback reaches the transmit trigger.
        wait_for_event(&mut events, |e| {
            matches!(e, StationEvent::PttStatusChanged { active: true })
        })
        .await;
        assert!(engine.radio().is_ptt());

        // Let the clip run out.
        clock.set(SLOT + 3_000);
        let complete = wait_for_event(&mut events, |e| {
            matches!(e, StationEvent::TransmissionComplete { .. })
        })
        .await;
        match complete {
            StationEvent::TransmissionComplete {
                operator_id,
                success,
                ..
            } => {
                assert_eq!(operator_id, "op1");
                assert!(success);
            }
            _ => unreachable!(),
        }
        // PTT releases after the hold interval.
        tokio::time::timeout(Duration::from_secs(3), async {
            while engine.radio().is_ptt() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("PTT did not release after playback");

        // The operator's own frame leads the slot pack.
        let pack = engine.slot_pack(&format!("slot-{SLOT}")).unwrap();
        assert!(!pack.frames.is_empty());
        assert_eq!(pack.frames[0].message, "CQ AA1AA FN42");
        assert_eq!(pack.frames[0].snr, TRANSMIT_SNR);
        assert_eq!(pack.frames[0].freq, 1_500.0);

        engine.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn radio_disconnect_while_running_forces_idle() {
        init_logging();
        let clock = Arc::new(ManualClock::new(SLOT - 100));
        let codec = Arc::new(ScriptedCodec::new());
        let engine = StationEngine::new(
            test_config(),
            test_deps(Arc::clone(&clock), codec, MockTransport::default(), false),
        );
        let mut events = engine.subscribe();
        engine.start().await.unwrap();

        engine.radio().report_disconnect("io error");
        wait_for_event(&mut events, |e| {
            matches!(
                e,
                StationEvent::RadioStatusChanged {
                    connected: false,
                    ..
                }
            )
        })
        .await;

        // The forced stop drains through the control loop.
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.state() != EngineState::Idle {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("engine did not reach IDLE after radio loss");
    }
}
