//! Adaptive consistency controller.
//!
//! Owns the mode state machine for every object. A single-writer
//! evaluation loop samples metrics, applies hysteresis and cooldowns,
//! honors operator overrides and critical keys, handles emergencies,
//! and persists every state change before acting on it. Admin mutations
//! arrive over a command channel, so transitions are linearizable by
//! construction and no per-object lock exists.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

use echofs_core::{
    ConsistencyMode, MetaStore, ModeHint, ObjectMeta, ObjectModeState, TransitionReason,
};

use crate::config::ControllerConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::metrics::{ClusterMetrics, ClusterMetricsSnapshot};
use crate::policy::{MetricsSource, PolicyEngine, PolicyInput};

/// Emitted on every enacted transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeChangeEvent {
    /// Object whose mode changed
    pub object_id: String,
    /// Mode before the transition
    pub from: ConsistencyMode,
    /// Mode after the transition
    pub to: ConsistencyMode,
    /// Why the transition happened
    pub reason: TransitionReason,
    /// When the transition was enacted
    pub at: DateTime<Utc>,
}

/// Answer to a mode query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeInfo {
    /// Mode in force
    pub mode: ConsistencyMode,
    /// How long the answer may be cached
    pub ttl_seconds: u64,
    /// Why the mode was last set
    pub reason: TransitionReason,
    /// When the mode was last set
    pub timestamp: DateTime<Utc>,
}

/// Result of a register call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterOutcome {
    /// The object was created
    Registered,
    /// The object already existed
    AlreadyExists,
}

/// Controller status for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerStatus {
    /// Active global override, if any
    pub global_override: Option<ConsistencyMode>,
    /// Number of critical keys
    pub critical_keys_count: usize,
    /// Whether the emergency latch is set
    pub emergency_mode: bool,
    /// Objects under management
    pub total_objects: usize,
    /// Objects in mode C
    pub objects_strong: usize,
    /// Objects in mode A
    pub objects_available: usize,
    /// Objects in hybrid mode
    pub objects_hybrid: usize,
    /// Controller counters
    pub metrics: ClusterMetricsSnapshot,
    /// When the evaluation loop last completed a cycle
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Read view published by the evaluation loop.
#[derive(Debug, Default)]
struct SharedView {
    mode_states: HashMap<String, ObjectModeState>,
    global_override: Option<ConsistencyMode>,
    critical_keys: BTreeSet<String>,
    emergency_mode: bool,
    last_cycle_at: Option<DateTime<Utc>>,
}

/// Admin mutations funneled into the single-writer loop.
enum Command {
    Register {
        object_id: String,
        hint: ModeHint,
        resp: oneshot::Sender<ClusterResult<(RegisterOutcome, ConsistencyMode)>>,
    },
    SetHint {
        object_id: String,
        hint: ModeHint,
        resp: oneshot::Sender<ClusterResult<()>>,
    },
    SetOverride {
        mode: Option<ConsistencyMode>,
        resp: oneshot::Sender<ClusterResult<()>>,
    },
    CriticalKey {
        object_id: String,
        add: bool,
        resp: oneshot::Sender<ClusterResult<()>>,
    },
    RunCycle {
        resp: oneshot::Sender<ClusterResult<()>>,
    },
    Stop,
}

/// In-flight hysteresis bookkeeping for one object.
#[derive(Debug, Clone, Copy)]
struct VoteState {
    pending: ConsistencyMode,
    count: u32,
}

/// The adaptive consistency controller.
///
/// This handle is cheap to share; the state machine itself lives in the
/// spawned evaluation loop.
pub struct ConsistencyController {
    config: ControllerConfig,
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<RwLock<SharedView>>,
    events_tx: broadcast::Sender<ModeChangeEvent>,
    metrics: Arc<ClusterMetrics>,
}

impl std::fmt::Debug for ConsistencyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyController").finish_non_exhaustive()
    }
}

impl ConsistencyController {
    /// Restore state from the store and start the evaluation loop.
    ///
    /// # Errors
    ///
    /// Returns an error when the persisted state cannot be loaded.
    pub async fn start(
        config: ControllerConfig,
        policy: PolicyEngine,
        store: Arc<MetaStore>,
        metrics_source: Arc<dyn MetricsSource>,
        metrics: Arc<ClusterMetrics>,
    ) -> ClusterResult<Arc<Self>> {
        // Startup reconciliation: the persisted map is authoritative.
        let shared = Arc::new(RwLock::new(SharedView {
            mode_states: store.load_mode_states().await,
            global_override: store.global_override().await,
            critical_keys: store.critical_keys().await,
            emergency_mode: store.emergency_mode().await,
            last_cycle_at: None,
        }));

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(256);

        {
            let view = shared.read().await;
            info!(
                objects = view.mode_states.len(),
                critical_keys = view.critical_keys.len(),
                emergency = view.emergency_mode,
                "Controller state restored"
            );
        }

        let core = ControllerCore {
            config: config.clone(),
            policy,
            store,
            metrics_source,
            metrics: Arc::clone(&metrics),
            shared: Arc::clone(&shared),
            events_tx: events_tx.clone(),
            votes: HashMap::new(),
        };
        tokio::spawn(core.run(cmd_rx));

        Ok(Arc::new(Self {
            config,
            cmd_tx,
            shared,
            events_tx,
            metrics,
        }))
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<ClusterResult<T>>) -> Command,
        what: &str,
    ) -> ClusterResult<T> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(resp_tx))
            .await
            .map_err(|_| ClusterError::ControllerUnavailable(what.to_string()))?;
        resp_rx
            .await
            .map_err(|_| ClusterError::ControllerUnavailable(what.to_string()))?
    }

    /// Register an object ahead of its first write.
    ///
    /// # Errors
    ///
    /// Returns store errors, or `ControllerUnavailable` when the loop
    /// stopped.
    pub async fn register(
        &self,
        object_id: &str,
        hint: ModeHint,
    ) -> ClusterResult<(RegisterOutcome, ConsistencyMode)> {
        let object_id = object_id.to_string();
        self.send(
            |resp| Command::Register {
                object_id,
                hint,
                resp,
            },
            "register",
        )
        .await
    }

    /// Update an object's caller-owned mode hint.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown objects.
    pub async fn set_hint(&self, object_id: &str, hint: ModeHint) -> ClusterResult<()> {
        let object_id = object_id.to_string();
        self.send(
            |resp| Command::SetHint {
                object_id,
                hint,
                resp,
            },
            "set_hint",
        )
        .await
    }

    /// Set or clear the global mode override.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn set_global_override(&self, mode: Option<ConsistencyMode>) -> ClusterResult<()> {
        self.send(|resp| Command::SetOverride { mode, resp }, "set_override")
            .await
    }

    /// Add an object to the critical-keys set, forcing it into mode C.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn add_critical_key(&self, object_id: &str) -> ClusterResult<()> {
        let object_id = object_id.to_string();
        self.send(
            |resp| Command::CriticalKey {
                object_id,
                add: true,
                resp,
            },
            "add_critical_key",
        )
        .await
    }

    /// Remove an object from the critical-keys set.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn remove_critical_key(&self, object_id: &str) -> ClusterResult<()> {
        let object_id = object_id.to_string();
        self.send(
            |resp| Command::CriticalKey {
                object_id,
                add: false,
                resp,
            },
            "remove_critical_key",
        )
        .await
    }

    /// Run one evaluation cycle now. Intended for tests and operator
    /// tooling; the periodic loop does this on its own.
    ///
    /// # Errors
    ///
    /// Returns `ControllerUnavailable` when the loop stopped.
    pub async fn run_cycle_once(&self) -> ClusterResult<()> {
        self.send(|resp| Command::RunCycle { resp }, "run_cycle").await
    }

    /// Stop the evaluation loop.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop).await;
    }

    /// The mode in force for an object.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unregistered objects.
    pub async fn get_mode(&self, object_id: &str) -> ClusterResult<ModeInfo> {
        let view = self.shared.read().await;
        view.mode_states
            .get(object_id)
            .map(|state| ModeInfo {
                mode: state.current_mode,
                ttl_seconds: state.ttl_seconds,
                reason: state.reason,
                timestamp: state.last_change,
            })
            .ok_or_else(|| ClusterError::NotFound(object_id.to_string()))
    }

    /// The current critical-keys set.
    pub async fn critical_keys(&self) -> Vec<String> {
        self.shared.read().await.critical_keys.iter().cloned().collect()
    }

    /// Controller status snapshot.
    pub async fn status(&self) -> ControllerStatus {
        let view = self.shared.read().await;
        let count = |mode: ConsistencyMode| {
            view.mode_states
                .values()
                .filter(|s| s.current_mode == mode)
                .count()
        };
        ControllerStatus {
            global_override: view.global_override,
            critical_keys_count: view.critical_keys.len(),
            emergency_mode: view.emergency_mode,
            total_objects: view.mode_states.len(),
            objects_strong: count(ConsistencyMode::Strong),
            objects_available: count(ConsistencyMode::Available),
            objects_hybrid: count(ConsistencyMode::Hybrid),
            metrics: self.metrics.snapshot(),
            last_cycle_at: view.last_cycle_at,
        }
    }

    /// True while the evaluation loop is making progress.
    pub async fn is_alive(&self) -> bool {
        let view = self.shared.read().await;
        match view.last_cycle_at {
            Some(at) => {
                let window = self.config.poll_interval * 3;
                Utc::now().signed_duration_since(at).to_std().map_or(true, |gap| gap < window)
            }
            None => false,
        }
    }

    /// Subscribe to mode-change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ModeChangeEvent> {
        self.events_tx.subscribe()
    }
}

/// Loop-owned state machine.
struct ControllerCore {
    config: ControllerConfig,
    policy: PolicyEngine,
    store: Arc<MetaStore>,
    metrics_source: Arc<dyn MetricsSource>,
    metrics: Arc<ClusterMetrics>,
    shared: Arc<RwLock<SharedView>>,
    events_tx: broadcast::Sender<ModeChangeEvent>,
    votes: HashMap<String, VoteState>,
}

impl ControllerCore {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Controller evaluation loop started"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Stop) | None => {
                            info!("Controller evaluation loop stopped");
                            break;
                        }
                        Some(cmd) => {
                            self.metrics.record_command();
                            self.handle_command(cmd).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Register {
                object_id,
                hint,
                resp,
            } => {
                let _ = resp.send(self.register(&object_id, hint).await);
            }
            Command::SetHint {
                object_id,
                hint,
                resp,
            } => {
                let _ = resp.send(self.set_hint(&object_id, hint).await);
            }
            Command::SetOverride { mode, resp } => {
                let _ = resp.send(self.set_override(mode).await);
            }
            Command::CriticalKey {
                object_id,
                add,
                resp,
            } => {
                let result = if add {
                    self.add_critical_key(&object_id).await
                } else {
                    self.remove_critical_key(&object_id).await
                };
                let _ = resp.send(result);
            }
            Command::RunCycle { resp } => {
                self.run_cycle().await;
                let _ = resp.send(Ok(()));
            }
            Command::Stop => {}
        }
    }

    async fn register(
        &mut self,
        object_id: &str,
        hint: ModeHint,
    ) -> ClusterResult<(RegisterOutcome, ConsistencyMode)> {
        if let Some(state) = self.shared.read().await.mode_states.get(object_id) {
            return Ok((RegisterOutcome::AlreadyExists, state.current_mode));
        }
        if let Some(meta) = self.store.try_get(object_id).await {
            let state = self.ensure_state(&meta).await?;
            return Ok((RegisterOutcome::AlreadyExists, state.current_mode));
        }

        let meta = ObjectMeta::new(object_id, hint);
        let mode = meta.current_mode;
        self.store_op(self.store.put_durable(meta.clone())).await?;
        self.ensure_state(&meta).await?;
        info!(object_id, mode = %mode, hint = %hint, "Object registered");
        Ok((RegisterOutcome::Registered, mode))
    }

    async fn set_hint(&mut self, object_id: &str, hint: ModeHint) -> ClusterResult<()> {
        let Some(mut meta) = self.store.try_get(object_id).await else {
            return Err(ClusterError::NotFound(object_id.to_string()));
        };
        meta.mode_hint = hint;
        self.store_op(self.store.put_durable(meta)).await?;
        debug!(object_id, hint = %hint, "Mode hint updated");
        Ok(())
    }

    async fn set_override(&mut self, mode: Option<ConsistencyMode>) -> ClusterResult<()> {
        self.store_op(self.store.set_global_override(mode)).await?;
        self.shared.write().await.global_override = mode;
        match mode {
            Some(mode) => info!(mode = %mode, "Global override set"),
            None => info!("Global override cleared"),
        }

        // Overrides apply immediately, not on the next cycle.
        if let Some(target) = mode {
            self.force_all(target, TransitionReason::OperatorOverride).await;
        }
        Ok(())
    }

    async fn add_critical_key(&mut self, object_id: &str) -> ClusterResult<()> {
        let mut keys = self.shared.read().await.critical_keys.clone();
        keys.insert(object_id.to_string());
        self.store_op(self.store.set_critical_keys(keys.clone())).await?;
        self.shared.write().await.critical_keys = keys;
        info!(object_id, "Critical key added");

        // Critical keys force C immediately.
        if let Some(meta) = self.store.try_get(object_id).await {
            let state = self.ensure_state(&meta).await?;
            if state.current_mode != ConsistencyMode::Strong {
                if let Err(err) = self
                    .transition(
                        &meta.object_id,
                        state.current_mode,
                        ConsistencyMode::Strong,
                        TransitionReason::CriticalKeyDesignation,
                        None,
                    )
                    .await
                {
                    error!(object_id, error = %err, "Critical-key transition failed");
                }
            }
        }
        Ok(())
    }

    async fn remove_critical_key(&mut self, object_id: &str) -> ClusterResult<()> {
        let mut keys = self.shared.read().await.critical_keys.clone();
        keys.remove(object_id);
        self.store_op(self.store.set_critical_keys(keys.clone())).await?;
        self.shared.write().await.critical_keys = keys;
        info!(object_id, "Critical key removed");
        Ok(())
    }

    /// Force every object toward `target` immediately.
    async fn force_all(&mut self, target: ConsistencyMode, reason: TransitionReason) {
        let critical: BTreeSet<String> = self.shared.read().await.critical_keys.clone();
        for meta in self.store.list().await {
            if !meta.is_active() {
                continue;
            }
            // Critical keys outrank the global override.
            if critical.contains(&meta.object_id) && target != ConsistencyMode::Strong {
                continue;
            }
            let state = match self.ensure_state(&meta).await {
                Ok(state) => state,
                Err(err) => {
                    error!(object_id = %meta.object_id, error = %err, "State load failed");
                    continue;
                }
            };
            if state.current_mode == target {
                continue;
            }
            if let Err(err) = self
                .transition(&meta.object_id, state.current_mode, target, reason, None)
                .await
            {
                error!(object_id = %meta.object_id, error = %err, "Forced transition failed");
            }
        }
    }

    /// One evaluation cycle over every registered object.
    async fn run_cycle(&mut self) {
        let risk = match self.metrics_source.cluster_partition_risk().await {
            Ok(risk) => risk,
            Err(err) => {
                // No metrics means no decisions: keep existing modes.
                warn!(error = %err, "Metrics unavailable, skipping cycle");
                self.metrics.record_cycle_skipped();
                self.finish_cycle().await;
                return;
            }
        };

        if risk > self.config.emergency_threshold {
            self.emergency_cycle(risk).await;
            self.finish_cycle().await;
            return;
        }

        // Risk back under the threshold releases the latch; objects
        // forced to A stay there until normal evaluation moves them.
        if self.shared.read().await.emergency_mode {
            match self.store_op(self.store.set_emergency_mode(false)).await {
                Ok(()) => {
                    self.shared.write().await.emergency_mode = false;
                    info!(risk, "Emergency mode cleared");
                }
                Err(err) => {
                    error!(error = %err, "Failed to clear emergency latch");
                    self.metrics.record_cycle_skipped();
                    self.finish_cycle().await;
                    return;
                }
            }
        }

        let global_override = self.shared.read().await.global_override;
        let critical = self.shared.read().await.critical_keys.clone();

        for meta in self.store.list().await {
            if !meta.is_active() {
                continue;
            }
            let object_id = meta.object_id.clone();
            let state = match self.ensure_state(&meta).await {
                Ok(state) => state,
                Err(err) => {
                    error!(object_id = %object_id, error = %err, "State load failed, skipping object");
                    continue;
                }
            };

            // Critical keys force C; the global override forces its
            // mode; both bypass votes and cooldown.
            let forced = if critical.contains(&object_id) {
                Some((ConsistencyMode::Strong, TransitionReason::CriticalKeyDesignation))
            } else {
                global_override.map(|mode| (mode, TransitionReason::OperatorOverride))
            };
            if let Some((target, reason)) = forced {
                if state.current_mode != target {
                    if let Err(err) = self
                        .transition(&object_id, state.current_mode, target, reason, None)
                        .await
                    {
                        error!(object_id = %object_id, error = %err, "Forced transition failed");
                    }
                }
                continue;
            }

            // Cooldown guards against flapping.
            if let Some(until) = state.cooldown_until {
                if Utc::now() < until {
                    debug!(object_id = %object_id, "In cooldown, skipping");
                    continue;
                }
            }

            let metrics = match self.metrics_source.sample(&object_id).await {
                Ok(metrics) => metrics,
                Err(err) => {
                    warn!(error = %err, "Metrics unavailable mid-cycle, aborting cycle");
                    self.metrics.record_cycle_skipped();
                    self.finish_cycle().await;
                    return;
                }
            };

            let elapsed = Utc::now()
                .signed_duration_since(state.last_change)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let recommendation = self.policy.recommend(&PolicyInput {
                metrics,
                hint: meta.mode_hint,
                time_since_last_change: elapsed,
            });

            self.apply_hysteresis(&object_id, state.current_mode, recommendation)
                .await;
        }

        self.metrics.record_cycle();
        self.finish_cycle().await;
    }

    /// Count an agreeing sample; transition once confirmed.
    async fn apply_hysteresis(
        &mut self,
        object_id: &str,
        current: ConsistencyMode,
        recommendation: crate::policy::Recommendation,
    ) {
        if recommendation.mode == current {
            // An agreeing-with-current sample resets the streak.
            self.votes.remove(object_id);
            return;
        }

        let votes = match self.votes.get_mut(object_id) {
            Some(votes) if votes.pending == recommendation.mode => {
                votes.count += 1;
                *votes
            }
            _ => {
                let fresh = VoteState {
                    pending: recommendation.mode,
                    count: 1,
                };
                self.votes.insert(object_id.to_string(), fresh);
                fresh
            }
        };

        // Losing consistency guarantees is the high-risk direction and
        // needs twice the confirmation and twice the cooldown.
        let high_risk = current == ConsistencyMode::Strong
            && recommendation.mode == ConsistencyMode::Available;
        let required = if high_risk {
            self.config.confirmation_count * 2
        } else {
            self.config.confirmation_count
        };

        debug!(
            object_id,
            current = %current,
            pending = %recommendation.mode,
            votes = votes.count,
            required,
            score = recommendation.score,
            "Hysteresis vote"
        );

        if votes.count < required {
            return;
        }

        let cooldown = if high_risk {
            self.config.cooldown_period * 2
        } else {
            self.config.cooldown_period
        };
        if let Err(err) = self
            .transition(
                object_id,
                current,
                recommendation.mode,
                recommendation.reason,
                Some(cooldown),
            )
            .await
        {
            // In-memory state untouched: the vote streak stands and the
            // transition retries next cycle.
            error!(object_id, error = %err, "Transition persist failed, will retry");
        } else {
            self.votes.remove(object_id);
        }
    }

    /// Partition risk crossed the threshold: force everything to A.
    async fn emergency_cycle(&mut self, risk: f64) {
        if !self.shared.read().await.emergency_mode {
            warn!(
                risk,
                threshold = self.config.emergency_threshold,
                "Partition risk critical, entering emergency mode"
            );
            match self.store_op(self.store.set_emergency_mode(true)).await {
                Ok(()) => {
                    self.shared.write().await.emergency_mode = true;
                    self.metrics.record_emergency();
                }
                Err(err) => {
                    error!(error = %err, "Failed to persist emergency latch");
                    return;
                }
            }
        }

        for meta in self.store.list().await {
            if !meta.is_active() {
                continue;
            }
            let state = match self.ensure_state(&meta).await {
                Ok(state) => state,
                Err(err) => {
                    error!(object_id = %meta.object_id, error = %err, "State load failed");
                    continue;
                }
            };
            if state.current_mode == ConsistencyMode::Available {
                continue;
            }
            if let Err(err) = self
                .transition(
                    &meta.object_id,
                    state.current_mode,
                    ConsistencyMode::Available,
                    TransitionReason::EmergencyPartition,
                    None,
                )
                .await
            {
                error!(object_id = %meta.object_id, error = %err, "Emergency transition failed");
            }
        }
    }

    /// Enact one transition: persist first, then publish.
    async fn transition(
        &mut self,
        object_id: &str,
        from: ConsistencyMode,
        to: ConsistencyMode,
        reason: TransitionReason,
        cooldown: Option<Duration>,
    ) -> ClusterResult<()> {
        let now = Utc::now();
        let new_state = ObjectModeState {
            object_id: object_id.to_string(),
            current_mode: to,
            last_change: now,
            ttl_seconds: self.config.mode_ttl.as_secs(),
            reason,
            consecutive_votes: 0,
            cooldown_until: cooldown
                .and_then(|c| chrono::Duration::from_std(c).ok())
                .map(|c| now + c),
        };

        // Durable before visible: the new mode must survive a crash
        // before any operation can select the new strategy.
        self.store_op(self.store.put_mode_state_durable(new_state.clone()))
            .await?;
        if let Some(mut meta) = self.store.try_get(object_id).await {
            meta.current_mode = to;
            meta.last_mode_change = Some(now);
            self.store_op(self.store.put_durable(meta)).await?;
        }

        self.shared
            .write()
            .await
            .mode_states
            .insert(object_id.to_string(), new_state);
        self.votes.remove(object_id);
        self.metrics.record_transition();

        info!(
            object_id,
            from = %from,
            to = %to,
            reason = %reason,
            "Mode transition"
        );
        let _ = self.events_tx.send(ModeChangeEvent {
            object_id: object_id.to_string(),
            from,
            to,
            reason,
            at: now,
        });
        Ok(())
    }

    /// Load or lazily create an object's mode state.
    async fn ensure_state(&mut self, meta: &ObjectMeta) -> ClusterResult<ObjectModeState> {
        if let Some(state) = self.shared.read().await.mode_states.get(&meta.object_id) {
            return Ok(state.clone());
        }

        let state = ObjectModeState::new(
            &meta.object_id,
            meta.current_mode,
            self.config.mode_ttl.as_secs(),
        );
        self.store_op(self.store.put_mode_state_durable(state.clone()))
            .await?;
        self.shared
            .write()
            .await
            .mode_states
            .insert(meta.object_id.clone(), state.clone());
        debug!(object_id = %meta.object_id, mode = %state.current_mode, "Mode state created");
        Ok(state)
    }

    /// Stamp the cycle heartbeat.
    async fn finish_cycle(&self) {
        self.shared.write().await.last_cycle_at = Some(Utc::now());
    }

    /// Run a store operation under the controller's store deadline.
    async fn store_op<T>(
        &self,
        op: impl std::future::Future<Output = echofs_core::CoreResult<T>>,
    ) -> ClusterResult<T> {
        match tokio::time::timeout(self.config.store_op_timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ClusterError::Timeout(self.config.store_op_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::policy::ObjectMetrics;
    use echofs_core::StoreConfig;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Deterministic metrics source returning whatever the test set.
    #[derive(Default)]
    struct ScriptedMetrics {
        risk: std::sync::Mutex<f64>,
        samples: std::sync::Mutex<HashMap<String, ObjectMetrics>>,
        fail: AtomicBool,
    }

    impl ScriptedMetrics {
        fn set_risk(&self, risk: f64) {
            *self.risk.lock().unwrap() = risk;
        }

        fn set_sample(&self, object_id: &str, metrics: ObjectMetrics) {
            self.samples
                .lock()
                .unwrap()
                .insert(object_id.to_string(), metrics);
        }

        fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl MetricsSource for ScriptedMetrics {
        async fn cluster_partition_risk(&self) -> ClusterResult<f64> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ClusterError::MetricsUnavailable("scripted".into()));
            }
            Ok(*self.risk.lock().unwrap())
        }

        async fn sample(&self, object_id: &str) -> ClusterResult<ObjectMetrics> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ClusterError::MetricsUnavailable("scripted".into()));
            }
            let risk = *self.risk.lock().unwrap();
            Ok(self
                .samples
                .lock()
                .unwrap()
                .get(object_id)
                .copied()
                .unwrap_or(ObjectMetrics {
                    partition_risk: risk,
                    ..Default::default()
                }))
        }
    }

    struct Fixture {
        controller: Arc<ConsistencyController>,
        store: Arc<MetaStore>,
        metrics_source: Arc<ScriptedMetrics>,
        _dir: tempfile::TempDir,
    }

    async fn setup(config: ControllerConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            MetaStore::open(dir.path(), StoreConfig::default())
                .await
                .unwrap(),
        );
        let metrics_source = Arc::new(ScriptedMetrics::default());
        let controller = ConsistencyController::start(
            config,
            PolicyEngine::new(PolicyConfig::default()),
            Arc::clone(&store),
            Arc::clone(&metrics_source) as Arc<dyn MetricsSource>,
            Arc::new(ClusterMetrics::new()),
        )
        .await
        .unwrap();

        Fixture {
            controller,
            store,
            metrics_source,
            _dir: dir,
        }
    }

    /// Long poll interval: cycles only run when the test asks.
    fn manual_config() -> ControllerConfig {
        ControllerConfig {
            poll_interval: Duration::from_secs(3600),
            cooldown_period: Duration::from_millis(50),
            ..Default::default()
        }
    }

    /// Object-level metrics that score past the availability threshold.
    /// The cluster-level risk stays at 0, so no emergency fires.
    fn availability_metrics() -> ObjectMetrics {
        ObjectMetrics {
            partition_risk: 1.0,
            replication_lag: Duration::from_millis(600),
            write_rate: 60.0,
        }
    }

    #[tokio::test]
    async fn test_register_and_get_mode() {
        let fx = setup(manual_config()).await;

        let (outcome, mode) = fx.controller.register("obj1", ModeHint::Auto).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::Registered);
        assert_eq!(mode, ConsistencyMode::Strong);

        let (outcome, _) = fx.controller.register("obj1", ModeHint::Auto).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::AlreadyExists);

        let info = fx.controller.get_mode("obj1").await.unwrap();
        assert_eq!(info.mode, ConsistencyMode::Strong);
        assert_eq!(info.reason, TransitionReason::Registered);

        assert!(matches!(
            fx.controller.get_mode("ghost").await,
            Err(ClusterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_emergency_forces_available_immediately() {
        let fx = setup(manual_config()).await;
        fx.controller.register("obj1", ModeHint::Auto).await.unwrap();

        fx.metrics_source.set_risk(0.9);
        fx.controller.run_cycle_once().await.unwrap();

        let info = fx.controller.get_mode("obj1").await.unwrap();
        assert_eq!(info.mode, ConsistencyMode::Available);
        assert_eq!(info.reason, TransitionReason::EmergencyPartition);

        // Persisted before published.
        let state = fx.store.mode_state("obj1").await.unwrap();
        assert_eq!(state.current_mode, ConsistencyMode::Available);
        assert!(fx.store.emergency_mode().await);
        assert!(fx.controller.status().await.emergency_mode);
    }

    #[tokio::test]
    async fn test_emergency_threshold_is_exclusive() {
        let fx = setup(manual_config()).await;
        fx.controller.register("obj1", ModeHint::Auto).await.unwrap();

        // Equal to the threshold must not trigger.
        fx.metrics_source.set_risk(0.8);
        fx.metrics_source.set_sample("obj1", ObjectMetrics::default());
        fx.controller.run_cycle_once().await.unwrap();

        assert!(!fx.controller.status().await.emergency_mode);
        assert_eq!(
            fx.controller.get_mode("obj1").await.unwrap().mode,
            ConsistencyMode::Strong
        );
    }

    #[tokio::test]
    async fn test_emergency_latch_clears_but_mode_stays() {
        let fx = setup(manual_config()).await;
        fx.controller.register("obj1", ModeHint::Auto).await.unwrap();

        fx.metrics_source.set_risk(0.95);
        fx.controller.run_cycle_once().await.unwrap();
        assert!(fx.controller.status().await.emergency_mode);

        // Risk recovers: latch clears, object stays in A until normal
        // evaluation moves it.
        fx.metrics_source.set_risk(0.1);
        fx.metrics_source.set_sample("obj1", ObjectMetrics::default());
        fx.controller.run_cycle_once().await.unwrap();

        assert!(!fx.controller.status().await.emergency_mode);
        assert_eq!(
            fx.controller.get_mode("obj1").await.unwrap().mode,
            ConsistencyMode::Available
        );
    }

    #[tokio::test]
    async fn test_hysteresis_prevents_flap() {
        let fx = setup(manual_config()).await;
        fx.controller.register("obj1", ModeHint::Auto).await.unwrap();

        // Two availability-leaning samples: votes accumulate, no
        // transition yet.
        fx.metrics_source.set_sample("obj1", availability_metrics());
        fx.controller.run_cycle_once().await.unwrap();
        fx.controller.run_cycle_once().await.unwrap();
        assert_eq!(
            fx.controller.get_mode("obj1").await.unwrap().mode,
            ConsistencyMode::Strong
        );

        // A sample agreeing with the current mode resets the streak.
        fx.metrics_source.set_sample("obj1", ObjectMetrics::default());
        fx.controller.run_cycle_once().await.unwrap();

        // Two more availability samples: still below the (doubled)
        // confirmation bar, so no transition.
        fx.metrics_source.set_sample("obj1", availability_metrics());
        fx.controller.run_cycle_once().await.unwrap();
        fx.controller.run_cycle_once().await.unwrap();
        assert_eq!(
            fx.controller.get_mode("obj1").await.unwrap().mode,
            ConsistencyMode::Strong
        );
    }

    #[tokio::test]
    async fn test_high_risk_transition_requires_double_votes() {
        let config = ControllerConfig {
            confirmation_count: 1,
            ..manual_config()
        };
        let fx = setup(config).await;
        fx.controller.register("obj1", ModeHint::Auto).await.unwrap();
        fx.metrics_source.set_sample("obj1", availability_metrics());

        // C -> A is high-risk: with confirmation_count = 1 it still
        // needs two agreeing samples.
        fx.controller.run_cycle_once().await.unwrap();
        assert_eq!(
            fx.controller.get_mode("obj1").await.unwrap().mode,
            ConsistencyMode::Strong
        );

        fx.controller.run_cycle_once().await.unwrap();
        let info = fx.controller.get_mode("obj1").await.unwrap();
        assert_eq!(info.mode, ConsistencyMode::Available);
    }

    #[tokio::test]
    async fn test_confirmed_transition_to_strong() {
        let fx = setup(manual_config()).await;
        // Object starts in A via its hint.
        fx.controller
            .register("obj1", ModeHint::Available)
            .await
            .unwrap();
        // Calm metrics recommend C; A -> C is not high-risk.
        fx.metrics_source.set_sample(
            "obj1",
            ObjectMetrics {
                partition_risk: 0.0,
                replication_lag: Duration::ZERO,
                write_rate: 0.0,
            },
        );

        for _ in 0..2 {
            fx.controller.run_cycle_once().await.unwrap();
            assert_eq!(
                fx.controller.get_mode("obj1").await.unwrap().mode,
                ConsistencyMode::Available
            );
        }
        fx.controller.run_cycle_once().await.unwrap();

        let info = fx.controller.get_mode("obj1").await.unwrap();
        assert_eq!(info.mode, ConsistencyMode::Strong);
        assert_eq!(info.reason, TransitionReason::ConsistencyOptimization);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_next_transition() {
        let config = ControllerConfig {
            confirmation_count: 1,
            cooldown_period: Duration::from_secs(3600),
            ..manual_config()
        };
        let fx = setup(config).await;
        fx.controller
            .register("obj1", ModeHint::Available)
            .await
            .unwrap();

        // One calm sample confirms A -> C.
        fx.metrics_source.set_sample("obj1", ObjectMetrics::default());
        fx.controller.run_cycle_once().await.unwrap();
        assert_eq!(
            fx.controller.get_mode("obj1").await.unwrap().mode,
            ConsistencyMode::Strong
        );

        // Hybrid-band metrics would recommend a change, but the
        // cooldown holds.
        fx.metrics_source.set_sample(
            "obj1",
            ObjectMetrics {
                partition_risk: 0.5,
                replication_lag: Duration::from_millis(250),
                write_rate: 25.0,
            },
        );
        for _ in 0..4 {
            fx.controller.run_cycle_once().await.unwrap();
        }
        assert_eq!(
            fx.controller.get_mode("obj1").await.unwrap().mode,
            ConsistencyMode::Strong
        );
    }

    #[tokio::test]
    async fn test_critical_key_forces_strong_immediately() {
        let fx = setup(manual_config()).await;
        fx.controller
            .register("obj-x", ModeHint::Available)
            .await
            .unwrap();
        assert_eq!(
            fx.controller.get_mode("obj-x").await.unwrap().mode,
            ConsistencyMode::Available
        );

        fx.controller.add_critical_key("obj-x").await.unwrap();

        let info = fx.controller.get_mode("obj-x").await.unwrap();
        assert_eq!(info.mode, ConsistencyMode::Strong);
        assert_eq!(info.reason, TransitionReason::CriticalKeyDesignation);
        assert_eq!(fx.controller.critical_keys().await, vec!["obj-x".to_string()]);

        // Durable: the singleton and the state both landed in the store.
        assert!(fx.store.critical_keys().await.contains("obj-x"));
        assert_eq!(
            fx.store.mode_state("obj-x").await.unwrap().current_mode,
            ConsistencyMode::Strong
        );
    }

    #[tokio::test]
    async fn test_global_override_and_clear() {
        let fx = setup(manual_config()).await;
        fx.controller.register("obj1", ModeHint::Auto).await.unwrap();

        fx.controller
            .set_global_override(Some(ConsistencyMode::Available))
            .await
            .unwrap();

        let info = fx.controller.get_mode("obj1").await.unwrap();
        assert_eq!(info.mode, ConsistencyMode::Available);
        assert_eq!(info.reason, TransitionReason::OperatorOverride);
        assert_eq!(
            fx.controller.status().await.global_override,
            Some(ConsistencyMode::Available)
        );

        fx.controller.set_global_override(None).await.unwrap();
        assert_eq!(fx.controller.status().await.global_override, None);
    }

    #[tokio::test]
    async fn test_critical_key_outranks_override() {
        let fx = setup(manual_config()).await;
        fx.controller.register("obj1", ModeHint::Auto).await.unwrap();
        fx.controller.add_critical_key("obj1").await.unwrap();

        fx.controller
            .set_global_override(Some(ConsistencyMode::Available))
            .await
            .unwrap();

        assert_eq!(
            fx.controller.get_mode("obj1").await.unwrap().mode,
            ConsistencyMode::Strong
        );
    }

    #[tokio::test]
    async fn test_metrics_failure_skips_cycle() {
        let fx = setup(manual_config()).await;
        fx.controller.register("obj1", ModeHint::Auto).await.unwrap();

        fx.metrics_source.set_fail(true);
        fx.controller.run_cycle_once().await.unwrap();

        // Modes preserved; the skip is counted.
        assert_eq!(
            fx.controller.get_mode("obj1").await.unwrap().mode,
            ConsistencyMode::Strong
        );
        assert!(fx.controller.status().await.metrics.cycles_skipped >= 1);
        // The loop still heartbeats while skipping.
        assert!(fx.controller.is_alive().await);
    }

    #[tokio::test]
    async fn test_restart_restores_mode_map() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            MetaStore::open(dir.path(), StoreConfig::default())
                .await
                .unwrap(),
        );
        let metrics_source = Arc::new(ScriptedMetrics::default());

        {
            let controller = ConsistencyController::start(
                manual_config(),
                PolicyEngine::new(PolicyConfig::default()),
                Arc::clone(&store),
                Arc::clone(&metrics_source) as Arc<dyn MetricsSource>,
                Arc::new(ClusterMetrics::new()),
            )
            .await
            .unwrap();
            controller.register("obj1", ModeHint::Auto).await.unwrap();
            metrics_source.set_risk(0.9);
            controller.run_cycle_once().await.unwrap();
            assert_eq!(
                controller.get_mode("obj1").await.unwrap().mode,
                ConsistencyMode::Available
            );
            controller.stop().await;
        }

        // A fresh controller over the same store sees the same map.
        let controller = ConsistencyController::start(
            manual_config(),
            PolicyEngine::new(PolicyConfig::default()),
            Arc::clone(&store),
            Arc::clone(&metrics_source) as Arc<dyn MetricsSource>,
            Arc::new(ClusterMetrics::new()),
        )
        .await
        .unwrap();

        let info = controller.get_mode("obj1").await.unwrap();
        assert_eq!(info.mode, ConsistencyMode::Available);
        assert_eq!(info.reason, TransitionReason::EmergencyPartition);
        assert!(controller.status().await.emergency_mode);
    }

    #[tokio::test]
    async fn test_mode_change_events_emitted() {
        let fx = setup(manual_config()).await;
        fx.controller.register("obj1", ModeHint::Auto).await.unwrap();
        let mut events = fx.controller.subscribe();

        fx.metrics_source.set_risk(0.9);
        fx.controller.run_cycle_once().await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.object_id, "obj1");
        assert_eq!(event.from, ConsistencyMode::Strong);
        assert_eq!(event.to, ConsistencyMode::Available);
        assert_eq!(event.reason, TransitionReason::EmergencyPartition);
    }

    #[tokio::test]
    async fn test_set_hint_requires_known_object() {
        let fx = setup(manual_config()).await;
        assert!(matches!(
            fx.controller.set_hint("ghost", ModeHint::Strong).await,
            Err(ClusterError::NotFound(_))
        ));

        fx.controller.register("obj1", ModeHint::Auto).await.unwrap();
        fx.controller
            .set_hint("obj1", ModeHint::Available)
            .await
            .unwrap();
        assert_eq!(
            fx.store.get("obj1").await.unwrap().mode_hint,
            ModeHint::Available
        );
    }
}
