//! Command dispatch: turns inbound commands into registry and sampler
//! operations and reports every failure as an outbound event.
//!
//! Input and resize commands run on the addressed session's lane, a small
//! task that applies them one at a time. A session stuck on a full pty
//! therefore delays only its own commands. Close bypasses the lane so it
//! takes effect even while a write is blocked.

use crate::bridge::{EngineSide, OutboundSender};
use crate::config::EngineConfig;
use crate::session::{OpenRequest, ProcessLauncher, PtyLauncher, SessionRegistry};
use crate::telemetry::{build_adapters, MetricSource, SamplerHandle, TelemetrySampler};
use hostdeck_core::{DeckError, Inbound, Outbound, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

const LANE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One queued per-session operation.
#[derive(Debug)]
enum LaneOp {
    Input(Vec<u8>),
    Resize { rows: u16, cols: u16 },
}

/// Whether the dispatch loop keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

pub struct Engine {
    registry: Arc<SessionRegistry>,
    sampler: SamplerHandle,
    outbound: OutboundSender,
    lanes: HashMap<SessionId, mpsc::UnboundedSender<LaneOp>>,
    lane_tasks: JoinSet<()>,
}

impl Engine {
    /// Build an engine and start its sampler.
    pub fn new(
        config: &EngineConfig,
        launcher: Arc<dyn ProcessLauncher>,
        adapters: Vec<Box<dyn MetricSource>>,
        outbound: OutboundSender,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            launcher,
            config.session.clone(),
            outbound.clone(),
        ));
        let sampler = TelemetrySampler::new(adapters, config.sampler).spawn(outbound.clone());
        Self {
            registry,
            sampler,
            outbound,
            lanes: HashMap::new(),
            lane_tasks: JoinSet::new(),
        }
    }

    /// Start an engine on the native pty and `sysinfo` adapters, serving
    /// `side` until shutdown.
    pub fn spawn(config: EngineConfig, side: EngineSide) -> JoinHandle<()> {
        let launcher = Arc::new(PtyLauncher::new(config.term.clone()));
        let adapters = build_adapters(&config.adapters, config.process_limit);
        let engine = Self::new(&config, launcher, adapters, side.outbound);
        tokio::spawn(engine.run(side.inbound))
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Dispatch commands in arrival order until `Shutdown` or until the
    /// presentation side goes away, then shut down.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) {
        info!("engine running");
        while let Some(command) = inbound.recv().await {
            if self.handle(command).await == Flow::Shutdown {
                break;
            }
        }
        self.shutdown().await;
    }

    pub async fn handle(&mut self, command: Inbound) -> Flow {
        match command {
            Inbound::OpenSession {
                shell,
                cwd,
                rows,
                cols,
                env,
            } => {
                let request = OpenRequest {
                    shell,
                    cwd,
                    rows,
                    cols,
                    env,
                };
                if let Err(e) = self.registry.create_session(request).await {
                    warn!(error = %e, "session open failed");
                    self.emit(Outbound::SessionOpenFailed {
                        reason: e.to_string(),
                    })
                    .await;
                }
            }
            Inbound::SessionInput { id, bytes } => self.route(id, LaneOp::Input(bytes)).await,
            Inbound::Resize { id, rows, cols } => {
                self.route(id, LaneOp::Resize { rows, cols }).await
            }
            Inbound::CloseSession { id } => {
                // Terminating the process also fails any write stuck on its lane.
                if let Err(e) = self.registry.close_session(id).await {
                    self.reject(id, e).await;
                }
            }
            Inbound::SetSamplingInterval { ms } => {
                self.sampler.set_interval(Duration::from_millis(ms)).await;
            }
            Inbound::ListSessions => {
                let sessions = self.registry.list().await;
                self.emit(Outbound::SessionList { sessions }).await;
            }
            Inbound::Shutdown => {
                info!("shutdown requested");
                return Flow::Shutdown;
            }
        }
        Flow::Continue
    }

    /// Close every session, stop sampling, then release the bridge.
    pub async fn shutdown(mut self) {
        info!("engine shutting down");
        self.registry.shutdown().await;

        // Lanes finish what is queued (rejecting it) once their senders go.
        self.lanes.clear();
        let lanes = &mut self.lane_tasks;
        let drained = tokio::time::timeout(LANE_DRAIN_TIMEOUT, async {
            while lanes.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("session lanes did not drain, aborting");
            self.lane_tasks.shutdown().await;
        }

        self.sampler.stop().await;
        self.outbound.close();
        info!("engine stopped");
    }

    async fn route(&mut self, id: SessionId, op: LaneOp) {
        if !self.lanes.contains_key(&id) {
            if !self.registry.contains(id).await {
                self.reject(id, DeckError::UnknownSession(id)).await;
                return;
            }
            self.prune_lanes().await;
            let (tx, rx) = mpsc::unbounded_channel();
            self.lane_tasks
                .spawn(run_lane(id, self.registry.clone(), self.outbound.clone(), rx));
            self.lanes.insert(id, tx);
        }

        let Some(lane) = self.lanes.get(&id) else {
            return;
        };
        if lane.send(op).is_err() {
            // The lane task died; its session can no longer be driven.
            self.lanes.remove(&id);
            self.reject(id, DeckError::SessionClosed(id)).await;
        }
    }

    /// Drop lanes of sessions the registry no longer holds.
    async fn prune_lanes(&mut self) {
        let mut gone = Vec::new();
        for id in self.lanes.keys() {
            if !self.registry.contains(*id).await {
                gone.push(*id);
            }
        }
        for id in gone {
            self.lanes.remove(&id);
        }
        while let Some(joined) = self.lane_tasks.try_join_next() {
            if let Err(e) = joined {
                warn!(error = %e, "session lane failed");
            }
        }
    }

    async fn reject(&self, id: SessionId, error: DeckError) {
        debug!(session_id = %id, error = %error, "command rejected");
        self.emit(Outbound::rejected(Some(id), &error)).await;
    }

    async fn emit(&self, event: Outbound) {
        if self.outbound.send(event).await.is_err() {
            debug!("bridge closed, event discarded");
        }
    }
}

async fn run_lane(
    id: SessionId,
    registry: Arc<SessionRegistry>,
    outbound: OutboundSender,
    mut ops: mpsc::UnboundedReceiver<LaneOp>,
) {
    while let Some(op) = ops.recv().await {
        let result = match op {
            LaneOp::Input(bytes) => registry.dispatch_input(id, bytes).await,
            LaneOp::Resize { rows, cols } => registry.dispatch_resize(id, rows, cols).await,
        };
        if let Err(e) = result {
            debug!(session_id = %id, error = %e, "session command failed");
            if outbound.send(Outbound::rejected(Some(id), &e)).await.is_err() {
                break;
            }
        }
    }
    debug!(session_id = %id, "lane finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{event_bridge, BridgeConfig, PresentationSide};
    use crate::session::scripted::{flood_byte, Script, ScriptedLauncher};
    use crate::telemetry::{Reading, SamplerConfig};
    use hostdeck_core::{DeckResult, ExitStatus, MetricValue};

    struct Constant;

    impl MetricSource for Constant {
        fn name(&self) -> &'static str {
            "constant"
        }

        fn sample(&mut self) -> DeckResult<Vec<(String, Reading)>> {
            Ok(vec![("constant".into(), MetricValue::Gauge(1.0).into())])
        }
    }

    fn start(
        script: Script,
        capacity: usize,
        interval: Duration,
    ) -> (JoinHandle<()>, PresentationSide) {
        start_with(ScriptedLauncher::new(script), capacity, interval)
    }

    fn start_with(
        launcher: ScriptedLauncher,
        capacity: usize,
        interval: Duration,
    ) -> (JoinHandle<()>, PresentationSide) {
        let mut config = EngineConfig::default();
        config.sampler = SamplerConfig {
            interval,
            stall_factor: 1000,
        };
        config.bridge = BridgeConfig {
            capacity,
            inbound_capacity: 16,
        };
        let (side, ui) = event_bridge(config.bridge);
        let engine = Engine::new(
            &config,
            Arc::new(launcher),
            vec![Box::new(Constant)],
            side.outbound,
        );
        (tokio::spawn(engine.run(side.inbound)), ui)
    }

    async fn next_session_event(ui: &mut PresentationSide) -> Outbound {
        loop {
            match ui.events.recv().await {
                Some(event) if event.is_telemetry() => continue,
                Some(event) => return event,
                None => panic!("bridge closed"),
            }
        }
    }

    #[tokio::test]
    async fn echo_shell_scenario() {
        let (engine, mut ui) = start(
            Script::Echo {
                exit_after_lines: Some(1),
                exit_code: 0,
            },
            256,
            Duration::from_millis(200),
        );

        ui.commands
            .send(Inbound::OpenSession {
                shell: Some("echo-shell".into()),
                cwd: None,
                rows: None,
                cols: None,
                env: Default::default(),
            })
            .await
            .unwrap();
        let id = match next_session_event(&mut ui).await {
            Outbound::SessionOpened { id, shell, .. } => {
                assert_eq!(shell, "echo-shell");
                id
            }
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(id, SessionId(1));

        ui.commands
            .send(Inbound::SessionInput {
                id,
                bytes: b"hello\n".to_vec(),
            })
            .await
            .unwrap();

        let mut output = Vec::new();
        loop {
            match next_session_event(&mut ui).await {
                Outbound::SessionOutput { id: got, bytes } => {
                    assert_eq!(got, id);
                    output.extend(bytes);
                }
                Outbound::SessionExited { id: got, status } => {
                    assert_eq!(got, id);
                    assert_eq!(status, ExitStatus::Exited { code: 0 });
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(output, b"hello\n");

        // Removal follows the forwarded exit.
        let mut removed = false;
        for _ in 0..50 {
            ui.commands.send(Inbound::ListSessions).await.unwrap();
            match next_session_event(&mut ui).await {
                Outbound::SessionList { sessions } if sessions.is_empty() => {
                    removed = true;
                    break;
                }
                Outbound::SessionList { .. } => {
                    tokio::time::sleep(Duration::from_millis(10)).await
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(removed);

        ui.commands.send(Inbound::Shutdown).await.unwrap();
        engine.await.unwrap();
        while ui.events.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn stale_ids_and_failed_opens_become_events() {
        let (engine, mut ui) = start(Script::echo_forever(), 64, Duration::from_secs(1));

        ui.commands
            .send(Inbound::SessionInput {
                id: SessionId(99),
                bytes: b"x".to_vec(),
            })
            .await
            .unwrap();
        match next_session_event(&mut ui).await {
            Outbound::CommandRejected { id, reason } => {
                assert_eq!(id, Some(SessionId(99)));
                assert!(reason.contains("unknown session"));
            }
            other => panic!("unexpected {other:?}"),
        }

        ui.commands
            .send(Inbound::OpenSession {
                shell: None,
                cwd: Some("/definitely/missing/dir".into()),
                rows: None,
                cols: None,
                env: Default::default(),
            })
            .await
            .unwrap();
        assert!(matches!(
            next_session_event(&mut ui).await,
            Outbound::SessionOpenFailed { .. }
        ));

        drop(ui.commands);
        engine.await.unwrap();
    }

    #[tokio::test]
    async fn close_then_write_is_rejected_after_single_exit() {
        let (engine, mut ui) = start(Script::echo_forever(), 64, Duration::from_secs(1));
        ui.commands.send(Inbound::open_default()).await.unwrap();
        let id = match next_session_event(&mut ui).await {
            Outbound::SessionOpened { id, .. } => id,
            other => panic!("unexpected {other:?}"),
        };

        ui.commands.send(Inbound::CloseSession { id }).await.unwrap();
        ui.commands.send(Inbound::CloseSession { id }).await.unwrap();
        ui.commands
            .send(Inbound::SessionInput {
                id,
                bytes: b"late".to_vec(),
            })
            .await
            .unwrap();
        ui.commands.send(Inbound::Shutdown).await.unwrap();
        engine.await.unwrap();

        let mut exits = 0;
        let mut output_after_exit = false;
        while let Some(event) = ui.events.recv().await {
            match event {
                Outbound::SessionExited { id: got, status } => {
                    assert_eq!(got, id);
                    assert!(matches!(status, ExitStatus::Killed { .. }));
                    exits += 1;
                }
                Outbound::SessionOutput { .. } if exits > 0 => output_after_exit = true,
                _ => {}
            }
        }
        assert_eq!(exits, 1);
        assert!(!output_after_exit);
    }

    #[tokio::test]
    async fn close_is_not_queued_behind_a_blocked_write() {
        let launcher = ScriptedLauncher::new(Script::echo_forever()).with_stalled_input();
        let observed = launcher.observed.clone();
        let (engine, mut ui) = start_with(launcher, 64, Duration::from_secs(1));
        ui.commands.send(Inbound::open_default()).await.unwrap();
        let id = match next_session_event(&mut ui).await {
            Outbound::SessionOpened { id, .. } => id,
            other => panic!("unexpected {other:?}"),
        };

        ui.commands
            .send(Inbound::SessionInput {
                id,
                bytes: b"never read".to_vec(),
            })
            .await
            .unwrap();
        ui.commands.send(Inbound::CloseSession { id }).await.unwrap();

        let (mut exited, mut write_rejected) = (false, false);
        tokio::time::timeout(Duration::from_secs(3), async {
            while !(exited && write_rejected) {
                match next_session_event(&mut ui).await {
                    Outbound::SessionExited { id: got, status } => {
                        assert_eq!(got, id);
                        assert!(matches!(status, ExitStatus::Killed { .. }));
                        exited = true;
                    }
                    Outbound::CommandRejected { id: got, reason } => {
                        assert_eq!(got, Some(id));
                        assert!(reason.contains("closed"), "{reason}");
                        write_rejected = true;
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
        })
        .await
        .expect("close did not take effect while a write was blocked");
        assert_eq!(*observed.terminations.lock().unwrap(), 1);

        ui.commands.send(Inbound::Shutdown).await.unwrap();
        engine.await.unwrap();
    }

    #[tokio::test]
    async fn flood_under_backpressure_loses_no_output() {
        let total = 256 * 1024;
        let (engine, mut ui) = start(
            Script::Flood { total, chunk: 700 },
            16,
            Duration::from_millis(5),
        );
        ui.commands.send(Inbound::open_default()).await.unwrap();

        let mut stream = Vec::new();
        let mut last_sequence = 0u64;
        let mut exits = 0;
        let mut received = 0usize;
        while exits == 0 {
            let Some(event) = ui.events.recv().await else {
                panic!("bridge closed early");
            };
            received += 1;
            // A slow consumer keeps the queue full.
            if received % 8 == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            match event {
                Outbound::SessionOpened { .. } => {}
                Outbound::SessionOutput { bytes, .. } => stream.extend(bytes),
                Outbound::SessionExited { status, .. } => {
                    assert_eq!(status, ExitStatus::Exited { code: 0 });
                    exits += 1;
                }
                Outbound::TelemetryUpdate {
                    snapshot,
                    dropped_before,
                } => {
                    // Gaps are exactly the reported drops.
                    assert_eq!(snapshot.sequence, last_sequence + 1 + dropped_before);
                    last_sequence = snapshot.sequence;
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        assert_eq!(stream.len(), total);
        assert!(stream.iter().enumerate().all(|(i, b)| *b == flood_byte(i)));

        ui.commands.send(Inbound::Shutdown).await.unwrap();
        engine.await.unwrap();
    }
}
