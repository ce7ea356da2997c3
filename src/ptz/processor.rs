use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use crate::camera::{Camera, CameraRegistry, Capability, PtzPosition};
use crate::channel::{EventHub, ServerMessage};
use crate::error::{Error, Result};
use crate::ptz::types::{CommandId, ExecutionStatus, PtzCommand, PtzExecution};
use crate::relay::{call, DeviceCall, EdgeRelay};

struct QueuedCommand {
    id: CommandId,
    sequence: u64,
    epoch: u64,
    session_id: Option<String>,
    command: PtzCommand,
}

struct CameraQueue {
    tx: mpsc::UnboundedSender<QueuedCommand>,
    next_sequence: u64,
    epoch: watch::Sender<u64>,
    /// Where the last accepted move will leave the camera, tagged with its sequence.
    projected: Option<(u64, PtzPosition)>,
    /// Highest sequence the worker has finished with, whatever the outcome.
    completed: Arc<AtomicU64>,
}

impl CameraQueue {
    /// Projected start position for the next command while the projecting
    /// move is still queued or running.
    fn pending_position(&self) -> Option<PtzPosition> {
        match self.projected {
            Some((sequence, position)) if sequence > self.completed.load(Ordering::Acquire) => {
                Some(position)
            }
            _ => None,
        }
    }
}

/// Validates PTZ commands and runs them through one FIFO worker per camera.
pub struct PtzProcessor {
    registry: Arc<CameraRegistry>,
    relay: Arc<EdgeRelay>,
    hub: Arc<EventHub>,
    queues: Mutex<HashMap<String, CameraQueue>>,
}

impl PtzProcessor {
    pub fn new(registry: Arc<CameraRegistry>, relay: Arc<EdgeRelay>, hub: Arc<EventHub>) -> Self {
        Self {
            registry,
            relay,
            hub,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Validates and queues a command. Returns as soon as it is queued.
    pub async fn enqueue(
        &self,
        camera_id: &str,
        session_id: Option<&str>,
        command: PtzCommand,
    ) -> Result<CommandId> {
        if command == PtzCommand::Stop {
            return self.stop_for(camera_id, session_id).await;
        }

        let camera = self.registry.get(camera_id).await?;
        if !camera.status.is_available() {
            return Err(Error::CameraOffline(format!(
                "camera {} is {}",
                camera_id, camera.status
            )));
        }
        if !camera.has_capability(Capability::Ptz) {
            return Err(Error::Unsupported(format!(
                "camera {} has no PTZ capability",
                camera_id
            )));
        }

        let mut queues = self.queues.lock().await;
        let queue = self.queue_for(&mut queues, camera_id);
        // The worker records a position before marking its command complete.
        let start = match queue.pending_position() {
            Some(position) => position,
            None => self.registry.get(camera_id).await?.ptz_position,
        };
        command.validate(&camera.limits, &start)?;

        let sequence = queue.next_sequence;
        let id = push(queue, camera_id, session_id, command);
        queue.projected = command
            .acknowledged_position(&start)
            .map(|position| (sequence, position));
        Ok(id)
    }

    /// Cancels the in-flight continuous move and everything queued, then
    /// sends a device stop.
    pub async fn stop(&self, camera_id: &str) -> Result<CommandId> {
        self.stop_for(camera_id, None).await
    }

    async fn stop_for(&self, camera_id: &str, session_id: Option<&str>) -> Result<CommandId> {
        self.registry.get(camera_id).await?;

        let mut queues = self.queues.lock().await;
        let queue = self.queue_for(&mut queues, camera_id);
        queue.epoch.send_modify(|epoch| *epoch += 1);
        queue.projected = None;
        tracing::debug!(camera_id = %camera_id, "PTZ queue cleared by stop");
        Ok(push(queue, camera_id, session_id, PtzCommand::Stop))
    }

    fn queue_for<'a>(
        &self,
        queues: &'a mut HashMap<String, CameraQueue>,
        camera_id: &str,
    ) -> &'a mut CameraQueue {
        let queue = queues
            .entry(camera_id.to_string())
            .or_insert_with(|| self.spawn_worker(camera_id));
        if queue.tx.is_closed() {
            tracing::warn!(camera_id = %camera_id, "PTZ worker exited, restarting");
            *queue = self.spawn_worker(camera_id);
        }
        queue
    }

    fn spawn_worker(&self, camera_id: &str) -> CameraQueue {
        let (tx, rx) = mpsc::unbounded_channel();
        let (epoch, epoch_rx) = watch::channel(0);
        let completed = Arc::new(AtomicU64::new(0));
        let worker = Worker {
            camera_id: camera_id.to_string(),
            registry: self.registry.clone(),
            relay: self.relay.clone(),
            hub: self.hub.clone(),
            completed: completed.clone(),
        };
        tokio::spawn(worker.run(rx, epoch_rx));
        tracing::debug!(camera_id = %camera_id, "Started PTZ worker");

        CameraQueue {
            tx,
            next_sequence: 1,
            epoch,
            projected: None,
            completed,
        }
    }
}

fn push(
    queue: &mut CameraQueue,
    camera_id: &str,
    session_id: Option<&str>,
    command: PtzCommand,
) -> CommandId {
    let id = Uuid::new_v4();
    let sequence = queue.next_sequence;
    queue.next_sequence += 1;

    let queued = QueuedCommand {
        id,
        sequence,
        epoch: *queue.epoch.borrow(),
        session_id: session_id.map(str::to_string),
        command,
    };
    if queue.tx.send(queued).is_err() {
        tracing::error!(camera_id = %camera_id, "PTZ worker is gone, command dropped");
    }

    tracing::debug!(
        camera_id = %camera_id,
        command_id = %id,
        sequence,
        kind = %command.kind(),
        "PTZ command queued"
    );
    id
}

struct Worker {
    camera_id: String,
    registry: Arc<CameraRegistry>,
    relay: Arc<EdgeRelay>,
    hub: Arc<EventHub>,
    completed: Arc<AtomicU64>,
}

impl Worker {
    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<QueuedCommand>,
        mut epoch: watch::Receiver<u64>,
    ) {
        while let Some(queued) = rx.recv().await {
            self.process(&queued, &mut epoch).await;
            self.completed.store(queued.sequence, Ordering::Release);
        }
    }

    async fn process(&self, queued: &QueuedCommand, epoch: &mut watch::Receiver<u64>) {
        let current_epoch = *epoch.borrow_and_update();
        if queued.epoch < current_epoch {
            self.report(queued, ExecutionStatus::Cancelled, None, None)
                .await;
            return;
        }

        let outcome = match queued.command {
            // Only continuous moves run long enough to be interrupted.
            PtzCommand::Continuous(_) => {
                tokio::select! {
                    result = self.execute(&queued.command) => Some(result),
                    _ = epoch.changed() => None,
                }
            }
            _ => Some(self.execute(&queued.command).await),
        };

        match outcome {
            Some(Ok(position)) => {
                tracing::info!(
                    camera_id = %self.camera_id,
                    sequence = queued.sequence,
                    kind = %queued.command.kind(),
                    "PTZ command executed"
                );
                self.report(queued, ExecutionStatus::Success, position, None)
                    .await;
            }
            Some(Err(e)) => {
                tracing::warn!(
                    camera_id = %self.camera_id,
                    sequence = queued.sequence,
                    kind = %queued.command.kind(),
                    "PTZ command failed: {}",
                    e
                );
                self.report(queued, ExecutionStatus::Failed, None, Some(&e))
                    .await;
            }
            None => {
                tracing::debug!(
                    camera_id = %self.camera_id,
                    sequence = queued.sequence,
                    "Continuous move interrupted by stop"
                );
                self.report(queued, ExecutionStatus::Cancelled, None, None)
                    .await;
            }
        }
    }

    /// One device call; the position is recorded only after the device acknowledged.
    async fn execute(&self, command: &PtzCommand) -> Result<Option<PtzPosition>> {
        let camera = self.registry.get(&self.camera_id).await?;
        // An earlier failure can leave the camera short of where this command was validated from.
        command.validate(&camera.limits, &camera.ptz_position)?;
        let device_call = command.to_device_call(&camera.ptz_position);
        self.relay.invoke(&self.camera_id, &device_call).await?;

        let position = match command {
            PtzCommand::Stop => self.read_back_position(&camera).await,
            _ => command.acknowledged_position(&camera.ptz_position),
        };
        if let Some(position) = position {
            self.registry.set_ptz_position(&self.camera_id, position).await;
        }
        Ok(position)
    }

    async fn read_back_position(&self, camera: &Camera) -> Option<PtzPosition> {
        match self
            .relay
            .invoke(&self.camera_id, &DeviceCall::QueryPosition)
            .await
        {
            Ok(response) => call::parse_position(camera, &response.body),
            Err(e) => {
                tracing::debug!(camera_id = %self.camera_id, "Position read-back failed: {}", e);
                None
            }
        }
    }

    async fn report(
        &self,
        queued: &QueuedCommand,
        status: ExecutionStatus,
        position: Option<PtzPosition>,
        error: Option<&Error>,
    ) {
        let Some(session_id) = queued.session_id.as_deref() else {
            return;
        };

        let execution = PtzExecution {
            command: queued.command.kind(),
            status,
            command_id: queued.id,
            camera_id: self.camera_id.clone(),
            sequence: queued.sequence,
            position,
            error: error.map(|e| e.to_string()),
        };
        self.hub
            .publish(session_id, ServerMessage::PtzExecuted { data: execution })
            .await;

        if let Some(e) = error {
            self.hub.publish(session_id, ServerMessage::error(e)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraStatus;
    use crate::channel::{EventFilter, Outbox};
    use crate::config::RelayConfig;
    use crate::ptz::types::{ContinuousMove, PtzVector};
    use crate::relay::DeviceError;
    use crate::testing::{online_camera, ScriptedTransport};
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        registry: Arc<CameraRegistry>,
        transport: Arc<ScriptedTransport>,
        hub: Arc<EventHub>,
        processor: PtzProcessor,
    }

    async fn fixture(cameras: &[&str]) -> Fixture {
        let registry = Arc::new(CameraRegistry::default());
        for id in cameras {
            online_camera(&registry, id, &[Capability::Ptz, Capability::Video]).await;
        }
        let transport = Arc::new(ScriptedTransport::default());
        let relay = Arc::new(EdgeRelay::new(
            registry.clone(),
            transport.clone(),
            &RelayConfig::default(),
        ));
        let hub = Arc::new(EventHub::new());
        let processor = PtzProcessor::new(registry.clone(), relay, hub.clone());
        Fixture {
            registry,
            transport,
            hub,
            processor,
        }
    }

    async fn listen(hub: &EventHub, session_id: &str) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = Outbox::channel();
        hub.subscribe(session_id, Uuid::new_v4(), tx, EventFilter::all())
            .await;
        rx
    }

    async fn next_execution(rx: &mut mpsc::Receiver<ServerMessage>) -> PtzExecution {
        loop {
            let message = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for ptz_executed")
                .expect("channel closed");
            if let ServerMessage::PtzExecuted { data } = message {
                return data;
            }
        }
    }

    fn absolute(pan: f64) -> PtzCommand {
        PtzCommand::Absolute(PtzVector {
            pan: Some(pan),
            tilt: Some(0.0),
            zoom: Some(1.0),
        })
    }

    #[tokio::test]
    async fn test_commands_execute_in_submission_order() {
        let f = fixture(&["cam-1"]).await;
        let mut rx = listen(&f.hub, "s-1").await;

        // Jitter: the first call is the slowest.
        f.transport.delay_next("cam-1", Duration::from_millis(80));
        f.transport.delay_next("cam-1", Duration::from_millis(5));
        f.transport.delay_next("cam-1", Duration::from_millis(30));

        let c1 = f.processor.enqueue("cam-1", Some("s-1"), absolute(10.0)).await.unwrap();
        let c2 = f.processor.enqueue("cam-1", Some("s-1"), absolute(20.0)).await.unwrap();
        let c3 = f.processor.enqueue("cam-1", Some("s-1"), absolute(30.0)).await.unwrap();

        let executed = vec![
            next_execution(&mut rx).await,
            next_execution(&mut rx).await,
            next_execution(&mut rx).await,
        ];
        let ids: Vec<_> = executed.iter().map(|e| e.command_id).collect();
        assert_eq!(ids, vec![c1, c2, c3]);
        let sequences: Vec<_> = executed.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(executed.iter().all(|e| e.status == ExecutionStatus::Success));

        assert_eq!(f.registry.get("cam-1").await.unwrap().ptz_position.pan, 30.0);
    }

    #[tokio::test]
    async fn test_out_of_range_is_rejected_without_moving() {
        let f = fixture(&["cam-1"]).await;

        let result = f
            .processor
            .enqueue("cam-1", Some("s-1"), absolute(999.0))
            .await;

        assert!(matches!(result, Err(Error::OutOfRange(_))));
        let camera = f.registry.get("cam-1").await.unwrap();
        assert_eq!(camera.ptz_position.pan, 0.0);
        assert!(f.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_offline_and_unsupported_cameras_are_rejected() {
        let f = fixture(&["cam-1"]).await;
        f.registry
            .mark_status("cam-1", CameraStatus::Offline)
            .await
            .unwrap();
        assert!(matches!(
            f.processor.enqueue("cam-1", None, absolute(10.0)).await,
            Err(Error::CameraOffline(_))
        ));

        online_camera(&f.registry, "fixed-1", &[Capability::Video]).await;
        assert!(matches!(
            f.processor.enqueue("fixed-1", None, absolute(10.0)).await,
            Err(Error::Unsupported(_))
        ));

        assert!(matches!(
            f.processor.enqueue("cam-9", None, absolute(10.0)).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_command_does_not_block_queue() {
        let f = fixture(&["cam-1"]).await;
        let mut rx = listen(&f.hub, "s-1").await;
        f.transport.fail_next(
            "cam-1",
            DeviceError::Rejected {
                status: 400,
                message: "limit".to_string(),
            },
        );

        f.processor.enqueue("cam-1", Some("s-1"), absolute(10.0)).await.unwrap();
        f.processor.enqueue("cam-1", Some("s-1"), absolute(20.0)).await.unwrap();

        let first = next_execution(&mut rx).await;
        assert_eq!(first.status, ExecutionStatus::Failed);
        assert!(first.error.is_some());
        let second = next_execution(&mut rx).await;
        assert_eq!(second.status, ExecutionStatus::Success);

        // Only the acknowledged command moved the recorded position.
        assert_eq!(f.registry.get("cam-1").await.unwrap().ptz_position.pan, 20.0);
    }

    #[tokio::test]
    async fn test_failure_on_one_camera_does_not_delay_another() {
        let f = fixture(&["cam-a", "cam-b"]).await;
        let mut rx_a = listen(&f.hub, "s-a").await;
        let mut rx_b = listen(&f.hub, "s-b").await;

        f.transport.delay_next("cam-a", Duration::from_millis(1500));
        f.transport
            .fail_next("cam-a", DeviceError::Unreachable("refused".to_string()));

        f.processor.enqueue("cam-a", Some("s-a"), absolute(10.0)).await.unwrap();
        for pan in [10.0, 20.0, 30.0] {
            f.processor.enqueue("cam-b", Some("s-b"), absolute(pan)).await.unwrap();
        }

        let drained = timeout(Duration::from_millis(500), async {
            for _ in 0..3 {
                assert_eq!(next_execution(&mut rx_b).await.status, ExecutionStatus::Success);
            }
        })
        .await;
        assert!(drained.is_ok(), "camera B was held up by camera A");

        assert_eq!(next_execution(&mut rx_a).await.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_continuous_and_queue() {
        let f = fixture(&["cam-1"]).await;
        let mut rx = listen(&f.hub, "s-1").await;
        f.transport
            .respond("cam-1", "query_position", "pan=12.5\ntilt=-4\nzoom=1\n");

        f.transport.delay_next("cam-1", Duration::from_secs(5));
        let continuous = PtzCommand::Continuous(ContinuousMove {
            pan_speed: Some(0.5),
            ..Default::default()
        });
        let moving = f.processor.enqueue("cam-1", Some("s-1"), continuous).await.unwrap();
        let queued = f.processor.enqueue("cam-1", Some("s-1"), absolute(90.0)).await.unwrap();

        // Let the worker pick up the continuous move.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stop = f
            .processor
            .enqueue("cam-1", Some("s-1"), PtzCommand::Stop)
            .await
            .unwrap();

        let first = next_execution(&mut rx).await;
        assert_eq!((first.command_id, first.status), (moving, ExecutionStatus::Cancelled));
        let second = next_execution(&mut rx).await;
        assert_eq!((second.command_id, second.status), (queued, ExecutionStatus::Cancelled));
        let third = next_execution(&mut rx).await;
        assert_eq!((third.command_id, third.status), (stop, ExecutionStatus::Success));
        assert_eq!(third.position.map(|p| p.pan), Some(12.5));

        let calls = f.transport.calls_for("cam-1");
        assert!(!calls.iter().any(|c| matches!(c, DeviceCall::AbsoluteMove { .. })));
        assert!(calls.contains(&DeviceCall::Stop));
        assert_eq!(f.registry.get("cam-1").await.unwrap().ptz_position.tilt, -4.0);
    }

    fn relative_pan(delta: f64) -> PtzCommand {
        PtzCommand::Relative(PtzVector {
            pan: Some(delta),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_queued_relative_moves_stay_within_limits() {
        let f = fixture(&["cam-1"]).await;
        let mut rx = listen(&f.hub, "s-1").await;
        f.transport.delay_next("cam-1", Duration::from_millis(100));

        f.processor.enqueue("cam-1", Some("s-1"), absolute(170.0)).await.unwrap();
        f.processor.enqueue("cam-1", Some("s-1"), relative_pan(8.0)).await.unwrap();
        let overflow = f
            .processor
            .enqueue("cam-1", Some("s-1"), relative_pan(8.0))
            .await;
        assert!(matches!(overflow, Err(Error::OutOfRange(_))));

        // Moving back is measured from the queued target, not the recorded pan.
        f.processor.enqueue("cam-1", Some("s-1"), relative_pan(-20.0)).await.unwrap();

        for _ in 0..3 {
            assert_eq!(next_execution(&mut rx).await.status, ExecutionStatus::Success);
        }
        let pan = f.registry.get("cam-1").await.unwrap().ptz_position.pan;
        assert_eq!(pan, 158.0);

        // Queue drained: the recorded position is the base again.
        assert!(matches!(
            f.processor.enqueue("cam-1", None, relative_pan(30.0)).await,
            Err(Error::OutOfRange(_))
        ));
        f.processor.enqueue("cam-1", None, relative_pan(20.0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_relative_move_is_rechecked_after_earlier_failure() {
        let f = fixture(&["cam-1"]).await;
        let mut rx = listen(&f.hub, "s-1").await;
        f.transport.delay_next("cam-1", Duration::from_millis(100));
        f.transport.fail_next(
            "cam-1",
            DeviceError::Rejected {
                status: 400,
                message: "busy".to_string(),
            },
        );

        f.processor.enqueue("cam-1", Some("s-1"), absolute(-170.0)).await.unwrap();
        // Valid from -170, but the camera never left 0.
        f.processor.enqueue("cam-1", Some("s-1"), relative_pan(300.0)).await.unwrap();

        assert_eq!(next_execution(&mut rx).await.status, ExecutionStatus::Failed);
        let rechecked = next_execution(&mut rx).await;
        assert_eq!(rechecked.status, ExecutionStatus::Failed);
        assert!(rechecked.error.unwrap().contains("outside"));

        assert_eq!(f.registry.get("cam-1").await.unwrap().ptz_position.pan, 0.0);
        assert!(!f
            .transport
            .calls_for("cam-1")
            .iter()
            .any(|c| matches!(c, DeviceCall::RelativeMove { .. })));
    }

    #[tokio::test]
    async fn test_stop_resets_queued_projection() {
        let f = fixture(&["cam-1"]).await;
        let mut rx = listen(&f.hub, "s-1").await;
        f.transport.delay_next("cam-1", Duration::from_millis(100));

        f.processor.enqueue("cam-1", Some("s-1"), absolute(10.0)).await.unwrap();
        f.processor.enqueue("cam-1", Some("s-1"), absolute(175.0)).await.unwrap();
        f.processor.enqueue("cam-1", Some("s-1"), PtzCommand::Stop).await.unwrap();

        // 175 was cancelled, so +100 is measured from the recorded position.
        let accepted = f
            .processor
            .enqueue("cam-1", Some("s-1"), relative_pan(100.0))
            .await;
        assert!(accepted.is_ok());
        for _ in 0..4 {
            next_execution(&mut rx).await;
        }
        let pan = f.registry.get("cam-1").await.unwrap().ptz_position.pan;
        assert!((-180.0..=180.0).contains(&pan));
    }

    #[tokio::test]
    async fn test_stop_succeeds_for_known_camera_only() {
        let f = fixture(&["cam-1"]).await;
        assert!(f.processor.stop("cam-1").await.is_ok());
        assert!(matches!(
            f.processor.stop("cam-9").await,
            Err(Error::NotFound(_))
        ));
    }
}
