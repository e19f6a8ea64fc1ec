//! Runtime wiring: one constructed object owning the workers of an instance.
//!
//! Nothing here is a process-wide singleton; the runtime is built explicitly
//! from a store, a transport driver, and a config, and everything the
//! workers share (registries, report queues, cancellation) hangs off it.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_codec::CodecRegistry;
use weft_dispatch::{Dispatcher, PolicyContext, PolicyEngine, ReceptorRegistry};
use weft_lifecycle::{LifecycleInvoker, LifecycleRegistry};
use weft_store::{PartitionManager, StoreError, WeftStore, WorkCoordinator};
use weft_transport::{SubscriptionHandle, Transport};
use weft_types::{
    DeliveryReceipt, InstanceDescriptor, InstanceId, MessageId, NewOutboxMessage, StreamId,
    WorkBatchRequest,
};

use crate::config::RuntimeConfig;
use crate::inbox_worker::{InboundRoute, InboxConsumer};
use crate::outbox_worker::OutboxPublisher;
use crate::perspective::{PerspectiveRegistry, PerspectiveStatus, PerspectiveWorker};
use crate::reports::CycleReports;

struct RuntimeInner {
    config: RuntimeConfig,
    instance_id: InstanceId,
    store: WeftStore,
    coordinator: WorkCoordinator,
    flush_coordinator: WorkCoordinator,
    partitions: PartitionManager,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    receptors: Arc<ReceptorRegistry>,
    codecs: Arc<CodecRegistry>,
    lifecycle: Arc<LifecycleRegistry>,
    policies: Arc<PolicyEngine>,
    perspectives: Arc<PerspectiveRegistry>,
    perspective_worker: PerspectiveWorker,
    consumer: InboxConsumer,
    publisher: OutboxPublisher,
    reports: Arc<CycleReports>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    running: tokio::sync::Mutex<bool>,
}

/// One service instance's runtime: registries, workers, and lifecycle.
///
/// Cheap to clone; clones share the same instance.
#[derive(Clone)]
pub struct WeftRuntime {
    inner: Arc<RuntimeInner>,
}

impl WeftRuntime {
    /// Wire a runtime over `store` and `transport`.
    ///
    /// Fails when the coordinator and partition configs disagree on the
    /// partition count; P is a fleet-wide invariant fixed at startup.
    pub async fn new(
        config: RuntimeConfig,
        store: WeftStore,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        anyhow::ensure!(
            config.coordinator.partition_count == config.partitions.partition_count,
            "coordinator and partition manager disagree on partition count ({} != {})",
            config.coordinator.partition_count,
            config.partitions.partition_count,
        );

        let instance_id = InstanceId::generate();
        let coordinator = store.coordinator(config.coordinator.clone());
        // Shutdown flush reports outcomes without claiming anything new.
        let mut flush_config = config.coordinator.clone();
        flush_config.outbox_batch_size = 0;
        flush_config.inbox_batch_size = 0;
        let flush_coordinator = store.coordinator(flush_config);
        let partitions = store.partition_manager(config.partitions.clone());

        let receptors = Arc::new(ReceptorRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&receptors)));
        let codecs = Arc::new(CodecRegistry::new());
        let lifecycle = Arc::new(LifecycleRegistry::new());
        let invoker = LifecycleInvoker::new(Arc::clone(&lifecycle));
        let policies = Arc::new(PolicyEngine::new());
        let perspectives = Arc::new(PerspectiveRegistry::new());
        let reports = Arc::new(CycleReports::new());

        let publisher = OutboxPublisher::new(
            instance_id,
            Arc::clone(&transport),
            invoker.clone(),
            Arc::clone(&reports),
            config.publish_timeout,
        );
        let consumer = InboxConsumer::new(Arc::clone(&dispatcher), invoker, Arc::clone(&reports));
        let perspective_worker = PerspectiveWorker::new(
            store.event_store(),
            store.checkpoints(),
            Arc::clone(&perspectives),
            config.perspective_batch_size,
        );

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                instance_id,
                store,
                coordinator,
                flush_coordinator,
                partitions,
                transport,
                dispatcher,
                receptors,
                codecs,
                lifecycle,
                policies,
                perspectives,
                perspective_worker,
                consumer,
                publisher,
                reports,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                running: tokio::sync::Mutex::new(false),
            }),
        })
    }

    //───────────────────── accessors ─────────────────────

    /// This instance's identifier.
    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance_id
    }

    /// The receptor registry; populate before `start`.
    pub fn receptors(&self) -> &Arc<ReceptorRegistry> {
        &self.inner.receptors
    }

    /// The payload codec registry shared with transport drivers; populate
    /// before `start`.
    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.inner.codecs
    }

    /// The lifecycle hook registry; populate before `start`.
    pub fn lifecycle(&self) -> &Arc<LifecycleRegistry> {
        &self.inner.lifecycle
    }

    /// The publish policy engine; populate before `start`.
    pub fn policies(&self) -> &Arc<PolicyEngine> {
        &self.inner.policies
    }

    /// The perspective registry; populate before `start`.
    pub fn perspectives(&self) -> &Arc<PerspectiveRegistry> {
        &self.inner.perspectives
    }

    /// The worker's view of a perspective's health.
    pub fn perspective_status(&self, name: &str) -> PerspectiveStatus {
        self.inner.perspective_worker.status(name)
    }

    /// The shared store handle.
    pub fn store(&self) -> &WeftStore {
        &self.inner.store
    }

    /// The transport driver.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Identity row this instance heartbeats under.
    pub fn descriptor(&self) -> InstanceDescriptor {
        self.inner.descriptor()
    }

    //───────────────────── message entry points ─────────────────────

    /// Durable send with an explicit destination.
    pub fn send(&self, message: NewOutboxMessage) -> DeliveryReceipt {
        self.inner.dispatcher.send(message)
    }

    /// Durable send routed through the policy engine.
    ///
    /// The first matching policy supplies the destination and event-ness;
    /// no matching policy is an error.
    pub fn send_with_policy(
        &self,
        type_tag: impl Into<String>,
        payload: Vec<u8>,
        stream_id: Option<StreamId>,
        metadata: Option<serde_json::Value>,
    ) -> Result<DeliveryReceipt> {
        let type_tag = type_tag.into();
        let ctx = PolicyContext {
            type_tag: type_tag.clone(),
            stream_id,
            is_event: false,
            metadata: metadata.clone(),
        };
        let config = self
            .inner
            .policies
            .match_first(&ctx)
            .with_context(|| format!("no publish policy matched type tag {type_tag:?}"))?;
        Ok(self.inner.dispatcher.send(NewOutboxMessage {
            message_id: MessageId::generate(),
            destination: config.destination,
            type_tag,
            payload,
            metadata,
            scope: None,
            stream_id,
            is_event: config.is_event,
            scheduled_for: None,
        }))
    }

    /// Subscribe this instance's inbox to a transport destination.
    pub fn listen(&self, destination: &str, route: InboundRoute) -> Result<()> {
        let handler = self
            .inner
            .consumer
            .transport_handler(route, self.inner.cancel.child_token());
        let handle = self.inner.transport.subscribe(destination, None, handler)?;
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        info!(%destination, "inbox listening");
        Ok(())
    }

    //───────────────────── lifecycle ─────────────────────

    /// Start the polling, partition, and perspective workers.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.inner.running.lock().await;
        if *running {
            return Ok(());
        }
        *running = true;

        // Own a fair share of partitions before the first claim sweep.
        self.inner.partitions.heartbeat(self.inner.instance_id).await?;

        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(tokio::spawn(cycle_loop(Arc::clone(&self.inner))));
        tasks.push(tokio::spawn(partition_loop(Arc::clone(&self.inner))));
        tasks.push(tokio::spawn(perspective_loop(Arc::clone(&self.inner))));

        info!(
            instance_id = %self.inner.instance_id,
            service = %self.inner.config.service_name,
            "runtime started"
        );
        Ok(())
    }

    /// Run one coordinator cycle: drain accumulated reports and sends, call
    /// the batch protocol, and execute the claimed work.
    ///
    /// Exposed so tests can step the runtime deterministically; the polling
    /// loop calls it on every tick. A failed call restores every drained
    /// input for the next attempt.
    pub async fn run_cycle_once(&self) -> Result<(), StoreError> {
        self.inner.run_cycle_with(&self.inner.coordinator).await
    }

    /// Stop the workers, flush final reports, and release shared rows.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.inner.running.lock().await;
        if !*running {
            return Ok(());
        }
        *running = false;

        self.inner.cancel.cancel();
        for subscription in self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            subscription.close();
        }

        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        if tokio::time::timeout(
            self.inner.config.graceful_timeout,
            futures::future::join_all(tasks),
        )
        .await
        .is_err()
        {
            warn!("graceful timeout elapsed, abandoning in-flight work to its leases");
        }

        // Report whatever finished; claim nothing new.
        if let Err(error) = self
            .inner
            .run_cycle_with(&self.inner.flush_coordinator)
            .await
        {
            warn!(%error, "final report flush failed, outcomes retry from other instances");
        }

        self.inner.partitions.release_all(self.inner.instance_id).await?;
        self.inner
            .store
            .deregister_instance(self.inner.instance_id)
            .await?;
        info!(instance_id = %self.inner.instance_id, "runtime stopped");
        Ok(())
    }
}

impl std::fmt::Debug for WeftRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeftRuntime")
            .field("instance_id", &self.inner.instance_id)
            .field("service_name", &self.inner.config.service_name)
            .finish()
    }
}

impl RuntimeInner {
    fn descriptor(&self) -> InstanceDescriptor {
        InstanceDescriptor {
            instance_id: self.instance_id,
            service_name: self.config.service_name.clone(),
            host_name: self.config.host_name.clone(),
            process_id: std::process::id() as i64,
            metadata: self.config.metadata.clone(),
        }
    }

    async fn run_cycle_with(&self, coordinator: &WorkCoordinator) -> Result<(), StoreError> {
        let mut input = self.reports.drain();
        input.new_outbox.extend(self.dispatcher.drain_outbound());

        let request = WorkBatchRequest {
            instance: self.descriptor(),
            outbox_completions: input.outbox_completions.clone(),
            outbox_failures: input.outbox_failures.clone(),
            inbox_completions: input.inbox_completions.clone(),
            inbox_failures: input.inbox_failures.clone(),
            new_outbox: input.new_outbox.clone(),
            new_inbox: input.new_inbox.clone(),
            lease_seconds: self.config.lease_seconds,
        };

        match coordinator.process_work_batch(&request).await {
            Ok(result) => {
                tokio::join!(
                    self.publisher.process(result.outbox_work, &self.cancel),
                    self.consumer.process(result.inbox_work, &self.cancel),
                );
                Ok(())
            }
            Err(error) => {
                // Nothing was committed; feed the same inputs to the retry.
                self.reports.restore(input);
                Err(error)
            }
        }
    }
}

//─────────────────────────────
//  Worker loops
//─────────────────────────────

async fn cycle_loop(inner: Arc<RuntimeInner>) {
    let mut interval = tokio::time::interval(inner.config.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(error) = inner.run_cycle_with(&inner.coordinator).await {
            // Conflicts and transient database errors retry on the next tick
            // with the same inputs.
            warn!(%error, "coordinator cycle failed, retrying next tick");
        }
    }
}

async fn partition_loop(inner: Arc<RuntimeInner>) {
    let mut interval = tokio::time::interval(inner.config.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(error) = inner.partitions.heartbeat(inner.instance_id).await {
            warn!(%error, "partition heartbeat failed");
        }
    }
}

async fn perspective_loop(inner: Arc<RuntimeInner>) {
    let mut interval = tokio::time::interval(inner.config.perspective_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(error) = inner.perspective_worker.run_cycle().await {
            warn!(%error, "perspective cycle failed");
        }
    }
}
