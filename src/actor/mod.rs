//! Meter actor
//!
//! One logical actor per customer, pinned by the routing layer. The
//! actor serializes every request for its customer through a single
//! command loop, hosts the durable storage and the orchestrator, and
//! drives the alarm that flushes append buffers to analytics. Attached
//! subscribers receive a debounced event stream.

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::context::RequestContext;
use crate::grant::resolver::MinimalEntitlement;
use crate::service::usage::CurrentUsage;
use crate::service::{
    EntitlementService, ReportUsageRequest, ReportUsageResult, VerifyRequest, VerifyResult,
};
use crate::{Error, Result};

/// Minimum spacing between broadcast messages per actor
const BROADCAST_DEBOUNCE: Duration = Duration::from_secs(1);

/// Command mailbox depth
const MAILBOX_DEPTH: usize = 64;

static COLO: OnceLock<String> = OnceLock::new();

/// The deployment colo this process runs in, fetched once from the
/// environment and immutable afterwards
pub fn colo() -> &'static str {
    COLO.get_or_init(|| std::env::var("TOLLGATE_COLO").unwrap_or_else(|_| "local".to_string()))
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Events broadcast to attached subscribers (debug UIs)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActorEvent {
    Verified {
        feature_slug: String,
        allowed: bool,
    },
    UsageReported {
        feature_slug: String,
        allowed: bool,
    },
    Flushed {
        usage_records: usize,
        verifications: usize,
    },
    Reset,
}

enum Command {
    Verify {
        ctx: RequestContext,
        req: VerifyRequest,
        reply: oneshot::Sender<Result<VerifyResult>>,
    },
    ReportUsage {
        ctx: RequestContext,
        req: ReportUsageRequest,
        reply: oneshot::Sender<Result<ReportUsageResult>>,
    },
    GetCurrentUsage {
        ctx: RequestContext,
        reply: oneshot::Sender<Result<CurrentUsage>>,
    },
    GetActiveEntitlements {
        ctx: RequestContext,
        reply: oneshot::Sender<Result<Vec<MinimalEntitlement>>>,
    },
    ResetEntitlements {
        ctx: RequestContext,
        reply: oneshot::Sender<Result<()>>,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Client handle to a running actor; cheap to clone
#[derive(Clone)]
pub struct MeterActorHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<ActorEvent>,
}

impl MeterActorHandle {
    /// # Errors
    ///
    /// Returns `Error::Actor` when the actor is gone
    pub async fn verify(&self, ctx: RequestContext, req: VerifyRequest) -> Result<VerifyResult> {
        self.call(|reply| Command::Verify { ctx, req, reply }).await
    }

    /// # Errors
    ///
    /// Returns `Error::Actor` when the actor is gone
    pub async fn report_usage(
        &self,
        ctx: RequestContext,
        req: ReportUsageRequest,
    ) -> Result<ReportUsageResult> {
        self.call(|reply| Command::ReportUsage { ctx, req, reply })
            .await
    }

    /// # Errors
    ///
    /// Returns `Error::Actor` when the actor is gone
    pub async fn get_current_usage(&self, ctx: RequestContext) -> Result<CurrentUsage> {
        self.call(|reply| Command::GetCurrentUsage { ctx, reply })
            .await
    }

    /// # Errors
    ///
    /// Returns `Error::Actor` when the actor is gone
    pub async fn get_active_entitlements(
        &self,
        ctx: RequestContext,
    ) -> Result<Vec<MinimalEntitlement>> {
        self.call(|reply| Command::GetActiveEntitlements { ctx, reply })
            .await
    }

    /// # Errors
    ///
    /// Returns `Error::Actor` when the actor is gone
    pub async fn reset_entitlements(&self, ctx: RequestContext) -> Result<()> {
        self.call(|reply| Command::ResetEntitlements { ctx, reply })
            .await
    }

    /// Force a flush outside the alarm cadence
    ///
    /// # Errors
    ///
    /// Returns `Error::Actor` when the actor is gone
    pub async fn flush(&self) -> Result<()> {
        self.call(|reply| Command::Flush { reply }).await
    }

    /// Attach a subscriber to the debounced event stream
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ActorEvent> {
        self.events.subscribe()
    }

    async fn call<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> Command,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| Error::Actor("actor mailbox closed".to_string()))?;
        rx.await
            .map_err(|_| Error::Actor("actor dropped the request".to_string()))?
    }
}

/// Per-customer single-threaded shard hosting storage and orchestration
pub struct MeterActor {
    customer_id: String,
    service: EntitlementService,
    rx: mpsc::Receiver<Command>,
    events: broadcast::Sender<ActorEvent>,
    alarm_period: Duration,
    last_broadcast: Option<Instant>,
}

impl MeterActor {
    /// Spawn the actor loop for one customer and return its handle.
    /// `flush_time` overrides the alarm cadence within the clamp
    /// `min(30m, max(5s, flush_time ?? default))`.
    #[must_use]
    pub fn spawn(
        customer_id: &str,
        service: EntitlementService,
        flush_time: Option<Duration>,
    ) -> MeterActorHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        let (events, _) = broadcast::channel(32);
        let alarm_period = service.config().alarm_period(flush_time);

        if let Err(e) = service.storage().config_set("colo", colo()) {
            tracing::warn!(customer = customer_id, error = %e, "colo label not persisted");
        }

        let actor = Self {
            customer_id: customer_id.to_string(),
            service,
            rx,
            events: events.clone(),
            alarm_period,
            last_broadcast: None,
        };

        tracing::info!(
            customer = %actor.customer_id,
            colo = colo(),
            alarm_secs = alarm_period.as_secs(),
            "meter actor starting"
        );

        tokio::spawn(actor.run());
        MeterActorHandle { tx, events }
    }

    async fn run(mut self) {
        // replay batches left over from a previous incarnation
        self.flush().await;

        let mut alarm = tokio::time::interval(self.alarm_period);
        alarm.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        alarm.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(command) => self.handle(command).await,
                        None => {
                            // all handles dropped: drain and stop
                            self.flush().await;
                            tracing::info!(customer = %self.customer_id, "meter actor stopping");
                            return;
                        }
                    }
                }
                _ = alarm.tick() => {
                    self.flush().await;
                }
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Verify { ctx, req, reply } => {
                let feature_slug = req.feature_slug.clone();
                let result = self.service.verify(&ctx, req).await;
                if let Ok(outcome) = &result {
                    self.broadcast(ActorEvent::Verified {
                        feature_slug,
                        allowed: outcome.allowed,
                    });
                }
                let _ = reply.send(result);
            }
            Command::ReportUsage { ctx, req, reply } => {
                let feature_slug = req.feature_slug.clone();
                let result = self.service.report_usage(&ctx, req).await;
                if let Ok(outcome) = &result {
                    self.broadcast(ActorEvent::UsageReported {
                        feature_slug,
                        allowed: outcome.allowed,
                    });
                }
                let _ = reply.send(result);
            }
            Command::GetCurrentUsage { ctx, reply } => {
                let _ = reply.send(self.service.get_current_usage(&ctx).await);
            }
            Command::GetActiveEntitlements { ctx, reply } => {
                let _ = reply.send(self.service.get_active_entitlements(&ctx).await);
            }
            Command::ResetEntitlements { ctx, reply } => {
                let result = self.service.reset_entitlements(&ctx).await;
                if result.is_ok() {
                    self.broadcast(ActorEvent::Reset);
                }
                let _ = reply.send(result);
            }
            Command::Flush { reply } => {
                self.flush().await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn flush(&mut self) {
        match self.service.storage().flush(now_ms()).await {
            Ok(outcome) => {
                if outcome.usage_records > 0 || outcome.verifications > 0 {
                    tracing::debug!(
                        customer = %self.customer_id,
                        usage_records = outcome.usage_records,
                        verifications = outcome.verifications,
                        expired_keys = outcome.expired_keys,
                        "flushed append buffers"
                    );
                    self.broadcast(ActorEvent::Flushed {
                        usage_records: outcome.usage_records,
                        verifications: outcome.verifications,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(
                    customer = %self.customer_id,
                    error = %e,
                    "flush failed, batches stay buffered"
                );
            }
        }
    }

    /// Emit at most one event per second; excess events are dropped
    fn broadcast(&mut self, event: ActorEvent) {
        if self.events.receiver_count() == 0 {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_broadcast {
            if now.duration_since(last) < BROADCAST_DEBOUNCE {
                return;
            }
        }
        self.last_broadcast = Some(now);
        let _ = self.events.send(event);
    }
}
