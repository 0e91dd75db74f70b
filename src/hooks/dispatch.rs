//! Event fan-out and delivery execution.
//!
//! `dispatch` turns one event into one pending [`Delivery`] per matching
//! subscription and submits a job for each. `deliver` performs a single
//! attempt. Neither ever reports back into the transition that produced the
//! event: a failed delivery is recorded on the delivery and nowhere else.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::registry::HookRegistry;
use super::signature::sign;
use super::transport::{HookRequest, HookTransport, TransportError};
use crate::events::{Event, EventReceiver};
use crate::jobs::{Job, JobQueue};
use crate::persistence::{EventLog, HookSnapshot};
use crate::types::{
    Delivery, DeliveryId, DeliveryStatus, EventKind, HookId, HookSubscription, StackId,
};

pub const EVENT_HEADER: &str = "X-Stackpilot-Event";
pub const DELIVERY_HEADER: &str = "X-Stackpilot-Delivery";
pub const SIGNATURE_HEADER: &str = "X-Stackpilot-Signature";

/// Default cap on stored response bodies, in characters.
pub const DEFAULT_RESPONSE_BODY_LIMIT: usize = 2048;

/// Errors from hook management and delivery attempts.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no hook subscription {0}")]
    UnknownHook(HookId),

    #[error("no delivery {0}")]
    UnknownDelivery(DeliveryId),

    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),

    /// The endpoint answered with a non-2xx status.
    #[error("delivery {delivery} rejected with HTTP {status}")]
    Rejected { delivery: DeliveryId, status: u16 },

    /// The request never got an answer.
    #[error("delivery {delivery} failed: {source}")]
    Transport {
        delivery: DeliveryId,
        #[source]
        source: TransportError,
    },

    #[error("delivery {delivery} skipped: subscription {hook} is inactive")]
    Inactive { delivery: DeliveryId, hook: HookId },

    #[error("could not sign delivery {0}")]
    Signing(DeliveryId),
}

pub type Result<T> = std::result::Result<T, DeliveryError>;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Response bodies are read up to this many bytes and stored up to this
    /// many characters.
    pub response_body_limit: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            response_body_limit: DEFAULT_RESPONSE_BODY_LIMIT,
        }
    }
}

/// Owns hook subscriptions and deliveries and talks to endpoints.
pub struct HookDispatcher<T> {
    config: DispatcherConfig,
    registry: RwLock<HookRegistry>,
    transport: T,
    jobs: Arc<dyn JobQueue>,
    journal: Mutex<Option<EventLog>>,
}

impl<T: HookTransport> HookDispatcher<T> {
    pub fn new(config: DispatcherConfig, transport: T, jobs: Arc<dyn JobQueue>) -> Self {
        HookDispatcher {
            config,
            registry: RwLock::new(HookRegistry::new()),
            transport,
            jobs,
            journal: Mutex::new(None),
        }
    }

    /// Journals every event before fanning it out.
    pub fn with_journal(mut self, journal: EventLog) -> Self {
        self.journal = Mutex::new(Some(journal));
        self
    }

    /// Registers a subscription. `stack: None` subscribes to every stack.
    #[instrument(skip_all, fields(stack = ?stack))]
    pub async fn register_hook(
        &self,
        stack: Option<StackId>,
        events: impl IntoIterator<Item = EventKind>,
        url: impl Into<String>,
        secret: Option<String>,
    ) -> Result<HookSubscription> {
        let url = url.into();
        let events: BTreeSet<EventKind> = events.into_iter().collect();
        if events.is_empty() {
            return Err(DeliveryError::InvalidSubscription(
                "at least one event type is required".to_string(),
            ));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(DeliveryError::InvalidSubscription(format!(
                "url must be http(s): {url}"
            )));
        }

        let mut registry = self.registry.write().await;
        let subscription = registry
            .register(stack, events, url, secret, Utc::now())
            .clone();
        info!(hook = %subscription.id, url = %subscription.url, "hook registered");
        Ok(subscription)
    }

    /// Stops creating deliveries for a subscription. Existing records remain.
    pub async fn deactivate_hook(&self, id: HookId) -> Result<HookSubscription> {
        let mut registry = self.registry.write().await;
        let subscription = registry
            .subscription_mut(id)
            .ok_or(DeliveryError::UnknownHook(id))?;
        subscription.active = false;
        info!(hook = %id, "hook deactivated");
        Ok(subscription.clone())
    }

    pub async fn subscriptions(&self) -> Vec<HookSubscription> {
        self.registry.read().await.subscriptions().cloned().collect()
    }

    pub async fn delivery(&self, id: DeliveryId) -> Option<Delivery> {
        self.registry.read().await.delivery(id).cloned()
    }

    pub async fn deliveries_for(&self, hook: HookId) -> Vec<Delivery> {
        self.registry
            .read()
            .await
            .deliveries_for(hook)
            .cloned()
            .collect()
    }

    /// Records deliveries for `event` and schedules them.
    ///
    /// Returns the ids created. Never fails: a payload that cannot be
    /// serialized or a job that cannot be submitted is logged and skipped.
    #[instrument(skip(self, event), fields(stack = %event.stack, event = %event.kind()))]
    pub async fn dispatch(&self, event: &Event) -> Vec<DeliveryId> {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to serialize event payload");
                return Vec::new();
            }
        };

        let created = self.registry.write().await.record_deliveries(
            &event.stack,
            event.kind(),
            &payload,
            Utc::now(),
        );

        for delivery in &created {
            if let Err(e) = self.jobs.submit(Job::DeliverHook {
                delivery: *delivery,
            }) {
                warn!(delivery = %delivery, error = %e, "failed to schedule delivery");
            }
        }
        if !created.is_empty() {
            debug!(count = created.len(), "deliveries scheduled");
        }
        created
    }

    /// Performs one delivery attempt.
    ///
    /// An already `sent` delivery is returned unchanged without calling out.
    /// If an overlapping attempt is acknowledged first, this attempt is
    /// counted but its outcome is dropped, so `sent` is never downgraded.
    /// Any other failure is recorded on the delivery before the error is
    /// returned.
    #[instrument(skip(self), fields(delivery = %id))]
    pub async fn deliver(&self, id: DeliveryId) -> Result<Delivery> {
        let request = {
            let registry = self.registry.read().await;
            let delivery = registry
                .delivery(id)
                .ok_or(DeliveryError::UnknownDelivery(id))?;
            if delivery.status == DeliveryStatus::Sent {
                debug!("delivery already sent, skipping");
                return Ok(delivery.clone());
            }
            let subscription = registry.subscription(delivery.hook);
            match subscription {
                Some(s) if s.active => Some(self.build_request(delivery, s)?),
                _ => None,
            }
        };

        let outcome = match request {
            Some(request) => Some(self.transport.post(request).await),
            None => None,
        };

        let mut registry = self.registry.write().await;
        let delivery = registry
            .delivery_mut(id)
            .ok_or(DeliveryError::UnknownDelivery(id))?;
        delivery.attempts += 1;

        // An overlapping attempt was acknowledged while this one was in flight.
        if delivery.status == DeliveryStatus::Sent {
            debug!(
                attempts = delivery.attempts,
                "delivery already acknowledged, outcome ignored"
            );
            return Ok(delivery.clone());
        }

        match outcome {
            None => {
                let hook = delivery.hook;
                delivery.status = DeliveryStatus::Failed;
                delivery.last_error = Some(format!("subscription {hook} is inactive"));
                warn!(hook = %hook, "delivery skipped, subscription inactive");
                Err(DeliveryError::Inactive { delivery: id, hook })
            }
            Some(Ok(response)) => {
                let status = response.status;
                delivery.response_code = Some(status);
                delivery.response_body = Some(truncate(&response.body, self.config.response_body_limit));
                if response.is_success() {
                    delivery.status = DeliveryStatus::Sent;
                    delivery.last_error = None;
                    delivery.delivered_at = Some(Utc::now());
                    info!(status, attempts = delivery.attempts, "delivery sent");
                    Ok(delivery.clone())
                } else {
                    delivery.status = DeliveryStatus::Failed;
                    delivery.last_error = Some(format!("endpoint answered HTTP {status}"));
                    warn!(status, attempts = delivery.attempts, "delivery rejected");
                    Err(DeliveryError::Rejected {
                        delivery: id,
                        status,
                    })
                }
            }
            Some(Err(e)) => {
                delivery.status = DeliveryStatus::Failed;
                delivery.last_error = Some(e.to_string());
                warn!(error = %e, attempts = delivery.attempts, "delivery failed");
                Err(DeliveryError::Transport {
                    delivery: id,
                    source: e,
                })
            }
        }
    }

    fn build_request(&self, delivery: &Delivery, subscription: &HookSubscription) -> Result<HookRequest> {
        let mut headers = vec![
            (EVENT_HEADER.to_string(), delivery.event.to_string()),
            (DELIVERY_HEADER.to_string(), delivery.id.to_string()),
        ];
        if let Some(secret) = &subscription.secret {
            let signature = sign(delivery.payload.as_bytes(), secret.as_bytes())
                .map_err(|_| DeliveryError::Signing(delivery.id))?;
            headers.push((SIGNATURE_HEADER.to_string(), signature));
        }
        Ok(HookRequest {
            url: delivery.url.clone(),
            headers,
            body: delivery.payload.clone(),
            response_limit: self.config.response_body_limit,
        })
    }

    /// Resubmits every delivery that was recorded but never attempted.
    pub async fn requeue_pending(&self) -> usize {
        let pending: Vec<DeliveryId> = self
            .registry
            .read()
            .await
            .pending_deliveries()
            .map(|d| d.id)
            .collect();
        for delivery in &pending {
            if let Err(e) = self.jobs.submit(Job::DeliverHook { delivery: *delivery }) {
                warn!(delivery = %delivery, error = %e, "failed to requeue delivery");
            }
        }
        pending.len()
    }

    pub async fn snapshot(&self) -> HookSnapshot {
        self.registry.read().await.snapshot()
    }

    pub async fn restore(&self, snapshot: HookSnapshot) {
        *self.registry.write().await = HookRegistry::from_snapshot(snapshot);
    }

    /// Sequence number the journal will assign next, if journaling.
    pub async fn journal_seq(&self) -> Option<u64> {
        self.journal.lock().await.as_ref().map(EventLog::next_seq)
    }

    /// Flushes the journal to disk.
    pub async fn sync_journal(&self) {
        if let Some(journal) = self.journal.lock().await.as_ref()
            && let Err(e) = journal.sync()
        {
            error!(error = %e, "failed to sync event journal");
        }
    }

    async fn handle_event(&self, event: Event) {
        if let Some(journal) = self.journal.lock().await.as_mut()
            && let Err(e) = journal.append(event.clone())
        {
            error!(error = %e, "failed to journal event");
        }
        self.dispatch(&event).await;
    }

    /// Consumes the event bus until it closes or `shutdown` fires.
    ///
    /// On shutdown, events already on the bus are still journaled and
    /// dispatched before returning.
    pub async fn run(&self, mut events: EventReceiver, shutdown: CancellationToken) {
        info!("hook dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("event bus closed");
                        break;
                    }
                },
            }
        }

        while let Ok(event) = events.try_recv() {
            self.handle_event(event).await;
        }
        self.sync_journal().await;
        info!("hook dispatcher stopped");
    }
}

fn truncate(body: &str, limit: usize) -> String {
    body.chars().take(limit).collect()
}
