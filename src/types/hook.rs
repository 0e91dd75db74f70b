//! Webhook subscription and delivery types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::ids::{DeliveryId, HookId, StackId};

/// Event types a subscription can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Aggregated CI state of a commit changed.
    CommitStatus,
    /// A commit's simple (deployability) state changed.
    DeployableStatus,
    Deploy,
    Rollback,
    Task,
    Lock,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::CommitStatus => "commit_status",
            EventKind::DeployableStatus => "deployable_status",
            EventKind::Deploy => "deploy",
            EventKind::Rollback => "rollback",
            EventKind::Task => "task",
            EventKind::Lock => "lock",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An external endpoint registered for some event types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSubscription {
    pub id: HookId,
    /// `None` subscribes to every stack.
    pub stack: Option<StackId>,
    pub events: BTreeSet<EventKind>,
    pub url: String,
    /// Shared secret for the HMAC signature header.
    pub secret: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl HookSubscription {
    /// Returns true if this subscription wants `kind` events from `stack`.
    pub fn matches(&self, stack: &StackId, kind: EventKind) -> bool {
        self.active
            && self.events.contains(&kind)
            && self.stack.as_ref().is_none_or(|scoped| scoped == stack)
    }
}

/// Delivery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// One event payload destined for one subscription. Never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub hook: HookId,
    pub event: EventKind,
    /// Serialized JSON body, frozen at dispatch time.
    pub payload: String,
    pub url: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(stack: Option<&str>, events: &[EventKind]) -> HookSubscription {
        HookSubscription {
            id: HookId(1),
            stack: stack.map(StackId::from),
            events: events.iter().copied().collect(),
            url: "https://hooks.example.com".to_string(),
            secret: None,
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn scoped_subscription_only_matches_its_stack() {
        let hook = subscription(Some("shop/web"), &[EventKind::Deploy]);
        assert!(hook.matches(&StackId::from("shop/web"), EventKind::Deploy));
        assert!(!hook.matches(&StackId::from("shop/api"), EventKind::Deploy));
        assert!(!hook.matches(&StackId::from("shop/web"), EventKind::Rollback));
    }

    #[test]
    fn global_subscription_matches_every_stack() {
        let hook = subscription(None, &[EventKind::Lock]);
        assert!(hook.matches(&StackId::from("a"), EventKind::Lock));
        assert!(hook.matches(&StackId::from("b"), EventKind::Lock));
    }

    #[test]
    fn inactive_subscription_matches_nothing() {
        let mut hook = subscription(None, &[EventKind::Deploy]);
        hook.active = false;
        assert!(!hook.matches(&StackId::from("a"), EventKind::Deploy));
    }
}
