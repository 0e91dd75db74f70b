//! Subscription and delivery arenas.
//!
//! Plain data with no locking; the dispatcher owns the registry behind one
//! lock. Deliveries are never removed: they are the audit trail.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::persistence::HookSnapshot;
use crate::types::{
    Delivery, DeliveryId, DeliveryStatus, EventKind, HookId, HookSubscription, StackId,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookRegistry {
    subscriptions: BTreeMap<HookId, HookSubscription>,
    deliveries: BTreeMap<DeliveryId, Delivery>,
    next_hook_id: u64,
    next_delivery_id: u64,
}

impl HookRegistry {
    pub fn new() -> Self {
        HookRegistry {
            next_hook_id: 1,
            next_delivery_id: 1,
            ..Default::default()
        }
    }

    pub fn from_snapshot(snapshot: HookSnapshot) -> Self {
        let subscriptions: BTreeMap<_, _> = snapshot
            .subscriptions
            .into_iter()
            .map(|s| (s.id, s))
            .collect();
        let deliveries: BTreeMap<_, _> = snapshot
            .deliveries
            .into_iter()
            .map(|d| (d.id, d))
            .collect();

        // Never hand out an id that is already taken, whatever the counters say.
        let next_hook_id = subscriptions
            .keys()
            .next_back()
            .map_or(1, |id| id.0 + 1)
            .max(snapshot.next_hook_id);
        let next_delivery_id = deliveries
            .keys()
            .next_back()
            .map_or(1, |id| id.0 + 1)
            .max(snapshot.next_delivery_id);

        HookRegistry {
            subscriptions,
            deliveries,
            next_hook_id,
            next_delivery_id,
        }
    }

    pub fn snapshot(&self) -> HookSnapshot {
        HookSnapshot {
            next_hook_id: self.next_hook_id,
            next_delivery_id: self.next_delivery_id,
            subscriptions: self.subscriptions.values().cloned().collect(),
            deliveries: self.deliveries.values().cloned().collect(),
        }
    }

    pub fn register(
        &mut self,
        stack: Option<StackId>,
        events: BTreeSet<EventKind>,
        url: String,
        secret: Option<String>,
        now: DateTime<Utc>,
    ) -> &HookSubscription {
        let id = HookId(self.next_hook_id);
        self.next_hook_id += 1;
        self.subscriptions.entry(id).or_insert(HookSubscription {
            id,
            stack,
            events,
            url,
            secret,
            active: true,
            created_at: now,
        })
    }

    pub fn subscription(&self, id: HookId) -> Option<&HookSubscription> {
        self.subscriptions.get(&id)
    }

    pub fn subscription_mut(&mut self, id: HookId) -> Option<&mut HookSubscription> {
        self.subscriptions.get_mut(&id)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &HookSubscription> {
        self.subscriptions.values()
    }

    /// Active subscriptions that want `kind` events from `stack`.
    pub fn matching<'a>(
        &'a self,
        stack: &'a StackId,
        kind: EventKind,
    ) -> impl Iterator<Item = &'a HookSubscription> + 'a {
        self.subscriptions
            .values()
            .filter(move |s| s.matches(stack, kind))
    }

    /// Creates one pending delivery per matching subscription.
    pub fn record_deliveries(
        &mut self,
        stack: &StackId,
        kind: EventKind,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Vec<DeliveryId> {
        let targets: Vec<(HookId, String)> = self
            .matching(stack, kind)
            .map(|s| (s.id, s.url.clone()))
            .collect();

        let mut created = Vec::with_capacity(targets.len());
        for (hook, url) in targets {
            let id = DeliveryId(self.next_delivery_id);
            self.next_delivery_id += 1;
            self.deliveries.insert(
                id,
                Delivery {
                    id,
                    hook,
                    event: kind,
                    payload: payload.to_string(),
                    url,
                    status: DeliveryStatus::Pending,
                    attempts: 0,
                    last_error: None,
                    response_code: None,
                    response_body: None,
                    created_at: now,
                    delivered_at: None,
                },
            );
            created.push(id);
        }
        created
    }

    pub fn delivery(&self, id: DeliveryId) -> Option<&Delivery> {
        self.deliveries.get(&id)
    }

    pub fn delivery_mut(&mut self, id: DeliveryId) -> Option<&mut Delivery> {
        self.deliveries.get_mut(&id)
    }

    pub fn deliveries_for(&self, hook: HookId) -> impl Iterator<Item = &Delivery> {
        self.deliveries.values().filter(move |d| d.hook == hook)
    }

    /// Deliveries that were recorded but never attempted.
    pub fn pending_deliveries(&self) -> impl Iterator<Item = &Delivery> {
        self.deliveries
            .values()
            .filter(|d| d.status == DeliveryStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::at;

    fn events(kinds: &[EventKind]) -> BTreeSet<EventKind> {
        kinds.iter().copied().collect()
    }

    #[test]
    fn one_delivery_per_matching_subscription() {
        let mut registry = HookRegistry::new();
        let web = StackId::from("shop/web");
        registry.register(
            Some(web.clone()),
            events(&[EventKind::Deploy]),
            "https://a.example.com".into(),
            None,
            at(0),
        );
        registry.register(
            None,
            events(&[EventKind::Deploy, EventKind::Lock]),
            "https://b.example.com".into(),
            None,
            at(0),
        );
        registry.register(
            Some(StackId::from("shop/api")),
            events(&[EventKind::Deploy]),
            "https://c.example.com".into(),
            None,
            at(0),
        );

        let created = registry.record_deliveries(&web, EventKind::Deploy, "{}", at(1));
        assert_eq!(created.len(), 2);
        for id in &created {
            let delivery = registry.delivery(*id).unwrap();
            assert_eq!(delivery.status, DeliveryStatus::Pending);
            assert_eq!(delivery.attempts, 0);
        }

        let urls: Vec<&str> = created
            .iter()
            .map(|id| registry.delivery(*id).unwrap().url.as_str())
            .collect();
        assert_eq!(urls, vec!["https://a.example.com", "https://b.example.com"]);
    }

    #[test]
    fn deactivated_subscription_gets_nothing() {
        let mut registry = HookRegistry::new();
        let id = registry
            .register(
                None,
                events(&[EventKind::Lock]),
                "https://a.example.com".into(),
                None,
                at(0),
            )
            .id;
        registry.subscription_mut(id).unwrap().active = false;

        let created = registry.record_deliveries(&StackId::from("s"), EventKind::Lock, "{}", at(0));
        assert!(created.is_empty());
    }

    #[test]
    fn restore_never_reuses_ids() {
        let mut registry = HookRegistry::new();
        registry.register(
            None,
            events(&[EventKind::Lock]),
            "https://a.example.com".into(),
            None,
            at(0),
        );
        registry.record_deliveries(&StackId::from("s"), EventKind::Lock, "{}", at(0));

        let mut snapshot = registry.snapshot();
        snapshot.next_hook_id = 0;
        snapshot.next_delivery_id = 0;

        let mut restored = HookRegistry::from_snapshot(snapshot);
        let hook = restored
            .register(
                None,
                events(&[EventKind::Lock]),
                "https://b.example.com".into(),
                None,
                at(1),
            )
            .id;
        assert_eq!(hook, HookId(2));
        let created = restored.record_deliveries(&StackId::from("s"), EventKind::Lock, "{}", at(1));
        assert_eq!(created, vec![DeliveryId(2), DeliveryId(3)]);
    }
}
