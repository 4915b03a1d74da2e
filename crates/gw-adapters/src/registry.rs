//! In-memory connection registry, per §4.G.
//!
//! Thread-safe via `tokio::sync::RwLock`, matching the concurrency
//! style of the teacher's `sr-adapters::nats::NatsMessageBus`'s
//! `processed_keys` set (`Arc<RwLock<HashSet<_>>>`), generalized to a
//! map keyed by `clientId`.

use gw_ports::{ConnectionRegistry, DeviceSummary, RegisterOutcome, RegistrationToken};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryRegistry {
    sessions: RwLock<HashMap<String, (DeviceSummary, RegistrationToken)>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionRegistry for InMemoryRegistry {
    async fn register(&self, summary: DeviceSummary) -> (RegisterOutcome, RegistrationToken) {
        let mut sessions = self.sessions.write().await;
        let outcome = if sessions.contains_key(&summary.client_id) {
            RegisterOutcome::SupersededPrevious
        } else {
            RegisterOutcome::Registered
        };
        let token = RegistrationToken::new();
        sessions.insert(summary.client_id.clone(), (summary, token.clone()));
        (outcome, token)
    }

    /// Only removes the entry if it still holds `token` — a superseded
    /// session's own (delayed) teardown must find its successor's
    /// token there instead and leave the entry alone.
    async fn remove(&self, client_id: &str, token: &RegistrationToken) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(client_id) {
            Some((_, current_token)) if current_token.matches(token) => {
                sessions.remove(client_id);
                true
            }
            _ => false,
        }
    }

    async fn lookup(&self, client_id: &str) -> Option<DeviceSummary> {
        self.sessions
            .read()
            .await
            .get(client_id)
            .map(|(summary, _)| summary.clone())
    }

    async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn snapshot(&self) -> Vec<DeviceSummary> {
        self.sessions
            .read()
            .await
            .values()
            .map(|(summary, _)| summary.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(client_id: &str) -> DeviceSummary {
        DeviceSummary {
            client_id: client_id.to_string(),
            role: "device".to_string(),
            connected_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn first_register_is_registered_second_is_superseded() {
        let registry = InMemoryRegistry::new();
        let (outcome, _token) = registry.register(summary("dev-1")).await;
        assert_eq!(outcome, RegisterOutcome::Registered);
        let (outcome, _token) = registry.register(summary("dev-1")).await;
        assert_eq!(outcome, RegisterOutcome::SupersededPrevious);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn remove_then_register_is_fresh() {
        let registry = InMemoryRegistry::new();
        let (_, token) = registry.register(summary("dev-1")).await;
        assert!(registry.remove("dev-1", &token).await);
        assert_eq!(registry.count().await, 0);
        let (outcome, _token) = registry.register(summary("dev-1")).await;
        assert_eq!(outcome, RegisterOutcome::Registered);
    }

    #[tokio::test]
    async fn remove_is_a_no_op_for_a_superseded_token() {
        let registry = InMemoryRegistry::new();
        let (_, first_token) = registry.register(summary("dev-1")).await;
        let (_, second_token) = registry.register(summary("dev-1")).await;
        assert!(!registry.remove("dev-1", &first_token).await);
        assert_eq!(registry.count().await, 1);
        assert!(registry.remove("dev-1", &second_token).await);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn snapshot_reflects_live_sessions() {
        let registry = InMemoryRegistry::new();
        registry.register(summary("dev-1")).await;
        registry.register(summary("dev-2")).await;
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
    }
}
