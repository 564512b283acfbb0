//! Worker registration, secret rotation, and authentication.

use std::sync::Arc;

use rand::Rng;
use rand::distributions::Alphanumeric;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::DispatchError;
use crate::jobs::{Registration, Worker};
use crate::store::Store;

const API_KEY_LEN: usize = 32;

/// A fresh random worker secret.
pub fn generate_api_key() -> SecretString {
    let key: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LEN)
        .map(char::from)
        .collect();
    SecretString::from(key)
}

pub struct WorkerRegistry {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn register(&self, display_name: Option<String>) -> Result<Registration, DispatchError> {
        let now = self.clock.now();
        let worker = Worker {
            id: Uuid::new_v4(),
            api_key: generate_api_key(),
            display_name,
            last_seen_at: now,
            created_at: now,
        };
        self.store.insert_worker(&worker).await?;
        info!(worker_id = %worker.id, name = ?worker.display_name, "Worker registered");
        Ok(Registration {
            worker_id: worker.id,
            api_key: worker.api_key,
        })
    }

    /// Replace `current` with a new secret. The old one stops working immediately.
    pub async fn rotate(&self, current: &SecretString) -> Result<SecretString, DispatchError> {
        let fresh = generate_api_key();
        let rotated = self
            .store
            .rotate_worker_key(current.expose_secret(), fresh.expose_secret(), self.clock.now())
            .await?;
        match rotated {
            Some(worker_id) => {
                info!(worker_id = %worker_id, "Worker secret rotated");
                Ok(fresh)
            }
            None => {
                warn!("Secret rotation with unknown key");
                Err(DispatchError::AuthenticationFailed)
            }
        }
    }

    /// Resolve the worker holding `api_key` and mark it seen.
    pub async fn authenticate(&self, api_key: &SecretString) -> Result<Worker, DispatchError> {
        self.store
            .authenticate_worker(api_key.expose_secret(), self.clock.now())
            .await?
            .ok_or(DispatchError::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::LibSqlBackend;

    async fn registry() -> (WorkerRegistry, Arc<ManualClock>) {
        let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let clock = Arc::new(ManualClock::default());
        (WorkerRegistry::new(store, clock.clone()), clock)
    }

    #[test]
    fn generated_keys_are_alphanumeric_and_distinct() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_eq!(a.expose_secret().len(), API_KEY_LEN);
        assert!(a.expose_secret().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a.expose_secret(), b.expose_secret());
    }

    #[tokio::test]
    async fn register_then_authenticate() {
        let (registry, clock) = registry().await;
        let reg = registry.register(Some("laptop".into())).await.unwrap();

        clock.advance(std::time::Duration::from_secs(10));
        let worker = registry.authenticate(&reg.api_key).await.unwrap();
        assert_eq!(worker.id, reg.worker_id);
        assert_eq!(worker.display_name.as_deref(), Some("laptop"));
        assert!(worker.last_seen_at > worker.created_at);
    }

    #[tokio::test]
    async fn unknown_key_fails_closed() {
        let (registry, _clock) = registry().await;
        let err = registry
            .authenticate(&SecretString::from("not-a-key"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::AuthenticationFailed));
    }

    #[tokio::test]
    async fn rotation_invalidates_old_key() {
        let (registry, _clock) = registry().await;
        let reg = registry.register(None).await.unwrap();

        let fresh = registry.rotate(&reg.api_key).await.unwrap();
        assert_ne!(fresh.expose_secret(), reg.api_key.expose_secret());
        assert!(registry.authenticate(&reg.api_key).await.is_err());
        assert_eq!(
            registry.authenticate(&fresh).await.unwrap().id,
            reg.worker_id
        );
        assert!(matches!(
            registry.rotate(&reg.api_key).await,
            Err(DispatchError::AuthenticationFailed)
        ));
    }
}
