use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::PostbackProfile;

/// Read-only view of the external profile configuration store.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn profile_for(&self, advertiser_id: &str) -> Option<Arc<PostbackProfile>>;
}

/// Profiles held in memory, keyed by advertiser.
#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<HashMap<String, Arc<PostbackProfile>>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, profile: PostbackProfile) {
        let mut guard = self.profiles.write().await;
        guard.insert(profile.advertiser_id.clone(), Arc::new(profile));
    }

    pub async fn remove(&self, advertiser_id: &str) {
        self.profiles.write().await.remove(advertiser_id);
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn profile_for(&self, advertiser_id: &str) -> Option<Arc<PostbackProfile>> {
        self.profiles.read().await.get(advertiser_id).cloned()
    }
}
