//! Snapshot-diff change detection
//!
//! Keeps the last observed resource listing per provider and turns each new
//! listing into create/update/delete changes.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::types::{ChangeType, Resource, ResourceChange};

/// Last observed listing of one provider
#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    resources: HashMap<String, Resource>,
    /// Resource ids in discovery order
    order: Vec<String>,
    pub taken_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    fn from_listing(listing: Vec<Resource>) -> Self {
        let mut resources = HashMap::with_capacity(listing.len());
        let mut order = Vec::with_capacity(listing.len());

        for resource in listing {
            if !resources.contains_key(&resource.id) {
                order.push(resource.id.clone());
            }
            // Duplicate ids: the last listing entry wins
            resources.insert(resource.id.clone(), resource);
        }

        Self {
            resources,
            order,
            taken_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.resources.get(id)
    }

    /// Resources in discovery order
    pub fn resources(&self) -> Vec<Resource> {
        self.order
            .iter()
            .filter_map(|id| self.resources.get(id).cloned())
            .collect()
    }
}

type Shard = Arc<Mutex<Option<ResourceSnapshot>>>;

/// Stateful snapshot differ.
///
/// The outer map is only locked to find or create a provider's shard, so
/// different providers are diffed concurrently.
#[derive(Default)]
pub struct ChangeDetector {
    shards: RwLock<HashMap<String, Shard>>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    async fn shard(&self, provider: &str) -> Shard {
        if let Some(shard) = self.shards.read().await.get(provider) {
            return Arc::clone(shard);
        }

        let mut shards = self.shards.write().await;
        Arc::clone(shards.entry(provider.to_string()).or_default())
    }

    /// Diff `current` against the stored snapshot for `provider`, then
    /// replace the snapshot.
    ///
    /// The first listing for a provider only seeds the baseline and yields no
    /// changes. Creates and updates follow discovery order, deletes follow
    /// the previous snapshot's order.
    pub async fn detect_changes(&self, provider: &str, current: Vec<Resource>) -> Vec<ResourceChange> {
        let shard = self.shard(provider).await;
        let mut slot = shard.lock().await;

        let next = ResourceSnapshot::from_listing(current);

        let changes = match slot.as_ref() {
            Some(previous) => {
                let changes = diff(previous, &next);
                debug!(
                    provider = %provider,
                    previous = previous.len(),
                    current = next.len(),
                    changes = changes.len(),
                    "Diffed resource snapshot"
                );
                changes
            }
            None => {
                info!(
                    provider = %provider,
                    resources = next.len(),
                    "Seeded baseline snapshot"
                );
                Vec::new()
            }
        };

        *slot = Some(next);
        changes
    }

    /// Current snapshot for `provider`, if a baseline exists
    pub async fn snapshot(&self, provider: &str) -> Option<ResourceSnapshot> {
        let shard = self.shards.read().await.get(provider).cloned()?;
        let slot = shard.lock().await;
        slot.clone()
    }

    /// Drop the baseline for `provider`; its next listing seeds again
    pub async fn forget(&self, provider: &str) -> bool {
        self.shards.write().await.remove(provider).is_some()
    }

    pub async fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shards.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

fn diff(previous: &ResourceSnapshot, next: &ResourceSnapshot) -> Vec<ResourceChange> {
    let mut changes = Vec::new();

    for id in &next.order {
        let Some(resource) = next.resources.get(id) else {
            continue;
        };

        match previous.resources.get(id) {
            None => changes.push(ResourceChange {
                resource_id: id.clone(),
                change_type: ChangeType::Create,
                resource: resource.clone(),
                details: describe(resource),
            }),
            Some(old) if old != resource => {
                let mut details = describe(resource);
                details.insert(
                    "changed_fields".to_string(),
                    serde_json::json!(changed_fields(old, resource)),
                );
                changes.push(ResourceChange {
                    resource_id: id.clone(),
                    change_type: ChangeType::Update,
                    resource: resource.clone(),
                    details,
                });
            }
            Some(_) => {}
        }
    }

    for id in &previous.order {
        if next.resources.contains_key(id) {
            continue;
        }
        if let Some(old) = previous.resources.get(id) {
            changes.push(ResourceChange {
                resource_id: id.clone(),
                change_type: ChangeType::Delete,
                resource: old.clone(),
                details: describe(old),
            });
        }
    }

    changes
}

fn describe(resource: &Resource) -> HashMap<String, serde_json::Value> {
    let mut details = HashMap::new();
    details.insert("name".to_string(), serde_json::json!(resource.name));
    details.insert(
        "resource_type".to_string(),
        serde_json::json!(resource.resource_type),
    );
    if !resource.region.is_empty() {
        details.insert("region".to_string(), serde_json::json!(resource.region));
    }
    details
}

/// Sorted top-level field names whose values differ
fn changed_fields(old: &Resource, new: &Resource) -> Vec<String> {
    let old = serde_json::to_value(old).unwrap_or_default();
    let new = serde_json::to_value(new).unwrap_or_default();

    let (Some(old), Some(new)) = (old.as_object(), new.as_object()) else {
        return Vec::new();
    };

    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    keys.into_iter()
        .filter(|key| old.get(*key) != new.get(*key))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(id: &str) -> Resource {
        Resource::new(id, "compute.instance").with_region("us-east-1")
    }

    #[tokio::test]
    async fn test_first_listing_seeds_silently() {
        let detector = ChangeDetector::new();
        let changes = detector.detect_changes("aws", vec![vm("a"), vm("b")]).await;

        assert!(changes.is_empty());
        assert_eq!(detector.snapshot("aws").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let detector = ChangeDetector::new();
        detector.detect_changes("aws", vec![vm("a"), vm("b")]).await;

        let changes = detector.detect_changes("aws", vec![vm("b"), vm("c")]).await;

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].resource_id, "c");
        assert_eq!(changes[0].change_type, ChangeType::Create);
        assert_eq!(changes[1].resource_id, "a");
        assert_eq!(changes[1].change_type, ChangeType::Delete);
    }

    #[tokio::test]
    async fn test_update_reports_changed_fields() {
        let detector = ChangeDetector::new();
        detector.detect_changes("aws", vec![vm("a"), vm("b")]).await;

        let modified = vm("b").with_tag("env", "prod");
        let changes = detector
            .detect_changes("aws", vec![modified, vm("c")])
            .await;

        let update = changes
            .iter()
            .find(|c| c.change_type == ChangeType::Update)
            .unwrap();
        assert_eq!(update.resource_id, "b");
        assert_eq!(update.details["changed_fields"], serde_json::json!(["tags"]));
        assert_eq!(changes.len(), 3);
    }

    #[tokio::test]
    async fn test_identical_listing_yields_nothing() {
        let detector = ChangeDetector::new();
        detector.detect_changes("gcp", vec![vm("a")]).await;

        assert!(detector.detect_changes("gcp", vec![vm("a")]).await.is_empty());
    }

    #[tokio::test]
    async fn test_providers_are_independent() {
        let detector = ChangeDetector::new();
        detector.detect_changes("aws", vec![vm("a")]).await;
        detector.detect_changes("azure", vec![vm("x")]).await;

        let changes = detector.detect_changes("azure", vec![]).await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].resource_id, "x");

        assert_eq!(detector.snapshot("aws").await.unwrap().len(), 1);
        assert_eq!(detector.providers().await, vec!["aws", "azure"]);
    }

    #[tokio::test]
    async fn test_forget_reseeds() {
        let detector = ChangeDetector::new();
        detector.detect_changes("aws", vec![vm("a")]).await;
        assert!(detector.forget("aws").await);

        assert!(detector.detect_changes("aws", vec![vm("b")]).await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_ids_last_wins() {
        let detector = ChangeDetector::new();
        let first = vm("a").with_tag("v", "1");
        let second = vm("a").with_tag("v", "2");
        detector.detect_changes("aws", vec![first, second]).await;

        let snapshot = detector.snapshot("aws").await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("a").unwrap().tags["v"], "2");
    }
}
