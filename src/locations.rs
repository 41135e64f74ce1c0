use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::MAX_LOCATION_DEPTH;

/// Source of the location hierarchy (clinic → ward → room ...).
#[async_trait]
pub trait LocationDirectory: Send + Sync {
    async fn child_locations(&self, location_id: Ulid) -> Result<Vec<Ulid>, EngineError>;
}

/// In-memory parent → children map.
#[derive(Default)]
pub struct LocationTree {
    children: DashMap<Ulid, Vec<Ulid>>,
}

impl LocationTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_child(&self, parent_id: Ulid, child_id: Ulid) {
        let mut kids = self.children.entry(parent_id).or_default();
        if !kids.contains(&child_id) {
            kids.push(child_id);
        }
    }

    pub fn remove_child(&self, parent_id: &Ulid, child_id: &Ulid) {
        if let Some(mut kids) = self.children.get_mut(parent_id) {
            kids.retain(|c| c != child_id);
        }
    }
}

#[async_trait]
impl LocationDirectory for LocationTree {
    async fn child_locations(&self, location_id: Ulid) -> Result<Vec<Ulid>, EngineError> {
        Ok(self
            .children
            .get(&location_id)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }
}

/// Every location below `root` (not including `root`). Walks an explicit
/// worklist; locations already seen are skipped, so cycles terminate.
pub async fn location_descendants(
    directory: &dyn LocationDirectory,
    root: Ulid,
) -> Result<HashSet<Ulid>, EngineError> {
    let mut visited = HashSet::from([root]);
    let mut descendants = HashSet::new();
    let mut worklist = vec![(root, 0usize)];

    while let Some((location, depth)) = worklist.pop() {
        if depth >= MAX_LOCATION_DEPTH {
            return Err(EngineError::LimitExceeded("location hierarchy too deep"));
        }
        let children = directory
            .child_locations(location)
            .await
            .map_err(|e| e.context(format!("listing children of location {location}")))?;
        for child in children {
            if visited.insert(child) {
                descendants.insert(child);
                worklist.push((child, depth + 1));
            }
        }
    }
    Ok(descendants)
}

/// `root` plus all of its descendants.
pub async fn location_and_descendants(
    directory: &dyn LocationDirectory,
    root: Ulid,
) -> Result<HashSet<Ulid>, EngineError> {
    let mut all = location_descendants(directory, root).await?;
    all.insert(root);
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unreachable;

    #[async_trait]
    impl LocationDirectory for Unreachable {
        async fn child_locations(&self, _: Ulid) -> Result<Vec<Ulid>, EngineError> {
            Err(EngineError::WalError("directory offline".into()))
        }
    }

    #[tokio::test]
    async fn collects_all_levels() {
        let tree = LocationTree::new();
        let hospital = Ulid::new();
        let ward = Ulid::new();
        let room_a = Ulid::new();
        let room_b = Ulid::new();
        tree.add_child(hospital, ward);
        tree.add_child(ward, room_a);
        tree.add_child(ward, room_b);

        let found = location_descendants(&tree, hospital).await.unwrap();
        assert_eq!(found, HashSet::from([ward, room_a, room_b]));

        let leaf = location_descendants(&tree, room_a).await.unwrap();
        assert!(leaf.is_empty());
    }

    #[tokio::test]
    async fn cycle_terminates() {
        let tree = LocationTree::new();
        let a = Ulid::new();
        let b = Ulid::new();
        tree.add_child(a, b);
        tree.add_child(b, a);

        let found = location_descendants(&tree, a).await.unwrap();
        assert_eq!(found, HashSet::from([b]));
    }

    #[tokio::test]
    async fn depth_limit_enforced() {
        let tree = LocationTree::new();
        let root = Ulid::new();
        let mut cur = root;
        for _ in 0..=MAX_LOCATION_DEPTH {
            let next = Ulid::new();
            tree.add_child(cur, next);
            cur = next;
        }
        let result = location_descendants(&tree, root).await;
        assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
    }

    #[tokio::test]
    async fn directory_errors_carry_context() {
        let root = Ulid::new();
        let err = location_descendants(&Unreachable, root).await.unwrap_err();
        assert!(matches!(err.root(), EngineError::WalError(_)));
        assert!(err.to_string().contains(&root.to_string()));
    }

    #[tokio::test]
    async fn remove_child_prunes_subtree() {
        let tree = LocationTree::new();
        let root = Ulid::new();
        let child = Ulid::new();
        tree.add_child(root, child);
        tree.add_child(root, child);
        tree.remove_child(&root, &child);
        let all = location_and_descendants(&tree, root).await.unwrap();
        assert_eq!(all, HashSet::from([root]));
    }
}
