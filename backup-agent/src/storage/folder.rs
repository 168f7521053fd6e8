//! Find-or-create resolution of named folders.

use super::ObjectStore;
use crate::utils::Result;
use tracing::{debug, info};

/// Returns the ID of the folder called `name` under `parent`, creating it when
/// the store has none.
///
/// The lookup and the create are separate calls, so two resolvers running at
/// the same time can both create the folder. The agent runs one job at a time,
/// which keeps this from happening in practice. When several folders match,
/// the first one the store returns is used.
pub async fn resolve_or_create_folder(
    store: &dyn ObjectStore,
    name: &str,
    parent: Option<&str>,
) -> Result<String> {
    let existing = store.find_folders(name, parent).await?;
    if let Some(folder) = existing.into_iter().next() {
        debug!(folder = %name, id = %folder.id, "Found existing folder");
        return Ok(folder.id);
    }

    let created = store.create_folder(name, parent).await?;
    info!(folder = %name, id = %created.id, parent = parent.unwrap_or("<root>"), "Created folder");
    Ok(created.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let store = MemoryStore::new();

        let first = resolve_or_create_folder(&store, "example-site", Some("root")).await.unwrap();
        let second = resolve_or_create_folder(&store, "example-site", Some("root")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.folder_creates(), 1);
    }

    #[tokio::test]
    async fn test_same_name_under_different_parents() {
        let store = MemoryStore::new();

        let a = resolve_or_create_folder(&store, "site", Some("root-a")).await.unwrap();
        let b = resolve_or_create_folder(&store, "site", Some("root-b")).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(store.folder_creates(), 2);
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let store = MemoryStore::new();
        let first = store.insert_folder("dup", Some("root"));
        store.insert_folder("dup", Some("root"));

        let resolved = resolve_or_create_folder(&store, "dup", Some("root")).await.unwrap();
        assert_eq!(resolved, first);
        assert_eq!(store.folder_creates(), 0);
    }

    #[tokio::test]
    async fn test_without_parent_matches_anywhere() {
        let store = MemoryStore::new();
        let existing = store.insert_folder("site", Some("elsewhere"));

        let resolved = resolve_or_create_folder(&store, "site", None).await.unwrap();
        assert_eq!(resolved, existing);
    }

    #[tokio::test]
    async fn test_query_failure_propagates() {
        let store = MemoryStore::new();
        store.fail_queries();

        let err = resolve_or_create_folder(&store, "site", Some("root")).await.unwrap_err();
        assert!(matches!(err, crate::utils::BackupError::RemoteApi { .. }));
        assert_eq!(store.folder_creates(), 0);
    }
}
