// SPDX-License-Identifier: MIT OR Apache-2.0
//! The index catalog: versioned physical indices behind stable aliases.
//!
//! Clients always address a stable alias; the alias points to exactly one
//! concrete versioned index. Alias swaps are atomic with respect to readers,
//! writes can be blocked per physical index, and reindexing runs as a
//! pollable background task with `conflicts=proceed` semantics (a document
//! whose destination copy is newer is skipped, not clobbered).

use crate::doc::ReferenceDoc;
use crate::index::{InvertedIndex, SearchHit};
use crate::query::{CandidateQuery, QueryStringQuery};
use refbase_error::{RepoError, RepoResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

struct Physical {
    index: InvertedIndex,
    write_blocked: bool,
}

#[derive(Default)]
struct EngineState {
    indices: HashMap<String, Physical>,
    aliases: HashMap<String, String>,
}

/// Progress of a reindex task.
#[derive(Debug, Clone, Default)]
pub struct ReindexStatus {
    /// Documents in the source snapshot.
    pub total: usize,
    /// Documents copied so far.
    pub transferred: usize,
    /// Documents skipped because the destination copy was newer.
    pub skipped: usize,
    /// Whether the task has finished.
    pub completed: bool,
}

/// Handle on a background reindex task.
pub struct ReindexTask {
    status: Arc<StdMutex<ReindexStatus>>,
}

impl ReindexTask {
    /// Snapshot the task status.
    #[must_use]
    pub fn status(&self) -> ReindexStatus {
        self.status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Poll until the task completes.
    pub async fn wait(&self, poll_interval: Duration) -> ReindexStatus {
        loop {
            let status = self.status();
            if status.completed {
                return status;
            }
            debug!(
                target: "refbase.search.reindex",
                transferred = status.transferred,
                total = status.total,
                "reindex in progress"
            );
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// The search store: a catalog of physical indices plus alias routing.
pub struct SearchEngine {
    state: RwLock<EngineState>,
    sequence: AtomicU64,
}

impl Default for SearchEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchEngine {
    /// Create an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(EngineState::default()),
            sequence: AtomicU64::new(1),
        }
    }

    fn resolve_name(state: &EngineState, target: &str) -> RepoResult<String> {
        if let Some(physical) = state.aliases.get(target) {
            return Ok(physical.clone());
        }
        if state.indices.contains_key(target) {
            return Ok(target.to_string());
        }
        Err(RepoError::not_found("index", target))
    }

    // -----------------------------------------------------------------------
    // Catalog operations
    // -----------------------------------------------------------------------

    /// Create a physical index.
    pub async fn create_index(&self, name: &str) -> RepoResult<()> {
        let mut state = self.state.write().await;
        if state.indices.contains_key(name) {
            return Err(RepoError::integrity("index", format!("{name} already exists")));
        }
        state.indices.insert(
            name.to_string(),
            Physical {
                index: InvertedIndex::new(),
                write_blocked: false,
            },
        );
        info!(target: "refbase.search.catalog", index = name, "created index");
        Ok(())
    }

    /// Whether a physical index exists.
    pub async fn index_exists(&self, name: &str) -> bool {
        self.state.read().await.indices.contains_key(name)
    }

    /// Delete a physical index. Refused while any alias points at it.
    pub async fn delete_index(&self, name: &str) -> RepoResult<()> {
        let mut state = self.state.write().await;
        if !state.indices.contains_key(name) {
            return Err(RepoError::not_found("index", name));
        }
        if state.aliases.values().any(|target| target == name) {
            return Err(RepoError::conflict(format!(
                "index {name} still has aliases and cannot be deleted"
            )));
        }
        state.indices.remove(name);
        info!(target: "refbase.search.catalog", index = name, "deleted index");
        Ok(())
    }

    /// The physical index an alias points at, if any.
    pub async fn alias_target(&self, alias: &str) -> Option<String> {
        self.state.read().await.aliases.get(alias).cloned()
    }

    /// Attach an alias to a physical index.
    pub async fn put_alias(&self, index: &str, alias: &str) -> RepoResult<()> {
        let mut state = self.state.write().await;
        if !state.indices.contains_key(index) {
            return Err(RepoError::not_found("index", index));
        }
        state.aliases.insert(alias.to_string(), index.to_string());
        Ok(())
    }

    /// Detach an alias.
    pub async fn remove_alias(&self, alias: &str) -> RepoResult<()> {
        let mut state = self.state.write().await;
        state
            .aliases
            .remove(alias)
            .map(|_| ())
            .ok_or_else(|| RepoError::not_found("alias", alias))
    }

    /// Atomically move an alias from one physical index to another.
    ///
    /// Readers racing the swap see either the old or the new target, never
    /// neither.
    pub async fn swap_alias(&self, alias: &str, from: &str, to: &str) -> RepoResult<()> {
        let mut state = self.state.write().await;
        if !state.indices.contains_key(to) {
            return Err(RepoError::not_found("index", to));
        }
        match state.aliases.get(alias) {
            Some(current) if current == from => {}
            Some(current) => {
                return Err(RepoError::conflict(format!(
                    "alias {alias} points at {current}, not {from}"
                )));
            }
            None => return Err(RepoError::not_found("alias", alias)),
        }
        state.aliases.insert(alias.to_string(), to.to_string());
        info!(target: "refbase.search.catalog", alias, from, to, "switched alias");
        Ok(())
    }

    /// Block writes to a physical index.
    pub async fn add_write_block(&self, index: &str) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let physical = state
            .indices
            .get_mut(index)
            .ok_or_else(|| RepoError::not_found("index", index))?;
        physical.write_blocked = true;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Document operations
    // -----------------------------------------------------------------------

    /// Insert or replace a document, addressing an alias or physical index.
    pub async fn upsert(&self, target: &str, mut doc: ReferenceDoc) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let name = Self::resolve_name(&state, target)?;
        let physical = state
            .indices
            .get_mut(&name)
            .ok_or_else(|| RepoError::not_found("index", &name))?;
        if physical.write_blocked {
            return Err(RepoError::SearchMalformed {
                detail: format!("index {name} is write-blocked"),
            });
        }
        doc.version = self.sequence.fetch_add(1, Ordering::Relaxed);
        physical.index.upsert(doc);
        Ok(())
    }

    /// Delete a document. Returns whether it existed.
    pub async fn delete_doc(&self, target: &str, id: Uuid) -> RepoResult<bool> {
        let mut state = self.state.write().await;
        let name = Self::resolve_name(&state, target)?;
        let physical = state
            .indices
            .get_mut(&name)
            .ok_or_else(|| RepoError::not_found("index", &name))?;
        if physical.write_blocked {
            return Err(RepoError::SearchMalformed {
                detail: format!("index {name} is write-blocked"),
            });
        }
        Ok(physical.index.delete(id))
    }

    /// Fetch a document.
    pub async fn get_doc(&self, target: &str, id: Uuid) -> RepoResult<Option<ReferenceDoc>> {
        let state = self.state.read().await;
        let name = Self::resolve_name(&state, target)?;
        Ok(state
            .indices
            .get(&name)
            .and_then(|p| p.index.get(id))
            .cloned())
    }

    /// Count documents.
    pub async fn count(&self, target: &str) -> RepoResult<usize> {
        let state = self.state.read().await;
        let name = Self::resolve_name(&state, target)?;
        Ok(state.indices.get(&name).map_or(0, |p| p.index.len()))
    }

    /// Run the deduplication candidate query.
    pub async fn search_candidates(
        &self,
        target: &str,
        query: &CandidateQuery,
    ) -> RepoResult<Vec<SearchHit>> {
        let state = self.state.read().await;
        let name = Self::resolve_name(&state, target)?;
        Ok(state
            .indices
            .get(&name)
            .map(|p| p.index.search_candidates(query))
            .unwrap_or_default())
    }

    /// Run a query-string search.
    pub async fn search_query_string(
        &self,
        target: &str,
        query: &QueryStringQuery,
    ) -> RepoResult<Vec<SearchHit>> {
        let state = self.state.read().await;
        let name = Self::resolve_name(&state, target)?;
        state
            .indices
            .get(&name)
            .map(|p| p.index.search_query_string(query))
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    // -----------------------------------------------------------------------
    // Reindex
    // -----------------------------------------------------------------------

    /// Start a background reindex from `source` into `dest`.
    ///
    /// `conflicts=proceed`: a document whose destination copy carries a newer
    /// version is skipped. The returned task is pollable.
    pub async fn start_reindex(
        self: &Arc<Self>,
        source: &str,
        dest: &str,
    ) -> RepoResult<ReindexTask> {
        let (ids, total) = {
            let state = self.state.read().await;
            let source_name = Self::resolve_name(&state, source)?;
            let _ = Self::resolve_name(&state, dest)?;
            let physical = state
                .indices
                .get(&source_name)
                .ok_or_else(|| RepoError::not_found("index", source))?;
            let ids: Vec<Uuid> = physical.index.docs().map(|d| d.id).collect();
            let total = ids.len();
            (ids, total)
        };

        let status = Arc::new(StdMutex::new(ReindexStatus {
            total,
            ..ReindexStatus::default()
        }));
        let task_status = Arc::clone(&status);
        let engine = Arc::clone(self);
        let source = source.to_string();
        let dest = dest.to_string();

        tokio::spawn(async move {
            const CHUNK: usize = 100;
            for chunk in ids.chunks(CHUNK) {
                let mut state = engine.state.write().await;
                let Ok(source_name) = Self::resolve_name(&state, &source) else {
                    break;
                };
                let Ok(dest_name) = Self::resolve_name(&state, &dest) else {
                    break;
                };
                let mut copies = Vec::new();
                if let Some(source_physical) = state.indices.get(&source_name) {
                    for id in chunk {
                        if let Some(doc) = source_physical.index.get(*id) {
                            copies.push(doc.clone());
                        }
                    }
                }
                let mut transferred = 0;
                let mut skipped = 0;
                if let Some(dest_physical) = state.indices.get_mut(&dest_name) {
                    for doc in copies {
                        let newer_exists = dest_physical
                            .index
                            .get(doc.id)
                            .is_some_and(|existing| existing.version >= doc.version);
                        if newer_exists {
                            skipped += 1;
                        } else {
                            dest_physical.index.upsert(doc);
                            transferred += 1;
                        }
                    }
                }
                drop(state);
                if let Ok(mut s) = task_status.lock() {
                    s.transferred += transferred;
                    s.skipped += skipped;
                }
                tokio::task::yield_now().await;
            }
            if let Ok(mut s) = task_status.lock() {
                s.completed = true;
            }
        });

        Ok(ReindexTask { status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(title: &str) -> ReferenceDoc {
        let mut d = ReferenceDoc::minimal(Uuid::new_v4());
        d.title = Some(title.to_string());
        d
    }

    #[tokio::test]
    async fn alias_routing_and_atomic_swap() {
        let engine = Arc::new(SearchEngine::new());
        engine.create_index("reference_v1").await.unwrap();
        engine.create_index("reference_v2").await.unwrap();
        engine.put_alias("reference_v1", "reference").await.unwrap();

        engine.upsert("reference", doc("via alias")).await.unwrap();
        assert_eq!(engine.count("reference_v1").await.unwrap(), 1);

        engine
            .swap_alias("reference", "reference_v1", "reference_v2")
            .await
            .unwrap();
        engine.upsert("reference", doc("after swap")).await.unwrap();
        assert_eq!(engine.count("reference_v2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn swap_requires_expected_current_target() {
        let engine = SearchEngine::new();
        engine.create_index("reference_v1").await.unwrap();
        engine.create_index("reference_v2").await.unwrap();
        engine.put_alias("reference_v1", "reference").await.unwrap();
        let err = engine
            .swap_alias("reference", "reference_v2", "reference_v1")
            .await
            .unwrap_err();
        assert_eq!(err.status(), 409);
    }

    #[tokio::test]
    async fn delete_refused_while_aliased() {
        let engine = SearchEngine::new();
        engine.create_index("reference_v1").await.unwrap();
        engine.put_alias("reference_v1", "reference").await.unwrap();
        assert!(engine.delete_index("reference_v1").await.is_err());
        engine.remove_alias("reference").await.unwrap();
        engine.delete_index("reference_v1").await.unwrap();
    }

    #[tokio::test]
    async fn write_block_rejects_writes() {
        let engine = SearchEngine::new();
        engine.create_index("reference_v1").await.unwrap();
        engine.add_write_block("reference_v1").await.unwrap();
        let err = engine.upsert("reference_v1", doc("x")).await.unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn reindex_copies_and_skips_newer() {
        let engine = Arc::new(SearchEngine::new());
        engine.create_index("reference_v1").await.unwrap();
        engine.create_index("reference_v2").await.unwrap();

        let mut shared = doc("shared");
        let shared_id = shared.id;
        engine.upsert("reference_v1", shared.clone()).await.unwrap();
        engine.upsert("reference_v1", doc("only in v1")).await.unwrap();

        // A fresher copy of the shared doc already lives in v2.
        shared.title = Some("fresher copy".into());
        engine.upsert("reference_v2", shared).await.unwrap();

        let task = engine
            .start_reindex("reference_v1", "reference_v2")
            .await
            .unwrap();
        let status = task.wait(Duration::from_millis(5)).await;
        assert!(status.completed);
        assert_eq!(status.total, 2);
        assert_eq!(status.transferred, 1);
        assert_eq!(status.skipped, 1);

        let kept = engine
            .get_doc("reference_v2", shared_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.title.as_deref(), Some("fresher copy"));
        assert_eq!(engine.count("reference_v2").await.unwrap(), 2);
    }
}
