use super::{
    DiagnosisRecord, Resolution, RootCauseDescription, Ticket, TicketBook, TicketKey,
    TicketManager, TicketState, Workflow, WorkflowAction, WorkflowStatus,
};
use crate::error::{Error, Result};
use crate::observation::FaultObservation;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

const MAX_CONFLICT_RETRIES: usize = 5;

/// Persistence for per-node ticket books with optimistic concurrency.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Loads the node's book and an opaque version for the next save
    async fn load(&self, node: &str) -> Result<(TicketBook, Option<String>)>;

    /// Writes the book; returns `false` when `version` is stale
    async fn save(&self, node: &str, book: &TicketBook, version: Option<String>) -> Result<bool>;
}

/// [`TicketManager`] over any [`TicketStore`]
pub struct StoredTicketManager<S> {
    store: S,
    history_depth: usize,
}

impl<S: TicketStore> StoredTicketManager<S> {
    pub fn new(store: S, history_depth: usize) -> Self {
        Self {
            store,
            history_depth,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn read<R>(&self, node: &str, f: impl FnOnce(&TicketBook) -> R + Send) -> Result<R> {
        let (book, _) = self.store.load(node).await?;
        Ok(f(&book))
    }

    /// Load, apply, save; reapplies `f` on a version conflict
    async fn mutate<R: Send>(
        &self,
        node: &str,
        mut f: impl FnMut(&mut TicketBook) -> Result<R> + Send,
    ) -> Result<R> {
        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let (mut book, version) = self.store.load(node).await?;
            let out = f(&mut book)?;
            if self.store.save(node, &book, version).await? {
                return Ok(out);
            }
            debug!(node = %node, attempt, "Ticket book changed underneath us, retrying");
        }
        Err(Error::TicketError(format!(
            "gave up writing tickets for {node} after {MAX_CONFLICT_RETRIES} conflicts"
        )))
    }
}

#[async_trait]
impl<S: TicketStore> TicketManager for StoredTicketManager<S> {
    async fn check_ticket_exists(&self, key: &TicketKey) -> Result<bool> {
        self.read(&key.node, |book| book.get(key).is_some()).await
    }

    async fn open_families(&self, node: &str) -> Result<Vec<String>> {
        self.read(node, |book| book.open.keys().cloned().collect())
            .await
    }

    async fn get_ticket(&self, key: &TicketKey) -> Result<Option<Ticket>> {
        self.read(&key.node, |book| book.get(key).cloned()).await
    }

    async fn create_ticket(&self, key: &TicketKey, title: &str) -> Result<()> {
        let created = self
            .mutate(&key.node, |book| Ok(book.create(key, None, title, Utc::now())))
            .await?;
        if created {
            info!(ticket = %key, "🎫 Created ticket: {}", title);
        }
        Ok(())
    }

    async fn create_component_ticket(
        &self,
        key: &TicketKey,
        component: &str,
        title: &str,
    ) -> Result<()> {
        let created = self
            .mutate(&key.node, |book| {
                Ok(book.create(key, Some(component), title, Utc::now()))
            })
            .await?;
        if created {
            info!(ticket = %key, component, "🎫 Created component ticket: {}", title);
        }
        Ok(())
    }

    async fn adopt_ticket(&self, key: &TicketKey) -> Result<()> {
        self.mutate(&key.node, |book| book.adopt(key, Utc::now()))
            .await
    }

    async fn add_root_cause_description(
        &self,
        key: &TicketKey,
        status: &FaultObservation,
    ) -> Result<usize> {
        self.mutate(&key.node, |book| book.add_root_cause(key, status, Utc::now()))
            .await
    }

    async fn get_root_cause_description(&self, key: &TicketKey) -> Result<RootCauseDescription> {
        self.read(&key.node, |book| {
            book.get(key)
                .map(|t| t.root_cause.clone())
                .unwrap_or_default()
        })
        .await
    }

    async fn add_why_sre(&self, key: &TicketKey, why: &str) -> Result<()> {
        self.mutate(&key.node, |book| {
            let ticket = book.get_mut(key)?;
            ticket.why_sre.push(why.to_string());
            ticket.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn add_conclusion(&self, key: &TicketKey, conclusion: &str) -> Result<()> {
        self.mutate(&key.node, |book| {
            let ticket = book.get_mut(key)?;
            ticket.conclusion = Some(conclusion.to_string());
            ticket.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn add_diagnosis(&self, key: &TicketKey, records: &[DiagnosisRecord]) -> Result<()> {
        self.mutate(&key.node, |book| book.add_diagnosis(key, records, Utc::now()))
            .await
    }

    async fn add_workflow(
        &self,
        key: &TicketKey,
        action: WorkflowAction,
        status: WorkflowStatus,
        message: Option<&str>,
    ) -> Result<()> {
        self.mutate(&key.node, |book| {
            book.add_workflow(key, action, status, message, Utc::now())
        })
        .await
    }

    async fn update_workflow(
        &self,
        key: &TicketKey,
        action: WorkflowAction,
        status: WorkflowStatus,
        message: Option<&str>,
    ) -> Result<()> {
        self.mutate(&key.node, |book| {
            book.update_workflow(key, action, status, message, Utc::now())
        })
        .await
    }

    async fn get_workflows(&self, key: &TicketKey) -> Result<Vec<Workflow>> {
        self.read(&key.node, |book| {
            book.get(key).map(|t| t.workflows.clone()).unwrap_or_default()
        })
        .await
    }

    async fn get_action_count(&self, key: &TicketKey, action: WorkflowAction) -> Result<usize> {
        self.read(&key.node, |book| book.action_count(key, action))
            .await
    }

    async fn is_frequent_issue(
        &self,
        key: &TicketKey,
        last_n: usize,
        threshold: usize,
    ) -> Result<bool> {
        self.read(&key.node, |book| book.is_frequent(key, last_n, threshold))
            .await
    }

    async fn dispatch_ticket_to_sre(&self, key: &TicketKey) -> Result<()> {
        self.mutate(&key.node, |book| book.dispatch_to_sre(key, Utc::now()))
            .await?;
        warn!(ticket = %key, "🚨 Ticket dispatched to SRE");
        Ok(())
    }

    async fn resolve_ticket(&self, key: &TicketKey, reason: &str, message: &str) -> Result<()> {
        let depth = self.history_depth;
        self.mutate(&key.node, |book| {
            book.finish(
                key,
                TicketState::Resolved,
                Some(Resolution {
                    reason: reason.to_string(),
                    message: message.to_string(),
                }),
                depth,
                Utc::now(),
            )
        })
        .await?;
        info!(ticket = %key, reason, "✅ Ticket resolved");
        Ok(())
    }

    async fn close_ticket(&self, key: &TicketKey) -> Result<()> {
        let depth = self.history_depth;
        self.mutate(&key.node, |book| {
            book.finish(key, TicketState::Closed, None, depth, Utc::now())
        })
        .await?;
        info!(ticket = %key, "Ticket closed");
        Ok(())
    }

    async fn add_shutdown_description(&self, key: &TicketKey, description: &str) -> Result<()> {
        self.mutate(&key.node, |book| {
            let ticket = book.get_mut(key)?;
            ticket.shutdown_description = Some(description.to_string());
            ticket.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn update_shutdown_description(
        &self,
        key: &TicketKey,
        description: &str,
    ) -> Result<()> {
        self.mutate(&key.node, |book| {
            let ticket = book.get_mut(key)?;
            let text = match ticket.shutdown_description.take() {
                Some(existing) => format!("{existing}\n{description}"),
                None => description.to_string(),
            };
            ticket.shutdown_description = Some(text);
            ticket.updated_at = Utc::now();
            Ok(())
        })
        .await
    }
}

/// Process-local [`TicketStore`]
#[derive(Default)]
pub struct MemoryStore {
    books: Mutex<HashMap<String, (TicketBook, u64)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a node's book
    pub fn book(&self, node: &str) -> TicketBook {
        self.books
            .lock()
            .map(|books| books.get(node).map(|(b, _)| b.clone()).unwrap_or_default())
            .unwrap_or_default()
    }

    /// Replaces a node's book
    pub fn seed(&self, node: &str, book: TicketBook) {
        if let Ok(mut books) = self.books.lock() {
            let version = books.get(node).map_or(0, |(_, v)| v + 1);
            books.insert(node.to_string(), (book, version));
        }
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn load(&self, node: &str) -> Result<(TicketBook, Option<String>)> {
        let books = self
            .books
            .lock()
            .map_err(|_| Error::TicketError("ticket store lock poisoned".to_string()))?;
        Ok(match books.get(node) {
            Some((book, version)) => (book.clone(), Some(version.to_string())),
            None => (TicketBook::default(), None),
        })
    }

    async fn save(&self, node: &str, book: &TicketBook, version: Option<String>) -> Result<bool> {
        let mut books = self
            .books
            .lock()
            .map_err(|_| Error::TicketError("ticket store lock poisoned".to_string()))?;
        let current = books.get(node).map(|(_, v)| v.to_string());
        if current != version {
            return Ok(false);
        }
        let next = books.get(node).map_or(0, |(_, v)| v + 1);
        books.insert(node.to_string(), (book.clone(), next));
        Ok(true)
    }
}

impl StoredTicketManager<MemoryStore> {
    pub fn in_memory(history_depth: usize) -> Self {
        StoredTicketManager::new(MemoryStore::new(), history_depth)
    }
}
