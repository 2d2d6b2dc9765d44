//! Per-connection session context.
//!
//! The host server owns authentication and connection lifecycle; the pipeline
//! consumes sessions through this narrow surface: authorization state, the
//! authenticated identity, keyed scratch data (where the subscription rate
//! counter lives), best-effort termination, and an [`AccountRepository`]
//! handle for the one persistent side effect the pipeline performs.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::RepositoryError;
use crate::stanza::{BareJid, Jid};

/// Persistence layer for account status, owned by the host.
pub trait AccountRepository: Send + Sync {
    /// Mark an account enabled/disabled. Must be idempotent.
    fn set_account_disabled(&self, user: &BareJid, disabled: bool) -> Result<(), RepositoryError>;
}

/// In-memory [`AccountRepository`] for tests and embedding without storage.
#[derive(Debug, Default)]
pub struct MemoryAccountRepository {
    disabled: DashMap<BareJid, bool>,
}

impl MemoryAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_disabled(&self, user: &BareJid) -> bool {
        self.disabled.get(user).map(|v| *v).unwrap_or(false)
    }
}

impl AccountRepository for MemoryAccountRepository {
    fn set_account_disabled(&self, user: &BareJid, disabled: bool) -> Result<(), RepositoryError> {
        self.disabled.insert(user.clone(), disabled);
        Ok(())
    }
}

type ScratchMap = HashMap<&'static str, Arc<dyn Any + Send + Sync>>;

/// Mutable per-connection context handed to every filter invocation.
///
/// One session processes one stanza at a time per connection, but admin and
/// maintenance paths may touch it concurrently, so all interior state is
/// synchronized.
pub struct Session {
    connection: crate::stanza::ConnectionId,
    identity: Option<Jid>,
    authorized: bool,
    accounts: Option<Arc<dyn AccountRepository>>,
    scratch: Mutex<ScratchMap>,
    terminated: AtomicBool,
    termination_reason: Mutex<Option<String>>,
}

impl Session {
    /// A session that has not authenticated yet.
    pub fn anonymous(connection: crate::stanza::ConnectionId) -> Self {
        Self {
            connection,
            identity: None,
            authorized: false,
            accounts: None,
            scratch: Mutex::new(HashMap::new()),
            terminated: AtomicBool::new(false),
            termination_reason: Mutex::new(None),
        }
    }

    /// An authorized session bound to an authenticated identity.
    pub fn authorized(
        connection: crate::stanza::ConnectionId,
        identity: Jid,
        accounts: Arc<dyn AccountRepository>,
    ) -> Self {
        Self {
            connection,
            identity: Some(identity),
            authorized: true,
            accounts: Some(accounts),
            scratch: Mutex::new(HashMap::new()),
            terminated: AtomicBool::new(false),
            termination_reason: Mutex::new(None),
        }
    }

    pub fn connection_id(&self) -> crate::stanza::ConnectionId {
        self.connection
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    /// The authenticated identity, if any.
    pub fn identity(&self) -> Option<&Jid> {
        self.identity.as_ref()
    }

    pub fn bare_identity(&self) -> Option<BareJid> {
        self.identity.as_ref().map(Jid::to_bare)
    }

    /// Whether `user` is this session's own authenticated identity.
    pub fn is_own_identity(&self, user: &BareJid) -> bool {
        self.authorized && self.identity.as_ref().is_some_and(|jid| jid.bare() == user)
    }

    pub fn account_repository(&self) -> Option<&Arc<dyn AccountRepository>> {
        self.accounts.as_ref()
    }

    /// Fetch typed scratch data under `key`, inserting it lazily.
    ///
    /// Returns a fresh value (and logs) if an existing entry has a different
    /// type, which would mean two components chose the same key.
    pub fn scratch_or_insert_with<T, F>(&self, key: &'static str, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut scratch = self.scratch.lock();
        if let Some(existing) = scratch.get(key) {
            match existing.clone().downcast::<T>() {
                Ok(value) => return value,
                Err(_) => {
                    tracing::warn!(key, "session scratch entry has unexpected type, replacing");
                }
            }
        }
        let value = Arc::new(init());
        scratch.insert(key, value.clone() as Arc<dyn Any + Send + Sync>);
        value
    }

    /// Request termination of this session.
    ///
    /// Best-effort and idempotent: the host observes the flag and closes the
    /// connection; if the session is already gone this is a no-op.
    pub fn terminate(&self, reason: &str) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.termination_reason.lock() = Some(reason.to_string());
    }

    pub fn termination_requested(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn termination_reason(&self) -> Option<String> {
        self.termination_reason.lock().clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection", &self.connection)
            .field("identity", &self.identity)
            .field("authorized", &self.authorized)
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::ConnectionId;

    #[test]
    fn scratch_data_is_created_once() {
        let session = Session::anonymous(ConnectionId(1));
        let a = session.scratch_or_insert_with::<u64, _>("counter", || 42);
        let b = session.scratch_or_insert_with::<u64, _>("counter", || 7);
        assert_eq!(*a, 42);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn terminate_is_idempotent() {
        let session = Session::anonymous(ConnectionId(2));
        assert!(!session.termination_requested());
        session.terminate("policy-violation");
        session.terminate("other-reason");
        assert!(session.termination_requested());
        assert_eq!(
            session.termination_reason().as_deref(),
            Some("policy-violation")
        );
    }

    #[test]
    fn own_identity_requires_authorization() {
        let repo = Arc::new(MemoryAccountRepository::new());
        let jid: Jid = "alice@example.com/home".parse().unwrap();
        let bare = jid.to_bare();

        let session = Session::authorized(ConnectionId(3), jid, repo);
        assert!(session.is_own_identity(&bare));

        let anon = Session::anonymous(ConnectionId(4));
        assert!(!anon.is_own_identity(&bare));
    }
}
