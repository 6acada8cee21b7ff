//! In-memory etcd membership.

use super::{Call, CallLog};
use crate::error::{OperatorError, OperatorResult};
use crate::etcd::{EtcdAdmin, EtcdMember, TlsContext};
use async_trait::async_trait;
use parking_lot::Mutex;

/// [`EtcdAdmin`] over an in-memory member list.
///
/// Ids are handed out sequentially from 1. Removing an unknown id fails with
/// [`OperatorError::MemberNotFound`], like etcd does.
pub struct MockEtcdAdmin {
    log: CallLog,
    members: Mutex<Vec<EtcdMember>>,
    next_id: Mutex<u64>,
    unreachable: Mutex<bool>,
}

impl MockEtcdAdmin {
    /// Empty membership recording into `log`.
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            members: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
            unreachable: Mutex::new(false),
        }
    }

    /// Register a started member directly. Returns its id.
    pub fn add_existing(&self, name: &str, peer_url: &str) -> u64 {
        let id = self.allocate_id();
        self.members.lock().push(EtcdMember {
            id,
            name: name.to_string(),
            peer_urls: vec![peer_url.to_string()],
        });
        id
    }

    /// Drop a member without recording a call.
    pub fn forget(&self, id: u64) {
        self.members.lock().retain(|m| m.id != id);
    }

    /// Make every call fail as if no endpoint answered.
    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock() = unreachable;
    }

    /// Current members.
    pub fn members(&self) -> Vec<EtcdMember> {
        self.members.lock().clone()
    }

    fn allocate_id(&self) -> u64 {
        let mut next = self.next_id.lock();
        let id = *next;
        *next += 1;
        id
    }

    fn check_reachable(&self) -> OperatorResult<()> {
        if *self.unreachable.lock() {
            return Err(OperatorError::EtcdError("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EtcdAdmin for MockEtcdAdmin {
    async fn list_members(
        &self,
        _endpoints: &[String],
        _tls: Option<&TlsContext>,
    ) -> OperatorResult<Vec<EtcdMember>> {
        self.log.record(Call::ListMembers);
        self.check_reachable()?;
        Ok(self.members())
    }

    async fn add_member(
        &self,
        _endpoints: &[String],
        _tls: Option<&TlsContext>,
        peer_url: &str,
    ) -> OperatorResult<u64> {
        self.log.record(Call::AddMember {
            peer_url: peer_url.to_string(),
        });
        self.check_reachable()?;
        let id = self.allocate_id();
        // etcd leaves the name empty until the member starts
        self.members.lock().push(EtcdMember {
            id,
            name: String::new(),
            peer_urls: vec![peer_url.to_string()],
        });
        Ok(id)
    }

    async fn remove_member(
        &self,
        _endpoints: &[String],
        _tls: Option<&TlsContext>,
        id: u64,
    ) -> OperatorResult<()> {
        self.log.record(Call::RemoveMember { id });
        self.check_reachable()?;
        let mut members = self.members.lock();
        let before = members.len();
        members.retain(|m| m.id != id);
        if members.len() == before {
            return Err(OperatorError::MemberNotFound(id));
        }
        Ok(())
    }
}
