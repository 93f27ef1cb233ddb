//! Resource registry: the node-global cache of advertised block/NIC/VFS/
//! compute resources (spec §4.F).
//!
//! `ResourceRegistry` tracks two things under one fixed-capacity table: the
//! resources *we* own and have advertised, and the resources every known
//! peer has advertised. It has no opinion about how ads reach the wire —
//! callers drive [`ResourceRegistry::advertise_local`]/
//! [`ResourceRegistry::withdraw_local`] when local resources come and go and
//! feed received `RESOURCE_ADVERT`/`RECONCILE_ACK` frames through
//! [`ResourceRegistry::on_advert`]/[`ResourceRegistry::replace_ads_for_owner`].

#![no_std]

extern crate alloc;

use alloc::vec::Vec;

use wki_abi::{NodeId, ResourceType};
use wki_lib::config::{MAX_RESOURCE_ADS, MAX_RESOURCE_NAME_LEN};
use wki_lib::IrqMutex;

/// Ad carries shareable semantics (multiple consumers may attach at once).
pub const FLAG_SHAREABLE: u8 = 0x01;
/// Ad's backing subsystem accepts passthrough attach, not just proxying.
pub const FLAG_PASSTHROUGH_CAPABLE: u8 = 0x02;
/// Set on the wire in place of a second message type: `RESOURCE_ADVERT`
/// carrying this bit is a withdrawal of a previously advertised resource,
/// not a fresh ad. Spec §4.F calls these "advert/withdraw" without naming a
/// second wire message, and the catalog has only one `RESOURCE_ADVERT`
/// type, so withdrawal reuses it with this bit set.
pub const FLAG_WITHDRAWN: u8 = 0x80;

/// One cached resource advertisement, local or remote.
#[derive(Debug, Clone, Copy)]
pub struct ResourceAd {
    pub owner_node: NodeId,
    pub resource_type: ResourceType,
    pub resource_id: u32,
    pub flags: u8,
    name: [u8; MAX_RESOURCE_NAME_LEN],
    name_len: u8,
}

impl ResourceAd {
    fn new(owner_node: NodeId, resource_type: ResourceType, resource_id: u32, flags: u8, name: &[u8]) -> Self {
        let mut buf = [0u8; MAX_RESOURCE_NAME_LEN];
        let len = name.len().min(MAX_RESOURCE_NAME_LEN);
        buf[..len].copy_from_slice(&name[..len]);
        Self {
            owner_node,
            resource_type,
            resource_id,
            flags,
            name: buf,
            name_len: len as u8,
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }

    pub fn is_shareable(&self) -> bool {
        self.flags & FLAG_SHAREABLE != 0
    }

    pub fn is_passthrough_capable(&self) -> bool {
        self.flags & FLAG_PASSTHROUGH_CAPABLE != 0
    }
}

struct ResourceTable {
    slots: [IrqMutex<Option<ResourceAd>>; MAX_RESOURCE_ADS],
    table_lock: IrqMutex<()>,
}

impl ResourceTable {
    fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| IrqMutex::new(None)),
            table_lock: IrqMutex::new(()),
        }
    }

    fn hash_index(owner_node: NodeId, resource_id: u32) -> usize {
        let h = (owner_node.0 as u32).wrapping_mul(0x9E37_79B9) ^ resource_id.wrapping_mul(0x85EB_CA6B);
        (h >> 8) as usize % MAX_RESOURCE_ADS
    }

    fn find(&self, owner_node: NodeId, resource_id: u32) -> Option<usize> {
        let start = Self::hash_index(owner_node, resource_id);
        for i in 0..MAX_RESOURCE_ADS {
            let idx = (start + i) % MAX_RESOURCE_ADS;
            if self.slots[idx]
                .lock()
                .as_ref()
                .is_some_and(|ad| ad.owner_node == owner_node && ad.resource_id == resource_id)
            {
                return Some(idx);
            }
        }
        None
    }

    /// Insert or overwrite in one step: ads are owner-chosen and
    /// unconditionally trusted (no sequence number to arbitrate, unlike
    /// LSAs), so a repeat advert just refreshes the cached copy.
    fn upsert(&self, ad: ResourceAd) -> bool {
        let _table_guard = self.table_lock.lock();
        if let Some(idx) = self.find(ad.owner_node, ad.resource_id) {
            *self.slots[idx].lock() = Some(ad);
            return false;
        }
        let start = Self::hash_index(ad.owner_node, ad.resource_id);
        for i in 0..MAX_RESOURCE_ADS {
            let idx = (start + i) % MAX_RESOURCE_ADS;
            let mut slot = self.slots[idx].lock();
            if slot.is_none() {
                *slot = Some(ad);
                return true;
            }
        }
        false
    }

    fn remove(&self, owner_node: NodeId, resource_id: u32) -> bool {
        match self.find(owner_node, resource_id) {
            Some(idx) => {
                *self.slots[idx].lock() = None;
                true
            }
            None => false,
        }
    }

    fn remove_all_owned_by(&self, owner_node: NodeId) -> Vec<ResourceAd> {
        let mut removed = Vec::new();
        for slot in &self.slots {
            let mut guard = slot.lock();
            let matches = guard.as_ref().is_some_and(|ad| ad.owner_node == owner_node);
            if matches {
                if let Some(ad) = guard.take() {
                    removed.push(ad);
                }
            }
        }
        removed
    }

    fn snapshot_owned_by(&self, owner_node: NodeId) -> Vec<ResourceAd> {
        let mut out = Vec::new();
        for slot in &self.slots {
            if let Some(ad) = slot.lock().as_ref() {
                if ad.owner_node == owner_node {
                    out.push(*ad);
                }
            }
        }
        out
    }

    fn get(&self, owner_node: NodeId, resource_id: u32) -> Option<ResourceAd> {
        self.find(owner_node, resource_id).and_then(|idx| *self.slots[idx].lock())
    }
}

pub struct ResourceRegistry {
    my_node_id: NodeId,
    ads: ResourceTable,
}

impl ResourceRegistry {
    pub fn new(my_node_id: NodeId) -> Self {
        Self {
            my_node_id,
            ads: ResourceTable::new(),
        }
    }

    /// Record a locally-owned resource and return `true` if this is a new
    /// ad the caller should broadcast via `RESOURCE_ADVERT` (a repeat of an
    /// already-known ad, e.g. on every Connected transition, still
    /// refreshes the cache but doesn't need a fresh broadcast).
    pub fn advertise_local(&self, resource_type: ResourceType, resource_id: u32, name: &[u8], flags: u8) -> bool {
        let ad = ResourceAd::new(self.my_node_id, resource_type, resource_id, flags, name);
        self.ads.upsert(ad)
    }

    /// Drop a locally-owned resource. The caller broadcasts `RESOURCE_ADVERT`
    /// with [`FLAG_WITHDRAWN`] set regardless of the return value — the
    /// withdrawal still needs to reach peers even if our own cache had
    /// already forgotten the ad.
    pub fn withdraw_local(&self, resource_id: u32) -> bool {
        self.ads.remove(self.my_node_id, resource_id)
    }

    /// Handle a received `RESOURCE_ADVERT`. Returns `true` if the cache
    /// changed (new ad stored, or a withdrawal removed one).
    pub fn on_advert(&self, owner_node: NodeId, resource_type: ResourceType, resource_id: u32, name: &[u8], flags: u8) -> bool {
        if owner_node == self.my_node_id {
            return false;
        }
        if flags & FLAG_WITHDRAWN != 0 {
            return self.ads.remove(owner_node, resource_id);
        }
        self.ads.upsert(ResourceAd::new(owner_node, resource_type, resource_id, flags, name));
        true
    }

    pub fn lookup(&self, owner_node: NodeId, resource_id: u32) -> Option<ResourceAd> {
        self.ads.get(owner_node, resource_id)
    }

    /// `DEV_ATTACH_REQ` step 1: look up a resource we ourselves host.
    pub fn lookup_local(&self, resource_id: u32) -> Option<ResourceAd> {
        self.ads.get(self.my_node_id, resource_id)
    }

    /// All ads we host, for building an outgoing `RECONCILE_ACK`.
    pub fn local_ads_snapshot(&self) -> Vec<ResourceAd> {
        self.ads.snapshot_owned_by(self.my_node_id)
    }

    /// Wholesale replace our cached view of `owner_node`'s ads with a
    /// received `RECONCILE_ACK`'s resource list.
    pub fn replace_ads_for_owner(&self, owner_node: NodeId, fresh: &[ResourceAd]) {
        self.ads.remove_all_owned_by(owner_node);
        for ad in fresh {
            self.ads.upsert(*ad);
        }
    }

    /// Fencing cascade step: drop every ad the fenced node originated.
    /// Returns what was removed so the caller can log/notify.
    pub fn invalidate_for_peer(&self, node_id: NodeId) -> Vec<ResourceAd> {
        self.ads.remove_all_owned_by(node_id)
    }
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertising_new_local_resource_reports_true_then_false_on_repeat() {
        let reg = ResourceRegistry::new(NodeId(1));
        assert!(reg.advertise_local(ResourceType::Block, 7, b"disk0", FLAG_SHAREABLE));
        assert!(!reg.advertise_local(ResourceType::Block, 7, b"disk0", FLAG_SHAREABLE));
        let ad = reg.lookup_local(7).unwrap();
        assert_eq!(ad.name(), b"disk0");
        assert!(ad.is_shareable());
    }

    #[test]
    fn withdraw_local_removes_the_ad() {
        let reg = ResourceRegistry::new(NodeId(1));
        reg.advertise_local(ResourceType::Net, 3, b"eth-remote", 0);
        assert!(reg.withdraw_local(3));
        assert!(reg.lookup_local(3).is_none());
        assert!(!reg.withdraw_local(3));
    }

    #[test]
    fn remote_advert_and_withdraw_round_trip() {
        let reg = ResourceRegistry::new(NodeId(1));
        assert!(reg.on_advert(NodeId(2), ResourceType::Vfs, 9, b"export", FLAG_SHAREABLE));
        assert!(reg.lookup(NodeId(2), 9).is_some());

        assert!(reg.on_advert(NodeId(2), ResourceType::Vfs, 9, b"", FLAG_WITHDRAWN));
        assert!(reg.lookup(NodeId(2), 9).is_none());
    }

    #[test]
    fn self_originated_advert_from_the_wire_is_ignored() {
        let reg = ResourceRegistry::new(NodeId(1));
        assert!(!reg.on_advert(NodeId(1), ResourceType::Block, 1, b"x", 0));
        assert!(reg.lookup(NodeId(1), 1).is_none());
    }

    #[test]
    fn fencing_invalidates_only_the_fenced_node_ads() {
        let reg = ResourceRegistry::new(NodeId(1));
        reg.on_advert(NodeId(2), ResourceType::Block, 1, b"a", 0);
        reg.on_advert(NodeId(2), ResourceType::Net, 2, b"b", 0);
        reg.on_advert(NodeId(3), ResourceType::Vfs, 3, b"c", 0);

        let removed = reg.invalidate_for_peer(NodeId(2));
        assert_eq!(removed.len(), 2);
        assert!(reg.lookup(NodeId(2), 1).is_none());
        assert!(reg.lookup(NodeId(2), 2).is_none());
        assert!(reg.lookup(NodeId(3), 3).is_some());
    }

    #[test]
    fn reconcile_replaces_cached_ads_for_owner_wholesale() {
        let reg = ResourceRegistry::new(NodeId(1));
        reg.on_advert(NodeId(2), ResourceType::Block, 1, b"stale", 0);

        let fresh = alloc::vec![ResourceAd::new(NodeId(2), ResourceType::Block, 2, FLAG_SHAREABLE, b"fresh")];
        reg.replace_ads_for_owner(NodeId(2), &fresh);

        assert!(reg.lookup(NodeId(2), 1).is_none());
        let ad = reg.lookup(NodeId(2), 2).unwrap();
        assert_eq!(ad.name(), b"fresh");
    }

    #[test]
    fn local_ads_snapshot_only_includes_resources_we_own() {
        let reg = ResourceRegistry::new(NodeId(1));
        reg.advertise_local(ResourceType::Block, 1, b"local-disk", 0);
        reg.on_advert(NodeId(2), ResourceType::Net, 2, b"remote-nic", 0);

        let local = reg.local_ads_snapshot();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].resource_id, 1);
    }
}
