use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::RwLock;

use bytes::{Buf, BufMut};
use bytes_varint::VarIntSupportMut;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::revision_counter::RevisionCounter;
use crate::util::buf::{put_string, put_uuid, string_len, try_get_len_varint, try_get_string, try_get_uuid, varint_len};

/// A node's identity as it is announced to its peers
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identity {
    pub id: Uuid,
    pub revision: i32,
    pub name: String,
    pub attributes: BTreeMap<String, String>,
}

impl Identity {
    pub fn new(id: Uuid, name: impl Into<String>) -> Identity {
        Identity {
            id,
            revision: 0,
            name: name.into(),
            attributes: Default::default(),
        }
    }

    /// Placeholder for a peer whose announcement was not applied yet
    pub fn unknown(id: Uuid) -> Identity {
        Identity::new(id, "")
    }

    /// Apply another identity's state if the revision counter accepts its revision. Returns
    ///  `true` if the update was applied.
    pub fn update_from(&mut self, other: &Identity, revisions: &impl RevisionCounter) -> bool {
        if other.id != self.id {
            debug!("ignoring identity update for {} on identity {}", other.id, self.id);
            return false;
        }
        if !revisions.try_advance(other.revision) {
            trace!("ignoring stale identity revision {} for {}", other.revision, self.id);
            return false;
        }

        self.revision = other.revision;
        self.name.clone_from(&other.name);
        self.attributes.clone_from(&other.attributes);
        true
    }

    pub fn serialized_len(&self) -> usize {
        16 + std::mem::size_of::<i32>()
            + string_len(&self.name)
            + varint_len(self.attributes.len() as u64)
            + self.attributes.iter()
                .map(|(k, v)| string_len(k) + string_len(v))
                .sum::<usize>()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_uuid(buf, self.id);
        buf.put_i32(self.revision);
        put_string(buf, &self.name);
        buf.put_usize_varint(self.attributes.len());
        for (k, v) in &self.attributes {
            put_string(buf, k);
            put_string(buf, v);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Identity> {
        let id = try_get_uuid(buf)?;
        let revision = buf.try_get_i32()?;
        let name = try_get_string(buf)?;

        let num_attributes = try_get_len_varint(buf)?;
        let mut attributes = BTreeMap::new();
        for _ in 0..num_attributes {
            let key = try_get_string(buf)?;
            let value = try_get_string(buf)?;
            attributes.insert(key, value);
        }

        Ok(Identity {
            id,
            revision,
            name,
            attributes,
        })
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.revision)?;
        if !self.name.is_empty() {
            write!(f, "({})", self.name)?;
        }
        Ok(())
    }
}

/// Source of the identity the local node announces
pub trait LocalIdentityProvider: Send + Sync {
    fn local_identity(&self) -> Identity;
}

/// The local node's identity. Every change bumps the revision so that peers accept the update.
pub struct LocalIdentity {
    identity: RwLock<Identity>,
}

impl LocalIdentity {
    pub fn new(identity: Identity) -> LocalIdentity {
        LocalIdentity {
            identity: RwLock::new(identity),
        }
    }

    /// a fresh random node id without attributes
    pub fn random(name: impl Into<String>) -> LocalIdentity {
        LocalIdentity::new(Identity::new(Uuid::new_v4(), name))
    }

    pub fn id(&self) -> Uuid {
        self.identity.read().unwrap().id
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.update(|identity| {
            identity.attributes.insert(key.into(), value.into());
        });
    }

    pub fn remove_attribute(&self, key: &str) {
        self.update(|identity| {
            identity.attributes.remove(key);
        });
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.update(|identity| identity.name = name.into());
    }

    fn update(&self, f: impl FnOnce(&mut Identity)) {
        let mut identity = self.identity.write().unwrap();
        f(&mut identity);
        identity.revision = identity.revision.wrapping_add(1);
        debug!("local identity changed: {}", identity);
    }
}

impl LocalIdentityProvider for LocalIdentity {
    fn local_identity(&self) -> Identity {
        self.identity.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use crate::revision_counter::RevisionCounterImpl;
    use super::*;

    fn identity_with_attributes() -> Identity {
        let mut result = Identity::new(Uuid::new_v4(), "node-a");
        result.revision = -3;
        result.attributes.insert("role".to_string(), "cache".to_string());
        result.attributes.insert("zone".to_string(), "ä".to_string());
        result
    }

    #[test]
    fn test_ser_deser() {
        let identity = identity_with_attributes();

        let mut buf = BytesMut::new();
        identity.ser(&mut buf);
        assert_eq!(buf.len(), identity.serialized_len());

        let mut deser_buf: &[u8] = &buf;
        assert_eq!(Identity::deser(&mut deser_buf).unwrap(), identity);
        assert!(deser_buf.is_empty());
    }

    #[test]
    fn test_deser_truncated() {
        let identity = identity_with_attributes();
        let mut buf = BytesMut::new();
        identity.ser(&mut buf);

        let mut deser_buf: &[u8] = &buf[..buf.len() - 1];
        assert!(Identity::deser(&mut deser_buf).is_err());
    }

    #[test]
    fn test_update_from() {
        let id = Uuid::new_v4();
        let revisions = RevisionCounterImpl::new();
        let mut identity = Identity::unknown(id);

        let mut update = Identity::new(id, "b");
        update.revision = 5;
        update.attributes.insert("x".to_string(), "1".to_string());
        assert!(identity.update_from(&update, &revisions));
        assert_eq!(identity, update);

        let mut stale = update.clone();
        stale.revision = 4;
        stale.name = "stale".to_string();
        assert!(!identity.update_from(&stale, &revisions));
        assert_eq!(identity, update);
    }

    #[test]
    fn test_update_from_other_node_is_ignored() {
        let revisions = RevisionCounterImpl::new();
        let mut identity = Identity::unknown(Uuid::new_v4());
        let other = Identity::new(Uuid::new_v4(), "other");

        assert!(!identity.update_from(&other, &revisions));
        assert_eq!(revisions.current(), None);
    }

    #[test]
    fn test_local_identity_bumps_revision() {
        let local = LocalIdentity::random("me");
        let before = local.local_identity();

        local.set_attribute("k", "v");
        let after = local.local_identity();
        assert_eq!(after.revision, before.revision + 1);
        assert_eq!(after.attributes.get("k").map(|s| s.as_str()), Some("v"));

        local.remove_attribute("k");
        local.set_name("renamed");
        let last = local.local_identity();
        assert_eq!(last.revision, before.revision + 3);
        assert!(last.attributes.is_empty());
        assert_eq!(last.name, "renamed");
        assert_eq!(last.id, local.id());
    }

    #[test]
    fn test_local_identity_revision_wraps() {
        let mut identity = Identity::new(Uuid::new_v4(), "");
        identity.revision = i32::MAX;
        let local = LocalIdentity::new(identity);

        local.set_name("wrapped");
        assert_eq!(local.local_identity().revision, i32::MIN);
    }
}
