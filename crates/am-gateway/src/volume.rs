use std::collections::HashMap;
use std::sync::RwLock;

use am_types::{AmError, VolumeDescriptor, VolumeId};

/// Volumes attached to this gateway.
#[derive(Debug, Default)]
pub struct VolumeTable {
    volumes: RwLock<HashMap<VolumeId, VolumeDescriptor>>,
}

impl VolumeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `descriptor`. Re-attaching an identical descriptor is a
    /// duplicate; a different one under the same id is rejected.
    pub fn insert(&self, descriptor: VolumeDescriptor) -> Result<(), AmError> {
        let mut volumes = self.volumes.write().expect("volume table poisoned");
        match volumes.get(&descriptor.id) {
            Some(existing) if *existing == descriptor => {
                Err(AmError::Duplicate(format!("volume {}", descriptor.id)))
            }
            Some(existing) => Err(AmError::InvalidArgument(format!(
                "volume {} is already attached as {:?}",
                existing.id, existing.name
            ))),
            None => {
                volumes.insert(descriptor.id, descriptor);
                Ok(())
            }
        }
    }

    pub fn remove(&self, id: VolumeId) -> Option<VolumeDescriptor> {
        self.volumes.write().expect("volume table poisoned").remove(&id)
    }

    /// Descriptor of an attached volume.
    pub fn get(&self, id: VolumeId) -> Result<VolumeDescriptor, AmError> {
        self.volumes
            .read()
            .expect("volume table poisoned")
            .get(&id)
            .cloned()
            .ok_or(AmError::VolumeNotActivated(id))
    }

    pub fn object_size(&self, id: VolumeId) -> Result<u32, AmError> {
        self.get(id).map(|d| d.object_size)
    }

    pub fn ids(&self) -> Vec<VolumeId> {
        let mut ids: Vec<_> = self
            .volumes
            .read()
            .expect("volume table poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.volumes.read().expect("volume table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_lookup_detach() {
        let table = VolumeTable::new();
        table.insert(VolumeDescriptor::new(VolumeId(2), "logs").with_object_size(64)).unwrap();
        table.insert(VolumeDescriptor::new(VolumeId(1), "photos")).unwrap();
        assert_eq!(table.object_size(VolumeId(2)).unwrap(), 64);
        assert_eq!(table.ids(), vec![VolumeId(1), VolumeId(2)]);
        assert!(table.remove(VolumeId(2)).is_some());
        assert_eq!(table.get(VolumeId(2)), Err(AmError::VolumeNotActivated(VolumeId(2))));
    }

    #[test]
    fn reattach_is_duplicate_or_conflict() {
        let table = VolumeTable::new();
        let desc = VolumeDescriptor::new(VolumeId(1), "photos");
        table.insert(desc.clone()).unwrap();
        assert!(matches!(table.insert(desc), Err(AmError::Duplicate(_))));
        assert!(matches!(
            table.insert(VolumeDescriptor::new(VolumeId(1), "other")),
            Err(AmError::InvalidArgument(_))
        ));
        assert_eq!(table.len(), 1);
    }
}
