use crate::error::{PciError, Result};
use crate::pool::{is_alignment_mask, ResourceClass};

/// One per-class request (or, once allocated, grant) exchanged with the host bridge.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ResourceDescriptor {
    pub class: ResourceClass,
    /// Zero in a request.
    pub base: u64,
    pub length: u64,
    /// Alignment mask (`size - 1`).
    pub alignment: u64,
}

impl ResourceDescriptor {
    pub const fn request(class: ResourceClass, length: u64, alignment: u64) -> Self {
        Self {
            class,
            base: 0,
            length,
            alignment,
        }
    }
}

/// Growable list of typed descriptors, built by appending.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DescriptorList {
    descriptors: Vec<ResourceDescriptor>,
}

impl DescriptorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, descriptor: ResourceDescriptor) -> &mut Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn with(mut self, class: ResourceClass, length: u64, alignment: u64) -> Self {
        self.push(ResourceDescriptor::request(class, length, alignment));
        self
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.descriptors.iter()
    }

    pub fn get(&self, class: ResourceClass) -> Option<&ResourceDescriptor> {
        self.descriptors.iter().find(|d| d.class == class)
    }

    /// Rejects a list naming a class twice or carrying an alignment that is not `2^n - 1`.
    pub fn validate(&self) -> Result<()> {
        for (i, descriptor) in self.descriptors.iter().enumerate() {
            if !is_alignment_mask(descriptor.alignment) {
                return Err(PciError::InvalidRequest("alignment is not a power-of-two mask"));
            }
            if self.descriptors[..i]
                .iter()
                .any(|earlier| earlier.class == descriptor.class)
            {
                return Err(PciError::InvalidRequest("resource class listed twice"));
            }
        }
        Ok(())
    }
}

impl FromIterator<ResourceDescriptor> for DescriptorList {
    fn from_iter<T: IntoIterator<Item = ResourceDescriptor>>(iter: T) -> Self {
        Self {
            descriptors: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a DescriptorList {
    type Item = &'a ResourceDescriptor;
    type IntoIter = core::slice::Iter<'a, ResourceDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.iter()
    }
}
