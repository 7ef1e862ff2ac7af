use crate::tree::NodeId;

/// Location of a module inside nested instances: every element but the last
/// names a module whose sub-structure holds the next instance; the last
/// element is the module itself.
pub(crate) type ModulePath = Vec<NodeId>;

/// Modules waiting for a recursive search at one hierarchy level.
#[derive(Debug, Clone, Default)]
pub(crate) struct PartitionQueue {
    pub level: u32,
    pub num_non_trivial_modules: usize,
    pub flow: f64,
    pub non_trivial_flow: f64,
    pub skip: bool,
    pub index_codelength: f64,
    pub leaf_codelength: f64,
    pub module_codelength: f64,
    pub modules: Vec<ModulePath>,
}

impl PartitionQueue {
    pub fn with_level(level: u32) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Moves the content of `other` into `self`, leaving `other` empty.
    pub fn swap(&mut self, other: &mut PartitionQueue) {
        std::mem::swap(self, other);
    }

    /// Re-roots paths from a nested instance under the module at `owner`.
    pub fn prefixed(mut self, owner: &[NodeId]) -> Self {
        for path in self.modules.iter_mut() {
            let mut full = Vec::with_capacity(owner.len() + path.len());
            full.extend_from_slice(owner);
            full.append(path);
            *path = full;
        }
        self
    }
}
