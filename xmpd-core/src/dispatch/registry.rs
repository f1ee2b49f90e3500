use super::HandlerDescriptor;
use crate::containers::HotMap as HashMap;
use crate::handler::ChainLink;

/// Handler table keyed by name.
pub struct HandlerRegistry<C> {
    entries: HashMap<&'static str, HandlerDescriptor<C>>,
}

impl<C> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for HandlerRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.entries.keys().copied().collect::<Vec<_>>();
        names.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}

impl<C> HandlerRegistry<C> {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers or replaces one handler.
    pub fn register(&mut self, descriptor: HandlerDescriptor<C>) {
        let _ = self.entries.insert(descriptor.name, descriptor);
    }

    /// Returns `true` when `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Builds a fresh instance of handler `name`.
    #[must_use]
    pub fn instantiate(&self, name: &str) -> Option<ChainLink<C>> {
        self.entries.get(name).map(|descriptor| ChainLink {
            name: descriptor.name,
            handler: (descriptor.build)(),
        })
    }

    /// Registered descriptors sorted by name.
    #[must_use]
    pub fn descriptors(&self) -> Vec<&HandlerDescriptor<C>> {
        let mut descriptors = self.entries.values().collect::<Vec<_>>();
        descriptors.sort_unstable_by_key(|descriptor| descriptor.name);
        descriptors
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
