use crate::handler::Handler;

/// Registry entry: how to build a fresh handler instance for one chain.
pub struct HandlerDescriptor<C> {
    /// Name phases refer to.
    pub name: &'static str,
    /// One-line description shown in startup logs.
    pub description: &'static str,
    /// Factory invoked once per chain.
    pub build: fn() -> Handler<C>,
}

impl<C> Clone for HandlerDescriptor<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            build: self.build,
        }
    }
}

impl<C> std::fmt::Debug for HandlerDescriptor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}
