use xmpd_common::error::{XmpdError, XmpdResult};

use crate::tree::{Element, StanzaMatch};

/// Phase used when neither a known phase nor any matcher applies.
pub const DEFAULT_PHASE: &str = "default";

/// Named processing phase: an optional stanza matcher plus the handler chain it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    name: String,
    matcher: Option<StanzaMatch>,
    handlers: Vec<String>,
    error_handlers: Vec<String>,
}

impl Phase {
    /// Creates a phase with no matcher and an empty chain.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            matcher: None,
            handlers: Vec::new(),
            error_handlers: Vec::new(),
        }
    }

    /// Adds a structural matcher.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::InvalidConfig` when the path does not compile.
    pub fn matching(mut self, path: &str) -> XmpdResult<Self> {
        let matcher = StanzaMatch::parse(path).map_err(|error| {
            XmpdError::InvalidConfig(format!("phase '{}' matcher: {error}", self.name))
        })?;
        self.matcher = Some(matcher);
        Ok(self)
    }

    /// Sets the normal handler chain.
    #[must_use]
    pub fn with_handlers(mut self, names: &[&str]) -> Self {
        self.handlers = names.iter().map(|name| (*name).to_owned()).collect();
        self
    }

    /// Sets the error handler chain, paired positionally with the normal one.
    #[must_use]
    pub fn with_error_handlers(mut self, names: &[&str]) -> Self {
        self.error_handlers = names.iter().map(|name| (*name).to_owned()).collect();
        self
    }

    /// Phase name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Structural matcher, if any.
    #[must_use]
    pub const fn matcher(&self) -> Option<&StanzaMatch> {
        self.matcher.as_ref()
    }

    /// Normal handler names in chain order.
    #[must_use]
    pub fn handlers(&self) -> &[String] {
        &self.handlers
    }

    /// Error handler names in chain order.
    #[must_use]
    pub fn error_handlers(&self) -> &[String] {
        &self.error_handlers
    }

    /// Returns `true` when this phase's matcher accepts the stanza.
    #[must_use]
    pub fn matches(&self, stanza: &Element) -> bool {
        self.matcher
            .as_ref()
            .is_some_and(|matcher| matcher.matches(stanza))
    }
}

/// Ordered set of phases. Matchers are tried in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTable {
    name: &'static str,
    phases: Vec<Phase>,
}

impl PhaseTable {
    /// Creates an empty table.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            phases: Vec::new(),
        }
    }

    /// Appends a phase.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::InvalidConfig` when the name is already taken.
    pub fn with_phase(mut self, phase: Phase) -> XmpdResult<Self> {
        if self.get(phase.name()).is_some() {
            return Err(XmpdError::InvalidConfig(format!(
                "{} table already has phase '{}'",
                self.name,
                phase.name()
            )));
        }
        self.phases.push(phase);
        Ok(self)
    }

    /// Table label used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Phases in insertion order.
    #[must_use]
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Phase by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|phase| phase.name() == name)
    }

    /// Chooses the phase for a stanza.
    ///
    /// A known phase that exists wins; otherwise the first matching phase; otherwise
    /// [`DEFAULT_PHASE`]. Returns `None` only when no default phase is configured.
    #[must_use]
    pub fn select(&self, stanza: &Element, known_phase: Option<&str>) -> Option<&Phase> {
        if let Some(known) = known_phase
            && let Some(phase) = self.get(known)
        {
            return Some(phase);
        }
        self.phases
            .iter()
            .find(|phase| phase.matches(stanza))
            .or_else(|| self.get(DEFAULT_PHASE))
    }
}
