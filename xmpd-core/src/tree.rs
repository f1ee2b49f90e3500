//! Parsed stanza tree.
//!
//! Elements carry their resolved namespace rather than prefixes, so matching and rendering never
//! depend on how the peer spelled its namespace declarations.

use std::fmt::Write as _;

#[path = "tree/path.rs"]
mod path;

pub use path::{ElementPath, StanzaMatch};

/// One XML element with resolved namespace, attributes, children and text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    name: String,
    namespace: Option<String>,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    /// Creates an element without namespace. When rendered inside a parent it inherits the
    /// parent's namespace.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Creates an element in `namespace`.
    #[must_use]
    pub fn with_namespace(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    /// Adds or replaces one attribute.
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Appends one child.
    #[must_use]
    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// Replaces the text content.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Adds or replaces one attribute in place.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.attributes.iter_mut().find(|(name, _)| *name == key) {
            slot.1 = value;
        } else {
            self.attributes.push((key, value));
        }
    }

    /// Appends one child in place.
    pub fn push_child(&mut self, child: Element) {
        self.children.push(child);
    }

    /// Appends text content in place.
    pub fn push_text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    /// Local element name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved namespace.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Returns `true` when the element has this local name and namespace.
    #[must_use]
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    /// Attribute value by name.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    /// Attributes in document order.
    #[must_use]
    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    /// Concatenated character data directly inside this element.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Child elements in document order.
    #[must_use]
    pub fn children(&self) -> &[Element] {
        &self.children
    }

    /// Child by position.
    #[must_use]
    pub fn child(&self, index: usize) -> Option<&Element> {
        self.children.get(index)
    }

    /// First child element.
    #[must_use]
    pub fn first_child(&self) -> Option<&Element> {
        self.children.first()
    }

    /// Number of child elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Returns `true` when the element has no child elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// First descendant matching a relative path such as `{ns}query/item[@jid='a@b']`.
    ///
    /// An unparsable path matches nothing.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<&Element> {
        ElementPath::parse(path).ok()?.find_in(self)
    }

    /// Renders the element as XML text.
    #[must_use]
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, None);
        out
    }

    fn write_xml(&self, out: &mut String, parent_namespace: Option<&str>) {
        out.push('<');
        out.push_str(&self.name);
        let namespace = self.namespace.as_deref().or(parent_namespace);
        if let Some(namespace) = self.namespace.as_deref()
            && Some(namespace) != parent_namespace
        {
            let _ = write!(out, " xmlns='{}'", escape(namespace, true));
        }
        for (key, value) in &self.attributes {
            let _ = write!(out, " {key}='{}'", escape(value, true));
        }
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(&self.text, false));
        for child in &self.children {
            child.write_xml(out, namespace);
        }
        let _ = write!(out, "</{}>", self.name);
    }
}

/// Escapes character data, or attribute values when `attribute` is set.
#[must_use]
pub fn escape(text: &str, attribute: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' if attribute => out.push_str("&apos;"),
            '"' if attribute => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}
