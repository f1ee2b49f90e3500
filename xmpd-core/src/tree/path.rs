use xmpd_common::error::{XmpdError, XmpdResult};

use super::Element;

/// One `/`-separated step: `local`, `{namespace}local` or `*`, with an optional
/// `[@attr]` / `[@attr='value']` predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    namespace: Option<String>,
    name: Option<String>,
    attribute: Option<(String, Option<String>)>,
}

impl Segment {
    fn parse(text: &str) -> XmpdResult<Self> {
        let invalid = || XmpdError::Protocol(format!("invalid path segment '{text}'"));
        let mut rest = text.trim();

        let namespace = if let Some(qualified) = rest.strip_prefix('{') {
            let end = qualified.find('}').ok_or_else(invalid)?;
            rest = &qualified[end + 1..];
            Some(qualified[..end].to_owned())
        } else {
            None
        };

        let (name, predicate) = match rest.find('[') {
            Some(open) => (&rest[..open], Some(&rest[open..])),
            None => (rest, None),
        };
        if name.is_empty() {
            return Err(invalid());
        }
        let name = (name != "*").then(|| name.to_owned());

        let attribute = match predicate {
            None => None,
            Some(predicate) => {
                let inner = predicate
                    .strip_prefix("[@")
                    .and_then(|inner| inner.strip_suffix(']'))
                    .ok_or_else(invalid)?;
                match inner.split_once('=') {
                    None => Some((inner.trim().to_owned(), None)),
                    Some((key, value)) => {
                        let value = value.trim();
                        let unquoted = value
                            .strip_prefix('\'')
                            .and_then(|value| value.strip_suffix('\''))
                            .or_else(|| {
                                value
                                    .strip_prefix('"')
                                    .and_then(|value| value.strip_suffix('"'))
                            })
                            .ok_or_else(invalid)?;
                        Some((key.trim().to_owned(), Some(unquoted.to_owned())))
                    }
                }
            }
        };

        Ok(Self {
            namespace,
            name,
            attribute,
        })
    }

    fn matches(&self, element: &Element) -> bool {
        if let Some(name) = self.name.as_deref()
            && name != element.name()
        {
            return false;
        }
        if let Some(namespace) = self.namespace.as_deref()
            && Some(namespace) != element.namespace()
        {
            return false;
        }
        match &self.attribute {
            None => true,
            Some((key, None)) => element.get(key).is_some(),
            Some((key, Some(value))) => element.get(key) == Some(value.as_str()),
        }
    }
}

/// Compiled relative path evaluated against an element's descendants.
///
/// Unqualified segments match elements in any namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementPath {
    source: String,
    segments: Vec<Segment>,
}

impl ElementPath {
    /// Compiles a path.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Protocol` for an empty path or a malformed segment.
    pub fn parse(path: &str) -> XmpdResult<Self> {
        let segments = split_segments(path)
            .into_iter()
            .map(Segment::parse)
            .collect::<XmpdResult<Vec<_>>>()?;
        if segments.is_empty() {
            return Err(XmpdError::Protocol("empty element path".to_owned()));
        }
        Ok(Self {
            source: path.to_owned(),
            segments,
        })
    }

    /// Path text as configured.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First descendant of `root` reached by this path.
    #[must_use]
    pub fn find_in<'a>(&self, root: &'a Element) -> Option<&'a Element> {
        walk(root, &self.segments)
    }
}

/// Structural predicate for a whole stanza: the first segment matches the stanza element
/// itself, the remaining segments its descendants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaMatch {
    path: ElementPath,
}

impl StanzaMatch {
    /// Compiles a stanza predicate such as `{jabber:client}iq[@type='get']/{jabber:iq:roster}query`.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`ElementPath::parse`].
    pub fn parse(path: &str) -> XmpdResult<Self> {
        Ok(Self {
            path: ElementPath::parse(path)?,
        })
    }

    /// Predicate text as configured.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.path.as_str()
    }

    /// Returns `true` when the stanza has the configured shape.
    #[must_use]
    pub fn matches(&self, stanza: &Element) -> bool {
        let Some((first, rest)) = self.path.segments.split_first() else {
            return false;
        };
        first.matches(stanza) && walk(stanza, rest).is_some()
    }
}

fn walk<'a>(element: &'a Element, segments: &[Segment]) -> Option<&'a Element> {
    let Some((segment, rest)) = segments.split_first() else {
        return Some(element);
    };
    element
        .children()
        .iter()
        .filter(|child| segment.matches(child))
        .find_map(|child| walk(child, rest))
}

/// Splits on `/` outside of `{namespace}` and `[predicate]` groups.
fn split_segments(path: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut depth = 0_usize;
    let mut start = 0;
    for (index, ch) in path.char_indices() {
        match ch {
            '{' | '[' => depth += 1,
            '}' | ']' => depth = depth.saturating_sub(1),
            '/' if depth == 0 => {
                segments.push(&path[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    if start < path.len() {
        segments.push(&path[start..]);
    }
    segments
}
