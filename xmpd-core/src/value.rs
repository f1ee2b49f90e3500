//! Values passed from one handler to the next.

use xmpd_common::error::XmpdError;

use crate::tree::Element;

/// One piece of handler output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Pre-rendered XML text.
    Text(String),
    /// Element rendered when the chain writes its output.
    Element(Element),
}

impl Payload {
    /// Renders the payload as XML text.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Element(element) => element.to_xml(),
        }
    }
}

impl From<Element> for Payload {
    fn from(element: Element) -> Self {
        Self::Element(element)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Last return value threaded through a chain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReturnValue {
    /// Nothing produced yet.
    #[default]
    Absent,
    /// A single payload.
    Value(Payload),
    /// Several payloads accumulated by consecutive handlers.
    List(Vec<Payload>),
    /// A handler failed; the paired error handler sees this value.
    Error(XmpdError),
}

impl ReturnValue {
    /// Returns `true` for the error variant.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Error carried by this value.
    #[must_use]
    pub const fn error(&self) -> Option<&XmpdError> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }

    /// Appends `payload` to this value, keeping earlier output.
    ///
    /// An absent value becomes the payload itself; an error value is replaced.
    #[must_use]
    pub fn chained(&self, payload: impl Into<Payload>) -> Self {
        let payload = payload.into();
        match self {
            Self::Absent | Self::Error(_) => Self::Value(payload),
            Self::Value(previous) => Self::List(vec![previous.clone(), payload]),
            Self::List(items) => {
                let mut items = items.clone();
                items.push(payload);
                Self::List(items)
            }
        }
    }

    /// Payloads in order. Errors and absent values contribute nothing.
    #[must_use]
    pub fn payloads(&self) -> &[Payload] {
        match self {
            Self::Value(payload) => std::slice::from_ref(payload),
            Self::List(items) => items,
            Self::Absent | Self::Error(_) => &[],
        }
    }

    /// Renders every payload and concatenates the results.
    #[must_use]
    pub fn render(&self) -> String {
        self.payloads().iter().map(Payload::render).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Payload, ReturnValue};
    use crate::tree::Element;
    use googletest::prelude::*;
    use rstest::rstest;
    use xmpd_common::error::XmpdError;

    #[rstest]
    fn chained_accumulates_in_order() {
        let value = ReturnValue::Absent
            .chained(Payload::Text("<a/>".to_owned()))
            .chained(Element::new("b"))
            .chained("<c/>".to_owned());

        assert_that!(value.payloads().len(), eq(3_usize));
        assert_that!(value.render().as_str(), eq("<a/><b/><c/>"));
    }

    #[rstest]
    fn chained_replaces_error() {
        let value = ReturnValue::Error(XmpdError::Handler("boom".to_owned()))
            .chained(Element::new("recovered"));
        assert_that!(&value, eq(&ReturnValue::Value(Payload::Element(Element::new("recovered")))));
    }

    #[rstest]
    #[case(ReturnValue::Absent, false)]
    #[case(ReturnValue::Value(Payload::Text(String::new())), false)]
    #[case(ReturnValue::Error(XmpdError::Job("x".to_owned())), true)]
    fn error_classification(#[case] value: ReturnValue, #[case] expected: bool) {
        assert_that!(value.is_error(), eq(expected));
        assert_that!(value.render().as_str(), eq(""));
    }
}
