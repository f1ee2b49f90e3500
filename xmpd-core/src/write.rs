//! Terminal chain handler that sends what earlier handlers produced.

use xmpd_common::error::XmpdResult;

use crate::chain::ChainControl;
use crate::handler::{ChainConnection, SyncHandler};
use crate::tree::Element;
use crate::value::ReturnValue;

/// Registry name phases use for [`WriteHandler`].
pub const WRITE_HANDLER: &str = "write";

/// Flushes the chain's text output, then the rendered last value, to the connection.
///
/// Returns an absent value so a following write handler does not resend the same payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteHandler;

impl<C: ChainConnection> SyncHandler<C> for WriteHandler {
    fn handle(
        &mut self,
        _stanza: &Element,
        chain: &mut ChainControl<C>,
        connection: &mut C,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        let mut data = chain.take_output();
        data.push_str(&last.render());
        if !data.is_empty() {
            connection.send(&data);
        }
        Ok(ReturnValue::Absent)
    }
}

#[cfg(test)]
mod tests {
    use crate::testkit::{TraceConnection, context};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn write_sends_buffered_output_then_last_value() {
        let mut connection = TraceConnection::default();
        let mut chain = context(&["buffer", "write"], &[]);

        let _ = chain.process(&mut connection);

        assert_that!(&connection.sent, elements_are![eq("<raw/><reply/>")]);
        assert_that!(chain.control().output(), eq(""));
    }

    #[rstest]
    fn write_with_nothing_to_send_stays_silent() {
        let mut connection = TraceConnection::default();
        let mut chain = context(&["write", "write"], &[]);

        let _ = chain.process(&mut connection);

        assert_that!(connection.sent.is_empty(), eq(true));
    }

    #[rstest]
    fn write_after_error_handler_sends_recovered_value() {
        let mut connection = TraceConnection::default();
        let mut chain = context(&["fail", "write"], &["recover"]);

        let _ = chain.process(&mut connection);

        assert_that!(&connection.sent, elements_are![eq("recovered")]);
    }
}
