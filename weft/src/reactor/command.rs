use super::node::ResultState;
use super::core::Node;

use std::sync::Arc;

/// Messages handed to a multiplexer loop thread.
pub(crate) enum Command<C> {
    /// A node another thread unregistered; the loop thread delivers its
    /// result after finishing the current event batch.
    Release {
        node: Arc<Node<C>>,
        state: ResultState,
    },
    Shutdown,
}
