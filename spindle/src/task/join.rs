use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::task::TaskNode;

/// Resolves once a task is terminal.
///
/// This is the raw wait: it never starts a lazy task and never checks the
/// caller for cancellation. Public joins wrap it in a suspension point.
#[derive(Debug)]
pub(crate) struct Join {
    node: Arc<TaskNode>,
}

impl Join {
    pub(crate) fn new(node: Arc<TaskNode>) -> Self {
        Self { node }
    }
}

impl Future for Join {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.node.poll_terminal(cx)
    }
}
