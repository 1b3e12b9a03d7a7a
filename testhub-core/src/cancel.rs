// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cooperative cancellation.
//!
//! A [`CancellationSource`] owns the right to cancel; any number of
//! [`CancellationToken`]s observe it. A source may be linked to a parent
//! token, in which case its tokens also observe the parent.

use futures::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;
use tokio::sync::watch;

/// The cancelling side of a cancellation pair.
#[derive(Debug)]
pub struct CancellationSource {
    sender: Arc<watch::Sender<bool>>,
    parent: Option<CancellationToken>,
}

impl CancellationSource {
    /// Creates a new, uncancelled source.
    pub fn new() -> Self {
        Self {
            sender: Arc::new(watch::Sender::new(false)),
            parent: None,
        }
    }

    /// Creates a source whose tokens are also cancelled when `parent` is.
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            sender: Arc::new(watch::Sender::new(false)),
            parent: Some(parent.clone()),
        }
    }

    /// Cancels every token handed out by this source. Repeated calls are
    /// no-ops.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true if this source, or its parent, has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token().is_cancelled()
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> CancellationToken {
        let mut receivers = vec![self.sender.subscribe()];
        if let Some(parent) = &self.parent {
            receivers.extend(parent.receivers.iter().cloned());
        }
        CancellationToken {
            receivers: receivers.into(),
        }
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// The observing side of a cancellation pair.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    receivers: Arc<[watch::Receiver<bool>]>,
}

impl CancellationToken {
    /// Returns a token that is never cancelled.
    pub fn none() -> Self {
        Self {
            receivers: Arc::new([]),
        }
    }

    /// Returns true if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.receivers.iter().any(|rx| *rx.borrow())
    }

    /// Resolves once cancellation has been requested. Never resolves for a
    /// token whose sources were all dropped without cancelling.
    pub fn cancelled(&self) -> BoxFuture<'static, ()> {
        if self.receivers.is_empty() {
            return future::pending().boxed();
        }
        let waits = self.receivers.iter().cloned().map(|mut rx| {
            async move {
                let outcome = rx.wait_for(|cancelled| *cancelled).await.map(|_| ());
                if outcome.is_err() {
                    // The source was dropped without being cancelled.
                    future::pending::<()>().await;
                }
            }
            .boxed()
        });
        future::select_all(waits).map(|_| ()).boxed()
    }
}
