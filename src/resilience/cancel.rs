// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cooperative cancellation shared by retry loops, lock refresh, and the
//! store maintenance loop.
//!
//! Built on a `tokio::sync::watch` channel. Cancellation halts further
//! attempts but lets in-flight calls settle: loops check the token between
//! attempts, never mid-call.

use tokio::sync::watch;

/// The owning side of a cancellation signal.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// A cheaply-cloneable token observed by loops.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelSource {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken { rx: self.tx.subscribe() }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that can never be cancelled, for callers without a lifecycle.
    #[must_use]
    pub fn never() -> Self {
        static NEVER: std::sync::OnceLock<CancelToken> = std::sync::OnceLock::new();
        NEVER
            .get_or_init(|| {
                let (tx, rx) = watch::channel(false);
                // One intentionally-leaked sender keeps the channel open
                // for every clone of this token.
                std::mem::forget(tx);
                CancelToken { rx }
            })
            .clone()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is signalled (or the source is dropped).
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        loop {
            if self.rx.changed().await.is_err() {
                // Source dropped: treat as cancelled so loops wind down.
                return;
            }
            if *self.rx.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_uncancelled() {
        let source = CancelSource::new();
        assert!(!source.token().is_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_observed() {
        let source = CancelSource::new();
        let mut token = source.token();
        source.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await; // resolves immediately
    }

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let source = CancelSource::new();
        let mut token = source.token();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        source.cancel();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_source_counts_as_cancelled() {
        let source = CancelSource::new();
        let mut token = source.token();
        drop(source);
        token.cancelled().await;
    }

    #[tokio::test]
    async fn never_token_stays_live() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
    }
}
