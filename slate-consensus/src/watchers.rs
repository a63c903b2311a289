//! One-shot callback registry keyed by operation id.
//!
//! The replica state keeps two of these: one fired as the replicated
//! watermark advances, one fired per-op as applies complete. Callbacks are
//! dispatched on the shared callback pool and therefore never run under the
//! replica state lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use slate_core::CallbackPool;

use crate::error::ConsensusResult;
use crate::opid::OpId;

/// A one-shot completion callback for a watched operation.
///
/// Invoked with `Ok(())` when the watermark is reached, or with an error
/// when the operation is abandoned (e.g. aborted during shutdown).
pub type OpCallback = Box<dyn FnOnce(ConsensusResult<()>) + Send + 'static>;

/// Which registered callbacks a watermark advance releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkMode {
    /// Fire only the callbacks registered at exactly this op id.
    OnlyThisOp,
    /// Fire every callback registered at or below this op id, in id order.
    AllOpsBefore,
}

/// Registry of one-shot callbacks keyed by an ordered operation id.
pub struct OpIdWatcherSet {
    pool: Arc<CallbackPool>,
    watchers: BTreeMap<OpId, Vec<OpCallback>>,
}

impl OpIdWatcherSet {
    /// Creates an empty watcher set dispatching on the given pool.
    #[must_use]
    pub fn new(pool: Arc<CallbackPool>) -> Self {
        Self {
            pool,
            watchers: BTreeMap::new(),
        }
    }

    /// Registers a callback to fire when `op_id` reaches the watermark.
    ///
    /// Never fires the callback synchronously; multiple callbacks may be
    /// registered against the same id and fire in registration order.
    pub fn register(&mut self, op_id: OpId, callback: OpCallback) {
        self.watchers.entry(op_id).or_default().push(callback);
    }

    /// Returns the number of ids with registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    /// Returns true if no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Fires and removes the callbacks selected by `mode`, completing each
    /// with `Ok(())` on the callback pool.
    ///
    /// With [`MarkMode::AllOpsBefore`], eligible callbacks fire in ascending
    /// op-id order. Each callback fires at most once.
    pub fn mark_finished(&mut self, op_id: OpId, mode: MarkMode) {
        match mode {
            MarkMode::OnlyThisOp => {
                if let Some(callbacks) = self.watchers.remove(&op_id) {
                    self.dispatch(callbacks);
                }
            }
            MarkMode::AllOpsBefore => {
                // Split at the successor: everything <= op_id is released.
                let remaining = self
                    .watchers
                    .split_off(&op_id.next_in_term());
                let released = std::mem::replace(&mut self.watchers, remaining);
                for (_, callbacks) in released {
                    self.dispatch(callbacks);
                }
            }
        }
    }

    fn dispatch(&self, callbacks: Vec<OpCallback>) {
        for callback in callbacks {
            self.pool.submit(move || callback(Ok(())));
        }
    }
}

impl std::fmt::Debug for OpIdWatcherSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpIdWatcherSet")
            .field("watched_ops", &self.watchers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use slate_core::{CountdownLatch, LogIndex, TermId};

    use super::*;

    fn op(term: u64, index: u64) -> OpId {
        OpId::new(TermId::new(term), LogIndex::new(index))
    }

    struct Recorder {
        fired: Mutex<Vec<(OpId, bool)>>,
        latch: CountdownLatch,
    }

    impl Recorder {
        fn new(expected: u64) -> Arc<Self> {
            Arc::new(Self {
                fired: Mutex::new(Vec::new()),
                latch: CountdownLatch::new(expected),
            })
        }

        fn wait(&self) -> Vec<(OpId, bool)> {
            self.latch.wait();
            self.fired.lock().unwrap().clone()
        }
    }

    fn callback(recorder: &Arc<Recorder>, id: OpId) -> OpCallback {
        let recorder = Arc::clone(recorder);
        Box::new(move |result| {
            recorder.fired.lock().unwrap().push((id, result.is_ok()));
            recorder.latch.count_down();
        })
    }

    #[test]
    fn test_mark_only_this_op() {
        let pool = Arc::new(CallbackPool::single());
        let mut set = OpIdWatcherSet::new(Arc::clone(&pool));
        let recorder = Recorder::new(1);

        set.register(op(1, 1), callback(&recorder, op(1, 1)));
        set.register(op(1, 2), callback(&recorder, op(1, 2)));

        set.mark_finished(op(1, 1), MarkMode::OnlyThisOp);

        assert_eq!(recorder.wait(), vec![(op(1, 1), true)]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_mark_only_this_op_without_watcher_is_noop() {
        let pool = Arc::new(CallbackPool::single());
        let mut set = OpIdWatcherSet::new(pool);
        set.mark_finished(op(3, 3), MarkMode::OnlyThisOp);
        assert!(set.is_empty());
    }

    #[test]
    fn test_mark_all_ops_before_fires_in_order() {
        let pool = Arc::new(CallbackPool::single());
        let mut set = OpIdWatcherSet::new(Arc::clone(&pool));
        let recorder = Recorder::new(3);

        // Register out of order; firing must be in op-id order.
        set.register(op(1, 3), callback(&recorder, op(1, 3)));
        set.register(op(1, 1), callback(&recorder, op(1, 1)));
        set.register(op(1, 2), callback(&recorder, op(1, 2)));
        set.register(op(1, 5), callback(&recorder, op(1, 5)));

        set.mark_finished(op(1, 3), MarkMode::AllOpsBefore);

        assert_eq!(
            recorder.wait(),
            vec![(op(1, 1), true), (op(1, 2), true), (op(1, 3), true)]
        );
        // The watcher above the threshold stays registered.
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_watchers_fire_at_most_once() {
        let pool = Arc::new(CallbackPool::single());
        let mut set = OpIdWatcherSet::new(Arc::clone(&pool));
        let recorder = Recorder::new(1);

        set.register(op(1, 1), callback(&recorder, op(1, 1)));
        set.mark_finished(op(1, 1), MarkMode::AllOpsBefore);
        // A second advance past the same id must not re-fire.
        set.mark_finished(op(1, 2), MarkMode::AllOpsBefore);

        assert_eq!(recorder.wait(), vec![(op(1, 1), true)]);
    }

    #[test]
    fn test_mark_all_spans_terms() {
        let pool = Arc::new(CallbackPool::single());
        let mut set = OpIdWatcherSet::new(Arc::clone(&pool));
        let recorder = Recorder::new(2);

        set.register(op(1, 9), callback(&recorder, op(1, 9)));
        set.register(op(2, 1), callback(&recorder, op(2, 1)));
        set.register(op(2, 2), callback(&recorder, op(2, 2)));

        set.mark_finished(op(2, 1), MarkMode::AllOpsBefore);

        assert_eq!(recorder.wait(), vec![(op(1, 9), true), (op(2, 1), true)]);
    }
}
