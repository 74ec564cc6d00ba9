use std::collections::VecDeque;

use roomkit_protocol::Op;

/// Default bound on how many undo/redo entries are retained (spec.md §4.4).
pub const DEFAULT_MAX_DEPTH: usize = 50;

/// One editable step: the ops that performed the edit, and the ops that
/// undo it. Undo applies `inverse` and moves the entry to the redo stack;
/// redo applies `forward` and moves it back. Each application relabels its
/// ops with freshly minted ids before sending — the stored `op_id`s were
/// already transmitted once and must never go out again (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
struct Entry {
    forward: Vec<Op>,
    inverse: Vec<Op>,
}

/// A journal of reversible edits, not snapshots (spec.md §4.4).
///
/// `pause`/`resume` do not stop recording — they coalesce every edit made in
/// between into a single undo entry, matching how a drag gesture or a
/// multi-field form edit should undo as one step rather than one per
/// keystroke.
#[derive(Debug)]
pub struct UndoStack {
    undo: VecDeque<Entry>,
    redo: VecDeque<Entry>,
    pending: Option<Entry>,
    max_depth: usize,
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl UndoStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            pending: None,
            max_depth,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pause(&mut self) {
        self.pending.get_or_insert_with(|| Entry {
            forward: Vec::new(),
            inverse: Vec::new(),
        });
    }

    pub fn resume(&mut self) {
        if let Some(entry) = self.pending.take() {
            self.push_undo_bounded(entry);
        }
    }

    /// Record a freshly-applied local edit: the ops it performed, and the
    /// ops that would undo it. Recording anything clears the redo stack.
    pub fn record(&mut self, forward: Vec<Op>, inverse: Vec<Op>) {
        if forward.is_empty() {
            return;
        }
        self.redo.clear();
        match &mut self.pending {
            Some(entry) => {
                entry.forward.extend(forward);
                // Earlier edits in the paused window must be undone last.
                let mut merged_inverse = inverse;
                merged_inverse.extend(std::mem::take(&mut entry.inverse));
                entry.inverse = merged_inverse;
            },
            None => self.push_undo_bounded(Entry { forward, inverse }),
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Pop the next entry to undo: returns the ops to apply, each passed
    /// through `relabel` (mint a fresh op id) before being returned. The
    /// entry moves to the redo stack so a following `redo` replays the
    /// original edit, itself relabeled fresh at that time.
    pub fn take_undo(&mut self, mut relabel: impl FnMut(Op) -> Op) -> Option<Vec<Op>> {
        let entry = self.undo.pop_back()?;
        let ops = entry.inverse.clone().into_iter().map(&mut relabel).collect();
        self.push_redo_bounded(entry);
        Some(ops)
    }

    /// Pop the next entry to redo: returns the ops to apply, each passed
    /// through `relabel`. The entry moves back to the undo stack.
    pub fn take_redo(&mut self, mut relabel: impl FnMut(Op) -> Op) -> Option<Vec<Op>> {
        let entry = self.redo.pop_back()?;
        let ops = entry.forward.clone().into_iter().map(&mut relabel).collect();
        self.push_undo_bounded(entry);
        Some(ops)
    }

    fn push_undo_bounded(&mut self, entry: Entry) {
        self.undo.push_back(entry);
        if self.undo.len() > self.max_depth {
            self.undo.pop_front();
        }
    }

    fn push_redo_bounded(&mut self, entry: Entry) {
        self.redo.push_back(entry);
        if self.redo.len() > self.max_depth {
            self.redo.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use roomkit_protocol::{ActorId, NodeId, OpId};

    use super::*;

    fn op(seq: u64) -> Op {
        Op::DeleteCrdt {
            op_id: OpId { actor: ActorId(1), seq },
            id: NodeId::new(ActorId(1), seq),
        }
    }

    #[test]
    fn undo_then_redo_round_trips() {
        let mut stack = UndoStack::default();
        stack.record(vec![op(1)], vec![op(2)]);
        assert!(stack.can_undo());
        assert_eq!(stack.take_undo(|op| op).unwrap(), vec![op(2)]);
        assert!(stack.can_redo());
        assert_eq!(stack.take_redo(|op| op).unwrap(), vec![op(1)]);
    }

    #[test]
    fn new_edit_clears_redo() {
        let mut stack = UndoStack::default();
        stack.record(vec![op(1)], vec![op(2)]);
        stack.take_undo(|op| op);
        assert!(stack.can_redo());
        stack.record(vec![op(3)], vec![op(4)]);
        assert!(!stack.can_redo());
    }

    #[test]
    fn pause_coalesces_into_one_entry() {
        let mut stack = UndoStack::default();
        stack.pause();
        stack.record(vec![op(1)], vec![op(10)]);
        stack.record(vec![op(2)], vec![op(20)]);
        assert!(!stack.can_undo());
        stack.resume();
        assert!(stack.can_undo());
        let ops = stack.take_undo(|op| op).unwrap();
        assert_eq!(ops, vec![op(20), op(10)]);
        assert!(!stack.can_undo());
    }

    #[test]
    fn depth_is_bounded() {
        let mut stack = UndoStack::new(2);
        stack.record(vec![op(1)], vec![op(1)]);
        stack.record(vec![op(2)], vec![op(2)]);
        stack.record(vec![op(3)], vec![op(3)]);
        assert_eq!(stack.take_undo(|op| op).unwrap(), vec![op(3)]);
        assert_eq!(stack.take_undo(|op| op).unwrap(), vec![op(2)]);
        assert!(!stack.can_undo());
    }

    /// Relabeling happens at application time, not at record time: popping
    /// undo twice in a row (after two edits) must produce the caller's
    /// relabeled id each time, not the original stored one.
    #[test]
    fn take_undo_applies_relabel_per_call() {
        let mut stack = UndoStack::default();
        stack.record(vec![op(1)], vec![op(2)]);
        let mut next = 100;
        let ops = stack
            .take_undo(|op| match op {
                Op::DeleteCrdt { id, .. } => {
                    next += 1;
                    Op::DeleteCrdt { op_id: OpId { actor: ActorId(1), seq: next }, id }
                },
                other => other,
            })
            .unwrap();
        assert_eq!(ops, vec![op(101)]);
    }
}
