use roomkit_protocol::{ActorId, NodeId, OpId};

/// Generates monotonically increasing node and op ids for the local actor.
///
/// Node ids and op ids are drawn from independent counters: a single local
/// mutation can mint a node id (for the thing it creates) and an op id (for
/// the mutation record itself) in the same call, and conflating the two
/// counters would make that ordering meaningless. Both counters persist for
/// the lifetime of the `Document`, including across reconnects, so a replayed
/// local op is never re-numbered (spec.md §3).
#[derive(Debug)]
pub struct IdAllocator {
    actor: ActorId,
    next_node_seq: u64,
    next_op_seq: u64,
}

impl IdAllocator {
    pub fn new(actor: ActorId) -> Self {
        Self {
            actor,
            next_node_seq: 1,
            next_op_seq: 1,
        }
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    /// Bind the real server-assigned actor id once it is known. A `Document`
    /// is constructed before the first connection completes (storage
    /// mutations never suspend), starting out under
    /// [`ActorId::LOCAL_UNASSIGNED`]; this is the one time its actor prefix
    /// is allowed to change. Later reconnects may nominally receive a
    /// different actor id from the server, but node ids minted so far are
    /// already keyed on the first one, so subsequent rebinds are ignored —
    /// a stable node-id prefix outlives the room's first successful open.
    pub fn rebind_actor(&mut self, actor: ActorId) {
        if self.actor == ActorId::LOCAL_UNASSIGNED {
            self.actor = actor;
        }
    }

    pub fn next_node_id(&mut self) -> NodeId {
        let seq = self.next_node_seq;
        self.next_node_seq += 1;
        NodeId::new(self.actor, seq)
    }

    pub fn next_op_id(&mut self) -> OpId {
        let seq = self.next_op_seq;
        self.next_op_seq += 1;
        OpId {
            actor: self.actor,
            seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_and_op_ids_advance_independently() {
        let mut ids = IdAllocator::new(ActorId(3));
        let n1 = ids.next_node_id();
        let o1 = ids.next_op_id();
        let n2 = ids.next_node_id();
        assert_eq!(n1, NodeId::new(ActorId(3), 1));
        assert_eq!(o1.seq, 1);
        assert_eq!(n2, NodeId::new(ActorId(3), 2));
    }

    #[test]
    fn rebind_only_takes_effect_once_from_unassigned() {
        let mut ids = IdAllocator::new(ActorId::LOCAL_UNASSIGNED);
        let before = ids.next_node_id();
        assert_eq!(before.actor, ActorId::LOCAL_UNASSIGNED);

        ids.rebind_actor(ActorId(5));
        assert_eq!(ids.actor(), ActorId(5));
        let after = ids.next_node_id();
        assert_eq!(after, NodeId::new(ActorId(5), 2));

        ids.rebind_actor(ActorId(9));
        assert_eq!(ids.actor(), ActorId(5));
    }
}
