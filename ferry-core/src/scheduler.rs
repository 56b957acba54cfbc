//! Send-queue ordering for the outgoing buffer.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::QueueMode;
use crate::protocol::Message;

/// Order messages for sending.
///
/// `Fifo` sorts by receive time, then creation time, then id, so a staggered chunk burst
/// leaves in index order. `Random` first sorts by id so the shuffle depends only on the
/// RNG state, never on hash-map iteration order.
pub fn order_by_queue_mode<R: Rng>(
    mut messages: Vec<Message>,
    mode: QueueMode,
    rng: &mut R,
) -> Vec<Message> {
    match mode {
        QueueMode::Fifo => {
            messages.sort_by(|a, b| {
                a.receive_time
                    .total_cmp(&b.receive_time)
                    .then_with(|| a.creation_time.total_cmp(&b.creation_time))
                    .then_with(|| a.id.cmp(&b.id))
            });
        }
        QueueMode::Random => {
            messages.sort_by(|a, b| a.id.cmp(&b.id));
            messages.shuffle(rng);
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_messages;
    use crate::config::ProtocolConfig;
    use crate::file::File;
    use crate::protocol::{HostId, TransactionId};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn burst() -> Vec<Message> {
        let f = File::new("filename3", HostId(2), 5000, (0..100).collect(), 0.0);
        let txn = TransactionId::generate(&mut StdRng::seed_from_u64(1));
        let mut msgs = chunk_messages(&f, HostId(2), HostId(1), txn, &ProtocolConfig::default(), 1.0);
        msgs.reverse();
        msgs
    }

    fn indices(msgs: &[Message]) -> Vec<String> {
        msgs.iter().map(|m| m.id.clone()).collect()
    }

    #[test]
    fn fifo_restores_chunk_order() {
        let mut rng = StdRng::seed_from_u64(0);
        let ordered = order_by_queue_mode(burst(), QueueMode::Fifo, &mut rng);
        for w in ordered.windows(2) {
            assert!(w[0].creation_time < w[1].creation_time);
        }
    }

    #[test]
    fn random_is_reproducible_per_seed() {
        let a = order_by_queue_mode(burst(), QueueMode::Random, &mut StdRng::seed_from_u64(42));
        let mut shuffled_input = burst();
        shuffled_input.rotate_left(3);
        let b = order_by_queue_mode(
            shuffled_input,
            QueueMode::Random,
            &mut StdRng::seed_from_u64(42),
        );
        assert_eq!(indices(&a), indices(&b));
        assert_eq!(a.len(), 10);
    }

    #[test]
    fn empty_queue() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(order_by_queue_mode(vec![], QueueMode::Random, &mut rng).is_empty());
    }
}
