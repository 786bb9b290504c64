use pretty_assertions::assert_eq;

use super::{assert_continuous, open_default, random_delta, seeded_rng, with_temp_dir};
use crate::changeset::Changeset;
use crate::journal::{CheckDepth, JournalError};

const TWO_MIB: u64 = 2 * 1024 * 1024;

/// Serial arithmetic across the 2^32 wrap: `0 -> 1 -> 2 -> 2^31-1 ->
/// 2^32-2 -> 1`.  The final hop collides with the recorded changeset
/// starting at serial 1, which is recovered by flush plus prefix eviction.
#[test]
fn serial_wraparound_with_collision() {
    with_temp_dir(|dir| {
        let mut rng = seeded_rng();
        let mut journal = open_default(dir, TWO_MIB);

        let hops = [
            (0u32, 1u32),
            (1, 2),
            (2, (1 << 31) - 1),
            ((1 << 31) - 1, u32::MAX - 1),
        ];
        for (from, to) in hops {
            journal
                .store_changeset(&random_delta(&mut rng, from, to, 8))
                .expect("store should not fail");
        }

        let wrapping = random_delta(&mut rng, u32::MAX - 1, 1, 8);
        assert!(matches!(
            journal.store_changeset(&wrapping),
            Err(JournalError::Busy)
        ));

        journal.flush().expect("flush should not fail");
        journal
            .store_changeset(&wrapping)
            .expect("insert after flush should succeed");

        // Serials 0 and 1 fell to the collision eviction.
        assert!(matches!(
            journal.load_changesets(0),
            Err(JournalError::NotFound)
        ));
        assert!(matches!(
            journal.load_changesets(1),
            Err(JournalError::NotFound)
        ));

        // The tail from the first surviving serial is continuous across the
        // wrap and ends back at serial 1.
        let first = journal.info().serial_from;
        assert_eq!(first, 2);
        let loaded = journal.load_changesets(first).expect("load should not fail");
        assert_continuous(&loaded);
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.last().expect("list is non-empty").serial_to(), 1);

        // The half-space hop reads back directly as well.
        let tail = journal
            .load_changesets((1 << 31) - 1)
            .expect("load should not fail");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].serial_from(), (1 << 31) - 1);

        journal.check(CheckDepth::Deep).expect("check should pass");
    });
}
