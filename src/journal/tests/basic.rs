use pretty_assertions::assert_eq;

use super::{assert_continuous, open_default, random_delta, seeded_rng, with_temp_dir};
use crate::journal::{CheckDepth, Journal, JournalError};
use crate::store::{Bucket, RecordStore};

const TWO_MIB: u64 = 2 * 1024 * 1024;

#[test]
fn simple_round_trip() {
    with_temp_dir(|dir| {
        let mut rng = seeded_rng();
        let mut journal = open_default(dir, TWO_MIB);
        assert!(journal.info().empty);

        let delta = random_delta(&mut rng, 0, 1, 64);
        journal
            .store_changeset(&delta)
            .expect("store should not fail");

        let loaded = journal.load_changesets(0).expect("load should not fail");
        assert_eq!(loaded, vec![delta]);

        let info = journal.info();
        assert!(!info.empty);
        assert_eq!((info.serial_from, info.serial_to), (0, 1));
    });
}

#[test]
fn journal_survives_reopen() {
    with_temp_dir(|dir| {
        let mut rng = seeded_rng();
        let deltas = vec![
            random_delta(&mut rng, 0, 1, 16),
            random_delta(&mut rng, 1, 2, 16),
            random_delta(&mut rng, 2, 3, 16),
        ];

        assert!(!Journal::<crate::changeset::ZoneDelta>::exists(dir));
        {
            let mut journal = open_default(dir, TWO_MIB);
            for delta in &deltas {
                journal.store_changeset(delta).expect("store should not fail");
            }
            journal.close();
        }
        assert!(Journal::<crate::changeset::ZoneDelta>::exists(dir));

        let journal = open_default(dir, TWO_MIB);
        let loaded = journal.load_changesets(0).expect("load should not fail");
        assert_eq!(loaded, deltas);
        assert_eq!(journal.stored_zone_name().expect("name should load"), super::APEX);
    });
}

#[test]
fn batch_insert_is_atomic() {
    with_temp_dir(|dir| {
        let mut rng = seeded_rng();
        let mut journal = open_default(dir, TWO_MIB);

        let first = random_delta(&mut rng, 0, 1, 8);
        let second = random_delta(&mut rng, 1, 2, 8);
        journal
            .store_changesets(&[first.clone(), second.clone()])
            .expect("batch should not fail");
        assert_eq!(
            journal.load_changesets(0).expect("load should not fail"),
            vec![first, second]
        );

        // A batch whose later member cannot be stored must leave no trace of
        // its earlier members.  The oversized delta forces an error after
        // the small one was already written into the transaction.
        let small = random_delta(&mut rng, 2, 3, 8);
        let oversized = random_delta_big(&mut rng);
        let before = journal.info();
        let result = journal.store_changesets(&[small, oversized]);
        assert!(result.is_err(), "oversized batch member must fail the batch");
        assert_eq!(journal.info(), before);
        assert_eq!(
            journal
                .load_changesets(0)
                .expect("load should not fail")
                .len(),
            2
        );
    });
}

/// Roughly 3 MiB serialized, which can never fit a 2 MiB journal.
fn random_delta_big(rng: &mut rand::rngs::StdRng) -> crate::changeset::ZoneDelta {
    super::random_delta_sized(rng, 3, 4, 100, 16_000)
}

#[test]
fn changeset_with_equal_serials_is_rejected() {
    with_temp_dir(|dir| {
        let mut rng = seeded_rng();
        let mut journal = open_default(dir, TWO_MIB);
        let bogus = random_delta(&mut rng, 7, 7, 1);
        assert!(matches!(
            journal.store_changeset(&bogus),
            Err(JournalError::InvalidArgument { .. })
        ));
    });
}

#[test]
fn load_from_absent_serial_is_not_found() {
    with_temp_dir(|dir| {
        let mut rng = seeded_rng();
        let mut journal = open_default(dir, TWO_MIB);
        journal
            .store_changeset(&random_delta(&mut rng, 0, 1, 8))
            .expect("store should not fail");

        assert!(matches!(
            journal.load_changesets(5),
            Err(JournalError::NotFound)
        ));
        // The newest to-serial has no changeset of its own either.
        assert!(matches!(
            journal.load_changesets(1),
            Err(JournalError::NotFound)
        ));
    });
}

#[test]
fn truncated_chain_yields_partial_list() {
    with_temp_dir(|dir| {
        let mut rng = seeded_rng();
        let first = random_delta(&mut rng, 0, 1, 8);
        let second = random_delta(&mut rng, 1, 2, 8);
        {
            let mut journal = open_default(dir, TWO_MIB);
            journal.store_changeset(&first).expect("store should not fail");
            journal.store_changeset(&second).expect("store should not fail");
            journal.close();
        }

        // Knock out the second changeset's chunks behind the journal's back.
        {
            let store = RecordStore::open(dir, crate::config::DEFAULT_TXN_WRITE_BUDGET)
                .expect("store should open");
            let mut txn = store.begin_write().expect("txn should begin");
            let key = crate::journal::codec::ChunkKey::new(1, 0).encode();
            txn.remove(Bucket::Chunks, &key).expect("remove should not fail");
            txn.commit().expect("commit should not fail");
        }

        let journal = open_default(dir, TWO_MIB);
        let loaded = journal.load_changesets(0).expect("load should not fail");
        assert_eq!(loaded, vec![first]);
    });
}

#[test]
fn flush_is_idempotent() {
    with_temp_dir(|dir| {
        let mut rng = seeded_rng();
        let mut journal = open_default(dir, TWO_MIB);
        for k in 0..4u32 {
            journal
                .store_changeset(&random_delta(&mut rng, k, k + 1, 8))
                .expect("store should not fail");
        }

        journal.flush().expect("flush should not fail");
        let info = journal.info();
        let report = journal.check(CheckDepth::Deep).expect("check should pass");

        journal.flush().expect("flush should not fail");
        assert_eq!(journal.info(), info);
        assert_eq!(
            journal.check(CheckDepth::Deep).expect("check should pass"),
            report
        );
    });
}

#[test]
fn deep_check_counts_the_chain() {
    with_temp_dir(|dir| {
        let mut rng = seeded_rng();
        let mut journal = open_default(dir, TWO_MIB);
        let mut deltas = Vec::new();
        for k in 0..5u32 {
            let delta = random_delta(&mut rng, k, k + 1, 16);
            journal.store_changeset(&delta).expect("store should not fail");
            deltas.push(delta);
        }

        let report = journal.check(CheckDepth::Deep).expect("check should pass");
        assert_eq!(report.changesets, 5);
        assert!(report.chunks >= 5);
        assert!(!report.merged_present);
        assert!(report.occupied_bytes > 0);

        let loaded = journal.load_changesets(0).expect("load should not fail");
        assert_continuous(&loaded);
        assert_eq!(loaded, deltas);
    });
}
