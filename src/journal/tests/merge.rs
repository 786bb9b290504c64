use pretty_assertions::assert_eq;

use super::{random_delta, seeded_rng, txt_record, with_temp_dir, APEX};
use crate::changeset::{Changeset, ZoneDelta};
use crate::config::{JournalConfig, MIN_JOURNAL_SIZE};
use crate::journal::{CheckDepth, Journal, JournalError};

const TWO_MIB: u64 = 2 * 1024 * 1024;

fn open_merging(dir: &std::path::Path, max_size: u64) -> Journal<ZoneDelta> {
    let config = JournalConfig::builder(dir, APEX)
        .max_size(max_size)
        .merge_enabled(true)
        .build()
        .expect("config should build");
    Journal::open(config).expect("open should not fail")
}

#[test]
fn merge_cancels_removed_and_readded_records() {
    with_temp_dir(|dir| {
        let mut journal = open_merging(dir, TWO_MIB);

        let a = txt_record("a", b"alpha");
        let b = txt_record("b", b"bravo");
        let c = txt_record("c", b"charlie");

        let mut c0 = ZoneDelta::new(0, 1);
        c0.push_addition(a.clone());
        c0.push_addition(b.clone());

        let mut c1 = ZoneDelta::new(1, 2);
        c1.push_removal(b.clone());
        c1.push_addition(c.clone());

        let mut c2 = ZoneDelta::new(2, 3);
        c2.push_removal(c);
        c2.push_addition(b.clone());

        for delta in [&c0, &c1, &c2] {
            journal.store_changeset(delta).expect("store should not fail");
        }
        journal.force_merge().expect("merge should not fail");

        let loaded = journal.load_changesets(0).expect("load should not fail");
        assert_eq!(loaded.len(), 1, "the whole history reads as one merged step");
        let merged = &loaded[0];
        assert_eq!((merged.serial_from(), merged.serial_to()), (0, 3));
        // B was removed and re-added, so the merge cancels both mentions.
        let mut additions = merged.additions().to_vec();
        additions.sort_by(|x, y| x.owner.cmp(&y.owner));
        assert_eq!(additions, vec![a, b]);
        assert!(merged.removals().is_empty());

        // A fresh insert after the merge shows up as the second entry.
        let mut rng = seeded_rng();
        let next = random_delta(&mut rng, 3, 4, 4);
        journal.store_changeset(&next).expect("store should not fail");
        let loaded = journal.load_changesets(0).expect("load should not fail");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1], next);

        journal.check(CheckDepth::Deep).expect("check should pass");
    });
}

#[test]
fn repeated_merges_extend_the_merged_changeset() {
    with_temp_dir(|dir| {
        let mut rng = seeded_rng();
        let mut journal = open_merging(dir, TWO_MIB);

        for k in 0..3u32 {
            journal
                .store_changeset(&random_delta(&mut rng, k, k + 1, 8))
                .expect("store should not fail");
        }
        journal.force_merge().expect("merge should not fail");

        for k in 3..6u32 {
            journal
                .store_changeset(&random_delta(&mut rng, k, k + 1, 8))
                .expect("store should not fail");
        }
        journal.force_merge().expect("merge should not fail");

        let loaded = journal.load_changesets(0).expect("load should not fail");
        assert_eq!(loaded.len(), 1);
        assert_eq!(
            (loaded[0].serial_from(), loaded[0].serial_to()),
            (0, 6),
            "the merged changeset spans both merge rounds"
        );
        assert!(journal
            .check(CheckDepth::Shallow)
            .expect("check should pass")
            .merged_present);
    });
}

#[test]
fn space_pressure_triggers_a_merge() {
    with_temp_dir(|dir| {
        let mut rng = seeded_rng();
        let mut journal = open_merging(dir, MIN_JOURNAL_SIZE);

        // With merging enabled the writer never returns *busy*; once the
        // pre-merge occupancy threshold is crossed it compacts in place.
        let mut merged_seen = false;
        for k in 0..256u32 {
            journal
                .store_changeset(&random_delta(&mut rng, k, k + 1, 128))
                .expect("store should not fail");
            if journal
                .check(CheckDepth::Shallow)
                .expect("check should pass")
                .merged_present
            {
                merged_seen = true;
                break;
            }
        }
        assert!(merged_seen, "space pressure should have produced a merged changeset");

        let loaded = journal.load_changesets(0).expect("load should not fail");
        assert_eq!(loaded[0].serial_from(), 0);
        super::assert_continuous(&loaded);
        assert!(
            loaded.len() >= 2,
            "the merged prefix is followed by the insert that triggered it"
        );
        journal.check(CheckDepth::Deep).expect("check should pass");
    });
}

#[test]
fn stale_merged_changeset_is_dropped_when_merging_is_disallowed() {
    with_temp_dir(|dir| {
        let mut rng = seeded_rng();
        {
            let mut journal = open_merging(dir, TWO_MIB);
            for k in 0..3u32 {
                journal
                    .store_changeset(&random_delta(&mut rng, k, k + 1, 8))
                    .expect("store should not fail");
            }
            journal.force_merge().expect("merge should not fail");
            journal.close();
        }

        // Reopen with merging disallowed; the merged changeset sits behind
        // the flush watermark, so the next insert retires it.
        let config = JournalConfig::builder(dir, APEX)
            .max_size(TWO_MIB)
            .build()
            .expect("config should build");
        let mut journal: Journal<ZoneDelta> = Journal::open(config).expect("open should not fail");
        journal
            .store_changeset(&random_delta(&mut rng, 3, 4, 8))
            .expect("store should not fail");

        assert!(!journal
            .check(CheckDepth::Shallow)
            .expect("check should pass")
            .merged_present);
        assert!(matches!(
            journal.load_changesets(0),
            Err(JournalError::NotFound)
        ));
        // The surviving ordinary history still reads back fine.
        let first = journal.info().serial_from;
        let loaded = journal.load_changesets(first).expect("load should not fail");
        super::assert_continuous(&loaded);
        assert_eq!(loaded.last().expect("list is non-empty").serial_to(), 4);
    });
}
