mod test_utils;

use small_freelist::{
    io::{data_io, T_DATA},
    wal, PageId, ReuseBag, FLAG_DATA,
};

use test_utils::{new_data_page, new_env, put_data, remove_data, TestEnv, TEST_PAGE_SIZE};

// Replaying the delta records over a pre-operation snapshot must
// reproduce every page byte for byte, whatever mix of puts, removes,
// splits, merges and takes produced them.
//
// The data pages the scenario works with are prepared before the
// snapshot: their initialization is the engine's write, not a list
// mutation, and produces no delta records. Node pages allocated by the
// list during the run are re-created by replaying their init records.
fn assert_replay_reproduces(prepared: usize, run: impl Fn(&TestEnv, Vec<PageId>)) {
    let env = new_env(TEST_PAGE_SIZE, 2, Some(1));
    let pages: Vec<_> = (0..prepared).map(|_| new_data_page(&env.pm)).collect();

    let snapshot = env.pm.snapshot();
    env.wal.clear();

    run(&env, pages);

    wal::replay(&snapshot, &env.wal.records()).unwrap();

    assert_eq!(snapshot.page_indexes(), env.pm.page_indexes());
    for index in env.pm.page_indexes() {
        let id = PageId::new(0, 0, index);
        let live = env.pm.page_or_alloc(id).unwrap();
        let replayed = snapshot.page_or_alloc(id).unwrap();
        assert_eq!(
            *live.read(),
            *replayed.read(),
            "page index {} diverges after replay",
            index
        );
    }
}

#[test]
fn test_replay_put_with_split() {
    // enough pages to force a split in bucket 0
    assert_replay_reproduces(5, |env, pages| {
        for p in pages {
            put_data(&env.list, &env.pm, p, 0);
        }
    });
}

#[test]
fn test_replay_remove_with_merge() {
    assert_replay_reproduces(5, |env, pages| {
        for p in &pages {
            put_data(&env.list, &env.pm, *p, 0);
        }

        // removing everything exercises cut-tail, stripe drop and the
        // deposit of recycled nodes into the reuse bucket
        for p in pages {
            assert!(remove_data(&env.list, &env.pm, p, 0));
        }
    });
}

#[test]
fn test_replay_bag_drain_with_promotion() {
    assert_replay_reproduces(6, |env, pages| {
        let mut bag = ReuseBag::new();
        for p in pages {
            bag.add_free_page(p);
        }
        env.list.put_reuse_bag(&mut bag, 1).unwrap();
    });
}

#[test]
fn test_replay_take_with_reinit() {
    assert_replay_reproduces(5, |env, pages| {
        let mut bag = ReuseBag::new();
        for p in pages {
            bag.add_free_page(p);
        }
        env.list.put_reuse_bag(&mut bag, 1).unwrap();

        // draining with an io layout re-initializes each consumed node
        // page as a data page in place; deposited pages come back as
        // they are
        while let Some(id) = env
            .list
            .take_empty_page(1, Some((T_DATA, data_io::VERSION)))
            .unwrap()
        {
            assert_eq!(id.flag(), FLAG_DATA);
        }
    });
}
