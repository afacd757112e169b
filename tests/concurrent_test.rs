mod test_utils;

use std::collections::HashSet;
use std::thread;

use small_freelist::ReuseBag;

use test_utils::{
    check_integrity, free_list_of, new_data_page, new_env, node_pages, put_data,
    remove_data, stripe_nodes, TEST_PAGE_SIZE,
};

// A put that cannot latch the only tail must grow the bucket instead
// of waiting, as long as the stripe cap allows it.
#[test]
fn test_blocked_put_grows_a_stripe() {
    let env = new_env(TEST_PAGE_SIZE, 1, None);

    let p0 = new_data_page(&env.pm);
    put_data(&env.list, &env.pm, p0, 0);
    assert_eq!(env.list.stripe_count(0), 1);

    let tail = env.list.bucket_tails(0)[0];
    let tail_page = env.pm.page(tail).unwrap();
    let held = tail_page.write();

    let list = env.list.clone();
    let pm = env.pm.clone();
    let handle = thread::spawn(move || {
        let p = new_data_page(&pm);
        put_data(&list, &pm, p, 0);
        p
    });

    // the worker finishes while the old tail is still latched, which
    // is only possible on a freshly grown stripe
    let p = handle.join().unwrap();
    assert!(env.list.stripe_count(0) >= 2);

    let owner = free_list_of(&env.pm, p);
    assert_ne!(owner, tail);
    assert!(env.list.bucket_tails(0).contains(&owner));

    drop(held);
    check_integrity(&env.list, &env.pm);
}

// Many writers into one bucket: every page ends up on the list exactly
// once, the structure stays sound, and the bucket spread out over more
// than one stripe.
#[test]
fn test_concurrent_put() {
    let env = new_env(TEST_PAGE_SIZE, 1, None);

    let threads = 8;
    let puts_per_thread = 100;

    let (sender, receiver) = crossbeam::channel::unbounded();

    let mut workers = vec![];
    for _ in 0..threads {
        let list = env.list.clone();
        let pm = env.pm.clone();
        let sender = sender.clone();

        let handle = thread::spawn(move || {
            for _ in 0..puts_per_thread {
                let p = new_data_page(&pm);
                put_data(&list, &pm, p, 0);
                sender.send(p).unwrap();
            }
        });
        workers.push(handle);
    }
    for handle in workers {
        handle.join().unwrap();
    }
    drop(sender);

    check_integrity(&env.list, &env.pm);

    // collect every listed page across all stripes
    let mut listed = HashSet::new();
    for tail in env.list.bucket_tails(0) {
        for node in stripe_nodes(&env.pm, tail) {
            for id in node_pages(&env.pm, node) {
                assert!(listed.insert(id), "page {} listed twice", id);
            }
        }
    }

    let mut inserted = HashSet::new();
    for p in receiver.iter() {
        inserted.insert(p);
    }
    assert_eq!(listed, inserted);

    // eight writers on two-slot nodes collide constantly; the bucket
    // must have grown
    assert!(
        env.list.stripe_count(0) >= 2,
        "bucket never grew past one stripe"
    );
}

// Writers and removers race on the same bucket; whatever was not
// removed must still be listed correctly afterwards.
#[test]
fn test_concurrent_put_remove() {
    // bucket 1 is the reuse bucket receiving merged-out nodes
    let env = new_env(TEST_PAGE_SIZE, 2, Some(1));

    let threads = 4;
    let puts_per_thread = 100;

    let (sender, receiver) = crossbeam::channel::unbounded();

    let mut workers = vec![];
    for _ in 0..threads {
        let list = env.list.clone();
        let pm = env.pm.clone();
        let sender = sender.clone();

        let inserter = thread::spawn(move || {
            for _ in 0..puts_per_thread {
                let p = new_data_page(&pm);
                put_data(&list, &pm, p, 0);
                sender.send(p).unwrap();
            }
        });
        workers.push(inserter);

        let list = env.list.clone();
        let pm = env.pm.clone();
        let receiver = receiver.clone();

        let remover = thread::spawn(move || {
            let mut removed = 0;
            while removed < puts_per_thread {
                let p = receiver.recv().unwrap();
                assert!(remove_data(&list, &pm, p, 0));
                removed += 1;
            }
        });
        workers.push(remover);
    }
    for handle in workers {
        handle.join().unwrap();
    }

    check_integrity(&env.list, &env.pm);

    // everything was removed again: no data page is listed in bucket 0
    for tail in env.list.bucket_tails(0) {
        for node in stripe_nodes(&env.pm, tail) {
            assert!(
                node_pages(&env.pm, node).is_empty(),
                "bucket 0 still lists pages"
            );
        }
    }
}

// Depositors and takers race on the reuse bucket; every deposited page
// index is afterwards accounted for exactly once, either taken, still
// listed, or serving as a node page of the bucket.
#[test]
fn test_concurrent_deposit_take() {
    let env = new_env(TEST_PAGE_SIZE, 1, Some(0));

    let threads = 4;
    let deposits_per_thread = 50;

    let mut deposited = HashSet::new();
    let mut per_thread_bags = vec![];
    for _ in 0..threads {
        let mut ids = vec![];
        for _ in 0..deposits_per_thread {
            let id = new_data_page(&env.pm);
            deposited.insert(id.index());
            ids.push(id);
        }
        per_thread_bags.push(ids);
    }

    let (sender, receiver) = crossbeam::channel::unbounded();

    let mut workers = vec![];
    for ids in per_thread_bags {
        let list = env.list.clone();

        let depositor = thread::spawn(move || {
            for id in ids {
                let mut bag = ReuseBag::singleton(id);
                list.put_reuse_bag(&mut bag, 0).unwrap();
            }
        });
        workers.push(depositor);

        let list = env.list.clone();
        let sender = sender.clone();

        let taker = thread::spawn(move || {
            let mut taken = 0;
            let mut dry_runs = 0;
            while taken < deposits_per_thread / 2 && dry_runs < 10_000 {
                match list.take_empty_page(0, None).unwrap() {
                    Some(id) => {
                        sender.send(id).unwrap();
                        taken += 1;
                    }
                    None => dry_runs += 1,
                }
            }
        });
        workers.push(taker);
    }
    for handle in workers {
        handle.join().unwrap();
    }
    drop(sender);

    check_integrity(&env.list, &env.pm);

    // node pages allocated for contention growth during the run have
    // indexes past everything allocated up front
    let max_setup_index = deposited.iter().cloned().max().unwrap();

    let mut seen = HashSet::new();
    for id in receiver.iter() {
        assert!(seen.insert(id.index()), "page taken twice");
    }

    // whatever was not taken is still in the bucket, as payload or as
    // a node page
    for tail in env.list.bucket_tails(0) {
        for node in stripe_nodes(&env.pm, tail) {
            assert!(seen.insert(node.index()), "node page also taken");
            for id in node_pages(&env.pm, node) {
                assert!(seen.insert(id.index()), "listed page also taken");
            }
        }
    }

    // every deposited index is accounted for exactly once; anything on
    // top must be a grown node page
    for index in &deposited {
        assert!(seen.contains(index), "deposited page {} vanished", index);
    }
    for index in seen.difference(&deposited) {
        assert!(
            *index > max_setup_index,
            "unexpected page {} in the bucket",
            index
        );
    }
}
