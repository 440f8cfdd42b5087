//! The fabric's visibility contract, exercised with one mapped segment per
//! participant (threads here; the coordinator does the same across
//! processes).

use lockstep::sync::{ExecKind, SyncFabric};
use std::time::Duration;

#[test]
fn scalars_written_before_exec_in_are_visible_after_it() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fabric.seg");
    let master = SyncFabric::create(&path, 3).unwrap();
    let timeout = Some(Duration::from_secs(10));

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || {
                let fabric = SyncFabric::open(&path).unwrap();
                for step in 0..100usize {
                    fabric.exec_in().wait(None).unwrap();
                    // Everything the master published before releasing
                    // exec_in is visible here.
                    assert_eq!(fabric.exec_kind(), Some(ExecKind::Function));
                    assert_eq!(fabric.func_id(), step);
                    assert_eq!(fabric.shared_ids(), vec![step, step + 1]);
                    fabric.exec_out().wait(Some(Duration::from_secs(10))).unwrap();
                }
                fabric.exec_in().wait(None).unwrap();
                assert!(fabric.quit());
            })
        })
        .collect();

    for step in 0..100usize {
        master.set_exec_kind(ExecKind::Function);
        master.set_func_id(step);
        master.set_shared_ids(&[step, step + 1]).unwrap();
        master.exec_in().wait(timeout).unwrap();
        master.exec_out().wait(timeout).unwrap();
    }
    master.set_quit();
    master.exec_in().wait(timeout).unwrap();

    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn distribute_barrier_gates_the_distributed_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fabric.seg");
    let master = SyncFabric::create(&path, 2).unwrap();

    let worker = {
        let path = path.clone();
        std::thread::spawn(move || {
            let fabric = SyncFabric::open(&path).unwrap();
            fabric.distribute_barrier().wait(None).unwrap();
            fabric.distributed()
        })
    };

    master.set_distributed();
    master
        .distribute_barrier()
        .wait(Some(Duration::from_secs(10)))
        .unwrap();
    assert!(worker.join().unwrap());
}
