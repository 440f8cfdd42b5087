//! End-to-end coordinated execution over real forked worker processes.
//!
//! Tests in this file share one fork guard: each builds its own group with
//! its own run directory, but groups are brought up one at a time.

use lockstep::engine::host::{HostEngine, HostExpr, HostProgram, HostUpdate};
use lockstep::{
    Args, CollectMode, CollectSpec, Coordinator, Dtype, ForkOptions, FunctionDef, HostTensor,
    ReduceKind, ReduceSpec, Targets,
};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

static FORK_LOCK: Mutex<()> = Mutex::new(());

fn fork_guard() -> MutexGuard<'static, ()> {
    FORK_LOCK.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn fork(n: usize) -> Coordinator<HostEngine> {
    Coordinator::fork(
        move || HostEngine::new(n),
        ForkOptions::default()
            .n_gpu(n)
            .barrier_timeout(Some(Duration::from_secs(30))),
    )
    .unwrap()
}

#[test]
fn scatter_broadcast_reduce_scenario() {
    let _guard = fork_guard();
    let mut coord = fork(4);
    let x = coord.input("x", Dtype::F32).unwrap();
    let y = coord.input("y", Dtype::F32).unwrap();
    let b = coord.input("b", Dtype::F32).unwrap();
    // Two scattered inputs, one broadcast input; one avg-reduced output,
    // one gathered output, one untouched output.
    let program = HostProgram::outputs(vec![
        HostExpr::SumRows(0),
        HostExpr::RowCount(0),
        HostExpr::SumRows(2),
    ]);
    let f = coord
        .function(
            FunctionDef::new(program)
                .name("scenario")
                .inputs(&[&x, &y, &b])
                .broadcast_inputs(&[&b])
                .collect_modes(CollectSpec::PerOutput(vec![
                    CollectMode::Reduce,
                    CollectMode::Gather,
                    CollectMode::None,
                ]))
                .reduce_ops(ReduceSpec::PerOutput(vec![
                    Some(ReduceKind::Avg),
                    None,
                    None,
                ])),
        )
        .unwrap();
    coord.distribute().unwrap();

    let xs = HostTensor::from_vec(vec![1.0f32; 101], &[101]).unwrap();
    let ys = HostTensor::from_vec((0..101).map(|i| i as f32).collect(), &[101]).unwrap();
    let bs = HostTensor::from_vec(vec![2.0f32; 7], &[7]).unwrap();
    let out = coord
        .call(&f, Args::new().arg(&xs).arg(&ys).arg(&bs))
        .unwrap();

    // Batch 101 over 4 ranks partitions as [0, 26, 51, 76, 101]; x is all
    // ones, so the avg-reduced per-device row sum is 101 / 4.
    assert_eq!(out[0].as_slice::<f32>().unwrap(), &[25.25]);
    // The gathered row counts expose the partition itself, in rank order.
    assert_eq!(out[1].as_slice::<i64>().unwrap(), &[26, 25, 25, 25]);
    // The broadcast input reaches every device whole.
    assert_eq!(out[2].as_slice::<f32>().unwrap(), &[14.0]);

    // A new batch size recomputes the partition; a repeated one does not
    // (same buffers, same result either way).
    let xs8 = HostTensor::from_vec(vec![1.0f32; 8], &[8]).unwrap();
    let ys8 = HostTensor::from_vec(vec![0.0f32; 8], &[8]).unwrap();
    for _ in 0..2 {
        let out = coord
            .call(&f, Args::new().arg(&xs8).arg(&ys8).arg(&bs))
            .unwrap();
        assert_eq!(out[1].as_slice::<i64>().unwrap(), &[2, 2, 2, 2]);
        assert_eq!(out[0].as_slice::<f32>().unwrap(), &[2.0]);
    }
    coord.close().unwrap();
}

#[test]
fn keyword_and_slab_call_paths() {
    let _guard = fork_guard();
    let mut coord = fork(2);
    let x = coord.input("x", Dtype::F32).unwrap();
    let f = coord
        .function(
            FunctionDef::new(HostProgram::outputs(vec![HostExpr::SumRows(0)]))
                .inputs(&[&x])
                .reduce_ops(ReduceSpec::Uniform(ReduceKind::Sum)),
        )
        .unwrap();
    coord.distribute().unwrap();

    let xs = HostTensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[6]).unwrap();
    let out = coord.call(&f, Args::new().named("x", &xs)).unwrap();
    assert_eq!(out[0].as_slice::<f32>().unwrap(), &[21.0]);

    // Stage rows in place and call with the slab token: no staging copy.
    let mut slab = coord.input_slab(&x, &[4]).unwrap();
    let staged = HostTensor::from_vec(vec![2.0f32; 4], &[4]).unwrap();
    slab.fill(&staged).unwrap();
    let token = slab.token();
    let out = coord.call(&f, Args::new().slab(token)).unwrap();
    assert_eq!(out[0].as_slice::<f32>().unwrap(), &[8.0]);
    coord.close().unwrap();
}

#[test]
fn shared_updates_and_all_reduce() {
    let _guard = fork_guard();
    let mut coord = fork(2);
    let acc = coord
        .shared("acc", HostTensor::zeros(Dtype::F32, &[2]))
        .unwrap();
    let x = coord.input("x", Dtype::F32).unwrap();
    let f = coord
        .function(
            FunctionDef::new(HostProgram {
                outputs: vec![HostExpr::RowCount(0)],
                updates: vec![HostUpdate::AccumulateRows {
                    shared: acc.id(),
                    input: 0,
                    scale: 1.0,
                }],
            })
            .inputs(&[&x])
            .shared(&[&acc])
            .collect_modes(CollectSpec::Uniform(CollectMode::None)),
        )
        .unwrap();
    coord.distribute().unwrap();

    let xs = HostTensor::from_vec(
        vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
        &[4, 2],
    )
    .unwrap();
    coord.call(&f, Args::new().arg(&xs)).unwrap();

    // The master owns rows 0..2, so its replica accumulated their sum.
    assert_eq!(
        coord.shared_value(&acc).unwrap().as_slice::<f32>().unwrap(),
        &[4.0, 6.0]
    );

    // Summing replicas folds the worker's partial in: full-batch column
    // sums on every device.
    let results = coord
        .all_reduce(&Targets::all().function(&f), ReduceKind::Sum)
        .unwrap();
    assert_eq!(results[0].as_slice::<f32>().unwrap(), &[16.0, 20.0]);
    assert_eq!(
        coord.shared_value(&acc).unwrap().as_slice::<f32>().unwrap(),
        &[16.0, 20.0]
    );
    coord.close().unwrap();
}

#[test]
fn mismatched_scatter_batches_fail_before_any_barrier() {
    let _guard = fork_guard();
    let mut coord = fork(2);
    let x = coord.input("x", Dtype::F32).unwrap();
    let y = coord.input("y", Dtype::F32).unwrap();
    let f = coord
        .function(
            FunctionDef::new(HostProgram::outputs(vec![HostExpr::SumRows(0)]))
                .inputs(&[&x, &y])
                .reduce_ops(ReduceSpec::Uniform(ReduceKind::Sum)),
        )
        .unwrap();
    coord.distribute().unwrap();

    let xs = HostTensor::from_vec(vec![1.0f32; 6], &[6]).unwrap();
    let ys = HostTensor::from_vec(vec![1.0f32; 5], &[5]).unwrap();
    let err = coord.call(&f, Args::new().arg(&xs).arg(&ys)).unwrap_err();
    assert!(matches!(err, lockstep::Error::Config(_)));

    // The rejected call left the group in step: a good call still works.
    let ys6 = HostTensor::from_vec(vec![1.0f32; 6], &[6]).unwrap();
    let out = coord.call(&f, Args::new().arg(&xs).arg(&ys6)).unwrap();
    assert_eq!(out[0].as_slice::<f32>().unwrap(), &[6.0]);
    coord.close().unwrap();
}

#[test]
fn growing_batches_retag_buffers_for_workers() {
    let _guard = fork_guard();
    let mut coord = fork(2);
    let x = coord.input("x", Dtype::F32).unwrap();
    let f = coord
        .function(
            FunctionDef::new(HostProgram::outputs(vec![HostExpr::SumRows(0)]))
                .inputs(&[&x])
                .reduce_ops(ReduceSpec::Uniform(ReduceKind::Sum)),
        )
        .unwrap();
    coord.distribute().unwrap();

    // Shrink, grow within slack, then grow past capacity: workers must
    // follow every reallocation through the tag slots.
    for batch in [100usize, 80, 104, 400, 64] {
        let xs = HostTensor::from_vec(vec![1.0f32; batch], &[batch]).unwrap();
        let out = coord.call(&f, Args::new().arg(&xs)).unwrap();
        assert_eq!(out[0].as_slice::<f32>().unwrap(), &[batch as f32]);
    }
    coord.close().unwrap();
}

#[test]
fn drop_without_close_releases_workers() {
    let _guard = fork_guard();
    {
        let mut coord = fork(2);
        coord.distribute().unwrap();
        // Dropped undistributed groups and distributed groups both unwind
        // through close(); reaching the end of this scope must not hang.
    }
    {
        let _coord = fork(2);
    }
}
