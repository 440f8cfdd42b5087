//! Lifecycle ordering over a single-rank group: with `n_gpu = 1` no workers
//! are forked and every barrier opens immediately, which makes the state
//! machine itself cheap to pin down.

use lockstep::engine::host::{HostEngine, HostExpr, HostProgram};
use lockstep::{
    Args, Coordinator, Dtype, Error, ForkOptions, FunctionDef, HostTensor, ReduceKind, Targets,
};

fn single() -> Coordinator<HostEngine> {
    Coordinator::fork(|| HostEngine::new(1), ForkOptions::default().n_gpu(1)).unwrap()
}

#[test]
fn zero_devices_is_fatal() {
    let result = Coordinator::fork(|| HostEngine::new(1), ForkOptions::default().n_gpu(0));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn master_rank_must_be_in_range() {
    let result = Coordinator::fork(
        || HostEngine::new(2),
        ForkOptions::default().n_gpu(2).master_rank(2),
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn call_before_distribute_is_a_lifecycle_error() {
    let mut coord = single();
    let x = coord.input("x", Dtype::F32).unwrap();
    let f = coord
        .function(FunctionDef::new(HostProgram::outputs(vec![HostExpr::SumRows(0)])).inputs(&[&x]))
        .unwrap();
    let batch = HostTensor::from_vec(vec![1.0f32; 8], &[8]).unwrap();
    let err = coord.call(&f, Args::new().arg(&batch)).unwrap_err();
    assert!(matches!(err, Error::Lifecycle(_)));

    // The local artifact still runs without coordination.
    let out = coord.call_local(&f, Args::new().arg(&batch)).unwrap();
    assert_eq!(out[0].as_slice::<f32>().unwrap(), &[8.0]);
    coord.close().unwrap();
}

#[test]
fn no_new_functions_after_distribute() {
    let mut coord = single();
    let x = coord.input("x", Dtype::F32).unwrap();
    coord.distribute().unwrap();
    let err = coord
        .function(FunctionDef::new(HostProgram::outputs(vec![HostExpr::SumRows(0)])).inputs(&[&x]))
        .unwrap_err();
    assert!(matches!(err, Error::Lifecycle(_)));
    let err = coord.input("y", Dtype::F32).unwrap_err();
    assert!(matches!(err, Error::Lifecycle(_)));
    coord.close().unwrap();
}

#[test]
fn distribute_is_once_only() {
    let mut coord = single();
    coord.distribute().unwrap();
    assert!(matches!(coord.distribute(), Err(Error::Lifecycle(_))));
    coord.close().unwrap();
}

#[test]
fn collectives_before_distribute_and_after_close() {
    let mut coord = single();
    coord
        .shared("w", HostTensor::from_vec(vec![1.0f32], &[1]).unwrap())
        .unwrap();
    let err = coord.all_reduce(&Targets::all(), ReduceKind::Avg).unwrap_err();
    assert!(matches!(err, Error::Lifecycle(_)));

    coord.distribute().unwrap();
    coord.all_reduce(&Targets::all(), ReduceKind::Avg).unwrap();

    coord.close().unwrap();
    let err = coord.all_reduce(&Targets::all(), ReduceKind::Avg).unwrap_err();
    assert!(matches!(err, Error::Lifecycle(_)));
    let err = coord.broadcast(&Targets::all()).unwrap_err();
    assert!(matches!(err, Error::Lifecycle(_)));
}

#[test]
fn close_twice_is_a_no_op() {
    let mut coord = single();
    coord.distribute().unwrap();
    coord.close().unwrap();
    coord.close().unwrap();
}

#[test]
fn close_without_distribute_releases_the_group() {
    let mut coord = single();
    coord.close().unwrap();
    assert!(matches!(coord.distribute(), Err(Error::Lifecycle(_))));
}

#[test]
fn calls_after_close_fall_back_to_local_only() {
    let mut coord = single();
    let x = coord.input("x", Dtype::F32).unwrap();
    let f = coord
        .function(FunctionDef::new(HostProgram::outputs(vec![HostExpr::SumRows(0)])).inputs(&[&x]))
        .unwrap();
    coord.distribute().unwrap();
    coord.close().unwrap();

    let batch = HostTensor::from_vec(vec![2.0f32; 4], &[4]).unwrap();
    let err = coord.call(&f, Args::new().arg(&batch)).unwrap_err();
    assert!(matches!(err, Error::Lifecycle(_)));
    let out = coord.call_local(&f, Args::new().arg(&batch)).unwrap();
    assert_eq!(out[0].as_slice::<f32>().unwrap(), &[8.0]);
}

#[test]
fn output_subset_is_unsupported() {
    let mut coord = single();
    let x = coord.input("x", Dtype::F32).unwrap();
    let f = coord
        .function(FunctionDef::new(HostProgram::outputs(vec![HostExpr::SumRows(0)])).inputs(&[&x]))
        .unwrap();
    coord.distribute().unwrap();
    let batch = HostTensor::from_vec(vec![1.0f32; 4], &[4]).unwrap();
    let err = coord
        .call(&f, Args::new().arg(&batch).output_subset(vec![0]))
        .unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
    coord.close().unwrap();
}

#[test]
fn scatter_validation_happens_before_the_fabric() {
    let mut coord = single();
    let w = coord
        .shared("w", HostTensor::zeros(Dtype::F32, &[10, 10]))
        .unwrap();
    coord.distribute().unwrap();

    // Wrong source count.
    let err = coord.scatter(&w, &[]).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));

    // Wrong shape.
    let bad_shape = HostTensor::zeros(Dtype::F32, &[10, 9]);
    let err = coord.scatter(&w, std::slice::from_ref(&bad_shape)).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));

    // Wrong dtype.
    let bad_dtype = HostTensor::zeros(Dtype::F64, &[10, 10]);
    let err = coord.scatter(&w, std::slice::from_ref(&bad_dtype)).unwrap_err();
    assert!(matches!(err, Error::DtypeMismatch { .. }));

    // A matching source still works afterwards: nothing desynchronized.
    let good = HostTensor::from_vec(vec![1.5f32; 100], &[10, 10]).unwrap();
    coord.scatter(&w, std::slice::from_ref(&good)).unwrap();
    assert_eq!(coord.shared_value(&w).unwrap(), good);
    coord.close().unwrap();
}

#[test]
fn unknown_collective_names_are_rejected() {
    let mut coord = single();
    coord
        .shared("w", HostTensor::zeros(Dtype::F32, &[2]))
        .unwrap();
    coord.distribute().unwrap();
    let err = coord
        .all_reduce(&Targets::all().name("nope"), ReduceKind::Sum)
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    let err = coord.scatter_named("nope", &[]).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    coord.close().unwrap();
}

#[test]
fn function_ids_are_dense_in_registration_order() {
    let mut coord = single();
    let x = coord.input("x", Dtype::F32).unwrap();
    for expected in 0..4 {
        let f = coord
            .function(
                FunctionDef::new(HostProgram::outputs(vec![HostExpr::SumRows(0)])).inputs(&[&x]),
            )
            .unwrap();
        assert_eq!(f.id(), expected);
    }
    coord.close().unwrap();
}

#[test]
fn conflicting_scatter_spec_is_rejected() {
    let mut coord = single();
    let x = coord.input("x", Dtype::F32).unwrap();
    let err = coord
        .function(
            FunctionDef::new(HostProgram::outputs(vec![HostExpr::SumRows(0)]))
                .inputs(&[&x])
                .broadcast_inputs(&[&x])
                .scatter_inputs(&[&x]),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    coord.close().unwrap();
}
