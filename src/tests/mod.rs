use crate::buffer::{MatrixBuffer, RawBuffer};
use crate::datatype::MatrixDataType;
use crate::engine::MatrixEngine;
use crate::errors::MatrixError;
use crate::kernels::{Kernel, KernelRegistry};
use crate::operation::{MatrixOperation, OperationHeader};

fn assert_close(found: &[f64], expected: &[f64]) {
    assert_eq!(found.len(), expected.len());
    for (f, e) in found.iter().zip(expected) {
        assert!((f - e).abs() < 1e-9, "expected {:?}, found {:?}", expected, found);
    }
}

#[test]
fn buffer_lock_tracks_pending_operations() {
    let buffer = MatrixBuffer::new(MatrixDataType::F32, 4, None).unwrap();

    buffer.lock();
    buffer.lock();
    assert_eq!(buffer.pending(), 2);

    buffer.unlock();
    assert_eq!(buffer.pending(), 1);

    buffer.unlock();
    assert_eq!(buffer.pending(), 0);

    // idle arena, ready resolves right away
    pollster::block_on(buffer.ready());
}

#[test]
fn shared_views_point_into_the_same_arena() {
    let parent = MatrixBuffer::new(MatrixDataType::F32, 10, None).unwrap();
    let child = pollster::block_on(parent.shared(2, 4)).unwrap();

    assert!(child.same_arena(&parent));
    assert_eq!(child.len(), 4);
    assert_eq!(child.byte_offset(), 8);

    // locking the child locks the whole family
    child.lock();
    assert_eq!(parent.pending(), 1);
    child.unlock();
}

#[test]
fn shared_views_cannot_escape_their_parent() {
    let parent = MatrixBuffer::new(MatrixDataType::F64, 6, None).unwrap();
    let result = pollster::block_on(parent.shared(4, 3));
    assert!(matches!(result, Err(MatrixError::InvalidRange { .. })));
}

#[test]
fn a_lost_storage_can_be_replaced_with_a_blank_one() {
    let buffer =
        MatrixBuffer::new(MatrixDataType::F64, 4, Some(&[1.0, 2.0, 3.0, 4.0])).unwrap();

    // the storage leaves for the worker and never comes back
    let taken = buffer.take_storage();
    assert_eq!(taken.byte_len(), 32);
    drop(taken);

    // a blank replacement of the original size keeps the buffer readable
    buffer.replace(RawBuffer::with_byte_len(32));
    buffer.with_bytes(|bytes| {
        assert_eq!(bytes.len(), 32);
        assert!(bytes.iter().all(|&b| b == 0));
    });
}

#[test]
fn datatype_names_round_trip() {
    assert_eq!(
        MatrixDataType::from_name("float32").unwrap(),
        MatrixDataType::F32
    );
    assert_eq!(
        MatrixDataType::from_name("float64").unwrap(),
        MatrixDataType::F64
    );
    assert_eq!(MatrixDataType::default(), MatrixDataType::F32);
    assert!(matches!(
        MatrixDataType::from_name("int32"),
        Err(MatrixError::InvalidDataType(_))
    ));
}

fn noop_typed<T: crate::datatype::Scalar>(
    _header: &OperationHeader,
    _output: &mut [T],
    _inputs: &[&[T]],
) -> Result<(), crate::errors::OperationError> {
    Ok(())
}

#[test]
fn registry_rejects_duplicates_and_bad_names() {
    let mut registry = KernelRegistry::with_default_library();
    assert!(registry.contains("multiply"));
    assert!(registry.contains("qr"));

    let custom = Kernel::Typed {
        single: noop_typed::<f32>,
        double: noop_typed::<f64>,
    };
    assert!(matches!(
        registry.register("multiply", custom),
        Err(MatrixError::DuplicateKernel(_))
    ));

    let custom = Kernel::Typed {
        single: noop_typed::<f32>,
        double: noop_typed::<f64>,
    };
    assert!(matches!(
        registry.register("not a name", custom),
        Err(MatrixError::InvalidKernelName(_))
    ));

    let custom = Kernel::Typed {
        single: noop_typed::<f32>,
        double: noop_typed::<f64>,
    };
    assert!(registry.register("my_kernel", custom).is_ok());
    assert!(registry.contains("my_kernel"));
}

#[tokio::test]
async fn operations_validate_at_construction() {
    let engine = MatrixEngine::new().await;
    let a = engine.matrix(2, 3, MatrixDataType::F64).unwrap();
    let b = engine.matrix(2, 3, MatrixDataType::F64).unwrap();

    // 2x3 times 2x3 doesn't contract
    assert!(matches!(
        MatrixOperation::multiply(engine.registry(), &a, &b),
        Err(MatrixError::IncompatibleShape { .. })
    ));

    // nothing bigger than 3x3 can go through the closed-form inverse
    let big = engine.matrix(4, 4, MatrixDataType::F64).unwrap();
    assert!(matches!(
        MatrixOperation::inverse(engine.registry(), &big),
        Err(MatrixError::UnsupportedInverse { .. })
    ));

    // unknown kernels are caught before anything is scheduled
    let empty = KernelRegistry::new();
    assert!(matches!(
        MatrixOperation::nop(&empty, &a),
        Err(MatrixError::UnknownKernel(_))
    ));
}

#[tokio::test]
async fn diamonds_pack_into_a_single_step() {
    let engine = MatrixEngine::new().await;
    let a = engine
        .matrix_with_values(2, 2, MatrixDataType::F64, &[1.0, 2.0, 3.0, 4.0])
        .unwrap();
    let b = engine
        .matrix_with_values(2, 2, MatrixDataType::F64, &[5.0, 6.0, 7.0, 8.0])
        .unwrap();

    // d shows up twice but must be computed once
    let d = a.expr().plus(&b.expr()).unwrap();
    let e = d.times(&d).unwrap();

    e.materialize_views().await.unwrap();
    let tree = e.to_tree(engine.registry()).unwrap();
    let bound = tree.pack(engine.registry()).unwrap();

    let operation = bound.operation.unwrap();
    let steps = operation.steps().unwrap();
    assert_eq!(steps.len(), 2); // one add, one multiply
    assert_eq!(steps[0].header.method, "add");
    assert_eq!(steps[1].header.method, "multiply");

    // a, b, the temp of d and the temp of e
    assert_eq!(bound.inputs.len(), 4);

    // both inputs of the multiply step are the same temp
    assert_eq!(steps[1].input_indices[0], steps[1].input_indices[1]);
}

#[tokio::test]
async fn transposed_products_use_the_specialized_kernels() {
    let engine = MatrixEngine::new().await;
    let a = engine.matrix(3, 2, MatrixDataType::F64).unwrap();
    let b = engine.matrix(3, 4, MatrixDataType::F64).unwrap();

    // A^T B compiles to multiplylt, with A itself as the input
    let expr = a.expr().transpose().unwrap().times(&b.expr()).unwrap();
    assert_eq!(expr.rows(), 2);
    assert_eq!(expr.columns(), 4);

    expr.materialize_views().await.unwrap();
    let tree = expr.to_tree(engine.registry()).unwrap();
    let bound = tree.pack(engine.registry()).unwrap();
    let operation = bound.operation.unwrap();
    let steps = operation.steps().unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].header.method, "multiplylt");

    // A B^T likewise
    let c = engine.matrix(5, 4, MatrixDataType::F64).unwrap();
    let expr = b.expr().times(&c.expr().transpose().unwrap()).unwrap();
    assert_eq!(expr.rows(), 3);
    assert_eq!(expr.columns(), 5);

    expr.materialize_views().await.unwrap();
    let tree = expr.to_tree(engine.registry()).unwrap();
    let bound = tree.pack(engine.registry()).unwrap();
    let operation = bound.operation.unwrap();
    let steps = operation.steps().unwrap();
    assert_eq!(steps[0].header.method, "multiplyrt");
}

#[tokio::test]
async fn addinplace_combines_with_coefficients() {
    let engine = MatrixEngine::new().await;
    let a = engine
        .matrix_with_values(2, 2, MatrixDataType::F64, &[1.0, 2.0, 3.0, 4.0])
        .unwrap();
    let b = engine
        .matrix_with_values(2, 2, MatrixDataType::F64, &[1.0, 1.0, 1.0, 1.0])
        .unwrap();
    let c = engine.matrix(2, 2, MatrixDataType::F64).unwrap();

    let operation =
        MatrixOperation::addinplace(engine.registry(), &a, &b, 2.0, -1.0).unwrap();
    engine
        .execute(operation, &c, &[a.clone(), b.clone()])
        .await
        .unwrap();

    assert_close(&c.read().await.unwrap(), &[1.0, 3.0, 5.0, 7.0]);

    // aliasing the output with an input is allowed
    let operation =
        MatrixOperation::addinplace(engine.registry(), &a, &b, 1.0, 1.0).unwrap();
    engine
        .execute(operation, &a, &[a.clone(), b.clone()])
        .await
        .unwrap();

    assert_close(&a.read().await.unwrap(), &[2.0, 3.0, 4.0, 5.0]);
}
