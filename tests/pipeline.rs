//! End-to-end pipeline tests through the public API: build a graph, realize
//! it on the host backend, compare against values computed directly.

use rstest::rstest;
use weft::kernelize::{kernelize, KernelizePolicy};
use weft::{Bindings, Config, DType, Executor, Graph, HostTensor, ShapeExpr};

fn setup_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn shape(dims: &[i64]) -> Vec<ShapeExpr> {
    dims.iter().map(|&d| ShapeExpr::Const(d)).collect()
}

fn realize_f32(g: &Graph, inputs: Vec<HostTensor>) -> Vec<Vec<f32>> {
    let mut exec = Executor::new(Config::default()).unwrap();
    let mut inputs = inputs;
    let realized = exec.realize(g, &mut inputs, &Bindings::new()).unwrap();
    realized.into_vec().iter().map(|t| t.to_f32()).collect()
}

#[rstest]
#[case::add("add", |a: f32, b: f32| a + b)]
#[case::sub("sub", |a: f32, b: f32| a - b)]
#[case::mul("mul", |a: f32, b: f32| a * b)]
#[case::div("div", |a: f32, b: f32| a / b)]
#[case::max("max", f32::max)]
fn test_binary_elementwise(#[case] op: &str, #[case] reference: fn(f32, f32) -> f32) {
    setup_logger();
    // Divisors are powers of two so the recip-and-multiply lowering of
    // division is exact and the reference comparison can be equality.
    let lhs = [1.5f32, -2.0, 3.25, 8.0];
    let rhs = [4.0f32, 0.5, -2.0, 2.0];

    let g = Graph::new();
    let a = g.input(DType::F32, shape(&[4]));
    let b = g.input(DType::F32, shape(&[4]));
    let out = match op {
        "add" => a + b,
        "sub" => a - b,
        "mul" => a * b,
        "div" => a / b,
        "max" => a.maximum(b),
        other => panic!("unknown op {other}"),
    };
    let _ = out.as_output();

    let results = realize_f32(
        &g,
        vec![
            HostTensor::from_f32(vec![4], &lhs),
            HostTensor::from_f32(vec![4], &rhs),
        ],
    );
    let expected: Vec<f32> = lhs.iter().zip(&rhs).map(|(&a, &b)| reference(a, b)).collect();
    assert_eq!(results[0], expected);
}

#[test]
fn test_add_then_sum_fuses_into_at_most_two_kernels() {
    setup_logger();
    let g = Graph::new();
    let a = g.input(DType::F32, shape(&[3]));
    let b = g.input(DType::F32, shape(&[3]));
    let _ = (a + b).sum_all().as_output();

    let kg = kernelize(&g, &KernelizePolicy::default()).unwrap();
    assert!(kg.kernels.len() <= 2, "got {} kernels", kg.kernels.len());

    let results = realize_f32(
        &g,
        vec![
            HostTensor::from_f32(vec![3], &[1.0, 2.0, 3.0]),
            HostTensor::from_f32(vec![3], &[4.0, 5.0, 6.0]),
        ],
    );
    assert_eq!(results[0], vec![21.0]);
}

#[test]
fn test_broadcast_against_constant() {
    setup_logger();
    let g = Graph::new();
    let a = g.input(DType::F32, shape(&[2, 2]));
    let two = g.constant(2.0f32);
    let scaled = g.mul(a.id, two.id).unwrap();
    g.mark_output(scaled);

    let results = realize_f32(
        &g,
        vec![HostTensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0])],
    );
    assert_eq!(results[0], vec![2.0, 4.0, 6.0, 8.0]);
}

#[test]
fn test_reduce_over_one_axis() {
    setup_logger();
    let g = Graph::new();
    let a = g.input(DType::F32, shape(&[2, 3]));
    let _ = a.sum(vec![1]).as_output();

    let results = realize_f32(
        &g,
        vec![HostTensor::from_f32(
            vec![2, 3],
            &[1.0, 2.0, 3.0, 10.0, 20.0, 30.0],
        )],
    );
    assert_eq!(results[0], vec![6.0, 60.0]);
}

#[test]
fn test_movement_chain_transpose_reshape() {
    setup_logger();
    let g = Graph::new();
    let a = g.input(DType::F32, shape(&[2, 3]));
    let _ = a.permute(&[1, 0]).reshape(vec![6]).contiguous().as_output();

    let results = realize_f32(
        &g,
        vec![HostTensor::from_f32(
            vec![2, 3],
            &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
        )],
    );
    assert_eq!(results[0], vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
}

#[test]
fn test_cast_then_arithmetic() {
    setup_logger();
    let g = Graph::new();
    let a = g.input(DType::I32, shape(&[3]));
    let f = a.cast(DType::F32);
    let _ = (f * f).as_output();

    let mut exec = Executor::new(Config::default()).unwrap();
    let mut inputs = vec![HostTensor::from_i32(vec![3], &[2, -3, 4])];
    let realized = exec.realize(&g, &mut inputs, &Bindings::new()).unwrap();
    assert_eq!(realized.into_vec()[0].to_f32(), vec![4.0, 9.0, 16.0]);
}

#[test]
fn test_symbolic_dimension_bound_at_realize() {
    setup_logger();
    let g = Graph::new();
    let a = g.input(DType::F32, vec![ShapeExpr::var("n")]);
    let _ = (a + a).as_output();

    let mut exec = Executor::new(Config::default()).unwrap();
    let mut bindings = Bindings::new();
    bindings.insert("n".to_string(), 5);
    let mut inputs = vec![HostTensor::from_f32(vec![5], &[1.0, 2.0, 3.0, 4.0, 5.0])];
    let realized = exec.realize(&g, &mut inputs, &bindings).unwrap();
    assert_eq!(
        realized.into_vec()[0].to_f32(),
        vec![2.0, 4.0, 6.0, 8.0, 10.0]
    );
}

#[test]
fn test_where_selects_per_element() {
    setup_logger();
    let g = Graph::new();
    let a = g.input(DType::F32, shape(&[4]));
    let b = g.input(DType::F32, shape(&[4]));
    let cond = a.lt(b);
    let picked = g.where_(cond.id, a.id, b.id).unwrap();
    g.mark_output(picked);

    let results = realize_f32(
        &g,
        vec![
            HostTensor::from_f32(vec![4], &[1.0, 5.0, 2.0, 8.0]),
            HostTensor::from_f32(vec![4], &[3.0, 3.0, 3.0, 3.0]),
        ],
    );
    assert_eq!(results[0], vec![1.0, 3.0, 2.0, 3.0]);
}

#[test]
fn test_shared_subexpression_realized_once() {
    setup_logger();
    let g = Graph::new();
    let a = g.input(DType::F32, shape(&[4]));
    let shared = (a * a).contiguous();
    let _ = (shared + a).as_output();
    let _ = (shared * a).as_output();

    let results = realize_f32(
        &g,
        vec![HostTensor::from_f32(vec![4], &[1.0, 2.0, 3.0, 4.0])],
    );
    assert_eq!(results[0], vec![2.0, 6.0, 12.0, 20.0]);
    assert_eq!(results[1], vec![1.0, 8.0, 27.0, 64.0]);
}

#[test]
fn test_ndarray_interop() {
    setup_logger();
    let g = Graph::new();
    let a = g.input(DType::F32, shape(&[2, 2]));
    let _ = (a + a).as_output();

    let array = ndarray::arr2(&[[1.0f32, 2.0], [3.0, 4.0]]).into_dyn();
    let results = realize_f32(&g, vec![HostTensor::from_ndarray(array)]);
    assert_eq!(results[0], vec![2.0, 4.0, 6.0, 8.0]);
}
