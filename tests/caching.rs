//! Artifact cache and JIT replay behavior through the public API.

use weft::{Bindings, Config, DType, Executor, Graph, HostTensor, ShapeExpr};

fn setup_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn shape(dims: &[i64]) -> Vec<ShapeExpr> {
    dims.iter().map(|&d| ShapeExpr::Const(d)).collect()
}

fn build_graph(g: &Graph) {
    let a = g.input(DType::F32, shape(&[16]));
    let b = g.input(DType::F32, shape(&[16]));
    let _ = ((a + b) * a).sum_all().as_output();
}

fn sample_inputs() -> Vec<HostTensor> {
    let data_a: Vec<f32> = (0..16).map(|i| i as f32).collect();
    let data_b: Vec<f32> = (0..16).map(|i| 16.0 - i as f32).collect();
    vec![
        HostTensor::from_f32(vec![16], &data_a),
        HostTensor::from_f32(vec![16], &data_b),
    ]
}

#[test]
fn test_second_realize_replays_without_recompiling() {
    setup_logger();
    let g = Graph::new();
    build_graph(&g);
    let mut exec = Executor::new(Config::default()).unwrap();

    let mut inputs = sample_inputs();
    let first = exec.realize(&g, &mut inputs, &Bindings::new()).unwrap();
    let (_, compile_misses) = exec.cache_stats();
    assert!(compile_misses > 0);

    let mut inputs = sample_inputs();
    let second = exec.realize(&g, &mut inputs, &Bindings::new()).unwrap();
    assert_eq!(exec.replay_stats(), (1, 1));
    // Replay did not touch the artifact cache again.
    assert_eq!(exec.cache_stats().1, compile_misses);
    assert_eq!(
        first.into_vec()[0].as_bytes(),
        second.into_vec()[0].as_bytes()
    );
}

#[test]
fn test_jit_disabled_hits_artifact_cache_instead() {
    setup_logger();
    let g = Graph::new();
    build_graph(&g);
    let mut exec = Executor::new(Config::default().with_jit(false)).unwrap();

    let mut inputs = sample_inputs();
    exec.realize(&g, &mut inputs, &Bindings::new()).unwrap();
    let (hits_before, misses) = exec.cache_stats();
    assert_eq!(hits_before, 0);

    let mut inputs = sample_inputs();
    exec.realize(&g, &mut inputs, &Bindings::new()).unwrap();
    assert_eq!(exec.replay_stats().0, 0);
    let (hits_after, misses_after) = exec.cache_stats();
    assert_eq!(misses_after, misses);
    assert!(hits_after > 0);
}

#[test]
fn test_disk_cache_survives_a_new_executor() {
    setup_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = || {
        Config::default()
            .with_cache_dir(dir.path())
            .with_jit(false)
    };

    let g = Graph::new();
    build_graph(&g);
    {
        let mut exec = Executor::new(config()).unwrap();
        let mut inputs = sample_inputs();
        exec.realize(&g, &mut inputs, &Bindings::new()).unwrap();
        assert!(exec.cache_stats().1 > 0);
    }
    // A fresh executor finds the rendered artifacts on disk.
    {
        let mut exec = Executor::new(config()).unwrap();
        let mut inputs = sample_inputs();
        exec.realize(&g, &mut inputs, &Bindings::new()).unwrap();
        let (hits, misses) = exec.cache_stats();
        assert!(hits > 0);
        assert_eq!(misses, 0);
    }
}

#[test]
fn test_structural_change_misses_replay() {
    setup_logger();
    let mut exec = Executor::new(Config::default()).unwrap();

    let g1 = Graph::new();
    let a = g1.input(DType::F32, shape(&[4]));
    let _ = (a + a).as_output();
    let mut inputs = vec![HostTensor::from_f32(vec![4], &[1.0, 2.0, 3.0, 4.0])];
    exec.realize(&g1, &mut inputs, &Bindings::new()).unwrap();

    let g2 = Graph::new();
    let b = g2.input(DType::F32, shape(&[4]));
    let _ = (b * b).as_output();
    let mut inputs = vec![HostTensor::from_f32(vec![4], &[1.0, 2.0, 3.0, 4.0])];
    let realized = exec.realize(&g2, &mut inputs, &Bindings::new()).unwrap();
    assert_eq!(exec.replay_stats(), (0, 2));
    assert_eq!(realized.into_vec()[0].to_f32(), vec![1.0, 4.0, 9.0, 16.0]);
}
