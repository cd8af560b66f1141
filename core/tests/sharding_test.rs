use meshtune::distributed::linear::{ColumnParallelLinear, RowParallelLinear};
use meshtune::distributed::tp_plan::{ParallelStyle, ShardSpec, TensorParallelPlanner};
use meshtune::distributed::CpuBackend;
use meshtune::model::{MetaSkeleton, ModelSpec};
use meshtune::policy::{RecomputePolicy, ShardingPlan, UnitPolicy, WrapPolicy};
use meshtune::tensor::ops::arange;
use meshtune::tensor::DType;
use std::thread;

#[test]
fn test_shards_reconstruct_bit_for_bit_after_cast() {
    for dtype in [DType::F32, DType::BF16, DType::F16] {
        let full = arange(&[8, 6], DType::F32).to_dtype(dtype);
        for (axis, count) in [(0, 2), (0, 4), (1, 2), (1, 3)] {
            let spec = ShardSpec::split(axis, count, 0);
            let shards = spec.slice_all(&full).unwrap();
            assert_eq!(shards.len(), count);
            for shard in &shards {
                assert_eq!(shard.shape(), spec.local_shape(full.shape()).as_slice());
                assert_eq!(shard.dtype(), dtype);
            }
            let back = spec.reconstruct(&shards).unwrap();
            assert!(back.bit_eq(&full), "{dtype} axis {axis} x{count}");
        }
    }
}

#[test]
fn test_uneven_split_is_an_error() {
    let full = arange(&[6, 4], DType::F32);
    assert!(ShardSpec::split(0, 4, 1).slice(&full).is_err());
}

#[test]
fn test_plan_splits_attention_and_mlp() {
    let spec = ModelSpec::tiny();
    let mut skeleton = MetaSkeleton::build(&spec, DType::F32).unwrap();
    let plan = TensorParallelPlanner::new(2).apply(&mut skeleton, 1).unwrap();

    assert_eq!(plan.style("model.layers.0.attention.wqkv"), Some(ParallelStyle::Colwise));
    assert_eq!(plan.style("model.layers.0.attention.wo"), Some(ParallelStyle::Rowwise));
    assert!(plan.requires_all_reduce("model.layers.0.feed_forward.w2"));
    assert!(!plan.requires_all_reduce("model.layers.0.feed_forward.w1"));

    let w1 = skeleton.param_slot("model.layers.0.feed_forward.w1.weight").unwrap();
    assert_eq!(w1.local_shape(), vec![spec.intermediate_size / 2, spec.hidden_size]);
    let w2 = skeleton.param_slot("model.layers.0.feed_forward.w2.weight").unwrap();
    assert_eq!(w2.local_shape(), vec![spec.hidden_size, spec.intermediate_size / 2]);
}

#[test]
fn test_recompute_flags_are_a_prefix() {
    let policy = RecomputePolicy::from_ratio(0.5, 32).unwrap();
    assert_eq!(policy.num_recompute(), 16);
    for i in 0..32 {
        assert_eq!(policy.is_flagged(i), i < 16, "block {i}");
    }

    // Raising the ratio never unflags a block.
    let mut previous = RecomputePolicy::from_ratio(0.0, 32).unwrap();
    for step in 1..=10 {
        let next = RecomputePolicy::from_ratio(step as f64 / 10.0, 32).unwrap();
        for i in 0..32 {
            assert!(!previous.is_flagged(i) || next.is_flagged(i));
        }
        previous = next;
    }
    assert_eq!(previous.num_recompute(), 32);
    assert!(RecomputePolicy::from_ratio(1.5, 32).is_err());
}

#[test]
fn test_units_cover_every_leaf_once() {
    let spec = ModelSpec::tiny();
    let skeleton = MetaSkeleton::build(&spec, DType::F32).unwrap();
    let policy = UnitPolicy::new(
        WrapPolicy::default(),
        RecomputePolicy::from_ratio(0.5, spec.num_layers).unwrap(),
    );
    let plan = ShardingPlan::build(&skeleton, &policy);

    let mut owned: Vec<_> = plan.units().iter().flat_map(|u| u.leaves.clone()).collect();
    owned.sort_by_key(|id| id.0);
    let mut leaves = skeleton.leaf_modules();
    leaves.sort_by_key(|id| id.0);
    assert_eq!(owned, leaves);
    assert_eq!(plan.units().last().unwrap().root, skeleton.root());
    assert_eq!(plan.recompute_paths().len(), spec.num_layers / 2);
}

// Column then row, with both halves computed on two simulated ranks, must match the
// unsharded two-layer product. Small integer inputs keep every partial sum exact.
#[test]
fn test_column_row_pair_matches_dense() {
    let (batch, hidden, inter) = (3, 4, 6);
    let x = arange(&[batch, hidden], DType::F32);
    let up = arange(&[inter, hidden], DType::F32);
    let down = arange(&[hidden, inter], DType::F32);

    let dense = x.matmul(&up.t().unwrap()).unwrap();
    let dense = dense.matmul(&down.t().unwrap()).unwrap();

    let handles: Vec<_> = CpuBackend::spawn_world(2)
        .into_iter()
        .enumerate()
        .map(|(rank, tp_group)| {
            let (x, up, down) = (x.clone(), up.clone(), down.clone());
            thread::spawn(move || {
                let col_w = ShardSpec::split(0, 2, rank).slice(&up).unwrap();
                let row_w = ShardSpec::split(1, 2, rank).slice(&down).unwrap();
                let col = ColumnParallelLinear::new(col_w, None);
                let row = RowParallelLinear::new(row_w, None);

                let h_local = col.forward(&x).unwrap();
                let gathered = ColumnParallelLinear::gather_output(&h_local, &tp_group).unwrap();
                let y = row.forward(&h_local).unwrap().all_reduce(&tp_group).unwrap();
                (gathered, y)
            })
        })
        .collect();

    let hidden_full = x.matmul(&up.t().unwrap()).unwrap();
    for handle in handles {
        let (gathered, y) = handle.join().unwrap();
        assert!(gathered.bit_eq(&hidden_full));
        assert!(y.bit_eq(&dense));
    }
}
