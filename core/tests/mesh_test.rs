use meshtune::distributed::{CollectiveBackend, CpuBackend, DeviceMesh, MeshDim, MeshShape};
use meshtune::tensor::Tensor;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

#[test]
fn test_coordinates_are_unique_for_every_factorization() {
    for world_size in 1..=12 {
        for tp in 1..=world_size {
            for pp in 1..=world_size {
                let Ok(shape) = MeshShape::new(world_size, tp, pp) else {
                    continue;
                };
                let mut seen = HashSet::new();
                for rank in 0..world_size {
                    let (p, d, t) = shape.coordinates(rank);
                    assert!(seen.insert((p, d, t)), "duplicate coordinate for rank {rank}");
                    assert_eq!(shape.rank_of(p, d, t), rank);
                }
                assert_eq!(seen.len(), world_size);
            }
        }
    }
}

#[test]
fn test_groups_partition_the_world() {
    let shape = MeshShape::new(12, 2, 3).unwrap();
    assert_eq!(shape.size(MeshDim::Data), 2);
    for dim in MeshDim::ALL {
        let mut covered = vec![0usize; 12];
        let mut groups = HashSet::new();
        for rank in 0..12 {
            let group = shape.group_ranks(rank, dim);
            assert!(group.contains(&rank));
            assert_eq!(group.len(), shape.size(dim));
            groups.insert(group);
        }
        for group in &groups {
            for &r in group {
                covered[r] += 1;
            }
        }
        assert!(covered.iter().all(|&c| c == 1), "{dim} groups overlap");
    }
}

#[test]
fn test_indivisible_world_is_rejected() {
    assert!(MeshShape::new(6, 4, 1).is_err());
    assert!(MeshShape::new(8, 2, 3).is_err());
    assert!(MeshShape::with_dims(8, 2, 2, 1).is_err());
}

#[test]
fn test_tensor_group_all_reduce_stays_inside_group() {
    // world 4, tp 2: {0, 1} and {2, 3} reduce independently.
    let handles: Vec<_> = CpuBackend::spawn_world(4)
        .into_iter()
        .map(|world| {
            thread::spawn(move || {
                let rank = world.global_rank();
                let mesh = Arc::new(DeviceMesh::new(MeshShape::new(4, 2, 1).unwrap(), world).unwrap());
                let mut t = Tensor::new(vec![rank as f32; 3], &[3]).unwrap();
                mesh.group(MeshDim::Tensor).all_reduce_sum(&mut t).unwrap();
                (rank, t.to_f32_vec()[0])
            })
        })
        .collect();

    for handle in handles {
        let (rank, sum) = handle.join().unwrap();
        let expected = if rank < 2 { 1.0 } else { 5.0 };
        assert_eq!(sum, expected, "rank {rank}");
    }
}

#[test]
fn test_data_group_members() {
    let handles: Vec<_> = CpuBackend::spawn_world(8)
        .into_iter()
        .map(|world| {
            thread::spawn(move || {
                let rank = world.global_rank();
                let mesh = DeviceMesh::new(MeshShape::new(8, 2, 1).unwrap(), world).unwrap();
                let data = mesh.group(MeshDim::Data);
                (rank, data.members().to_vec(), mesh.coordinate(MeshDim::Data))
            })
        })
        .collect();

    for handle in handles {
        let (rank, members, dp) = handle.join().unwrap();
        assert_eq!(dp, rank / 2);
        let expected: Vec<usize> = (0..4).map(|d| d * 2 + rank % 2).collect();
        assert_eq!(members, expected);
    }
}
