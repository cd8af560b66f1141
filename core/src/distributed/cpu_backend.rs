use super::backend::CollectiveBackend;
use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorError};
use crossbeam::channel::{Receiver, Sender, unbounded};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per-rank endpoints of a group that has been created but not yet claimed by every member.
struct PendingGroup {
    /// `endpoints[i]` is taken by the member at position `i`.
    endpoints: Vec<Option<(Vec<Sender<Tensor>>, Vec<Receiver<Tensor>>)>>,
    claimed: usize,
}

/// Shared meeting point where members of a new group pick up their channels.
///
/// Keyed by the sorted global member list plus how many times that list has been requested
/// before, so creating the same group twice yields two independent communicators.
#[derive(Default)]
pub struct Rendezvous {
    pending: Mutex<HashMap<(Vec<usize>, usize), PendingGroup>>,
}

impl Rendezvous {
    fn wire(size: usize) -> PendingGroup {
        // channels[from][to]
        let mut txs: Vec<Vec<Sender<Tensor>>> = vec![Vec::with_capacity(size); size];
        let mut rxs: Vec<Vec<Receiver<Tensor>>> = vec![Vec::with_capacity(size); size];
        for from in 0..size {
            for to_rxs in rxs.iter_mut() {
                let (tx, rx) = unbounded();
                txs[from].push(tx);
                to_rxs.push(rx);
            }
        }
        PendingGroup {
            endpoints: txs.into_iter().zip(rxs).map(Some).collect(),
            claimed: 0,
        }
    }

    fn claim(
        &self,
        members: &[usize],
        generation: usize,
        position: usize,
    ) -> Result<(Vec<Sender<Tensor>>, Vec<Receiver<Tensor>>)> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| Error::Collective("rendezvous lock poisoned".to_string()))?;
        let key = (members.to_vec(), generation);
        let group = pending
            .entry(key.clone())
            .or_insert_with(|| Self::wire(members.len()));
        let endpoints = group.endpoints[position].take().ok_or_else(|| {
            Error::Collective(format!("rank position {position} already joined group {members:?}"))
        })?;
        group.claimed += 1;
        if group.claimed == members.len() {
            pending.remove(&key);
        }
        Ok(endpoints)
    }
}

/// An in-process collective backend.
///
/// Every rank is a thread; every ordered pair of ranks in a communicator owns one
/// `crossbeam` channel. Collectives are entered in the same order on every member, so
/// per-pair FIFO ordering is enough to match messages without tags.
///
/// All-reduce runs the **Ring All-Reduce** algorithm (scatter-reduce, then all-gather),
/// which is the data movement NCCL performs on GPUs.
pub struct CpuBackend {
    global_rank: usize,
    /// Global ranks of the communicator, ascending. `rank()` is the position in here.
    members: Vec<usize>,
    rank: usize,
    /// `to_peer[j]` sends to member `j`.
    to_peer: Vec<Sender<Tensor>>,
    /// `from_peer[j]` receives from member `j`.
    from_peer: Vec<Receiver<Tensor>>,
    rendezvous: Arc<Rendezvous>,
    generations: Mutex<HashMap<Vec<usize>, usize>>,
}

impl CpuBackend {
    /// Builds the world communicator for `world_size` ranks. Element `r` belongs to rank `r`;
    /// move each into its own thread.
    pub fn spawn_world(world_size: usize) -> Vec<CpuBackend> {
        let rendezvous = Arc::new(Rendezvous::default());
        let members: Vec<usize> = (0..world_size).collect();
        let group = Rendezvous::wire(world_size);
        group
            .endpoints
            .into_iter()
            .enumerate()
            .filter_map(|(rank, endpoints)| {
                endpoints.map(|(to_peer, from_peer)| CpuBackend {
                    global_rank: rank,
                    members: members.clone(),
                    rank,
                    to_peer,
                    from_peer,
                    rendezvous: Arc::clone(&rendezvous),
                    generations: Mutex::new(HashMap::new()),
                })
            })
            .collect()
    }

    /// Rank in the world communicator this one was derived from.
    pub fn global_rank(&self) -> usize {
        self.global_rank
    }

    /// Global ranks of this communicator.
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    fn send(&self, to: usize, tensor: Tensor) -> Result<()> {
        self.to_peer[to].send(tensor).map_err(|_| {
            Error::Collective(format!(
                "rank {} could not send to rank {}: peer hung up",
                self.global_rank, self.members[to]
            ))
        })
    }

    fn recv(&self, from: usize) -> Result<Tensor> {
        self.from_peer[from].recv().map_err(|_| {
            Error::Collective(format!(
                "rank {} could not receive from rank {}: peer hung up",
                self.global_rank, self.members[from]
            ))
        })
    }

    fn check_root(&self, root: usize) -> Result<()> {
        if root >= self.members.len() {
            return Err(Error::Collective(format!(
                "root {root} outside group of {}",
                self.members.len()
            )));
        }
        Ok(())
    }
}

impl CollectiveBackend for CpuBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.members.len()
    }

    fn all_reduce_sum(&self, tensor: &mut Tensor) -> Result<()> {
        let world_size = self.world_size();
        if world_size == 1 {
            return Ok(());
        }
        let right = (self.rank + 1) % world_size;
        let left = (self.rank + world_size - 1) % world_size;

        let mut data = tensor.to_f32_vec();
        let total_elements = data.len();
        let chunk_size = total_elements.div_ceil(world_size);
        let chunk = |idx: usize| {
            let start = (idx * chunk_size).min(total_elements);
            start..(start + chunk_size).min(total_elements)
        };
        let ring_index = |offset: isize| {
            (self.rank as isize + offset).rem_euclid(world_size as isize) as usize
        };

        // --- Phase 1: Scatter-Reduce ---
        // At step s, rank r sends chunk (r - s) and accumulates chunk (r - s - 1).
        for step in 0..world_size - 1 {
            let send = chunk(ring_index(-(step as isize)));
            let send_len = send.len();
            self.send(right, Tensor::new(data[send].to_vec(), &[send_len])?)?;

            let recv = chunk(ring_index(-(step as isize) - 1));
            let incoming = self.recv(left)?.to_f32_vec();
            for (dst, val) in data[recv].iter_mut().zip(incoming) {
                *dst += val;
            }
        }

        // --- Phase 2: All-Gather ---
        // Rank r now owns the fully reduced chunk (r + 1); pass finished chunks around.
        for step in 0..world_size - 1 {
            let send = chunk(ring_index(1 - step as isize));
            let send_len = send.len();
            self.send(right, Tensor::new(data[send].to_vec(), &[send_len])?)?;

            let recv = chunk(ring_index(-(step as isize)));
            let incoming = self.recv(left)?.to_f32_vec();
            data[recv].copy_from_slice(&incoming);
        }

        let dtype = tensor.dtype();
        let shape = tensor.shape().to_vec();
        *tensor = Tensor::new(data, &shape)?.to_dtype(dtype);
        Ok(())
    }

    fn all_gather(&self, tensor: &Tensor, axis: usize) -> Result<Tensor> {
        for peer in 0..self.world_size() {
            if peer != self.rank {
                self.send(peer, tensor.clone())?;
            }
        }
        let mut parts = Vec::with_capacity(self.world_size());
        for peer in 0..self.world_size() {
            if peer == self.rank {
                parts.push(tensor.clone());
            } else {
                parts.push(self.recv(peer)?);
            }
        }
        Ok(Tensor::cat(&parts, axis)?)
    }

    fn broadcast(&self, tensor: &mut Tensor, root: usize) -> Result<()> {
        self.check_root(root)?;
        if self.rank == root {
            for peer in 0..self.world_size() {
                if peer != root {
                    self.send(peer, tensor.clone())?;
                }
            }
            return Ok(());
        }
        let incoming = self.recv(root)?;
        if incoming.shape() != tensor.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: tensor.shape().to_vec(),
                got: incoming.shape().to_vec(),
            }
            .into());
        }
        *tensor = incoming;
        Ok(())
    }

    fn scatter(&self, parts: Option<Vec<Tensor>>, root: usize) -> Result<Tensor> {
        self.check_root(root)?;
        if self.rank != root {
            return self.recv(root);
        }
        let parts = parts.ok_or_else(|| {
            Error::Collective(format!("scatter root {root} was given no parts"))
        })?;
        if parts.len() != self.world_size() {
            return Err(Error::Collective(format!(
                "scatter root has {} parts for {} ranks",
                parts.len(),
                self.world_size()
            )));
        }
        let mut own = None;
        for (peer, part) in parts.into_iter().enumerate() {
            if peer == root {
                own = Some(part);
            } else {
                self.send(peer, part)?;
            }
        }
        own.ok_or_else(|| Error::Collective("scatter root kept no part".to_string()))
    }

    fn barrier(&self) -> Result<()> {
        let token = Tensor::new(Vec::new(), &[0])?;
        for peer in 0..self.world_size() {
            if peer != self.rank {
                self.send(peer, token.clone())?;
            }
        }
        for peer in 0..self.world_size() {
            if peer != self.rank {
                self.recv(peer)?;
            }
        }
        Ok(())
    }

    fn new_group(&self, ranks: &[usize]) -> Result<Self> {
        let members = ranks
            .iter()
            .map(|&r| {
                self.members.get(r).copied().ok_or_else(|| {
                    Error::Collective(format!("rank {r} outside group of {}", self.members.len()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if !members.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::Collective(format!(
                "group ranks must be strictly ascending, got {ranks:?}"
            )));
        }
        let position = members
            .iter()
            .position(|&g| g == self.global_rank)
            .ok_or_else(|| {
                Error::Collective(format!(
                    "rank {} is not a member of {members:?}",
                    self.global_rank
                ))
            })?;

        let generation = {
            let mut generations = self
                .generations
                .lock()
                .map_err(|_| Error::Collective("group counter lock poisoned".to_string()))?;
            let counter = generations.entry(members.clone()).or_insert(0);
            let generation = *counter;
            *counter += 1;
            generation
        };

        let (to_peer, from_peer) = self.rendezvous.claim(&members, generation, position)?;
        Ok(CpuBackend {
            global_rank: self.global_rank,
            members,
            rank: position,
            to_peer,
            from_peer,
            rendezvous: Arc::clone(&self.rendezvous),
            generations: Mutex::new(HashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;
    use std::thread;

    fn run_world<F>(world_size: usize, f: F)
    where
        F: Fn(CpuBackend) + Send + Sync + Clone + 'static,
    {
        let handles: Vec<_> = CpuBackend::spawn_world(world_size)
            .into_iter()
            .map(|backend| {
                let f = f.clone();
                thread::spawn(move || f(backend))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_cpu_backend_properties() {
        let world = CpuBackend::spawn_world(4);
        assert_eq!(world[2].rank(), 2);
        assert_eq!(world[2].world_size(), 4);
    }

    #[test]
    fn test_ring_all_reduce_uneven_chunks() {
        // 5 elements over 4 ranks: the last chunk is short.
        run_world(4, |backend| {
            let rank = backend.rank();
            let mut t = Tensor::new(vec![(rank + 1) as f32; 5], &[5]).unwrap();
            backend.all_reduce_sum(&mut t).unwrap();
            assert_eq!(t.to_f32_vec(), vec![10.0; 5]);
        });
    }

    #[test]
    fn test_all_reduce_fewer_elements_than_ranks() {
        run_world(4, |backend| {
            let mut t = Tensor::full(&[2], 1.0, DType::BF16);
            backend.all_reduce_sum(&mut t).unwrap();
            assert_eq!(t.dtype(), DType::BF16);
            assert_eq!(t.to_f32_vec(), vec![4.0, 4.0]);
        });
    }

    #[test]
    fn test_broadcast_and_scatter() {
        run_world(3, |backend| {
            let rank = backend.rank();
            let mut t = Tensor::full(&[2], rank as f32, DType::F32);
            backend.broadcast(&mut t, 1).unwrap();
            assert_eq!(t.to_f32_vec(), vec![1.0, 1.0]);

            let parts = (rank == 0)
                .then(|| (0..3).map(|i| Tensor::full(&[1], i as f32 * 10.0, DType::F32)).collect());
            let mine = backend.scatter(parts, 0).unwrap();
            assert_eq!(mine.to_f32_vec(), vec![rank as f32 * 10.0]);
        });
    }

    #[test]
    fn test_all_gather_rank_order() {
        run_world(2, |backend| {
            let t = Tensor::full(&[1, 2], backend.rank() as f32, DType::F32);
            let all = backend.all_gather(&t, 0).unwrap();
            assert_eq!(all.shape(), &[2, 2]);
            assert_eq!(all.to_f32_vec(), vec![0.0, 0.0, 1.0, 1.0]);
        });
    }

    #[test]
    fn test_subgroups_are_independent() {
        run_world(4, |backend| {
            let rank = backend.rank();
            let pair: Vec<usize> = if rank < 2 { vec![0, 1] } else { vec![2, 3] };
            let group = backend.new_group(&pair).unwrap();
            assert_eq!(group.world_size(), 2);
            assert_eq!(group.rank(), rank % 2);

            let mut t = Tensor::full(&[3], rank as f32, DType::F32);
            group.all_reduce_sum(&mut t).unwrap();
            let expected = if rank < 2 { 1.0 } else { 5.0 };
            assert_eq!(t.to_f32_vec(), vec![expected; 3]);
            group.barrier().unwrap();
            backend.barrier().unwrap();
        });
    }

    #[test]
    fn test_singleton_group() {
        let world = CpuBackend::spawn_world(1);
        let solo = world[0].new_group(&[0]).unwrap();
        let mut t = Tensor::full(&[2], 3.0, DType::F16);
        solo.all_reduce_sum(&mut t).unwrap();
        solo.barrier().unwrap();
        assert_eq!(t.to_f32_vec(), vec![3.0, 3.0]);
    }

    #[test]
    fn test_scatter_wrong_part_count() {
        let world = CpuBackend::spawn_world(1);
        let parts = vec![Tensor::zeros(&[1], DType::F32); 2];
        assert!(matches!(
            world[0].scatter(Some(parts), 0),
            Err(Error::Collective(_))
        ));
    }
}
