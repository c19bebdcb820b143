use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use candle_core::{DType, Device, Tensor};
use crossbeam_channel::Sender;
use hashbrown::HashMap;

use super::{GroupFactory, ProcessGroup, ReduceOp, Work, validate_group_ranks};
use crate::rendezvous::{HashStore, store_barrier};
use crate::{DistError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// An in-process world where every rank is a thread.
///
/// Ranks exchange tensors through shared memory. Each process group handle
/// owns a communication worker thread executing its collectives in issue
/// order, so collectives run asynchronously with respect to the rank's own
/// thread, the same way a communication stream does on an accelerator.
#[derive(Clone)]
pub struct ThreadedWorld {
    inner: Arc<WorldInner>,
}

struct WorldInner {
    world_size: usize,
    timeout: Duration,
    exchanges: Mutex<HashMap<Vec<usize>, Arc<Exchange>>>,
    groups: Mutex<HashMap<(usize, Vec<usize>), Arc<ThreadedProcessGroup>>>,
    store: Arc<HashStore>,
}

impl ThreadedWorld {
    /// Creates a world of `world_size` ranks.
    pub fn new(world_size: usize) -> Self {
        Self::with_timeout(world_size, DEFAULT_TIMEOUT)
    }

    /// Creates a world whose collectives fail after `timeout` if a peer never arrives.
    pub fn with_timeout(world_size: usize, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(WorldInner {
                world_size,
                timeout,
                exchanges: Mutex::new(HashMap::new()),
                groups: Mutex::new(HashMap::new()),
                store: Arc::new(HashStore::new(timeout)),
            }),
        }
    }

    /// Number of ranks.
    pub fn world_size(&self) -> usize {
        self.inner.world_size
    }

    /// The rendezvous store shared by all ranks.
    pub fn store(&self) -> Arc<HashStore> {
        self.inner.store.clone()
    }

    /// Handle used by rank `rank` to create its process groups.
    pub fn rank(&self, rank: usize) -> Result<ThreadedRank> {
        if rank >= self.inner.world_size {
            return Err(DistError::Configuration(format!(
                "rank {rank} is outside the world of size {}",
                self.inner.world_size
            )));
        }
        Ok(ThreadedRank {
            world: self.inner.clone(),
            rank,
        })
    }

    /// Runs `f` on one thread per rank after a store rendezvous, returning the
    /// per-rank results in rank order.
    pub fn run<F, R>(world_size: usize, f: F) -> Result<Vec<R>>
    where
        F: Fn(ThreadedRank) -> Result<R> + Sync,
        R: Send,
    {
        let world = Self::new(world_size);
        let store = world.store();
        let f = &f;

        thread::scope(|scope| {
            let handles = (0..world_size)
                .map(|rank| {
                    let world = world.clone();
                    let store = store.clone();
                    thread::Builder::new()
                        .name(format!("rank-{rank}"))
                        .spawn_scoped(scope, move || {
                            let handle = world.rank(rank)?;
                            store_barrier(
                                store.as_ref(),
                                rank,
                                world_size,
                                "threaded_world/start",
                                world.inner.timeout,
                            )?;
                            f(handle)
                        })
                        .map_err(DistError::from)
                })
                .collect::<Result<Vec<_>>>()?;

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle.join().map_err(|_| {
                        DistError::Collective(format!("rank {rank} panicked"))
                    })?
                })
                .collect()
        })
    }
}

impl fmt::Debug for ThreadedWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedWorld")
            .field("world_size", &self.inner.world_size)
            .finish()
    }
}

/// One rank's view of a [`ThreadedWorld`].
#[derive(Clone)]
pub struct ThreadedRank {
    world: Arc<WorldInner>,
    rank: usize,
}

impl ThreadedRank {
    /// Global rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The rendezvous store shared by all ranks.
    pub fn store(&self) -> Arc<HashStore> {
        self.world.store.clone()
    }

    /// Group spanning every rank.
    pub fn world_group(&self) -> Result<Arc<dyn ProcessGroup>> {
        let ranks: Vec<usize> = (0..self.world.world_size).collect();
        self.new_group(&ranks)
    }

    /// This handle as a shareable group factory.
    pub fn factory(&self) -> Arc<dyn GroupFactory> {
        Arc::new(self.clone())
    }
}

impl fmt::Debug for ThreadedRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedRank")
            .field("rank", &self.rank)
            .field("world_size", &self.world.world_size)
            .finish()
    }
}

impl GroupFactory for ThreadedRank {
    fn global_rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world.world_size
    }

    fn new_group(&self, ranks: &[usize]) -> Result<Arc<dyn ProcessGroup>> {
        validate_group_ranks(ranks, self.world.world_size, self.rank)?;

        let key = (self.rank, ranks.to_vec());
        let mut groups = lock(&self.world.groups)?;
        if let Some(group) = groups.get(&key) {
            return Ok(group.clone());
        }

        let exchange = {
            let mut exchanges = lock(&self.world.exchanges)?;
            exchanges
                .entry(ranks.to_vec())
                .or_insert_with(|| Arc::new(Exchange::new(ranks.len(), self.world.timeout)))
                .clone()
        };
        let index = ranks
            .iter()
            .position(|&r| r == self.rank)
            .ok_or_else(|| DistError::Configuration(format!("rank {} not in {ranks:?}", self.rank)))?;

        let group = Arc::new(ThreadedProcessGroup::spawn(
            index,
            ranks.to_vec(),
            exchange,
        )?);
        log::debug!("rank {} created process group over {ranks:?}", self.rank);
        groups.insert(key, group.clone());
        Ok(group)
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Process group over a subset of a [`ThreadedWorld`].
pub struct ThreadedProcessGroup {
    rank: usize,
    ranks: Vec<usize>,
    exchange: Arc<Exchange>,
    jobs: Sender<Job>,
}

impl ThreadedProcessGroup {
    fn spawn(rank: usize, ranks: Vec<usize>, exchange: Arc<Exchange>) -> Result<Self> {
        let (jobs, receiver) = crossbeam_channel::unbounded::<Job>();
        thread::Builder::new()
            .name(format!("comm-{}-{ranks:?}", ranks[rank]))
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })?;

        Ok(Self {
            rank,
            ranks,
            exchange,
            jobs,
        })
    }

    fn submit<T, F>(&self, op: &'static str, job: F) -> Work<T>
    where
        T: Send + 'static,
        F: FnOnce(&Exchange, usize) -> Result<T> + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let exchange = self.exchange.clone();
        let index = self.rank;
        let job: Job = Box::new(move || {
            // The receiver may already be gone if the caller dropped the work.
            let _ = sender.send(job(&exchange, index));
        });

        log::debug!("rank {} issued {op} on group {:?}", self.ranks[self.rank], self.ranks);
        match self.jobs.send(job) {
            Ok(()) => Work::pending(op, receiver),
            Err(_) => Work::failed(
                op,
                DistError::Collective(format!("{op}: communication worker is gone")),
            ),
        }
    }
}

impl fmt::Debug for ThreadedProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedProcessGroup")
            .field("rank", &self.rank)
            .field("ranks", &self.ranks)
            .finish()
    }
}

impl ProcessGroup for ThreadedProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.ranks.len()
    }

    fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    fn all_gather_into_tensor(&self, input: &Tensor) -> Result<Work> {
        let input = input.clone();
        Ok(self.submit("all_gather_into_tensor", move |exchange, index| {
            let device = input.device().clone();
            let gathered = exchange.exchange(index, input)?;
            if gathered.iter().any(|t| t.dims() != gathered[0].dims()) {
                let shapes: Vec<_> = gathered.iter().map(|t| t.dims().to_vec()).collect();
                return Err(DistError::Collective(format!(
                    "all_gather_into_tensor requires equal input shapes, got {shapes:?}"
                )));
            }
            let parts = to_device(&gathered, &device)?;
            Ok(Tensor::cat(&parts, 0)?)
        }))
    }

    fn all_gather(&self, input: &Tensor) -> Result<Work<Vec<Tensor>>> {
        let input = input.clone();
        Ok(self.submit("all_gather", move |exchange, index| {
            let device = input.device().clone();
            let gathered = exchange.exchange(index, input)?;
            to_device(&gathered, &device)
        }))
    }

    fn reduce_scatter_tensor(&self, input: &Tensor, op: ReduceOp) -> Result<Work> {
        let size = self.size();
        let rows = input.dims().first().copied().unwrap_or(1);
        if rows % size != 0 {
            return Err(DistError::Collective(format!(
                "reduce_scatter_tensor input dim 0 ({rows}) is not divisible by the group size ({size})"
            )));
        }
        let input = input.clone();
        Ok(self.submit("reduce_scatter_tensor", move |exchange, index| {
            let device = input.device().clone();
            let gathered = exchange.exchange(index, input)?;
            let reduced = op.reduce(&to_device(&gathered, &device)?)?;
            let chunk = rows / size;
            Ok(reduced.narrow(0, index * chunk, chunk)?)
        }))
    }

    fn all_reduce(&self, input: &Tensor, op: ReduceOp) -> Result<Work> {
        let input = input.clone();
        Ok(self.submit("all_reduce", move |exchange, index| {
            let device = input.device().clone();
            let gathered = exchange.exchange(index, input)?;
            op.reduce(&to_device(&gathered, &device)?)
        }))
    }

    fn broadcast(&self, input: &Tensor, src: usize) -> Result<Work> {
        if src >= self.size() {
            return Err(DistError::Collective(format!(
                "broadcast source {src} is outside a group of size {}",
                self.size()
            )));
        }
        let input = input.clone();
        Ok(self.submit("broadcast", move |exchange, index| {
            let device = input.device().clone();
            let gathered = exchange.exchange(index, input)?;
            Ok(gathered[src].to_device(&device)?)
        }))
    }

    fn barrier(&self) -> Result<()> {
        let token = Tensor::zeros(0, DType::U8, &Device::Cpu)?;
        self.submit("barrier", move |exchange, index| {
            exchange.exchange(index, token).map(|_| ())
        })
        .wait()
    }
}

fn to_device(tensors: &[Tensor], device: &Device) -> Result<Vec<Tensor>> {
    tensors
        .iter()
        .map(|t| t.to_device(device).map_err(DistError::from))
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| DistError::Collective("a peer panicked while holding a group lock".into()))
}

/// Shared rendezvous point of one process group.
///
/// Every round each member deposits one tensor; once all arrived, everyone
/// reads the full list. A new round only starts after every member has read
/// the previous one.
struct Exchange {
    size: usize,
    timeout: Duration,
    state: Mutex<ExchangeState>,
    cond: Condvar,
}

struct ExchangeState {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Tensor>>,
    published: Option<Arc<Vec<Tensor>>>,
    readers_left: usize,
}

impl Exchange {
    fn new(size: usize, timeout: Duration) -> Self {
        Self {
            size,
            timeout,
            state: Mutex::new(ExchangeState {
                generation: 0,
                arrived: 0,
                slots: vec![None; size],
                published: None,
                readers_left: 0,
            }),
            cond: Condvar::new(),
        }
    }

    fn exchange(&self, index: usize, tensor: Tensor) -> Result<Vec<Tensor>> {
        let deadline = Instant::now() + self.timeout;
        let mut state = lock(&self.state)?;

        while state.published.is_some() {
            state = self.wait_until(state, deadline)?;
        }

        if state.slots[index].is_some() {
            return Err(DistError::Collective(format!(
                "group rank {index} entered the same collective twice"
            )));
        }
        state.slots[index] = Some(tensor);
        state.arrived += 1;
        let generation = state.generation;

        if state.arrived == self.size {
            let tensors = state
                .slots
                .iter_mut()
                .map(|slot| slot.take())
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| DistError::Collective("missing contribution".into()))?;
            state.published = Some(Arc::new(tensors));
            state.arrived = 0;
            state.readers_left = self.size;
            state.generation += 1;
            self.cond.notify_all();
        } else {
            while state.generation == generation {
                state = self.wait_until(state, deadline)?;
            }
        }

        let published = state
            .published
            .clone()
            .ok_or_else(|| DistError::Collective("collective result vanished".into()))?;
        state.readers_left -= 1;
        if state.readers_left == 0 {
            state.published = None;
            self.cond.notify_all();
        }
        Ok(published.as_ref().clone())
    }

    fn wait_until<'a>(
        &self,
        state: MutexGuard<'a, ExchangeState>,
        deadline: Instant,
    ) -> Result<MutexGuard<'a, ExchangeState>> {
        let now = Instant::now();
        if now >= deadline {
            return Err(DistError::Timeout {
                what: format!("{} peers to join a collective", self.size),
                timeout_ms: self.timeout.as_millis(),
            });
        }
        let (state, _) = self
            .cond
            .wait_timeout(state, deadline - now)
            .map_err(|_| DistError::Collective("a peer panicked inside a collective".into()))?;
        Ok(state)
    }
}
