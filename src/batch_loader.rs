use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_channel::{mpsc, oneshot};
use futures_timer::Delay;
use futures_util::future::{join_all, BoxFuture};
use futures_util::StreamExt;
use tracing::{debug, trace};

use crate::loader::Loader;

const DEFAULT_DELAY: Duration = Duration::from_millis(1);
const DEFAULT_MAX_BATCH_SIZE: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(n) => n,
    None => unreachable!(),
};

/// One `load` call waiting for its batch to settle.
struct PendingRequest<I, L>
where
    I: Send + Sync + Clone + 'static,
    L: Loader<I>,
{
    identifier: I,
    sender: oneshot::Sender<Result<L::Value, L::Error>>,
}

/// The open batch. `epoch` distinguishes idle-timer generations: every
/// arrival and every flush bumps it, so a timer that fires after the batch
/// it was armed for has flushed (or grown) is a no-op.
enum BatchState<I, L>
where
    I: Send + Sync + Clone + 'static,
    L: Loader<I>,
{
    Idle,
    Accumulating { requests: Vec<PendingRequest<I, L>> },
}

struct Accumulator<I, L>
where
    I: Send + Sync + Clone + 'static,
    L: Loader<I>,
{
    state: BatchState<I, L>,
    epoch: u64,
}

impl<I, L> Accumulator<I, L>
where
    I: Send + Sync + Clone + 'static,
    L: Loader<I>,
{
    /// Appends a request to the open batch, opening one if necessary.
    /// Returns the batch length after the append.
    fn push(&mut self, request: PendingRequest<I, L>) -> usize {
        match &mut self.state {
            BatchState::Accumulating { requests } => {
                requests.push(request);
                requests.len()
            }
            BatchState::Idle => {
                self.state = BatchState::Accumulating { requests: vec![request] };
                1
            }
        }
    }
}

struct Inner<I, L>
where
    I: Send + Sync + Clone + 'static,
    L: Loader<I>,
{
    loader: L,
    accumulator: Mutex<Accumulator<I, L>>,
    queue: mpsc::UnboundedSender<Vec<PendingRequest<I, L>>>,
}

impl<I, L> Inner<I, L>
where
    I: Send + Sync + Clone + 'static,
    L: Loader<I>,
{
    /// Moves the open batch onto the dispatch queue and resets to `Idle`.
    /// Must run under the accumulator lock so that "take batch" and "open a
    /// fresh batch" are one atomic transition.
    fn flush(&self, accumulator: &mut Accumulator<I, L>, trigger: &'static str) {
        accumulator.epoch += 1;
        if let BatchState::Accumulating { requests } =
            std::mem::replace(&mut accumulator.state, BatchState::Idle)
        {
            debug!(len = requests.len(), trigger, "flushing batch");
            let _ = self.queue.unbounded_send(requests);
        }
    }

    /// Idle-timer expiry: flushes only if no arrival or size-triggered
    /// flush has happened since this timer generation was armed.
    fn flush_if_epoch(&self, epoch: u64) {
        let mut accumulator = self.accumulator.lock().unwrap();
        if accumulator.epoch == epoch {
            self.flush(&mut accumulator, "delay");
        }
    }

    /// Single worker consuming the dispatch queue: at most one
    /// `fetch_batch` call is ever in flight, and batches run in the order
    /// they became ready.
    async fn run_pipeline(
        inner: Arc<Self>,
        mut batches: mpsc::UnboundedReceiver<Vec<PendingRequest<I, L>>>,
    ) {
        while let Some(batch) = batches.next().await {
            inner.dispatch(batch).await;
        }
    }

    async fn dispatch(&self, batch: Vec<PendingRequest<I, L>>) {
        let identifiers: Vec<I> = batch
            .iter()
            .map(|request| request.identifier.clone())
            .collect();

        match self.loader.fetch_batch(&identifiers).await {
            Ok(values) => {
                for request in batch {
                    let key = self.loader.key(&request.identifier);
                    let value = match values.get(&key) {
                        Some(value) => value.clone(),
                        None => self.loader.default_value(&request.identifier),
                    };
                    let _ = request.sender.send(Ok(value));
                }
            }
            Err(error) => {
                debug!(len = batch.len(), "batch fetch failed");
                for request in batch {
                    let _ = request.sender.send(Err(error.clone()));
                }
            }
        }
    }
}

/// Batch loader.
///
/// Coalesces concurrent [`load`](BatchLoader::load) calls into batches of at
/// most [`max_batch_size`](BatchLoader::max_batch_size) identifiers. A batch
/// flushes immediately when it reaches that size; an under-full batch
/// flushes once [`delay`](BatchLoader::delay) elapses with no new arrival.
/// Each batch is one [`Loader::fetch_batch`] call, and batches never
/// overlap: a hung fetch stalls the pipeline rather than racing the next
/// batch underneath it.
pub struct BatchLoader<I, L>
where
    I: Send + Sync + Clone + 'static,
    L: Loader<I>,
{
    inner: Arc<Inner<I, L>>,
    delay: Duration,
    max_batch_size: NonZeroUsize,
    spawner: Box<dyn Fn(BoxFuture<'static, ()>) + Send + Sync>,
}

impl<I, L> BatchLoader<I, L>
where
    I: Send + Sync + Clone + 'static,
    L: Loader<I>,
{
    /// Use `Loader` to create a [`BatchLoader`].
    ///
    /// The engine is executor-agnostic: the dispatch pipeline and the idle
    /// timers run on whatever `spawner` provides (e.g. `tokio::spawn`).
    pub fn new<S, R>(loader: L, spawner: S) -> Self
    where
        S: Fn(BoxFuture<'static, ()>) -> R + Send + Sync + 'static,
    {
        let (queue, batches) = mpsc::unbounded();
        let inner = Arc::new(Inner {
            loader,
            accumulator: Mutex::new(Accumulator { state: BatchState::Idle, epoch: 0 }),
            queue,
        });
        let spawner: Box<dyn Fn(BoxFuture<'static, ()>) + Send + Sync> =
            Box::new(move |fut| {
                spawner(fut);
            });
        spawner(Box::pin(Inner::run_pipeline(Arc::clone(&inner), batches)));
        Self {
            inner,
            delay: DEFAULT_DELAY,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            spawner,
        }
    }

    /// Specify the idle delay after which an under-full batch flushes
    /// anyway, the default is `1ms`. Fixed for the loader's lifetime.
    #[must_use]
    pub fn delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    /// Specify the max batch size, the default is `1000`.
    ///
    /// If the identifiers waiting to be loaded reach the threshold, they
    /// are loaded immediately. Fixed for the loader's lifetime.
    #[must_use]
    pub fn max_batch_size(self, max_batch_size: NonZeroUsize) -> Self {
        Self { max_batch_size, ..self }
    }

    /// Get the loader.
    #[inline]
    pub fn loader(&self) -> &L {
        &self.inner.loader
    }

    /// Use this `BatchLoader` to load one item.
    ///
    /// Resolves with the value the batch response holds under this
    /// identifier's canonical key, with [`Loader::default_value`] when the
    /// response has no such key, or with the fetch error (cloned verbatim,
    /// never wrapped) when the whole batch fails. Duplicate identifiers are
    /// legal; each call settles independently from the same batch.
    pub async fn load(&self, identifier: I) -> Result<L::Value, L::Error> {
        let (sender, receiver) = oneshot::channel();

        let armed_epoch = {
            let mut accumulator = self.inner.accumulator.lock().unwrap();
            let len = accumulator.push(PendingRequest { identifier, sender });
            if len >= self.max_batch_size.get() {
                self.inner.flush(&mut accumulator, "size");
                None
            } else {
                // Re-arm: the previous generation's timer goes stale.
                accumulator.epoch += 1;
                Some(accumulator.epoch)
            }
        };

        if let Some(epoch) = armed_epoch {
            trace!(epoch, "armed idle timer");
            let inner = Arc::clone(&self.inner);
            let delay = self.delay;
            (self.spawner)(Box::pin(async move {
                Delay::new(delay).await;
                inner.flush_if_epoch(epoch);
            }));
        }

        receiver.await.unwrap()
    }

    /// Use this `BatchLoader` to load several items.
    ///
    /// The loads are issued concurrently, so they coalesce into the same
    /// batch(es). Values come back in input order; the first batch error
    /// encountered fails the whole call.
    pub async fn load_many<Ids>(&self, identifiers: Ids) -> Result<Vec<L::Value>, L::Error>
    where
        Ids: IntoIterator<Item = I>,
    {
        let loads = identifiers.into_iter().map(|identifier| self.load(identifier));
        join_all(loads).await.into_iter().collect()
    }
}
