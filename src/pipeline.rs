use anyhow::Result;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

/// A bounded, ordered sequence of items passed between pipeline stages.
///
/// Batches are cheap to clone and shared read-only across fan-out sinks.
/// The empty batch is the reserved end-of-stream signal: it is emitted
/// exactly once per run, strictly after all data batches.
pub struct Batch<T> {
    items: Arc<Vec<T>>,
}

impl<T> Batch<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Arc::new(items),
        }
    }

    /// The end-of-stream signal.
    pub fn end() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_end(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Clone for Batch<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T> Deref for Batch<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

/// A batch consumer.
///
/// `process` is synchronous and assumed blocking: the caller does not
/// continue until every downstream effect of the batch has completed, which
/// is what propagates backpressure to upstream producers. Sources may call
/// it from several worker threads at once, so implementations synchronize
/// internally.
pub trait Sink<T>: Send + Sync {
    fn process(&self, batch: Batch<T>) -> Result<()>;
}

/// Fan-out side of a pipeline stage: an ordered-irrelevant set of output
/// sinks plus distinguished error and log side channels.
///
/// Emitters are cheap clonable handles over shared state, so a source can
/// hand one to each of its worker threads.
pub struct Emitter<T, E = ()> {
    inner: Arc<EmitterInner<T, E>>,
}

struct EmitterInner<T, E> {
    outputs: Mutex<Vec<Arc<dyn Sink<T>>>>,
    errors: Mutex<Vec<Arc<dyn Sink<E>>>>,
    logs: Mutex<Vec<Arc<dyn Sink<String>>>>,
}

impl<T, E> Emitter<T, E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                outputs: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
                logs: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn attach_output(&self, sink: Arc<dyn Sink<T>>) {
        self.inner.outputs.lock().unwrap().push(sink);
    }

    pub fn attach_error(&self, sink: Arc<dyn Sink<E>>) {
        self.inner.errors.lock().unwrap().push(sink);
    }

    pub fn attach_log(&self, sink: Arc<dyn Sink<String>>) {
        self.inner.logs.lock().unwrap().push(sink);
    }

    /// Fans a batch out to every output sink, synchronously.
    pub fn output(&self, batch: Batch<T>) -> Result<()> {
        let sinks = self.inner.outputs.lock().unwrap().clone();
        for sink in sinks {
            sink.process(batch.clone())?;
        }
        Ok(())
    }

    /// Routes failed items to the error side channel.
    pub fn error(&self, batch: Batch<E>) -> Result<()> {
        let sinks = self.inner.errors.lock().unwrap().clone();
        for sink in sinks {
            sink.process(batch.clone())?;
        }
        Ok(())
    }

    /// Routes a textual diagnostic to the log side channel.
    pub fn log(&self, message: impl Into<String>) -> Result<()> {
        let sinks = self.inner.logs.lock().unwrap().clone();
        if sinks.is_empty() {
            return Ok(());
        }
        let batch = Batch::new(vec![message.into()]);
        for sink in sinks {
            sink.process(batch.clone())?;
        }
        Ok(())
    }
}

impl<T, E> Clone for Emitter<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Default for Emitter<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// A pipeline stage with no upstream; running the pipeline invokes `run()`
/// on the original source.
pub trait Source<T, E> {
    fn emitter(&self) -> &Emitter<T, E>;

    fn run(&self) -> Result<()>;
}

/// A mapper stage: a [`Sink`] on the upstream side and an [`Emitter`] on the
/// downstream side.
pub trait Stage<I, O, E>: Sink<I> {
    fn emitter(&self) -> &Emitter<O, E>;
}

/// Mapper over whole batches, built from a closure.
pub struct FnMapper<I, O, E, F> {
    emitter: Emitter<O, E>,
    f: F,
    _marker: PhantomData<fn(I) -> (O, E)>,
}

impl<I, O, E, F> FnMapper<I, O, E, F>
where
    F: Fn(&Emitter<O, E>, Batch<I>) -> Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            emitter: Emitter::new(),
            f,
            _marker: PhantomData,
        }
    }
}

impl<I, O> FnMapper<I, O, I, ()>
where
    I: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    /// Per-item mapper: failed items are routed to the error side channel
    /// with a diagnostic on the log channel, and never abort the batch.
    /// The end-of-stream batch is always forwarded.
    pub fn per_item<M>(
        map: M,
    ) -> FnMapper<I, O, I, impl Fn(&Emitter<O, I>, Batch<I>) -> Result<()> + Send + Sync>
    where
        M: Fn(&I) -> Result<O> + Send + Sync,
    {
        FnMapper::new(move |emitter: &Emitter<O, I>, batch: Batch<I>| {
            if batch.is_end() {
                return emitter.output(Batch::end());
            }

            let mut mapped = Vec::with_capacity(batch.len());
            let mut failed = Vec::new();
            for item in batch.iter() {
                match map(item) {
                    Ok(out) => mapped.push(out),
                    Err(e) => {
                        emitter.log(format!("mapping failed: {e:#}"))?;
                        failed.push(item.clone());
                    }
                }
            }

            if !failed.is_empty() {
                emitter.error(Batch::new(failed))?;
            }
            if !mapped.is_empty() {
                emitter.output(Batch::new(mapped))?;
            }
            Ok(())
        })
    }
}

impl<I, O, E, F> Sink<I> for FnMapper<I, O, E, F>
where
    F: Fn(&Emitter<O, E>, Batch<I>) -> Result<()> + Send + Sync,
{
    fn process(&self, batch: Batch<I>) -> Result<()> {
        (self.f)(&self.emitter, batch)
    }
}

impl<I, O, E, F> Stage<I, O, E> for FnMapper<I, O, E, F>
where
    F: Fn(&Emitter<O, E>, Batch<I>) -> Result<()> + Send + Sync,
{
    fn emitter(&self) -> &Emitter<O, E> {
        &self.emitter
    }
}

/// Same-type mapper restricted to per-item accept/reject.
///
/// The end-of-stream batch is always forwarded, even when the predicate
/// would reject every item; batches left empty by rejection are dropped so
/// the empty batch stays reserved as the end signal.
pub struct Filter<T, P> {
    emitter: Emitter<T, ()>,
    predicate: P,
}

impl<T, P> Filter<T, P>
where
    P: Fn(&T) -> bool + Send + Sync,
{
    pub fn new(predicate: P) -> Self {
        Self {
            emitter: Emitter::new(),
            predicate,
        }
    }
}

pub type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

impl<T> Filter<T, ()> {
    /// ANDs a set of predicates; an empty set behaves as accept-all.
    pub fn merged(
        predicates: Vec<Predicate<T>>,
    ) -> Filter<T, impl Fn(&T) -> bool + Send + Sync> {
        Filter::new(move |item: &T| predicates.iter().all(|accept| accept(item)))
    }
}

impl<T, P> Sink<T> for Filter<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Fn(&T) -> bool + Send + Sync,
{
    fn process(&self, batch: Batch<T>) -> Result<()> {
        if batch.is_end() {
            return self.emitter.output(batch);
        }

        let kept: Vec<T> = batch
            .iter()
            .filter(|item| (self.predicate)(item))
            .cloned()
            .collect();

        if kept.is_empty() {
            Ok(())
        } else {
            self.emitter.output(Batch::new(kept))
        }
    }
}

impl<T, P> Stage<T, T, ()> for Filter<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Fn(&T) -> bool + Send + Sync,
{
    fn emitter(&self) -> &Emitter<T, ()> {
        &self.emitter
    }
}

/// Collects every received batch; useful as a terminal sink in tests and
/// dry runs.
#[derive(Default)]
pub struct VecSink<T> {
    batches: Mutex<Vec<Batch<T>>>,
}

impl<T> VecSink<T> {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn batches(&self) -> Vec<Batch<T>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn items(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|batch| batch.iter().cloned())
            .collect()
    }
}

impl<T: Send + Sync> Sink<T> for VecSink<T> {
    fn process(&self, batch: Batch<T>) -> Result<()> {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}

/// Composes a linear chain of stages into a runnable pipeline.
///
/// `input` starts from a [`Source`], `pipe` appends a mapper stage,
/// `send_output`/`send_error`/`send_log` attach extra fan-out sinks at the
/// current stage, and `pipe_sink`/`build` finish the chain. There is no
/// buffering between stages beyond what individual sources and sinks
/// provide; backpressure is the direct consequence of synchronous calls.
pub struct PipelineBuilder<T, E> {
    run: Box<dyn FnOnce() -> Result<()>>,
    stage: Emitter<T, E>,
}

impl<T: 'static, E: 'static> PipelineBuilder<T, E> {
    pub fn input<S>(source: S) -> Self
    where
        S: Source<T, E> + 'static,
    {
        let stage = source.emitter().clone();
        Self {
            run: Box::new(move || source.run()),
            stage,
        }
    }

    pub fn pipe<O, E2, M>(self, stage: M) -> PipelineBuilder<O, E2>
    where
        O: 'static,
        E2: 'static,
        M: Stage<T, O, E2> + 'static,
    {
        let next = Stage::emitter(&stage).clone();
        self.stage.attach_output(Arc::new(stage));
        PipelineBuilder {
            run: self.run,
            stage: next,
        }
    }

    pub fn send_output(self, sink: Arc<dyn Sink<T>>) -> Self {
        self.stage.attach_output(sink);
        self
    }

    pub fn send_error(self, sink: Arc<dyn Sink<E>>) -> Self {
        self.stage.attach_error(sink);
        self
    }

    pub fn send_log(self, sink: Arc<dyn Sink<String>>) -> Self {
        self.stage.attach_log(sink);
        self
    }

    pub fn pipe_sink(self, sink: Arc<dyn Sink<T>>) -> Pipeline {
        self.stage.attach_output(sink);
        Pipeline { run: self.run }
    }

    pub fn build(self) -> Pipeline {
        Pipeline { run: self.run }
    }
}

/// A composed pipeline, ready for execution.
pub struct Pipeline {
    run: Box<dyn FnOnce() -> Result<()>>,
}

impl Pipeline {
    /// Runs the original source to completion.
    pub fn run(self) -> Result<()> {
        (self.run)()
    }
}
