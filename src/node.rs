//! Evaluable nodes: filter chains, properties, fetchable sources
//!
//! A [`Node`] is anything the engine can ask to produce a value. The
//! composable building blocks live here:
//! - [`FilterChain`] threads a running value through an ordered list of
//!   steps (a literal step replaces the running value outright),
//! - [`Property`] resolves a source (a path or an embedded value), runs
//!   the chain over it, and memoizes the output,
//! - [`Source`] is a property whose retrieval step is guarded by a
//!   single-flight state machine so concurrent evaluators share one
//!   fetch and one outcome,
//! - [`EvalNode`] evaluates another path, [`NativeFn`] wraps a native
//!   callable.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::engine::{Engine, EvalOptions};
use crate::error::EngineError;
use crate::sources::Fetch;
use crate::value::{Map, Value};

/// Evaluation context handed to a node.
///
/// `no_cache` defaults to false: memoized nodes return their cached
/// result when one exists.
#[derive(Debug, Clone, Default)]
pub struct Call {
    /// Running data value, threaded through filter chains.
    pub data: Option<Value>,
    /// Positional arguments for invocable targets.
    pub args: Vec<Value>,
    /// Keyword arguments for invocable targets.
    pub kwargs: Map,
    /// Skip memoized results and recompute.
    pub no_cache: bool,
}

impl Call {
    pub fn with_data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn uncached() -> Self {
        Self {
            no_cache: true,
            ..Default::default()
        }
    }
}

/// A value that can be evaluated by the engine.
#[async_trait]
pub trait Node: fmt::Debug + Send + Sync {
    /// Evaluate the node and return the computed value.
    async fn evaluate(&self, engine: &Engine, call: Call) -> Result<Value, EngineError>;

    /// True for nodes the resolver must realize before indexing into
    /// them during a path walk (properties and sources).
    fn is_property(&self) -> bool {
        false
    }
}

/// Ordered composition of filter steps threading a running value.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    steps: Vec<Value>,
}

impl FilterChain {
    pub fn new(steps: Vec<Value>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Strict left-to-right fold. A node step maps the running value
    /// through its evaluation; a literal step replaces it. An empty
    /// chain returns the initial data unchanged.
    pub async fn run(
        &self,
        engine: &Engine,
        data: Option<Value>,
        no_cache: bool,
    ) -> Result<Value, EngineError> {
        let mut data = data.unwrap_or_default();
        for step in &self.steps {
            data = match step {
                Value::Node(node) => {
                    let call = Call {
                        data: Some(data),
                        no_cache,
                        ..Default::default()
                    };
                    node.evaluate(engine, call).await?
                }
                literal => literal.clone(),
            };
        }
        Ok(data)
    }
}

#[async_trait]
impl Node for FilterChain {
    async fn evaluate(&self, engine: &Engine, call: Call) -> Result<Value, EngineError> {
        self.run(engine, call.data, call.no_cache).await
    }
}

/// A memoized, lazily evaluated reference: a source (resolution path or
/// embedded value) plus a filter chain applied to it.
#[derive(Debug)]
pub struct Property {
    source: Value,
    chain: FilterChain,
    args: Vec<Value>,
    kwargs: Map,
    cached: Mutex<Option<Value>>,
}

impl Property {
    pub fn new(source: Value) -> Self {
        Self::with_chain(source, FilterChain::default())
    }

    pub fn with_chain(source: Value, chain: FilterChain) -> Self {
        Self {
            source,
            chain,
            args: Vec::new(),
            kwargs: Map::new(),
            cached: Mutex::new(None),
        }
    }

    /// Fixed call arguments used when the source evaluates as a callable.
    pub fn with_call_args(mut self, args: Vec<Value>, kwargs: Map) -> Self {
        self.args = args;
        self.kwargs = kwargs;
        self
    }

    fn cached_result(&self) -> Option<Value> {
        self.cached.lock().expect("property cache lock").clone()
    }

    fn store_result(&self, value: Value) {
        // Last-write-wins; the lock is never held across an await.
        *self.cached.lock().expect("property cache lock") = Some(value);
    }

    /// Resolve the source: a string source is a path into the forest,
    /// anything else evaluates directly with the stored call arguments.
    async fn eval_source(&self, engine: &Engine, no_cache: bool) -> Result<Value, EngineError> {
        let source = match &self.source {
            Value::Str(path) => engine.resolve(path, no_cache).await?,
            other => other.clone(),
        };
        let opts = EvalOptions {
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            no_cache,
            ..Default::default()
        };
        engine.eval(&source, opts).await
    }
}

#[async_trait]
impl Node for Property {
    async fn evaluate(&self, engine: &Engine, call: Call) -> Result<Value, EngineError> {
        if !call.no_cache {
            if let Some(value) = self.cached_result() {
                debug!(source = ?self.source, "property cache hit");
                return Ok(value);
            }
        }
        let data = self.eval_source(engine, call.no_cache).await?;
        let result = self.chain.run(engine, Some(data), call.no_cache).await?;
        self.store_result(result.clone());
        Ok(result)
    }

    fn is_property(&self) -> bool {
        true
    }
}

/// Single-flight fetch state. `Fetched`/`Failed` are re-entrant: the
/// next requested fetch moves back to `Fetching`.
#[derive(Debug)]
enum FetchState {
    Idle,
    Fetching,
    Fetched(Value),
    Failed(Arc<EngineError>),
}

/// A property whose data comes from an external fetcher.
///
/// At most one fetch is in flight per instance: the first requester
/// transitions `Idle -> Fetching` and performs the fetch; concurrent
/// requesters wait on a completion signal and observe the initiator's
/// exact outcome, failures included.
#[derive(Debug)]
pub struct Source {
    locator: String,
    chain: FilterChain,
    fetcher: Arc<dyn Fetch>,
    cached: Mutex<Option<Value>>,
    state: Mutex<FetchState>,
    done: Notify,
}

impl Source {
    pub fn new(locator: impl Into<String>, fetcher: Arc<dyn Fetch>) -> Self {
        Self::with_chain(locator, fetcher, FilterChain::default())
    }

    pub fn with_chain(
        locator: impl Into<String>,
        fetcher: Arc<dyn Fetch>,
        chain: FilterChain,
    ) -> Self {
        Self {
            locator: locator.into(),
            chain,
            fetcher,
            cached: Mutex::new(None),
            state: Mutex::new(FetchState::Idle),
            done: Notify::new(),
        }
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Fetch the raw source data, joining an in-flight fetch when one
    /// exists instead of starting a duplicate.
    async fn fetch_single_flight(&self) -> Result<Value, EngineError> {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            let initiate = {
                let mut state = self.state.lock().expect("fetch state lock");
                match &*state {
                    FetchState::Fetching => {
                        // Register interest before releasing the lock so a
                        // completion between unlock and await is not lost.
                        notified.as_mut().enable();
                        false
                    }
                    _ => {
                        *state = FetchState::Fetching;
                        true
                    }
                }
            };
            if initiate {
                break;
            }
            notified.await;
            let state = self.state.lock().expect("fetch state lock");
            match &*state {
                FetchState::Fetched(value) => return Ok(value.clone()),
                FetchState::Failed(err) => return Err(EngineError::Shared(err.clone())),
                // A refetch started before we woke; join it.
                FetchState::Idle | FetchState::Fetching => continue,
            }
        }

        debug!(locator = %self.locator, "fetching source");
        match self.fetcher.fetch().await {
            Ok(value) => {
                *self.state.lock().expect("fetch state lock") = FetchState::Fetched(value.clone());
                self.done.notify_waiters();
                Ok(value)
            }
            Err(err) => {
                error!(locator = %self.locator, %err, "source fetch failed");
                let err = Arc::new(err);
                *self.state.lock().expect("fetch state lock") = FetchState::Failed(err.clone());
                self.done.notify_waiters();
                Err(EngineError::Shared(err))
            }
        }
    }
}

#[async_trait]
impl Node for Source {
    async fn evaluate(&self, engine: &Engine, call: Call) -> Result<Value, EngineError> {
        if !call.no_cache {
            if let Some(value) = self.cached.lock().expect("source cache lock").clone() {
                debug!(locator = %self.locator, "source cache hit");
                return Ok(value);
            }
        }
        let data = self.fetch_single_flight().await?;
        let result = self.chain.run(engine, Some(data), call.no_cache).await?;
        *self.cached.lock().expect("source cache lock") = Some(result.clone());
        Ok(result)
    }

    fn is_property(&self) -> bool {
        true
    }
}

/// Evaluates another path in the forest (`!eval` in documents).
#[derive(Debug, Clone)]
pub struct EvalNode {
    path: String,
}

impl EvalNode {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Node for EvalNode {
    async fn evaluate(&self, engine: &Engine, call: Call) -> Result<Value, EngineError> {
        let opts = EvalOptions {
            args: call.args,
            kwargs: call.kwargs,
            no_cache: call.no_cache,
            ..Default::default()
        };
        engine.eval_path(&self.path, opts).await
    }
}

/// A native callable exposed to the engine as a node.
pub struct NativeFn {
    name: String,
    func: Box<dyn Fn(Call) -> Result<Value, EngineError> + Send + Sync>,
}

impl NativeFn {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(Call) -> Result<Value, EngineError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFn").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Node for NativeFn {
    async fn evaluate(&self, _engine: &Engine, call: Call) -> Result<Value, EngineError> {
        (self.func)(call)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;
    use crate::filters::RegReplace;

    fn empty_engine() -> Engine {
        Engine::new(Vec::new())
    }

    /// Counts evaluations; returns a fixed value.
    fn counting_fn(counter: Arc<AtomicUsize>, value: Value) -> Value {
        Value::node(NativeFn::new("counting", move |_call| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(value.clone())
        }))
    }

    #[derive(Debug)]
    struct SlowFetcher {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Fetch for SlowFetcher {
        async fn fetch(&self) -> Result<Value, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                Err(EngineError::Fetch {
                    locator: "slow".into(),
                    message: "unreachable host".into(),
                })
            } else {
                Ok(Value::Str("payload".into()))
            }
        }
    }

    #[tokio::test]
    async fn filter_chain_threads_data() {
        let engine = empty_engine();
        let chain = FilterChain::new(vec![Value::node(RegReplace::new("hello", "bye").unwrap())]);
        let result = chain
            .run(&engine, Some(Value::Str("hello world".into())), false)
            .await
            .unwrap();
        assert_eq!(result, Value::Str("bye world".into()));
    }

    #[tokio::test]
    async fn filter_chain_literal_discards_prior_state() {
        let engine = empty_engine();
        let chain = FilterChain::new(vec![
            Value::Str("hello world".into()),
            Value::node(RegReplace::new("hello", "bye").unwrap()),
        ]);
        // The initial data is irrelevant once a literal step runs.
        let result = chain
            .run(&engine, Some(Value::Str("invalid hello".into())), false)
            .await
            .unwrap();
        assert_eq!(result, Value::Str("bye world".into()));
    }

    #[tokio::test]
    async fn empty_filter_chain_returns_data() {
        let engine = empty_engine();
        let chain = FilterChain::default();
        let result = chain
            .run(&engine, Some(Value::Int(7)), false)
            .await
            .unwrap();
        assert_eq!(result, Value::Int(7));
    }

    #[tokio::test]
    async fn property_literal_source() {
        let engine = empty_engine();
        let property = Property::new(Value::Int(1312));
        let result = property
            .evaluate(&engine, Call::default())
            .await
            .unwrap();
        assert_eq!(result, Value::Int(1312));
    }

    #[tokio::test]
    async fn property_caches_result() {
        let engine = empty_engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let property = Property::new(counting_fn(calls.clone(), Value::Int(5)));

        let first = property.evaluate(&engine, Call::default()).await.unwrap();
        let second = property.evaluate(&engine, Call::default()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // no_cache recomputes
        property.evaluate(&engine, Call::uncached()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn source_single_flight_success() {
        let engine = empty_engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = Source::new(
            "slow",
            Arc::new(SlowFetcher {
                calls: calls.clone(),
                fail: false,
            }),
        );

        let results = join_all((0..5).map(|_| source.evaluate(&engine, Call::default()))).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), Value::Str("payload".into()));
        }
    }

    #[tokio::test]
    async fn source_single_flight_shares_failure() {
        let engine = empty_engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = Source::new(
            "slow",
            Arc::new(SlowFetcher {
                calls: calls.clone(),
                fail: true,
            }),
        );

        let results = join_all((0..4).map(|_| source.evaluate(&engine, Call::default()))).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            let err = result.unwrap_err();
            assert!(matches!(err.root_cause(), EngineError::Fetch { .. }));
        }
    }

    #[tokio::test]
    async fn source_refetches_when_uncached() {
        let engine = empty_engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = Source::new(
            "slow",
            Arc::new(SlowFetcher {
                calls: calls.clone(),
                fail: false,
            }),
        );

        source.evaluate(&engine, Call::default()).await.unwrap();
        source.evaluate(&engine, Call::default()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        source.evaluate(&engine, Call::uncached()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
