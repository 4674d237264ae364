//! Resolver/evaluator walking the document forest
//!
//! The [`Engine`] owns the parsed document forest and exposes the three
//! entry points: [`Engine::resolve`] walks a dotted path (realizing any
//! property it steps through), [`Engine::eval`] dispatches a value
//! through its node evaluation (optionally flattening the result
//! recursively and concurrently), and [`Engine::eval_path`] composes the
//! two.

use futures::future::{try_join_all, BoxFuture};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::loader;
use crate::node::Call;
use crate::value::Value;

/// Options for [`Engine::eval`] and [`Engine::eval_path`].
#[derive(Debug, Clone, Default)]
pub struct EvalOptions {
    /// Positional arguments passed to the evaluated node.
    pub args: Vec<Value>,
    /// Keyword arguments passed to the evaluated node.
    pub kwargs: crate::value::Map,
    /// Skip memoized node results and recompute.
    pub no_cache: bool,
    /// Recursively realize every nested node in the result.
    pub flat: bool,
    /// Resolve relative to this value instead of the document forest.
    pub root: Option<Value>,
}

impl EvalOptions {
    pub fn flat() -> Self {
        Self {
            flat: true,
            ..Default::default()
        }
    }

    pub fn no_cache() -> Self {
        Self {
            no_cache: true,
            ..Default::default()
        }
    }
}

/// Engine reading a declarative document stream and evaluating nodes.
#[derive(Debug, Default)]
pub struct Engine {
    documents: Vec<Value>,
}

impl Engine {
    /// Build an engine over a pre-parsed document forest.
    pub fn new(documents: Vec<Value>) -> Self {
        Self { documents }
    }

    /// Parse a YAML document stream and build the engine over it. The
    /// loader runs once, here; the forest is read-only afterwards apart
    /// from node-internal caches.
    pub fn load(text: &str) -> Result<Self, EngineError> {
        let documents = loader::load_documents(text)?;
        info!(documents = documents.len(), "loaded document forest");
        Ok(Self::new(documents))
    }

    /// The loaded document forest.
    pub fn documents(&self) -> &[Value] {
        &self.documents
    }

    /// Return the item addressed by `path`, evaluating properties when
    /// required to access members.
    ///
    /// `path` is a list of selectors joined by `'.'`. An all-digit
    /// selector is a sequence index (index-first, even when the current
    /// value is a mapping with that literal key); anything else is a
    /// mapping key. Underscore-prefixed selectors are reserved and fail
    /// with [`EngineError::AccessDenied`]. The terminal value is
    /// returned as found, possibly still an unevaluated node.
    pub async fn resolve(&self, path: &str, no_cache: bool) -> Result<Value, EngineError> {
        self.resolve_from(None, path, no_cache).await
    }

    /// [`Engine::resolve`] starting from `root` instead of the forest.
    pub async fn resolve_from(
        &self,
        root: Option<Value>,
        path: &str,
        no_cache: bool,
    ) -> Result<Value, EngineError> {
        debug!(path, "resolving path");
        let mut current = root.unwrap_or_else(|| Value::Seq(self.documents.clone()));
        for segment in path.split('.') {
            // Traversal only indexes into realized values.
            if let Value::Node(node) = &current {
                if node.is_property() {
                    let node = node.clone();
                    let call = Call {
                        no_cache,
                        ..Default::default()
                    };
                    current = node.evaluate(self, call).await?;
                }
            }
            current = step_into(&current, path, segment)?;
        }
        Ok(current)
    }

    /// Evaluate `value`: nodes run their evaluation with the provided
    /// arguments, literals pass through. With `opts.flat`, every nested
    /// node in the result is realized too; sub-evaluations at the same
    /// fan-out level run concurrently and fail fast, and results are
    /// reassembled in original key/position order.
    pub async fn eval(&self, value: &Value, opts: EvalOptions) -> Result<Value, EngineError> {
        let value = match value {
            Value::Node(node) => {
                let call = Call {
                    data: None,
                    args: opts.args.clone(),
                    kwargs: opts.kwargs.clone(),
                    no_cache: opts.no_cache,
                };
                node.evaluate(self, call).await?
            }
            other => other.clone(),
        };
        if !opts.flat {
            return Ok(value);
        }
        self.flatten(value, opts.no_cache).await
    }

    /// Resolve `path`, then evaluate whatever it points at.
    pub async fn eval_path(&self, path: &str, opts: EvalOptions) -> Result<Value, EngineError> {
        let target = self
            .resolve_from(opts.root.clone(), path, opts.no_cache)
            .await?;
        self.eval(&target, opts).await
    }

    /// Recursive concurrent realization of nested nodes. Boxed because
    /// the future recurses through itself at every container level.
    fn flatten(&self, value: Value, no_cache: bool) -> BoxFuture<'_, Result<Value, EngineError>> {
        Box::pin(async move {
            let value = match value {
                Value::Node(node) => {
                    let call = Call {
                        no_cache,
                        ..Default::default()
                    };
                    node.evaluate(self, call).await?
                }
                other => other,
            };
            match value {
                Value::Map(map) => {
                    let entries = try_join_all(map.into_iter().map(|(key, item)| async move {
                        let item = self
                            .flatten(item, no_cache)
                            .await
                            .map_err(EngineError::into_composite)?;
                        Ok::<_, EngineError>((key, item))
                    }))
                    .await?;
                    Ok(Value::Map(entries.into_iter().collect()))
                }
                Value::Seq(items) => {
                    let items = try_join_all(
                        items
                            .into_iter()
                            .map(|item| self.flatten(item, no_cache)),
                    )
                    .await
                    .map_err(EngineError::into_composite)?;
                    Ok(Value::Seq(items))
                }
                other => Ok(other),
            }
        })
    }
}

/// Interpret one path segment against a realized value.
fn step_into(current: &Value, path: &str, segment: &str) -> Result<Value, EngineError> {
    if segment.starts_with('_') {
        return Err(EngineError::AccessDenied {
            segment: segment.to_owned(),
        });
    }
    let not_found = || EngineError::PathNotFound {
        path: path.to_owned(),
        segment: segment.to_owned(),
    };
    // Index-first: an all-digit segment is always a sequence index.
    if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
        let index: usize = segment.parse().map_err(|_| not_found())?;
        return match current {
            Value::Seq(items) => items.get(index).cloned().ok_or_else(not_found),
            _ => Err(not_found()),
        };
    }
    match current {
        Value::Map(map) => map.get(segment).cloned().ok_or_else(not_found),
        _ => Err(not_found()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::node::{NativeFn, Property};
    use crate::value::Map;

    fn doc(yaml: &str) -> Engine {
        Engine::load(yaml).unwrap()
    }

    fn returning(value: Value) -> Value {
        Value::node(NativeFn::new("returning", move |_| Ok(value.clone())))
    }

    #[tokio::test]
    async fn resolve_nested_keys() {
        let engine = doc("a:\n  b: x\n");
        let value = engine.resolve("0.a.b", false).await.unwrap();
        assert_eq!(value, Value::Str("x".into()));
    }

    #[tokio::test]
    async fn resolve_sequence_index() {
        let engine = doc("items: [p, q, r]\n");
        let value = engine.resolve("0.items.1", false).await.unwrap();
        assert_eq!(value, Value::Str("q".into()));
    }

    #[tokio::test]
    async fn digit_segment_never_reads_mapping_keys() {
        // "1" is a literal mapping key here, but digit segments are
        // always sequence indexes.
        let engine = doc("m:\n  \"1\": x\n");
        let err = engine.resolve("0.m.1", false).await.unwrap_err();
        assert!(matches!(err, EngineError::PathNotFound { .. }));
    }

    #[tokio::test]
    async fn reserved_member_is_denied() {
        let engine = doc("_secret: 42\n");
        let err = engine.resolve("0._secret", false).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::AccessDenied { ref segment } if segment == "_secret"
        ));
    }

    #[tokio::test]
    async fn missing_segment_is_not_found() {
        let engine = doc("a: 1\n");
        let err = engine.resolve("0.b", false).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::PathNotFound { ref segment, .. } if segment == "b"
        ));
    }

    #[tokio::test]
    async fn resolve_through_property() {
        let mut root = Map::new();
        root.insert(
            "emma".into(),
            Value::Map(Map::from([("name".into(), Value::Str("goldman".into()))])),
        );
        root.insert(
            "shadow".into(),
            Value::node(Property::new(Value::Str("0.emma".into()))),
        );
        let engine = Engine::new(vec![Value::Map(root)]);

        let value = engine.resolve("0.shadow.name", false).await.unwrap();
        assert_eq!(value, Value::Str("goldman".into()));
    }

    #[tokio::test]
    async fn terminal_property_stays_lazy() {
        let property = Value::node(Property::new(Value::Int(5)));
        let engine = Engine::new(vec![Value::Map(Map::from([("p".into(), property)]))]);
        let value = engine.resolve("0.p", false).await.unwrap();
        assert!(matches!(value, Value::Node(_)));
    }

    #[tokio::test]
    async fn eval_literal_passes_through() {
        let engine = Engine::new(Vec::new());
        let value = engine
            .eval(&Value::Str("plain".into()), EvalOptions::default())
            .await
            .unwrap();
        assert_eq!(value, Value::Str("plain".into()));
    }

    #[tokio::test]
    async fn eval_flat_realizes_map_values() {
        let engine = Engine::new(Vec::new());
        let value = Value::Map(Map::from([("k".into(), returning(Value::Int(5)))]));
        let flat = engine.eval(&value, EvalOptions::flat()).await.unwrap();
        assert_eq!(flat, Value::Map(Map::from([("k".into(), Value::Int(5))])));
    }

    #[tokio::test]
    async fn eval_flat_preserves_sequence_order() {
        let engine = Engine::new(Vec::new());
        let value = Value::Seq(vec![Value::Str("A".into()), returning(Value::Int(5))]);
        let flat = engine.eval(&value, EvalOptions::flat()).await.unwrap();
        assert_eq!(
            flat,
            Value::Seq(vec![Value::Str("A".into()), Value::Int(5)])
        );
    }

    #[tokio::test]
    async fn eval_flat_recurses_into_nested_structures() {
        let engine = Engine::new(Vec::new());
        let nested = Value::Map(Map::from([(
            "outer".into(),
            Value::Seq(vec![returning(Value::Seq(vec![returning(Value::Int(1))]))]),
        )]));
        let flat = engine.eval(&nested, EvalOptions::flat()).await.unwrap();
        assert_eq!(
            flat,
            Value::Map(Map::from([(
                "outer".into(),
                Value::Seq(vec![Value::Seq(vec![Value::Int(1)])])
            )]))
        );
    }

    #[tokio::test]
    async fn eval_flat_fails_fast_with_composite() {
        let engine = Engine::new(Vec::new());
        let failing = Value::node(NativeFn::new("failing", |_| {
            Err(EngineError::Transform {
                filter: "failing",
                message: "boom".into(),
            })
        }));
        let value = Value::Seq(vec![Value::Int(1), failing]);
        let err = engine
            .eval(&value, EvalOptions::flat())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Composite(_)));
        assert!(matches!(err.root_cause(), EngineError::Transform { .. }));
    }

    #[tokio::test]
    async fn eval_path_composes_resolve_and_eval() {
        let engine = doc("greeting: hello\n");
        let value = engine
            .eval_path("0.greeting", EvalOptions::default())
            .await
            .unwrap();
        assert_eq!(value, Value::Str("hello".into()));
    }

    #[tokio::test]
    async fn eval_path_with_root_override() {
        let engine = Engine::new(Vec::new());
        let root = Value::Map(Map::from([("x".into(), Value::Int(9))]));
        let opts = EvalOptions {
            root: Some(root),
            ..Default::default()
        };
        let value = engine.eval_path("x", opts).await.unwrap();
        assert_eq!(value, Value::Int(9));
    }

    #[tokio::test]
    async fn property_evaluated_once_per_traversal() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let inner = Value::node(NativeFn::new("inner", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Map(Map::from([(
                "name".into(),
                Value::Str("goldman".into()),
            )])))
        }));
        let engine = Engine::new(vec![Value::Map(Map::from([(
            "p".into(),
            Value::node(Property::new(inner)),
        )]))]);

        let value = engine.resolve("0.p.name", false).await.unwrap();
        assert_eq!(value, Value::Str("goldman".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
