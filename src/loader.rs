//! Declarative document loader
//!
//! Turns a YAML document stream into the document forest the engine
//! walks. Plain YAML loads as plain values; local tags construct nodes:
//!
//! | tag            | node                                  |
//! |----------------|---------------------------------------|
//! | `!property`    | [`Property`] (path or `[source, filters...]`) |
//! | `!filters`     | [`FilterChain`]                       |
//! | `!eval`        | [`EvalNode`]                          |
//! | `!file`        | [`Source`] over [`FileFetcher`]       |
//! | `!include`     | [`Source`] over [`IncludeFetcher`]    |
//! | `!http`        | [`Source`] over [`HttpFetcher`]       |
//! | `!re.search`   | [`RegSearch`]                         |
//! | `!re.replace`  | [`RegReplace`]                        |
//! | `!parse.json`  | [`ParseJson`]                         |
//! | `!parse.yaml`  | [`ParseYaml`]                         |
//! | `!parse.xml`   | [`ParseXml`]                          |
//! | `!iter.join`   | [`Join`]                              |
//! | `!iter.map`    | [`MapEach`]                           |
//! | `!dict.schema` | [`Schema`]                            |
//!
//! Unknown tags are a load error.

use std::sync::Arc;

use serde::Deserialize;

use crate::error::EngineError;
use crate::filters::{Join, MapEach, ParseJson, ParseXml, ParseYaml, RegReplace, RegSearch, Schema};
use crate::node::{EvalNode, FilterChain, Property, Source};
use crate::sources::{FileFetcher, HttpFetcher, IncludeFetcher};
use crate::value::{yaml_key, Map, Value};

/// Parse a YAML stream into an ordered document forest.
pub fn load_documents(text: &str) -> Result<Vec<Value>, EngineError> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document)?;
        documents.push(convert(value)?);
    }
    Ok(documents)
}

fn convert(value: serde_yaml::Value) -> Result<Value, EngineError> {
    match value {
        serde_yaml::Value::Tagged(tagged) => {
            let tag = tagged.tag.to_string();
            build_node(tag.trim_start_matches('!'), tagged.value)
        }
        serde_yaml::Value::Sequence(items) => Ok(Value::Seq(
            items.into_iter().map(convert).collect::<Result<_, _>>()?,
        )),
        serde_yaml::Value::Mapping(mapping) => {
            let mut map = Map::new();
            for (key, item) in mapping {
                map.insert(yaml_key(&key)?, convert(item)?);
            }
            Ok(Value::Map(map))
        }
        scalar => Value::from_yaml(scalar),
    }
}

/// A tag payload is one value or a sequence of values.
fn payload_items(value: serde_yaml::Value) -> Vec<serde_yaml::Value> {
    match value {
        serde_yaml::Value::Sequence(items) => items,
        serde_yaml::Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn expect_string(tag: &str, value: serde_yaml::Value) -> Result<String, EngineError> {
    match value {
        serde_yaml::Value::String(s) => Ok(s),
        other => Err(EngineError::Load(format!(
            "tag '!{tag}' expects a string, got {other:?}"
        ))),
    }
}

fn expect_empty(tag: &str, value: serde_yaml::Value) -> Result<(), EngineError> {
    match value {
        serde_yaml::Value::Null => Ok(()),
        serde_yaml::Value::String(s) if s.is_empty() => Ok(()),
        other => Err(EngineError::Load(format!(
            "tag '!{tag}' takes no arguments, got {other:?}"
        ))),
    }
}

/// Convert the trailing payload items into a filter chain.
fn chain_from(items: impl IntoIterator<Item = serde_yaml::Value>) -> Result<FilterChain, EngineError> {
    Ok(FilterChain::new(
        items
            .into_iter()
            .map(convert)
            .collect::<Result<Vec<_>, _>>()?,
    ))
}

/// `[locator, filters...]` or a bare locator string.
fn locator_and_chain(
    tag: &str,
    value: serde_yaml::Value,
) -> Result<(String, FilterChain), EngineError> {
    let mut items = payload_items(value).into_iter();
    let locator = expect_string(
        tag,
        items
            .next()
            .ok_or_else(|| EngineError::Load(format!("tag '!{tag}' needs a locator")))?,
    )?;
    Ok((locator, chain_from(items)?))
}

fn build_node(tag: &str, value: serde_yaml::Value) -> Result<Value, EngineError> {
    match tag {
        "property" => {
            let mut items = payload_items(value).into_iter();
            let source = convert(items.next().ok_or_else(|| {
                EngineError::Load("tag '!property' needs a source".to_string())
            })?)?;
            Ok(Value::node(Property::with_chain(source, chain_from(items)?)))
        }
        "filters" => Ok(Value::node(chain_from(payload_items(value))?)),
        "eval" => Ok(Value::node(EvalNode::new(expect_string(tag, value)?))),
        "file" => {
            let (locator, chain) = locator_and_chain(tag, value)?;
            let fetcher = Arc::new(FileFetcher::new(&locator));
            Ok(Value::node(Source::with_chain(locator, fetcher, chain)))
        }
        "include" => {
            let (locator, chain) = locator_and_chain(tag, value)?;
            let fetcher = Arc::new(IncludeFetcher::new(&locator));
            Ok(Value::node(Source::with_chain(locator, fetcher, chain)))
        }
        "http" => {
            let (locator, chain) = locator_and_chain(tag, value)?;
            let fetcher = Arc::new(HttpFetcher::new(&locator)?);
            Ok(Value::node(Source::with_chain(locator, fetcher, chain)))
        }
        "re.search" => {
            let mut items = payload_items(value).into_iter();
            let pattern = expect_string(
                tag,
                items.next().ok_or_else(|| {
                    EngineError::Load("tag '!re.search' needs a pattern".to_string())
                })?,
            )?;
            let named_groups = match items.next() {
                Some(serde_yaml::Value::Bool(b)) => b,
                None => false,
                Some(other) => {
                    return Err(EngineError::Load(format!(
                        "tag '!re.search' named-groups flag must be a bool, got {other:?}"
                    )))
                }
            };
            Ok(Value::node(RegSearch::new(&pattern, named_groups)?))
        }
        "re.replace" => {
            let mut items = payload_items(value).into_iter();
            let pattern = items
                .next()
                .map(|v| expect_string(tag, v))
                .transpose()?
                .ok_or_else(|| EngineError::Load("tag '!re.replace' needs a pattern".to_string()))?;
            let replacement = items
                .next()
                .map(|v| expect_string(tag, v))
                .transpose()?
                .ok_or_else(|| {
                    EngineError::Load("tag '!re.replace' needs a replacement".to_string())
                })?;
            Ok(Value::node(RegReplace::new(&pattern, replacement)?))
        }
        "parse.json" => {
            expect_empty(tag, value)?;
            Ok(Value::node(ParseJson))
        }
        "parse.yaml" => {
            expect_empty(tag, value)?;
            Ok(Value::node(ParseYaml))
        }
        "parse.xml" => {
            let path = match value {
                serde_yaml::Value::Null => String::new(),
                other => expect_string(tag, other)?,
            };
            Ok(Value::node(ParseXml::new(path)))
        }
        "iter.join" => {
            let iterables = payload_items(value)
                .into_iter()
                .map(convert)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::node(Join::new(iterables)))
        }
        "iter.map" => {
            let mut items = payload_items(value).into_iter();
            let func = convert(items.next().ok_or_else(|| {
                EngineError::Load("tag '!iter.map' needs a function".to_string())
            })?)?;
            if items.next().is_some() {
                return Err(EngineError::Load(
                    "tag '!iter.map' takes a single function".to_string(),
                ));
            }
            Ok(Value::node(MapEach::new(func)))
        }
        "dict.schema" => {
            let serde_yaml::Value::Mapping(mapping) = value else {
                return Err(EngineError::Load(
                    "tag '!dict.schema' expects a mapping of fields".to_string(),
                ));
            };
            let mut fields = Vec::with_capacity(mapping.len());
            for (key, item) in mapping {
                fields.push((yaml_key(&key)?, convert(item)?));
            }
            Ok(Value::node(Schema::new(fields)))
        }
        other => Err(EngineError::Load(format!("unknown tag '!{other}'"))),
    }
}
