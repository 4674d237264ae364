//! Leaf transformations applied to running data
//!
//! Every filter implements [`Node`] over the `data` it is handed:
//! regex search/replace over text, JSON/YAML/XML parsing of text into
//! structured values, and static structural transforms (sequence
//! joining, per-element mapping, fixed-schema map construction).

use std::borrow::Cow;

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::node::{Call, Node};
use crate::value::{Map, Value};

fn transform_err(filter: &'static str, message: impl Into<String>) -> EngineError {
    EngineError::Transform {
        filter,
        message: message.into(),
    }
}

fn expect_text<'a>(filter: &'static str, data: &'a Option<Value>) -> Result<&'a str, EngineError> {
    match data {
        Some(Value::Str(text)) => Ok(text),
        Some(other) => Err(transform_err(
            filter,
            format!("expected text input, got {}", other.kind()),
        )),
        None => Err(transform_err(filter, "no input data")),
    }
}

/// Apply one filter step to a data value: nodes evaluate, literals
/// replace. Shared by the mapping and schema filters.
async fn apply_step(
    engine: &Engine,
    step: &Value,
    data: Value,
    no_cache: bool,
) -> Result<Value, EngineError> {
    match step {
        Value::Node(node) => {
            let call = Call {
                data: Some(data),
                no_cache,
                ..Default::default()
            };
            node.evaluate(engine, call).await
        }
        literal => Ok(literal.clone()),
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, EngineError> {
    Regex::new(pattern).map_err(|err| EngineError::Load(format!("invalid regex '{pattern}': {err}")))
}

/// Search text with a regular expression, returning the capture groups
/// (`!re.search`). No match yields null.
#[derive(Debug, Clone)]
pub struct RegSearch {
    pattern: Regex,
    named_groups: bool,
}

impl RegSearch {
    pub fn new(pattern: &str, named_groups: bool) -> Result<Self, EngineError> {
        Ok(Self {
            pattern: compile_regex(pattern)?,
            named_groups,
        })
    }
}

#[async_trait]
impl Node for RegSearch {
    async fn evaluate(&self, _engine: &Engine, call: Call) -> Result<Value, EngineError> {
        let text = expect_text("re.search", &call.data)?;
        let Some(caps) = self.pattern.captures(text) else {
            return Ok(Value::Null);
        };
        if self.named_groups {
            let map: Map = self
                .pattern
                .capture_names()
                .flatten()
                .map(|name| {
                    let value = caps
                        .name(name)
                        .map(|m| Value::Str(m.as_str().to_owned()))
                        .unwrap_or_default();
                    (name.to_owned(), value)
                })
                .collect();
            Ok(Value::Map(map))
        } else {
            let groups = caps
                .iter()
                .skip(1)
                .map(|group| {
                    group
                        .map(|m| Value::Str(m.as_str().to_owned()))
                        .unwrap_or_default()
                })
                .collect();
            Ok(Value::Seq(groups))
        }
    }
}

/// Search and replace text with a regular expression (`!re.replace`).
/// Every occurrence is replaced.
#[derive(Debug, Clone)]
pub struct RegReplace {
    pattern: Regex,
    replacement: String,
}

impl RegReplace {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self, EngineError> {
        Ok(Self {
            pattern: compile_regex(pattern)?,
            replacement: replacement.into(),
        })
    }
}

#[async_trait]
impl Node for RegReplace {
    async fn evaluate(&self, _engine: &Engine, call: Call) -> Result<Value, EngineError> {
        let text = expect_text("re.replace", &call.data)?;
        let replaced = self.pattern.replace_all(text, self.replacement.as_str());
        Ok(Value::Str(replaced.into_owned()))
    }
}

/// Parse JSON text into a structured value (`!parse.json`).
#[derive(Debug, Clone, Default)]
pub struct ParseJson;

#[async_trait]
impl Node for ParseJson {
    async fn evaluate(&self, _engine: &Engine, call: Call) -> Result<Value, EngineError> {
        let text = expect_text("parse.json", &call.data)?;
        let parsed: serde_json::Value =
            serde_json::from_str(text).map_err(|err| transform_err("parse.json", err.to_string()))?;
        Ok(Value::from_json(parsed))
    }
}

/// Parse YAML text into a structured value (`!parse.yaml`). Tags are
/// rejected: parsed data never contains live nodes.
#[derive(Debug, Clone, Default)]
pub struct ParseYaml;

#[async_trait]
impl Node for ParseYaml {
    async fn evaluate(&self, _engine: &Engine, call: Call) -> Result<Value, EngineError> {
        let text = expect_text("parse.yaml", &call.data)?;
        let parsed: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|err| transform_err("parse.yaml", err.to_string()))?;
        Value::from_yaml(parsed).map_err(|err| transform_err("parse.yaml", err.to_string()))
    }
}

/// Parse XML text into an element tree (`!parse.xml`), optionally
/// selecting descendants through a `/`-separated child-tag path.
///
/// Elements are represented as mappings with `tag`, `attrs`, `children`
/// and `text` keys.
#[derive(Debug, Clone, Default)]
pub struct ParseXml {
    path: String,
}

impl ParseXml {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Debug, Default)]
struct XmlElement {
    tag: String,
    attrs: Map,
    children: Vec<XmlElement>,
    text: String,
}

impl XmlElement {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, EngineError> {
        let mut attrs = Map::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|err| transform_err("parse.xml", err.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|err| transform_err("parse.xml", err.to_string()))?;
            attrs.insert(key, Value::Str(value.into_owned()));
        }
        Ok(Self {
            tag: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            attrs,
            children: Vec::new(),
            text: String::new(),
        })
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("tag".into(), Value::Str(self.tag.clone()));
        map.insert("attrs".into(), Value::Map(self.attrs.clone()));
        map.insert(
            "children".into(),
            Value::Seq(self.children.iter().map(XmlElement::to_value).collect()),
        );
        map.insert("text".into(), Value::Str(self.text.clone()));
        Value::Map(map)
    }
}

fn parse_xml_tree(text: &str) -> Result<XmlElement, EngineError> {
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;
    loop {
        let event = reader
            .read_event()
            .map_err(|err| transform_err("parse.xml", err.to_string()))?;
        match event {
            Event::Start(start) => stack.push(XmlElement::from_start(&start)?),
            Event::Empty(start) => {
                let element = XmlElement::from_start(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| transform_err("parse.xml", "unbalanced closing tag"))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(t) => {
                let text: Cow<'_, str> = t
                    .unescape()
                    .map_err(|err| transform_err("parse.xml", err.to_string()))?;
                // Inter-element whitespace is noise, not content.
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(trimmed);
                    }
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    root.ok_or_else(|| transform_err("parse.xml", "document has no root element"))
}

fn attach(
    stack: &mut Vec<XmlElement>,
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), EngineError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(transform_err("parse.xml", "multiple root elements")),
    }
    Ok(())
}

#[async_trait]
impl Node for ParseXml {
    async fn evaluate(&self, _engine: &Engine, call: Call) -> Result<Value, EngineError> {
        let text = expect_text("parse.xml", &call.data)?;
        let tree = parse_xml_tree(text)?;
        if self.path.is_empty() {
            return Ok(tree.to_value());
        }
        let mut matches: Vec<&XmlElement> = vec![&tree];
        for part in self.path.split('/') {
            matches = matches
                .iter()
                .flat_map(|element| element.children.iter().filter(|child| child.tag == part))
                .collect();
        }
        Ok(Value::Seq(
            matches.iter().map(|element| element.to_value()).collect(),
        ))
    }
}

/// Concatenate declared sequences onto the running data (`!iter.join`).
/// By default the declared sequences follow the data; `before` puts
/// them in front.
#[derive(Debug, Clone, Default)]
pub struct Join {
    iterables: Vec<Value>,
    before: bool,
}

impl Join {
    pub fn new(iterables: Vec<Value>) -> Self {
        Self {
            iterables,
            before: false,
        }
    }

    pub fn before(mut self) -> Self {
        self.before = true;
        self
    }
}

#[async_trait]
impl Node for Join {
    async fn evaluate(&self, _engine: &Engine, call: Call) -> Result<Value, EngineError> {
        let mut joined = Vec::new();
        for iterable in &self.iterables {
            match iterable {
                Value::Seq(items) => joined.extend(items.iter().cloned()),
                other => {
                    return Err(transform_err(
                        "iter.join",
                        format!("expected sequence, got {}", other.kind()),
                    ))
                }
            }
        }
        match call.data {
            None | Some(Value::Null) => Ok(Value::Seq(joined)),
            Some(Value::Seq(mut data)) => {
                if self.before {
                    joined.append(&mut data);
                    Ok(Value::Seq(joined))
                } else {
                    data.append(&mut joined);
                    Ok(Value::Seq(data))
                }
            }
            Some(other) => Err(transform_err(
                "iter.join",
                format!("expected sequence data, got {}", other.kind()),
            )),
        }
    }
}

/// Map a filter over the running data (`!iter.map`): over each value of
/// a mapping, each element of a sequence, or the whole value otherwise.
/// Text counts as a scalar, not a sequence.
#[derive(Debug, Clone)]
pub struct MapEach {
    func: Value,
}

impl MapEach {
    pub fn new(func: Value) -> Self {
        Self { func }
    }
}

#[async_trait]
impl Node for MapEach {
    async fn evaluate(&self, engine: &Engine, call: Call) -> Result<Value, EngineError> {
        let data = call.data.unwrap_or_default();
        match data {
            Value::Map(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    out.insert(key, apply_step(engine, &self.func, item, call.no_cache).await?);
                }
                Ok(Value::Map(out))
            }
            Value::Seq(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(apply_step(engine, &self.func, item, call.no_cache).await?);
                }
                Ok(Value::Seq(out))
            }
            scalar => apply_step(engine, &self.func, scalar, call.no_cache).await,
        }
    }
}

/// Build a mapping from named sub-filters (`!dict.schema`): each field's
/// filter sees the same input data.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<(String, Value)>,
}

impl Schema {
    pub fn new(fields: Vec<(String, Value)>) -> Self {
        Self { fields }
    }
}

#[async_trait]
impl Node for Schema {
    async fn evaluate(&self, engine: &Engine, call: Call) -> Result<Value, EngineError> {
        let data = call.data.unwrap_or_default();
        let mut out = Map::new();
        for (key, filter) in &self.fields {
            let value = apply_step(engine, filter, data.clone(), call.no_cache).await?;
            out.insert(key.clone(), value);
        }
        Ok(Value::Map(out))
    }
}
