//! Single-pass resolution of a raw config tree into a [`RunConfig`].

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use super::error::{ConfigError, ConfigResult};
use super::expr::{Arg, Expr, Segment, Template};
use super::tree::{child_path, lookup, RunConfig};

/// Resolve every interpolation in `raw`, eagerly, exactly once.
///
/// Resolving an already-resolved tree returns an identical snapshot.
pub fn resolve(raw: &Value) -> ConfigResult<RunConfig> {
    let mut resolver = Resolver {
        root: raw,
        resolved: HashMap::new(),
        in_progress: HashSet::new(),
    };
    let tree = resolver.node("", raw)?;
    Ok(RunConfig::from_resolved(tree))
}

struct Resolver<'a> {
    root: &'a Value,
    /// Resolved string scalars by path, so shared references are evaluated once.
    resolved: HashMap<String, Value>,
    in_progress: HashSet<String>,
}

impl<'a> Resolver<'a> {
    fn node(&mut self, path: &str, value: &'a Value) -> ConfigResult<Value> {
        match value {
            Value::String(raw) => self.scalar(path, raw),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| self.node(&child_path(path, &i.to_string()), item))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.node(&child_path(path, key), item)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn scalar(&mut self, path: &str, raw: &str) -> ConfigResult<Value> {
        if !Template::is_candidate(raw) {
            return Ok(Value::String(raw.to_string()));
        }
        if let Some(done) = self.resolved.get(path) {
            return Ok(done.clone());
        }
        if !self.in_progress.insert(path.to_string()) {
            return Err(ConfigError::Cycle {
                key: path.to_string(),
            });
        }
        let template = Template::parse(raw, path)?;
        let value = self.template(path, &template);
        self.in_progress.remove(path);
        let value = value?;
        self.resolved.insert(path.to_string(), value.clone());
        Ok(value)
    }

    fn template(&mut self, path: &str, template: &Template) -> ConfigResult<Value> {
        match template.as_single() {
            Some(expr) => self.expr(path, expr),
            None => self.text(path, template).map(Value::String),
        }
    }

    /// Render every segment as text, whatever the interpolated types.
    fn text(&mut self, path: &str, template: &Template) -> ConfigResult<String> {
        let mut out = String::new();
        for segment in &template.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Interp(expr) => out.push_str(&render(&self.expr(path, expr)?)),
            }
        }
        Ok(out)
    }

    fn expr(&mut self, path: &str, expr: &Expr) -> ConfigResult<Value> {
        match expr {
            Expr::Ref(key) => self.reference(path, key),
            Expr::Call { op, args } => {
                let values = args
                    .iter()
                    .map(|arg| match arg {
                        Arg::Literal(v) => Ok(v.clone()),
                        Arg::Template(t) => self.template(path, t),
                        Arg::Quoted(t) => self.text(path, t).map(Value::String),
                    })
                    .collect::<ConfigResult<Vec<_>>>()?;
                op.apply(&values, path)
            }
        }
    }

    /// Resolve `key` as referenced from `path`.
    ///
    /// An interpolated node met partway along the key is resolved first and
    /// the rest of the key is looked up in its value.
    fn reference(&mut self, path: &str, key: &str) -> ConfigResult<Value> {
        let missing = || ConfigError::MissingKey {
            key: key.to_string(),
            path: path.to_string(),
        };
        let segments: Vec<&str> = key.split('.').collect();
        let mut node: &'a Value = self.root;
        let mut walked = String::new();
        for (i, segment) in segments.iter().enumerate() {
            if let Value::String(raw) = node {
                if Template::is_candidate(raw) {
                    let resolved = self.scalar(&walked, raw)?;
                    return lookup(&resolved, &segments[i..].join("."))
                        .cloned()
                        .ok_or_else(missing);
                }
            }
            node = lookup(node, segment).ok_or_else(missing)?;
            walked = child_path(&walked, segment);
        }
        self.node(key, node)
    }
}

/// String form of a value embedded in surrounding text.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
