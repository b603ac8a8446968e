//! Shareable objects: capability descriptors, call arguments and the trait a
//! local object implements to be registered with a `Sharer`.

use std::collections::BTreeMap;

use crate::error::{Error, RemoteError};
use crate::identity::Uid;
use crate::sharer::Sharer;
use crate::value::{NdArray, Value};

/// One callable method as advertised to peers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionSpec {
    pub name: String,
    pub params: Vec<String>,
    pub doc: Option<String>,
    /// Proxies may remember the first successful result and skip later round trips.
    pub cache_result: bool,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn params(mut self, params: &[&str]) -> Self {
        self.params = params.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache_result = true;
        self
    }
}

/// Static list of what an object exposes: methods and property names.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectDescriptor {
    pub functions: Vec<FunctionSpec>,
    pub properties: Vec<String>,
}

impl ObjectDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(mut self, spec: FunctionSpec) -> Self {
        self.functions.push(spec);
        self
    }

    pub fn property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(name.into());
        self
    }

    pub fn get_function(&self, name: &str) -> Option<&FunctionSpec> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// Introspection reply: `{id, properties: [name..], functions: [(name, {doc,
/// param_spec, cache_result}) ..]}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub uid: Uid,
    pub descriptor: ObjectDescriptor,
}

impl ObjectInfo {
    pub fn to_value(&self) -> Value {
        let functions = self
            .descriptor
            .functions
            .iter()
            .map(|f| {
                let mut opts = BTreeMap::new();
                opts.insert(
                    "doc".to_string(),
                    f.doc.clone().map(Value::Str).unwrap_or_default(),
                );
                opts.insert(
                    "param_spec".to_string(),
                    Value::List(f.params.iter().map(|p| Value::from(p.as_str())).collect()),
                );
                opts.insert("cache_result".to_string(), Value::Bool(f.cache_result));
                Value::List(vec![Value::from(f.name.as_str()), Value::Map(opts)])
            })
            .collect();
        let mut map = BTreeMap::new();
        map.insert("id".to_string(), Value::Uid(self.uid));
        map.insert(
            "properties".to_string(),
            Value::List(
                self.descriptor
                    .properties
                    .iter()
                    .map(|p| Value::from(p.as_str()))
                    .collect(),
            ),
        );
        map.insert("functions".to_string(), Value::List(functions));
        Value::Map(map)
    }

    /// Parse an introspection reply. `None` if it is not shaped like one.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_map()?;
        let uid = map.get("id")?.as_uid()?;
        let properties = map
            .get("properties")?
            .as_list()?
            .iter()
            .map(|p| p.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()?;
        let mut functions = Vec::new();
        for entry in map.get("functions")?.as_list()? {
            let [name, opts] = entry.as_list()? else {
                return None;
            };
            let opts = opts.as_map()?;
            functions.push(FunctionSpec {
                name: name.as_str()?.to_string(),
                params: opts
                    .get("param_spec")
                    .and_then(Value::as_list)
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect(),
                doc: opts.get("doc").and_then(Value::as_str).map(str::to_string),
                cache_result: opts
                    .get("cache_result")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            });
        }
        Some(Self {
            uid,
            descriptor: ObjectDescriptor {
                functions,
                properties,
            },
        })
    }
}

/// Positional and keyword arguments of one call or signal.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Args {
    pub positional: Vec<Value>,
    pub named: BTreeMap<String, Value>,
}

impl Args {
    pub fn new(positional: Vec<Value>, named: BTreeMap<String, Value>) -> Self {
        Self { positional, named }
    }

    pub fn positional(positional: Vec<Value>) -> Self {
        Self {
            positional,
            named: BTreeMap::new(),
        }
    }

    /// Argument `index`, or the keyword argument `name` if not given positionally.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional.get(index).or_else(|| self.named.get(name))
    }

    pub fn value(&self, index: usize, name: &str) -> Result<&Value, RemoteError> {
        self.get(index, name)
            .ok_or_else(|| RemoteError::InvalidArguments(format!("missing argument {}", name)))
    }

    pub fn i64(&self, index: usize, name: &str) -> Result<i64, RemoteError> {
        self.value(index, name)?
            .as_i64()
            .ok_or_else(|| wrong_type(name, "an integer"))
    }

    pub fn f64(&self, index: usize, name: &str) -> Result<f64, RemoteError> {
        self.value(index, name)?
            .as_f64()
            .ok_or_else(|| wrong_type(name, "a number"))
    }

    pub fn str(&self, index: usize, name: &str) -> Result<&str, RemoteError> {
        self.value(index, name)?
            .as_str()
            .ok_or_else(|| wrong_type(name, "a string"))
    }

    pub fn uid(&self, index: usize, name: &str) -> Result<Uid, RemoteError> {
        self.value(index, name)?
            .as_uid()
            .ok_or_else(|| wrong_type(name, "an identifier"))
    }

    pub fn array(&self, index: usize, name: &str) -> Result<&NdArray, RemoteError> {
        self.value(index, name)?
            .as_array()
            .ok_or_else(|| wrong_type(name, "a numeric array"))
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn wrong_type(name: &str, expected: &str) -> RemoteError {
    RemoteError::InvalidArguments(format!("argument {} must be {}", name, expected))
}

/// Context handed to a local object for each invocation.
pub struct CallContext<'a> {
    sharer: &'a Sharer,
    object: Uid,
    caller: Option<Uid>,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(sharer: &'a Sharer, object: Uid, caller: Option<Uid>) -> Self {
        Self {
            sharer,
            object,
            caller,
        }
    }

    pub fn sharer(&self) -> &Sharer {
        self.sharer
    }

    /// Id the invoked object is registered under.
    pub fn object(&self) -> Uid {
        self.object
    }

    /// Client that sent the call; `None` for a call made in-process.
    pub fn caller(&self) -> Option<Uid> {
        self.caller
    }

    /// Emit a signal from the invoked object.
    pub fn emit(&self, signal: &str, args: Args) -> Result<(), Error> {
        self.sharer.emit(self.object, signal, args)
    }
}

/// A local object that can be registered with a `Sharer` and called by peers.
pub trait SharedObject: 'static {
    fn describe(&self) -> ObjectDescriptor;

    /// Invoke `method`. Only names listed by `describe` are routed here.
    fn call(&self, ctx: &CallContext<'_>, method: &str, args: Args) -> Result<Value, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_descriptor() -> ObjectDescriptor {
        ObjectDescriptor::new()
            .function(FunctionSpec::new("increment").params(&["n"]).doc("n + 1"))
            .function(FunctionSpec::new("name").cached())
            .property("count")
    }

    #[test]
    fn info_value_roundtrip() {
        let info = ObjectInfo {
            uid: Uid::new(),
            descriptor: counter_descriptor(),
        };
        let value = info.to_value();
        let map = value.as_map().unwrap();
        assert_eq!(map.get("id").and_then(Value::as_uid), Some(info.uid));
        assert_eq!(map["functions"].as_list().unwrap().len(), 2);
        assert_eq!(ObjectInfo::from_value(&value), Some(info));
    }

    #[test]
    fn malformed_info_rejected() {
        assert_eq!(ObjectInfo::from_value(&Value::Int(3)), None);
        let mut map = BTreeMap::new();
        map.insert("id".to_string(), Value::Uid(Uid::new()));
        assert_eq!(ObjectInfo::from_value(&Value::Map(map)), None);
    }

    #[test]
    fn descriptor_lookup() {
        let d = counter_descriptor();
        assert_eq!(d.get_function("increment").unwrap().params, vec!["n"]);
        assert!(d.get_function("name").unwrap().cache_result);
        assert!(d.get_function("missing").is_none());
    }

    #[test]
    fn args_positional_then_named() {
        let mut named = BTreeMap::new();
        named.insert("b".to_string(), Value::Int(2));
        let args = Args::new(vec![Value::Int(1)], named);
        assert_eq!(args.i64(0, "a").unwrap(), 1);
        assert_eq!(args.i64(1, "b").unwrap(), 2);
        assert!(matches!(
            args.i64(2, "c"),
            Err(RemoteError::InvalidArguments(_))
        ));
        assert!(matches!(
            args.str(0, "a"),
            Err(RemoteError::InvalidArguments(_))
        ));
        assert_eq!(args.len(), 2);
    }
}
