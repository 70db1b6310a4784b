//! Call signature hashing.
//!
//! A call is identified by its qualified method name, positional arguments
//! and keyword arguments. Keyword arguments are kept sorted by name, mapping
//! arguments are sorted by the canonical encoder and sequences keep their
//! order. The canonical bytes of the whole call are digested with BLAKE3.
//!
//! When an argument has no canonical encoding the hasher falls back to a
//! digest of a human-readable rendering of the call. The rendering comes from
//! a lenient canonical tree, so it is as order-independent as the key itself. That path logs one
//! ERROR for the encoding failure and one WARNING carrying
//! [`FALLBACK_MARKER`].

use crate::encoding::{CanonicalEncode, CanonicalValue, EncodeError, to_canonical, to_canonical_lenient};
use crate::hash::{CallKey, Hash};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{error, warn};

/// Marker carried by the warning logged when a fallback key is produced
pub const FALLBACK_MARKER: &str = "FALLBACK_CACHE_KEY_USED";

/// One captured argument
#[derive(Clone)]
struct Argument {
    canonical: Result<CanonicalValue, EncodeError>,
    /// Lenient rendering, kept only when canonical encoding failed
    rendering: Option<String>,
}

impl Argument {
    fn capture<T: Serialize + ?Sized>(value: &T) -> Self {
        match to_canonical(value) {
            Ok(canonical) => Self {
                canonical: Ok(canonical),
                rendering: None,
            },
            Err(err) => Self {
                canonical: Err(err),
                rendering: Some(to_canonical_lenient(value).to_string()),
            },
        }
    }

    fn render(&self) -> String {
        match (&self.canonical, &self.rendering) {
            (_, Some(rendering)) => rendering.clone(),
            (Ok(value), None) => value.to_string(),
            (Err(err), None) => format!("<unencodable: {}>", err),
        }
    }
}

/// Positional and keyword arguments of an intercepted call
#[derive(Clone, Default)]
pub struct CallArgs {
    positional: Vec<Argument>,
    keyword: BTreeMap<String, Argument>,
}

impl CallArgs {
    /// Create an empty argument list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument
    #[must_use]
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.push_arg(value);
        self
    }

    /// Set a keyword argument (a later value under the same name wins)
    #[must_use]
    pub fn kwarg<T: Serialize + ?Sized>(mut self, name: impl Into<String>, value: &T) -> Self {
        self.push_kwarg(name, value);
        self
    }

    /// Append a positional argument in place
    pub fn push_arg<T: Serialize + ?Sized>(&mut self, value: &T) {
        self.positional.push(Argument::capture(value));
    }

    /// Set a keyword argument in place
    pub fn push_kwarg<T: Serialize + ?Sized>(&mut self, name: impl Into<String>, value: &T) {
        self.keyword.insert(name.into(), Argument::capture(value));
    }

    /// Number of positional arguments
    #[must_use]
    pub fn positional_len(&self) -> usize {
        self.positional.len()
    }

    /// Number of keyword arguments
    #[must_use]
    pub fn keyword_len(&self) -> usize {
        self.keyword.len()
    }

    /// Whether no arguments were captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Whether every argument has a canonical encoding
    #[must_use]
    pub fn is_encodable(&self) -> bool {
        self.positional
            .iter()
            .chain(self.keyword.values())
            .all(|a| a.canonical.is_ok())
    }

    fn canonical(&self, method: &str) -> Result<CanonicalValue, EncodeError> {
        let positional = self
            .positional
            .iter()
            .map(|a| a.canonical.clone())
            .collect::<Result<Vec<_>, _>>()?;
        let mut keyword = BTreeMap::new();
        for (name, arg) in &self.keyword {
            keyword.insert(CanonicalValue::Str(name.clone()), arg.canonical.clone()?);
        }
        Ok(CanonicalValue::Seq(vec![
            CanonicalValue::Str(method.to_string()),
            CanonicalValue::Seq(positional),
            CanonicalValue::Map(keyword),
        ]))
    }

    fn render(&self, method: &str) -> String {
        let positional = self
            .positional
            .iter()
            .map(Argument::render)
            .collect::<Vec<_>>()
            .join(", ");
        let keyword = self
            .keyword
            .iter()
            .map(|(name, arg)| format!("{:?}: {}", name, arg.render()))
            .collect::<Vec<_>>()
            .join(", ");
        format!("({:?}, ({}), {{{}}})", method, positional, keyword)
    }
}

impl fmt::Debug for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render("_"))
    }
}

/// Identity of one call: qualified method name plus its arguments
#[derive(Debug, Clone)]
pub struct CallSignature {
    method: String,
    args: CallArgs,
}

impl CallSignature {
    /// Create a signature
    pub fn new(method: impl Into<String>, args: CallArgs) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    /// Qualified method name
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Captured arguments
    #[must_use]
    pub fn args(&self) -> &CallArgs {
        &self.args
    }

    /// Human-readable rendering used by the fallback path
    #[must_use]
    pub fn render(&self) -> String {
        self.args.render(&self.method)
    }

    /// Derive the content-addressable key of this call.
    ///
    /// Never fails: unencodable arguments produce a fallback key.
    #[must_use]
    pub fn key(&self) -> CallKey {
        match self
            .args
            .canonical(&self.method)
            .and_then(|value| value.canonical_bytes())
        {
            Ok(bytes) => CallKey::canonical(Hash::compute(&bytes)),
            Err(err) => {
                error!(
                    "Error encoding/hashing call {}: {}",
                    self.method, err
                );
                let rendering = self.render();
                let key = CallKey::fallback(&self.method, Hash::compute(rendering.as_bytes()));
                warn!(
                    "{}: hashing string rendering of call {} as {}",
                    FALLBACK_MARKER, self.method, key
                );
                key
            }
        }
    }
}

/// Hash a call without building a [`CallSignature`] first
#[must_use]
pub fn call_key(method: &str, args: &CallArgs) -> CallKey {
    CallSignature::new(method, args.clone()).key()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Opaque;
    use serde::Serialize;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tracing::field::{Field, Visit};
    use tracing::{Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    #[derive(Debug, Serialize)]
    struct SimpleCustomObject {
        x: i64,
        y: String,
    }

    #[derive(Debug, Serialize)]
    struct Nested {
        list: Vec<NestedItem>,
        val: String,
    }

    #[derive(Debug, Serialize)]
    #[serde(untagged)]
    enum NestedItem {
        Num(i64),
        Obj(SimpleCustomObject),
    }

    #[derive(Clone, Default)]
    struct Capture {
        records: Arc<Mutex<Vec<(Level, String)>>>,
    }

    struct MessageVisitor(String);

    impl Visit for MessageVisitor {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{:?}", value);
            }
        }
    }

    impl<S: Subscriber> Layer<S> for Capture {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            self.records
                .lock()
                .unwrap()
                .push((*event.metadata().level(), visitor.0));
        }
    }

    impl Capture {
        fn at(&self, level: Level) -> Vec<String> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .filter(|(l, _)| *l == level)
                .map(|(_, m)| m.clone())
                .collect()
        }
    }

    fn key(method: &str, args: CallArgs) -> CallKey {
        call_key(method, &args)
    }

    #[test]
    fn test_key_stability() {
        let k1 = key("method_name", CallArgs::new().arg(&1).arg("hello").kwarg("kwarg1", "val1"));
        let k2 = key("method_name", CallArgs::new().arg(&1).arg("hello").kwarg("kwarg1", "val1"));
        let k3 = key("method_name", CallArgs::new().arg(&2).arg("hello").kwarg("kwarg1", "val1"));
        let k4 = key("method_name", CallArgs::new().arg(&1).arg("world").kwarg("kwarg1", "val1"));
        let k5 = key("method_name", CallArgs::new().arg(&1).arg("hello").kwarg("kwarg1", "val2"));
        let k6 = key("method_name_diff", CallArgs::new().arg(&1).arg("hello").kwarg("kwarg1", "val1"));

        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_ne!(k1, k4);
        assert_ne!(k1, k5);
        assert_ne!(k1, k6);
        assert!(!k1.is_fallback());
    }

    #[test]
    fn test_keyword_placement_does_not_matter() {
        let k = key("m", CallArgs::new().arg(&1).arg("a").kwarg("k", "v"));
        assert_eq!(k.as_str().len(), 64);
        assert_eq!(k, key("m", CallArgs::new().kwarg("k", "v").arg(&1).arg("a")));
    }

    #[test]
    fn test_kwarg_order_invariance() {
        let a = key("m", CallArgs::new().kwarg("x", &1).kwarg("y", &2));
        let b = key("m", CallArgs::new().kwarg("y", &2).kwarg("x", &1));
        assert_eq!(a, b);
    }

    #[test]
    fn test_kwarg_vs_positional_differ() {
        let a = key("m", CallArgs::new().arg(&1));
        let b = key("m", CallArgs::new().kwarg("x", &1));
        assert_ne!(a, b);
    }

    #[test]
    fn test_dict_content_invariance() {
        let mut first = HashMap::new();
        first.insert("a", 1);
        first.insert("b", 2);
        let mut second = HashMap::new();
        second.insert("b", 2);
        second.insert("a", 1);
        let mut third = HashMap::new();
        third.insert("a", 1);
        third.insert("b", 3);

        let k1 = key("m", CallArgs::new().arg(&first));
        let k2 = key("m", CallArgs::new().arg(&second));
        let k3 = key("m", CallArgs::new().arg(&third));
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);

        let kw1 = key("m", CallArgs::new().kwarg("kwarg_dict", &first));
        let kw2 = key("m", CallArgs::new().kwarg("kwarg_dict", &second));
        assert_eq!(kw1, kw2);
    }

    #[test]
    fn test_sequence_order_sensitivity() {
        let l1 = key("method_list", CallArgs::new().arg(&vec![1, 2, 3]));
        let l2 = key("method_list", CallArgs::new().arg(&vec![1, 2, 3]));
        let l3 = key("method_list", CallArgs::new().arg(&vec![3, 2, 1]));
        assert_eq!(l1, l2);
        assert_ne!(l1, l3);

        let t1 = key("method_tuple", CallArgs::new().arg(&(1, 2, 3)));
        let t3 = key("method_tuple", CallArgs::new().arg(&(3, 2, 1)));
        assert_ne!(t1, t3);
    }

    #[test]
    fn test_custom_objects_hash_by_value() {
        let o1 = SimpleCustomObject { x: 1, y: "a".into() };
        let o2 = SimpleCustomObject { x: 1, y: "a".into() };
        let o3 = SimpleCustomObject { x: 2, y: "b".into() };
        let k1 = key("method_custom", CallArgs::new().arg(&o1));
        let k2 = key("method_custom", CallArgs::new().arg(&o2));
        let k3 = key("method_custom", CallArgs::new().arg(&o3));
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_nested_structures() {
        let build = |y: &str| Nested {
            list: vec![
                NestedItem::Num(1),
                NestedItem::Obj(SimpleCustomObject { x: 10, y: y.into() }),
            ],
            val: "test".into(),
        };
        let k1 = key("method_nested", CallArgs::new().kwarg("nested_data", &build("20")));
        let k2 = key("method_nested", CallArgs::new().kwarg("nested_data", &build("20")));
        let k3 = key("method_nested", CallArgs::new().kwarg("nested_data", &build("30")));
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_fallback_logs_once_and_keeps_method() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());

        let k1 = tracing::subscriber::with_default(subscriber, || {
            key(
                "method_lambda",
                CallArgs::new()
                    .arg(&Opaque::new("identity", |x: i32| x))
                    .kwarg("kwarg1", "test_fallback"),
            )
        });

        let errors = capture.at(Level::ERROR);
        let warnings = capture.at(Level::WARN);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Error encoding/hashing call"));
        assert_eq!(warnings.len(), 1, "warnings: {:?}", warnings);
        assert!(warnings[0].contains(FALLBACK_MARKER));
        assert!(k1.is_fallback());
        assert!(k1.as_str().contains("method_lambda"));

        let capture2 = Capture::default();
        let subscriber2 = tracing_subscriber::registry().with(capture2.clone());
        let k2 = tracing::subscriber::with_default(subscriber2, || {
            key(
                "method_lambda",
                CallArgs::new()
                    .arg(&Opaque::new("double", |y: i32| y * 2))
                    .kwarg("kwarg1", "test_fallback"),
            )
        });
        assert_eq!(capture2.at(Level::ERROR).len(), 1);
        assert_eq!(capture2.at(Level::WARN).len(), 1);
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_fallback_is_deterministic() {
        let make = || {
            key(
                "method_lambda",
                CallArgs::new().arg(&Opaque::new("same", ())).arg(&5),
            )
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn test_fallback_map_argument_is_order_independent() {
        let names: Vec<String> = (0..8).map(|i| format!("handle_{}", i)).collect();
        let mut keys = std::collections::BTreeSet::new();
        for rotation in 0..20 {
            let mut handles = HashMap::new();
            for i in 0..names.len() {
                let name = &names[(i + rotation) % names.len()];
                handles.insert(name.clone(), Opaque::new(name.clone(), ()));
            }
            keys.insert(key("m", CallArgs::new().arg(&handles)));
        }
        assert_eq!(keys.len(), 1, "keys: {:?}", keys);
        assert!(keys.iter().all(CallKey::is_fallback));
    }

    #[test]
    fn test_encodable_path_logs_nothing() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        tracing::subscriber::with_default(subscriber, || {
            key("m", CallArgs::new().arg(&30).arg("x"));
        });
        assert!(capture.records.lock().unwrap().is_empty());
    }

    #[test]
    fn test_rendering_contains_arguments() {
        let sig = CallSignature::new(
            "Agent::act",
            CallArgs::new().arg(&30).arg("x").kwarg("mode", "fast"),
        );
        assert_eq!(sig.render(), "(\"Agent::act\", (30, \"x\"), {\"mode\": \"fast\"})");
        assert!(sig.args().is_encodable());
    }

    proptest::proptest! {
        #[test]
        fn prop_kwarg_insertion_order_irrelevant(a: i64, b: String, c: bool) {
            let forward = key("m", CallArgs::new().kwarg("a", &a).kwarg("b", &b).kwarg("c", &c));
            let backward = key("m", CallArgs::new().kwarg("c", &c).kwarg("b", &b).kwarg("a", &a));
            proptest::prop_assert_eq!(forward, backward);
        }

        #[test]
        fn prop_distinct_positional_values_distinct_keys(a: i64, b: i64) {
            proptest::prop_assume!(a != b);
            let ka = key("m", CallArgs::new().arg(&a));
            let kb = key("m", CallArgs::new().arg(&b));
            proptest::prop_assert_ne!(ka, kb);
        }
    }
}
