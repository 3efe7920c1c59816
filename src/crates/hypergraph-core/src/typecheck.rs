//! Build-time type compatibility checking.
//!
//! Runtime values are opaque [`serde_json::Value`]s, so type annotations are
//! data too: nodes may declare a [`TypeExpr`] per input and output, and when
//! a graph is built with `strict_types` every inferred edge is checked with
//! [`is_compatible`]. Nothing here runs during execution.
//!
//! The rules, checked in order with first match winning:
//!
//! 1. `Any` on either side is compatible.
//! 2. Identical types are compatible.
//! 3. A union input accepts an output satisfying at least one arm.
//! 4. A union output requires every arm to satisfy the input.
//! 5. A declared subtype satisfies its supertype (`bool` is deliberately not
//!    a subtype of `int`).
//! 6. Parameterized generics match head-first, then parameters: invariant
//!    for mutable containers (`list`, `dict`, `set`), covariant for `tuple`
//!    and `Sequence`.
//! 7. Names unknown to the registry resolve to `Any` with a warning.
//! 8. A protocol input is satisfied by anything declaring all its methods.
//! 9. A literal input accepts only a literal output whose values are a
//!    subset; a non-literal output never satisfies a literal input.
//! 10. A type-variable input matches anything; a type-variable output only
//!     matches `Any` or another variable.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A declared type for an input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeExpr {
    /// Matches anything on either side.
    Any,
    /// A named type, optionally parameterized (e.g. `list[int]`).
    Named { name: String, params: Vec<TypeExpr> },
    /// A union of alternatives.
    Union(Vec<TypeExpr>),
    /// A set of allowed literal values.
    Literal(Vec<Value>),
    /// A structural type requiring the listed method names.
    Protocol { methods: Vec<String> },
    /// An unbound type variable.
    Var(String),
}

impl TypeExpr {
    /// Bare named type.
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Parameterized named type.
    pub fn generic(name: impl Into<String>, params: impl IntoIterator<Item = TypeExpr>) -> Self {
        Self::Named {
            name: name.into(),
            params: params.into_iter().collect(),
        }
    }

    /// `list[inner]`, the wrapper applied to mapped outputs.
    pub fn list_of(inner: TypeExpr) -> Self {
        Self::generic("list", [inner])
    }

    pub fn union(arms: impl IntoIterator<Item = TypeExpr>) -> Self {
        Self::Union(arms.into_iter().collect())
    }

    pub fn literal(values: impl IntoIterator<Item = Value>) -> Self {
        Self::Literal(values.into_iter().collect())
    }

    /// Compact rendering used in error messages (e.g. `list[int]`,
    /// `int | str`).
    pub fn render(&self) -> String {
        match self {
            TypeExpr::Any => "Any".to_string(),
            TypeExpr::Named { name, params } if params.is_empty() => name.clone(),
            TypeExpr::Named { name, params } => {
                let inner: Vec<String> = params.iter().map(TypeExpr::render).collect();
                format!("{}[{}]", name, inner.join(", "))
            }
            TypeExpr::Union(arms) => {
                let inner: Vec<String> = arms.iter().map(TypeExpr::render).collect();
                inner.join(" | ")
            }
            TypeExpr::Literal(values) => {
                let inner: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                format!("Literal[{}]", inner.join(", "))
            }
            TypeExpr::Protocol { methods } => format!("Protocol[{}]", methods.join(", ")),
            TypeExpr::Var(name) => name.clone(),
        }
    }
}

/// Builtin type names the registry always resolves.
const BUILTINS: &[&str] = &[
    "int", "float", "str", "bool", "bytes", "None", "list", "dict", "set", "tuple", "Sequence",
    "Mapping",
];

/// Container heads whose parameters are checked invariantly.
const INVARIANT_HEADS: &[&str] = &["list", "dict", "set"];

/// Known subtype relationships and protocol method tables.
///
/// Users register their own type names here; anything the registry has never
/// heard of degrades to `Any` (rule 7) with a build-time warning.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    supertypes: BTreeMap<String, BTreeSet<String>>,
    methods: BTreeMap<String, BTreeSet<String>>,
    known: BTreeSet<String>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut reg = Self::default();
        for name in BUILTINS {
            reg.known.insert((*name).to_string());
        }
        reg
    }

    /// Declare `name` with its direct supertypes.
    pub fn register(&mut self, name: impl Into<String>, supertypes: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        let name = name.into();
        self.known.insert(name.clone());
        let entry = self.supertypes.entry(name).or_default();
        for sup in supertypes {
            let sup = sup.into();
            self.known.insert(sup.clone());
            entry.insert(sup);
        }
        self
    }

    /// Declare the method names `name` provides, for protocol satisfaction.
    pub fn register_methods(&mut self, name: impl Into<String>, methods: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        let name = name.into();
        self.known.insert(name.clone());
        self.methods
            .entry(name)
            .or_default()
            .extend(methods.into_iter().map(Into::into));
        self
    }

    fn resolves(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    /// Transitive subtype check over registered supertype edges.
    fn is_subtype(&self, sub: &str, sup: &str) -> bool {
        if sub == sup {
            return true;
        }
        // Surfacing bool-for-int is worth more than Python fidelity here.
        if sub == "bool" && sup == "int" {
            return false;
        }
        let mut stack = vec![sub];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(parents) = self.supertypes.get(current) {
                for parent in parents {
                    if parent == sup {
                        return true;
                    }
                    stack.push(parent.as_str());
                }
            }
        }
        false
    }

    fn methods_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.methods.get(name)
    }
}

/// May a value known to satisfy `out` be fed to a parameter declared `inp`?
pub fn is_compatible(out: &TypeExpr, inp: &TypeExpr, registry: &TypeRegistry) -> bool {
    // Rule 1: Any on either side.
    if matches!(out, TypeExpr::Any) || matches!(inp, TypeExpr::Any) {
        return true;
    }
    // Rule 2: identical.
    if out == inp {
        return true;
    }
    // Rule 10, input half: an incoming type variable matches anything.
    if matches!(inp, TypeExpr::Var(_)) {
        return true;
    }
    // Rule 10, output half: an unbound outgoing variable satisfies nothing
    // concrete.
    if matches!(out, TypeExpr::Var(_)) {
        return false;
    }
    // Rule 7: unresolved names degrade to Any.
    if let TypeExpr::Named { name, .. } = out {
        if !registry.resolves(name) && registry.methods_of(name).is_none() {
            tracing::warn!(type_name = %name, "unresolved type treated as Any");
            return true;
        }
    }
    if let TypeExpr::Named { name, .. } = inp {
        if !registry.resolves(name) && registry.methods_of(name).is_none() {
            tracing::warn!(type_name = %name, "unresolved type treated as Any");
            return true;
        }
    }
    // Rule 9 before unions so Literal-vs-Literal subset logic wins.
    if let TypeExpr::Literal(allowed) = inp {
        return match out {
            TypeExpr::Literal(produced) => produced.iter().all(|v| allowed.contains(v)),
            _ => false,
        };
    }
    // Rule 3: union input, any arm.
    if let TypeExpr::Union(arms) = inp {
        return arms.iter().any(|arm| is_compatible(out, arm, registry));
    }
    // Rule 4: union output, every arm.
    if let TypeExpr::Union(arms) = out {
        return arms.iter().all(|arm| is_compatible(arm, inp, registry));
    }
    // Rule 8: protocol input.
    if let TypeExpr::Protocol { methods: required } = inp {
        let provided: Option<BTreeSet<String>> = match out {
            TypeExpr::Protocol { methods } => Some(methods.iter().cloned().collect()),
            TypeExpr::Named { name, .. } => registry.methods_of(name).cloned(),
            _ => None,
        };
        return match provided {
            Some(provided) => required.iter().all(|m| provided.contains(m)),
            None => false,
        };
    }
    // A literal output against a plain named input checks the value types.
    if let (TypeExpr::Literal(values), TypeExpr::Named { .. }) = (out, inp) {
        return values
            .iter()
            .all(|v| is_compatible(&literal_base(v), inp, registry));
    }
    // Rules 5 and 6: named vs named.
    if let (
        TypeExpr::Named { name: out_name, params: out_params },
        TypeExpr::Named { name: inp_name, params: inp_params },
    ) = (out, inp)
    {
        if !registry.is_subtype(out_name, inp_name) {
            return false;
        }
        // Bare heads (no parameters) on either side accept anything.
        if out_params.is_empty() || inp_params.is_empty() {
            return true;
        }
        if out_params.len() != inp_params.len() {
            return false;
        }
        let invariant = INVARIANT_HEADS.contains(&inp_name.as_str());
        return out_params.iter().zip(inp_params).all(|(o, i)| {
            if invariant {
                is_compatible(o, i, registry) && is_compatible(i, o, registry)
            } else {
                is_compatible(o, i, registry)
            }
        });
    }
    false
}

fn literal_base(value: &Value) -> TypeExpr {
    match value {
        Value::Bool(_) => TypeExpr::named("bool"),
        Value::Number(n) if n.is_i64() || n.is_u64() => TypeExpr::named("int"),
        Value::Number(_) => TypeExpr::named("float"),
        Value::String(_) => TypeExpr::named("str"),
        Value::Null => TypeExpr::named("None"),
        Value::Array(_) => TypeExpr::named("list"),
        Value::Object(_) => TypeExpr::named("dict"),
    }
}
