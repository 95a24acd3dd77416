//! Stable test identifiers.
//!
//! A test is named by the member that declares it plus the arguments it is
//! instantiated with. Arguments are replaced by dense indices (`#0`, `#1`, ..)
//! assigned by an [`IdentityScope`]; structurally equal arguments in the same
//! scope get the same index. A scope lives for one discovery pass and is
//! never shared between passes.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The code element a test is declared on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "member", rename_all = "snake_case")]
pub enum TestMember {
    Type {
        name: String,
    },
    Method {
        declaring_type: String,
        name: String,
    },
}

impl TestMember {
    pub fn ty(name: impl Into<String>) -> Self {
        Self::Type { name: name.into() }
    }

    pub fn method(declaring_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Method {
            declaring_type: declaring_type.into(),
            name: name.into(),
        }
    }

    /// The type this member belongs to (itself, for a type).
    pub fn type_name(&self) -> &str {
        match self {
            Self::Type { name } => name,
            Self::Method { declaring_type, .. } => declaring_type,
        }
    }
}

impl fmt::Display for TestMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type { name } => f.write_str(name),
            Self::Method {
                declaring_type,
                name,
            } => write!(f, "{declaring_type}::{name}"),
        }
    }
}

/// Per-computation cache of argument indices.
#[derive(Debug, Default)]
pub struct IdentityScope {
    // Keyed by the value's JSON text; object keys serialize sorted, so equal
    // values produce equal keys.
    indices: HashMap<String, usize>,
}

impl IdentityScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index for `value`, assigning the next free one on first sight.
    pub fn index_of(&mut self, value: &serde_json::Value) -> usize {
        let next = self.indices.len();
        *self.indices.entry(value.to_string()).or_insert(next)
    }

    /// Number of distinct values seen.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Build the identifier for `member` instantiated with `args`.
///
/// `Math.Tests::adds(#0,#1)` for a method, `Math.Tests` for a type without
/// arguments.
pub fn test_identifier(
    member: &TestMember,
    args: &[serde_json::Value],
    scope: &mut IdentityScope,
) -> String {
    let is_method = matches!(member, TestMember::Method { .. });
    if args.is_empty() && !is_method {
        return member.to_string();
    }

    let indices: Vec<String> = args
        .iter()
        .map(|arg| format!("#{}", scope.index_of(arg)))
        .collect();
    format!("{member}({})", indices.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn method_identifier_uses_dense_indices() {
        let mut scope = IdentityScope::new();
        let adds = TestMember::method("Math.Tests", "adds");

        let id = test_identifier(&adds, &[json!(1), json!(2)], &mut scope);
        assert_eq!(id, "Math.Tests::adds(#0,#1)");
        assert_eq!(scope.len(), 2);
    }

    #[test]
    fn equal_arguments_share_an_index() {
        let mut scope = IdentityScope::new();
        let adds = TestMember::method("Math.Tests", "adds");

        test_identifier(&adds, &[json!({"a": 1, "b": [1, 2]})], &mut scope);
        let id = test_identifier(&adds, &[json!(7), json!({"b": [1, 2], "a": 1})], &mut scope);

        assert_eq!(id, "Math.Tests::adds(#1,#0)");
        assert_eq!(scope.len(), 2);
    }

    #[test]
    fn scopes_are_independent() {
        let adds = TestMember::method("Math.Tests", "adds");

        let mut first = IdentityScope::new();
        test_identifier(&adds, &[json!("x"), json!("y")], &mut first);

        let mut second = IdentityScope::new();
        let id = test_identifier(&adds, &[json!("y")], &mut second);
        assert_eq!(id, "Math.Tests::adds(#0)");
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn type_and_argumentless_members() {
        let mut scope = IdentityScope::new();
        assert_eq!(
            test_identifier(&TestMember::ty("Math.Tests"), &[], &mut scope),
            "Math.Tests"
        );
        assert_eq!(
            test_identifier(&TestMember::ty("Math.Fixture"), &[json!(null)], &mut scope),
            "Math.Fixture(#0)"
        );
        assert_eq!(
            test_identifier(&TestMember::method("Math.Tests", "zero"), &[], &mut scope),
            "Math.Tests::zero()"
        );
    }

    #[test]
    fn member_serializes_tagged() {
        insta::assert_json_snapshot!(TestMember::method("Math.Tests", "adds"), @r#"
        {
          "member": "method",
          "declaring_type": "Math.Tests",
          "name": "adds"
        }
        "#);
        assert_eq!(TestMember::method("Math.Tests", "adds").type_name(), "Math.Tests");
    }
}
