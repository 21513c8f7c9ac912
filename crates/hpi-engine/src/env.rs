//! Job environment values and layering.

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

/// The value of an environment variable of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum EnvValue {
    /// A literal value, quoted when rendered.
    Literal(String),
    /// A shell expression evaluated once, in the batch step, on the first
    /// allocated node.
    JobExpr(String),
    /// A shell expression evaluated separately in every launched process.
    TaskExpr(String),
}

impl EnvValue {
    /// Creates a literal value.
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    /// Gets the literal value, if this is a literal.
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Self::Literal(v) => Some(v),
            _ => None,
        }
    }
}

/// The layers that make up a job's environment, lowest precedence first.
#[derive(Debug, Default, Clone)]
pub struct EnvLayers {
    /// Variables inherited from the submitting process.
    pub base: IndexMap<String, EnvValue>,
    /// Variables supplied by the user in the job specification.
    pub user: IndexMap<String, EnvValue>,
    /// Flags that make frameworks behave correctly under the launcher.
    pub framework: IndexMap<String, EnvValue>,
    /// Variables describing the distributed topology.
    pub distributed: IndexMap<String, EnvValue>,
}

impl EnvLayers {
    /// Merges the layers.
    ///
    /// On a key collision the later layer wins: distributed over framework
    /// over user over base. A key keeps the position of its first
    /// occurrence.
    pub fn resolve(self) -> IndexMap<String, EnvValue> {
        let mut env = self.base;
        for layer in [self.user, self.framework, self.distributed] {
            for (k, v) in layer {
                env.insert(k, v);
            }
        }
        env
    }
}
