//! Model roles and their scheduler descriptors

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Functional slot competing for model capacity.
///
/// Declaration order is significant: it breaks priority ties when choosing
/// what to evict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Primary reasoning and planning
    Executive,
    /// Code and DOM generation
    Navigator,
    /// Vision analysis
    Eye,
    /// Fast JSON formatting
    Clerk,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Executive, Role::Navigator, Role::Eye, Role::Clerk];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Executive => "executive",
            Role::Navigator => "navigator",
            Role::Eye => "eye",
            Role::Clerk => "clerk",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "executive" | "reasoning" => Ok(Role::Executive),
            "navigator" | "code" => Ok(Role::Navigator),
            "eye" | "vision" => Ok(Role::Eye),
            "clerk" | "formatting" => Ok(Role::Clerk),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Scheduler bookkeeping for one role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDescriptor {
    /// Backend model identifier (e.g. an Ollama model tag)
    pub model: String,
    /// Capacity consumed while loaded (e.g. GB of VRAM)
    pub cost: f64,
    /// Higher priority is evicted later
    pub priority: i32,
    /// Whether the role currently counts against the budget
    #[serde(skip)]
    pub loaded: bool,
}

impl RoleDescriptor {
    pub fn new(model: impl Into<String>, cost: f64, priority: i32) -> Self {
        Self {
            model: model.into(),
            cost,
            priority,
            loaded: false,
        }
    }
}

/// Default role catalogue, sized for a 24 GB card
pub fn default_catalogue() -> BTreeMap<Role, RoleDescriptor> {
    BTreeMap::from([
        (
            Role::Executive,
            RoleDescriptor::new("nemotron-3-nano:30b-a3b-q4_K_M", 16.0, 10),
        ),
        (Role::Navigator, RoleDescriptor::new("deepseek-coder-v2:16b", 16.0, 8)),
        (Role::Eye, RoleDescriptor::new("llava:latest", 8.0, 5)),
        (Role::Clerk, RoleDescriptor::new("llama3.2:3b", 3.0, 7)),
    ])
}
