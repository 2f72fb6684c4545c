//! Routing strategy and collaboration settings carried by entries

use serde::{Deserialize, Serialize};

/// How the Router picks an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Filter by capability tag, then lowest load
    #[default]
    Capability,
    /// Lowest current load among healthy agents
    LoadBalanced,
    /// Lowest estimated cost per call among capable agents
    CostOptimized,
    /// Lowest rolling average latency
    SpeedOptimized,
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Capability => write!(f, "capability"),
            Self::LoadBalanced => write!(f, "load-balanced"),
            Self::CostOptimized => write!(f, "cost-optimized"),
            Self::SpeedOptimized => write!(f, "speed-optimized"),
        }
    }
}

impl std::str::FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "capability" => Ok(Self::Capability),
            "load-balanced" | "load" => Ok(Self::LoadBalanced),
            "cost-optimized" | "cost" => Ok(Self::CostOptimized),
            "speed-optimized" | "speed" => Ok(Self::SpeedOptimized),
            _ => Err(format!("Unknown routing strategy: {}", s)),
        }
    }
}

/// How the members of a collaborative group are run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationMode {
    /// Each agent sees the previous agents' output in its context
    Sequential,
    /// Agents run independently, results concatenated by agent id
    #[default]
    Parallel,
}

impl std::fmt::Display for CoordinationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

impl std::str::FromStr for CoordinationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            _ => Err(format!("Unknown coordination mode: {}", s)),
        }
    }
}

/// Request for collaborative execution of one entry by several agents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaboration {
    pub mode: CoordinationMode,

    /// Explicit member agent ids, in the order they should run.
    /// Empty means the Router picks `size` agents.
    #[serde(default)]
    pub agents: Vec<String>,

    /// Group size when `agents` is empty
    #[serde(default = "default_group_size")]
    pub size: usize,
}

fn default_group_size() -> usize {
    2
}

impl Collaboration {
    /// Collaboration over an explicit, ordered list of agents
    pub fn with_agents(mode: CoordinationMode, agents: Vec<String>) -> Self {
        let size = agents.len();
        Self { mode, agents, size }
    }

    /// Collaboration over `size` router-selected agents
    pub fn with_size(mode: CoordinationMode, size: usize) -> Self {
        Self {
            mode,
            agents: Vec::new(),
            size,
        }
    }
}
