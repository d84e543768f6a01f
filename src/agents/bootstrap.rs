use serde::{Deserialize, Deserializer, Serialize};

use super::Agent;
use crate::prompts::{BOOTSTRAP_DEPS_PROMPT, BOOTSTRAP_DOCS_PROMPT, BOOTSTRAP_STRUCTURE_PROMPT};
use crate::storage::NodeType;

/// Which slice of a project a bootstrap agent reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapKind {
    Docs,
    Deps,
    Structure,
}

impl BootstrapKind {
    /// Every registered bootstrap agent
    pub const ALL: [BootstrapKind; 3] = [
        BootstrapKind::Docs,
        BootstrapKind::Deps,
        BootstrapKind::Structure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapKind::Docs => "docs",
            BootstrapKind::Deps => "deps",
            BootstrapKind::Structure => "structure",
        }
    }

    /// One-line description for agent listings
    pub fn description(&self) -> &'static str {
        match self {
            BootstrapKind::Docs => "Extracts decisions and features from README and docs",
            BootstrapKind::Deps => "Extracts technology choices from dependency manifests",
            BootstrapKind::Structure => "Infers layers and modules from the directory layout",
        }
    }
}

impl std::fmt::Display for BootstrapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BootstrapKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docs" => Ok(BootstrapKind::Docs),
            "deps" => Ok(BootstrapKind::Deps),
            "structure" => Ok(BootstrapKind::Structure),
            _ => Err(format!("Unknown bootstrap agent: {}", s)),
        }
    }
}

/// A unit of knowledge extracted by a bootstrap agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(rename = "type", deserialize_with = "lenient_node_type")]
    pub node_type: NodeType,
    pub summary: String,
    #[serde(default)]
    pub content: String,
}

/// Unknown types from the model are filed as notes rather than failing the run.
fn lenient_node_type<'de, D>(deserializer: D) -> Result<NodeType, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(raw.parse().unwrap_or(NodeType::Note))
}

/// A bootstrap agent's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Findings {
    #[serde(default)]
    pub findings: Vec<Finding>,
}

/// Turns gathered project material into findings.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapAgent {
    kind: BootstrapKind,
}

impl BootstrapAgent {
    pub fn new(kind: BootstrapKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> BootstrapKind {
        self.kind
    }
}

impl Agent for BootstrapAgent {
    type Output = Findings;

    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn system_prompt(&self) -> &'static str {
        match self.kind {
            BootstrapKind::Docs => BOOTSTRAP_DOCS_PROMPT,
            BootstrapKind::Deps => BOOTSTRAP_DEPS_PROMPT,
            BootstrapKind::Structure => BOOTSTRAP_STRUCTURE_PROMPT,
        }
    }

    fn check(&self, output: &Findings) -> Result<Option<String>, String> {
        if output.findings.iter().any(|f| f.summary.trim().is_empty()) {
            return Err("every finding needs a summary".to_string());
        }
        if output.findings.is_empty() {
            return Ok(Some(format!("{} agent produced no findings", self.kind)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::decode_structured;

    #[test]
    fn test_unknown_finding_type_becomes_note() {
        let findings: Findings = decode_structured(
            r#"{"findings":[{"type":"component","summary":"API layer","content":"axum"},
                            {"type":"Decision","summary":"Use SQLite"}]}"#,
        )
        .unwrap();
        assert_eq!(findings.findings[0].node_type, NodeType::Note);
        assert_eq!(findings.findings[1].node_type, NodeType::Decision);
        assert_eq!(findings.findings[1].content, "");
    }

    #[test]
    fn test_empty_findings_is_a_warning() {
        let agent = BootstrapAgent::new(BootstrapKind::Deps);
        let warning = agent.check(&Findings { findings: vec![] }).unwrap();
        assert_eq!(warning.as_deref(), Some("deps agent produced no findings"));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Docs".parse::<BootstrapKind>().unwrap(), BootstrapKind::Docs);
        assert!("git".parse::<BootstrapKind>().is_err());
    }
}
