//! Artifact records for the four tiers.
//!
//! Records are created once by their stage and never mutated after
//! acceptance. Tier files on disk are JSON arrays of these records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::evidence::Evidence;

/// The four artifact tiers, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    UseCase,
    Policy,
    TestCase,
    Example,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::UseCase, Tier::Policy, Tier::TestCase, Tier::Example];

    /// Identifier namespace prefix
    pub fn prefix(&self) -> &'static str {
        match self {
            Tier::UseCase => "uc_",
            Tier::Policy => "pol_",
            Tier::TestCase => "tc_",
            Tier::Example => "ex_",
        }
    }

    /// File name of the tier inside an output directory
    pub fn file_name(&self) -> &'static str {
        match self {
            Tier::UseCase => "use_cases.json",
            Tier::Policy => "policies.json",
            Tier::TestCase => "test_cases.json",
            Tier::Example => "dataset.json",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::UseCase => "use_case",
            Tier::Policy => "policy",
            Tier::TestCase => "test_case",
            Tier::Example => "example",
        }
    }

    /// Tier an identifier belongs to, judged by its prefix
    pub fn of_id(id: &str) -> Option<Tier> {
        Tier::ALL.into_iter().find(|t| id.starts_with(t.prefix()))
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercase and fold `-`/space into `_` so "Must-Not" reads as "must_not"
fn canonical_tag(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '-' || c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Policy classification
///
/// `Unknown` keeps whatever the producer or a hand-edited file said so that
/// validation can report it instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PolicyType {
    Must,
    MustNot,
    Escalate,
    Style,
    Format,
    Unknown(String),
}

impl PolicyType {
    /// Known types from most to least specific
    pub const PRECEDENCE: [PolicyType; 5] = [
        PolicyType::MustNot,
        PolicyType::Escalate,
        PolicyType::Style,
        PolicyType::Format,
        PolicyType::Must,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            PolicyType::Must => "must",
            PolicyType::MustNot => "must_not",
            PolicyType::Escalate => "escalate",
            PolicyType::Style => "style",
            PolicyType::Format => "format",
            PolicyType::Unknown(other) => other,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, PolicyType::Unknown(_))
    }

    /// Position in `PRECEDENCE` (unknown types rank last)
    pub fn precedence(&self) -> usize {
        Self::PRECEDENCE
            .iter()
            .position(|t| t == self)
            .unwrap_or(Self::PRECEDENCE.len())
    }
}

impl From<String> for PolicyType {
    fn from(value: String) -> Self {
        match canonical_tag(&value).as_str() {
            "must" => PolicyType::Must,
            "must_not" | "mustnot" => PolicyType::MustNot,
            "escalate" => PolicyType::Escalate,
            "style" => PolicyType::Style,
            "format" => PolicyType::Format,
            _ => PolicyType::Unknown(value),
        }
    }
}

impl From<PolicyType> for String {
    fn from(value: PolicyType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message author role
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    User,
    Operator,
    Assistant,
    System,
    Unknown(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::User => "user",
            Role::Operator => "operator",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Unknown(other) => other,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Role::Unknown(_))
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        match canonical_tag(&value).as_str() {
            "user" => Role::User,
            "operator" => Role::Operator,
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::Unknown(value),
        }
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Example format discriminator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExampleFormat {
    /// One user question, answered by `expected_output`
    SingleTurnQa,
    /// One operator utterance to be corrected
    SingleUtteranceCorrection,
    /// A dialog whose final operator turn is to be corrected
    DialogLastTurnCorrection,
    Unknown(String),
}

impl ExampleFormat {
    pub const KNOWN: [ExampleFormat; 3] = [
        ExampleFormat::SingleTurnQa,
        ExampleFormat::SingleUtteranceCorrection,
        ExampleFormat::DialogLastTurnCorrection,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            ExampleFormat::SingleTurnQa => "single_turn_qa",
            ExampleFormat::SingleUtteranceCorrection => "single_utterance_correction",
            ExampleFormat::DialogLastTurnCorrection => "dialog_last_turn_correction",
            ExampleFormat::Unknown(other) => other,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, ExampleFormat::Unknown(_))
    }

    /// Role whose message the example asks to correct, if any
    pub fn corrected_role(&self) -> Option<Role> {
        match self {
            ExampleFormat::SingleUtteranceCorrection | ExampleFormat::DialogLastTurnCorrection => {
                Some(Role::Operator)
            }
            _ => None,
        }
    }
}

impl From<String> for ExampleFormat {
    fn from(value: String) -> Self {
        match canonical_tag(&value).as_str() {
            "single_turn_qa" => ExampleFormat::SingleTurnQa,
            "single_utterance_correction" => ExampleFormat::SingleUtteranceCorrection,
            "dialog_last_turn_correction" => ExampleFormat::DialogLastTurnCorrection,
            _ => ExampleFormat::Unknown(value),
        }
    }
}

impl From<ExampleFormat> for String {
    fn from(value: ExampleFormat) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ExampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An extracted use case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UseCase {
    pub id: String,
    pub name: String,
    pub description: String,
    pub evidence: Vec<Evidence>,
}

/// An extracted policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    pub evidence: Vec<Evidence>,
}

/// A named dimension with a small set of discrete values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariationAxis {
    pub name: String,
    pub values: Vec<String>,
}

impl VariationAxis {
    pub fn new(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// A parameterised variation of one use case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub use_case_id: String,
    pub name: String,
    pub description: String,
    pub parameter_variation_axes: Vec<VariationAxis>,
    #[serde(default)]
    pub policy_ids: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Conversation input of an example
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputData {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_message_index: Option<usize>,
}

impl InputData {
    /// Index the format expects `target_message_index` to hold
    pub fn expected_target(format: &ExampleFormat, message_count: usize) -> Option<usize> {
        match format {
            ExampleFormat::SingleUtteranceCorrection => Some(0),
            ExampleFormat::DialogLastTurnCorrection => message_count.checked_sub(1),
            _ => None,
        }
    }

    /// Check message cardinality, roles, and target index against `format`
    ///
    /// Returns every violation found, in a stable order.
    pub fn format_violations(&self, format: &ExampleFormat) -> Vec<String> {
        let mut violations = Vec::new();
        let count = self.messages.len();

        match format {
            ExampleFormat::SingleTurnQa => {
                if count != 1 || self.messages[0].role != Role::User {
                    violations.push(format!(
                        "{} needs exactly one user message, got {}",
                        format,
                        describe_roles(&self.messages)
                    ));
                }
                if self.target_message_index.is_some() {
                    violations.push(format!("{} must not set target_message_index", format));
                }
            }
            ExampleFormat::SingleUtteranceCorrection => {
                if count != 1 || self.messages[0].role != Role::Operator {
                    violations.push(format!(
                        "{} needs exactly one operator message, got {}",
                        format,
                        describe_roles(&self.messages)
                    ));
                }
            }
            ExampleFormat::DialogLastTurnCorrection => {
                if count < 2 {
                    violations.push(format!(
                        "{} needs at least 2 messages, got {}",
                        format, count
                    ));
                }
                if let Some(last) = self.messages.last() {
                    if last.role != Role::Operator {
                        violations.push(format!(
                            "{} must end with an operator message, last role is '{}'",
                            format, last.role
                        ));
                    }
                }
            }
            ExampleFormat::Unknown(other) => {
                violations.push(format!("Unknown example format '{}'", other));
                return violations;
            }
        }

        if let Some(role) = format.corrected_role() {
            let expected = Self::expected_target(format, count);
            match self.target_message_index {
                None => violations.push(format!("{} requires target_message_index", format)),
                Some(index) if Some(index) != expected => violations.push(format!(
                    "target_message_index {} should be {}",
                    index,
                    expected.map(|i| i.to_string()).unwrap_or_else(|| "-".into())
                )),
                Some(index) => match self.messages.get(index) {
                    Some(target) if target.role != role => violations.push(format!(
                        "target message {} has role '{}', expected '{}'",
                        index, target.role, role
                    )),
                    None => violations.push(format!(
                        "target_message_index {} is out of range for {} messages",
                        index, count
                    )),
                    _ => {}
                },
            }
        }

        violations
    }
}

fn describe_roles(messages: &[Message]) -> String {
    if messages.is_empty() {
        return "no messages".to_string();
    }
    let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
    format!("[{}]", roles.join(", "))
}

/// A generated dataset example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetExample {
    pub id: String,
    pub case: String,
    pub format: ExampleFormat,
    pub use_case_id: String,
    pub test_case_id: String,
    pub input: InputData,
    pub expected_output: String,
    pub evaluation_criteria: Vec<String>,
    pub policy_ids: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl DatasetExample {
    /// `metadata.source` as a string, if present
    pub fn source_tag(&self) -> Option<&str> {
        self.metadata.get("source").and_then(|v| v.as_str())
    }
}

/// A complete four-tier artifact set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactSet {
    pub use_cases: Vec<UseCase>,
    pub policies: Vec<Policy>,
    pub test_cases: Vec<TestCase>,
    pub examples: Vec<DatasetExample>,
}

impl ArtifactSet {
    /// Number of records in a tier
    pub fn count(&self, tier: Tier) -> usize {
        match tier {
            Tier::UseCase => self.use_cases.len(),
            Tier::Policy => self.policies.len(),
            Tier::TestCase => self.test_cases.len(),
            Tier::Example => self.examples.len(),
        }
    }

    /// Identifiers of a tier, in file order
    pub fn ids(&self, tier: Tier) -> Vec<&str> {
        match tier {
            Tier::UseCase => self.use_cases.iter().map(|r| r.id.as_str()).collect(),
            Tier::Policy => self.policies.iter().map(|r| r.id.as_str()).collect(),
            Tier::TestCase => self.test_cases.iter().map(|r| r.id.as_str()).collect(),
            Tier::Example => self.examples.iter().map(|r| r.id.as_str()).collect(),
        }
    }

    /// Distinct policy types present, sorted
    pub fn policy_types(&self) -> Vec<PolicyType> {
        let mut types: Vec<PolicyType> =
            self.policies.iter().map(|p| p.policy_type.clone()).collect();
        types.sort();
        types.dedup();
        types
    }

    /// Per-tier record counts keyed by tier name
    pub fn counts(&self) -> BTreeMap<String, usize> {
        Tier::ALL
            .into_iter()
            .map(|t| (t.as_str().to_string(), self.count(t)))
            .collect()
    }
}
