use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A match key in a rule's `command` or `subcommand` slot.
///
/// Config files spell this as a plain string: the literal tokens `ALL` and
/// `EMPTY` are sentinels, anything else is a literal match key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchToken {
    /// Matches any token at this position, including absence.
    All,
    /// Matches only when the token is absent from the request.
    Empty,
    /// Matches exactly this literal token.
    Literal(String),
}

impl MatchToken {
    fn matches(&self, token: Option<&str>) -> bool {
        match self {
            MatchToken::All => true,
            MatchToken::Empty => token.is_none(),
            MatchToken::Literal(lit) => token == Some(lit.as_str()),
        }
    }
}

impl From<&str> for MatchToken {
    fn from(value: &str) -> Self {
        match value {
            "ALL" => MatchToken::All,
            "EMPTY" => MatchToken::Empty,
            other => MatchToken::Literal(other.to_string()),
        }
    }
}

impl Serialize for MatchToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MatchToken::All => serializer.serialize_str("ALL"),
            MatchToken::Empty => serializer.serialize_str("EMPTY"),
            MatchToken::Literal(lit) => serializer.serialize_str(lit),
        }
    }
}

impl<'de> Deserialize<'de> for MatchToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MatchToken::from(raw.as_str()))
    }
}

/// One configured command/subcommand binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub command: MatchToken,
    pub subcommand: MatchToken,
    /// Absolute path of the executable to run.
    pub program: String,
    /// Opaque ACL payload, consumed only by the `AclChecker` collaborator.
    pub acl: String,
    pub run_as_user: Option<String>,
    #[serde(default)]
    pub run_as_uid: i64,
    #[serde(default)]
    pub run_as_gid: i64,
    /// `0` = no stdin argument, `N` = 1-based argument position, `-1` = last argument.
    #[serde(default)]
    pub stdin_arg_index: i32,
    pub summary_subcommand: Option<String>,
    pub help_subcommand: Option<String>,
    /// 1-based argument positions whose values are masked before logging.
    #[serde(default)]
    pub sensitive_args: Vec<usize>,
}

impl Rule {
    /// Whether this rule's identity-drop fields should be applied.
    pub fn drops_privileges(&self) -> bool {
        self.run_as_user.is_some() && self.run_as_uid > 0
    }

    /// `argv[0]`: the basename of `program`.
    pub fn program_basename(&self) -> &str {
        match self.program.rfind('/') {
            Some(idx) => &self.program[idx + 1..],
            None => &self.program,
        }
    }
}

/// The full, ordered rule table for one config generation.
///
/// Order is authoritative: `resolve` returns the first match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleTable(pub Vec<Rule>);

impl RuleTable {
    pub fn rules(&self) -> &[Rule] {
        &self.0
    }
}

/// Resolve `(command, subcommand)` against the rule table. First match wins.
pub fn resolve<'a>(
    rules: &'a RuleTable,
    command: Option<&str>,
    subcommand: Option<&str>,
) -> Option<&'a Rule> {
    rules
        .rules()
        .iter()
        .find(|rule| rule.command.matches(command) && rule.subcommand.matches(subcommand))
}
