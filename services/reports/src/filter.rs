//! Rule catalog and filter predicate parsing.
//!
//! The catalog of diagnostic rules is built once at startup and never
//! mutated afterwards, so lookups need no synchronization. A filter string
//! submitted with a report request is parsed into a predicate selecting a
//! subset of the catalog.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

/// Metadata describing one diagnostic rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMetadata {
    /// Unique rule identifier, e.g. `LongGcPause`
    pub id: String,
    /// Human-readable rule name
    pub name: String,
    /// Topic the rule is grouped under, e.g. `garbage_collection`
    pub topic: String,
}

impl RuleMetadata {
    fn new(id: &str, name: &str, topic: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            topic: topic.to_string(),
        }
    }
}

/// Read-only catalog of all known diagnostic rules
pub struct RuleCatalog {
    rules: Vec<RuleMetadata>,
    /// Lowercased rule id -> index into `rules`
    id_index: HashMap<String, usize>,
    /// Lowercased topic -> indices of that topic's rules
    topic_index: HashMap<String, Vec<usize>>,
}

static CATALOG: OnceLock<RuleCatalog> = OnceLock::new();

impl RuleCatalog {
    /// Build a catalog from the given rules
    pub fn new(rules: Vec<RuleMetadata>) -> Self {
        let mut id_index = HashMap::with_capacity(rules.len());
        let mut topic_index: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, rule) in rules.iter().enumerate() {
            id_index.insert(rule.id.to_lowercase(), i);
            topic_index
                .entry(rule.topic.to_lowercase())
                .or_default()
                .push(i);
        }
        Self {
            rules,
            id_index,
            topic_index,
        }
    }

    /// The built-in rule set evaluated against every recording
    pub fn builtin() -> Self {
        Self::new(vec![
            RuleMetadata::new("LongGcPause", "Long GC Pause", "garbage_collection"),
            RuleMetadata::new("HighGc", "High GC Pressure", "garbage_collection"),
            RuleMetadata::new("FullGc", "Full GC", "garbage_collection"),
            RuleMetadata::new("GcFreedRatio", "GC Freed Ratio", "garbage_collection"),
            RuleMetadata::new("HeapContent", "Heap Content", "heap"),
            RuleMetadata::new("Allocations", "Allocation Pressure", "heap"),
            RuleMetadata::new("HeapDump", "Heap Dump", "heap"),
            RuleMetadata::new("ContendedLocks", "Contended Locks", "lock_instances"),
            RuleMetadata::new(
                "BiasedLockingRevocation",
                "Biased Locking Revocation",
                "lock_instances",
            ),
            RuleMetadata::new("FileIoPeak", "File I/O Peak Duration", "file_io"),
            RuleMetadata::new("SocketIoPeak", "Socket I/O Peak Duration", "socket_io"),
            RuleMetadata::new("HighJvmCpu", "High JVM CPU Load", "processes"),
            RuleMetadata::new(
                "ManyRunningProcesses",
                "Many Running Processes",
                "environment",
            ),
            RuleMetadata::new("StackdepthSetting", "Stack Depth Setting", "jvm_information"),
            RuleMetadata::new("Options", "JVM Options", "jvm_information"),
        ])
    }

    /// Process-wide catalog, initialized on first access
    pub fn global() -> &'static RuleCatalog {
        CATALOG.get_or_init(RuleCatalog::builtin)
    }

    /// All rules in the catalog
    pub fn rules(&self) -> &[RuleMetadata] {
        &self.rules
    }

    /// Look up a rule by id, case-insensitively
    pub fn rule_by_id(&self, id: &str) -> Option<&RuleMetadata> {
        self.id_index
            .get(&id.to_lowercase())
            .map(|&i| &self.rules[i])
    }

    /// All rules under the given topic, case-insensitively
    pub fn rules_by_topic(&self, topic: &str) -> Option<&[usize]> {
        self.topic_index
            .get(&topic.to_lowercase())
            .map(Vec::as_slice)
    }
}

/// Predicate selecting which diagnostic rules to evaluate
///
/// Parsed from the optional `filter` form field. Tokens that match neither
/// a rule id nor a topic are silently dropped; a filter consisting only of
/// unmatched tokens therefore selects nothing rather than failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RulePredicate {
    /// Accept every rule (blank or absent filter)
    All,
    /// Accept only rules whose id is in the set (lowercased ids)
    Ids(BTreeSet<String>),
}

impl RulePredicate {
    /// Parse a raw filter string against the catalog
    pub fn parse(catalog: &RuleCatalog, filter: Option<&str>) -> Self {
        let filter = match filter {
            Some(f) if !f.trim().is_empty() => f,
            _ => return Self::All,
        };

        let mut selected = BTreeSet::new();
        for token in filter.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            // Rule ids take precedence over topics
            if let Some(rule) = catalog.rule_by_id(token) {
                selected.insert(rule.id.to_lowercase());
            } else if let Some(indices) = catalog.rules_by_topic(token) {
                for &i in indices {
                    selected.insert(catalog.rules()[i].id.to_lowercase());
                }
            }
        }
        Self::Ids(selected)
    }

    /// Whether the given rule is selected
    pub fn matches(&self, rule: &RuleMetadata) -> bool {
        match self {
            Self::All => true,
            Self::Ids(ids) => ids.contains(&rule.id.to_lowercase()),
        }
    }

    /// Number of rules of the catalog this predicate selects
    pub fn selected_count(&self, catalog: &RuleCatalog) -> usize {
        match self {
            Self::All => catalog.rules().len(),
            Self::Ids(ids) => ids.len(),
        }
    }
}
