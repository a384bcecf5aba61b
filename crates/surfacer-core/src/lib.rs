use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("interaction event carries no platform metadata")]
    UnknownPlatform,
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid feedback event: {0}")]
    InvalidFeedback(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("memory store did not respond within the configured deadline")]
    Timeout,
    #[error("memory store unavailable: {0}")]
    Unavailable(String),
    #[error("memory store returned corrupt data: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryId(pub Ulid);

impl MemoryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for MemoryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Slack,
    Email,
    Form,
    Browser,
    Other,
}

impl Platform {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Slack => "slack",
            Self::Email => "email",
            Self::Form => "form",
            Self::Browser => "browser",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "slack" => Some(Self::Slack),
            "email" => Some(Self::Email),
            "form" => Some(Self::Form),
            "browser" => Some(Self::Browser),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Draft,
    PendingApproval,
    Approved,
    Expired,
    Archived,
}

impl MemoryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Expired => "expired",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "pending_approval" => Some(Self::PendingApproval),
            "approved" => Some(Self::Approved),
            "expired" => Some(Self::Expired),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IntentClass {
    InformationSeeking,
    TaskExecution,
    AccessRequest,
    PolicyClarification,
    Troubleshooting,
    Other,
}

impl IntentClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InformationSeeking => "information_seeking",
            Self::TaskExecution => "task_execution",
            Self::AccessRequest => "access_request",
            Self::PolicyClarification => "policy_clarification",
            Self::Troubleshooting => "troubleshooting",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "information_seeking" => Some(Self::InformationSeeking),
            "task_execution" => Some(Self::TaskExecution),
            "access_request" => Some(Self::AccessRequest),
            "policy_clarification" => Some(Self::PolicyClarification),
            "troubleshooting" => Some(Self::Troubleshooting),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Clearance {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl Clearance {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Public => 0,
            Self::Internal => 1,
            Self::Confidential => 2,
            Self::Restricted => 3,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Confidential => "confidential",
            Self::Restricted => "restricted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "public" => Some(Self::Public),
            "internal" => Some(Self::Internal),
            "confidential" => Some(Self::Confidential),
            "restricted" => Some(Self::Restricted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccessEffect {
    Allow,
    Deny,
    Redact,
}

impl AccessEffect {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Redact => "redact",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Accepted,
    Ignored,
    Rejected,
    Edited,
}

impl FeedbackOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Ignored => "ignored",
            Self::Rejected => "rejected",
            Self::Edited => "edited",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accepted" => Some(Self::Accepted),
            "ignored" => Some(Self::Ignored),
            "rejected" => Some(Self::Rejected),
            "edited" => Some(Self::Edited),
            _ => None,
        }
    }

    /// Sample value folded into the accept-rate moving average.
    #[must_use]
    pub fn accept_sample(self) -> f32 {
        match self {
            Self::Accepted => 1.0,
            Self::Edited => 0.75,
            Self::Ignored => 0.25,
            Self::Rejected => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceMethod {
    Inline,
    Tooltip,
    Sidebar,
    None,
}

impl SurfaceMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Tooltip => "tooltip",
            Self::Sidebar => "sidebar",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceBand {
    Full,
    Indicator,
    Related,
}

impl SurfaceBand {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Indicator => "indicator",
            Self::Related => "related",
        }
    }
}

/// One clause of an access rule. Empty role/department lists match any value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClause {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub departments: Vec<String>,
    #[serde(default)]
    pub min_clearance: Option<Clearance>,
    pub effect: AccessEffect,
}

impl AccessClause {
    fn matches(&self, user: &UserIdentity) -> bool {
        if !self.roles.is_empty() && !self.roles.iter().any(|role| role == &user.role) {
            return false;
        }
        if !self.departments.is_empty()
            && !self.departments.iter().any(|department| department == &user.department)
        {
            return false;
        }
        if let Some(min_clearance) = self.min_clearance {
            if user.clearance.rank() < min_clearance.rank() {
                return false;
            }
        }
        true
    }
}

/// Ordered clause list; the first matching clause wins, else `default_effect`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessRule {
    #[serde(default)]
    pub clauses: Vec<AccessClause>,
    pub default_effect: AccessEffect,
}

impl AccessRule {
    /// Rule that admits any identity at or above the given clearance.
    #[must_use]
    pub fn min_clearance(clearance: Clearance) -> Self {
        Self {
            clauses: vec![AccessClause {
                roles: Vec::new(),
                departments: Vec::new(),
                min_clearance: Some(clearance),
                effect: AccessEffect::Allow,
            }],
            default_effect: AccessEffect::Deny,
        }
    }

    #[must_use]
    pub fn evaluate(&self, user: &UserIdentity) -> AccessEffect {
        for clause in &self.clauses {
            if clause.matches(user) {
                return clause.effect;
            }
        }
        self.default_effect
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Expiration {
    At {
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    Reconfirm {
        interval_days: u32,
        #[serde(with = "time::serde::rfc3339")]
        last_confirmed_at: OffsetDateTime,
    },
}

impl Expiration {
    #[must_use]
    pub fn deadline(&self) -> OffsetDateTime {
        match self {
            Self::At { at } => *at,
            Self::Reconfirm { interval_days, last_confirmed_at } => {
                *last_confirmed_at + Duration::days(i64::from(*interval_days))
            }
        }
    }

    #[must_use]
    pub fn is_expired(&self, as_of: OffsetDateTime) -> bool {
        as_of >= self.deadline()
    }

    /// Fraction of the policy lifetime consumed at `as_of`, clamped to [0, 1].
    #[must_use]
    pub fn lifetime_fraction(&self, lifetime_start: OffsetDateTime, as_of: OffsetDateTime) -> f32 {
        let start = match self {
            Self::At { .. } => lifetime_start,
            Self::Reconfirm { last_confirmed_at, .. } => *last_confirmed_at,
        };
        let total = (self.deadline() - start).whole_seconds();
        if total <= 0 {
            return 1.0;
        }
        let elapsed = (as_of - start).whole_seconds().max(0);
        ratio_clamped(elapsed, total)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowBinding {
    pub workflow: String,
    #[serde(default)]
    pub step: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageStats {
    pub access_count: u64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_accessed: Option<OffsetDateTime>,
    pub accept_rate: f32,
}

impl UsageStats {
    /// Fold one feedback outcome into the aggregate.
    ///
    /// The accept rate is an exponential moving average so a run of rejections
    /// decays a memory's standing without erasing its history.
    pub fn apply(&mut self, outcome: FeedbackOutcome, at: OffsetDateTime, ema_alpha: f32) {
        let alpha = ema_alpha.clamp(0.0, 1.0);
        self.accept_rate = (1.0 - alpha)
            .mul_add(self.accept_rate, alpha * outcome.accept_sample())
            .clamp(0.0, 1.0);
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed = Some(match self.last_accessed {
            Some(previous) if previous > at => previous,
            _ => at,
        });
    }
}

impl Default for UsageStats {
    fn default() -> Self {
        Self { access_count: 0, last_accessed: None, accept_rate: 0.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Memory {
    pub id: MemoryId,
    pub canonical_question: String,
    #[serde(default)]
    pub semantic_variants: Vec<String>,
    pub answer: serde_json::Value,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub departments: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub workflows: Vec<WorkflowBinding>,
    pub access_rule: AccessRule,
    pub expiration: Expiration,
    pub authority_score: f32,
    #[serde(default)]
    pub usage_stats: UsageStats,
    pub status: MemoryStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Memory {
    /// Validate one memory against write-time invariants.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when identity, embedding, score
    /// range, or workflow constraints are violated.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.canonical_question.trim().is_empty() {
            return Err(EngineError::Validation(
                "canonical_question MUST be non-empty".to_string(),
            ));
        }
        if self.embedding.is_empty() {
            return Err(EngineError::Validation("embedding MUST be non-empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.authority_score) {
            return Err(EngineError::Validation(
                "authority_score MUST be in [0.0, 1.0]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.usage_stats.accept_rate) {
            return Err(EngineError::Validation("accept_rate MUST be in [0.0, 1.0]".to_string()));
        }
        for binding in &self.workflows {
            if binding.workflow.trim().is_empty() {
                return Err(EngineError::Validation(
                    "workflow binding MUST name a workflow".to_string(),
                ));
            }
            if binding.step == Some(0) {
                return Err(EngineError::Validation(
                    "workflow steps are 1-based; step MUST be >= 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Security- and legal-tagged memories are held to the strictest gate.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.tags.contains("security") || self.tags.contains("legal")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub role: String,
    pub department: String,
    pub clearance: Clearance,
}

impl UserIdentity {
    /// The identity every unrecognized user degrades to.
    #[must_use]
    pub fn least_privileged(user_id: &str) -> Self {
        Self {
            id: user_id.to_string(),
            role: String::new(),
            department: String::new(),
            clearance: Clearance::Public,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentSignal {
    pub class: IntentClass,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStageSignal {
    pub stage: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSignals {
    pub app_detection_confidence: f32,
    pub intent: IntentSignal,
    pub temporal_urgency: f32,
    #[serde(default)]
    pub workflow_stage: Option<WorkflowStageSignal>,
}

/// Ephemeral per-interaction context; never persisted beyond the decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Context {
    pub platform: Platform,
    pub raw_input: String,
    pub user: UserIdentity,
    pub signals: ContextSignals,
}

/// Raw interaction event, before extraction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionEvent {
    #[serde(default)]
    pub source: Option<String>,
    pub raw_input: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackEvent {
    pub memory_id: MemoryId,
    pub context_fingerprint: String,
    pub outcome: FeedbackOutcome,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub embedding_dim: usize,
    pub similarity_floor: f32,
    pub default_k: usize,
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { embedding_dim: 256, similarity_floor: 0.45, default_k: 20, timeout_ms: 250 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    pub similarity_weight: f32,
    pub context_fit_weight: f32,
    pub timing_weight: f32,
    pub department_fit_weight: f32,
    pub intent_fit_weight: f32,
    pub authority_fit_weight: f32,
    pub org_wide_department_fit: f32,
    pub recency_weight: f32,
    pub freshness_weight: f32,
    pub recency_horizon_days: u16,
    pub decay_accept_floor: f32,
    pub decay_factor: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            similarity_weight: 0.6,
            context_fit_weight: 0.3,
            timing_weight: 0.1,
            department_fit_weight: 0.5,
            intent_fit_weight: 0.3,
            authority_fit_weight: 0.2,
            org_wide_department_fit: 0.6,
            recency_weight: 0.5,
            freshness_weight: 0.5,
            recency_horizon_days: 90,
            decay_accept_floor: 0.25,
            decay_factor: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    pub full_edge: f32,
    pub primary_edge: f32,
    pub related_edge: f32,
    pub clamp_min: f32,
    pub clamp_max: f32,
    pub critical_floor: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            full_edge: 0.85,
            primary_edge: 0.65,
            related_edge: 0.45,
            clamp_min: 0.30,
            clamp_max: 0.90,
            critical_floor: 0.45,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StitchConfig {
    pub max_members: usize,
    pub cluster_max: usize,
    pub lead_gap: f32,
    pub single_score_cutoff: f32,
    pub trigger_patterns: Vec<String>,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            max_members: 5,
            cluster_max: 3,
            lead_gap: 0.10,
            single_score_cutoff: 0.85,
            trigger_patterns: vec![
                "end to end".to_string(),
                "entire process".to_string(),
                "full process".to_string(),
                "process for".to_string(),
                "step by step".to_string(),
                "and then".to_string(),
                "workflow".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeedbackConfig {
    pub ema_alpha: f32,
    pub positive_cap: f32,
    pub negative_cap: f32,
    pub accepted_step: f32,
    pub edited_step: f32,
    pub ignored_step: f32,
    pub rejected_step: f32,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.1,
            positive_cap: 0.15,
            negative_cap: 0.20,
            accepted_step: 0.01,
            edited_step: 0.005,
            ignored_step: 0.005,
            rejected_step: 0.02,
        }
    }
}

/// Every numeric policy value the engine consults. Deployment configuration,
/// not protocol constants.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub retrieval: RetrievalConfig,
    pub scoring: ScoringConfig,
    pub gate: GateConfig,
    pub stitch: StitchConfig,
    pub feedback: FeedbackConfig,
}

impl EngineConfig {
    /// Reject configurations that would make the gate or scorer nonsensical.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when edges are out of order or
    /// weights leave the unit interval.
    pub fn validate(&self) -> Result<(), EngineError> {
        let unit_fields = [
            ("similarity_floor", self.retrieval.similarity_floor),
            ("full_edge", self.gate.full_edge),
            ("primary_edge", self.gate.primary_edge),
            ("related_edge", self.gate.related_edge),
            ("clamp_min", self.gate.clamp_min),
            ("clamp_max", self.gate.clamp_max),
            ("critical_floor", self.gate.critical_floor),
            ("ema_alpha", self.feedback.ema_alpha),
        ];
        for (name, value) in unit_fields {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::Validation(format!("{name} MUST be in [0.0, 1.0]")));
            }
        }
        if self.gate.related_edge > self.gate.primary_edge
            || self.gate.primary_edge > self.gate.full_edge
        {
            return Err(EngineError::Validation(
                "gate edges MUST satisfy related <= primary <= full".to_string(),
            ));
        }
        if self.gate.clamp_min > self.gate.clamp_max {
            return Err(EngineError::Validation("clamp_min MUST be <= clamp_max".to_string()));
        }
        if self.stitch.max_members == 0 || self.stitch.max_members > 5 {
            return Err(EngineError::Validation(
                "stitch max_members MUST be in [1, 5]".to_string(),
            ));
        }
        if self.retrieval.embedding_dim == 0 {
            return Err(EngineError::Validation("embedding_dim MUST be >= 1".to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Embedding
// ---------------------------------------------------------------------------

fn splitmix64(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9E37_79B9_7F4A_7C15);
    value = (value ^ (value >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    value ^ (value >> 31)
}

fn term_hash(term: &str) -> u64 {
    let mut hash = 0xCBF2_9CE4_8422_2325_u64;
    for byte in term.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }
    splitmix64(hash)
}

/// Normalize free text into deduplicated lowercase terms.
#[must_use]
pub fn tokenize_terms(value: &str) -> Vec<String> {
    let mut terms = BTreeSet::new();
    for raw in value.split_whitespace() {
        let normalized = raw
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-')
            .collect::<String>()
            .to_ascii_lowercase();
        if normalized.len() >= 2 {
            terms.insert(normalized);
        }
    }
    terms.into_iter().collect()
}

/// Deterministic signed feature-hash embedding, L2-normalized.
///
/// The same text always maps to the same vector, so cosine comparisons are
/// reproducible across processes and releases.
#[must_use]
pub fn embed_text(text: &str, dim: usize) -> Vec<f32> {
    let mut vector = vec![0.0_f32; dim.max(1)];
    for term in tokenize_terms(text) {
        let hash = term_hash(&term);
        let bucket = usize::try_from(hash % u64::try_from(vector.len()).unwrap_or(1))
            .unwrap_or(0);
        let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
    let norm = vector.iter().map(|component| component * component).sum::<f32>().sqrt();
    if norm > 0.0 {
        for component in &mut vector {
            *component /= norm;
        }
    }
    vector
}

/// Cosine similarity; 0.0 for mismatched dimensions or zero vectors.
#[must_use]
pub fn cosine_similarity(lhs: &[f32], rhs: &[f32]) -> f32 {
    if lhs.len() != rhs.len() || lhs.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut lhs_norm = 0.0_f32;
    let mut rhs_norm = 0.0_f32;
    for (a, b) in lhs.iter().zip(rhs.iter()) {
        dot += a * b;
        lhs_norm += a * a;
        rhs_norm += b * b;
    }
    if lhs_norm <= 0.0 || rhs_norm <= 0.0 {
        return 0.0;
    }
    (dot / (lhs_norm.sqrt() * rhs_norm.sqrt())).clamp(-1.0, 1.0)
}

/// Embedding stored for a memory: canonical question expanded with its
/// semantic variants so alternate phrasings still retrieve it.
#[must_use]
pub fn embed_memory_text(canonical_question: &str, semantic_variants: &[String], dim: usize) -> Vec<f32> {
    let mut combined = canonical_question.to_string();
    for variant in semantic_variants {
        combined.push(' ');
        combined.push_str(variant);
    }
    embed_text(&combined, dim)
}

// ---------------------------------------------------------------------------
// Context extraction
// ---------------------------------------------------------------------------

const INTENT_PATTERNS: &[(IntentClass, &[(&str, f32)])] = &[
    (
        IntentClass::InformationSeeking,
        &[
            ("how do i", 0.6),
            ("how to", 0.5),
            ("what is", 0.55),
            ("where can i find", 0.6),
            ("where is", 0.45),
            ("who is", 0.4),
        ],
    ),
    (
        IntentClass::TaskExecution,
        &[
            ("i need to submit", 0.6),
            ("help me complete", 0.6),
            ("walk me through", 0.65),
            ("help me", 0.4),
            ("submit", 0.3),
        ],
    ),
    (
        IntentClass::AccessRequest,
        &[
            ("i need access", 0.7),
            ("can i get permission", 0.65),
            ("request access", 0.65),
            ("who approves", 0.6),
            ("grant", 0.35),
        ],
    ),
    (
        IntentClass::PolicyClarification,
        &[
            ("is it allowed", 0.65),
            ("am i allowed", 0.65),
            ("what are the rules", 0.6),
            ("am i required", 0.6),
            ("policy", 0.4),
            ("compliance", 0.35),
        ],
    ),
    (
        IntentClass::Troubleshooting,
        &[
            ("getting an error", 0.65),
            ("not working", 0.6),
            ("something is broken", 0.6),
            ("broken", 0.45),
            ("failing", 0.45),
            ("error", 0.4),
        ],
    ),
];

const URGENCY_PATTERNS: &[(&str, f32)] = &[
    ("immediately", 0.5),
    ("urgent", 0.5),
    ("asap", 0.5),
    ("deadline", 0.4),
    ("today", 0.3),
    ("eod", 0.3),
];

const INTENT_CONFIDENCE_FLOOR: f32 = 0.3;

/// Detect the platform from event metadata.
///
/// Detection is deterministic; an unrecognized-but-present source maps to
/// [`Platform::Other`], while absent metadata is an error.
///
/// # Errors
/// Returns [`EngineError::UnknownPlatform`] when the event carries no source
/// metadata at all.
pub fn detect_platform(event: &InteractionEvent) -> Result<(Platform, f32), EngineError> {
    let Some(source) = event.source.as_deref() else {
        return Err(EngineError::UnknownPlatform);
    };
    let platform = match source.trim().to_ascii_lowercase().as_str() {
        "slack" => Platform::Slack,
        "email" | "mail" | "outlook" => Platform::Email,
        "form" | "forms" => Platform::Form,
        "browser" | "web" => Platform::Browser,
        _ => Platform::Other,
    };
    let confidence = if platform == Platform::Other { 0.25 } else { 1.0 };
    Ok((platform, confidence))
}

/// Classify free text into the fixed intent taxonomy.
///
/// The best class below the confidence floor collapses to `Other` with zero
/// confidence rather than guessing.
#[must_use]
pub fn classify_intent(raw_input: &str) -> IntentSignal {
    let lowered = raw_input.to_ascii_lowercase();
    let mut best = IntentSignal { class: IntentClass::Other, confidence: 0.0 };
    for (class, patterns) in INTENT_PATTERNS {
        let mut confidence = 0.0_f32;
        for (pattern, weight) in *patterns {
            if lowered.contains(pattern) {
                confidence += weight;
            }
        }
        let confidence = confidence.min(0.95);
        if confidence > best.confidence {
            best = IntentSignal { class: *class, confidence };
        }
    }
    if best.confidence < INTENT_CONFIDENCE_FLOOR {
        return IntentSignal { class: IntentClass::Other, confidence: 0.0 };
    }
    best
}

#[must_use]
pub fn temporal_urgency(raw_input: &str) -> f32 {
    let lowered = raw_input.to_ascii_lowercase();
    let mut urgency = 0.0_f32;
    for (pattern, weight) in URGENCY_PATTERNS {
        if lowered.contains(pattern) {
            urgency += weight;
        }
    }
    urgency.min(1.0)
}

/// Detect a multi-step workflow signal from configurable trigger patterns.
#[must_use]
pub fn detect_workflow_stage(config: &StitchConfig, raw_input: &str) -> Option<WorkflowStageSignal> {
    let lowered = raw_input.to_ascii_lowercase();
    let mut matched: Vec<&str> = Vec::new();
    for pattern in &config.trigger_patterns {
        if lowered.contains(pattern.as_str()) {
            matched.push(pattern.as_str());
        }
    }
    let first = matched.first()?;
    let extra = matched.len().saturating_sub(1).min(3);
    let confidence = 0.2_f32.mul_add(f32_from_count(extra), 0.4).min(0.9);
    Some(WorkflowStageSignal { stage: (*first).to_string(), confidence })
}

/// Turn a raw interaction event plus a resolved identity into a [`Context`].
///
/// Pure given its inputs; identity resolution happens upstream.
///
/// # Errors
/// Returns [`EngineError::UnknownPlatform`] when the event carries no
/// platform metadata.
pub fn extract_context(
    config: &EngineConfig,
    event: &InteractionEvent,
    user: UserIdentity,
) -> Result<Context, EngineError> {
    let (platform, app_detection_confidence) = detect_platform(event)?;
    Ok(Context {
        platform,
        raw_input: event.raw_input.clone(),
        user,
        signals: ContextSignals {
            app_detection_confidence,
            intent: classify_intent(&event.raw_input),
            temporal_urgency: temporal_urgency(&event.raw_input),
            workflow_stage: detect_workflow_stage(&config.stitch, &event.raw_input),
        },
    })
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// One candidate as returned by the memory store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedCandidate {
    pub memory: Memory,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredCandidate {
    pub memory: Memory,
    pub similarity: f32,
    pub context_fit: f32,
    pub timing: f32,
    pub composite: f32,
    pub access: AccessEffect,
}

fn department_fit(config: &ScoringConfig, memory: &Memory, user: &UserIdentity) -> f32 {
    if memory.departments.is_empty() {
        return config.org_wide_department_fit;
    }
    if !user.department.is_empty() && memory.departments.contains(&user.department) {
        return 1.0;
    }
    0.0
}

fn intent_fit(memory: &Memory, intent: &IntentSignal) -> f32 {
    if intent.class == IntentClass::Other {
        return 0.5;
    }
    if memory.tags.contains(intent.class.as_str()) {
        return 1.0;
    }
    0.0
}

fn recency_score(config: &ScoringConfig, memory: &Memory, as_of: OffsetDateTime) -> f32 {
    let Some(last_accessed) = memory.usage_stats.last_accessed else {
        return 0.5;
    };
    let age_days = (as_of - last_accessed).whole_days().max(0);
    let age = f32::from(u16::try_from(age_days).unwrap_or(u16::MAX));
    let horizon = f32::from(config.recency_horizon_days.max(1));
    (1.0 - age / horizon).clamp(0.0, 1.0)
}

fn freshness_score(memory: &Memory, as_of: OffsetDateTime) -> f32 {
    let fraction = memory.expiration.lifetime_fraction(memory.created_at, as_of);
    if fraction < 0.8 {
        return 1.0;
    }
    if fraction >= 1.0 {
        return 0.0;
    }
    1.0 - (fraction - 0.8) / 0.2
}

/// Composite relevance score for one retrieved candidate. Pure; the usage
/// decay multiplier is recomputed here and never stored.
#[must_use]
pub fn score_candidate(
    config: &ScoringConfig,
    context: &Context,
    candidate: &RetrievedCandidate,
    as_of: OffsetDateTime,
) -> ScoredCandidate {
    let memory = &candidate.memory;
    let context_fit = (config.department_fit_weight * department_fit(config, memory, &context.user)
        + config.intent_fit_weight * intent_fit(memory, &context.signals.intent)
        + config.authority_fit_weight * memory.authority_score.clamp(0.0, 1.0))
        .clamp(0.0, 1.0);
    let timing = (config.recency_weight * recency_score(config, memory, as_of)
        + config.freshness_weight * freshness_score(memory, as_of))
    .clamp(0.0, 1.0);

    let mut composite = (config.similarity_weight * candidate.similarity
        + config.context_fit_weight * context_fit
        + config.timing_weight * timing)
        .clamp(0.0, 1.0);
    if memory.usage_stats.accept_rate < config.decay_accept_floor {
        composite = (composite * config.decay_factor).clamp(0.0, 1.0);
    }

    ScoredCandidate {
        similarity: candidate.similarity,
        context_fit,
        timing,
        composite,
        access: memory.access_rule.evaluate(&context.user),
        memory: memory.clone(),
    }
}

// ---------------------------------------------------------------------------
// Threshold gate
// ---------------------------------------------------------------------------

/// Surfacing adjustment accumulated from feedback for one user/context pair,
/// keyed by the context fingerprint. The positive and negative components are
/// tracked separately so the caps bind independently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdaptiveThresholdState {
    pub key: String,
    pub positive: f32,
    pub negative: f32,
}

impl AdaptiveThresholdState {
    #[must_use]
    pub fn new(key: &str) -> Self {
        Self { key: key.to_string(), positive: 0.0, negative: 0.0 }
    }

    /// Nudge the adjustment for one feedback outcome, respecting the caps.
    pub fn apply(&mut self, outcome: FeedbackOutcome, config: &FeedbackConfig) {
        match outcome {
            FeedbackOutcome::Accepted => {
                self.positive = (self.positive + config.accepted_step).min(config.positive_cap);
            }
            FeedbackOutcome::Edited => {
                self.positive = (self.positive + config.edited_step).min(config.positive_cap);
            }
            FeedbackOutcome::Ignored => {
                self.negative = (self.negative + config.ignored_step).min(config.negative_cap);
            }
            FeedbackOutcome::Rejected => {
                self.negative = (self.negative + config.rejected_step).min(config.negative_cap);
            }
        }
    }
}

/// Effective primary-surfacing threshold for one user and one memory class.
///
/// Positive feedback lowers it, negative feedback raises it, the result is
/// clamped to the configured band, and critical-class memories keep a hard
/// floor the adaptive mechanism can never undercut.
#[must_use]
pub fn effective_threshold(config: &GateConfig, state: &AdaptiveThresholdState, critical: bool) -> f32 {
    let adjusted = config.primary_edge - state.positive + state.negative;
    let clamped = adjusted.clamp(config.clamp_min, config.clamp_max);
    if critical {
        clamped.max(config.critical_floor)
    } else {
        clamped
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatedCandidate {
    pub candidate: ScoredCandidate,
    pub band: SurfaceBand,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateOutcome {
    pub surfaced: Vec<GatedCandidate>,
    pub suppressed: Vec<String>,
}

/// Map scored candidates to surface bands, or suppress them.
///
/// Candidates below the retrieval similarity floor are excluded again here:
/// the retriever must never let them through, and a second check keeps a
/// misbehaving store from widening the blast radius.
#[must_use]
pub fn gate_candidates(
    config: &EngineConfig,
    candidates: Vec<ScoredCandidate>,
    state: &AdaptiveThresholdState,
) -> GateOutcome {
    let mut surfaced = Vec::new();
    let mut suppressed = Vec::new();

    for candidate in candidates {
        if candidate.access == AccessEffect::Deny {
            suppressed.push(format!("{}: access denied for requester", candidate.memory.id));
            continue;
        }
        if candidate.similarity < config.retrieval.similarity_floor {
            suppressed.push(format!(
                "{}: similarity {:.2} below retrieval floor {:.2}",
                candidate.memory.id, candidate.similarity, config.retrieval.similarity_floor
            ));
            continue;
        }
        let threshold = effective_threshold(&config.gate, state, candidate.memory.is_critical());
        if candidate.composite < config.gate.related_edge {
            suppressed.push(format!(
                "{}: composite {:.2} below related edge {:.2}",
                candidate.memory.id, candidate.composite, config.gate.related_edge
            ));
            continue;
        }
        let band = if candidate.composite >= threshold {
            if candidate.composite >= config.gate.full_edge {
                SurfaceBand::Full
            } else {
                SurfaceBand::Indicator
            }
        } else {
            SurfaceBand::Related
        };
        surfaced.push(GatedCandidate { candidate, band });
    }

    GateOutcome { surfaced, suppressed }
}

// ---------------------------------------------------------------------------
// Disambiguation and stitching
// ---------------------------------------------------------------------------

fn tie_break(lhs: &GatedCandidate, rhs: &GatedCandidate, requester_department: &str) -> Ordering {
    let lhs_department = !requester_department.is_empty()
        && lhs.candidate.memory.departments.contains(requester_department);
    let rhs_department = !requester_department.is_empty()
        && rhs.candidate.memory.departments.contains(requester_department);
    rhs.candidate
        .composite
        .partial_cmp(&lhs.candidate.composite)
        .unwrap_or(Ordering::Equal)
        .then_with(|| rhs_department.cmp(&lhs_department))
        .then_with(|| {
            rhs.candidate
                .memory
                .authority_score
                .partial_cmp(&lhs.candidate.memory.authority_score)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| {
            rhs.candidate
                .memory
                .usage_stats
                .last_accessed
                .cmp(&lhs.candidate.memory.usage_stats.last_accessed)
        })
        .then_with(|| lhs.candidate.memory.id.cmp(&rhs.candidate.memory.id))
}

#[must_use]
pub fn default_tie_breakers() -> Vec<String> {
    vec![
        "composite_score desc".to_string(),
        "requester_department_match desc".to_string(),
        "authority_score desc".to_string(),
        "last_accessed desc".to_string(),
        "memory_id asc".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SurfacedMemory {
    pub memory_id: MemoryId,
    pub canonical_question: String,
    /// Cleared when the requester's access effect is redact.
    #[serde(default)]
    pub answer: Option<serde_json::Value>,
    pub score: f32,
    pub band: SurfaceBand,
    pub redacted: bool,
}

impl SurfacedMemory {
    fn from_gated(gated: &GatedCandidate) -> Self {
        let redacted = gated.candidate.access == AccessEffect::Redact;
        Self {
            memory_id: gated.candidate.memory.id,
            canonical_question: gated.candidate.memory.canonical_question.clone(),
            answer: if redacted { None } else { Some(gated.candidate.memory.answer.clone()) },
            score: gated.candidate.composite,
            band: gated.band,
            redacted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeMarker {
    pub from: MemoryId,
    pub to: MemoryId,
    pub shared_workflow: String,
}

/// Output of one evaluation; constructed once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SurfacingDecision {
    pub decision_id: String,
    pub should_surface: bool,
    pub memories: Vec<SurfacedMemory>,
    #[serde(default)]
    pub bridges: Vec<BridgeMarker>,
    pub confidence: f32,
    pub method: SurfaceMethod,
    pub context_fingerprint: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub trace: Vec<String>,
}

impl SurfacingDecision {
    /// The fail-closed decision: nothing surfaced, indistinguishable from a
    /// legitimate low-confidence suppression.
    #[must_use]
    pub fn suppressed(
        decision_id: String,
        context_fingerprint: String,
        generated_at: OffsetDateTime,
        reason: &str,
    ) -> Self {
        Self {
            decision_id,
            should_surface: false,
            memories: Vec::new(),
            bridges: Vec::new(),
            confidence: 0.0,
            method: SurfaceMethod::None,
            context_fingerprint,
            generated_at,
            trace: vec![reason.to_string()],
        }
    }
}

fn method_for_band(band: SurfaceBand) -> SurfaceMethod {
    match band {
        SurfaceBand::Full => SurfaceMethod::Inline,
        SurfaceBand::Indicator => SurfaceMethod::Tooltip,
        SurfaceBand::Related => SurfaceMethod::Sidebar,
    }
}

struct StitchResult {
    members: Vec<GatedCandidate>,
    bridges: Vec<BridgeMarker>,
    shared_workflows: BTreeSet<String>,
}

fn workflow_names(memory: &Memory) -> BTreeSet<String> {
    memory.workflows.iter().map(|binding| binding.workflow.clone()).collect()
}

fn departments_overlap(lhs: &Memory, rhs: &Memory) -> bool {
    // Org-wide memories (no department tag) cohere with everything.
    if lhs.departments.is_empty() || rhs.departments.is_empty() {
        return true;
    }
    lhs.departments.intersection(&rhs.departments).next().is_some()
}

fn try_stitch(config: &StitchConfig, ranked: &[GatedCandidate]) -> Option<StitchResult> {
    // Union-find over shared workflow names, small-n so adjacency scan is fine.
    let mut component: Vec<usize> = (0..ranked.len()).collect();
    for lhs in 0..ranked.len() {
        for rhs in (lhs + 1)..ranked.len() {
            let lhs_workflows = workflow_names(&ranked[lhs].candidate.memory);
            let rhs_workflows = workflow_names(&ranked[rhs].candidate.memory);
            if lhs_workflows.intersection(&rhs_workflows).next().is_some() {
                let merged = component[lhs].min(component[rhs]);
                let left_root = component[lhs];
                let right_root = component[rhs];
                for slot in &mut component {
                    if *slot == left_root || *slot == right_root {
                        *slot = merged;
                    }
                }
            }
        }
    }

    // Pick the component containing the best-ranked member with at least two
    // memories; `ranked` is already in deterministic tie-break order.
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (index, root) in component.iter().enumerate() {
        groups.entry(*root).or_default().push(index);
    }
    let selected = ranked
        .iter()
        .enumerate()
        .find_map(|(index, _)| {
            let members = groups.get(&component[index])?;
            (members.len() >= 2).then(|| members.clone())
        })?;

    let mut members: Vec<GatedCandidate> =
        selected.iter().map(|index| ranked[*index].clone()).collect();
    members.truncate(config.max_members);

    let mut shared_workflows: BTreeSet<String> = BTreeSet::new();
    for member in &members {
        shared_workflows.extend(workflow_names(&member.candidate.memory));
    }

    // Order by declared step within the shared workflows, score-descending
    // where no step is declared.
    let step_of = |memory: &Memory| -> u32 {
        memory
            .workflows
            .iter()
            .filter(|binding| shared_workflows.contains(&binding.workflow))
            .filter_map(|binding| binding.step)
            .min()
            .unwrap_or(u32::MAX)
    };
    members.sort_by(|lhs, rhs| {
        step_of(&lhs.candidate.memory)
            .cmp(&step_of(&rhs.candidate.memory))
            .then_with(|| {
                rhs.candidate
                    .composite
                    .partial_cmp(&lhs.candidate.composite)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| lhs.candidate.memory.id.cmp(&rhs.candidate.memory.id))
    });

    // Coherence: at least one pair of members must share a department.
    let coherent = members.iter().enumerate().any(|(lhs, left)| {
        members
            .iter()
            .skip(lhs + 1)
            .any(|right| departments_overlap(&left.candidate.memory, &right.candidate.memory))
    });
    if !coherent {
        return None;
    }

    let mut bridges = Vec::new();
    for pair in members.windows(2) {
        let lhs_workflows = workflow_names(&pair[0].candidate.memory);
        let rhs_workflows = workflow_names(&pair[1].candidate.memory);
        let shared = lhs_workflows
            .intersection(&rhs_workflows)
            .next()
            .cloned()
            .unwrap_or_else(|| "workflow".to_string());
        bridges.push(BridgeMarker {
            from: pair[0].candidate.memory.id,
            to: pair[1].candidate.memory.id,
            shared_workflow: shared,
        });
    }

    Some(StitchResult { members, bridges, shared_workflows })
}

/// Decide what to surface for one evaluated context.
///
/// Deterministic: identical candidates, context, adaptive state, and `as_of`
/// always produce an identical decision.
#[must_use]
pub fn decide(
    config: &EngineConfig,
    context: &Context,
    candidates: &[RetrievedCandidate],
    state: &AdaptiveThresholdState,
    as_of: OffsetDateTime,
    decision_id: String,
    context_fingerprint: String,
) -> SurfacingDecision {
    let mut trace = vec![format!(
        "scored {} candidates (intent={}, platform={})",
        candidates.len(),
        context.signals.intent.class.as_str(),
        context.platform.as_str()
    )];

    let scored: Vec<ScoredCandidate> = candidates
        .iter()
        .map(|candidate| score_candidate(&config.scoring, context, candidate, as_of))
        .collect();

    let outcome = gate_candidates(config, scored, state);
    for reason in &outcome.suppressed {
        trace.push(format!("suppressed {reason}"));
    }
    if outcome.surfaced.is_empty() {
        trace.push("gate cleared no candidates".to_string());
        return SurfacingDecision {
            decision_id,
            should_surface: false,
            memories: Vec::new(),
            bridges: Vec::new(),
            confidence: 0.0,
            method: SurfaceMethod::None,
            context_fingerprint,
            generated_at: as_of,
            trace,
        };
    }

    let mut ranked = outcome.surfaced;
    ranked.sort_by(|lhs, rhs| tie_break(lhs, rhs, &context.user.department));
    trace.push(format!("ranked by [{}]", default_tie_breakers().join(", ")));

    let best_composite = ranked
        .iter()
        .map(|gated| gated.candidate.composite)
        .fold(0.0_f32, f32::max);

    // Multi-step workflow queries without a dominant single answer stitch an
    // ordered chain; everything else goes through disambiguation.
    if let Some(stage) = &context.signals.workflow_stage {
        if best_composite <= config.stitch.single_score_cutoff {
            if let Some(stitch) = try_stitch(&config.stitch, &ranked) {
                let confidence = stitch
                    .members
                    .iter()
                    .map(|member| member.candidate.composite)
                    .fold(1.0_f32, f32::min);
                trace.push(format!(
                    "stitched {} memories across workflows [{}] (trigger \"{}\")",
                    stitch.members.len(),
                    stitch.shared_workflows.iter().cloned().collect::<Vec<_>>().join(", "),
                    stage.stage
                ));
                trace.push("stitch confidence is the weakest member score".to_string());
                return SurfacingDecision {
                    decision_id,
                    should_surface: true,
                    memories: stitch.members.iter().map(SurfacedMemory::from_gated).collect(),
                    bridges: stitch.bridges,
                    confidence,
                    method: SurfaceMethod::Sidebar,
                    context_fingerprint,
                    generated_at: as_of,
                    trace,
                };
            }
            trace.push("no coherent workflow chain; falling back to single memory".to_string());
        }
    }

    let primary: Vec<&GatedCandidate> =
        ranked.iter().filter(|gated| gated.band != SurfaceBand::Related).collect();

    if primary.is_empty() {
        // Only related-band suggestions cleared the gate; never primary.
        let related: Vec<SurfacedMemory> = ranked
            .iter()
            .take(config.stitch.cluster_max)
            .map(SurfacedMemory::from_gated)
            .collect();
        let confidence = related.first().map_or(0.0, |memory| memory.score);
        trace.push(format!("{} related suggestions below the primary threshold", related.len()));
        return SurfacingDecision {
            decision_id,
            should_surface: true,
            memories: related,
            bridges: Vec::new(),
            confidence,
            method: SurfaceMethod::Sidebar,
            context_fingerprint,
            generated_at: as_of,
            trace,
        };
    }

    let top = primary[0];
    let lead_gap = primary
        .get(1)
        .map_or(f32::MAX, |second| top.candidate.composite - second.candidate.composite);

    if primary.len() == 1 || lead_gap >= config.stitch.lead_gap {
        trace.push(format!(
            "single candidate {} leads by {:.2}",
            top.candidate.memory.id,
            if lead_gap == f32::MAX { 0.0 } else { lead_gap }
        ));
        return SurfacingDecision {
            decision_id,
            should_surface: true,
            memories: vec![SurfacedMemory::from_gated(top)],
            bridges: Vec::new(),
            confidence: top.candidate.composite,
            method: method_for_band(top.band),
            context_fingerprint,
            generated_at: as_of,
            trace,
        };
    }

    let cluster: Vec<SurfacedMemory> = primary
        .iter()
        .take(config.stitch.cluster_max)
        .map(|gated| SurfacedMemory::from_gated(gated))
        .collect();
    trace.push(format!(
        "near-tied candidates (gap {:.2} < {:.2}); presenting a choice of {}",
        lead_gap,
        config.stitch.lead_gap,
        cluster.len()
    ));
    SurfacingDecision {
        decision_id,
        should_surface: true,
        memories: cluster,
        bridges: Vec::new(),
        confidence: top.candidate.composite,
        method: SurfaceMethod::Sidebar,
        context_fingerprint,
        generated_at: as_of,
        trace,
    }
}

fn ratio_clamped(numerator: i64, denominator: i64) -> f32 {
    if denominator <= 0 {
        return 1.0;
    }
    if numerator >= denominator {
        return 1.0;
    }
    if numerator <= 0 {
        return 0.0;
    }
    // Scale into u16 range before converting so the cast stays lossless.
    let scaled = numerator.saturating_mul(10_000) / denominator;
    f32::from(u16::try_from(scaled).unwrap_or(u16::MAX)) / 10_000.0
}

fn f32_from_count(count: usize) -> f32 {
    f32::from(u16::try_from(count).unwrap_or(u16::MAX))
}

// ---------------------------------------------------------------------------
// Store seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchFilters {
    pub requester: UserIdentity,
    #[serde(with = "time::serde::rfc3339")]
    pub not_expired_at: OffsetDateTime,
    /// Matches below this similarity must never cross the store seam.
    pub similarity_floor: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackApplied {
    Applied,
    Duplicate,
    UnknownMemory,
}

/// Anonymized record of one decision: fingerprint and outcome, never the raw
/// input or the user identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    pub decision_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub context_fingerprint: String,
    pub platform: Platform,
    pub intent: IntentClass,
    pub decision: SurfacingDecision,
}

/// The collaborator seam for the memory store, identity directory, and
/// feedback state. The engine only ever queries and key-scoped-updates
/// through this interface; it never owns persistence.
pub trait MemoryStore {
    /// Approved, unexpired, access-eligible candidates above the similarity
    /// floor, ordered (similarity desc, id asc), at most `k`.
    ///
    /// # Errors
    /// Returns [`StoreError::Timeout`] when the store misses its deadline, or
    /// [`StoreError::Unavailable`] / [`StoreError::Corrupt`] on failure.
    fn search(
        &self,
        query_embedding: &[f32],
        filters: &SearchFilters,
        k: usize,
    ) -> Result<Vec<RetrievedCandidate>, StoreError>;

    /// # Errors
    /// Returns a [`StoreError`] when the identity directory cannot be read.
    fn resolve_user(&self, user_id: &str) -> Result<Option<UserIdentity>, StoreError>;

    /// Adaptive state for one user/context fingerprint; defaults when absent.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the threshold state cannot be read.
    fn load_threshold_state(&self, key: &str) -> Result<AdaptiveThresholdState, StoreError>;

    /// Deduplicate and fold one feedback event into usage stats and the
    /// submitter's adaptive threshold state.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the update cannot be applied.
    fn apply_feedback(
        &self,
        event: &FeedbackEvent,
        config: &FeedbackConfig,
    ) -> Result<FeedbackApplied, StoreError>;

    /// # Errors
    /// Returns a [`StoreError`] when the decision log cannot be written.
    fn save_decision(&self, record: &DecisionRecord) -> Result<(), StoreError>;

    /// # Errors
    /// Returns a [`StoreError`] when the decision log cannot be read.
    fn get_decision(&self, decision_id: &str) -> Result<Option<DecisionRecord>, StoreError>;
}
