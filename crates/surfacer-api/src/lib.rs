use std::path::PathBuf;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use surfacer_core::{
    decide, embed_text, extract_context, Context, DecisionRecord, EngineConfig, EngineError,
    FeedbackApplied, FeedbackEvent, FeedbackOutcome, InteractionEvent, MemoryId, MemoryStore,
    RetrievedCandidate, SearchFilters, StoreError, SurfacingDecision, UserIdentity,
};
use surfacer_store_sqlite::SqliteMemoryStore;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvaluateRequest {
    /// Platform metadata from the originating surface (slack, email, ...).
    #[serde(default)]
    pub source: Option<String>,
    pub raw_input: String,
    pub user_id: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackRequest {
    pub memory_id: MemoryId,
    pub context_fingerprint: String,
    pub outcome: FeedbackOutcome,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    Applied,
    Duplicate,
    Dropped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedbackAck {
    pub memory_id: MemoryId,
    pub status: FeedbackStatus,
}

/// Orchestrates one evaluation or feedback call over the store seam. The
/// engine holds no mutable state of its own; everything flows through the
/// request and the store.
#[derive(Debug, Clone)]
pub struct SurfacingApi<S> {
    store: S,
    config: EngineConfig,
}

impl SurfacingApi<SqliteMemoryStore> {
    /// Engine backed by the bundled SQLite store.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid.
    pub fn sqlite(db_path: PathBuf, config: EngineConfig) -> Result<Self> {
        let store = SqliteMemoryStore::new(db_path).with_timeout_ms(config.retrieval.timeout_ms);
        Self::new(store, config)
    }
}

impl<S: MemoryStore> SurfacingApi<S> {
    /// # Errors
    /// Returns an error when the configuration is invalid.
    pub fn new(store: S, config: EngineConfig) -> Result<Self> {
        config.validate().context("engine configuration rejected")?;
        Ok(Self { store, config })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Evaluate one interaction and decide what, if anything, to surface.
    ///
    /// Store failures and absent platform metadata fail closed: the caller
    /// sees an ordinary suppression, never an error it could distinguish
    /// from low confidence.
    ///
    /// # Errors
    /// Returns an error only for defects in the engine itself, never for
    /// degraded inputs or collaborator failures.
    pub fn evaluate(&self, request: EvaluateRequest) -> Result<SurfacingDecision> {
        let as_of = request.as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let event = InteractionEvent {
            source: request.source,
            raw_input: request.raw_input,
            user_id: request.user_id,
        };

        let identity = match self.store.resolve_user(&event.user_id) {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                tracing::warn!(user_id = %event.user_id, "unknown user; degrading to least privilege");
                UserIdentity::least_privileged(&event.user_id)
            }
            Err(err) => {
                tracing::warn!(error = %err, "identity lookup failed; suppressing");
                return Ok(SurfacingDecision::suppressed(
                    fallback_decision_id(as_of),
                    String::new(),
                    as_of,
                    "identity directory unavailable",
                ));
            }
        };

        let context = match extract_context(&self.config, &event, identity) {
            Ok(context) => context,
            Err(EngineError::UnknownPlatform) => {
                tracing::warn!(user_id = %event.user_id, "event carries no platform metadata; suppressing");
                return Ok(SurfacingDecision::suppressed(
                    fallback_decision_id(as_of),
                    String::new(),
                    as_of,
                    "platform metadata absent",
                ));
            }
            Err(err) => return Err(err).context("context extraction failed"),
        };

        let fingerprint = context_fingerprint(&context);
        let query_embedding = embed_text(&context.raw_input, self.config.retrieval.embedding_dim);
        let filters = SearchFilters {
            requester: context.user.clone(),
            not_expired_at: as_of,
            similarity_floor: self.config.retrieval.similarity_floor,
        };

        let candidates = match self.store.search(
            &query_embedding,
            &filters,
            self.config.retrieval.default_k,
        ) {
            Ok(candidates) => candidates,
            Err(StoreError::Timeout) => {
                tracing::warn!("memory store timed out; suppressing");
                return Ok(SurfacingDecision::suppressed(
                    fallback_decision_id(as_of),
                    fingerprint,
                    as_of,
                    "retrieval deadline exceeded",
                ));
            }
            Err(err) => {
                tracing::warn!(error = %err, "memory store failed; suppressing");
                return Ok(SurfacingDecision::suppressed(
                    fallback_decision_id(as_of),
                    fingerprint,
                    as_of,
                    "memory store unavailable",
                ));
            }
        };

        // The store contract never hands the scorer a sub-floor candidate.
        let floor = self.config.retrieval.similarity_floor;
        debug_assert!(
            candidates.iter().all(|candidate| candidate.similarity >= floor),
            "store returned a candidate below the similarity floor"
        );
        if candidates.iter().any(|candidate| candidate.similarity < floor) {
            tracing::error!("store returned candidates below the similarity floor");
        }

        let state = match self.store.load_threshold_state(&fingerprint) {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(error = %err, "threshold state unavailable; using defaults");
                surfacer_core::AdaptiveThresholdState::new(&fingerprint)
            }
        };

        let decision_id = make_decision_id(&fingerprint, as_of, &candidates);
        let decision = decide(
            &self.config,
            &context,
            &candidates,
            &state,
            as_of,
            decision_id,
            fingerprint,
        );

        let record = DecisionRecord {
            decision_id: decision.decision_id.clone(),
            generated_at: as_of,
            context_fingerprint: decision.context_fingerprint.clone(),
            platform: context.platform,
            intent: context.signals.intent.class,
            decision: decision.clone(),
        };
        if let Err(err) = self.store.save_decision(&record) {
            tracing::warn!(error = %err, decision_id = %record.decision_id, "decision log write failed");
        }

        Ok(decision)
    }

    /// Fold one feedback event into the aggregates. Best-effort by contract:
    /// duplicates and unknown memories are acknowledged as dropped, never
    /// surfaced as failures.
    ///
    /// # Errors
    /// Returns an error when the store cannot apply a valid event at all.
    pub fn ingest_feedback(&self, request: FeedbackRequest) -> Result<FeedbackAck> {
        let occurred_at = request.occurred_at.unwrap_or_else(OffsetDateTime::now_utc);
        if request.context_fingerprint.trim().is_empty() {
            tracing::warn!(memory_id = %request.memory_id, "feedback without context fingerprint dropped");
            return Ok(FeedbackAck { memory_id: request.memory_id, status: FeedbackStatus::Dropped });
        }

        let event = FeedbackEvent {
            memory_id: request.memory_id,
            context_fingerprint: request.context_fingerprint,
            outcome: request.outcome,
            occurred_at,
        };

        let applied = self
            .store
            .apply_feedback(&event, &self.config.feedback)
            .context("feedback aggregation failed")?;
        let status = match applied {
            FeedbackApplied::Applied => FeedbackStatus::Applied,
            FeedbackApplied::Duplicate => {
                tracing::warn!(memory_id = %event.memory_id, "duplicate feedback event dropped");
                FeedbackStatus::Duplicate
            }
            FeedbackApplied::UnknownMemory => {
                tracing::warn!(memory_id = %event.memory_id, "feedback for unknown memory dropped");
                FeedbackStatus::Dropped
            }
        };
        Ok(FeedbackAck { memory_id: event.memory_id, status })
    }

    /// Fetch one previously recorded decision.
    ///
    /// # Errors
    /// Returns an error when the decision log cannot be read.
    pub fn decision(&self, decision_id: &str) -> Result<Option<DecisionRecord>> {
        self.store.get_decision(decision_id).context("decision lookup failed")
    }
}

/// Anonymized fingerprint of the decision context: platform, intent, and the
/// requester's role/department/clearance. Never the raw input or user id.
#[must_use]
pub fn context_fingerprint(context: &Context) -> String {
    let mut hasher = Sha256::new();
    hasher.update(context.platform.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(context.signals.intent.class.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(context.user.role.as_bytes());
    hasher.update(b"|");
    hasher.update(context.user.department.as_bytes());
    hasher.update(b"|");
    hasher.update(context.user.clearance.as_str().as_bytes());
    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("ctx_{}", &digest_hex[..16])
}

fn make_decision_id(
    fingerprint: &str,
    as_of: OffsetDateTime,
    candidates: &[RetrievedCandidate],
) -> String {
    let as_of_text = as_of
        .format(&Rfc3339)
        .unwrap_or_else(|_| as_of.unix_timestamp().to_string());
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update(as_of_text.as_bytes());
    let mut candidate_ids = candidates
        .iter()
        .map(|candidate| candidate.memory.id.to_string())
        .collect::<Vec<_>>();
    candidate_ids.sort_unstable();
    for id in candidate_ids {
        hasher.update(id.as_bytes());
    }
    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("dcn_{as_of_text}_{}", &digest_hex[..16])
}

/// Decision id for suppressions that never reached retrieval (absent
/// metadata, collaborator failure, missed deadline).
#[must_use]
pub fn fallback_decision_id(as_of: OffsetDateTime) -> String {
    make_decision_id("ctx_unresolved", as_of, &[])
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use surfacer_core::{
        embed_memory_text, AccessRule, AdaptiveThresholdState, Clearance, Expiration, Memory,
        MemoryStatus, UsageStats,
    };
    use time::Duration;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    #[derive(Default)]
    struct StubState {
        identities: BTreeMap<String, UserIdentity>,
        memories: Vec<Memory>,
        feedback: Vec<FeedbackEvent>,
        decisions: BTreeMap<String, DecisionRecord>,
    }

    /// In-memory stand-in for the store seam; `fail_search` simulates the
    /// collaborator timing out.
    struct StubStore {
        state: Mutex<StubState>,
        fail_search: bool,
    }

    impl StubStore {
        fn lock(&self) -> std::sync::MutexGuard<'_, StubState> {
            match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            }
        }
    }

    impl MemoryStore for StubStore {
        fn search(
            &self,
            query_embedding: &[f32],
            filters: &SearchFilters,
            k: usize,
        ) -> Result<Vec<RetrievedCandidate>, StoreError> {
            if self.fail_search {
                return Err(StoreError::Timeout);
            }
            let state = self.lock();
            let mut candidates: Vec<RetrievedCandidate> = state
                .memories
                .iter()
                .filter(|memory| memory.status == MemoryStatus::Approved)
                .filter(|memory| !memory.expiration.is_expired(filters.not_expired_at))
                .filter(|memory| {
                    memory.access_rule.evaluate(&filters.requester)
                        != surfacer_core::AccessEffect::Deny
                })
                .map(|memory| RetrievedCandidate {
                    memory: memory.clone(),
                    similarity: surfacer_core::cosine_similarity(
                        query_embedding,
                        &memory.embedding,
                    ),
                })
                .filter(|candidate| candidate.similarity >= filters.similarity_floor)
                .collect();
            candidates.sort_by(|lhs, rhs| {
                rhs.similarity
                    .partial_cmp(&lhs.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| lhs.memory.id.cmp(&rhs.memory.id))
            });
            candidates.truncate(k);
            Ok(candidates)
        }

        fn resolve_user(&self, user_id: &str) -> Result<Option<UserIdentity>, StoreError> {
            Ok(self.lock().identities.get(user_id).cloned())
        }

        fn load_threshold_state(&self, key: &str) -> Result<AdaptiveThresholdState, StoreError> {
            Ok(AdaptiveThresholdState::new(key))
        }

        fn apply_feedback(
            &self,
            event: &FeedbackEvent,
            _config: &surfacer_core::FeedbackConfig,
        ) -> Result<FeedbackApplied, StoreError> {
            let mut state = self.lock();
            if !state.memories.iter().any(|memory| memory.id == event.memory_id) {
                return Ok(FeedbackApplied::UnknownMemory);
            }
            if state.feedback.contains(event) {
                return Ok(FeedbackApplied::Duplicate);
            }
            state.feedback.push(event.clone());
            Ok(FeedbackApplied::Applied)
        }

        fn save_decision(&self, record: &DecisionRecord) -> Result<(), StoreError> {
            self.lock().decisions.insert(record.decision_id.clone(), record.clone());
            Ok(())
        }

        fn get_decision(&self, decision_id: &str) -> Result<Option<DecisionRecord>, StoreError> {
            Ok(self.lock().decisions.get(decision_id).cloned())
        }
    }

    fn mk_memory(question: &str, min_clearance: Clearance) -> Memory {
        Memory {
            id: MemoryId::new(),
            canonical_question: question.to_string(),
            semantic_variants: Vec::new(),
            answer: serde_json::json!({ "markdown": format!("answer: {question}") }),
            embedding: embed_memory_text(question, &[], 256),
            departments: ["it".to_string()].into_iter().collect(),
            tags: ["information_seeking".to_string()].into_iter().collect(),
            workflows: Vec::new(),
            access_rule: AccessRule::min_clearance(min_clearance),
            expiration: Expiration::At { at: fixture_time() + Duration::days(365) },
            authority_score: 0.8,
            usage_stats: UsageStats::default(),
            status: MemoryStatus::Approved,
            created_at: fixture_time() - Duration::days(10),
            updated_at: fixture_time() - Duration::days(10),
        }
    }

    fn analyst() -> UserIdentity {
        UserIdentity {
            id: "u_1".to_string(),
            role: "analyst".to_string(),
            department: "it".to_string(),
            clearance: Clearance::Internal,
        }
    }

    fn api_with(state: StubState, fail_search: bool) -> SurfacingApi<StubStore> {
        let store = StubStore { state: Mutex::new(state), fail_search };
        match SurfacingApi::new(store, EngineConfig::default()) {
            Ok(api) => api,
            Err(err) => panic!("api should build: {err}"),
        }
    }

    fn evaluate_request(raw_input: &str) -> EvaluateRequest {
        EvaluateRequest {
            source: Some("slack".to_string()),
            raw_input: raw_input.to_string(),
            user_id: "u_1".to_string(),
            as_of: Some(fixture_time()),
        }
    }

    // Test IDs: TAPI-001
    #[test]
    fn evaluate_surfaces_a_matching_memory_and_records_the_decision() {
        let memory = mk_memory("How do I get budget approval?", Clearance::Internal);
        let memory_id = memory.id;
        let mut state = StubState::default();
        state.identities.insert("u_1".to_string(), analyst());
        state.memories.push(memory);
        let api = api_with(state, false);

        let decision = match api.evaluate(evaluate_request("How do I get budget approval?")) {
            Ok(decision) => decision,
            Err(err) => panic!("evaluate should succeed: {err}"),
        };
        assert!(decision.should_surface);
        assert_eq!(decision.memories.len(), 1);
        assert_eq!(decision.memories[0].memory_id, memory_id);
        assert!(decision.context_fingerprint.starts_with("ctx_"));

        let record = match api.decision(&decision.decision_id) {
            Ok(Some(record)) => record,
            Ok(None) => panic!("decision should be recorded"),
            Err(err) => panic!("decision lookup should succeed: {err}"),
        };
        assert_eq!(record.decision, decision);
    }

    // Test IDs: TAPI-002
    #[test]
    fn retrieval_timeout_fails_closed_without_an_error() {
        let mut state = StubState::default();
        state.identities.insert("u_1".to_string(), analyst());
        state.memories.push(mk_memory("How do I get budget approval?", Clearance::Internal));
        let api = api_with(state, true);

        let decision = match api.evaluate(evaluate_request("How do I get budget approval?")) {
            Ok(decision) => decision,
            Err(err) => panic!("timeout must not propagate: {err}"),
        };
        assert!(!decision.should_surface);
        assert!(decision.memories.is_empty());
        assert_eq!(decision.method, surfacer_core::SurfaceMethod::None);
    }

    // Test IDs: TAPI-003
    #[test]
    fn unknown_user_degrades_to_public_clearance() {
        let mut state = StubState::default();
        // No identity registered for u_1; the memory needs internal clearance.
        state.memories.push(mk_memory("How do I get budget approval?", Clearance::Internal));
        let api = api_with(state, false);

        let decision = match api.evaluate(evaluate_request("How do I get budget approval?")) {
            Ok(decision) => decision,
            Err(err) => panic!("unknown user must not propagate: {err}"),
        };
        assert!(!decision.should_surface);
    }

    // Test IDs: TAPI-004
    #[test]
    fn missing_platform_metadata_fails_closed() {
        let mut state = StubState::default();
        state.identities.insert("u_1".to_string(), analyst());
        state.memories.push(mk_memory("How do I get budget approval?", Clearance::Internal));
        let api = api_with(state, false);

        let request = EvaluateRequest { source: None, ..evaluate_request("How do I get budget approval?") };
        let decision = match api.evaluate(request) {
            Ok(decision) => decision,
            Err(err) => panic!("absent metadata must not propagate: {err}"),
        };
        assert!(!decision.should_surface);
    }

    // Test IDs: TAPI-005
    #[test]
    fn evaluate_is_deterministic_for_a_fixed_as_of() {
        let mut state = StubState::default();
        state.identities.insert("u_1".to_string(), analyst());
        state.memories.push(mk_memory("How do I get budget approval?", Clearance::Internal));
        state.memories.push(mk_memory("How do I get expense approval?", Clearance::Internal));
        let api = api_with(state, false);

        let lhs = match api.evaluate(evaluate_request("How do I get budget approval?")) {
            Ok(decision) => decision,
            Err(err) => panic!("evaluate should succeed: {err}"),
        };
        let rhs = match api.evaluate(evaluate_request("How do I get budget approval?")) {
            Ok(decision) => decision,
            Err(err) => panic!("evaluate should succeed: {err}"),
        };
        assert_eq!(lhs, rhs);
    }

    // Test IDs: TAPI-006
    #[test]
    fn feedback_acks_reflect_duplicate_and_unknown_memory() {
        let memory = mk_memory("How do I get budget approval?", Clearance::Internal);
        let memory_id = memory.id;
        let mut state = StubState::default();
        state.identities.insert("u_1".to_string(), analyst());
        state.memories.push(memory);
        let api = api_with(state, false);

        let request = FeedbackRequest {
            memory_id,
            context_fingerprint: "ctx_abc".to_string(),
            outcome: FeedbackOutcome::Accepted,
            occurred_at: Some(fixture_time()),
        };
        let first = match api.ingest_feedback(request.clone()) {
            Ok(ack) => ack,
            Err(err) => panic!("feedback should apply: {err}"),
        };
        assert_eq!(first.status, FeedbackStatus::Applied);

        let second = match api.ingest_feedback(request) {
            Ok(ack) => ack,
            Err(err) => panic!("duplicate feedback should ack: {err}"),
        };
        assert_eq!(second.status, FeedbackStatus::Duplicate);

        let unknown = FeedbackRequest {
            memory_id: MemoryId::new(),
            context_fingerprint: "ctx_abc".to_string(),
            outcome: FeedbackOutcome::Accepted,
            occurred_at: Some(fixture_time()),
        };
        let third = match api.ingest_feedback(unknown) {
            Ok(ack) => ack,
            Err(err) => panic!("unknown memory feedback should ack: {err}"),
        };
        assert_eq!(third.status, FeedbackStatus::Dropped);
    }

    // Test IDs: TAPI-007
    #[test]
    fn fingerprint_omits_raw_input_and_user_id() {
        let config = EngineConfig::default();
        let event_a = InteractionEvent {
            source: Some("slack".to_string()),
            raw_input: "How do I get budget approval?".to_string(),
            user_id: "u_1".to_string(),
        };
        let event_b = InteractionEvent {
            source: Some("slack".to_string()),
            raw_input: "How do I get spending approval?".to_string(),
            user_id: "u_2".to_string(),
        };
        let context_a = match extract_context(&config, &event_a, analyst()) {
            Ok(context) => context,
            Err(err) => panic!("context should extract: {err}"),
        };
        let mut identity_b = analyst();
        identity_b.id = "u_2".to_string();
        let context_b = match extract_context(&config, &event_b, identity_b) {
            Ok(context) => context,
            Err(err) => panic!("context should extract: {err}"),
        };
        // Same platform, intent class, role, department, clearance: the
        // fingerprint deliberately cannot tell these two interactions apart.
        assert_eq!(context_fingerprint(&context_a), context_fingerprint(&context_b));
    }
}
