use criterion::{criterion_group, criterion_main, Criterion};
use surfacer_core::{
    decide, embed_text, extract_context, AccessRule, AdaptiveThresholdState, Clearance,
    EngineConfig, Expiration, InteractionEvent, Memory, MemoryId, MemoryStatus, RetrievedCandidate,
    UsageStats, UserIdentity, WorkflowBinding,
};
use time::{Duration, OffsetDateTime};

fn bench_time() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
}

fn mk_candidate(index: usize) -> RetrievedCandidate {
    let question = format!("How do I complete procurement step {index}?");
    let departments = if index % 3 == 0 { vec!["it".to_string()] } else { Vec::new() };
    let workflows = if index % 2 == 0 {
        vec![WorkflowBinding {
            workflow: "procurement".to_string(),
            step: u32::try_from(index / 2 + 1).ok(),
        }]
    } else {
        Vec::new()
    };
    RetrievedCandidate {
        memory: Memory {
            id: MemoryId::new(),
            canonical_question: question.clone(),
            semantic_variants: Vec::new(),
            answer: serde_json::json!({ "markdown": question }),
            embedding: embed_text(&question, 256),
            departments: departments.into_iter().collect(),
            tags: ["information_seeking".to_string()].into_iter().collect(),
            workflows,
            access_rule: AccessRule::min_clearance(Clearance::Public),
            expiration: Expiration::At { at: bench_time() + Duration::days(365) },
            authority_score: 0.8,
            usage_stats: UsageStats::default(),
            status: MemoryStatus::Approved,
            created_at: bench_time() - Duration::days(30),
            updated_at: bench_time() - Duration::days(30),
        },
        similarity: 0.5 + 0.4 * (1.0 / (1.0 + f64::from(u32::try_from(index).unwrap_or(0)))) as f32,
    }
}

fn bench_decide(criterion: &mut Criterion) {
    let config = EngineConfig::default();
    let event = InteractionEvent {
        source: Some("slack".to_string()),
        raw_input: "How do I get budget approval for procurement?".to_string(),
        user_id: "u_bench".to_string(),
    };
    let user = UserIdentity {
        id: "u_bench".to_string(),
        role: "analyst".to_string(),
        department: "it".to_string(),
        clearance: Clearance::Internal,
    };
    let context = match extract_context(&config, &event, user) {
        Ok(context) => context,
        Err(err) => panic!("bench context should extract: {err}"),
    };
    let candidates: Vec<RetrievedCandidate> = (0..200).map(mk_candidate).collect();
    let state = AdaptiveThresholdState::new("u_bench");

    criterion.bench_function("decide_200_candidates", |bencher| {
        bencher.iter(|| {
            decide(
                &config,
                &context,
                &candidates,
                &state,
                bench_time(),
                "dcn_bench".to_string(),
                "ctx_bench".to_string(),
            )
        });
    });
}

criterion_group!(benches, bench_decide);
criterion_main!(benches);
