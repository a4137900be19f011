use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use concierge_core::domain::message::Message;
use concierge_core::domain::session::{AgentKind, ExpiryPolicy, PendingAction, SessionState};
use concierge_core::domain::turn::{CarryState, PendingRelease, RoutingDecision, RoutingReason};
use concierge_core::ontology::{
    EntityMatch, MatchStrength, OntologyFact, OntologyIndex, PolicyKind,
};
use concierge_core::scheduler::ContinuationPayload;
use concierge_core::text::{compact, contains_any};

/// Weight of each explicit keyword hit. Lower than any ontology match so a named product or
/// policy outranks a couple of generic words.
pub const KEYWORD_WEIGHT: u32 = 25;

const PRODUCT_KEYWORDS: &[&str] = &[
    "가격", "얼마", "재고", "색상", "색깔", "컬러", "사이즈", "치수", "옵션", "품절", "상품", "제품",
    "입고", "price", "stock", "size", "color",
];
const DELIVERY_KEYWORDS: &[&str] = &[
    "배송", "택배", "배달", "도착", "출고", "운송장", "송장", "언제와", "언제오", "delivery",
    "shipping", "tracking",
];
const GENERAL_KEYWORDS: &[&str] = &[
    "안녕", "환불", "교환", "반품", "상담원", "상담사", "감사", "고맙", "refund", "exchange", "hello",
];

fn keywords_for(kind: AgentKind) -> &'static [&'static str] {
    match kind {
        AgentKind::Product => PRODUCT_KEYWORDS,
        AgentKind::Delivery => DELIVERY_KEYWORDS,
        AgentKind::General => GENERAL_KEYWORDS,
    }
}

/// Which agent answers for an ontology node.
pub fn agent_for_fact(fact: &OntologyFact<'_>) -> AgentKind {
    match fact {
        OntologyFact::Product(_) | OntologyFact::Category(_) => AgentKind::Product,
        OntologyFact::Policy(policy) if policy.kind == PolicyKind::Delivery => AgentKind::Delivery,
        OntologyFact::Policy(_) => AgentKind::General,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContinuationRouting {
    Resume(RoutingDecision),
    /// Nothing is waiting for this continuation any more. Firing it is a no-op.
    Stale { reason: &'static str },
}

/// Deterministic intent router over `(message, session state)`.
///
/// Never fails and never writes: pending-action releases are reported on the decision and applied
/// by the caller together with the agent's mutation.
#[derive(Clone, Debug, Default)]
pub struct Router {
    expiry: ExpiryPolicy,
}

impl Router {
    pub fn new(expiry: ExpiryPolicy) -> Self {
        Self { expiry }
    }

    pub fn route(
        &self,
        message: &Message,
        state: &SessionState,
        ontology: &OntologyIndex,
        now: DateTime<Utc>,
    ) -> RoutingDecision {
        let Some(pending) = &state.pending_action else {
            return self.classify(&message.text, ontology, state.current_agent);
        };

        if pending.is_handoff() {
            let mut decision = RoutingDecision::new(AgentKind::General, RoutingReason::HandoffHold);
            decision.carry.pending = Some(pending.clone());
            return decision;
        }

        let mut fresh = self.classify(&message.text, ontology, state.current_agent);
        if pending.is_expired(state.next_turn(), now, &self.expiry) {
            fresh.release = Some(PendingRelease::Expired);
            return fresh;
        }

        let pending_agent = pending.agent();
        let diverges = fresh.scores.iter().any(|(kind, score)| *kind != pending_agent && *score > 0);
        if diverges {
            fresh.release = Some(PendingRelease::Superseded);
            return fresh;
        }

        let mut decision = RoutingDecision::new(pending_agent, RoutingReason::ContinuationResume);
        decision.carry = CarryState { pending: Some(pending.clone()), ..fresh.carry };
        decision.scores = fresh.scores;
        decision
    }

    /// Fresh classification ignoring any pending action.
    ///
    /// An exact product name settles the target on its own; keyword and policy scores only
    /// decide messages that do not name a product.
    pub fn classify(
        &self,
        text: &str,
        ontology: &OntologyIndex,
        prior: Option<AgentKind>,
    ) -> RoutingDecision {
        let matches = ontology.match_entities(text);
        let compacted = compact(text);

        let mut scores: BTreeMap<AgentKind, u32> =
            AgentKind::ALL.iter().map(|kind| (*kind, 0)).collect();
        for entity in &matches {
            *scores.entry(agent_for_fact(&entity.fact)).or_default() += entity.strength.weight();
        }

        let mut keyword_hits: BTreeMap<AgentKind, Vec<String>> = BTreeMap::new();
        for kind in AgentKind::ALL {
            let hits = contains_any(&compacted, keywords_for(kind));
            if hits.is_empty() {
                continue;
            }
            let weight = KEYWORD_WEIGHT.saturating_mul(u32::try_from(hits.len()).unwrap_or(u32::MAX));
            *scores.entry(kind).or_default() += weight;
            keyword_hits.insert(kind, hits.into_iter().map(str::to_owned).collect());
        }

        if let Some(entity) = exact_product(&matches) {
            let reason =
                RoutingReason::OntologyMatch { term: entity.term.clone(), strength: entity.strength };
            let mut decision = RoutingDecision::new(AgentKind::Product, reason);
            decision.carry = carry_for(&matches, AgentKind::Product);
            decision.scores = scores;
            return decision;
        }

        let top = scores.values().copied().max().unwrap_or(0);
        if top == 0 {
            let mut decision = RoutingDecision::new(AgentKind::General, RoutingReason::Fallback);
            decision.scores = scores;
            return decision;
        }

        let tied: Vec<AgentKind> =
            scores.iter().filter(|(_, score)| **score == top).map(|(kind, _)| *kind).collect();
        let (target, reason) = match tied.as_slice() {
            [single] => {
                let reason = match strongest_for(&matches, *single) {
                    Some(entity) => RoutingReason::OntologyMatch {
                        term: entity.term.clone(),
                        strength: entity.strength,
                    },
                    None => RoutingReason::ExplicitKeyword {
                        keywords: keyword_hits.remove(single).unwrap_or_default(),
                    },
                };
                (*single, reason)
            }
            _ => {
                let target = prior.filter(|kind| tied.contains(kind)).unwrap_or(AgentKind::General);
                (target, RoutingReason::Stickiness { tied: tied.clone() })
            }
        };

        let mut decision = RoutingDecision::new(target, reason);
        decision.carry = carry_for(&matches, target);
        decision.scores = scores;
        decision
    }

    /// Resumes only when the session still waits on exactly this continuation.
    pub fn route_continuation(
        &self,
        payload: &ContinuationPayload,
        state: &SessionState,
    ) -> ContinuationRouting {
        if let ContinuationPayload::FlushBatch { .. } = payload {
            return ContinuationRouting::Stale { reason: "not_a_status_check" };
        }
        match &state.pending_action {
            Some(pending @ PendingAction::StatusCheck { continuation_id, .. })
                if continuation_id == payload.continuation_id() =>
            {
                let mut decision =
                    RoutingDecision::new(pending.agent(), RoutingReason::ContinuationResume);
                decision.carry.pending = Some(pending.clone());
                decision.carry.continuation = Some(payload.clone());
                ContinuationRouting::Resume(decision)
            }
            Some(PendingAction::StatusCheck { .. }) => {
                ContinuationRouting::Stale { reason: "continuation_superseded" }
            }
            Some(_) => ContinuationRouting::Stale { reason: "different_pending_action" },
            None => ContinuationRouting::Stale { reason: "nothing_pending" },
        }
    }
}

fn exact_product<'m, 'a>(matches: &'m [EntityMatch<'a>]) -> Option<&'m EntityMatch<'a>> {
    matches.iter().find(|entity| {
        entity.strength == MatchStrength::Exact && matches!(entity.fact, OntologyFact::Product(_))
    })
}

fn strongest_for<'m, 'a>(
    matches: &'m [EntityMatch<'a>],
    kind: AgentKind,
) -> Option<&'m EntityMatch<'a>> {
    matches.iter().find(|entity| agent_for_fact(&entity.fact) == kind)
}

fn carry_for(matches: &[EntityMatch<'_>], target: AgentKind) -> CarryState {
    let product_id = matches.iter().find_map(|entity| match entity.fact {
        OntologyFact::Product(product) => Some(product.id.clone()),
        _ => None,
    });
    let policy_id = matches.iter().find_map(|entity| match entity.fact {
        OntologyFact::Policy(policy) if agent_for_fact(&entity.fact) == target => {
            Some(policy.id.clone())
        }
        _ => None,
    });
    CarryState { product_id, policy_id, ..CarryState::default() }
}
