use concierge_core::domain::session::{AgentKind, ContinuationId, PendingAction};
use concierge_core::domain::turn::{AgentResult, ScheduledContinuation, StateMutation};
use concierge_core::ontology::{OntologyFact, PolicyFact, PolicyKind};
use concierge_core::scheduler::ContinuationPayload;
use concierge_core::text::{compact, contains_any};

use super::{Agent, AgentError, TurnContext, TurnInput};

pub const ORDER_REF_SLOT: &str = "order_ref";
pub const LAST_STATUS_SLOT: &str = "last_delivery_status";

const STATUS_LOOKUP: &[&str] = &[
    "배송조회", "배송상태", "주문조회", "어디쯤", "언제와", "언제오", "언제도착", "운송장", "송장",
    "tracking",
];
const MIN_ORDER_REF_DIGITS: usize = 6;

const DEFAULT_TRANSIT: &str = "현재 배송 중이며, 출고 후 1~3일 이내 도착 예정입니다.";
const STILL_CHECKING: &str =
    "아직 배송 상태를 확인하고 있습니다. 확인되는 대로 바로 안내드리겠습니다. 잠시만 기다려주세요.";
const GENERIC_DELIVERY: &str =
    "주문번호를 알려주시면 배송 상태를 확인해드리겠습니다. 배송비와 배송 기간도 안내해드릴 수 있어요.";

/// Delivery policy answers and asynchronous status lookups.
///
/// A status lookup replies immediately with an interim message, opens a `StatusCheck` and asks the
/// runtime to schedule a continuation. The fired continuation comes back here as
/// [`TurnInput::Continuation`] and closes the check.
#[derive(Clone, Debug, Default)]
pub struct DeliveryAgent;

impl Agent for DeliveryAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Delivery
    }

    fn handle(&self, ctx: &TurnContext<'_>) -> Result<AgentResult, AgentError> {
        if let TurnInput::Continuation(payload) = ctx.input {
            return complete_status_check(payload);
        }
        if ctx.decision.carry.continuation.is_some() {
            return Err(AgentError::MissingContext {
                agent: AgentKind::Delivery,
                missing: "continuation input",
            });
        }

        if let Some(PendingAction::StatusCheck { .. }) = &ctx.decision.carry.pending {
            return Ok(AgentResult::reply(STILL_CHECKING));
        }

        let text = ctx.text();
        let order_ref = order_reference(text);
        if order_ref.is_some() || !contains_any(&compact(text), STATUS_LOOKUP).is_empty() {
            return Ok(start_status_check(ctx, order_ref));
        }

        let reply = delivery_policy(ctx)
            .map(|policy| policy.text.clone())
            .unwrap_or_else(|| GENERIC_DELIVERY.to_owned());
        Ok(AgentResult::reply(reply))
    }
}

fn start_status_check(ctx: &TurnContext<'_>, order_ref: Option<String>) -> AgentResult {
    let continuation_id = ContinuationId::generate();
    let reply = match &order_ref {
        Some(order_ref) => format!(
            "주문번호 {order_ref}의 배송 상태를 확인하고 있습니다. 확인되는 대로 바로 안내드리겠습니다."
        ),
        None => "배송 상태를 확인하고 있습니다. 확인되는 대로 바로 안내드리겠습니다.".to_owned(),
    };

    let mut mutation = StateMutation::open(PendingAction::StatusCheck {
        continuation_id: continuation_id.clone(),
        order_ref: order_ref.clone(),
        requested_at: ctx.now,
    });
    if let Some(order_ref) = &order_ref {
        mutation = mutation.with_slot(ORDER_REF_SLOT, order_ref.clone());
    }

    AgentResult::reply(reply).with_mutation(mutation).with_continuation(ScheduledContinuation {
        delay: ctx.settings.status_check_delay,
        payload: ContinuationPayload::DeliveryStatus { continuation_id, order_ref, status: None },
    })
}

fn complete_status_check(payload: &ContinuationPayload) -> Result<AgentResult, AgentError> {
    let ContinuationPayload::DeliveryStatus { order_ref, status, .. } = payload else {
        return Err(AgentError::MissingContext {
            agent: AgentKind::Delivery,
            missing: "delivery status payload",
        });
    };
    let status = status.as_deref().map(str::trim).filter(|status| !status.is_empty());
    let subject = match order_ref {
        Some(order_ref) => format!("주문번호 {order_ref} 상품은"),
        None => "주문하신 상품은".to_owned(),
    };
    let reply = match status {
        Some(status) => format!("{subject} 현재 '{status}' 상태입니다."),
        None => format!("{subject} {DEFAULT_TRANSIT}"),
    };
    let mutation =
        StateMutation::resolve().with_slot(LAST_STATUS_SLOT, status.unwrap_or("in_transit"));
    Ok(AgentResult::reply(reply).with_mutation(mutation))
}

/// Policy the router carried, else the strongest delivery policy mentioned.
fn delivery_policy<'a>(ctx: &TurnContext<'a>) -> Option<&'a PolicyFact> {
    let ontology = ctx.ontology;
    if let Some(policy) =
        ctx.decision.carry.policy_id.as_deref().and_then(|id| ontology.find_policy(id).ok())
    {
        if policy.kind == PolicyKind::Delivery {
            return Some(policy);
        }
    }
    ontology.match_entities(ctx.text()).into_iter().find_map(|entity| match entity.fact {
        OntologyFact::Policy(policy) if policy.kind == PolicyKind::Delivery => Some(policy),
        _ => None,
    })
}

/// A whitespace-delimited run of digits and dashes carrying at least six digits.
fn order_reference(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|word| word.trim_matches(|ch: char| !ch.is_ascii_alphanumeric() && ch != '-'))
        .map(|word| word.trim_end_matches(|ch: char| !ch.is_ascii_digit()))
        .find(|word| {
            !word.is_empty()
                && word.chars().all(|ch| ch.is_ascii_digit() || ch == '-')
                && word.chars().filter(char::is_ascii_digit).count() >= MIN_ORDER_REF_DIGITS
        })
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use concierge_core::domain::session::{AgentKind, ContinuationId, PendingAction};
    use concierge_core::domain::turn::{PendingChange, RoutingDecision, RoutingReason};
    use concierge_core::scheduler::ContinuationPayload;

    use super::{order_reference, DeliveryAgent, LAST_STATUS_SLOT, ORDER_REF_SLOT};
    use crate::agents::testing::{empty_state, ontology, run};
    use crate::agents::{Agent, AgentError, AgentSettings, TurnContext, TurnInput};

    #[test]
    fn shipping_fee_question_answers_from_policy() {
        let (decision, result) = run("배송비 얼마예요?", &empty_state());
        assert_eq!(decision.target, AgentKind::Delivery);
        assert_eq!(
            result.reply_text,
            "5만원 이상 구매 시 무료배송이며, 그 외에는 배송비 3,000원이 부과됩니다."
        );
        assert!(result.mutation.is_empty());
        assert!(result.continuation.is_none());
    }

    #[test]
    fn status_lookup_opens_check_and_schedules_continuation() {
        let (decision, result) = run("주문번호 20260101-0001 배송조회 해주세요", &empty_state());
        assert_eq!(decision.target, AgentKind::Delivery);
        assert!(result.reply_text.contains("주문번호 20260101-0001의 배송 상태를 확인하고 있습니다"));

        let PendingChange::Open(PendingAction::StatusCheck { continuation_id, order_ref, .. }) =
            &result.mutation.pending
        else {
            panic!("expected status check, got {:?}", result.mutation.pending);
        };
        assert_eq!(order_ref.as_deref(), Some("20260101-0001"));
        assert_eq!(
            result.mutation.set_slots.get(ORDER_REF_SLOT).map(String::as_str),
            Some("20260101-0001")
        );

        let continuation = result.continuation.expect("continuation requested");
        assert_eq!(continuation.delay, Duration::from_secs(60));
        assert_eq!(continuation.payload.continuation_id(), continuation_id);
    }

    #[test]
    fn message_during_open_check_gets_interim_reply() {
        let mut state = empty_state();
        state.turn_count = 1;
        state.current_agent = Some(AgentKind::Delivery);
        state.pending_action = Some(PendingAction::StatusCheck {
            continuation_id: ContinuationId("c-1".to_owned()),
            order_ref: None,
            requested_at: Utc::now(),
        });

        let (decision, result) = run("아직인가요?", &state);
        assert!(decision.is_resume());
        assert!(result.reply_text.starts_with("아직 배송 상태를 확인하고 있습니다."));
        assert!(result.mutation.is_empty());
        assert!(result.continuation.is_none());
    }

    #[test]
    fn fired_continuation_reports_status_and_resolves() {
        let ontology = ontology();
        let state = empty_state();
        let payload = ContinuationPayload::DeliveryStatus {
            continuation_id: ContinuationId("c-1".to_owned()),
            order_ref: Some("20260101-0001".to_owned()),
            status: Some("배송 출발".to_owned()),
        };
        let mut decision = RoutingDecision::new(AgentKind::Delivery, RoutingReason::ContinuationResume);
        decision.carry.continuation = Some(payload.clone());
        let settings = AgentSettings::default();
        let ctx = TurnContext {
            input: TurnInput::Continuation(&payload),
            state: &state,
            decision: &decision,
            ontology: &ontology,
            settings: &settings,
            turn: state.turn_count,
            now: Utc::now(),
        };

        let result = DeliveryAgent.handle(&ctx).expect("handled");
        assert_eq!(result.reply_text, "주문번호 20260101-0001 상품은 현재 '배송 출발' 상태입니다.");
        assert_eq!(result.mutation.pending, PendingChange::Resolve);
        assert_eq!(result.mutation.set_slots.get(LAST_STATUS_SLOT).map(String::as_str), Some("배송 출발"));
    }

    #[test]
    fn resumed_continuation_without_payload_input_is_rejected() {
        let ontology = ontology();
        let state = empty_state();
        let message = concierge_core::domain::message::Message::from_user("chat-1", "hi");
        let mut decision = RoutingDecision::new(AgentKind::Delivery, RoutingReason::ContinuationResume);
        decision.carry.continuation = Some(ContinuationPayload::DeliveryStatus {
            continuation_id: ContinuationId("c-1".to_owned()),
            order_ref: None,
            status: None,
        });
        let settings = AgentSettings::default();
        let ctx = TurnContext {
            input: TurnInput::Message(&message),
            state: &state,
            decision: &decision,
            ontology: &ontology,
            settings: &settings,
            turn: 1,
            now: Utc::now(),
        };

        let error = DeliveryAgent.handle(&ctx).expect_err("missing payload");
        assert!(matches!(error, AgentError::MissingContext { agent: AgentKind::Delivery, .. }));
    }

    #[test]
    fn order_reference_needs_six_digits() {
        assert_eq!(order_reference("주문번호 20260101-0001 조회"), Some("20260101-0001".to_owned()));
        assert_eq!(order_reference("(123456789)번 주문"), Some("123456789".to_owned()));
        assert_eq!(order_reference("3일 걸리나요"), None);
        assert_eq!(order_reference("12345 이에요"), None);
    }
}
