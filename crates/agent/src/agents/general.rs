use concierge_core::domain::session::{AgentKind, PendingAction};
use concierge_core::domain::turn::{AgentResult, RoutingReason, StateMutation};
use concierge_core::errors::HOLD_REPLY;
use concierge_core::ontology::{OntologyFact, PolicyFact, PolicyKind};
use concierge_core::text::{compact, contains_any, tokenize};

use super::{Agent, AgentError, TurnContext};

pub const HANDOFF_REASON_SLOT: &str = "handoff_reason";

const HANDOFF: &[&str] = &["상담원", "상담사", "직원", "사람이랑", "사람과", "연결해", "매니저", "담당자", "agent"];
const GREETING: &[&str] = &["안녕", "반가", "hello", "hi"];
const THANKS: &[&str] = &["감사", "고맙", "thank"];

const HANDOFF_OPENED: &str =
    "상담원에게 연결해드리겠습니다. 상담원이 확인 후 답변드릴 예정이니 잠시만 기다려주세요.";
const HANDOFF_HOLD: &str =
    "상담원 연결을 요청하셨습니다. 상담원이 곧 답변드릴 예정이니 잠시만 기다려주세요.";
const GREETING_REPLY: &str =
    "안녕하세요! 상품, 배송, 교환/환불 문의를 도와드릴게요. 무엇을 도와드릴까요?";
const THANKS_REPLY: &str = "이용해주셔서 감사합니다. 더 궁금한 점이 있으면 언제든 말씀해주세요.";

/// Greetings, refund/exchange/general policy answers and human handoff.
#[derive(Clone, Debug, Default)]
pub struct GeneralAgent;

impl Agent for GeneralAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::General
    }

    fn handle(&self, ctx: &TurnContext<'_>) -> Result<AgentResult, AgentError> {
        if matches!(ctx.decision.reason, RoutingReason::HandoffHold) {
            return Ok(AgentResult::reply(HANDOFF_HOLD));
        }

        let text = ctx.text();
        let compacted = compact(text);

        if !contains_any(&compacted, HANDOFF).is_empty() {
            let pending =
                PendingAction::HumanHandoff { reason: "customer_requested".to_owned(), flagged_at: ctx.now };
            let mutation = StateMutation::open(pending).with_slot(HANDOFF_REASON_SLOT, text);
            return Ok(AgentResult::reply(HANDOFF_OPENED).with_mutation(mutation));
        }

        if let Some(policy) = general_policy(ctx) {
            return Ok(AgentResult::reply(policy.text.clone()));
        }
        if greets(text) {
            return Ok(AgentResult::reply(GREETING_REPLY));
        }
        if !contains_any(&compacted, THANKS).is_empty() {
            return Ok(AgentResult::reply(THANKS_REPLY));
        }

        Ok(AgentResult::reply(HOLD_REPLY))
    }
}

/// Latin greetings must be whole tokens ("hi" is not "this"); hangul stems may carry endings.
fn greets(text: &str) -> bool {
    tokenize(text).iter().any(|token| {
        GREETING.iter().any(|keyword| {
            if keyword.is_ascii() {
                token == keyword
            } else {
                token.starts_with(keyword)
            }
        })
    })
}

fn answers_here(policy: &PolicyFact) -> bool {
    matches!(policy.kind, PolicyKind::Refund | PolicyKind::Exchange | PolicyKind::General)
}

fn general_policy<'a>(ctx: &TurnContext<'a>) -> Option<&'a PolicyFact> {
    let ontology = ctx.ontology;
    if let Some(policy) =
        ctx.decision.carry.policy_id.as_deref().and_then(|id| ontology.find_policy(id).ok())
    {
        if answers_here(policy) {
            return Some(policy);
        }
    }
    ontology.match_entities(ctx.text()).into_iter().find_map(|entity| match entity.fact {
        OntologyFact::Policy(policy) if answers_here(policy) => Some(policy),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use concierge_core::domain::session::{AgentKind, PendingAction};
    use concierge_core::domain::turn::{PendingChange, RoutingReason};
    use concierge_core::errors::HOLD_REPLY;

    use super::{HANDOFF_HOLD, HANDOFF_REASON_SLOT};
    use crate::agents::testing::{empty_state, run};

    #[test]
    fn refund_question_answers_from_policy() {
        let (decision, result) = run("환불은 어떻게 하나요?", &empty_state());
        assert_eq!(decision.target, AgentKind::General);
        assert!(result.reply_text.starts_with("상품 수령 후 7일 이내 반품 신청 시 환불 가능합니다."));
        assert!(result.mutation.is_empty());
    }

    #[test]
    fn exchange_keyword_finds_exchange_policy() {
        let (_, result) = run("사이즈 교환 되나요", &empty_state());
        assert_eq!(result.reply_text, "수령 후 7일 이내 동일 상품의 다른 옵션으로 1회 교환 가능합니다.");
    }

    #[test]
    fn handoff_request_opens_handoff() {
        let (decision, result) = run("상담원 연결해주세요", &empty_state());
        assert_eq!(decision.target, AgentKind::General);
        assert!(matches!(
            result.mutation.pending,
            PendingChange::Open(PendingAction::HumanHandoff { ref reason, .. }) if reason == "customer_requested"
        ));
        assert_eq!(
            result.mutation.set_slots.get(HANDOFF_REASON_SLOT).map(String::as_str),
            Some("상담원 연결해주세요")
        );
    }

    #[test]
    fn open_handoff_holds_every_message() {
        let mut state = empty_state();
        state.turn_count = 2;
        state.current_agent = Some(AgentKind::General);
        state.pending_action =
            Some(PendingAction::HumanHandoff { reason: "customer_requested".to_owned(), flagged_at: Utc::now() });

        let (decision, result) = run("티셔츠 재고 있나요?", &state);
        assert_eq!(decision.target, AgentKind::General);
        assert_eq!(decision.reason, RoutingReason::HandoffHold);
        assert_eq!(result.reply_text, HANDOFF_HOLD);
        assert!(result.mutation.is_empty());
    }

    #[test]
    fn greeting_and_thanks_get_canned_replies() {
        let (_, greeting) = run("안녕하세요", &empty_state());
        assert!(greeting.reply_text.starts_with("안녕하세요!"));

        let (_, thanks) = run("감사합니다", &empty_state());
        assert!(thanks.reply_text.starts_with("이용해주셔서 감사합니다."));

        let (_, latin) = run("Hi there", &empty_state());
        assert!(latin.reply_text.starts_with("안녕하세요!"));
    }

    #[test]
    fn greeting_words_inside_other_words_are_not_greetings() {
        for text in ["this is my order history", "which one"] {
            let (decision, result) = run(text, &empty_state());
            assert_eq!(decision.target, AgentKind::General, "{text}");
            assert_eq!(result.reply_text, HOLD_REPLY, "{text}");
        }
    }

    #[test]
    fn unrelated_text_falls_back_to_hold_reply() {
        let (decision, result) = run("오늘 날씨 어때요", &empty_state());
        assert_eq!(decision.target, AgentKind::General);
        assert_eq!(decision.reason, RoutingReason::Fallback);
        assert_eq!(result.reply_text, HOLD_REPLY);
        assert!(result.mutation.is_empty());
    }
}
