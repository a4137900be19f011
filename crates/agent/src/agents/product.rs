use concierge_core::domain::session::{AgentKind, PendingAction};
use concierge_core::domain::turn::{AgentResult, StateMutation};
use concierge_core::errors::HOLD_REPLY;
use concierge_core::ontology::{
    OntologyFact, OntologyIndex, OptionKind, ProductFact, SaleStatus, Variant,
};
use concierge_core::text::{compact, contains_any, format_won, tokenize};

use super::{Agent, AgentError, TurnContext};

pub const PRODUCT_QUERY_SLOT: &str = "product_query";
pub const PRODUCT_ID_SLOT: &str = "product_id";

const MAX_CANDIDATES: usize = 5;

const UNSUPPORTED: &[&str] =
    &["추천", "비교", "리뷰", "후기", "결제", "주문방법", "주문하", "구매방법", "recommend"];
const PRICE: &[&str] = &["가격", "얼마", "금액", "price"];
const STOCK: &[&str] = &["재고", "수량", "남아", "남았", "몇개", "stock"];
const SALE_STATUS: &[&str] = &["품절", "판매", "구매가능", "살수", "soldout"];
const COLOR: &[&str] = &["색상", "색깔", "컬러", "color"];
const SIZE: &[&str] = &["사이즈", "치수", "크기", "size"];
const TYPE: &[&str] = &["타입", "종류", "유형", "type"];

#[derive(Clone, Debug, PartialEq, Eq)]
enum Aspect {
    Price,
    VariantPrice,
    Stock,
    SaleStatus,
    Option(OptionKind),
}

/// Answers price, stock, sale status and option questions from product facts.
#[derive(Clone, Debug, Default)]
pub struct ProductAgent;

impl Agent for ProductAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Product
    }

    fn handle(&self, ctx: &TurnContext<'_>) -> Result<AgentResult, AgentError> {
        let clarification = match &ctx.decision.carry.pending {
            Some(pending @ PendingAction::Clarification { .. }) => Some(pending),
            _ => None,
        };
        let query = match (clarification, ctx.state.slot(PRODUCT_QUERY_SLOT)) {
            (Some(_), Some(previous)) => format!("{previous} {}", ctx.text()),
            _ => ctx.text().to_owned(),
        };
        let compacted = compact(&query);
        let settled = if clarification.is_some() {
            StateMutation::resolve()
        } else {
            StateMutation::default()
        };

        if !contains_any(&compacted, UNSUPPORTED).is_empty() {
            return Ok(AgentResult::reply(HOLD_REPLY).with_mutation(settled));
        }

        match resolve(ctx, clarification, &query) {
            Resolution::Found(product) => {
                let reply = answer(product, ctx.ontology, &query);
                let mutation = settled
                    .with_slot(PRODUCT_ID_SLOT, product.id.clone())
                    .clearing_slot(PRODUCT_QUERY_SLOT);
                Ok(AgentResult::reply(reply).with_mutation(mutation))
            }
            Resolution::Candidates(candidates) => {
                let names: Vec<String> =
                    candidates.iter().map(|product| product.name.clone()).collect();
                let (opened_at_turn, opened_at) = match clarification {
                    Some(PendingAction::Clarification { opened_at_turn, opened_at, .. }) => {
                        (*opened_at_turn, *opened_at)
                    }
                    _ => (ctx.turn, ctx.now),
                };
                let pending = PendingAction::Clarification {
                    agent: AgentKind::Product,
                    slot: PRODUCT_QUERY_SLOT.to_owned(),
                    candidates: names.clone(),
                    opened_at_turn,
                    window_turns: ctx.settings.clarification_window_turns,
                    opened_at,
                };
                let mutation = StateMutation::open(pending).with_slot(PRODUCT_QUERY_SLOT, query);
                Ok(AgentResult::reply(clarification_reply(&names)).with_mutation(mutation))
            }
        }
    }
}

enum Resolution<'a> {
    Found(&'a ProductFact),
    /// Zero or more possible matches; the user has to pick or rephrase.
    Candidates(Vec<&'a ProductFact>),
}

fn resolve<'a>(
    ctx: &TurnContext<'a>,
    clarification: Option<&PendingAction>,
    query: &str,
) -> Resolution<'a> {
    let ontology = ctx.ontology;

    if let Some(PendingAction::Clarification { candidates, .. }) = clarification {
        if let Some(product) = pick_candidate(ctx.text(), candidates)
            .and_then(|name| ontology.find_product(name).ok())
        {
            return Resolution::Found(product);
        }
    }

    if let Some(product) =
        ctx.decision.carry.product_id.as_deref().and_then(|id| ontology.find_product(id).ok())
    {
        return Resolution::Found(product);
    }

    let mentioned = ontology.match_entities(query).into_iter().find_map(|entity| match entity.fact {
        OntologyFact::Product(product) => Some(product),
        _ => None,
    });
    if let Some(product) = mentioned {
        return Resolution::Found(product);
    }

    let search = ontology.search_products(query);
    if let [product] = search.exact.as_slice() {
        return Resolution::Found(product);
    }
    Resolution::Candidates(search.ranked().take(MAX_CANDIDATES).collect())
}

/// "2", "2번", "두번째" or a candidate's name.
fn pick_candidate<'c>(text: &str, candidates: &'c [String]) -> Option<&'c str> {
    let compacted = compact(text);
    let named = candidates
        .iter()
        .filter(|candidate| compacted.contains(compact(candidate).as_str()))
        .max_by_key(|candidate| candidate.chars().count());
    if let Some(candidate) = named {
        return Some(candidate.as_str());
    }

    const ORDINALS: [&str; 5] = ["첫", "두", "세", "네", "다섯"];
    let position = tokenize(text)
        .iter()
        .find_map(|token| {
            let digits: String = token.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<usize>().ok()
        })
        .or_else(|| {
            ORDINALS
                .iter()
                .position(|ordinal| compacted.contains(&format!("{ordinal}번째")))
                .map(|index| index + 1)
        })?;
    candidates.get(position.checked_sub(1)?).map(String::as_str)
}

fn detect_aspects(product: &ProductFact, compacted: &str) -> Vec<Aspect> {
    let mut aspects = Vec::new();
    if !contains_any(compacted, PRICE).is_empty() {
        if matching_variant(product, compacted).is_some() {
            aspects.push(Aspect::VariantPrice);
        } else {
            aspects.push(Aspect::Price);
        }
    }
    if !contains_any(compacted, STOCK).is_empty() {
        aspects.push(Aspect::Stock);
    }
    if !contains_any(compacted, SALE_STATUS).is_empty() && !aspects.contains(&Aspect::Stock) {
        aspects.push(Aspect::SaleStatus);
    }
    for (keywords, kind) in [(COLOR, OptionKind::Color), (SIZE, OptionKind::Size), (TYPE, OptionKind::Type)] {
        if !contains_any(compacted, keywords).is_empty() {
            aspects.push(Aspect::Option(kind));
        }
    }
    aspects
}

/// The variant whose every label part appears in the text, preferring the most specific label.
fn matching_variant<'p>(product: &'p ProductFact, compacted: &str) -> Option<&'p Variant> {
    product
        .variants
        .iter()
        .filter(|variant| {
            let parts = tokenize(&variant.label);
            !parts.is_empty() && parts.iter().all(|part| compacted.contains(part.as_str()))
        })
        .max_by_key(|variant| tokenize(&variant.label).len())
}

fn answer(product: &ProductFact, ontology: &OntologyIndex, query: &str) -> String {
    let compacted = compact(query);
    let aspects = detect_aspects(product, &compacted);
    if aspects.is_empty() {
        return summary(product, ontology);
    }
    aspects
        .iter()
        .map(|aspect| match aspect {
            Aspect::Price => price_reply(product),
            Aspect::VariantPrice => match matching_variant(product, &compacted) {
                Some(variant) => format!(
                    "'{}' {} 옵션의 가격은 {}입니다.",
                    product.name,
                    variant.label,
                    format_won(product.variant_price(variant))
                ),
                None => price_reply(product),
            },
            Aspect::Stock => stock_reply(product),
            Aspect::SaleStatus => sale_status_reply(product),
            Aspect::Option(kind) => option_reply(product, kind),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn price_reply(product: &ProductFact) -> String {
    let mut reply = format!("'{}' 상품의 가격은 {}입니다.", product.name, format_won(product.base_price));
    let surcharged: Vec<String> = product
        .variants
        .iter()
        .filter(|variant| variant.price_delta != 0 && variant.sale_status != SaleStatus::Hidden)
        .map(|variant| format!("{} {}", variant.label, format_won(product.variant_price(variant))))
        .collect();
    if !surcharged.is_empty() {
        reply.push_str(&format!(" (옵션별 가격: {})", surcharged.join(", ")));
    }
    reply
}

fn stock_reply(product: &ProductFact) -> String {
    let visible: Vec<&Variant> =
        product.variants.iter().filter(|variant| variant.sale_status != SaleStatus::Hidden).collect();
    if visible.is_empty() {
        return format!("'{}' 상품의 재고 정보를 찾을 수 없습니다.", product.name);
    }
    let mut lines = vec![format!("'{}' 상품의 재고 현황입니다.", product.name)];
    for variant in visible {
        let line = match variant.sale_status {
            SaleStatus::OnSale => format!("- {}: {}개", variant.label, variant.stock),
            status => format!("- {}: {}", variant.label, status.label()),
        };
        lines.push(line);
    }
    lines.push(format!("총 재고: {}개", product.total_stock()));
    lines.join("\n")
}

fn sale_status_reply(product: &ProductFact) -> String {
    let mut reply =
        format!("'{}' 상품은 현재 {} 상태입니다.", product.name, product.sale_status().label());
    for status in [SaleStatus::TemporarilySoldOut, SaleStatus::SoldOut] {
        let labels: Vec<&str> = product
            .variants_by_status(status)
            .into_iter()
            .map(|variant| variant.label.as_str())
            .collect();
        if !labels.is_empty() {
            reply.push_str(&format!(" {} 옵션: {}.", status.label(), labels.join(", ")));
        }
    }
    reply
}

fn option_reply(product: &ProductFact, kind: &OptionKind) -> String {
    let mut values = product.option_values(kind);
    if values.is_empty() {
        return format!("'{}' 상품의 {} 정보를 찾을 수 없습니다.", product.name, kind.label());
    }
    values.sort_unstable();
    values.dedup();
    format!("'{}' 상품의 {} 옵션: {}", product.name, kind.label(), values.join(", "))
}

fn summary(product: &ProductFact, ontology: &OntologyIndex) -> String {
    let category = ontology
        .related_categories(&product.id)
        .iter()
        .rev()
        .map(|category| category.name.as_str())
        .collect::<Vec<_>>()
        .join(" > ");
    let mut reply = format!(
        "'{}' 상품 안내입니다. 가격: {}, 판매 상태: {}, 총 재고: {}개",
        product.name,
        format_won(product.base_price),
        product.sale_status().label(),
        product.total_stock()
    );
    if !category.is_empty() {
        reply.push_str(&format!(", 카테고리: {category}"));
    }
    reply
}

fn clarification_reply(candidates: &[String]) -> String {
    if candidates.is_empty() {
        return "문의하신 상품을 찾지 못했습니다. 정확한 상품명을 알려주시겠어요?".to_owned();
    }
    let listed = candidates
        .iter()
        .enumerate()
        .map(|(index, name)| format!("{}. {name}", index + 1))
        .collect::<Vec<_>>()
        .join("\n");
    format!("혹시 찾으시는 상품이 아래 중에 있나요?\n{listed}\n번호나 상품명으로 알려주세요.")
}
