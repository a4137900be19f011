//! Product, category and policy knowledge loaded once per process.

pub mod document;
pub mod index;
pub mod source;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use index::{OntologyIndex, OntologyStats};
pub use source::{BlobError, BlobLocation, BlobSource};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKind {
    Color,
    Size,
    Type,
    Other(String),
}

impl OptionKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "색상" | "컬러" | "color" | "colour" => Self::Color,
            "사이즈" | "크기" | "size" => Self::Size,
            "타입" | "종류" | "type" => Self::Type,
            _ => Self::Other(name.trim().to_owned()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Color => "색상",
            Self::Size => "사이즈",
            Self::Type => "타입",
            Self::Other(name) => name,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    OnSale,
    TemporarilySoldOut,
    SoldOut,
    Hidden,
}

impl SaleStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "판매" | "판매중" | "on_sale" => Some(Self::OnSale),
            "일시품절" | "temporarily_sold_out" => Some(Self::TemporarilySoldOut),
            "품절" | "sold_out" => Some(Self::SoldOut),
            "노출안함" | "hidden" => Some(Self::Hidden),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::OnSale => "판매중",
            Self::TemporarilySoldOut => "일시품절",
            Self::SoldOut => "품절",
            Self::Hidden => "노출안함",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Delivery,
    Refund,
    Exchange,
    General,
}

impl PolicyKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "delivery" | "shipping" | "배송" => Some(Self::Delivery),
            "refund" | "환불" => Some(Self::Refund),
            "exchange" | "교환" => Some(Self::Exchange),
            "general" | "일반" => Some(Self::General),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CategoryFact {
    pub id: String,
    pub name: String,
    pub parent: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProductOption {
    pub kind: OptionKind,
    pub values: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Variant {
    pub label: String,
    pub stock: u32,
    pub price_delta: i64,
    pub sale_status: SaleStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProductFact {
    pub id: String,
    pub name: String,
    pub aliases: Vec<String>,
    pub category: String,
    pub base_price: i64,
    pub options: Vec<ProductOption>,
    pub variants: Vec<Variant>,
}

impl ProductFact {
    pub fn option_values(&self, kind: &OptionKind) -> Vec<&str> {
        self.options
            .iter()
            .filter(|option| &option.kind == kind)
            .flat_map(|option| option.values.iter().map(String::as_str))
            .collect()
    }

    /// Stock summed over variants that are still offered.
    pub fn total_stock(&self) -> u64 {
        self.variants
            .iter()
            .filter(|variant| variant.sale_status != SaleStatus::Hidden)
            .map(|variant| u64::from(variant.stock))
            .sum()
    }

    pub fn variants_by_status(&self, status: SaleStatus) -> Vec<&Variant> {
        self.variants.iter().filter(|variant| variant.sale_status == status).collect()
    }

    pub fn variant_price(&self, variant: &Variant) -> i64 {
        self.base_price + variant.price_delta
    }

    /// A product is on sale when any variant is; otherwise it takes the mildest unavailable status.
    pub fn sale_status(&self) -> SaleStatus {
        if self.variants.is_empty() {
            return SaleStatus::OnSale;
        }
        self.variants.iter().map(|variant| variant.sale_status).min().unwrap_or(SaleStatus::OnSale)
    }

    pub fn terms(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PolicyFact {
    pub id: String,
    pub topic: String,
    pub kind: PolicyKind,
    pub keywords: Vec<String>,
    pub text: String,
}

impl PolicyFact {
    pub fn terms(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.topic.as_str()).chain(self.keywords.iter().map(String::as_str))
    }
}

/// Borrowed view over one node of the ontology graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OntologyFact<'a> {
    Product(&'a ProductFact),
    Category(&'a CategoryFact),
    Policy(&'a PolicyFact),
}

impl OntologyFact<'_> {
    pub fn id(&self) -> &str {
        match self {
            Self::Product(product) => &product.id,
            Self::Category(category) => &category.id,
            Self::Policy(policy) => &policy.id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrength {
    /// Term present once spacing and attached syllables are ignored.
    Near,
    /// Term present as whole words.
    Exact,
}

impl MatchStrength {
    pub fn weight(&self) -> u32 {
        match self {
            Self::Near => 60,
            Self::Exact => 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityMatch<'a> {
    pub fact: OntologyFact<'a>,
    pub term: String,
    pub strength: MatchStrength,
}

/// Partial-name product search, best tier first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProductSearch<'a> {
    pub exact: Vec<&'a ProductFact>,
    pub contained: Vec<&'a ProductFact>,
    pub keyword: Vec<&'a ProductFact>,
}

impl<'a> ProductSearch<'a> {
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.contained.is_empty() && self.keyword.is_empty()
    }

    pub fn ranked(&self) -> impl Iterator<Item = &'a ProductFact> + '_ {
        self.exact.iter().chain(&self.contained).chain(&self.keyword).copied()
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("ontology document is missing or empty")]
    Empty,
    #[error("ontology document is {size} bytes, above the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("ontology document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("ontology document is invalid: {0}")]
    Invalid(String),
    #[error("ontology document could not be fetched: {0}")]
    Fetch(#[from] BlobError),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("no {kind} matches `{query}`")]
    NotFound { kind: &'static str, query: String },
}

impl fmt::Display for OntologyFact<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Product(product) => write!(f, "product:{}", product.id),
            Self::Category(category) => write!(f, "category:{}", category.id),
            Self::Policy(policy) => write!(f, "policy:{}", policy.id),
        }
    }
}
