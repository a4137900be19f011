//! Wire shape of the ontology document. Converted into facts by the index builder.

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OntologyDocument {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub categories: Vec<RawCategory>,
    pub products: Vec<RawProduct>,
    #[serde(default)]
    pub policies: Vec<RawPolicy>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RawCategory {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RawProduct {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub category: String,
    pub base_price: i64,
    #[serde(default)]
    pub options: Vec<RawOption>,
    #[serde(default)]
    pub variants: Vec<RawVariant>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RawOption {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RawVariant {
    pub label: String,
    #[serde(default)]
    pub stock: u32,
    #[serde(default)]
    pub price_delta: i64,
    #[serde(default = "default_sale_status")]
    pub sale_status: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RawPolicy {
    pub id: String,
    pub topic: String,
    pub kind: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub text: String,
}

fn default_sale_status() -> String {
    "on_sale".to_owned()
}
