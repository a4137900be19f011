use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::info;

use crate::ontology::document::{OntologyDocument, RawPolicy, RawProduct};
use crate::ontology::{
    BlobError, BlobLocation, BlobSource, CategoryFact, EntityMatch, LoadError, LookupError,
    MatchStrength, OntologyFact, OptionKind, PolicyFact, PolicyKind, ProductFact, ProductOption,
    ProductSearch, SaleStatus, Variant,
};
use crate::text::{compact, normalize, strip_particle, tokenize};

/// Read-only index over the ontology. Built once, then shared behind an `Arc`.
#[derive(Clone, Debug)]
pub struct OntologyIndex {
    namespace: Option<String>,
    categories: Vec<CategoryFact>,
    products: Vec<ProductFact>,
    policies: Vec<PolicyFact>,
    category_by_id: HashMap<String, usize>,
    product_by_id: HashMap<String, usize>,
    product_by_term: HashMap<String, usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OntologyStats {
    pub namespace: Option<String>,
    pub categories: usize,
    pub products: usize,
    pub variants: usize,
    pub policies: usize,
}

impl OntologyIndex {
    pub fn load(bytes: &[u8], max_bytes: usize) -> Result<Self, LoadError> {
        if bytes.len() > max_bytes {
            return Err(LoadError::TooLarge { size: bytes.len(), max: max_bytes });
        }
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(LoadError::Empty);
        }
        let document: OntologyDocument = serde_json::from_slice(bytes)?;
        let index = Self::build(document)?;
        let stats = index.stats();
        info!(
            event_name = "ontology.loaded",
            products = stats.products,
            categories = stats.categories,
            policies = stats.policies,
            "ontology index built"
        );
        Ok(index)
    }

    pub async fn load_from(
        source: &dyn BlobSource,
        location: &BlobLocation,
        max_bytes: usize,
    ) -> Result<Self, LoadError> {
        let bytes = source.fetch(location, max_bytes).await.map_err(|error| match error {
            BlobError::TooLarge { size, max } => {
                LoadError::TooLarge { size: usize::try_from(size).unwrap_or(usize::MAX), max }
            }
            other => LoadError::Fetch(other),
        })?;
        Self::load(&bytes, max_bytes)
    }

    fn build(document: OntologyDocument) -> Result<Self, LoadError> {
        if document.products.is_empty() {
            return Err(LoadError::Invalid("document contains no products".to_owned()));
        }

        let mut category_by_id = HashMap::new();
        let mut categories = Vec::with_capacity(document.categories.len());
        for raw in document.categories {
            let id = required("category id", raw.id)?;
            if category_by_id.insert(id.clone(), categories.len()).is_some() {
                return Err(LoadError::Invalid(format!("duplicate category id `{id}`")));
            }
            categories.push(CategoryFact { id, name: raw.name.trim().to_owned(), parent: raw.parent });
        }
        for category in &categories {
            if let Some(parent) = &category.parent {
                if !category_by_id.contains_key(parent) {
                    return Err(LoadError::Invalid(format!(
                        "category `{}` references unknown parent `{parent}`",
                        category.id
                    )));
                }
            }
        }
        detect_category_cycles(&categories, &category_by_id)?;

        let mut product_by_id = HashMap::new();
        let mut products = Vec::with_capacity(document.products.len());
        for raw in document.products {
            let product = convert_product(raw)?;
            if !category_by_id.contains_key(&product.category) {
                return Err(LoadError::Invalid(format!(
                    "product `{}` references unknown category `{}`",
                    product.id, product.category
                )));
            }
            if product_by_id.insert(product.id.clone(), products.len()).is_some() {
                return Err(LoadError::Invalid(format!("duplicate product id `{}`", product.id)));
            }
            products.push(product);
        }

        let mut product_by_term = HashMap::new();
        for (position, product) in products.iter().enumerate() {
            for term in product.terms() {
                product_by_term.entry(normalize(term)).or_insert(position);
            }
        }

        let mut policy_ids = HashSet::new();
        let mut policies = Vec::with_capacity(document.policies.len());
        for raw in document.policies {
            let policy = convert_policy(raw)?;
            if !policy_ids.insert(policy.id.clone()) {
                return Err(LoadError::Invalid(format!("duplicate policy id `{}`", policy.id)));
            }
            policies.push(policy);
        }

        Ok(Self {
            namespace: document.namespace,
            categories,
            products,
            policies,
            category_by_id,
            product_by_id,
            product_by_term,
        })
    }

    /// Id, then exact name or alias, then the same ignoring whitespace.
    pub fn find_product(&self, name_or_id: &str) -> Result<&ProductFact, LookupError> {
        let query = name_or_id.trim();
        if let Some(position) = self.product_by_id.get(query) {
            return Ok(&self.products[*position]);
        }
        if let Some(position) = self.product_by_term.get(&normalize(query)) {
            return Ok(&self.products[*position]);
        }
        let compacted = compact(query);
        self.products
            .iter()
            .find(|product| product.terms().any(|term| compact(term) == compacted))
            .ok_or_else(|| LookupError::NotFound { kind: "product", query: query.to_owned() })
    }

    /// Topic or keyword equality first, then a topic/keyword contained in the query.
    pub fn find_policy(&self, topic: &str) -> Result<&PolicyFact, LookupError> {
        let query = topic.trim();
        let compacted = compact(query);
        let equal = self.policies.iter().find(|policy| {
            policy.id == query || policy.terms().any(|term| compact(term) == compacted)
        });
        if let Some(policy) = equal {
            return Ok(policy);
        }
        self.policies
            .iter()
            .filter_map(|policy| {
                policy
                    .terms()
                    .map(compact)
                    .filter(|term| !term.is_empty() && compacted.contains(term.as_str()))
                    .map(|term| term.chars().count())
                    .max()
                    .map(|length| (length, policy))
            })
            .max_by_key(|(length, _)| *length)
            .map(|(_, policy)| policy)
            .ok_or_else(|| LookupError::NotFound { kind: "policy", query: query.to_owned() })
    }

    /// The product's own category followed by its ancestors. Empty for an unknown product.
    pub fn related_categories(&self, product_id: &str) -> Vec<&CategoryFact> {
        let Some(product) = self.product_by_id.get(product_id).map(|position| &self.products[*position])
        else {
            return Vec::new();
        };
        let mut chain = Vec::new();
        let mut next = Some(product.category.as_str());
        while let Some(id) = next {
            let Some(category) = self.category(id) else { break };
            chain.push(category);
            next = category.parent.as_deref();
        }
        chain
    }

    pub fn search_products(&self, partial: &str) -> ProductSearch<'_> {
        let query = normalize(partial);
        let compacted = compact(partial);
        let mut search = ProductSearch::default();
        if compacted.is_empty() {
            return search;
        }
        let query_tokens: Vec<String> = tokenize(&query)
            .iter()
            .map(|token| strip_particle(token).to_owned())
            .filter(|token| token.chars().count() >= 2)
            .collect();

        for product in &self.products {
            if product.terms().any(|term| normalize(term) == query) {
                search.exact.push(product);
            } else if product.terms().any(|term| {
                let term = compact(term);
                term.contains(compacted.as_str()) || compacted.contains(term.as_str())
            }) {
                search.contained.push(product);
            } else if product.terms().any(|term| {
                let term = compact(term);
                query_tokens.iter().any(|token| term.contains(token.as_str()))
            }) {
                search.keyword.push(product);
            }
        }
        search
    }

    /// Every product, category and policy term found in `text`, strongest first.
    pub fn match_entities(&self, text: &str) -> Vec<EntityMatch<'_>> {
        let words = word_line(text);
        let compacted = compact(text);
        let mut matches = Vec::new();

        let facts = self
            .products
            .iter()
            .map(|product| (OntologyFact::Product(product), product.terms().collect::<Vec<_>>()))
            .chain(self.categories.iter().map(|category| {
                (OntologyFact::Category(category), vec![category.name.as_str()])
            }))
            .chain(
                self.policies
                    .iter()
                    .map(|policy| (OntologyFact::Policy(policy), policy.terms().collect())),
            );

        for (fact, terms) in facts {
            let best = terms
                .into_iter()
                .filter_map(|term| {
                    term_strength(term, &words, &compacted).map(|strength| (strength, term))
                })
                .max_by_key(|(strength, term)| (*strength, term.chars().count()));
            if let Some((strength, term)) = best {
                matches.push(EntityMatch { fact, term: term.to_owned(), strength });
            }
        }

        matches.sort_by(|left, right| {
            right
                .strength
                .cmp(&left.strength)
                .then_with(|| right.term.chars().count().cmp(&left.term.chars().count()))
        });
        matches
    }

    pub fn category(&self, id: &str) -> Option<&CategoryFact> {
        self.category_by_id.get(id).map(|position| &self.categories[*position])
    }

    pub fn products(&self) -> &[ProductFact] {
        &self.products
    }

    pub fn categories(&self) -> &[CategoryFact] {
        &self.categories
    }

    pub fn policies(&self) -> &[PolicyFact] {
        &self.policies
    }

    pub fn policies_of(&self, kind: PolicyKind) -> Vec<&PolicyFact> {
        self.policies.iter().filter(|policy| policy.kind == kind).collect()
    }

    pub fn stats(&self) -> OntologyStats {
        OntologyStats {
            namespace: self.namespace.clone(),
            categories: self.categories.len(),
            products: self.products.len(),
            variants: self.products.iter().map(|product| product.variants.len()).sum(),
            policies: self.policies.len(),
        }
    }
}

fn required(field: &str, value: String) -> Result<String, LoadError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LoadError::Invalid(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_owned())
}

fn convert_product(raw: RawProduct) -> Result<ProductFact, LoadError> {
    let id = required("product id", raw.id)?;
    let name = required("product name", raw.name)?;
    if raw.base_price < 0 {
        return Err(LoadError::Invalid(format!("product `{id}` has a negative base price")));
    }
    let variants = raw
        .variants
        .into_iter()
        .map(|variant| {
            let sale_status = SaleStatus::parse(&variant.sale_status).ok_or_else(|| {
                LoadError::Invalid(format!(
                    "product `{id}` variant `{}` has unknown sale status `{}`",
                    variant.label, variant.sale_status
                ))
            })?;
            Ok(Variant {
                label: variant.label.trim().to_owned(),
                stock: variant.stock,
                price_delta: variant.price_delta,
                sale_status,
            })
        })
        .collect::<Result<Vec<_>, LoadError>>()?;

    Ok(ProductFact {
        id,
        name,
        aliases: raw
            .aliases
            .into_iter()
            .map(|alias| alias.trim().to_owned())
            .filter(|alias| !alias.is_empty())
            .collect(),
        category: raw.category.trim().to_owned(),
        base_price: raw.base_price,
        options: raw
            .options
            .into_iter()
            .map(|option| ProductOption {
                kind: OptionKind::from_name(&option.name),
                values: option.values,
            })
            .collect(),
        variants,
    })
}

fn convert_policy(raw: RawPolicy) -> Result<PolicyFact, LoadError> {
    let id = required("policy id", raw.id)?;
    let kind = PolicyKind::parse(&raw.kind).ok_or_else(|| {
        LoadError::Invalid(format!("policy `{id}` has unknown kind `{}`", raw.kind))
    })?;
    Ok(PolicyFact {
        topic: required("policy topic", raw.topic)?,
        kind,
        keywords: raw
            .keywords
            .into_iter()
            .map(|keyword| keyword.trim().to_owned())
            .filter(|keyword| !keyword.is_empty())
            .collect(),
        text: raw.text,
        id,
    })
}

fn detect_category_cycles(
    categories: &[CategoryFact],
    by_id: &HashMap<String, usize>,
) -> Result<(), LoadError> {
    for category in categories {
        let mut steps = 0;
        let mut next = category.parent.as_deref();
        while let Some(parent) = next {
            steps += 1;
            if steps > categories.len() {
                return Err(LoadError::Invalid(format!(
                    "category `{}` is part of a parent cycle",
                    category.id
                )));
            }
            next = by_id.get(parent).and_then(|position| categories[*position].parent.as_deref());
        }
    }
    Ok(())
}

/// Tokens with trailing particles removed, space-delimited on both ends for whole-word checks.
fn word_line(text: &str) -> String {
    let words: Vec<String> =
        tokenize(text).iter().map(|token| strip_particle(token).to_owned()).collect();
    format!(" {} ", words.join(" "))
}

fn term_strength(term: &str, words: &str, compacted_text: &str) -> Option<MatchStrength> {
    let term_words = tokenize(term);
    if term_words.is_empty() {
        return None;
    }
    if words.contains(&format!(" {} ", term_words.join(" "))) {
        return Some(MatchStrength::Exact);
    }
    let compacted_term: String = term_words.concat();
    if compacted_term.chars().count() >= 2 && compacted_text.contains(compacted_term.as_str()) {
        return Some(MatchStrength::Near);
    }
    None
}
