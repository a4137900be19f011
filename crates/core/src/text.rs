//! Text normalization shared by ontology matching, routing and reply composition.

const PARTICLES: &[&str] = &["은", "는", "이", "가", "을", "를", "도", "요", "의", "로", "으로", "에", "에서"];

/// Lowercases, trims and collapses inner whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().map(str::to_lowercase).collect::<Vec<_>>().join(" ")
}

/// Lowercased text with every whitespace character removed.
pub fn compact(text: &str) -> String {
    text.chars().filter(|ch| !ch.is_whitespace()).flat_map(char::to_lowercase).collect()
}

/// Splits on anything that is not alphanumeric (hangul counts as alphabetic).
pub fn tokenize(text: &str) -> Vec<String> {
    let mut sanitized = String::with_capacity(text.len());
    for character in text.chars() {
        if character.is_alphanumeric() {
            sanitized.extend(character.to_lowercase());
        } else {
            sanitized.push(' ');
        }
    }
    sanitized.split_whitespace().map(str::to_owned).collect()
}

/// Drops a trailing Korean particle ("티셔츠는" -> "티셔츠") when something remains.
pub fn strip_particle(token: &str) -> &str {
    for particle in PARTICLES.iter().copied().filter(|particle| particle.chars().count() == 2) {
        if let Some(stem) = token.strip_suffix(particle) {
            if stem.chars().count() > 1 {
                return stem;
            }
        }
    }
    for particle in PARTICLES.iter().copied().filter(|particle| particle.chars().count() == 1) {
        if let Some(stem) = token.strip_suffix(particle) {
            if stem.chars().count() > 1 {
                return stem;
            }
        }
    }
    token
}

pub fn contains_any<'a>(normalized_text: &str, keywords: &[&'a str]) -> Vec<&'a str> {
    keywords.iter().copied().filter(|keyword| normalized_text.contains(keyword)).collect()
}

/// Formats an amount with thousands separators: `25000` -> `25,000`.
pub fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    if value < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

pub fn format_won(amount: i64) -> String {
    format!("{}원", group_thousands(amount))
}
