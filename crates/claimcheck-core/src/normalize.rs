//! Text normalization helpers shared across the matching stages.
//!
//! All functions are pure: same inputs always produce the same outputs.
//! The umlaut/accent fold table is part of the analyzer contract -- policy
//! list matching relies on it, so ü/u, ö/o, ä/a, ß/ss and common accented
//! Latin characters compare equal.

/// Fold German umlauts and common accented Latin characters to their base
/// characters for fuzzy substring matching.
///
/// Idempotent: folding an already-folded string is a no-op.
pub fn normalize_umlauts(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            'ä' => out.push('a'),
            'ö' => out.push('o'),
            'ü' => out.push('u'),
            'Ä' => out.push('A'),
            'Ö' => out.push('O'),
            'Ü' => out.push('U'),
            'é' | 'è' | 'ê' => out.push('e'),
            'à' | 'â' => out.push('a'),
            'î' | 'ï' => out.push('i'),
            'ô' => out.push('o'),
            'û' | 'ù' => out.push('u'),
            'ç' => out.push('c'),
            'ß' => out.push_str("ss"),
            other => out.push(other),
        }
    }
    out
}

/// Substring test with the short-string guard applied.
///
/// Strings of 3 characters or fewer on either side must match exactly;
/// longer strings match on bidirectional substring containment. Prevents
/// cross-category false positives like "asr" inside "abgasrueckfuehrung".
pub fn guarded_contains(a: &str, b: &str) -> bool {
    if a.chars().count() <= 3 || b.chars().count() <= 3 {
        a == b
    } else {
        a.contains(b) || b.contains(a)
    }
}

// Generic labor descriptions that mean "work" without naming a part.
// Matched after lower-casing and stripping trailing punctuation so that
// invoice variants like "ARBEIT:" or "Arbeit." are recognized.
const GENERIC_LABOR_DESCRIPTIONS: &[&str] = &[
    "main d'oeuvre",
    "main d'œuvre",
    "main-d'oeuvre",
    "main-d'œuvre",
    "arbeit",
    "arbeitszeit",
    "labor",
    "labour",
    "travail",
    "manodopera",
    "mécanicien",
    "mecanicien",
];

/// Check if a description is a generic labor term (e.g. "Main d'œuvre").
pub fn is_generic_labor_description(description: &str) -> bool {
    let normalized = description
        .to_lowercase()
        .trim()
        .trim_end_matches([':', '.'])
        .to_string();
    GENERIC_LABOR_DESCRIPTIONS.contains(&normalized.as_str())
}

/// Strip an item code down to its upper-cased alphanumeric characters.
///
/// Used when linking labor descriptions to part codes; codes shorter than
/// 4 cleaned characters are too ambiguous to link and callers skip them.
pub fn clean_item_code(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

/// Whether an `item_type` value classifies as labor.
pub fn is_labor_type(item_type: &str) -> bool {
    matches!(
        item_type.to_lowercase().as_str(),
        "labor" | "labour" | "arbeit" | "main d'oeuvre"
    )
}

/// Whether an `item_type` value classifies as a replacement part.
pub fn is_parts_type(item_type: &str) -> bool {
    matches!(item_type.to_lowercase().as_str(), "parts" | "part" | "piece")
}
