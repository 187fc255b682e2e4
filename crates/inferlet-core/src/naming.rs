//! Model-name classification
//!
//! Hub model ids carry conventions about how their weights were produced. All
//! id-based decisions go through [`classify_model_name`], which applies this table
//! to the lower-cased id split on `/ - _ .`:
//!
//! | Token | Meaning |
//! |---|---|
//! | `awq` | pre-quantized AWQ weights |
//! | `gptq`, `gptq*` | pre-quantized GPTQ weights |
//! | `int4`, `4bit`, `w4a16g128` | weak 4-bit hint, AWQ |
//! | `w4a16` | weak 4-bit hint, GPTQ (compressed-tensors / Marlin) |
//! | `moe`, `<n>x<m>b`, `a<n>b` | mixture-of-experts |
//!
//! A name carrying both `awq` and `gptq` is ambiguous and is not treated as
//! pre-quantized.

use serde::{Deserialize, Serialize};

/// Weight format a model id advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrequantFormat {
    Awq,
    Gptq,
}

/// Facts derived from a model id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModelTraits {
    /// Set when the id unambiguously names already-quantized weights
    pub prequant: Option<PrequantFormat>,
    /// Weaker format hint, used to pick a 4-bit backend
    pub hint: Option<PrequantFormat>,
    /// Mixture-of-experts architecture
    pub moe: bool,
}

impl ModelTraits {
    /// Strongest format signal available
    pub fn format_hint(&self) -> Option<PrequantFormat> {
        self.prequant.or(self.hint)
    }
}

/// Classify a hub model id
pub fn classify_model_name(id: &str) -> ModelTraits {
    let lower = id.to_ascii_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| matches!(c, '/' | '-' | '_' | '.'))
        .filter(|t| !t.is_empty())
        .collect();

    let awq = tokens.iter().any(|t| *t == "awq");
    let gptq = tokens.iter().any(|t| t.starts_with("gptq"));
    let prequant = match (awq, gptq) {
        (true, false) => Some(PrequantFormat::Awq),
        (false, true) => Some(PrequantFormat::Gptq),
        _ => None,
    };

    let hint = if tokens
        .iter()
        .any(|t| matches!(*t, "int4" | "4bit" | "w4a16g128"))
    {
        Some(PrequantFormat::Awq)
    } else if tokens.iter().any(|t| *t == "w4a16") {
        Some(PrequantFormat::Gptq)
    } else {
        None
    };

    let moe = tokens
        .iter()
        .any(|t| *t == "moe" || is_expert_count(t) || is_active_params(t));

    ModelTraits {
        prequant,
        hint,
        moe,
    }
}

/// `8x7b`, `8x22b`
fn is_expert_count(token: &str) -> bool {
    let Some(body) = token.strip_suffix('b') else {
        return false;
    };
    let Some((experts, size)) = body.split_once('x') else {
        return false;
    };
    is_number(experts) && is_number(size)
}

/// `a3b`, `a22b`, `a2.7b` (the dot is split away, so only integers reach here)
fn is_active_params(token: &str) -> bool {
    token
        .strip_prefix('a')
        .and_then(|rest| rest.strip_suffix('b'))
        .map_or(false, is_number)
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}
