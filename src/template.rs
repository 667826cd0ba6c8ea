//! Macro substitution for URL, body and signature templates.
//!
//! Tokens are written as `{name}`. A template is tokenized once and rendered
//! in a single pass, so a substituted value that itself looks like a token is
//! never expanded again. Unknown tokens are left untouched.

use std::collections::HashMap;

use crate::types::{ConversionType, PostbackProfile, PostbackTask};

const CLICK_ID_ALIASES: &[&str] = &["click_id", "clickid", "subid", "sub_id", "subid1"];
const TX_ID_ALIASES: &[&str] = &["txid", "tx_id", "external_tx_id", "transaction_id"];
const TYPE_ALIASES: &[&str] = &["conversion_type", "type", "goal"];
const REVENUE_ALIASES: &[&str] = &["revenue", "payout", "sum"];
const RAW_STATUS_ALIASES: &[&str] = &["conversion_status", "raw_status"];

const ACCEPTED_REGISTRATION: &str = "lead";
const ACCEPTED_PURCHASE: &str = "sale";
const REJECTED: &str = "rejected";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    /// `name` without braces, `raw` including them.
    Token { name: &'a str, raw: &'a str },
}

/// A tokenized template.
#[derive(Debug, Clone)]
pub struct Template<'a> {
    segments: Vec<Segment<'a>>,
}

impl<'a> Template<'a> {
    pub fn parse(source: &'a str) -> Self {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find('{') {
            let after = &rest[open + 1..];
            let token_len = after
                .find('}')
                .filter(|&end| end > 0 && after[..end].bytes().all(is_token_byte));

            match token_len {
                Some(end) => {
                    if open > 0 {
                        segments.push(Segment::Literal(&rest[..open]));
                    }
                    segments.push(Segment::Token {
                        name: &after[..end],
                        raw: &rest[open..open + end + 2],
                    });
                    rest = &after[end + 1..];
                }
                None => {
                    // Lone brace: keep it and keep scanning after it.
                    segments.push(Segment::Literal(&rest[..open + 1]));
                    rest = after;
                }
            }
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest));
        }

        Self { segments }
    }

    /// Substitute every token occurrence that `macros` knows about.
    pub fn render(&self, macros: &Macros) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Token { name, raw } => match macros.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(raw),
                },
            }
        }
        out
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Parse and render in one call.
pub fn render(template: &str, macros: &Macros) -> String {
    Template::parse(template).render(macros)
}

/// Token name to literal value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Macros {
    values: HashMap<String, String>,
}

impl Macros {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    fn insert_aliases(&mut self, aliases: &[&str], value: &str) {
        for alias in aliases {
            self.insert(*alias, value);
        }
    }

    /// Full macro table for a task delivered under `profile`.
    ///
    /// Custom parameters from the profile fill in names the built-in macros
    /// do not claim; built-ins always win.
    pub fn for_task(task: &PostbackTask, profile: &PostbackProfile) -> Self {
        let mut macros = Self::new();

        for (key, value) in &profile.custom_params {
            macros.insert(key.clone(), value.clone());
        }

        macros.insert_aliases(CLICK_ID_ALIASES, &task.click_id);
        macros.insert_aliases(TX_ID_ALIASES, &task.external_tx_id);
        macros.insert_aliases(TYPE_ALIASES, task.conversion_type.as_str());
        macros.insert_aliases(REVENUE_ALIASES, &task.revenue);
        macros.insert_aliases(RAW_STATUS_ALIASES, task.conversion_status.as_str());
        macros.insert("currency", task.currency.clone());
        macros.insert("status", status_label(profile, task));
        macros.insert("conversion_id", task.conversion_id.clone());
        macros.insert("advertiser_id", task.advertiser_id.clone());
        macros.insert("antifraud_level", task.antifraud_level.clone());

        let optional = [
            ("partner_id", &task.partner_id),
            ("campaign_id", &task.campaign_id),
            ("offer_id", &task.offer_id),
            ("flow_id", &task.flow_id),
        ];
        for (name, value) in optional {
            macros.insert(name, value.clone().unwrap_or_default());
        }

        macros
    }
}

impl From<HashMap<String, String>> for Macros {
    fn from(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Macros {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Resolve the tracker-facing status label.
///
/// Looks up `status_map[conversion_type][conversion_status]` first. Without
/// an entry, approved conversions get the accepted label for their type and
/// everything else is reported as rejected.
pub fn status_label(profile: &PostbackProfile, task: &PostbackTask) -> String {
    let mapped = profile
        .status_map
        .get(task.conversion_type.as_str())
        .and_then(|by_status| by_status.get(task.conversion_status.as_str()));

    if let Some(label) = mapped {
        return label.clone();
    }

    if task.conversion_status == crate::types::ConversionStatus::Approved {
        match task.conversion_type {
            ConversionType::Registration => ACCEPTED_REGISTRATION.to_string(),
            ConversionType::Purchase => ACCEPTED_PURCHASE.to_string(),
        }
    } else {
        REJECTED.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::build_task;
    use crate::types::ConversionRecord;

    fn macros(pairs: &[(&str, &str)]) -> Macros {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn template_without_tokens_is_identity() {
        let m = macros(&[("click_id", "abc")]);
        for input in ["", "https://t.example/pb", "a } b { c", "{}", "{not a token}"] {
            assert_eq!(render(input, &m), input);
        }
    }

    #[test]
    fn replaces_every_occurrence() {
        let m = macros(&[("subid", "clk1")]);
        assert_eq!(render("{subid}-{subid}-{subid}", &m), "clk1-clk1-clk1");
    }

    #[test]
    fn substituted_values_are_not_expanded_again() {
        let m = macros(&[("a", "{b}"), ("b", "boom")]);
        assert_eq!(render("x={a}", &m), "x={b}");
    }

    #[test]
    fn unknown_tokens_stay_verbatim() {
        let m = macros(&[("a", "1")]);
        assert_eq!(render("{a}&{zzz}", &m), "1&{zzz}");
    }

    #[test]
    fn status_falls_back_per_conversion_type() {
        let profile = PostbackProfile::new("adv", "");
        let approved_reg = build_task(&ConversionRecord::new(
            "c1",
            "adv",
            "clk",
            ConversionType::Registration,
            "approved",
        ));
        let declined_sale = build_task(&ConversionRecord::new(
            "c2",
            "adv",
            "clk",
            ConversionType::Purchase,
            "declined",
        ));
        assert_eq!(status_label(&profile, &approved_reg), "lead");
        assert_eq!(status_label(&profile, &declined_sale), "rejected");
    }

    #[test]
    fn built_in_macros_win_over_custom_params() {
        let profile = PostbackProfile::new("adv", "")
            .with_custom_param("click_id", "spoofed")
            .with_custom_param("source", "affnet");
        let task = build_task(&ConversionRecord::new(
            "c1",
            "adv",
            "clk1",
            ConversionType::Purchase,
            "approved",
        ));
        let m = Macros::for_task(&task, &profile);
        assert_eq!(m.get("click_id"), Some("clk1"));
        assert_eq!(m.get("source"), Some("affnet"));
    }
}
