use serde::Serialize;
use url::Url;

use crate::error::FailureReason;
use crate::signing::sign_postback;
use crate::template::{self, Macros};
use crate::types::{AuthInjection, HttpMethod, PostbackProfile, PostbackTask, SignatureConfig};

/// A fully rendered postback, ready to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreparedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
}

/// Inputs for [`assemble`], borrowed from a profile or an operator request.
pub struct RequestParts<'a> {
    pub method: HttpMethod,
    pub url_template: &'a str,
    pub body_template: Option<&'a str>,
    pub signature: &'a SignatureConfig,
    pub auth: Option<&'a AuthInjection>,
}

/// Render the postback for `task` under `profile`.
pub fn build_request(
    profile: &PostbackProfile,
    task: &PostbackTask,
) -> Result<PreparedRequest, FailureReason> {
    let macros = Macros::for_task(task, profile);
    assemble(
        &RequestParts {
            method: profile.method,
            url_template: &profile.url_template,
            body_template: profile.body_template.as_deref(),
            signature: &profile.signature,
            auth: profile.auth.as_ref(),
        },
        &macros,
    )
}

/// Substitute macros, then attach signature and auth.
///
/// Auth parameters are appended after substitution so a macro value can
/// never replace them.
pub fn assemble(parts: &RequestParts<'_>, macros: &Macros) -> Result<PreparedRequest, FailureReason> {
    let rendered = template::render(parts.url_template, macros);
    let mut url = Url::parse(&rendered)
        .map_err(|e| FailureReason::InvalidRequest(format!("{rendered}: {e}")))?;
    let mut headers = Vec::new();

    if let Some(signature) = sign_postback(parts.signature, macros) {
        url.query_pairs_mut()
            .append_pair(&signature.param.0, &signature.param.1);
        headers.push(signature.header);
    }

    match parts.auth {
        Some(AuthInjection::Query { key, value }) => {
            url.query_pairs_mut().append_pair(key, value);
        }
        Some(AuthInjection::Header { name, value }) => {
            headers.push((name.clone(), value.clone()));
        }
        None => {}
    }

    let body = match parts.method {
        HttpMethod::Get => None,
        HttpMethod::Post => {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
            Some(match parts.body_template {
                Some(body_template) => template::render(body_template, macros),
                None => default_body(macros),
            })
        }
    };

    Ok(PreparedRequest {
        method: parts.method,
        url: url.into(),
        body,
        headers,
    })
}

fn default_body(macros: &Macros) -> String {
    let field = |name: &str| macros.get(name).unwrap_or_default().to_string();
    serde_json::json!({
        "click_id": field("click_id"),
        "conversion_type": field("conversion_type"),
        "external_tx_id": field("external_tx_id"),
        "revenue": field("revenue"),
        "currency": field("currency"),
        "conversion_status": field("status"),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::build_task;
    use crate::types::{ConversionRecord, ConversionType};

    fn task() -> PostbackTask {
        build_task(
            &ConversionRecord::new("c1", "adv", "clk1", ConversionType::Purchase, "approved")
                .with_external_tx_id("tx1")
                .with_revenue("10.00", "USD"),
        )
    }

    #[test]
    fn builds_url_with_mapped_status() {
        let profile = PostbackProfile::new(
            "adv",
            "https://tracker.example/pb?subid={subid}&status={status}&payout={revenue}&tx={txid}",
        )
        .with_status_label(ConversionType::Purchase, "approved", "sale");

        let request = build_request(&profile, &task()).unwrap();
        assert!(request.url.contains("status=sale"));
        assert!(request.url.contains("subid=clk1"));
        assert!(request.url.contains("payout=10.00"));
        assert!(request.url.contains("tx=tx1"));
        assert!(request.body.is_none());
    }

    #[test]
    fn auth_is_appended_after_substitution() {
        let profile = PostbackProfile::new("adv", "https://tracker.example/pb?key={api_key}")
            .with_custom_param("api_key", "from-macro")
            .with_auth(AuthInjection::Query {
                key: "token".to_string(),
                value: "real".to_string(),
            });
        let request = build_request(&profile, &task()).unwrap();
        assert!(request.url.ends_with("key=from-macro&token=real"));
    }

    #[test]
    fn signature_goes_to_query_and_header() {
        let profile = PostbackProfile::new("adv", "https://tracker.example/pb?c={click_id}")
            .with_signature("secret", "{click_id}{txid}")
            .with_signature_param("sig");
        let request = build_request(&profile, &task()).unwrap();
        let expected = crate::signing::compute_signature(b"secret", b"clk1tx1");
        assert!(request.url.contains(&format!("sig={expected}")));
        assert!(request
            .headers
            .contains(&("X-Postback-Signature".to_string(), expected)));
    }

    #[test]
    fn post_uses_default_json_body() {
        let profile = PostbackProfile::new("adv", "https://tracker.example/pb")
            .with_method(HttpMethod::Post);
        let request = build_request(&profile, &task()).unwrap();
        let body: serde_json::Value = serde_json::from_str(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["click_id"], "clk1");
        assert_eq!(body["conversion_status"], "sale");
        assert_eq!(body["revenue"], "10.00");
    }

    #[test]
    fn unparsable_url_is_an_invalid_request() {
        let profile = PostbackProfile::new("adv", "{click_id}/not-a-url");
        let err = build_request(&profile, &task()).unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }
}
