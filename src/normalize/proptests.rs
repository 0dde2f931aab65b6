//! Property-based tests for the normalizer

use super::*;
use proptest::prelude::*;

fn arb_fragment() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z0-9 ,.]{1,20}".prop_map(String::from),
        Just("\n".to_string()),
        Just("\n\n\n".to_string()),
        Just("\r\n".to_string()),
        Just("   ".to_string()),
        Just("Copilot said: ".to_string()),
        Just("Edit in a page".to_string()),
        Just("&amp;".to_string()),
        Just("&amp;amp;".to_string()),
        Just("&lt;".to_string()),
        Just("&#39;".to_string()),
        Just("&".to_string()),
        Just(";".to_string()),
        Just("[1]".to_string()),
        Just(" [2, 3]".to_string()),
        Just("[_{{{CITATION{{{_4{](https://example.com)".to_string()),
        Just("【1†source】".to_string()),
        Just("\n#  ".to_string()),
        Just("\n##".to_string()),
        Just("\n-   ".to_string()),
        Just("\n1.  ".to_string()),
        Just("\n```\n".to_string()),
        Just("`".to_string()),
    ]
}

fn arb_response() -> impl Strategy<Value = String> {
    prop::collection::vec(arb_fragment(), 0..24).prop_map(|parts| parts.concat())
}

/// Prose without anything Markdown would read as code
fn arb_prose() -> impl Strategy<Value = String> {
    let fragment = prop_oneof![
        "[a-zA-Z0-9,.]{1,20}".prop_map(String::from),
        Just(" ".to_string()),
        Just("\n".to_string()),
        Just("&amp;".to_string()),
        Just("[1]".to_string()),
        Just("[_{{{CITATION{{{_4{](https://example.com)".to_string()),
        Just("【1†source】".to_string()),
        Just("\n# ".to_string()),
        Just("\n- ".to_string()),
    ];
    prop::collection::vec(fragment, 0..24).prop_map(|parts| parts.concat())
}

proptest! {
    #[test]
    fn prop_normalize_is_idempotent(raw in arb_response()) {
        let once = normalize(&raw);
        prop_assert_eq!(normalize(&once), once);
    }

    #[test]
    fn prop_no_entity_references_survive(raw in arb_response()) {
        let out = normalize(&raw);
        prop_assert!(!RESIDUAL_ENTITY.is_match(&out), "entity left in {:?}", out);
    }

    #[test]
    fn prop_no_blank_line_runs_or_edge_whitespace(raw in arb_response()) {
        let out = normalize(&raw);
        prop_assert!(!out.contains("\n\n\n"));
        prop_assert!(!out.contains('\r'));
        prop_assert_eq!(out.trim(), out.as_str());
    }

    #[test]
    fn prop_citation_tokens_removed_from_prose(raw in arb_prose()) {
        prop_assume!(!raw.contains("    "));
        let out = normalize(&raw);
        prop_assert!(!out.contains("CITATION"));
        prop_assert!(!out.contains('【'));
    }
}
