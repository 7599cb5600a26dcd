//! Property-based tests for the tool-call parser

use super::*;
use proptest::prelude::*;
use std::collections::HashMap;

fn render_block(name: &str, args: &HashMap<String, String>) -> String {
    let mut body = format!("tool_name:「始」{name}「末」");
    for (k, v) in args {
        body.push_str(&format!(",\n{k}:「始」{v}「末」"));
    }
    format!("<<<[TOOL_REQUEST]>>>{body}<<<[END_TOOL_REQUEST]>>>")
}

/// Argument names: identifiers that are not reserved fields.
fn arb_arg_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,8}".prop_filter("reserved", |s| {
        s != FIELD_TOOL_NAME && s != FIELD_ARCHERY
    })
}

/// Argument values: arbitrary printable text that cannot collide with the
/// value delimiters, with no leading/trailing whitespace (values are
/// trimmed on parse).
fn arb_arg_value() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ./:_-]{1,30}".prop_map(|s| s.trim().to_string())
        .prop_filter("non-empty after trim", |s| !s.is_empty())
}

fn arb_args() -> impl Strategy<Value = HashMap<String, String>> {
    proptest::collection::hash_map(arb_arg_name(), arb_arg_value(), 0..5)
}

proptest! {
    /// Concatenating k well-formed blocks yields exactly k invocations,
    /// names in order, argument maps equal as key→value sets.
    #[test]
    fn roundtrip_k_blocks(
        blocks in proptest::collection::vec(("[A-Za-z][A-Za-z0-9_]{0,10}", arb_args()), 1..6),
        filler in "[a-z \n]{0,20}",
    ) {
        let parser = ToolCallParser::with_defaults();
        let mut text = String::new();
        for (name, args) in &blocks {
            text.push_str(&filler);
            text.push_str(&render_block(name, args));
        }
        let invocations = parser.parse(&text);
        prop_assert_eq!(invocations.len(), blocks.len());
        for (invocation, (name, args)) in invocations.iter().zip(&blocks) {
            prop_assert_eq!(&invocation.name, name);
            prop_assert_eq!(&invocation.args, args);
            prop_assert!(!invocation.fire_and_forget);
        }
    }

    /// The parser never panics, whatever the input.
    #[test]
    fn parse_never_panics(text in ".{0,500}") {
        let parser = ToolCallParser::with_defaults();
        let _ = parser.parse(&text);
        let _ = parser.has_invocations(&text);
    }
}
