//! Criterion benchmarks for the hot paths: line diffing, rule evaluation,
//! and frame parsing.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use agentd::checkpoint::{apply_diff, line_diff};
use agentd::lsp::{encode_frame, FrameBuffer};
use agentd::rules::{parse_rule, RuleAction, RuleSet, RuleSource, ToolInvocation};

fn bench_line_diff(c: &mut Criterion) {
    let old: String = (0..500).map(|i| format!("line number {i}\n")).collect();
    let new = old.replace("line number 250", "a changed line");

    c.bench_function("line_diff_500_lines", |b| {
        b.iter(|| line_diff(black_box(&old), black_box(&new)))
    });

    let diff = line_diff(&old, &new);
    c.bench_function("apply_diff_500_lines", |b| {
        b.iter(|| apply_diff(black_box(&old), black_box(&diff)))
    });
}

fn bench_rule_evaluation(c: &mut Criterion) {
    let rules: Vec<_> = [
        ("Bash(npm install:*)", RuleAction::Deny),
        ("Bash(npm:*)", RuleAction::Allow),
        ("Read(src/**/*.rs)", RuleAction::Allow),
        ("Write(/etc/**)", RuleAction::Deny),
        ("Edit(*.{ts,tsx})", RuleAction::Allow),
    ]
    .into_iter()
    .map(|(s, action)| parse_rule(s, action, RuleSource::Settings).unwrap())
    .collect();
    let set = RuleSet::from_rules(rules);
    let params = json!({ "command": "npm install left-pad" });

    c.bench_function("rule_set_evaluate", |b| {
        b.iter(|| {
            set.evaluate(
                &ToolInvocation { tool: black_box("Bash"), params: &params },
                RuleAction::Allow,
            )
        })
    });

    c.bench_function("rule_parse", |b| {
        b.iter(|| parse_rule(black_box("Bash(npm install:*)"), RuleAction::Deny, RuleSource::Cli))
    });
}

fn bench_framing(c: &mut Criterion) {
    let msg = json!({
        "jsonrpc": "2.0",
        "id": 42,
        "method": "textDocument/completion",
        "params": { "textDocument": { "uri": "file:///w/src/main.rs" },
                    "position": { "line": 10, "character": 4 } }
    });
    let wire = encode_frame(&msg);

    c.bench_function("frame_encode", |b| b.iter(|| encode_frame(black_box(&msg))));
    c.bench_function("frame_decode", |b| {
        b.iter(|| {
            let mut buf = FrameBuffer::new();
            buf.extend(black_box(&wire));
            buf.next_frame().unwrap().unwrap()
        })
    });
}

criterion_group!(benches, bench_line_diff, bench_rule_evaluation, bench_framing);
criterion_main!(benches);
