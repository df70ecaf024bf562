use std::collections::BTreeMap;
use std::time::Duration;

use leaklint::AnalysisEngine;
use leaklint::analysis::{AnalysisOptions, CancelToken};
use leaklint::ast::{ProgramAst, Stmt};
use leaklint::create_default_engine;
use leaklint::error::format_error_chain;
use leaklint::findings::{Confidence, LeakKind, SkipReason};
use leaklint::resource::{ResourceKindSpec, ResourceTable};

mod support;
use support::*;

// ----------------------------------------------------------------------------
// Straight-line and guarded paths
// ----------------------------------------------------------------------------

/// int do_work() {
///     int *p = malloc(8);
///     if (p == null) { return 1; }
///     *p = 42;
///     return 0;
/// }
#[test]
fn guarded_allocation_leaks_only_on_the_normal_exit() {
    let engine = create_default_engine();
    let f = func(
        "do_work",
        vec![
            malloc_into("p", 2),
            if_stmt(eq_null("p", 3), vec![ret(Some(int(1, 3)), 3)], vec![], 3),
            deref_assign("p", int(42, 4), 4),
            ret(Some(int(0, 5)), 5),
        ],
    );

    let findings = engine
        .analyze_function(&f, &CancelToken::new())
        .expect("analysis should complete");

    assert_eq!(findings.len(), 1);
    let finding = &findings[0];
    assert_eq!(finding.leak, LeakKind::EndOfFunction);
    assert_eq!(finding.confidence, Confidence::Definite);
    assert_eq!(finding.pos, pos(2));
    assert_eq!(finding.callee, "malloc");
    assert_eq!(finding.owner.as_deref(), Some("p"));
    assert_eq!(
        finding.witnesses.len(),
        1,
        "the null-guarded early return must not witness the leak"
    );
    let rendered = finding.witnesses[0].to_string();
    assert!(rendered.contains("branch_false"), "got witness {rendered}");
    assert!(rendered.contains("-return->"), "got witness {rendered}");
}

#[test]
fn releasing_before_return_produces_no_findings() {
    let engine = create_default_engine();
    let f = func(
        "do_work",
        vec![
            malloc_into("p", 2),
            if_stmt(eq_null("p", 3), vec![ret(Some(int(1, 3)), 3)], vec![], 3),
            deref_assign("p", int(42, 4), 4),
            free_stmt("p", 5),
            ret(Some(int(0, 6)), 6),
        ],
    );

    let findings = engine
        .analyze_function(&f, &CancelToken::new())
        .expect("analysis should complete");
    assert!(findings.is_empty(), "got {findings:?}");
}

#[test]
fn release_guarded_by_non_null_check_covers_the_whole_function() {
    // malloc failing is the only path that skips the free, and a failed
    // acquisition owes nothing.
    let engine = create_default_engine();
    let f = func(
        "f",
        vec![
            malloc_into("p", 2),
            if_stmt(ne_null("p", 3), vec![free_stmt("p", 4)], vec![], 3),
            ret(None, 6),
        ],
    );

    let findings = engine
        .analyze_function(&f, &CancelToken::new())
        .expect("analysis should complete");
    assert!(findings.is_empty(), "got {findings:?}");
}

#[test]
fn release_on_one_branch_only_is_a_possible_leak() {
    let engine = create_default_engine();
    let f = func(
        "f",
        vec![
            malloc_into("p", 2),
            if_stmt(var("flag", 3), vec![free_stmt("p", 4)], vec![], 3),
            ret(None, 6),
        ],
    );

    let findings = engine
        .analyze_function(&f, &CancelToken::new())
        .expect("analysis should complete");

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].leak, LeakKind::EndOfFunction);
    assert_eq!(findings[0].confidence, Confidence::Possible);
}

#[test]
fn release_on_both_branches_is_clean() {
    let engine = create_default_engine();
    let f = func(
        "f",
        vec![
            malloc_into("p", 2),
            if_stmt(
                var("flag", 3),
                vec![free_stmt("p", 4)],
                vec![free_stmt("p", 6)],
                3,
            ),
            ret(None, 8),
        ],
    );

    let findings = engine
        .analyze_function(&f, &CancelToken::new())
        .expect("analysis should complete");
    assert!(findings.is_empty(), "got {findings:?}");
}

// ----------------------------------------------------------------------------
// Escapes
// ----------------------------------------------------------------------------

#[test]
fn returning_the_resource_is_never_flagged() {
    let engine = create_default_engine();
    let f = func(
        "make_buffer",
        vec![malloc_into("p", 2), ret(Some(var("p", 3)), 3)],
    );

    let findings = engine
        .analyze_function(&f, &CancelToken::new())
        .expect("analysis should complete");
    assert!(findings.is_empty(), "got {findings:?}");
}

#[test]
fn storing_through_a_pointer_escapes_the_resource() {
    let engine = create_default_engine();
    let f = func(
        "stash",
        vec![
            malloc_into("p", 2),
            deref_assign("slot", var("p", 3), 3),
            ret(None, 4),
        ],
    );

    let findings = engine
        .analyze_function(&f, &CancelToken::new())
        .expect("analysis should complete");
    assert!(findings.is_empty(), "got {findings:?}");
}

#[test]
fn transfer_positions_escape_the_argument() {
    let spec = ResourceKindSpec {
        kind_name: "heap".to_string(),
        acquire_callees: vec!["malloc".to_string()],
        release_callees: vec!["free".to_string()],
        transfer_param_positions: BTreeMap::from([("register".to_string(), vec![0])]),
    };
    let table = ResourceTable::from_specs(&[spec]).expect("spec should build");
    let engine = AnalysisEngine::new(table);

    let f = func(
        "f",
        vec![
            malloc_into("p", 2),
            expr_stmt(call("register", vec![var("p", 3)], 3), 3),
            ret(None, 4),
        ],
    );
    let findings = engine
        .analyze_function(&f, &CancelToken::new())
        .expect("analysis should complete");
    assert!(findings.is_empty(), "got {findings:?}");

    // A non-transfer position keeps the obligation.
    let g = func(
        "g",
        vec![
            malloc_into("p", 2),
            expr_stmt(call("register", vec![int(0, 3), var("p", 3)], 3), 3),
            ret(None, 4),
        ],
    );
    let findings = engine
        .analyze_function(&g, &CancelToken::new())
        .expect("analysis should complete");
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].confidence, Confidence::Definite);
}

// ----------------------------------------------------------------------------
// Aliases and reassignment
// ----------------------------------------------------------------------------

#[test]
fn release_through_a_copied_alias_is_clean() {
    let engine = create_default_engine();
    let f = func(
        "f",
        vec![
            malloc_into("p", 2),
            vardec("q", var("p", 3), 3),
            free_stmt("q", 4),
            ret(None, 5),
        ],
    );

    let findings = engine
        .analyze_function(&f, &CancelToken::new())
        .expect("analysis should complete");
    assert!(findings.is_empty(), "got {findings:?}");
}

#[test]
fn overwriting_the_sole_alias_reports_the_reassignment_and_the_new_site() {
    let engine = create_default_engine();
    let f = func(
        "f",
        vec![
            malloc_into("p", 2),
            assign("p", call("malloc", vec![int(8, 3)], 3), 3),
            ret(None, 4),
        ],
    );

    let findings = engine
        .analyze_function(&f, &CancelToken::new())
        .expect("analysis should complete");

    assert_eq!(findings.len(), 2, "got {findings:?}");
    let reassign = findings
        .iter()
        .find(|f| f.leak == LeakKind::Reassignment)
        .expect("first allocation is orphaned");
    assert_eq!(reassign.confidence, Confidence::Definite);
    assert_eq!(reassign.pos, pos(3));
    assert_eq!(reassign.acquired_at, pos(2));

    let end = findings
        .iter()
        .find(|f| f.leak == LeakKind::EndOfFunction)
        .expect("second allocation leaks at exit");
    assert_eq!(end.acquired_at, pos(3));
}

#[test]
fn overwriting_one_of_two_aliases_is_not_a_reassignment_leak() {
    let engine = create_default_engine();
    let f = func(
        "f",
        vec![
            malloc_into("p", 2),
            vardec("q", var("p", 3), 3),
            assign("p", null(4), 4),
            free_stmt("q", 5),
            ret(None, 6),
        ],
    );

    let findings = engine
        .analyze_function(&f, &CancelToken::new())
        .expect("analysis should complete");
    assert!(findings.is_empty(), "got {findings:?}");
}

// ----------------------------------------------------------------------------
// Loops
// ----------------------------------------------------------------------------

#[test]
fn allocation_in_a_loop_with_conditional_release_is_possible() {
    let engine = create_default_engine();
    let f = func(
        "f",
        vec![
            while_stmt(
                lt(var("i", 2), int(10, 2), 2),
                vec![
                    malloc_into("p", 3),
                    if_stmt(var("flag", 4), vec![free_stmt("p", 5)], vec![], 4),
                ],
                2,
            ),
            ret(None, 8),
        ],
    );

    let findings = engine
        .analyze_function(&f, &CancelToken::new())
        .expect("analysis should complete");

    assert_eq!(findings.len(), 1, "got {findings:?}");
    assert_eq!(findings[0].leak, LeakKind::EndOfFunction);
    assert_eq!(findings[0].confidence, Confidence::Possible);
    assert_eq!(findings[0].acquired_at, pos(3));
}

#[test]
fn allocation_always_released_inside_the_loop_is_clean() {
    let engine = create_default_engine();
    let f = func(
        "f",
        vec![
            while_stmt(
                lt(var("i", 2), int(10, 2), 2),
                vec![malloc_into("p", 3), free_stmt("p", 4)],
                2,
            ),
            ret(None, 6),
        ],
    );

    let findings = engine
        .analyze_function(&f, &CancelToken::new())
        .expect("analysis should complete");
    assert!(findings.is_empty(), "got {findings:?}");
}

// ----------------------------------------------------------------------------
// Resource kinds
// ----------------------------------------------------------------------------

fn heap_and_file_table() -> ResourceTable {
    let heap = ResourceKindSpec {
        kind_name: "heap".to_string(),
        acquire_callees: vec!["malloc".to_string()],
        release_callees: vec!["free".to_string()],
        transfer_param_positions: BTreeMap::new(),
    };
    let file = ResourceKindSpec {
        kind_name: "file".to_string(),
        acquire_callees: vec!["fopen".to_string()],
        release_callees: vec!["fclose".to_string()],
        transfer_param_positions: BTreeMap::new(),
    };
    ResourceTable::from_specs(&[heap, file]).expect("kinds should build")
}

#[test]
fn a_release_of_the_wrong_kind_does_not_satisfy_the_obligation() {
    let engine = AnalysisEngine::new(heap_and_file_table());
    let f = func(
        "f",
        vec![
            malloc_into("p", 2),
            expr_stmt(call("fclose", vec![var("p", 3)], 3), 3),
            ret(None, 4),
        ],
    );

    let findings = engine
        .analyze_function(&f, &CancelToken::new())
        .expect("analysis should complete");

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].resource_kind, "heap");
    assert_eq!(findings[0].confidence, Confidence::Definite);
}

#[test]
fn kinds_are_tracked_independently() {
    let engine = AnalysisEngine::new(heap_and_file_table());
    let f = func(
        "f",
        vec![
            vardec("fp", call("fopen", vec![], 2), 2),
            malloc_into("p", 3),
            free_stmt("p", 4),
            ret(None, 5),
        ],
    );

    let findings = engine
        .analyze_function(&f, &CancelToken::new())
        .expect("analysis should complete");

    assert_eq!(findings.len(), 1, "got {findings:?}");
    assert_eq!(findings[0].resource_kind, "file");
    assert_eq!(findings[0].callee, "fopen");
}

// ----------------------------------------------------------------------------
// Whole-program behavior
// ----------------------------------------------------------------------------

#[test]
fn a_malformed_function_is_skipped_without_poisoning_the_rest() {
    let engine = create_default_engine();
    let program = ProgramAst {
        functions: vec![
            func("bad", vec![Stmt::Break { pos: pos(2) }]),
            func("good", vec![malloc_into("p", 2), ret(None, 3)]),
        ],
    };

    let report = engine.analyze_program(&program, &CancelToken::new());

    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].function, "good");

    assert_eq!(report.diagnostics.len(), 1);
    let diagnostic = &report.diagnostics[0];
    assert_eq!(diagnostic.function, "bad");
    match &diagnostic.reason {
        SkipReason::MalformedControlFlow { detail } => {
            assert!(detail.contains("break"), "got {detail}");
        }
        other => panic!("expected malformed control flow, got {other:?}"),
    }
}

#[test]
fn analysis_is_idempotent_across_runs() {
    let engine = create_default_engine();
    let program = ProgramAst {
        functions: vec![
            func(
                "leaky",
                vec![
                    malloc_into("p", 2),
                    if_stmt(var("flag", 3), vec![free_stmt("p", 4)], vec![], 3),
                    ret(None, 5),
                ],
            ),
            func("clean", vec![malloc_into("q", 2), free_stmt("q", 3)]),
        ],
    };

    let first = engine.analyze_program(&program, &CancelToken::new());
    let second = engine.analyze_program(&program, &CancelToken::new());

    assert_eq!(first.findings, second.findings);
    assert_eq!(first.diagnostics, second.diagnostics);
}

#[test]
fn an_expired_deadline_becomes_a_timeout_diagnostic() {
    let engine = AnalysisEngine::new_with_options(
        ResourceTable::heap_defaults(),
        AnalysisOptions {
            timeout: Some(Duration::ZERO),
            ..AnalysisOptions::default()
        },
    );
    let program = ProgramAst {
        functions: vec![func("f", vec![malloc_into("p", 2)])],
    };

    let report = engine.analyze_program(&program, &CancelToken::new());

    assert!(report.findings.is_empty());
    assert_eq!(report.diagnostics.len(), 1);
    assert!(matches!(
        report.diagnostics[0].reason,
        SkipReason::Timeout { .. }
    ));
}

#[test]
fn the_iteration_cap_becomes_a_timeout_diagnostic() {
    let engine = AnalysisEngine::new_with_options(
        ResourceTable::heap_defaults(),
        AnalysisOptions {
            max_fixpoint_iterations: 1,
            ..AnalysisOptions::default()
        },
    );
    // A loop needs more than one sweep to converge.
    let f = func(
        "f",
        vec![
            while_stmt(lt(var("i", 2), int(10, 2), 2), vec![malloc_into("p", 3)], 2),
            ret(None, 5),
        ],
    );

    let err = engine
        .analyze_function(&f, &CancelToken::new())
        .expect_err("one sweep cannot converge a loop");
    assert!(matches!(err, SkipReason::Timeout { iterations: 1 }));
}

#[test]
fn a_cancelled_token_stops_every_function() {
    let engine = create_default_engine();
    let program = ProgramAst {
        functions: vec![
            func("a", vec![malloc_into("p", 2)]),
            func("b", vec![malloc_into("q", 2)]),
        ],
    };
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = engine.analyze_program(&program, &cancel);

    assert!(report.findings.is_empty());
    assert_eq!(report.diagnostics.len(), 2);
    assert!(report
        .diagnostics
        .iter()
        .all(|d| matches!(d.reason, SkipReason::Cancelled { .. })));
}

#[test]
fn json_programs_round_trip_through_the_engine() {
    let engine = create_default_engine();
    let source = r#"
{
  "functions": [
    {
      "name": "leaky",
      "body": [
        {
          "stmt": "vardec",
          "name": "p",
          "init": {
            "expr": "call",
            "callee": "malloc",
            "args": [{ "expr": "int_lit", "value": 8, "pos": { "line": 2, "column": 14 } }],
            "pos": { "line": 2, "column": 7 }
          },
          "pos": { "line": 2, "column": 3 }
        },
        { "stmt": "return", "value": null, "pos": { "line": 3, "column": 3 } }
      ],
      "pos": { "line": 1, "column": 1 }
    }
  ]
}
"#;

    let report = engine.analyze_json(source).expect("json should parse");
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].function, "leaky");
    assert_eq!(report.findings[0].confidence, Confidence::Definite);

    let err = engine
        .analyze_json("{ not json }")
        .expect_err("invalid json must be an input error");
    assert!(format_error_chain(&err).contains("invalid program JSON"));
}
