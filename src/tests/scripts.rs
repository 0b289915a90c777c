use crate::engine::{Engine, EngineError, RunOutcome};
use crate::runtime::error::RuntimeError;
use crate::runtime::value::Value;

fn run(source: &str) -> (RunOutcome, String) {
    let engine = Engine::new();
    let mut out = Vec::new();
    let outcome = engine
        .run_source(source, &mut out)
        .unwrap_or_else(|err| panic!("script failed: {err}\n{source}"));
    (outcome, String::from_utf8(out).expect("utf8 output"))
}

fn run_output(source: &str) -> String {
    run(source).1
}

fn run_error(source: &str) -> EngineError {
    let engine = Engine::new();
    let mut out = Vec::new();
    match engine.run_source(source, &mut out) {
        Ok(_) => panic!("script unexpectedly succeeded:\n{source}"),
        Err(err) => err,
    }
}

fn runtime_error(source: &str) -> RuntimeError {
    match run_error(source) {
        EngineError::Runtime(err) => err,
        other => panic!("expected a runtime error, got {other}"),
    }
}

// ---- the six end-to-end scenarios ----

#[test]
fn swap_through_multiple_assignment() {
    let output = run_output("local a, b = 1, 2 a, b = b, a print(a) print(b)");
    assert_eq!(output, "2\n1\n");
}

#[test]
fn constructor_positional_index_overwrites_explicit_key() {
    let output = run_output(
        "local t = {10, [2]=20, 30} print(t[1]) print(t[2]) print(t[3])",
    );
    assert_eq!(output, "10\n30\nnil\n");
}

#[test]
fn variadic_function_forwards_arguments() {
    let output = run_output(
        "local function f(x, ...) return x, ... end local a, b, c = f(1, 2, 3) print(a, b, c)",
    );
    assert_eq!(output, "1 2 3\n");
}

#[test]
fn goto_escapes_nested_loops() {
    let output = run_output(
        "for i = 1, 3 do for j = 1, 3 do if i == 2 and j == 2 then goto done end end end\n\
         ::done:: print('ok')",
    );
    assert_eq!(output, "ok\n");
}

#[test]
fn concat_accumulates_loop_counter() {
    let output = run_output("local s = '' for i = 1, 3 do s = s .. i end print(s)");
    assert_eq!(output, "123\n");
}

#[test]
fn ensure_value_type_checks_value_and_type() {
    run_output("ensure_value_type(1 + 2.0, 3.0, 'double')");
    run_output("ensure_value_type(1 + 2, 3, 'int')");
    assert!(matches!(
        runtime_error("ensure_value_type(1 + 2, 3, 'double')"),
        RuntimeError::TypeEqualityExpected { .. }
    ));
    assert!(matches!(
        runtime_error("ensure_value_type(1 + 2, 4, 'int')"),
        RuntimeError::ValueEqualityExpected { .. }
    ));
}

// ---- numbers and operators ----

#[test]
fn arithmetic_type_rules() {
    run_output(
        "ensure_value_type(1 + 2, 3, 'int')\n\
         ensure_value_type(2 * 3, 6, 'int')\n\
         ensure_value_type(1 - 2, -1, 'int')\n\
         ensure_value_type(1 + 2.5, 3.5, 'double')\n\
         ensure_value_type(1 / 2, 0.5, 'double')\n\
         ensure_value_type(7 // 2, 3, 'int')\n\
         ensure_value_type(7.0 // 2, 3.0, 'double')\n\
         ensure_value_type(7 % 3, 1, 'int')\n\
         ensure_value_type(2 ^ 10, 1024.0, 'double')",
    );
}

#[test]
fn string_operands_promote_to_double() {
    let output = run_output("print('10' + 1) print(-'4')");
    assert_eq!(output, "11\n-4\n");
    run_output("ensure_value_type('10' + 1, 11.0, 'double')");
}

#[test]
fn concat_renders_numbers() {
    assert_eq!(run_output("print(1 .. 2)"), "12\n");
    assert_eq!(run_output("print('v=' .. 1.5)"), "v=1.5\n");
}

#[test]
fn bitwise_operators() {
    run_output(
        "ensure_value_type(6 & 3, 2, 'int')\n\
         ensure_value_type(6 | 3, 7, 'int')\n\
         ensure_value_type(6 ~ 3, 5, 'int')\n\
         ensure_value_type(1 << 4, 16, 'int')\n\
         ensure_value_type(16 >> 4, 1, 'int')\n\
         ensure_value_type(~0, -1, 'int')\n\
         ensure_value_type(6.0 & 3, 2, 'int')",
    );
}

#[test]
fn comparisons_and_logic() {
    let output = run_output(
        "print(1 < 2) print(2 <= 1) print('10' < 9) print(1 == 1.0) print(1 ~= 2)",
    );
    assert_eq!(output, "true\nfalse\nfalse\ntrue\ntrue\n");
}

#[test]
fn and_or_return_their_operands() {
    let output = run_output(
        "print(nil and 1) print(false and nil) print(1 and 2) print(nil or 'x') print(2 or 'y')",
    );
    assert_eq!(output, "nil\nfalse\n2\nx\n2\n");
}

#[test]
fn length_operator() {
    let output = run_output("print(#'hello') local t = {1, 2, 3} print(#t)");
    assert_eq!(output, "5\n3\n");
}

#[test]
fn not_operator_uses_weak_truth() {
    let output = run_output("print(not nil) print(not 0) print(not false)");
    assert_eq!(output, "true\nfalse\ntrue\n");
}

// ---- tables ----

#[test]
fn table_fields_and_subscripts() {
    let output = run_output(
        "local t = {name = 'n', [true] = 1}\n\
         t.extra = 2 t[3.5] = 'f'\n\
         print(t.name) print(t[true]) print(t.extra) print(t[3.5]) print(t.absent)",
    );
    assert_eq!(output, "n\n1\n2\nf\nnil\n");
}

#[test]
fn assigning_nil_removes_the_mapping() {
    let output = run_output(
        "local t = {1, 2, 3} t[3] = nil print(#t) print(t[3])",
    );
    assert_eq!(output, "2\nnil\n");
}

#[test]
fn positional_nil_consumes_its_index() {
    let output = run_output("local t = {1, nil, 3} print(t[1]) print(t[2]) print(t[3])");
    assert_eq!(output, "1\nnil\n3\n");
}

#[test]
fn constructor_expands_trailing_call() {
    let output = run_output(
        "local function pair() return 10, 20 end\n\
         local t = {pair(), pair()}\n\
         print(t[1]) print(t[2]) print(t[3])",
    );
    assert_eq!(output, "10\n10\n20\n");
}

#[test]
fn tables_are_reference_values() {
    let output = run_output("local a = {} local b = a b.x = 1 print(a.x) print(a == b)");
    assert_eq!(output, "1\ntrue\n");
}

#[test]
fn distinct_tables_are_unequal() {
    assert_eq!(run_output("print({} == {})"), "false\n");
}

#[test]
fn subscript_on_nil_and_non_table_fails() {
    assert!(matches!(runtime_error("local t = nil print(t.x)"), RuntimeError::NilAccess));
    assert!(matches!(
        runtime_error("local s = 'str' print(s.x)"),
        RuntimeError::BadDotAccess { .. }
    ));
}

// ---- scope, locals, globals ----

#[test]
fn inner_block_shadows_then_restores() {
    let output = run_output(
        "local x = 'outer'\n\
         do\n\
           local x = 'inner'\n\
           print(x)\n\
         end\n\
         print(x)",
    );
    assert_eq!(output, "inner\nouter\n");
}

#[test]
fn redeclaration_in_same_block_is_permitted() {
    let output = run_output("local a = 1 local a = a + 1 print(a)");
    assert_eq!(output, "2\n");
}

#[test]
fn globals_are_created_on_assignment() {
    let output = run_output("g = 5 do h = g + 1 end print(g) print(h)");
    assert_eq!(output, "5\n6\n");
}

#[test]
fn unassigned_names_read_nil() {
    assert_eq!(run_output("print(never_set)"), "nil\n");
}

#[test]
fn block_locals_die_with_their_block() {
    let output = run_output("do local hidden = 1 end print(hidden)");
    assert_eq!(output, "nil\n");
}

// ---- control flow ----

#[test]
fn if_elseif_else_chain() {
    let source = "local function pick(n)\n\
                  if n == 1 then return 'one'\n\
                  elseif n == 2 then return 'two'\n\
                  else return 'many' end\n\
                  end\n\
                  print(pick(1)) print(pick(2)) print(pick(9))";
    assert_eq!(run_output(source), "one\ntwo\nmany\n");
}

#[test]
fn while_loop_with_break() {
    let output = run_output(
        "local i = 0 while true do i = i + 1 if i == 4 then break end end print(i)",
    );
    assert_eq!(output, "4\n");
}

#[test]
fn repeat_condition_sees_body_locals() {
    let output = run_output("local n = 0 repeat n = n + 1 local done = n == 3 until done print(n)");
    assert_eq!(output, "3\n");
}

#[test]
fn numeric_for_iteration_sets() {
    assert_eq!(run_output("for i = 1, 0 do print(i) end print('end')"), "end\n");
    assert_eq!(run_output("for i = 0, 5, 2 do print(i) end"), "0\n2\n4\n");
    assert_eq!(
        run_output("for i = 5, 0, -1 do print(i) end"),
        "5\n4\n3\n2\n1\n0\n"
    );
}

#[test]
fn numeric_for_promotes_to_double() {
    assert_eq!(
        run_output("for i = 1, 2, 0.5 do print(i) end"),
        "1\n1.5\n2\n"
    );
    run_output("for i = 1, 1, 1.0 do ensure_value_type(i, 1.0, 'double') end");
}

#[test]
fn numeric_for_body_locals_reset_each_iteration() {
    let output = run_output(
        "for i = 1, 3 do\n\
           print(seen)\n\
           local seen = i\n\
         end",
    );
    assert_eq!(output, "nil\nnil\nnil\n");
}

#[test]
fn numeric_for_bounds_must_be_numeric() {
    assert!(matches!(
        runtime_error("for i = 'a', 3 do end"),
        RuntimeError::BadType { .. }
    ));
}

#[test]
fn generic_for_drives_an_iterator_function() {
    let output = run_output(
        "local function step(limit, current)\n\
           if current < limit then return current + 1 end\n\
         end\n\
         local sum = 0\n\
         for i in step, 3, 0 do sum = sum + i end\n\
         print(sum)",
    );
    assert_eq!(output, "6\n");
}

#[test]
fn generic_for_binds_multiple_names() {
    let output = run_output(
        "local function pairup(limit, current)\n\
           if current < limit then return current + 1, (current + 1) * 10 end\n\
         end\n\
         for i, v in pairup, 2, 0 do print(i, v) end",
    );
    assert_eq!(output, "1 10\n2 20\n");
}

#[test]
fn generic_for_missing_names_fill_nil() {
    let output = run_output(
        "local function once(s, c) if c == nil then return 1 end end\n\
         for a, b in once do print(a, b) end",
    );
    assert_eq!(output, "1 nil\n");
}

#[test]
fn generic_for_requires_a_function() {
    assert!(matches!(
        runtime_error("for x in 42 do end"),
        RuntimeError::ForInBadType { .. }
    ));
}

#[test]
fn backward_goto_forms_a_loop() {
    let output = run_output(
        "local i = 0\n\
         ::top::\n\
         i = i + 1\n\
         if i < 3 then goto top end\n\
         print(i)",
    );
    assert_eq!(output, "3\n");
}

#[test]
fn forward_goto_skips_statements() {
    let output = run_output("goto skip print('not printed') ::skip:: print('after')");
    assert_eq!(output, "after\n");
}

#[test]
fn goto_releases_locals_of_crossed_blocks() {
    let output = run_output(
        "for i = 1, 1 do\n\
           local hidden = 42\n\
           goto done\n\
         end\n\
         ::done::\n\
         print(hidden)",
    );
    assert_eq!(output, "nil\n");
}

#[test]
fn lonely_break_is_a_static_error() {
    assert!(matches!(run_error("break"), EngineError::Analysis(_)));
}

#[test]
fn goto_crossing_a_local_is_a_static_error() {
    assert!(matches!(
        run_error("goto l local x = 1 ::l::"),
        EngineError::Analysis(_)
    ));
}

// ---- functions, closures, calls ----

#[test]
fn recursion_through_local_function() {
    let output = run_output(
        "local function fact(n)\n\
           if n <= 1 then return 1 end\n\
           return n * fact(n - 1)\n\
         end\n\
         print(fact(6))",
    );
    assert_eq!(output, "720\n");
}

#[test]
fn closures_capture_shared_bindings() {
    let output = run_output(
        "local function make()\n\
           local n = 0\n\
           return function() n = n + 1 return n end\n\
         end\n\
         local c = make()\n\
         print(c()) print(c()) print(c())",
    );
    assert_eq!(output, "1\n2\n3\n");
}

#[test]
fn two_closures_share_one_upvalue() {
    let output = run_output(
        "local n = 10\n\
         local function bump() n = n + 1 end\n\
         local function get() return n end\n\
         bump() bump()\n\
         print(get())",
    );
    assert_eq!(output, "12\n");
}

#[test]
fn nested_closures_reach_outer_locals() {
    let output = run_output(
        "local function outer()\n\
           local x = 7\n\
           local function middle()\n\
             local function inner() return x end\n\
             return inner\n\
           end\n\
           return middle()\n\
         end\n\
         print(outer()())",
    );
    assert_eq!(output, "7\n");
}

#[test]
fn missing_arguments_become_nil_and_extras_drop() {
    let output = run_output(
        "local function f(a, b) print(a, b) end\n\
         f(1) f(1, 2, 3)",
    );
    assert_eq!(output, "1 nil\n1 2\n");
}

#[test]
fn varargs_mid_position_contributes_first_value() {
    let output = run_output(
        "local function f(...) return ..., 100 end\n\
         print(f(7, 8))",
    );
    assert_eq!(output, "7 100\n");
}

#[test]
fn empty_varargs_expand_to_nothing() {
    let output = run_output(
        "local function count(...)\n\
           local t = {...}\n\
           return #t\n\
         end\n\
         print(count()) print(count('a', 'b'))",
    );
    assert_eq!(output, "0\n2\n");
}

#[test]
fn function_declaration_through_table_path() {
    let output = run_output(
        "t = {}\n\
         t.inner = {}\n\
         function t.inner.f() return 'dotted' end\n\
         print(t.inner.f())",
    );
    assert_eq!(output, "dotted\n");
}

#[test]
fn method_declaration_binds_self() {
    let output = run_output(
        "local obj = {n = 5}\n\
         function obj:get() return self.n end\n\
         print(obj:get())",
    );
    assert_eq!(output, "5\n");
}

#[test]
fn method_call_prepends_receiver() {
    let output = run_output(
        "local t = {sum = 0}\n\
         t.add = function(self, v) self.sum = self.sum + v return self.sum end\n\
         print(t:add(3)) print(t:add(4))",
    );
    assert_eq!(output, "3\n7\n");
}

#[test]
fn multiple_returns_adjust_in_assignment() {
    let output = run_output(
        "local function three() return 1, 2, 3 end\n\
         local a, b = three()\n\
         local c, d, e, f = three()\n\
         print(a, b) print(c, d, e, f)",
    );
    assert_eq!(output, "1 2\n1 2 3 nil\n");
}

#[test]
fn call_in_middle_of_list_is_truncated() {
    let output = run_output(
        "local function two() return 1, 2 end\n\
         local a, b, c = two(), 'x'\n\
         print(a, b, c)",
    );
    assert_eq!(output, "1 x nil\n");
}

#[test]
fn parentheses_truncate_to_one_value() {
    let output = run_output(
        "local function two() return 1, 2 end\n\
         local a, b = (two())\n\
         print(a, b)",
    );
    assert_eq!(output, "1 nil\n");
}

#[test]
fn calling_a_non_function_fails() {
    assert!(matches!(
        runtime_error("local x = 5 x()"),
        RuntimeError::BadCall { .. }
    ));
}

#[test]
fn chunk_returns_surface_to_the_embedder() {
    let (outcome, _) = run("return 1, 'two', nil");
    assert_eq!(
        outcome.values,
        vec![Value::Int(1), Value::Str("two".into()), Value::Nil]
    );
}

#[test]
fn call_with_string_and_table_sugar() {
    let output = run_output(
        "local function id(v) return v end\n\
         print(id 'str')\n\
         local t = id {5}\n\
         print(t[1])",
    );
    assert_eq!(output, "str\n5\n");
}

// ---- introspection helpers ----

#[test]
fn expect_failure_swallows_type_errors() {
    let output = run_output("expect_failure(1 + {}) print('still running')");
    assert!(output.contains("rightfully triggered a type error"));
    assert!(output.contains("still running"));
}

#[test]
fn expect_failure_rejects_successful_expressions() {
    assert!(matches!(
        runtime_error("expect_failure(1 + 1)"),
        RuntimeError::FailureExpected { .. }
    ));
}

#[test]
fn expect_failure_catches_errors_raised_inside_calls() {
    let output = run_output(
        "local function bad() return 1 + {} end\n\
         expect_failure(bad())\n\
         print('recovered')",
    );
    assert!(output.contains("recovered"));
}

#[test]
fn globals_dump_is_ordered_and_idempotent() {
    let source = "b = 2 a = 1 globals()";
    let first = run_output(source);
    let second = run_output(source);
    assert_eq!(first, second);
    let a = first.find("a: 1").expect("a listed");
    let b = first.find("b: 2").expect("b listed");
    assert!(a < b);
}

#[test]
fn locals_dump_shows_current_block() {
    let output = run_output("local x = 1 locals()");
    assert!(output.contains("Locals (top block):"));
    assert!(output.contains("x: 1"));
}

#[test]
fn memory_dump_reports_heap() {
    let output = run_output("local t = {} memory()");
    assert!(output.contains("Heap: 1 tables"));
}

// ---- storage discipline ----

#[test]
fn heap_is_clean_after_a_run() {
    let (outcome, _) = run(
        "local t = {1, 2, 3}\n\
         local u = {nested = {}}\n\
         u.nested.v = t\n\
         u = nil t = nil",
    );
    drop(outcome.values);
    assert_eq!(outcome.heap.live_tables(), 0);
    assert_eq!(outcome.heap.live_functions(), 0);
    assert!(outcome.heap.allocations() >= 3);
}

#[test]
fn locals_dropped_at_chunk_end_free_their_objects() {
    let (outcome, _) = run("local t = {} local f = function() return t end");
    drop(outcome.values);
    assert_eq!(outcome.heap.live_tables(), 0);
    assert_eq!(outcome.heap.live_functions(), 0);
}

#[test]
fn returned_values_keep_objects_alive() {
    let (outcome, _) = run("local t = {} return t");
    assert_eq!(outcome.heap.live_tables(), 1);
    drop(outcome.values);
    assert_eq!(outcome.heap.live_tables(), 0);
}

#[test]
fn reference_cycles_are_a_documented_leak() {
    let (outcome, _) = run(
        "local a = {}\n\
         local b = {}\n\
         a.next = b\n\
         b.prev = a",
    );
    drop(outcome.values);
    assert_eq!(outcome.heap.live_tables(), 2);
}

#[test]
fn rerunning_a_pure_chunk_is_idempotent() {
    let source = "local x = 1\n\
                  g = x + 1\n\
                  for i = 1, 3 do g = g + i end\n\
                  globals()";
    assert_eq!(run_output(source), run_output(source));
}
