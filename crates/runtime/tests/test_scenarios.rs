//! End-to-end scenarios: source in, stdout out.

use xen_core::VmConfig;
use xen_runtime::{ExecResult, Vm};

fn run(source: &str) -> (ExecResult, String, Option<String>) {
    let mut vm = Vm::new_captured(VmConfig::default());
    let result = vm.interpret(source);
    let output = vm.take_output();
    (result, output, vm.last_error.clone())
}

fn run_ok(source: &str) -> String {
    let (result, output, error) = run(source);
    assert_eq!(result, ExecResult::Ok, "unexpected failure: {:?}", error);
    output
}

#[test]
fn test_recursive_fibonacci() {
    let output = run_ok(
        "fn fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); }\n\
         io.println(fib(10));",
    );
    assert_eq!(output, "55\n");
}

#[test]
fn test_range_iteration_with_mutation() {
    let output = run_ok("var sum = 0; for (var i in 0..5) { sum += i; } io.println(sum);");
    assert_eq!(output, "10\n");
}

#[test]
fn test_array_for_in() {
    let output = run_ok(
        "var xs = [10, 20, 30]; var total = 0;\n\
         for (var x in xs) { total += x; }\n\
         io.println(total);",
    );
    assert_eq!(output, "60\n");
}

#[test]
fn test_class_with_private_field_and_methods() {
    let output = run_ok(
        "class Counter {\n\
           private n = 0;\n\
           fn inc() { this.n = this.n + 1; }\n\
           fn get() => this.n;\n\
         };\n\
         var c = new Counter(); c.inc(); c.inc(); c.inc(); io.println(c.get());",
    );
    assert_eq!(output, "3\n");
}

#[test]
fn test_private_property_access_is_runtime_error() {
    let (result, _, error) = run(
        "class Counter {\n\
           private n = 0;\n\
           fn inc() { this.n = this.n + 1; }\n\
         };\n\
         var c = new Counter(); io.println(c.n);",
    );
    assert_eq!(result, ExecResult::RuntimeError);
    assert!(
        error
            .as_deref()
            .unwrap()
            .contains("cannot access private property 'n'")
    );
}

#[test]
fn test_private_method_access_is_runtime_error() {
    let (result, _, error) = run(
        "class Safe {\n\
           private fn secret() => 1;\n\
         };\n\
         var s = new Safe(); s.secret();",
    );
    assert_eq!(result, ExecResult::RuntimeError);
    assert!(
        error
            .as_deref()
            .unwrap()
            .contains("cannot access private method 'secret'")
    );
}

#[test]
fn test_string_interning_and_equality() {
    let output = run_ok("var a = \"hi\" + \"\"; var b = \"h\" + \"i\"; io.println(a == b);");
    assert_eq!(output, "true\n");
}

#[test]
fn test_include_and_namespace_method() {
    let output = run_ok("include math; io.println(math.sqrt(16));");
    assert_eq!(output, "4\n");
}

#[test]
fn test_array_push_pop_law() {
    let output = run_ok(
        "var arr = [1, 2];\n\
         arr.push(9);\n\
         io.println(arr.pop());\n\
         io.println(arr.len);\n\
         io.println(arr[0]);",
    );
    assert_eq!(output, "9\n2\n1\n");
}

#[test]
fn test_dict_laws() {
    let output = run_ok(
        "var d = { \"a\": 1 };\n\
         d[\"k\"] = 5;\n\
         io.println(d[\"k\"]);\n\
         d.remove(\"k\");\n\
         io.println(d.has(\"k\"));\n\
         io.println(d.len);",
    );
    assert_eq!(output, "5\ntrue\nfalse\n1\n");
}

#[test]
fn test_dict_missing_key_is_null() {
    let output = run_ok("var d = { \"a\": 1 }; io.println(d[\"zzz\"]);");
    assert_eq!(output, "null\n");
}

#[test]
fn test_instance_defaults_and_initializer() {
    let output = run_ok(
        "class Point {\n\
           x = 0;\n\
           y = 0;\n\
           init(x, y) { this.x = x; this.y = y; }\n\
           fn sum() => this.x + this.y;\n\
         };\n\
         var p = new Point(3, 4);\n\
         io.println(p.sum());\n\
         io.println(p.x);",
    );
    assert_eq!(output, "7\n3\n");
}

#[test]
fn test_default_only_class_requires_zero_args() {
    let (result, _, error) = run("class A { x = 1; }; var a = new A(5);");
    assert_eq!(result, ExecResult::RuntimeError);
    assert!(
        error
            .as_deref()
            .unwrap()
            .contains("expected 0 arguments but got 1")
    );
}

#[test]
fn test_string_methods() {
    let output = run_ok(
        "var s = \"  Hello, World  \";\n\
         io.println(s.trim());\n\
         io.println(s.trim().upper());\n\
         io.println(s.trim().substr(0, 5));\n\
         io.println(\"a,b,c\".split(\",\"));\n\
         io.println(\"abc\".len);",
    );
    assert_eq!(
        output,
        "Hello, World\nHELLO, WORLD\nHello\n[ a, b, c ]\n3\n"
    );
}

#[test]
fn test_number_methods() {
    let output = run_ok(
        "var n = 2.7;\n\
         io.println(n.floor());\n\
         io.println(n.ceil());\n\
         io.println(n.round());\n\
         io.println((0 - 4).abs());\n\
         io.println(n.to_string() + \"!\");",
    );
    assert_eq!(output, "2\n3\n3\n4\n2.7!\n");
}

#[test]
fn test_namespace_free_functions_match_methods() {
    let output = run_ok(
        "include string; include array;\n\
         io.println(string.upper(\"abc\"));\n\
         var xs = [3, 1];\n\
         array.push(xs, 2);\n\
         io.println(xs.len);",
    );
    assert_eq!(output, "ABC\n3\n");
}

#[test]
fn test_typeof_and_typeid() {
    let output = run_ok(
        "io.println(typeof(1));\n\
         io.println(typeof(\"s\"));\n\
         io.println(typeof([1]));\n\
         io.println(typeof(null));\n\
         io.println(typeid(1));",
    );
    assert_eq!(output, "number\nstring\narray\nnull\n2\n");
}

#[test]
fn test_type_constructors() {
    let output = run_ok(
        "io.println(Number(\"12\") + 1);\n\
         io.println(String(5) + \"0\");\n\
         io.println(Bool(0));\n\
         var a = Array(3, 7);\n\
         io.println(a);\n\
         var u = UInt8Array(2, 255);\n\
         io.println(u[0] + u[1]);",
    );
    assert_eq!(output, "13\n50\nfalse\n[ 7, 7, 7 ]\n510\n");
}

#[test]
fn test_error_values() {
    let output = run_ok(
        "var e = Error(\"boom\");\n\
         io.println(e.msg);\n\
         io.println(typeof(e));",
    );
    assert_eq!(output, "boom\nerror\n");
}

#[test]
fn test_while_and_c_style_for() {
    let output = run_ok(
        "var n = 0;\n\
         while (n < 3) { n += 1; }\n\
         io.println(n);\n\
         var total = 0;\n\
         for (var i = 0; i < 4; i += 1) { total += i; }\n\
         io.println(total);",
    );
    assert_eq!(output, "3\n6\n");
}

#[test]
fn test_logical_operators_leave_operand() {
    let output = run_ok(
        "io.println(null or \"fallback\");\n\
         io.println(1 and 2);\n\
         io.println(false and 2);",
    );
    assert_eq!(output, "fallback\n2\nfalse\n");
}

#[test]
fn test_postfix_increment_value() {
    let output = run_ok(
        "var i = 5;\n\
         io.println(i++);\n\
         io.println(i);\n\
         io.println(i--);\n\
         io.println(i);",
    );
    assert_eq!(output, "5\n6\n6\n5\n");
}

#[test]
fn test_mod_and_divide() {
    let output = run_ok("io.println(7 % 3); io.println(7 / 2);");
    assert_eq!(output, "1\n3.5\n");
}

#[test]
fn test_string_concat_number_error() {
    let (result, _, error) = run("\"a\" + 1;");
    assert_eq!(result, ExecResult::RuntimeError);
    assert_eq!(error.as_deref(), Some("operands must be of matching types"));
}

#[test]
fn test_nested_functions_without_capture() {
    // Nested declarations are ordinary locals of the enclosing function;
    // they do not capture enclosing locals.
    let output = run_ok(
        "fn outer() {\n\
           fn inner(n) => n + 1;\n\
           return inner(1);\n\
         }\n\
         io.println(outer());",
    );
    assert_eq!(output, "2\n");
}

#[test]
fn test_file_include_compiles_inline() {
    use std::io::Write;
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("lib.xen");
    writeln!(
        std::fs::File::create(&lib).unwrap(),
        "fn helper(n) => n * 2;"
    )
    .unwrap();

    let mut vm = Vm::new_captured(VmConfig::default());
    vm.ctx.base_dir = dir.path().to_path_buf();
    let result = vm.interpret("include \"lib.xen\";\nio.println(helper(21));");
    assert_eq!(result, ExecResult::Ok);
    assert_eq!(vm.take_output(), "42\n");
}

#[test]
fn test_os_namespace_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let source = format!(
        "include os;\n\
         os.writetxt(\"{p}\", \"line1\\nline2\");\n\
         io.println(os.exists(\"{p}\"));\n\
         io.println(os.readlines(\"{p}\").len);\n\
         io.println(os.readtxt(\"{p}\"));",
        p = path.display()
    );
    let output = run_ok(&source);
    assert_eq!(output, "true\n2\nline1\nline2\n");
}

#[test]
fn test_os_sleep_returns_duration() {
    let output = run_ok("include os; io.println(os.sleep(0));");
    assert_eq!(output, "0\n");
}

#[test]
fn test_globals_persist_across_units_like_a_repl() {
    let mut vm = Vm::new_captured(VmConfig::default());
    assert_eq!(vm.interpret("var count = 1;"), ExecResult::Ok);
    assert_eq!(vm.interpret("count += 1;"), ExecResult::Ok);
    assert_eq!(vm.interpret("io.println(count);"), ExecResult::Ok);
    assert_eq!(vm.take_output(), "2\n");
}

#[test]
fn test_runtime_error_reports_line_and_recovers() {
    let mut vm = Vm::new_captured(VmConfig::default());
    let result = vm.interpret("var a = 1;\nmissing_fn();");
    assert_eq!(result, ExecResult::RuntimeError);
    assert!(
        vm.last_error
            .as_deref()
            .unwrap()
            .contains("undefined variable 'missing_fn'")
    );
    // Globals from before the error survive, and the VM keeps working.
    assert_eq!(vm.interpret("io.println(a);"), ExecResult::Ok);
    assert_eq!(vm.take_output(), "1\n");
}

#[test]
fn test_equality_semantics() {
    let output = run_ok(
        "io.println([1, 2] == [1, 2]);\n\
         io.println([1] == [1, 2]);\n\
         io.println({ \"a\": 1 } == { \"a\": 1 });\n\
         io.println(null == null);\n\
         io.println(1 == \"1\");",
    );
    assert_eq!(output, "true\nfalse\ntrue\ntrue\nfalse\n");
}

#[test]
fn test_math_namespace() {
    let output = run_ok(
        "include math;\n\
         io.println(math.pow(2, 10));\n\
         io.println(math.min(3, 1, 2));\n\
         io.println(math.max(3, 1, 2));\n\
         io.println(math.floor(2.9));",
    );
    assert_eq!(output, "1024\n1\n3\n2\n");
}

#[test]
fn test_unknown_namespace_include_is_runtime_error() {
    let (result, _, error) = run("include nosuch;");
    assert_eq!(result, ExecResult::RuntimeError);
    assert!(error.as_deref().unwrap().contains("unknown namespace 'nosuch'"));
}
